pub mod drain;
pub mod reaper;
pub mod stats;

use std::collections::HashMap;

use anyhow::Result;
use paperflow_runtime::{PipelineRuntime, RuntimeConfig};

/// Build a runtime for the admin surface: configured from file when given,
/// in-memory stores, no live providers.
pub async fn runtime_from(config_path: Option<String>) -> Result<PipelineRuntime> {
    let config = match config_path {
        Some(path) => RuntimeConfig::load(&path)?,
        None => RuntimeConfig::default(),
    };
    Ok(PipelineRuntime::new(config, HashMap::new()).await)
}
