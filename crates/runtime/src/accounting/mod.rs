//! Credit and token accounting

pub mod credits;
pub mod tokens;

pub use credits::{CreditCostTable, CreditService};
pub use tokens::{TokenRecorderConfig, TokenUsageRecorder, UsageSnapshot};
