use anyhow::Result;

pub async fn dump(config_path: Option<String>) -> Result<()> {
    let runtime = super::runtime_from(config_path).await?;
    let stats = runtime.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    runtime.shutdown().await;
    Ok(())
}

pub async fn reset(config_path: Option<String>) -> Result<()> {
    let runtime = super::runtime_from(config_path).await?;
    runtime.reset_stats();
    println!("retry counters reset");
    runtime.shutdown().await;
    Ok(())
}
