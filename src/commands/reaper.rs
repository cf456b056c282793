use anyhow::Result;

pub async fn run(config_path: Option<String>) -> Result<()> {
    let runtime = super::runtime_from(config_path).await?;
    let reaped = runtime.tasks.run_reaper_sweep().await;
    println!("timed out {reaped} stale task(s)");
    runtime.shutdown().await;
    Ok(())
}
