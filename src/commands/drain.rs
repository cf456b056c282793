use anyhow::Result;

pub async fn run(config_path: Option<String>) -> Result<()> {
    let runtime = super::runtime_from(config_path).await?;
    let active = runtime.orchestrator.active_run_count();
    println!("draining: {active} run(s) in flight");
    runtime.shutdown().await;
    println!("drained");
    Ok(())
}
