//! Continuous mode: tick until Ctrl-C.

use std::sync::Arc;

use miette::Result;
use tracing::info;
use vesper_scheduler::Scheduler;

pub async fn run(scheduler: Scheduler) -> Result<()> {
    let scheduler = Arc::new(scheduler);
    let handle = Arc::clone(&scheduler).start();

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("failed to listen for shutdown signal: {}", e))?;
    info!("received shutdown signal");

    // Returns once the in-flight tick has finished
    handle.stop().await;
    Ok(())
}
