//! Long-running tick loop.

use std::time::Duration;

use locron_scheduler::Scheduler;
use miette::Result;
use tokio::sync::watch;
use tracing::info;

/// Tick on `interval` until Ctrl-C.
pub async fn run(scheduler: Scheduler, interval: Duration) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    scheduler.run(interval, shutdown_rx).await;
    Ok(())
}
