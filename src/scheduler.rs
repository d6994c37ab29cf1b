use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cleaner::Cleaner;

/// Spawn the background task that owns the reclamation schedule.
pub fn spawn(cleaner: Arc<Cleaner>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move { run(&cleaner, interval, shutdown).await })
}

/// Run one pass now, then one per `interval` until `shutdown` is cancelled.
///
/// Passes never overlap: a slow pass delays the next tick. Cancellation is
/// only observed between passes; a started pass runs to completion.
pub async fn run(cleaner: &Cleaner, interval: Duration, shutdown: CancellationToken) {
    if shutdown.is_cancelled() {
        return;
    }
    run_once(cleaner).await;

    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                info!("Cleaner scheduler stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        info!("Running scheduled cleaner");
        run_once(cleaner).await;
    }
}

async fn run_once(cleaner: &Cleaner) {
    // Pass errors are retried by the next tick; they never stop the loop.
    if let Err(err) = cleaner.run_pass().await {
        error!(error = %err, kind = err.kind(), "Reclamation pass aborted");
        err.report_to_sentry();
    }
}
