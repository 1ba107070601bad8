//! Periodic housekeeping tasks.

use std::time::Duration;

use chrono::Utc;
use idempotency::IdempotencyStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handle to a spawned housekeeping task.
pub struct MaintenanceHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Signals the task to stop and waits for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "maintenance task ended abnormally");
        }
    }
}

/// Deletes idempotency records older than `retention` every `every`.
pub fn spawn_idempotency_purge<S>(store: S, retention: Duration, every: Duration) -> MaintenanceHandle
where
    S: IdempotencyStore + 'static,
{
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::days(3650));

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match store.purge_older_than(Utc::now() - retention).await {
                        Ok(0) => {}
                        Ok(purged) => tracing::info!(purged, "expired idempotency records purged"),
                        Err(e) => tracing::error!(error = %e, "idempotency purge failed"),
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    });

    MaintenanceHandle {
        shutdown: shutdown_tx,
        task,
    }
}
