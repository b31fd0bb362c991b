//! Background timeout scanner.
//!
//! Ticks every `scan.intervalMs` and delegates to
//! [`TransactionCoordinator::scan_timeouts`]: expired globals are forced
//! into timeout-rollback, expired branches are marked, and terminal records
//! past retention are purged.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::coordinator::TransactionCoordinator;

/// Handle to a running scanner; dropping it does not stop the task, call
/// [`ScannerHandle::shutdown`].
pub struct ScannerHandle {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ScannerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.task.await;
    }
}

/// Periodic timeout scanning over a coordinator.
pub struct TimeoutScanner {
    coordinator: Arc<TransactionCoordinator>,
    interval: Duration,
}

impl TimeoutScanner {
    pub fn new(coordinator: Arc<TransactionCoordinator>, interval: Duration) -> Self {
        Self { coordinator, interval }
    }

    /// Spawn the scanning task.
    pub fn start(self) -> ScannerHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            info!(interval_ms = self.interval.as_millis() as u64, "timeout scanner started");
            let mut ticker = tokio::time::interval(self.interval);
            // interval() fires immediately; skip that first tick
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        debug!("timeout scan tick");
                        if let Err(err) = self.coordinator.scan_timeouts().await {
                            error!(%err, "timeout scan failed");
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("timeout scanner stopped");
                        return;
                    }
                }
            }
        });
        ScannerHandle { shutdown_tx, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, MetadataStore};
    use lodestar_core::config::CoordinatorConfig;
    use lodestar_core::model::{now_millis, GlobalStatus};
    use lodestar_resource::Dispatcher;

    fn coordinator() -> (Arc<TransactionCoordinator>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Arc::new(Dispatcher::new(Default::default()));
        let coordinator = Arc::new(TransactionCoordinator::new(
            store.clone() as Arc<dyn MetadataStore>,
            dispatcher,
            CoordinatorConfig::new(),
        ));
        (coordinator, store)
    }

    #[tokio::test]
    async fn scanner_picks_up_expired_global_on_next_tick() {
        let (coordinator, store) = coordinator();
        let xid = coordinator.begin("svc", "slow", 2_000).await.unwrap();

        let mut global = store.global(&xid).await.unwrap().unwrap();
        global.begin_time_ms = now_millis() - 5_000;
        store.put_global(&global).await.unwrap();

        let handle = TimeoutScanner::new(coordinator.clone(), Duration::from_millis(20)).start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;

        assert_eq!(
            coordinator.global_status(&xid).await.unwrap(),
            GlobalStatus::TimeoutRollbacked
        );
    }

    #[tokio::test]
    async fn shutdown_stops_the_task() {
        let (coordinator, _) = coordinator();
        let handle = TimeoutScanner::new(coordinator, Duration::from_secs(3600)).start();
        // Returns promptly even with a huge interval.
        handle.shutdown().await;
    }
}
