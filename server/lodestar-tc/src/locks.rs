//! AT-mode global lock acquisition.
//!
//! Row locks serialize AT writes across global transactions. Acquisition is
//! bounded: up to `max_retries` attempts spaced `retry_interval_ms` apart
//! (with jitter), then the registration fails with a lock conflict that the
//! data-source interceptor surfaces to business code as retryable.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use lodestar_core::config::LockConfig;
use lodestar_core::{CoreError, CoreResult};

use crate::store::{LockOutcome, MetadataStore};

/// Bounded lock acquisition over the metadata store.
pub struct LockManager {
    store: Arc<dyn MetadataStore>,
    config: LockConfig,
}

impl LockManager {
    pub fn new(store: Arc<dyn MetadataStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    /// Acquire every row key for `(xid, branch_id)` or fail with
    /// [`CoreError::LockConflict`] after the retry budget is spent.
    pub async fn acquire(&self, row_keys: &[String], xid: &str, branch_id: i64) -> CoreResult<()> {
        if row_keys.is_empty() {
            return Ok(());
        }

        let attempts = self.config.max_retries.max(1);
        let mut last_conflict = String::new();

        for attempt in 1..=attempts {
            match self.store.try_lock_rows(row_keys, xid, branch_id).await? {
                LockOutcome::Acquired => {
                    debug!(xid, branch_id, rows = row_keys.len(), attempt, "global locks acquired");
                    return Ok(());
                }
                LockOutcome::Conflict { row_key, holder_xid } => {
                    debug!(
                        xid,
                        branch_id,
                        row_key = %row_key,
                        holder = %holder_xid,
                        attempt,
                        "lock held by another transaction"
                    );
                    last_conflict = row_key;
                }
            }
            if attempt < attempts {
                sleep(self.jittered_interval()).await;
            }
        }

        warn!(xid, branch_id, row_key = %last_conflict, attempts, "lock acquisition exhausted");
        Err(CoreError::LockConflict { row_key: last_conflict })
    }

    /// Release every lock held by `xid`.
    pub async fn release(&self, xid: &str) -> CoreResult<()> {
        self.store.unlock_by_xid(xid).await
    }

    fn jittered_interval(&self) -> Duration {
        let base = self.config.retry_interval_ms as f64;
        // ±20% jitter
        let jitter = (fastrand::f64() - 0.5) * 0.4 * base;
        Duration::from_millis((base + jitter).max(1.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Instant;

    fn manager(store: Arc<MemoryStore>, max_retries: u32, interval_ms: u64) -> LockManager {
        LockManager::new(
            store,
            LockConfig {
                timeout_ms: 10_000,
                retry_interval_ms: interval_ms,
                max_retries,
            },
        )
    }

    #[tokio::test]
    async fn acquires_free_rows_immediately() {
        let store = Arc::new(MemoryStore::new());
        let locks = manager(store.clone(), 30, 10);

        locks
            .acquire(&["db:account:1".to_string()], "xid-a", 1)
            .await
            .unwrap();
        assert_eq!(store.locks_of("xid-a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_key_set_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let locks = manager(store, 30, 10);
        locks.acquire(&[], "xid-a", 1).await.unwrap();
    }

    #[tokio::test]
    async fn conflict_is_bounded_by_retry_budget() {
        let store = Arc::new(MemoryStore::new());
        let keys = vec!["db:account:1".to_string()];
        store.try_lock_rows(&keys, "xid-a", 1).await.unwrap();

        let locks = manager(store.clone(), 5, 2);
        let start = Instant::now();
        let err = locks.acquire(&keys, "xid-b", 2).await.unwrap_err();
        assert!(matches!(err, CoreError::LockConflict { .. }));
        assert!(err.is_retryable());
        // 4 sleeps of ~2ms between 5 attempts.
        assert!(start.elapsed() >= Duration::from_millis(4));
    }

    #[tokio::test]
    async fn retry_wins_once_the_holder_releases() {
        let store = Arc::new(MemoryStore::new());
        let keys = vec!["db:account:1".to_string()];
        store.try_lock_rows(&keys, "xid-a", 1).await.unwrap();

        let locks = Arc::new(manager(store.clone(), 50, 5));
        let acquirer = {
            let locks = Arc::clone(&locks);
            let keys = keys.clone();
            tokio::spawn(async move { locks.acquire(&keys, "xid-b", 2).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.unlock_by_xid("xid-a").await.unwrap();

        acquirer.await.unwrap().unwrap();
        assert_eq!(store.locks_of("xid-b").await.unwrap().len(), 1);
    }
}
