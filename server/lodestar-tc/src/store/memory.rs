//! In-memory metadata store.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use lodestar_core::model::{now_millis, BranchStatus, BranchTransaction, GlobalStatus, GlobalTransaction};
use lodestar_core::{CoreError, CoreResult};

use super::{GlobalLock, LockOutcome, MetadataStore};

/// DashMap-backed store; the default for tests and single-node runs.
#[derive(Default)]
pub struct MemoryStore {
    globals: DashMap<String, GlobalTransaction>,
    branches: DashMap<i64, BranchTransaction>,
    locks: DashMap<String, GlobalLock>,
    // Serializes multi-row lock attempts so they are all-or-nothing.
    lock_gate: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn put_global(&self, global: &GlobalTransaction) -> CoreResult<()> {
        self.globals.insert(global.xid.clone(), global.clone());
        Ok(())
    }

    async fn global(&self, xid: &str) -> CoreResult<Option<GlobalTransaction>> {
        Ok(self.globals.get(xid).map(|g| g.value().clone()))
    }

    async fn update_global_status(&self, xid: &str, status: GlobalStatus) -> CoreResult<()> {
        match self.globals.get_mut(xid) {
            Some(mut global) => {
                global.status = status;
                Ok(())
            }
            None => Err(CoreError::GlobalNotFound(xid.to_string())),
        }
    }

    async fn remove_global(&self, xid: &str) -> CoreResult<()> {
        self.globals.remove(xid);
        Ok(())
    }

    async fn globals(&self) -> CoreResult<Vec<GlobalTransaction>> {
        Ok(self.globals.iter().map(|g| g.value().clone()).collect())
    }

    async fn put_branch(&self, branch: &BranchTransaction) -> CoreResult<()> {
        self.branches.insert(branch.branch_id, branch.clone());
        Ok(())
    }

    async fn branch(&self, branch_id: i64) -> CoreResult<Option<BranchTransaction>> {
        Ok(self.branches.get(&branch_id).map(|b| b.value().clone()))
    }

    async fn update_branch_status(
        &self,
        branch_id: i64,
        status: BranchStatus,
        end_time_ms: Option<i64>,
    ) -> CoreResult<()> {
        match self.branches.get_mut(&branch_id) {
            Some(mut branch) => {
                branch.status = status;
                if end_time_ms.is_some() {
                    branch.end_time_ms = end_time_ms;
                }
                Ok(())
            }
            None => Err(CoreError::Internal(format!("branch not found: {branch_id}"))),
        }
    }

    async fn branches_of(&self, xid: &str) -> CoreResult<Vec<BranchTransaction>> {
        Ok(self
            .branches
            .iter()
            .filter(|b| b.value().xid == xid)
            .map(|b| b.value().clone())
            .collect())
    }

    async fn all_branches(&self) -> CoreResult<Vec<BranchTransaction>> {
        Ok(self.branches.iter().map(|b| b.value().clone()).collect())
    }

    async fn remove_branches_of(&self, xid: &str) -> CoreResult<()> {
        self.branches.retain(|_, b| b.xid != xid);
        Ok(())
    }

    async fn try_lock_rows(&self, row_keys: &[String], xid: &str, branch_id: i64) -> CoreResult<LockOutcome> {
        let _gate = self.lock_gate.lock();

        for row_key in row_keys {
            if let Some(held) = self.locks.get(row_key) {
                if held.xid != xid {
                    return Ok(LockOutcome::Conflict {
                        row_key: row_key.clone(),
                        holder_xid: held.xid.clone(),
                    });
                }
            }
        }
        let now = now_millis();
        for row_key in row_keys {
            self.locks.entry(row_key.clone()).or_insert_with(|| GlobalLock {
                row_key: row_key.clone(),
                xid: xid.to_string(),
                branch_id,
                acquired_at_ms: now,
            });
        }
        Ok(LockOutcome::Acquired)
    }

    async fn unlock_by_xid(&self, xid: &str) -> CoreResult<()> {
        self.locks.retain(|_, lock| lock.xid != xid);
        Ok(())
    }

    async fn locks_of(&self, xid: &str) -> CoreResult<Vec<GlobalLock>> {
        Ok(self
            .locks
            .iter()
            .filter(|l| l.value().xid == xid)
            .map(|l| l.value().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global(xid: &str) -> GlobalTransaction {
        GlobalTransaction::new(xid.into(), "svc".into(), "test".into(), 60_000)
    }

    #[tokio::test]
    async fn global_crud() {
        let store = MemoryStore::new();
        store.put_global(&global("svc:1:1")).await.unwrap();

        let loaded = store.global("svc:1:1").await.unwrap().unwrap();
        assert_eq!(loaded.status, GlobalStatus::Begin);

        store
            .update_global_status("svc:1:1", GlobalStatus::Committed)
            .await
            .unwrap();
        assert_eq!(
            store.global("svc:1:1").await.unwrap().unwrap().status,
            GlobalStatus::Committed
        );

        store.remove_global("svc:1:1").await.unwrap();
        assert!(store.global("svc:1:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lock_reacquisition_by_same_xid_succeeds() {
        let store = MemoryStore::new();
        let keys = vec!["db:account:1".to_string()];

        assert_eq!(
            store.try_lock_rows(&keys, "xid-a", 1).await.unwrap(),
            LockOutcome::Acquired
        );
        assert_eq!(
            store.try_lock_rows(&keys, "xid-a", 2).await.unwrap(),
            LockOutcome::Acquired
        );

        match store.try_lock_rows(&keys, "xid-b", 3).await.unwrap() {
            LockOutcome::Conflict { row_key, holder_xid } => {
                assert_eq!(row_key, "db:account:1");
                assert_eq!(holder_xid, "xid-a");
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn partial_conflict_acquires_nothing() {
        let store = MemoryStore::new();
        store
            .try_lock_rows(&["db:t:2".to_string()], "xid-a", 1)
            .await
            .unwrap();

        let keys = vec!["db:t:1".to_string(), "db:t:2".to_string()];
        let outcome = store.try_lock_rows(&keys, "xid-b", 2).await.unwrap();
        assert!(matches!(outcome, LockOutcome::Conflict { .. }));
        assert!(store.locks_of("xid-b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unlock_by_xid_releases_all_rows() {
        let store = MemoryStore::new();
        let keys = vec!["db:t:1".to_string(), "db:t:2".to_string()];
        store.try_lock_rows(&keys, "xid-a", 1).await.unwrap();
        assert_eq!(store.locks_of("xid-a").await.unwrap().len(), 2);

        store.unlock_by_xid("xid-a").await.unwrap();
        assert!(store.locks_of("xid-a").await.unwrap().is_empty());

        assert_eq!(
            store.try_lock_rows(&keys, "xid-b", 2).await.unwrap(),
            LockOutcome::Acquired
        );
    }
}
