//! Metadata storage for the coordinator.
//!
//! Three record kinds back the whole protocol: global transactions, branch
//! transactions, and AT-mode global locks. [`MetadataStore`] is the seam;
//! [`MemoryStore`] serves tests and single-node deployments,
//! [`SqliteStore`] materialises the relational schema.

mod memory;
mod sqlite;

use async_trait::async_trait;

use lodestar_core::model::{BranchStatus, BranchTransaction, GlobalStatus, GlobalTransaction};
use lodestar_core::CoreResult;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// One held row lock.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalLock {
    pub row_key: String,
    pub xid: String,
    pub branch_id: i64,
    pub acquired_at_ms: i64,
}

/// Outcome of one multi-row lock attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum LockOutcome {
    Acquired,
    Conflict { row_key: String, holder_xid: String },
}

/// Expand a branch's `lockKey` into store row keys.
///
/// The wire format is `table:pk1,pk2` with `;` between tables; row keys are
/// prefixed with the resource id so the same table name in two databases
/// never collides.
pub fn parse_lock_keys(resource_id: &str, lock_key: &str) -> Vec<String> {
    let mut keys = Vec::new();
    for table_part in lock_key.split(';') {
        let Some((table, pks)) = table_part.split_once(':') else {
            continue;
        };
        for pk in pks.split(',') {
            let pk = pk.trim();
            if !pk.is_empty() {
                keys.push(format!("{resource_id}:{table}:{pk}"));
            }
        }
    }
    keys
}

/// Durable storage of global/branch records and locks.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn put_global(&self, global: &GlobalTransaction) -> CoreResult<()>;

    async fn global(&self, xid: &str) -> CoreResult<Option<GlobalTransaction>>;

    async fn update_global_status(&self, xid: &str, status: GlobalStatus) -> CoreResult<()>;

    async fn remove_global(&self, xid: &str) -> CoreResult<()>;

    async fn globals(&self) -> CoreResult<Vec<GlobalTransaction>>;

    async fn put_branch(&self, branch: &BranchTransaction) -> CoreResult<()>;

    async fn branch(&self, branch_id: i64) -> CoreResult<Option<BranchTransaction>>;

    async fn update_branch_status(
        &self,
        branch_id: i64,
        status: BranchStatus,
        end_time_ms: Option<i64>,
    ) -> CoreResult<()>;

    async fn branches_of(&self, xid: &str) -> CoreResult<Vec<BranchTransaction>>;

    async fn all_branches(&self) -> CoreResult<Vec<BranchTransaction>>;

    async fn remove_branches_of(&self, xid: &str) -> CoreResult<()>;

    /// Atomically acquire every row key for `(xid, branch_id)`.
    /// Re-acquisition by the same xid succeeds; a row held by another xid
    /// fails the whole attempt without acquiring anything.
    async fn try_lock_rows(&self, row_keys: &[String], xid: &str, branch_id: i64) -> CoreResult<LockOutcome>;

    async fn unlock_by_xid(&self, xid: &str) -> CoreResult<()>;

    async fn locks_of(&self, xid: &str) -> CoreResult<Vec<GlobalLock>>;
}
