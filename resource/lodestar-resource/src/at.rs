//! AT-mode phase-2 handler.
//!
//! Commit deletes the branch's undo log; rollback replays it as reverse SQL
//! after the dirty-write check. The underlying work is synchronous rusqlite
//! and runs under `spawn_blocking` so a slow business database never stalls
//! the dispatch executor.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use lodestar_core::model::{BranchStatus, BranchTransaction, CommunicationResult};
use lodestar_datasource::{DataSourceManager, DatasourceError};

use crate::dispatch::ResourceHandler;

/// Phase-2 driver for database (AT) branches.
pub struct AtResourceManager {
    datasources: Arc<DataSourceManager>,
}

impl AtResourceManager {
    pub fn new(datasources: Arc<DataSourceManager>) -> Self {
        Self { datasources }
    }

    pub fn datasources(&self) -> &Arc<DataSourceManager> {
        &self.datasources
    }
}

#[async_trait]
impl ResourceHandler for AtResourceManager {
    async fn branch_commit(&self, branch: &BranchTransaction) -> CommunicationResult {
        let datasources = Arc::clone(&self.datasources);
        let resource_id = branch.resource_id.clone();
        let xid = branch.xid.clone();
        let branch_id = branch.branch_id;

        let outcome = tokio::task::spawn_blocking(move || {
            datasources.commit_branch(&resource_id, &xid, branch_id)
        })
        .await;

        match outcome {
            Ok(Ok(deleted)) => {
                info!(xid = %branch.xid, branch_id, deleted, "AT commit: undo log cleared");
                CommunicationResult::success().with_target(branch.resource_id.clone())
            }
            Ok(Err(DatasourceError::UnknownResource(id))) => {
                CommunicationResult::resource_error(format!("datasource not registered: {id}"))
            }
            Ok(Err(err)) => CommunicationResult::failure(err.to_string()),
            Err(join_err) => CommunicationResult::failure(format!("AT commit task failed: {join_err}")),
        }
    }

    async fn branch_rollback(&self, branch: &BranchTransaction) -> CommunicationResult {
        let datasources = Arc::clone(&self.datasources);
        let resource_id = branch.resource_id.clone();
        let xid = branch.xid.clone();
        let branch_id = branch.branch_id;

        let outcome = tokio::task::spawn_blocking(move || {
            datasources.rollback_branch(&resource_id, &xid, branch_id)
        })
        .await;

        match outcome {
            Ok(Ok(())) => {
                info!(xid = %branch.xid, branch_id, "AT rollback: compensation applied");
                CommunicationResult::success().with_target(branch.resource_id.clone())
            }
            Ok(Err(DatasourceError::NoUndoLog { .. })) => {
                // Phase-1 never finished: there is nothing to undo and the
                // local transaction already rolled itself back.
                if branch.status == BranchStatus::Registered {
                    CommunicationResult::success().with_target(branch.resource_id.clone())
                } else {
                    warn!(
                        xid = %branch.xid,
                        branch_id,
                        status = %branch.status,
                        "undo log missing for a branch that completed phase-1"
                    );
                    CommunicationResult::failure("undo log missing after phase-1 completion")
                }
            }
            Ok(Err(DatasourceError::DirtyWrite { table })) => {
                warn!(xid = %branch.xid, branch_id, table, "dirty write: compensation aborted");
                CommunicationResult::non_retryable_error(format!("dirty write on table {table}"))
            }
            Ok(Err(DatasourceError::UnknownResource(id))) => {
                CommunicationResult::resource_error(format!("datasource not registered: {id}"))
            }
            Ok(Err(err)) => CommunicationResult::failure(err.to_string()),
            Err(join_err) => CommunicationResult::failure(format!("AT rollback task failed: {join_err}")),
        }
    }
}
