//! XA resource manager.
//!
//! In XA mode the database driver itself prepared the branch during phase-1;
//! phase-2 issues `XA COMMIT` or `XA ROLLBACK` against that prepared branch.
//! Driver specifics live behind [`XaDriver`]; the in-process driver tracks
//! prepared branches in memory for tests and embedded deployments.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info};

use lodestar_core::model::{BranchTransaction, CommunicationResult};

use crate::dispatch::ResourceHandler;

/// Errors from an XA driver.
#[derive(Debug, Error)]
pub enum XaError {
    #[error("no prepared XA branch for xid={xid} branchId={branch_id}")]
    NotPrepared { xid: String, branch_id: i64 },

    #[error("XA branch xid={xid} branchId={branch_id} was already rolled back")]
    AlreadyRolledBack { xid: String, branch_id: i64 },

    #[error("XA branch xid={xid} branchId={branch_id} was already committed")]
    AlreadyCommitted { xid: String, branch_id: i64 },

    #[error("driver error: {0}")]
    Driver(String),
}

/// The XA verbs phase-2 needs from a driver.
#[async_trait]
pub trait XaDriver: Send + Sync {
    async fn commit(&self, xid: &str, branch_id: i64) -> Result<(), XaError>;

    async fn rollback(&self, xid: &str, branch_id: i64) -> Result<(), XaError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum XaBranchPhase {
    Prepared,
    Committed,
    RolledBack,
}

/// Driver tracking prepared branches in process memory.
#[derive(Default)]
pub struct InProcessXaDriver {
    branches: DashMap<(String, i64), XaBranchPhase>,
}

impl InProcessXaDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a prepared branch, as the driver would at the end of phase-1.
    pub fn prepare(&self, xid: impl Into<String>, branch_id: i64) {
        self.branches.insert((xid.into(), branch_id), XaBranchPhase::Prepared);
    }

    pub fn is_committed(&self, xid: &str, branch_id: i64) -> bool {
        self.branches
            .get(&(xid.to_string(), branch_id))
            .is_some_and(|phase| *phase == XaBranchPhase::Committed)
    }

    pub fn is_rolled_back(&self, xid: &str, branch_id: i64) -> bool {
        self.branches
            .get(&(xid.to_string(), branch_id))
            .is_some_and(|phase| *phase == XaBranchPhase::RolledBack)
    }
}

#[async_trait]
impl XaDriver for InProcessXaDriver {
    async fn commit(&self, xid: &str, branch_id: i64) -> Result<(), XaError> {
        let key = (xid.to_string(), branch_id);
        let Some(mut phase) = self.branches.get_mut(&key) else {
            return Err(XaError::NotPrepared {
                xid: xid.to_string(),
                branch_id,
            });
        };
        match *phase {
            XaBranchPhase::Prepared => {
                *phase = XaBranchPhase::Committed;
                Ok(())
            }
            XaBranchPhase::Committed => Ok(()),
            XaBranchPhase::RolledBack => Err(XaError::AlreadyRolledBack {
                xid: xid.to_string(),
                branch_id,
            }),
        }
    }

    async fn rollback(&self, xid: &str, branch_id: i64) -> Result<(), XaError> {
        let key = (xid.to_string(), branch_id);
        let Some(mut phase) = self.branches.get_mut(&key) else {
            return Err(XaError::NotPrepared {
                xid: xid.to_string(),
                branch_id,
            });
        };
        match *phase {
            XaBranchPhase::Prepared => {
                *phase = XaBranchPhase::RolledBack;
                Ok(())
            }
            XaBranchPhase::RolledBack => Ok(()),
            XaBranchPhase::Committed => Err(XaError::AlreadyCommitted {
                xid: xid.to_string(),
                branch_id,
            }),
        }
    }
}

/// Phase-2 driver for XA branches, routing by resource id.
pub struct XaResourceManager {
    drivers: DashMap<String, Arc<dyn XaDriver>>,
}

impl XaResourceManager {
    pub fn new() -> Self {
        Self {
            drivers: DashMap::new(),
        }
    }

    pub fn register_driver(&self, resource_id: impl Into<String>, driver: Arc<dyn XaDriver>) {
        let resource_id = resource_id.into();
        info!(resource_id, "XA driver registered");
        self.drivers.insert(resource_id, driver);
    }

    fn driver_for(&self, resource_id: &str) -> Option<Arc<dyn XaDriver>> {
        self.drivers.get(resource_id).map(|d| Arc::clone(d.value()))
    }

    fn map_error(err: XaError) -> CommunicationResult {
        match err {
            XaError::NotPrepared { .. } => CommunicationResult::resource_error(err.to_string()),
            XaError::AlreadyRolledBack { .. } | XaError::AlreadyCommitted { .. } => {
                CommunicationResult::failure(err.to_string())
            }
            XaError::Driver(message) => CommunicationResult::retryable_error(message),
        }
    }
}

impl Default for XaResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceHandler for XaResourceManager {
    async fn branch_commit(&self, branch: &BranchTransaction) -> CommunicationResult {
        let Some(driver) = self.driver_for(&branch.resource_id) else {
            return CommunicationResult::resource_error(format!("no XA driver for {}", branch.resource_id));
        };
        match driver.commit(&branch.xid, branch.branch_id).await {
            Ok(()) => {
                info!(xid = %branch.xid, branch_id = branch.branch_id, "XA branch committed");
                CommunicationResult::success()
            }
            Err(err) => {
                debug!(xid = %branch.xid, branch_id = branch.branch_id, %err, "XA commit failed");
                Self::map_error(err)
            }
        }
    }

    async fn branch_rollback(&self, branch: &BranchTransaction) -> CommunicationResult {
        let Some(driver) = self.driver_for(&branch.resource_id) else {
            return CommunicationResult::resource_error(format!("no XA driver for {}", branch.resource_id));
        };
        match driver.rollback(&branch.xid, branch.branch_id).await {
            Ok(()) => {
                info!(xid = %branch.xid, branch_id = branch.branch_id, "XA branch rolled back");
                CommunicationResult::success()
            }
            Err(err) => {
                debug!(xid = %branch.xid, branch_id = branch.branch_id, %err, "XA rollback failed");
                Self::map_error(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestar_core::model::{BranchStatus, BranchType, CommStatus};

    fn branch() -> BranchTransaction {
        BranchTransaction {
            branch_id: 1001,
            xid: "svc:1:1".into(),
            resource_group_id: "default".into(),
            resource_id: "xa:orders-db".into(),
            branch_type: BranchType::Xa,
            lock_key: None,
            status: BranchStatus::PhaseOneDone,
            application_data: None,
            begin_time_ms: 0,
            end_time_ms: None,
            timeout_ms: 30_000,
        }
    }

    fn manager_with_prepared() -> (XaResourceManager, Arc<InProcessXaDriver>) {
        let driver = Arc::new(InProcessXaDriver::new());
        driver.prepare("svc:1:1", 1001);
        let manager = XaResourceManager::new();
        manager.register_driver("xa:orders-db", driver.clone());
        (manager, driver)
    }

    #[tokio::test]
    async fn commit_settles_the_prepared_branch() {
        let (manager, driver) = manager_with_prepared();
        assert!(manager.branch_commit(&branch()).await.is_success());
        assert!(driver.is_committed("svc:1:1", 1001));

        // Idempotent.
        assert!(manager.branch_commit(&branch()).await.is_success());
    }

    #[tokio::test]
    async fn rollback_settles_the_prepared_branch() {
        let (manager, driver) = manager_with_prepared();
        assert!(manager.branch_rollback(&branch()).await.is_success());
        assert!(driver.is_rolled_back("svc:1:1", 1001));
        assert!(manager.branch_rollback(&branch()).await.is_success());
    }

    #[tokio::test]
    async fn commit_after_rollback_fails() {
        let (manager, _) = manager_with_prepared();
        assert!(manager.branch_rollback(&branch()).await.is_success());
        let result = manager.branch_commit(&branch()).await;
        assert_eq!(result.status, CommStatus::Failure);
    }

    #[tokio::test]
    async fn unprepared_branch_is_a_resource_error() {
        let manager = XaResourceManager::new();
        manager.register_driver("xa:orders-db", Arc::new(InProcessXaDriver::new()));
        let result = manager.branch_commit(&branch()).await;
        assert_eq!(result.status, CommStatus::ResourceError);
    }

    #[tokio::test]
    async fn missing_driver_is_a_resource_error() {
        let manager = XaResourceManager::new();
        let result = manager.branch_commit(&branch()).await;
        assert_eq!(result.status, CommStatus::ResourceError);
    }
}
