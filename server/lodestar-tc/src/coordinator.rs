//! The global-transaction state machine and phase-2 driver.
//!
//! All transitions of global and branch records happen here, serialized
//! per xid: operations on one transaction queue behind a keyed mutex while
//! distinct transactions proceed in parallel. Phase-2 fans out across a
//! transaction's branches concurrently, but the global record only flips to
//! a terminal status after every branch outcome has been persisted, and AT
//! row locks are released strictly after that point.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use lodestar_core::config::CoordinatorConfig;
use lodestar_core::model::{
    clamp_timeout_ms, now_millis, BranchIdAllocator, BranchStatus, BranchTransaction, BranchType,
    GlobalStatus, GlobalTransaction, XidGenerator,
};
use lodestar_core::protocol::BranchRegisterRequest;
use lodestar_core::{CoreError, CoreResult};

use lodestar_resource::Dispatcher;

use crate::locks::LockManager;
use crate::store::{parse_lock_keys, MetadataStore};

/// Counters exposed for operator tooling.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorStats {
    pub globals_begun: u64,
    pub globals_committed: u64,
    pub globals_rolled_back: u64,
    pub commit_failures: u64,
    pub rollback_failures: u64,
    pub timeouts_detected: u64,
    pub branches_registered: u64,
    pub lock_conflicts: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriveMode {
    Commit,
    Rollback { timeout: bool },
}

/// The transaction coordinator.
pub struct TransactionCoordinator {
    store: Arc<dyn MetadataStore>,
    dispatcher: Arc<Dispatcher>,
    locks: LockManager,
    config: CoordinatorConfig,
    xids: XidGenerator,
    branch_ids: BranchIdAllocator,
    xid_guards: DashMap<String, Arc<Mutex<()>>>,
    stats: RwLock<CoordinatorStats>,
}

impl TransactionCoordinator {
    pub fn new(store: Arc<dyn MetadataStore>, dispatcher: Arc<Dispatcher>, config: CoordinatorConfig) -> Self {
        let locks = LockManager::new(Arc::clone(&store), config.lock.clone());
        Self {
            store,
            dispatcher,
            locks,
            config,
            xids: XidGenerator::new("tc"),
            branch_ids: BranchIdAllocator::new(),
            xid_guards: DashMap::new(),
            stats: RwLock::new(CoordinatorStats::default()),
        }
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.stats.read().clone()
    }

    fn xid_guard(&self, xid: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.xid_guards
                .entry(xid.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Start a global transaction; returns its xid.
    ///
    /// The caller's timeout is authoritative, clamped into [1s, 300s].
    pub async fn begin(&self, application_id: &str, transaction_name: &str, timeout_ms: i64) -> CoreResult<String> {
        let timeout_ms = clamp_timeout_ms(if timeout_ms <= 0 {
            self.config.transaction.default_timeout_ms
        } else {
            timeout_ms
        });
        let xid = self.xids.next_xid_for(application_id);
        let global = GlobalTransaction::new(
            xid.clone(),
            application_id.to_string(),
            transaction_name.to_string(),
            timeout_ms,
        );
        self.store.put_global(&global).await?;
        self.stats.write().globals_begun += 1;
        info!(xid = %xid, name = transaction_name, timeout_ms, "global transaction started");
        Ok(xid)
    }

    /// Register a participant. AT branches acquire their global row locks
    /// here; a conflict fails the registration.
    pub async fn register_branch(&self, request: BranchRegisterRequest) -> CoreResult<i64> {
        let guard = self.xid_guard(&request.xid);
        let _guard = guard.lock().await;

        let Some(global) = self.store.global(&request.xid).await? else {
            return Err(CoreError::GlobalNotFound(request.xid.clone()));
        };
        if global.status != GlobalStatus::Begin {
            return Err(CoreError::GlobalNotActive {
                xid: request.xid.clone(),
                status: global.status.to_string(),
            });
        }

        let branch_id = self.branch_ids.next_id();

        if request.branch_type == BranchType::At {
            if let Some(lock_key) = &request.lock_key {
                let row_keys = parse_lock_keys(&request.resource_id, lock_key);
                if let Err(err) = self.locks.acquire(&row_keys, &request.xid, branch_id).await {
                    self.stats.write().lock_conflicts += 1;
                    return Err(err);
                }
            }
        }

        let branch = BranchTransaction {
            branch_id,
            xid: request.xid.clone(),
            resource_group_id: request.resource_group_id,
            resource_id: request.resource_id,
            branch_type: request.branch_type,
            lock_key: request.lock_key,
            status: BranchStatus::Registered,
            application_data: request.application_data,
            begin_time_ms: now_millis(),
            end_time_ms: None,
            timeout_ms: self.config.transaction.branch_timeout_ms.clamp(1_000, 300_000),
        };
        self.store.put_branch(&branch).await?;
        self.stats.write().branches_registered += 1;
        info!(xid = %request.xid, branch_id, branch_type = %branch.branch_type, "branch registered");
        Ok(branch_id)
    }

    /// Apply a phase-1 outcome report. Idempotent: only the forward
    /// transitions out of `Registered` are applied, everything else is
    /// discarded.
    pub async fn report_branch_status(&self, branch_id: i64, status: BranchStatus) -> CoreResult<()> {
        let Some(branch) = self.store.branch(branch_id).await? else {
            return Err(CoreError::ResourceNotFound(format!("branch {branch_id}")));
        };
        let forward = branch.status == BranchStatus::Registered
            && matches!(status, BranchStatus::PhaseOneDone | BranchStatus::PhaseOneFailed);
        if forward {
            self.store.update_branch_status(branch_id, status, None).await?;
            debug!(branch_id, status = %status, "phase-1 outcome recorded");
        } else {
            debug!(branch_id, current = %branch.status, reported = %status, "branch report discarded");
        }
        Ok(())
    }

    pub async fn global_commit(&self, xid: &str) -> CoreResult<GlobalStatus> {
        self.drive_phase_two(xid, DriveMode::Commit).await
    }

    pub async fn global_rollback(&self, xid: &str) -> CoreResult<GlobalStatus> {
        self.drive_phase_two(xid, DriveMode::Rollback { timeout: false }).await
    }

    pub async fn global_status(&self, xid: &str) -> CoreResult<GlobalStatus> {
        match self.store.global(xid).await? {
            Some(global) => Ok(global.status),
            None => Err(CoreError::GlobalNotFound(xid.to_string())),
        }
    }

    async fn drive_phase_two(&self, xid: &str, mode: DriveMode) -> CoreResult<GlobalStatus> {
        let guard = self.xid_guard(xid);
        let _guard = guard.lock().await;

        let Some(global) = self.store.global(xid).await? else {
            return Err(CoreError::GlobalNotFound(xid.to_string()));
        };

        // Terminal xids answer idempotently for their own family and reject
        // the opposite operation.
        if global.status.is_terminal() {
            let same_family = match mode {
                DriveMode::Commit => global.status.is_commit_family(),
                DriveMode::Rollback { .. } => global.status.is_rollback_family(),
            };
            return if same_family {
                debug!(xid, status = %global.status, "phase-2 already settled");
                Ok(global.status)
            } else {
                Err(CoreError::GlobalNotActive {
                    xid: xid.to_string(),
                    status: global.status.to_string(),
                })
            };
        }

        let driving_status = match mode {
            DriveMode::Commit => {
                if global.status.is_rollback_family() {
                    return Err(CoreError::GlobalNotActive {
                        xid: xid.to_string(),
                        status: global.status.to_string(),
                    });
                }
                GlobalStatus::Committing
            }
            DriveMode::Rollback { timeout } => {
                if global.status == GlobalStatus::Committing {
                    return Err(CoreError::GlobalNotActive {
                        xid: xid.to_string(),
                        status: global.status.to_string(),
                    });
                }
                if timeout || global.status == GlobalStatus::TimeoutRollbacking {
                    GlobalStatus::TimeoutRollbacking
                } else {
                    GlobalStatus::Rollbacking
                }
            }
        };
        self.store.update_global_status(xid, driving_status).await?;

        let branches = self.store.branches_of(xid).await?;
        let has_at_branch = branches.iter().any(|b| b.branch_type == BranchType::At);
        let eligible: Vec<BranchTransaction> = branches
            .into_iter()
            .filter(|b| b.status.is_phase_two_eligible())
            .collect();

        let committing = matches!(mode, DriveMode::Commit);
        let mut tasks: JoinSet<bool> = JoinSet::new();
        for branch in eligible {
            let store = Arc::clone(&self.store);
            let dispatcher = Arc::clone(&self.dispatcher);
            tasks.spawn(async move {
                drive_branch(store, dispatcher, branch, committing).await
            });
        }

        let mut all_ok = true;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(ok) => all_ok &= ok,
                Err(err) => {
                    error!(xid, %err, "phase-2 branch task panicked");
                    all_ok = false;
                }
            }
        }

        let final_status = match (mode, all_ok) {
            (DriveMode::Commit, true) => GlobalStatus::Committed,
            (DriveMode::Commit, false) => GlobalStatus::CommitFailed,
            (DriveMode::Rollback { .. }, true) => {
                if driving_status == GlobalStatus::TimeoutRollbacking {
                    GlobalStatus::TimeoutRollbacked
                } else {
                    GlobalStatus::Rollbacked
                }
            }
            (DriveMode::Rollback { .. }, false) => GlobalStatus::RollbackFailed,
        };

        // Branch outcomes are persisted before the global flips terminal;
        // locks go strictly after that persistence.
        self.store.update_global_status(xid, final_status).await?;
        if has_at_branch {
            self.locks.release(xid).await?;
        }

        {
            let mut stats = self.stats.write();
            match final_status {
                GlobalStatus::Committed => stats.globals_committed += 1,
                GlobalStatus::Rollbacked | GlobalStatus::TimeoutRollbacked => stats.globals_rolled_back += 1,
                GlobalStatus::CommitFailed => stats.commit_failures += 1,
                GlobalStatus::RollbackFailed => stats.rollback_failures += 1,
                _ => {}
            }
        }

        if all_ok {
            info!(xid, status = %final_status, "global transaction settled");
        } else {
            warn!(xid, status = %final_status, "global transaction settled with failed branches");
        }
        Ok(final_status)
    }

    /// One pass of the timeout scanner: roll back expired globals, mark
    /// expired branches, purge terminal records past retention.
    pub async fn scan_timeouts(&self) -> CoreResult<()> {
        let now = now_millis();

        for global in self.store.globals().await? {
            if !global.status.is_terminal() && global.is_expired(now) {
                warn!(xid = %global.xid, "global transaction timed out, forcing rollback");
                self.stats.write().timeouts_detected += 1;
                if let Err(err) = self.drive_phase_two(&global.xid, DriveMode::Rollback { timeout: true }).await {
                    // Per-xid recovery: a failed rollback is flagged on the
                    // record, never surfaced out of the scanner.
                    error!(xid = %global.xid, %err, "timeout rollback failed");
                }
            }
        }

        for branch in self.store.all_branches().await? {
            let in_phase_one = matches!(branch.status, BranchStatus::Registered | BranchStatus::PhaseOneDone);
            if in_phase_one && branch.is_timed_out(now) {
                warn!(branch_id = branch.branch_id, xid = %branch.xid, "branch timed out");
                self.store
                    .update_branch_status(branch.branch_id, BranchStatus::Timeout, None)
                    .await?;
            }
        }

        let retention = self.config.transaction.finished_retention_ms;
        for global in self.store.globals().await? {
            if global.status.is_terminal() && now - global.begin_time_ms > global.timeout_ms + retention {
                debug!(xid = %global.xid, "purging finished transaction past retention");
                self.store.remove_branches_of(&global.xid).await?;
                self.store.remove_global(&global.xid).await?;
                self.xid_guards.remove(&global.xid);
            }
        }

        Ok(())
    }

    /// Non-terminal transactions older than `older_than`; operator surface.
    pub async fn stalled_globals(&self, older_than: Duration) -> CoreResult<Vec<GlobalTransaction>> {
        let now = now_millis();
        let threshold = older_than.as_millis() as i64;
        Ok(self
            .store
            .globals()
            .await?
            .into_iter()
            .filter(|g| !g.status.is_terminal() && now - g.begin_time_ms > threshold)
            .collect())
    }

    /// Branches stuck in a failed state; operator surface.
    pub async fn failed_branches(&self) -> CoreResult<Vec<BranchTransaction>> {
        Ok(self
            .store
            .all_branches()
            .await?
            .into_iter()
            .filter(|b| b.status.is_failed())
            .collect())
    }
}

/// Drive one branch through phase-2 and persist its outcome. Returns
/// whether the branch settled successfully.
async fn drive_branch(
    store: Arc<dyn MetadataStore>,
    dispatcher: Arc<Dispatcher>,
    branch: BranchTransaction,
    committing: bool,
) -> bool {
    let (driving, ok_status, failed_status) = if committing {
        (
            BranchStatus::PhaseTwoCommitting,
            BranchStatus::PhaseTwoCommitted,
            BranchStatus::PhaseTwoCommitFailed,
        )
    } else {
        (
            BranchStatus::PhaseTwoRollbacking,
            BranchStatus::PhaseTwoRollbacked,
            BranchStatus::PhaseTwoRollbackFailed,
        )
    };

    if let Err(err) = store.update_branch_status(branch.branch_id, driving, None).await {
        error!(branch_id = branch.branch_id, %err, "failed to mark branch driving");
        return false;
    }

    // The dispatched snapshot keeps the pre-drive status; the AT handler
    // needs it to decide the missing-undo-log policy.
    let result = if committing {
        dispatcher.dispatch_commit(&branch).await
    } else {
        dispatcher.dispatch_rollback(&branch).await
    };

    let settled = if result.is_success() { ok_status } else { failed_status };
    if let Err(err) = store
        .update_branch_status(branch.branch_id, settled, Some(now_millis()))
        .await
    {
        error!(branch_id = branch.branch_id, %err, "failed to persist branch outcome");
        return false;
    }

    if !result.is_success() {
        warn!(
            branch_id = branch.branch_id,
            xid = %branch.xid,
            status = ?result.status,
            error = result.error.as_deref().unwrap_or(""),
            "branch failed phase-2"
        );
    }
    result.is_success()
}
