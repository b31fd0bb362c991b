//! TCC resource registry and phase-2 handler.
//!
//! A TCC resource is a pair of confirm/cancel callbacks registered under a
//! resource id, either explicitly at startup or discovered by naming
//! convention through the application's [`ServiceContainer`]. Callbacks are
//! plain function values; the four supported shapes mirror the method
//! signatures business services actually write.
//!
//! Correctness around reordering is enforced with per-`(xid, branchId)`
//! markers:
//!
//! - confirm after confirm is a no-op, cancel after cancel is a no-op
//! - cancel on a branch that never tried records a cancel-without-try marker
//!   and succeeds (an empty rollback)
//! - a late try that arrives after its cancel is rejected, so a suspended
//!   try can never leak resources ("anti-hanging")

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use lodestar_core::model::{BranchTransaction, CommunicationResult};

use crate::dispatch::ResourceHandler;

/// A confirm or cancel function in one of the supported shapes.
///
/// Callbacks return `Ok(true)` on success, `Ok(false)` for a business-level
/// rejection, and `Err` for an invocation failure.
#[derive(Clone)]
pub enum TccCallback {
    NoArgs(Arc<dyn Fn() -> Result<bool, String> + Send + Sync>),
    Xid(Arc<dyn Fn(&str) -> Result<bool, String> + Send + Sync>),
    XidBranch(Arc<dyn Fn(&str, i64) -> Result<bool, String> + Send + Sync>),
    Branch(Arc<dyn Fn(&BranchTransaction) -> Result<bool, String> + Send + Sync>),
}

impl TccCallback {
    fn invoke(&self, branch: &BranchTransaction) -> Result<bool, String> {
        match self {
            TccCallback::NoArgs(f) => f(),
            TccCallback::Xid(f) => f(&branch.xid),
            TccCallback::XidBranch(f) => f(&branch.xid, branch.branch_id),
            TccCallback::Branch(f) => f(branch),
        }
    }
}

impl std::fmt::Debug for TccCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shape = match self {
            TccCallback::NoArgs(_) => "fn()",
            TccCallback::Xid(_) => "fn(xid)",
            TccCallback::XidBranch(_) => "fn(xid, branchId)",
            TccCallback::Branch(_) => "fn(&BranchTransaction)",
        };
        f.debug_tuple("TccCallback").field(&shape).finish()
    }
}

/// Registration record for one TCC resource.
#[derive(Debug, Clone)]
pub struct TccRegistration {
    pub resource_id: String,
    pub confirm: TccCallback,
    pub cancel: TccCallback,
    pub timeout_ms: i64,
    pub max_retries: u32,
    pub enabled: bool,
}

impl TccRegistration {
    pub fn new(resource_id: impl Into<String>, confirm: TccCallback, cancel: TccCallback) -> Self {
        Self {
            resource_id: resource_id.into(),
            confirm,
            cancel,
            timeout_ms: 30_000,
            max_retries: 5,
            enabled: true,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// A business service that can participate in TCC through the container.
pub trait TccParticipant: Send + Sync {
    fn confirm(&self, xid: &str, branch_id: i64) -> Result<bool, String>;

    fn cancel(&self, xid: &str, branch_id: i64) -> Result<bool, String>;
}

/// The application's service container, as seen by TCC discovery.
///
/// `lookup_by_name` backs convention-based discovery; `tagged_participants`
/// returns services the application explicitly marked as TCC resources.
pub trait ServiceContainer: Send + Sync {
    fn lookup_by_name(&self, name: &str) -> Option<Arc<dyn TccParticipant>>;

    fn tagged_participants(&self) -> Vec<(String, Arc<dyn TccParticipant>)>;
}

/// Per-branch execution markers backing idempotency and anti-suspension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TccMarker {
    Tried,
    Confirmed,
    Cancelled,
    CancelledWithoutTry,
}

/// Outcome of asking the marker store whether a try may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryOutcome {
    /// Fresh branch, try may run.
    Proceed,
    /// Try already ran for this branch.
    AlreadyTried,
    /// Cancel arrived first; the late try must not run.
    RejectedAfterCancel,
}

#[derive(Default)]
struct TccMarkerStore {
    markers: DashMap<(String, i64), HashSet<TccMarker>>,
}

impl TccMarkerStore {
    fn has(&self, xid: &str, branch_id: i64, marker: TccMarker) -> bool {
        self.markers
            .get(&(xid.to_string(), branch_id))
            .is_some_and(|set| set.contains(&marker))
    }

    fn mark(&self, xid: &str, branch_id: i64, marker: TccMarker) {
        self.markers
            .entry((xid.to_string(), branch_id))
            .or_default()
            .insert(marker);
    }
}

/// Registry and phase-2 driver for TCC resources.
pub struct TccResourceManager {
    resources: DashMap<String, Arc<TccRegistration>>,
    markers: TccMarkerStore,
    container: Option<Arc<dyn ServiceContainer>>,
}

impl TccResourceManager {
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            markers: TccMarkerStore::default(),
            container: None,
        }
    }

    /// Attach a service container for discovery.
    pub fn with_container(mut self, container: Arc<dyn ServiceContainer>) -> Self {
        self.container = Some(container);
        self
    }

    /// Explicitly register a TCC resource.
    pub fn register(&self, registration: TccRegistration) {
        info!(
            resource_id = %registration.resource_id,
            enabled = registration.enabled,
            "TCC resource registered"
        );
        self.resources
            .insert(registration.resource_id.clone(), Arc::new(registration));
    }

    pub fn deregister(&self, resource_id: &str) {
        self.resources.remove(resource_id);
        info!(resource_id, "TCC resource removed");
    }

    pub fn resource_ids(&self) -> Vec<String> {
        self.resources.iter().map(|e| e.key().clone()).collect()
    }

    /// Register every tagged participant found in the container.
    pub fn scan_container(&self) {
        let Some(container) = &self.container else {
            return;
        };
        for (resource_id, participant) in container.tagged_participants() {
            self.register(participant_registration(&resource_id, participant));
        }
    }

    /// Find a resource: cache first, then naming conventions against the
    /// container (`<name>Service`, `<name>ServiceImpl`, `<name>`).
    fn locate(&self, resource_id: &str) -> Option<Arc<TccRegistration>> {
        if let Some(found) = self.resources.get(resource_id) {
            return Some(Arc::clone(found.value()));
        }
        let container = self.container.as_ref()?;

        let bare = resource_id.strip_prefix("tcc:").unwrap_or(resource_id);
        let candidates = [format!("{bare}Service"), format!("{bare}ServiceImpl"), bare.to_string()];
        for name in candidates {
            if let Some(participant) = container.lookup_by_name(&name) {
                debug!(resource_id, service = %name, "TCC resource discovered by convention");
                let registration = Arc::new(participant_registration(resource_id, participant));
                self.resources.insert(resource_id.to_string(), Arc::clone(&registration));
                return Some(registration);
            }
        }
        None
    }

    /// Record the Try phase for a branch, honoring anti-suspension.
    ///
    /// The business Try runs only when this returns [`TryOutcome::Proceed`].
    pub fn begin_try(&self, xid: &str, branch_id: i64) -> TryOutcome {
        if self.markers.has(xid, branch_id, TccMarker::CancelledWithoutTry) {
            warn!(xid, branch_id, "late try rejected after cancel");
            return TryOutcome::RejectedAfterCancel;
        }
        if self.markers.has(xid, branch_id, TccMarker::Tried) {
            return TryOutcome::AlreadyTried;
        }
        self.markers.mark(xid, branch_id, TccMarker::Tried);
        TryOutcome::Proceed
    }

    /// Confirm a branch. Idempotent.
    pub fn confirm(&self, branch: &BranchTransaction) -> CommunicationResult {
        let Some(resource) = self.locate(&branch.resource_id) else {
            return CommunicationResult::resource_error(format!("TCC resource not found: {}", branch.resource_id));
        };
        if !resource.enabled {
            return CommunicationResult::failure(format!("TCC resource disabled: {}", branch.resource_id));
        }
        if self.markers.has(&branch.xid, branch.branch_id, TccMarker::Confirmed) {
            debug!(xid = %branch.xid, branch_id = branch.branch_id, "confirm already applied");
            return CommunicationResult::success();
        }

        match resource.confirm.invoke(branch) {
            Ok(true) => {
                self.markers.mark(&branch.xid, branch.branch_id, TccMarker::Confirmed);
                info!(xid = %branch.xid, branch_id = branch.branch_id, resource_id = %branch.resource_id, "TCC confirmed");
                CommunicationResult::success()
            }
            Ok(false) => CommunicationResult::failure("TCC confirm returned false"),
            Err(err) => CommunicationResult::failure(format!("TCC confirm failed: {err}")),
        }
    }

    /// Cancel a branch. Idempotent, and safe against reordering: cancelling
    /// a branch that never tried records the fact and succeeds.
    pub fn cancel(&self, branch: &BranchTransaction) -> CommunicationResult {
        let Some(resource) = self.locate(&branch.resource_id) else {
            return CommunicationResult::resource_error(format!("TCC resource not found: {}", branch.resource_id));
        };
        if !resource.enabled {
            return CommunicationResult::failure(format!("TCC resource disabled: {}", branch.resource_id));
        }
        if self.markers.has(&branch.xid, branch.branch_id, TccMarker::Cancelled)
            || self.markers.has(&branch.xid, branch.branch_id, TccMarker::CancelledWithoutTry)
        {
            debug!(xid = %branch.xid, branch_id = branch.branch_id, "cancel already applied");
            return CommunicationResult::success();
        }
        if !self.markers.has(&branch.xid, branch.branch_id, TccMarker::Tried) {
            self.markers
                .mark(&branch.xid, branch.branch_id, TccMarker::CancelledWithoutTry);
            info!(
                xid = %branch.xid,
                branch_id = branch.branch_id,
                "cancel before try: empty rollback recorded"
            );
            return CommunicationResult::success();
        }

        match resource.cancel.invoke(branch) {
            Ok(true) => {
                self.markers.mark(&branch.xid, branch.branch_id, TccMarker::Cancelled);
                info!(xid = %branch.xid, branch_id = branch.branch_id, resource_id = %branch.resource_id, "TCC cancelled");
                CommunicationResult::success()
            }
            Ok(false) => CommunicationResult::failure("TCC cancel returned false"),
            Err(err) => CommunicationResult::failure(format!("TCC cancel failed: {err}")),
        }
    }
}

impl Default for TccResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

fn participant_registration(resource_id: &str, participant: Arc<dyn TccParticipant>) -> TccRegistration {
    let confirm_target = Arc::clone(&participant);
    let confirm = TccCallback::XidBranch(Arc::new(move |xid, branch_id| confirm_target.confirm(xid, branch_id)));
    let cancel = TccCallback::XidBranch(Arc::new(move |xid, branch_id| participant.cancel(xid, branch_id)));
    TccRegistration::new(resource_id, confirm, cancel)
}

#[async_trait]
impl ResourceHandler for TccResourceManager {
    async fn branch_commit(&self, branch: &BranchTransaction) -> CommunicationResult {
        self.confirm(branch)
    }

    async fn branch_rollback(&self, branch: &BranchTransaction) -> CommunicationResult {
        self.cancel(branch)
    }
}
