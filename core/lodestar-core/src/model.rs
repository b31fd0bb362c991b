//! Data model for global and branch transactions.
//!
//! Status enums carry the numeric codes that go over the wire and into the
//! metadata store, so renaming a variant never changes persisted state.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Lower bound for a global transaction timeout.
pub const MIN_TIMEOUT_MS: i64 = 1_000;
/// Upper bound for a global transaction timeout.
pub const MAX_TIMEOUT_MS: i64 = 300_000;

/// Clamp a caller-supplied timeout into the supported range.
///
/// The caller's value is authoritative within bounds; out-of-range values are
/// snapped rather than rejected.
pub fn clamp_timeout_ms(requested: i64) -> i64 {
    requested.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS)
}

/// Lifecycle of a global transaction as driven by the TC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlobalStatus {
    Begin,
    Committing,
    Committed,
    CommitFailed,
    Rollbacking,
    Rollbacked,
    RollbackFailed,
    TimeoutRollbacking,
    TimeoutRollbacked,
    Finished,
}

impl GlobalStatus {
    pub fn code(self) -> u8 {
        match self {
            GlobalStatus::Begin => 1,
            GlobalStatus::Committing => 2,
            GlobalStatus::Committed => 3,
            GlobalStatus::CommitFailed => 4,
            GlobalStatus::Rollbacking => 5,
            GlobalStatus::Rollbacked => 6,
            GlobalStatus::RollbackFailed => 7,
            GlobalStatus::TimeoutRollbacking => 8,
            GlobalStatus::TimeoutRollbacked => 9,
            GlobalStatus::Finished => 10,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => GlobalStatus::Begin,
            2 => GlobalStatus::Committing,
            3 => GlobalStatus::Committed,
            4 => GlobalStatus::CommitFailed,
            5 => GlobalStatus::Rollbacking,
            6 => GlobalStatus::Rollbacked,
            7 => GlobalStatus::RollbackFailed,
            8 => GlobalStatus::TimeoutRollbacking,
            9 => GlobalStatus::TimeoutRollbacked,
            10 => GlobalStatus::Finished,
            _ => return None,
        })
    }

    /// Terminal states are never mutated again by the driver.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            GlobalStatus::Committed
                | GlobalStatus::CommitFailed
                | GlobalStatus::Rollbacked
                | GlobalStatus::RollbackFailed
                | GlobalStatus::TimeoutRollbacked
                | GlobalStatus::Finished
        )
    }

    /// States reached through the commit path.
    pub fn is_commit_family(self) -> bool {
        matches!(
            self,
            GlobalStatus::Committing | GlobalStatus::Committed | GlobalStatus::CommitFailed
        )
    }

    /// States reached through the rollback (or timeout-rollback) path.
    pub fn is_rollback_family(self) -> bool {
        matches!(
            self,
            GlobalStatus::Rollbacking
                | GlobalStatus::Rollbacked
                | GlobalStatus::RollbackFailed
                | GlobalStatus::TimeoutRollbacking
                | GlobalStatus::TimeoutRollbacked
        )
    }
}

impl std::fmt::Display for GlobalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Branch transaction state machine.
///
/// Phase-1 outcomes are reported by the RM; every other transition is owned
/// by the TC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchStatus {
    Registered,
    PhaseOneDone,
    PhaseOneFailed,
    PhaseTwoCommitting,
    PhaseTwoCommitted,
    PhaseTwoCommitFailed,
    PhaseTwoRollbacking,
    PhaseTwoRollbacked,
    PhaseTwoRollbackFailed,
    Timeout,
    Unknown,
}

impl BranchStatus {
    pub fn code(self) -> u8 {
        match self {
            BranchStatus::Registered => 1,
            BranchStatus::PhaseOneDone => 2,
            BranchStatus::PhaseOneFailed => 3,
            BranchStatus::PhaseTwoCommitting => 4,
            BranchStatus::PhaseTwoCommitted => 5,
            BranchStatus::PhaseTwoCommitFailed => 6,
            BranchStatus::PhaseTwoRollbacking => 7,
            BranchStatus::PhaseTwoRollbacked => 8,
            BranchStatus::PhaseTwoRollbackFailed => 9,
            BranchStatus::Timeout => 10,
            BranchStatus::Unknown => 99,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => BranchStatus::Registered,
            2 => BranchStatus::PhaseOneDone,
            3 => BranchStatus::PhaseOneFailed,
            4 => BranchStatus::PhaseTwoCommitting,
            5 => BranchStatus::PhaseTwoCommitted,
            6 => BranchStatus::PhaseTwoCommitFailed,
            7 => BranchStatus::PhaseTwoRollbacking,
            8 => BranchStatus::PhaseTwoRollbacked,
            9 => BranchStatus::PhaseTwoRollbackFailed,
            10 => BranchStatus::Timeout,
            _ => BranchStatus::Unknown,
        }
    }

    pub fn is_phase_one_done(self) -> bool {
        self == BranchStatus::PhaseOneDone
    }

    /// Final phase-2 states; a branch here must never be acted on again.
    pub fn is_phase_two_final(self) -> bool {
        matches!(
            self,
            BranchStatus::PhaseTwoCommitted
                | BranchStatus::PhaseTwoCommitFailed
                | BranchStatus::PhaseTwoRollbacked
                | BranchStatus::PhaseTwoRollbackFailed
        )
    }

    /// Eligible for phase-2 dispatch by the global driver.
    pub fn is_phase_two_eligible(self) -> bool {
        matches!(
            self,
            BranchStatus::Registered | BranchStatus::PhaseOneDone | BranchStatus::Timeout
        )
    }

    pub fn is_failed(self) -> bool {
        matches!(
            self,
            BranchStatus::PhaseOneFailed
                | BranchStatus::PhaseTwoCommitFailed
                | BranchStatus::PhaseTwoRollbackFailed
        )
    }
}

impl std::fmt::Display for BranchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Resource type a branch belongs to; decides which phase-2 handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BranchType {
    At,
    Tcc,
    Xa,
    Mq,
    Http,
}

impl BranchType {
    /// Classify a resource id by prefix/shape.
    ///
    /// Registration requests carry an explicit type which takes precedence;
    /// this is the fallback for callers that only know the resource id.
    pub fn classify(resource_id: &str) -> Option<Self> {
        let id = resource_id.to_ascii_lowercase();
        if id.starts_with("tcc:") {
            Some(BranchType::Tcc)
        } else if id.starts_with("xa:") {
            Some(BranchType::Xa)
        } else if id.starts_with("jdbc:") || id.starts_with("sqlite:") || id.contains("database") {
            Some(BranchType::At)
        } else if id.contains("mq") || id.contains("queue") || id.contains("kafka") || id.contains("rabbitmq") {
            Some(BranchType::Mq)
        } else if id.starts_with("http://") || id.starts_with("https://") || id.contains("service") || id.contains("api") {
            Some(BranchType::Http)
        } else {
            None
        }
    }
}

impl std::fmt::Display for BranchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BranchType::At => "AT",
            BranchType::Tcc => "TCC",
            BranchType::Xa => "XA",
            BranchType::Mq => "MQ",
            BranchType::Http => "HTTP",
        };
        f.write_str(name)
    }
}

/// Durable record of a distributed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalTransaction {
    pub xid: String,
    pub status: GlobalStatus,
    pub application_id: String,
    pub transaction_name: String,
    pub timeout_ms: i64,
    pub begin_time_ms: i64,
    pub application_data: Option<String>,
}

impl GlobalTransaction {
    pub fn new(xid: String, application_id: String, transaction_name: String, timeout_ms: i64) -> Self {
        Self {
            xid,
            status: GlobalStatus::Begin,
            application_id,
            transaction_name,
            timeout_ms: clamp_timeout_ms(timeout_ms),
            begin_time_ms: now_millis(),
            application_data: None,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms - self.begin_time_ms >= self.timeout_ms
    }
}

/// One participant's work within a global transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchTransaction {
    pub branch_id: i64,
    pub xid: String,
    pub resource_group_id: String,
    pub resource_id: String,
    pub branch_type: BranchType,
    pub lock_key: Option<String>,
    pub status: BranchStatus,
    pub application_data: Option<String>,
    pub begin_time_ms: i64,
    pub end_time_ms: Option<i64>,
    pub timeout_ms: i64,
}

impl BranchTransaction {
    pub fn elapsed_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.begin_time_ms
    }

    pub fn is_timed_out(&self, now_ms: i64) -> bool {
        self.elapsed_ms(now_ms) > self.timeout_ms
    }
}

/// Allocates globally unique xids in the `applicationId:epochMs:monotonic`
/// format.
#[derive(Debug)]
pub struct XidGenerator {
    application_id: String,
    sequence: AtomicU64,
}

impl XidGenerator {
    pub fn new(application_id: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
            sequence: AtomicU64::new(1),
        }
    }

    pub fn next_xid(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}:{}:{}", self.application_id, now_millis(), seq)
    }

    /// Build an xid for a foreign application id (the TC allocates on behalf
    /// of the requesting application).
    pub fn next_xid_for(&self, application_id: &str) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}:{}:{}", application_id, now_millis(), seq)
    }
}

/// Snowflake-style branch-id allocator: `(epoch_ms << 16) | sequence`.
///
/// Unique within one TC process for up to 65_536 registrations per
/// millisecond; the sequence waits out the millisecond on overflow.
#[derive(Debug, Default)]
pub struct BranchIdAllocator {
    state: Mutex<(i64, u16)>,
}

impl BranchIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> i64 {
        let mut state = self.state.lock();
        let mut now = now_millis();
        if now < state.0 {
            now = state.0;
        }
        if now == state.0 {
            if state.1 == u16::MAX {
                state.0 += 1;
                state.1 = 0;
            } else {
                state.1 += 1;
            }
        } else {
            state.0 = now;
            state.1 = 0;
        }
        (state.0 << 16) | state.1 as i64
    }
}

/// Outcome of one communication attempt with a resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommStatus {
    Success,
    Failure,
    Timeout,
    NetworkError,
    ProtocolError,
    AuthError,
    ResourceError,
    RetryableError,
    NonRetryableError,
    Unknown,
}

impl CommStatus {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            CommStatus::Timeout
                | CommStatus::NetworkError
                | CommStatus::ResourceError
                | CommStatus::RetryableError
                | CommStatus::Unknown
        )
    }
}

/// Result of a phase-2 dispatch attempt, as returned by a resource handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunicationResult {
    pub status: CommStatus,
    pub error: Option<String>,
    pub target: Option<String>,
    pub duration_ms: Option<u64>,
}

impl CommunicationResult {
    fn with_status(status: CommStatus, error: Option<String>) -> Self {
        Self {
            status,
            error,
            target: None,
            duration_ms: None,
        }
    }

    pub fn success() -> Self {
        Self::with_status(CommStatus::Success, None)
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self::with_status(CommStatus::Failure, Some(error.into()))
    }

    pub fn timeout(error: impl Into<String>) -> Self {
        Self::with_status(CommStatus::Timeout, Some(error.into()))
    }

    pub fn network_error(error: impl Into<String>) -> Self {
        Self::with_status(CommStatus::NetworkError, Some(error.into()))
    }

    pub fn protocol_error(error: impl Into<String>) -> Self {
        Self::with_status(CommStatus::ProtocolError, Some(error.into()))
    }

    pub fn auth_error(error: impl Into<String>) -> Self {
        Self::with_status(CommStatus::AuthError, Some(error.into()))
    }

    pub fn resource_error(error: impl Into<String>) -> Self {
        Self::with_status(CommStatus::ResourceError, Some(error.into()))
    }

    pub fn retryable_error(error: impl Into<String>) -> Self {
        Self::with_status(CommStatus::RetryableError, Some(error.into()))
    }

    pub fn non_retryable_error(error: impl Into<String>) -> Self {
        Self::with_status(CommStatus::NonRetryableError, Some(error.into()))
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == CommStatus::Success
    }

    pub fn is_retryable(&self) -> bool {
        self.status.is_retryable()
    }
}
