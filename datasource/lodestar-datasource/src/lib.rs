//! AT-mode data-source interception for Lodestar.
//!
//! AT mode makes ordinary DML part of a distributed transaction without
//! touching business SQL: the [`proxy::ProxyConnection`] wraps a database
//! connection, and for every INSERT/UPDATE/DELETE executed inside a global
//! transaction it
//!
//! 1. parses the statement ([`parser`]),
//! 2. snapshots the affected rows before and after execution ([`records`]),
//! 3. registers a branch with the coordinator and acquires global row locks,
//! 4. writes an undo-log record in the *same local transaction* as the
//!    business DML ([`undo`]).
//!
//! Phase-2 commit deletes the undo log; phase-2 rollback replays it as
//! reverse SQL after verifying the current rows still match the after-image.
//! Everything here is synchronous `rusqlite` code; the async coordinator
//! reaches it through the [`proxy::BranchSession`] seam and
//! `spawn_blocking`.

/// Registry of business data sources and AT phase-2 entry points.
pub mod manager;
/// Single-table DML parsing.
pub mod parser;
/// The intercepting connection wrapper.
pub mod proxy;
/// Row-image capture and comparison.
pub mod records;
/// Undo-log persistence and compensation.
pub mod undo;

use thiserror::Error;

pub use manager::DataSourceManager;
pub use parser::{ParsedSql, SqlType};
pub use proxy::{BranchSession, ProxyConnection};
pub use records::{primary_key_column, CellValue, TableRecords};
pub use undo::{UndoLogEntry, UndoLogManager, UndoLogStatus};

/// Result type for data-source operations.
pub type DsResult<T> = Result<T, DatasourceError>;

/// Errors raised by the interception subsystem.
#[derive(Debug, Error)]
pub enum DatasourceError {
    #[error("database error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("unsupported SQL: {0}")]
    UnsupportedSql(String),

    #[error("table {0} has no primary key")]
    NoPrimaryKey(String),

    #[error("dirty write on table {table}: current rows diverge from after-image")]
    DirtyWrite { table: String },

    #[error("no undo log for xid={xid} branchId={branch_id}")]
    NoUndoLog { xid: String, branch_id: i64 },

    #[error("global lock conflict on {row_key}")]
    LockConflict { row_key: String },

    #[error("datasource not registered: {0}")]
    UnknownResource(String),

    #[error("image serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Core(lodestar_core::CoreError),
}

impl From<lodestar_core::CoreError> for DatasourceError {
    fn from(err: lodestar_core::CoreError) -> Self {
        match err {
            lodestar_core::CoreError::LockConflict { row_key } => DatasourceError::LockConflict { row_key },
            other => DatasourceError::Core(other),
        }
    }
}

impl DatasourceError {
    /// Lock conflicts are surfaced to business code as retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DatasourceError::LockConflict { .. })
    }
}
