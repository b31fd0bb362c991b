//! Error types shared across the Lodestar crates.
//!
//! The taxonomy is flat: one enum, classification by discriminator. Remote
//! addresses and database error codes ride as fields on the variants that
//! carry them.

use std::time::Duration;

use thiserror::Error;

/// Result type for Lodestar operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Fine-grained classification of network failures.
///
/// Transient conditions (timeout, refused, reset, unreachable) are worth
/// retrying; a host that does not resolve or a failed TLS handshake is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    ConnectionTimeout,
    ReadTimeout,
    ConnectionRefused,
    ConnectionReset,
    HostUnreachable,
    NetworkUnreachable,
    UnknownHost,
    SslHandshake,
    Other,
}

impl NetworkErrorKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, NetworkErrorKind::UnknownHost | NetworkErrorKind::SslHandshake)
    }
}

/// Errors that can occur anywhere in the transaction framework.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("wire error: {0}")]
    Wire(String),

    #[error("network error: {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
        remote_address: Option<String>,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("global lock conflict on {row_key}")]
    LockConflict { row_key: String },

    #[error("dirty write on table {table}: current rows diverge from after-image")]
    DirtyWrite { table: String },

    #[error("no undo log for xid={xid} branchId={branch_id}")]
    NoUndoLog { xid: String, branch_id: i64 },

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("service not resolvable: {0}")]
    ServiceNotResolvable(String),

    #[error("global transaction not found: {0}")]
    GlobalNotFound(String),

    #[error("global transaction not active: {xid} ({status})")]
    GlobalNotActive { xid: String, status: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Convenience constructor for a network error without address context.
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        CoreError::Network {
            kind,
            message: message.into(),
            remote_address: None,
        }
    }

    /// Whether a caller may reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::Network { kind, .. } => kind.is_retryable(),
            CoreError::Timeout(_) | CoreError::LockConflict { .. } => true,
            CoreError::ResourceNotFound(_) | CoreError::ServiceNotResolvable(_) => true,
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            CoreError::Timeout(_)
                | CoreError::Network {
                    kind: NetworkErrorKind::ConnectionTimeout | NetworkErrorKind::ReadTimeout,
                    ..
                }
        )
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match err.kind() {
            ErrorKind::TimedOut => NetworkErrorKind::ReadTimeout,
            ErrorKind::ConnectionRefused => NetworkErrorKind::ConnectionRefused,
            ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => NetworkErrorKind::ConnectionReset,
            ErrorKind::HostUnreachable => NetworkErrorKind::HostUnreachable,
            ErrorKind::NetworkUnreachable => NetworkErrorKind::NetworkUnreachable,
            _ => NetworkErrorKind::Other,
        };
        CoreError::Network {
            kind,
            message: err.to_string(),
            remote_address: None,
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_network_kinds_are_retryable() {
        assert!(NetworkErrorKind::ConnectionTimeout.is_retryable());
        assert!(NetworkErrorKind::ConnectionRefused.is_retryable());
        assert!(NetworkErrorKind::ConnectionReset.is_retryable());
        assert!(!NetworkErrorKind::UnknownHost.is_retryable());
        assert!(!NetworkErrorKind::SslHandshake.is_retryable());
    }

    #[test]
    fn lock_conflict_is_retryable() {
        let err = CoreError::LockConflict {
            row_key: "db1:account:1".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn dirty_write_is_not_retryable() {
        let err = CoreError::DirtyWrite {
            table: "account".into(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn io_error_maps_to_network_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        match CoreError::from(io) {
            CoreError::Network { kind, .. } => assert_eq!(kind, NetworkErrorKind::ConnectionRefused),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
