//! Configuration for the coordinator, clients and retry behavior.
//!
//! Every struct derives `Default` with the framework's documented defaults;
//! deployments override the fields they care about.

use serde::{Deserialize, Serialize};

/// TC server listen configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address of the TC.
    pub address: String,
    /// Bind port of the TC.
    pub port: u16,
    /// How long a pending request may wait for its response.
    pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".into(),
            port: 8091,
            request_timeout_ms: 5_000,
        }
    }
}

/// Global and branch transaction timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Default global timeout when the caller passes none.
    pub default_timeout_ms: i64,
    /// Hard ceiling for global timeouts.
    pub max_timeout_ms: i64,
    /// Branch-level timeout; expired branches are marked `Timeout`.
    pub branch_timeout_ms: i64,
    /// How long terminal globals are retained for idempotent re-query.
    pub finished_retention_ms: i64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 60_000,
            max_timeout_ms: 300_000,
            branch_timeout_ms: 30_000,
            finished_retention_ms: 600_000,
        }
    }
}

/// AT-mode global lock acquisition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Overall budget for one acquisition.
    pub timeout_ms: u64,
    /// Sleep between attempts.
    pub retry_interval_ms: u64,
    /// Attempts before giving up with a lock conflict.
    pub max_retries: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            retry_interval_ms: 10,
            max_retries: 30,
        }
    }
}

/// Phase-2 dispatch retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub initial_interval_ms: u64,
    pub multiplier: f64,
    pub max_interval_ms: u64,
    /// Jitter factor applied to each backoff sleep (0.0 to 1.0).
    pub jitter_factor: f64,
    pub max_attempts_at: u32,
    pub max_attempts_tcc: u32,
    pub max_attempts_http: u32,
    pub max_attempts_mq: u32,
    pub max_attempts_xa: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1_000,
            multiplier: 1.5,
            max_interval_ms: 30_000,
            jitter_factor: 0.2,
            max_attempts_at: 5,
            max_attempts_tcc: 5,
            max_attempts_http: 3,
            max_attempts_mq: 3,
            max_attempts_xa: 3,
        }
    }
}

/// Timeout scanner cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    pub interval_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self { interval_ms: 60_000 }
    }
}

/// Everything the coordinator needs at construction time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub server: ServerConfig,
    pub transaction: TransactionConfig,
    pub lock: LockConfig,
    pub retry: RetryConfig,
    pub scan: ScanConfig,
    pub failover_enabled: bool,
}

impl CoordinatorConfig {
    pub fn new() -> Self {
        Self {
            failover_enabled: true,
            ..Default::default()
        }
    }
}

/// Client-side connection knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Per-call deadline for a pending request.
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            connect_timeout_ms: 3_000,
            reconnect_interval_ms: 1_000,
            max_reconnect_attempts: 10,
        }
    }
}
