//! Handler routing and the phase-2 retry driver.
//!
//! One attempt returns a [`CommunicationResult`]; the driver decides whether
//! to try again. Retryable statuses (timeout, network, resource, retryable,
//! unknown) back off exponentially with factor 1.5 up to the configured cap,
//! with jitter so a thundering herd of failing branches spreads out.
//! Non-retryable statuses end the branch after the first attempt. Attempt
//! ceilings are per resource type.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::sleep;
use tracing::{debug, warn};

use lodestar_core::config::RetryConfig;
use lodestar_core::model::{BranchTransaction, BranchType, CommunicationResult};

/// Which phase-2 operation is being driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseTwoOp {
    Commit,
    Rollback,
}

impl PhaseTwoOp {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseTwoOp::Commit => "commit",
            PhaseTwoOp::Rollback => "rollback",
        }
    }
}

/// A phase-2 handler for one resource type.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    async fn branch_commit(&self, branch: &BranchTransaction) -> CommunicationResult;

    async fn branch_rollback(&self, branch: &BranchTransaction) -> CommunicationResult;
}

/// Routes branches to their type's handler and drives retries.
pub struct Dispatcher {
    handlers: DashMap<BranchType, Arc<dyn ResourceHandler>>,
    retry: RetryConfig,
}

impl Dispatcher {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            handlers: DashMap::new(),
            retry,
        }
    }

    pub fn register_handler(&self, branch_type: BranchType, handler: Arc<dyn ResourceHandler>) {
        self.handlers.insert(branch_type, handler);
    }

    fn handler_for(&self, branch_type: BranchType) -> Option<Arc<dyn ResourceHandler>> {
        self.handlers.get(&branch_type).map(|h| Arc::clone(h.value()))
    }

    fn max_attempts(&self, branch_type: BranchType) -> u32 {
        match branch_type {
            BranchType::At => self.retry.max_attempts_at,
            BranchType::Tcc => self.retry.max_attempts_tcc,
            BranchType::Http => self.retry.max_attempts_http,
            BranchType::Mq => self.retry.max_attempts_mq,
            BranchType::Xa => self.retry.max_attempts_xa,
        }
    }

    pub async fn dispatch_commit(&self, branch: &BranchTransaction) -> CommunicationResult {
        self.drive(branch, PhaseTwoOp::Commit).await
    }

    pub async fn dispatch_rollback(&self, branch: &BranchTransaction) -> CommunicationResult {
        self.drive(branch, PhaseTwoOp::Rollback).await
    }

    async fn drive(&self, branch: &BranchTransaction, op: PhaseTwoOp) -> CommunicationResult {
        let Some(handler) = self.handler_for(branch.branch_type) else {
            return CommunicationResult::failure(format!(
                "no handler registered for resource type {}",
                branch.branch_type
            ));
        };

        let max_attempts = self.max_attempts(branch.branch_type).max(1);
        let mut interval_ms = self.retry.initial_interval_ms;
        let mut last = CommunicationResult::failure("not attempted");

        for attempt in 1..=max_attempts {
            let result = match op {
                PhaseTwoOp::Commit => handler.branch_commit(branch).await,
                PhaseTwoOp::Rollback => handler.branch_rollback(branch).await,
            };

            if result.is_success() {
                debug!(
                    xid = %branch.xid,
                    branch_id = branch.branch_id,
                    op = op.as_str(),
                    attempt,
                    "phase-2 dispatch succeeded"
                );
                return result;
            }

            warn!(
                xid = %branch.xid,
                branch_id = branch.branch_id,
                resource_id = %branch.resource_id,
                op = op.as_str(),
                attempt,
                status = ?result.status,
                error = result.error.as_deref().unwrap_or(""),
                "phase-2 attempt failed"
            );

            if !result.is_retryable() || attempt == max_attempts {
                return result;
            }

            last = result;
            sleep(self.jittered(interval_ms)).await;
            interval_ms = self.next_interval(interval_ms);
        }

        last
    }

    fn next_interval(&self, current_ms: u64) -> u64 {
        let next = (current_ms as f64 * self.retry.multiplier) as u64;
        next.min(self.retry.max_interval_ms)
    }

    fn jittered(&self, interval_ms: u64) -> Duration {
        if self.retry.jitter_factor <= 0.0 {
            return Duration::from_millis(interval_ms);
        }
        let range = interval_ms as f64 * self.retry.jitter_factor;
        let jitter = (fastrand::f64() - 0.5) * 2.0 * range;
        Duration::from_millis(((interval_ms as f64 + jitter).max(0.0)) as u64)
    }
}
