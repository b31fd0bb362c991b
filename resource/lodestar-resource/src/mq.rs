//! Message-queue resource manager.
//!
//! A transactional producer stages a half-message during phase-1; phase-2
//! either confirms it for delivery or rejects it. Broker specifics live
//! behind [`MessageQueueBackend`]; the in-memory backend ships for tests and
//! single-process deployments.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info};

use lodestar_core::model::{BranchTransaction, CommunicationResult};

use crate::dispatch::ResourceHandler;

/// Errors from a queue backend.
#[derive(Debug, Error)]
pub enum MqError {
    #[error("no half-message staged for xid={xid} branchId={branch_id}")]
    NotStaged { xid: String, branch_id: i64 },

    #[error("half-message for xid={xid} branchId={branch_id} was already discarded")]
    AlreadyDiscarded { xid: String, branch_id: i64 },

    #[error("half-message for xid={xid} branchId={branch_id} was already delivered")]
    AlreadyDelivered { xid: String, branch_id: i64 },

    #[error("broker error: {0}")]
    Broker(String),
}

/// Broker operations the handler needs.
#[async_trait]
pub trait MessageQueueBackend: Send + Sync {
    /// Release the half-message for delivery.
    async fn confirm(&self, xid: &str, branch_id: i64) -> Result<(), MqError>;

    /// Discard the half-message.
    async fn reject(&self, xid: &str, branch_id: i64) -> Result<(), MqError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HalfMessageState {
    Staged,
    Delivered,
    Discarded,
}

#[derive(Debug, Clone)]
struct HalfMessage {
    payload: Vec<u8>,
    state: HalfMessageState,
}

/// In-memory half-message store.
#[derive(Default)]
pub struct InMemoryMqBackend {
    messages: DashMap<(String, i64), HalfMessage>,
}

impl InMemoryMqBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a half-message during phase-1.
    pub fn stage(&self, xid: impl Into<String>, branch_id: i64, payload: Vec<u8>) {
        self.messages.insert(
            (xid.into(), branch_id),
            HalfMessage {
                payload,
                state: HalfMessageState::Staged,
            },
        );
    }

    /// Payloads that were confirmed for delivery.
    pub fn delivered(&self) -> Vec<Vec<u8>> {
        self.messages
            .iter()
            .filter(|entry| entry.value().state == HalfMessageState::Delivered)
            .map(|entry| entry.value().payload.clone())
            .collect()
    }

    pub fn is_discarded(&self, xid: &str, branch_id: i64) -> bool {
        self.messages
            .get(&(xid.to_string(), branch_id))
            .is_some_and(|m| m.state == HalfMessageState::Discarded)
    }
}

#[async_trait]
impl MessageQueueBackend for InMemoryMqBackend {
    async fn confirm(&self, xid: &str, branch_id: i64) -> Result<(), MqError> {
        let key = (xid.to_string(), branch_id);
        let Some(mut message) = self.messages.get_mut(&key) else {
            return Err(MqError::NotStaged {
                xid: xid.to_string(),
                branch_id,
            });
        };
        match message.state {
            HalfMessageState::Staged => {
                message.state = HalfMessageState::Delivered;
                Ok(())
            }
            HalfMessageState::Delivered => Ok(()),
            HalfMessageState::Discarded => Err(MqError::AlreadyDiscarded {
                xid: xid.to_string(),
                branch_id,
            }),
        }
    }

    async fn reject(&self, xid: &str, branch_id: i64) -> Result<(), MqError> {
        let key = (xid.to_string(), branch_id);
        let Some(mut message) = self.messages.get_mut(&key) else {
            return Err(MqError::NotStaged {
                xid: xid.to_string(),
                branch_id,
            });
        };
        match message.state {
            HalfMessageState::Staged => {
                message.state = HalfMessageState::Discarded;
                Ok(())
            }
            HalfMessageState::Discarded => Ok(()),
            HalfMessageState::Delivered => Err(MqError::AlreadyDelivered {
                xid: xid.to_string(),
                branch_id,
            }),
        }
    }
}

/// Phase-2 driver for message-queue branches.
pub struct MessageQueueManager {
    backend: Arc<dyn MessageQueueBackend>,
}

impl MessageQueueManager {
    pub fn new(backend: Arc<dyn MessageQueueBackend>) -> Self {
        Self { backend }
    }

    fn map_error(err: MqError) -> CommunicationResult {
        match err {
            // The producer may not have staged yet; worth another attempt.
            MqError::NotStaged { .. } => CommunicationResult::resource_error(err.to_string()),
            MqError::AlreadyDiscarded { .. } | MqError::AlreadyDelivered { .. } => {
                CommunicationResult::failure(err.to_string())
            }
            MqError::Broker(message) => CommunicationResult::retryable_error(message),
        }
    }
}

#[async_trait]
impl ResourceHandler for MessageQueueManager {
    async fn branch_commit(&self, branch: &BranchTransaction) -> CommunicationResult {
        match self.backend.confirm(&branch.xid, branch.branch_id).await {
            Ok(()) => {
                info!(xid = %branch.xid, branch_id = branch.branch_id, "half-message confirmed");
                CommunicationResult::success()
            }
            Err(err) => {
                debug!(xid = %branch.xid, branch_id = branch.branch_id, %err, "half-message confirm failed");
                Self::map_error(err)
            }
        }
    }

    async fn branch_rollback(&self, branch: &BranchTransaction) -> CommunicationResult {
        match self.backend.reject(&branch.xid, branch.branch_id).await {
            Ok(()) => {
                info!(xid = %branch.xid, branch_id = branch.branch_id, "half-message rejected");
                CommunicationResult::success()
            }
            Err(err) => {
                debug!(xid = %branch.xid, branch_id = branch.branch_id, %err, "half-message reject failed");
                Self::map_error(err)
            }
        }
    }
}
