//! Shared building blocks for the Lodestar distributed transaction framework.
//!
//! Lodestar coordinates atomic commit/rollback across independent resource
//! managers (databases, message queues, remote services, compensable business
//! services) with a central transaction coordinator (TC) and a two-phase
//! protocol. This crate carries everything both sides of the wire agree on:
//!
//! - [`protocol`]: the length-prefixed binary RPC frame and typed message
//!   bodies exchanged between TM/RM clients and the TC
//! - [`model`]: global/branch transaction records, status state machines and
//!   id allocation
//! - [`error`]: the flat error taxonomy with retryability classification
//! - [`config`]: configuration structs for coordinator, client, locking and
//!   retry behavior
//! - [`context`]: the transaction context carried across tasks while a
//!   global transaction is active
//! - [`serializer`]: the pluggable body codec (JSON built in)

/// Configuration types for the coordinator, clients and retry policies.
pub mod config;
/// Transaction context propagation across async tasks.
pub mod context;
/// Error taxonomy shared by all Lodestar crates.
pub mod error;
/// Data model: global/branch transactions, statuses, id generation.
pub mod model;
/// Binary RPC protocol: framing, message types, request/response bodies.
pub mod protocol;
/// Pluggable message-body serialization.
pub mod serializer;

pub use config::{ClientConfig, CoordinatorConfig, LockConfig, RetryConfig, ScanConfig, ServerConfig, TransactionConfig};
pub use context::TransactionContext;
pub use error::{CoreError, CoreResult, NetworkErrorKind};
pub use model::{
    BranchIdAllocator, BranchStatus, BranchTransaction, BranchType, CommStatus, CommunicationResult,
    GlobalStatus, GlobalTransaction, XidGenerator,
};
pub use protocol::{
    decode_frame, encode_frame, BeginRequest, BranchRegisterRequest, BranchReportRequest,
    MessageType, ResultCode, RpcMessage, RpcResponse, XidRequest, HEADER_LEN, MAGIC, VERSION,
};
pub use serializer::{BodyCodec, JsonCodec};
