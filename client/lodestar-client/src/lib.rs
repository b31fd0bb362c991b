//! Client-side transaction management for Lodestar.
//!
//! [`TcClient`] owns one persistent connection to the coordinator with
//! id-correlated request/response matching and per-call deadlines.
//! [`TransactionTemplate`] wraps a business closure in
//! begin/commit-or-rollback, binding the transaction context around it.
//! [`BlockingSession`] bridges the synchronous data-source interceptor onto
//! the async client.

/// The TC connection.
pub mod client;
/// Sync bridge for driver-side code.
pub mod session;
/// The global-transaction template.
pub mod template;

pub use client::TcClient;
pub use session::BlockingSession;
pub use template::{TemplateError, TransactionTemplate};
