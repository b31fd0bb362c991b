//! Resource-manager dispatch for Lodestar.
//!
//! The coordinator drives phase-2 through this crate: the [`dispatch`]
//! module routes a branch to the handler for its resource type and wraps
//! every attempt in the retry policy (exponential back-off ×1.5, capped,
//! jittered, per-type attempt ceilings). The handlers:
//!
//! - [`at`]: delete or replay the undo log in the business database
//! - [`tcc`]: invoke registered confirm/cancel callbacks with idempotency
//!   and anti-suspension markers
//! - [`xa`]: commit or roll back a prepared XA branch through a driver
//! - [`mq`]: confirm or reject a staged half-message
//! - [`http`]: POST confirm/cancel to an external service, mapping HTTP
//!   status codes onto communication results

/// AT-mode phase-2 handler.
pub mod at;
/// Handler routing and the retry driver.
pub mod dispatch;
/// External-service (HTTP) handler.
pub mod http;
/// Message-queue handler.
pub mod mq;
/// Service address resolution.
pub mod resolver;
/// TCC registry and handler.
pub mod tcc;
/// XA handler.
pub mod xa;

pub use at::AtResourceManager;
pub use dispatch::{Dispatcher, PhaseTwoOp, ResourceHandler};
pub use http::{AuthConfig, ExternalServiceClient, ExternalServiceConfig};
pub use mq::{InMemoryMqBackend, MessageQueueBackend, MessageQueueManager};
pub use resolver::{ServiceAddressResolver, StaticResolver};
pub use tcc::{ServiceContainer, TccCallback, TccParticipant, TccRegistration, TccResourceManager};
pub use xa::{InProcessXaDriver, XaDriver, XaResourceManager};
