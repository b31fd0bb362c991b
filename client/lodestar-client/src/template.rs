//! The global-transaction template.
//!
//! Wraps a business closure the way the method interceptor wraps an
//! annotated method: begin a global transaction, bind its context around
//! the closure, commit on success, roll back on failure, and unwind the
//! binding on every exit path.

use std::sync::Arc;

use tracing::{error, warn};

use lodestar_core::{CoreError, TransactionContext};

use crate::client::TcClient;

/// Failure of a templated transaction.
#[derive(Debug)]
pub enum TemplateError<E> {
    /// The business closure failed; the transaction was rolled back.
    Business(E),
    /// Talking to the coordinator failed.
    Coordinator(CoreError),
}

impl<E: std::fmt::Display> std::fmt::Display for TemplateError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateError::Business(err) => write!(f, "business error (rolled back): {err}"),
            TemplateError::Coordinator(err) => write!(f, "coordinator error: {err}"),
        }
    }
}

impl<E: std::fmt::Display + std::fmt::Debug> std::error::Error for TemplateError<E> {}

/// Runs business closures inside global transactions.
pub struct TransactionTemplate {
    client: Arc<TcClient>,
    application_id: String,
    resource_group_id: String,
    default_timeout_ms: i64,
}

impl TransactionTemplate {
    pub fn new(client: Arc<TcClient>, application_id: impl Into<String>) -> Self {
        Self {
            client,
            application_id: application_id.into(),
            resource_group_id: "default".into(),
            default_timeout_ms: 60_000,
        }
    }

    pub fn with_resource_group(mut self, resource_group_id: impl Into<String>) -> Self {
        self.resource_group_id = resource_group_id.into();
        self
    }

    pub fn with_default_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    pub fn client(&self) -> &Arc<TcClient> {
        &self.client
    }

    /// Run `business` inside a global transaction.
    ///
    /// On `Ok` the transaction commits; on `Err` it rolls back and the
    /// business error is returned. A commit rejected because the TC already
    /// timed the transaction out surfaces as
    /// [`CoreError::GlobalNotActive`].
    pub async fn execute<F, Fut, T, E>(
        &self,
        transaction_name: &str,
        timeout_ms: Option<i64>,
        business: F,
    ) -> Result<T, TemplateError<E>>
    where
        F: FnOnce(TransactionContext) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let timeout_ms = timeout_ms.unwrap_or(self.default_timeout_ms);
        let xid = self
            .client
            .begin_global_transaction(&self.application_id, transaction_name, timeout_ms)
            .await
            .map_err(TemplateError::Coordinator)?;

        let context = TransactionContext::new(xid.clone())
            .with_resource_group(self.resource_group_id.clone())
            .with_timeout_ms(timeout_ms)
            .with_transaction_name(transaction_name);

        // scope() unwinds the binding on every exit path.
        let outcome = context.clone().scope(business(context)).await;

        match outcome {
            Ok(value) => {
                self.client
                    .commit_global_transaction(&xid)
                    .await
                    .map_err(TemplateError::Coordinator)?;
                Ok(value)
            }
            Err(business_err) => {
                if let Err(rollback_err) = self.client.rollback_global_transaction(&xid).await {
                    // The timeout scanner may already have settled it;
                    // either way the record carries the outcome.
                    match &rollback_err {
                        CoreError::GlobalNotActive { .. } => {
                            warn!(xid = %xid, %rollback_err, "rollback raced an already-settled transaction")
                        }
                        _ => error!(xid = %xid, %rollback_err, "rollback after business failure failed"),
                    }
                }
                Err(TemplateError::Business(business_err))
            }
        }
    }
}
