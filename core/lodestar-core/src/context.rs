//! Transaction context propagation.
//!
//! While a global transaction is active, the xid and its surroundings travel
//! with the executing task rather than living in process-wide mutable state.
//! Async code scopes a context with [`TransactionContext::scope`]; crossing a
//! task boundary re-scopes the captured context on the new task. Synchronous
//! driver code (the data-source interceptor) receives the context explicitly
//! instead of reading a task-local.

use std::future::Future;

use serde::{Deserialize, Serialize};

/// Everything a participant needs to know about the ambient transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionContext {
    pub xid: String,
    pub branch_id: Option<i64>,
    pub resource_group_id: String,
    pub timeout_ms: i64,
    pub transaction_name: String,
}

tokio::task_local! {
    static CURRENT: TransactionContext;
}

impl TransactionContext {
    pub fn new(xid: impl Into<String>) -> Self {
        Self {
            xid: xid.into(),
            branch_id: None,
            resource_group_id: "default".into(),
            timeout_ms: 60_000,
            transaction_name: "default".into(),
        }
    }

    pub fn with_branch_id(mut self, branch_id: i64) -> Self {
        self.branch_id = Some(branch_id);
        self
    }

    pub fn with_resource_group(mut self, resource_group_id: impl Into<String>) -> Self {
        self.resource_group_id = resource_group_id.into();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_transaction_name(mut self, name: impl Into<String>) -> Self {
        self.transaction_name = name.into();
        self
    }

    /// Run `fut` with this context bound; the binding unwinds on every exit
    /// path, including panics and cancellation.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT.scope(self, fut).await
    }

    /// The context bound to the current task, if any.
    pub fn current() -> Option<TransactionContext> {
        CURRENT.try_with(|ctx| ctx.clone()).ok()
    }

    /// The ambient xid, if a transaction is active.
    pub fn current_xid() -> Option<String> {
        CURRENT.try_with(|ctx| ctx.xid.clone()).ok()
    }

    /// Whether the current task runs inside a global transaction.
    pub fn in_transaction() -> bool {
        CURRENT.try_with(|_| ()).is_ok()
    }

    /// Capture the current context and rebind it around `fut`, for handing
    /// work to a spawned task.
    ///
    /// Without an active context the future runs unchanged.
    pub async fn wrap_task<F: Future>(fut: F) -> F::Output {
        match Self::current() {
            Some(ctx) => ctx.scope(fut).await,
            None => fut.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scope_binds_and_unwinds() {
        assert!(TransactionContext::current().is_none());

        let ctx = TransactionContext::new("svc:1:1").with_timeout_ms(10_000);
        ctx.clone()
            .scope(async {
                let current = TransactionContext::current().unwrap();
                assert_eq!(current.xid, "svc:1:1");
                assert_eq!(current.timeout_ms, 10_000);
                assert!(TransactionContext::in_transaction());
            })
            .await;

        assert!(TransactionContext::current().is_none());
        assert!(!TransactionContext::in_transaction());
    }

    #[tokio::test]
    async fn context_crosses_task_boundary_when_wrapped() {
        let ctx = TransactionContext::new("svc:2:1");
        let observed = ctx
            .scope(async {
                let captured = TransactionContext::current();
                let handle = tokio::spawn(async move {
                    // Fresh task: nothing ambient until the wrapper rebinds.
                    assert!(TransactionContext::current().is_none());
                    match captured {
                        Some(ctx) => {
                            ctx.scope(async { TransactionContext::current_xid() }).await
                        }
                        None => None,
                    }
                });
                handle.await.unwrap()
            })
            .await;
        assert_eq!(observed.as_deref(), Some("svc:2:1"));
    }

    #[tokio::test]
    async fn wrap_task_without_context_is_a_passthrough() {
        let value = TransactionContext::wrap_task(async { 41 + 1 }).await;
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn nested_scopes_restore_the_outer_context() {
        let outer = TransactionContext::new("svc:3:1");
        outer
            .scope(async {
                let inner = TransactionContext::new("svc:3:2");
                inner
                    .scope(async {
                        assert_eq!(TransactionContext::current_xid().as_deref(), Some("svc:3:2"));
                    })
                    .await;
                assert_eq!(TransactionContext::current_xid().as_deref(), Some("svc:3:1"));
            })
            .await;
    }
}
