//! Sync bridge between the data-source interceptor and the async client.
//!
//! The interceptor runs on blocking database threads; this session hands
//! its branch registrations to the async [`TcClient`] through a runtime
//! handle. Never call it from an async task; use `spawn_blocking` (the
//! interceptor's natural habitat) or a plain thread.

use std::sync::Arc;

use tokio::runtime::Handle;

use lodestar_core::model::BranchStatus;
use lodestar_core::protocol::BranchRegisterRequest;
use lodestar_core::CoreResult;
use lodestar_datasource::BranchSession;

use crate::client::TcClient;

/// [`BranchSession`] over a [`TcClient`], for blocking threads.
pub struct BlockingSession {
    client: Arc<TcClient>,
    handle: Handle,
}

impl BlockingSession {
    pub fn new(client: Arc<TcClient>, handle: Handle) -> Self {
        Self { client, handle }
    }
}

impl BranchSession for BlockingSession {
    fn register_branch(&self, request: BranchRegisterRequest) -> CoreResult<i64> {
        self.handle.block_on(self.client.register_branch(request))
    }

    fn report_branch(&self, branch_id: i64, status: BranchStatus) -> CoreResult<()> {
        self.handle.block_on(self.client.report_branch_status(branch_id, status))
    }
}
