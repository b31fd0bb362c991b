//! Framed TCP front end of the coordinator.
//!
//! One task per connection reads frames off the socket; each request is
//! handled on its own task so a slow phase-2 never blocks the connection's
//! read loop, and responses flow back through a writer task in completion
//! order, correlated by message id. Framing violations close the
//! connection.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use lodestar_core::config::ServerConfig;
use lodestar_core::protocol::{
    decode_frame, encode_frame, BeginRequest, BranchRegisterRequest, BranchReportRequest,
    MessageType, ResultCode, RpcMessage, RpcResponse, XidRequest,
};
use lodestar_core::{CoreError, CoreResult};

use crate::coordinator::TransactionCoordinator;

/// The TC's TCP server.
pub struct TcServer {
    listener: TcpListener,
    coordinator: Arc<TransactionCoordinator>,
}

impl TcServer {
    /// Bind to the configured address. Port 0 picks an ephemeral port,
    /// which [`TcServer::local_addr`] reports.
    pub async fn bind(config: &ServerConfig, coordinator: Arc<TransactionCoordinator>) -> CoreResult<Self> {
        let listener = TcpListener::bind((config.address.as_str(), config.port)).await?;
        info!(address = %listener.local_addr()?, "TC server listening");
        Ok(Self { listener, coordinator })
    }

    pub fn local_addr(&self) -> CoreResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop; runs until the task is aborted.
    pub async fn run(self) -> CoreResult<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            debug!(%peer, "client connected");
            let coordinator = Arc::clone(&self.coordinator);
            tokio::spawn(async move {
                if let Err(err) = handle_connection(coordinator, stream).await {
                    warn!(%peer, %err, "connection closed with error");
                }
                debug!(%peer, "client disconnected");
            });
        }
    }
}

async fn handle_connection(coordinator: Arc<TransactionCoordinator>, stream: TcpStream) -> CoreResult<()> {
    let (mut reader, mut writer) = stream.into_split();

    let (response_tx, mut response_rx) = mpsc::channel::<RpcMessage>(64);
    let writer_task = tokio::spawn(async move {
        let mut out = BytesMut::new();
        while let Some(message) = response_rx.recv().await {
            out.clear();
            if let Err(err) = encode_frame(&message, &mut out) {
                error!(%err, "failed to encode response");
                continue;
            }
            if writer.write_all(&out).await.is_err() {
                return;
            }
        }
    });

    let mut buf = BytesMut::with_capacity(4 * 1024);
    let result = loop {
        match decode_frame(&mut buf) {
            Ok(Some(message)) => {
                let coordinator = Arc::clone(&coordinator);
                let response_tx = response_tx.clone();
                tokio::spawn(async move {
                    let response = process_message(&coordinator, message).await;
                    let _ = response_tx.send(response).await;
                });
                continue;
            }
            Ok(None) => {}
            // Bad magic, bad version, unknown type: drop the connection.
            Err(err) => break Err(err),
        }

        let read = reader.read_buf(&mut buf).await?;
        if read == 0 {
            break Ok(());
        }
    };

    drop(response_tx);
    let _ = writer_task.await;
    result
}

/// Handle one request and build the `Result` response with the same id.
async fn process_message(coordinator: &TransactionCoordinator, message: RpcMessage) -> RpcMessage {
    let id = message.id;
    let response = dispatch_request(coordinator, &message).await.unwrap_or_else(error_response);
    RpcMessage::response(id, &response).unwrap_or_else(|err| {
        error!(%err, "failed to serialize response body");
        RpcMessage::new(id, MessageType::Result, Vec::new())
    })
}

async fn dispatch_request(
    coordinator: &TransactionCoordinator,
    message: &RpcMessage,
) -> CoreResult<RpcResponse> {
    match message.message_type {
        MessageType::GlobalBegin => {
            let request: BeginRequest = message.decode_body()?;
            let xid = coordinator
                .begin(&request.application_id, &request.transaction_name, request.timeout_ms)
                .await?;
            Ok(RpcResponse::ok().with_xid(xid))
        }
        MessageType::GlobalCommit => {
            let request: XidRequest = message.decode_body()?;
            let status = coordinator.global_commit(&request.xid).await?;
            Ok(RpcResponse::ok().with_xid(request.xid).with_status(status))
        }
        MessageType::GlobalRollback => {
            let request: XidRequest = message.decode_body()?;
            let status = coordinator.global_rollback(&request.xid).await?;
            Ok(RpcResponse::ok().with_xid(request.xid).with_status(status))
        }
        MessageType::GlobalStatus => {
            let request: XidRequest = message.decode_body()?;
            let status = coordinator.global_status(&request.xid).await?;
            Ok(RpcResponse::ok().with_xid(request.xid).with_status(status))
        }
        MessageType::BranchRegister => {
            let request: BranchRegisterRequest = message.decode_body()?;
            let xid = request.xid.clone();
            let branch_id = coordinator.register_branch(request).await?;
            Ok(RpcResponse::ok().with_xid(xid).with_branch_id(branch_id))
        }
        MessageType::BranchStatusReport => {
            let request: BranchReportRequest = message.decode_body()?;
            coordinator.report_branch_status(request.branch_id, request.status).await?;
            Ok(RpcResponse::ok().with_branch_id(request.branch_id))
        }
        MessageType::Result => Err(CoreError::Protocol("unexpected Result message from client".into())),
    }
}

fn error_response(err: CoreError) -> RpcResponse {
    let code = match &err {
        CoreError::GlobalNotFound(_) => ResultCode::GlobalNotFound,
        CoreError::GlobalNotActive { .. } => ResultCode::GlobalNotActive,
        CoreError::LockConflict { .. } => ResultCode::LockConflict,
        _ => ResultCode::Internal,
    };
    RpcResponse::error(code, err.to_string())
}
