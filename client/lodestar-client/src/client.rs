//! The TC client connection.
//!
//! One TCP connection, one writer task fed by a channel, one reader task
//! completing pending requests by message id. Every call carries a deadline
//! (default 5 s); an expired slot is removed and the caller sees a timeout.
//! When the connection drops, every pending request fails fast and
//! [`TcClient::reconnect`] re-establishes the link.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use lodestar_core::config::ClientConfig;
use lodestar_core::model::{BranchStatus, GlobalStatus};
use lodestar_core::protocol::{
    decode_frame, encode_frame, BeginRequest, BranchRegisterRequest, BranchReportRequest,
    MessageType, ResultCode, RpcMessage, RpcResponse, XidRequest,
};
use lodestar_core::{CoreError, CoreResult, NetworkErrorKind};

type PendingSlot = oneshot::Sender<CoreResult<RpcMessage>>;

struct ClientInner {
    address: String,
    config: ClientConfig,
    pending: DashMap<u32, PendingSlot>,
    ids: AtomicU32,
    sender: RwLock<Option<mpsc::Sender<RpcMessage>>>,
}

impl ClientInner {
    fn fail_all_pending(&self, reason: &str) {
        let ids: Vec<u32> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, slot)) = self.pending.remove(&id) {
                let _ = slot.send(Err(CoreError::network(
                    NetworkErrorKind::ConnectionReset,
                    reason.to_string(),
                )));
            }
        }
    }
}

/// Client connection to the transaction coordinator.
#[derive(Clone)]
pub struct TcClient {
    inner: Arc<ClientInner>,
}

impl TcClient {
    /// Connect to the TC at `host:port`.
    pub async fn connect(address: impl Into<String>, config: ClientConfig) -> CoreResult<Self> {
        let client = Self {
            inner: Arc::new(ClientInner {
                address: address.into(),
                config,
                pending: DashMap::new(),
                ids: AtomicU32::new(1),
                sender: RwLock::new(None),
            }),
        };
        client.establish().await?;
        Ok(client)
    }

    async fn establish(&self) -> CoreResult<()> {
        let inner = &self.inner;
        let connect = TcpStream::connect(inner.address.as_str());
        let stream = tokio::time::timeout(Duration::from_millis(inner.config.connect_timeout_ms), connect)
            .await
            .map_err(|_| {
                CoreError::network(
                    NetworkErrorKind::ConnectionTimeout,
                    format!("connect to {} timed out", inner.address),
                )
            })??;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let (sender, mut outbox) = mpsc::channel::<RpcMessage>(64);
        *inner.sender.write() = Some(sender);

        tokio::spawn(async move {
            let mut out = BytesMut::new();
            while let Some(message) = outbox.recv().await {
                out.clear();
                if encode_frame(&message, &mut out).is_err() {
                    continue;
                }
                if writer.write_all(&out).await.is_err() {
                    return;
                }
            }
        });

        let reader_inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(4 * 1024);
            loop {
                match decode_frame(&mut buf) {
                    Ok(Some(message)) => {
                        match reader_inner.pending.remove(&message.id) {
                            Some((_, slot)) => {
                                let _ = slot.send(Ok(message));
                            }
                            None => {
                                warn!(id = message.id, "response for unknown message id");
                            }
                        }
                        continue;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(%err, "protocol violation from TC, closing connection");
                        break;
                    }
                }
                match reader.read_buf(&mut buf).await {
                    Ok(0) => {
                        debug!("TC closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(%err, "read from TC failed");
                        break;
                    }
                }
            }
            *reader_inner.sender.write() = None;
            reader_inner.fail_all_pending("connection to TC lost");
        });

        debug!(address = %inner.address, "connected to TC");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.sender.read().is_some()
    }

    /// Re-establish the connection if it is down.
    pub async fn reconnect(&self) -> CoreResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.establish().await
    }

    /// Drop the connection; pending requests fail.
    pub fn close(&self) {
        *self.inner.sender.write() = None;
        self.inner.fail_all_pending("client closed");
    }

    async fn request<T: Serialize>(&self, message_type: MessageType, body: &T) -> CoreResult<RpcResponse> {
        let id = self.inner.ids.fetch_add(1, Ordering::Relaxed);
        let message = RpcMessage::request(id, message_type, body)?;

        let sender = self.inner.sender.read().clone().ok_or_else(|| {
            CoreError::network(NetworkErrorKind::ConnectionReset, "not connected to TC")
        })?;

        let (slot, response) = oneshot::channel();
        self.inner.pending.insert(id, slot);

        if sender.send(message).await.is_err() {
            self.inner.pending.remove(&id);
            return Err(CoreError::network(
                NetworkErrorKind::ConnectionReset,
                "connection to TC lost",
            ));
        }

        let deadline = Duration::from_millis(self.inner.config.request_timeout_ms);
        match tokio::time::timeout(deadline, response).await {
            Ok(Ok(result)) => {
                let message = result?;
                let response: RpcResponse = message.decode_body()?;
                into_result(response)
            }
            Ok(Err(_)) => Err(CoreError::network(
                NetworkErrorKind::ConnectionReset,
                "connection to TC lost",
            )),
            Err(_) => {
                self.inner.pending.remove(&id);
                Err(CoreError::Timeout(deadline))
            }
        }
    }

    /// Begin a global transaction; returns the xid the TC allocated.
    pub async fn begin_global_transaction(
        &self,
        application_id: &str,
        transaction_name: &str,
        timeout_ms: i64,
    ) -> CoreResult<String> {
        let response = self
            .request(
                MessageType::GlobalBegin,
                &BeginRequest {
                    application_id: application_id.to_string(),
                    transaction_name: transaction_name.to_string(),
                    timeout_ms,
                },
            )
            .await?;
        response
            .xid
            .ok_or_else(|| CoreError::Protocol("begin response without xid".into()))
    }

    pub async fn commit_global_transaction(&self, xid: &str) -> CoreResult<GlobalStatus> {
        let response = self
            .request(MessageType::GlobalCommit, &XidRequest { xid: xid.to_string() })
            .await?;
        response
            .status
            .ok_or_else(|| CoreError::Protocol("commit response without status".into()))
    }

    pub async fn rollback_global_transaction(&self, xid: &str) -> CoreResult<GlobalStatus> {
        let response = self
            .request(MessageType::GlobalRollback, &XidRequest { xid: xid.to_string() })
            .await?;
        response
            .status
            .ok_or_else(|| CoreError::Protocol("rollback response without status".into()))
    }

    pub async fn global_status(&self, xid: &str) -> CoreResult<GlobalStatus> {
        let response = self
            .request(MessageType::GlobalStatus, &XidRequest { xid: xid.to_string() })
            .await?;
        response
            .status
            .ok_or_else(|| CoreError::Protocol("status response without status".into()))
    }

    /// Register a branch; returns the branch id the TC allocated.
    pub async fn register_branch(&self, request: BranchRegisterRequest) -> CoreResult<i64> {
        let response = self.request(MessageType::BranchRegister, &request).await?;
        response
            .branch_id
            .ok_or_else(|| CoreError::Protocol("register response without branch id".into()))
    }

    pub async fn report_branch_status(&self, branch_id: i64, status: BranchStatus) -> CoreResult<()> {
        self.request(MessageType::BranchStatusReport, &BranchReportRequest { branch_id, status })
            .await?;
        Ok(())
    }
}

/// Translate a `Result` body into the error taxonomy.
fn into_result(response: RpcResponse) -> CoreResult<RpcResponse> {
    let message = response.message.clone().unwrap_or_default();
    match response.code {
        ResultCode::Ok => Ok(response),
        ResultCode::GlobalNotFound => Err(CoreError::GlobalNotFound(
            response.xid.clone().unwrap_or(message),
        )),
        ResultCode::GlobalNotActive => Err(CoreError::GlobalNotActive {
            xid: response.xid.clone().unwrap_or_default(),
            status: message,
        }),
        ResultCode::LockConflict => Err(CoreError::LockConflict { row_key: message }),
        ResultCode::Internal => Err(CoreError::Internal(message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn result_codes_map_onto_errors() {
        assert!(into_result(RpcResponse::ok()).is_ok());
        assert!(matches!(
            into_result(RpcResponse::error(ResultCode::GlobalNotFound, "missing")),
            Err(CoreError::GlobalNotFound(_))
        ));
        assert!(matches!(
            into_result(RpcResponse::error(ResultCode::GlobalNotActive, "Committed")),
            Err(CoreError::GlobalNotActive { .. })
        ));
        assert!(matches!(
            into_result(RpcResponse::error(ResultCode::LockConflict, "db:account:1")),
            Err(CoreError::LockConflict { .. })
        ));
        assert!(matches!(
            into_result(RpcResponse::error(ResultCode::Internal, "boom")),
            Err(CoreError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn connect_to_nowhere_fails() {
        // Port 1 is essentially never listening.
        let result = TcClient::connect("127.0.0.1:1", ClientConfig::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn silent_server_times_the_request_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and then say nothing.
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let config = ClientConfig {
            request_timeout_ms: 50,
            ..Default::default()
        };
        let client = TcClient::connect(addr.to_string(), config).await.unwrap();
        let err = client.global_status("svc:1:1").await.unwrap_err();
        assert!(err.is_timeout());
        assert!(client.inner.pending.is_empty(), "expired slot is removed");
    }

    #[tokio::test]
    async fn close_fails_pending_and_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = TcClient::connect(addr.to_string(), ClientConfig::default()).await.unwrap();
        assert!(client.is_connected());
        client.close();
        assert!(!client.is_connected());

        let err = client.global_status("svc:1:1").await.unwrap_err();
        assert!(matches!(err, CoreError::Network { .. }));
    }
}
