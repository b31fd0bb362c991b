//! Binary RPC protocol between TM/RM clients and the transaction coordinator.
//!
//! Every message is a 12-byte header followed by a serialized body:
//!
//! | offset | size | field        |
//! |--------|------|--------------|
//! | 0      | 2    | magic 0xCAFE |
//! | 2      | 1    | version      |
//! | 3      | 1    | message type |
//! | 4      | 4    | message id   |
//! | 8      | 4    | body length  |
//!
//! All integers are big-endian; strings inside bodies are UTF-8. A magic or
//! version mismatch, an unknown message type or an oversized body is a
//! [`CoreError::Wire`] and the connection is closed by the peer that
//! detected it.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::model::{BranchStatus, BranchType, GlobalStatus};

/// Protocol magic, first two bytes of every frame.
pub const MAGIC: u16 = 0xCAFE;
/// Current protocol version. Peers reject anything newer.
pub const VERSION: u8 = 1;
/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 12;
/// Upper bound on a body; larger frames are treated as a framing error.
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Codec byte for the default JSON body serialization.
pub const CODEC_JSON: u8 = 0;
/// Compression byte for uncompressed bodies.
pub const COMPRESS_NONE: u8 = 0;

/// Message types understood by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    GlobalBegin = 10,
    GlobalCommit = 11,
    GlobalRollback = 12,
    GlobalStatus = 13,
    BranchRegister = 20,
    BranchStatusReport = 21,
    Result = 100,
}

impl MessageType {
    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            10 => MessageType::GlobalBegin,
            11 => MessageType::GlobalCommit,
            12 => MessageType::GlobalRollback,
            13 => MessageType::GlobalStatus,
            20 => MessageType::BranchRegister,
            21 => MessageType::BranchStatusReport,
            100 => MessageType::Result,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A wire-level request or response.
///
/// `codec` and `compress` describe the body encoding; only JSON (0) and
/// uncompressed (0) are built in, anything else fails at encode time.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcMessage {
    pub id: u32,
    pub message_type: MessageType,
    pub codec: u8,
    pub compress: u8,
    pub body: Vec<u8>,
}

impl RpcMessage {
    pub fn new(id: u32, message_type: MessageType, body: Vec<u8>) -> Self {
        Self {
            id,
            message_type,
            codec: CODEC_JSON,
            compress: COMPRESS_NONE,
            body,
        }
    }

    /// Serialize a typed body and wrap it in a message.
    pub fn request<T: Serialize>(id: u32, message_type: MessageType, body: &T) -> CoreResult<Self> {
        Ok(Self::new(id, message_type, serde_json::to_vec(body)?))
    }

    /// A `Result` message echoing the request id.
    pub fn response(request_id: u32, body: &RpcResponse) -> CoreResult<Self> {
        Ok(Self::new(request_id, MessageType::Result, serde_json::to_vec(body)?))
    }

    /// Deserialize the body into a typed value.
    pub fn decode_body<'a, T: Deserialize<'a>>(&'a self) -> CoreResult<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| CoreError::Protocol(format!("malformed {:?} body: {e}", self.message_type)))
    }
}

/// Append one encoded frame to `dst`.
pub fn encode_frame(message: &RpcMessage, dst: &mut BytesMut) -> CoreResult<()> {
    if message.codec != CODEC_JSON || message.compress != COMPRESS_NONE {
        return Err(CoreError::Protocol(format!(
            "unsupported codec/compress: {}/{}",
            message.codec, message.compress
        )));
    }
    if message.body.len() > MAX_BODY_BYTES {
        return Err(CoreError::Wire(format!("body too large: {} bytes", message.body.len())));
    }
    dst.reserve(HEADER_LEN + message.body.len());
    dst.put_u16(MAGIC);
    dst.put_u8(VERSION);
    dst.put_u8(message.message_type.as_u8());
    dst.put_u32(message.id);
    dst.put_u32(message.body.len() as u32);
    dst.put_slice(&message.body);
    Ok(())
}

/// Try to decode one frame from the front of `src`.
///
/// Returns `Ok(None)` until a complete frame is buffered; bytes are only
/// consumed once a full frame is available. Errors are fatal for the
/// connection.
pub fn decode_frame(src: &mut BytesMut) -> CoreResult<Option<RpcMessage>> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }

    // Peek the header without consuming so a partial body leaves src intact.
    let mut header = &src[..HEADER_LEN];
    let magic = header.get_u16();
    if magic != MAGIC {
        return Err(CoreError::Wire(format!("invalid magic: {magic:#06x}")));
    }
    let version = header.get_u8();
    if version > VERSION {
        return Err(CoreError::Wire(format!("unsupported protocol version: {version}")));
    }
    let type_code = header.get_u8();
    let message_type = MessageType::from_u8(type_code)
        .ok_or_else(|| CoreError::Wire(format!("unknown message type: {type_code}")))?;
    let id = header.get_u32();
    let body_len = header.get_u32() as usize;
    if body_len > MAX_BODY_BYTES {
        return Err(CoreError::Wire(format!("body too large: {body_len} bytes")));
    }

    if src.len() < HEADER_LEN + body_len {
        return Ok(None);
    }

    src.advance(HEADER_LEN);
    let body = src.split_to(body_len).to_vec();
    Ok(Some(RpcMessage::new(id, message_type, body)))
}

/// Result codes carried in [`RpcResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    Ok,
    GlobalNotFound,
    GlobalNotActive,
    LockConflict,
    Internal,
}

/// Body of a `GlobalBegin` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeginRequest {
    pub application_id: String,
    pub transaction_name: String,
    pub timeout_ms: i64,
}

/// Body of `GlobalCommit`, `GlobalRollback` and `GlobalStatus` requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XidRequest {
    pub xid: String,
}

/// Body of a `BranchRegister` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchRegisterRequest {
    pub xid: String,
    pub resource_group_id: String,
    pub resource_id: String,
    pub branch_type: BranchType,
    pub lock_key: Option<String>,
    pub application_data: Option<String>,
}

/// Body of a `BranchStatusReport` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchReportRequest {
    pub branch_id: i64,
    pub status: BranchStatus,
}

/// Body of every `Result` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub code: ResultCode,
    pub message: Option<String>,
    pub xid: Option<String>,
    pub branch_id: Option<i64>,
    pub status: Option<GlobalStatus>,
}

impl RpcResponse {
    pub fn ok() -> Self {
        Self {
            code: ResultCode::Ok,
            message: None,
            xid: None,
            branch_id: None,
            status: None,
        }
    }

    pub fn error(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
            xid: None,
            branch_id: None,
            status: None,
        }
    }

    pub fn with_xid(mut self, xid: impl Into<String>) -> Self {
        self.xid = Some(xid.into());
        self
    }

    pub fn with_branch_id(mut self, branch_id: i64) -> Self {
        self.branch_id = Some(branch_id);
        self
    }

    pub fn with_status(mut self, status: GlobalStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code == ResultCode::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: &RpcMessage) -> RpcMessage {
        let mut buf = BytesMut::new();
        encode_frame(message, &mut buf).unwrap();
        let decoded = decode_frame(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty(), "decode must consume the full frame");
        decoded
    }

    #[test]
    fn begin_request_round_trips() {
        let body = BeginRequest {
            application_id: "svc".into(),
            transaction_name: "order-pay".into(),
            timeout_ms: 10_000,
        };
        let message = RpcMessage::request(7, MessageType::GlobalBegin, &body).unwrap();
        let decoded = round_trip(&message);
        assert_eq!(decoded, message);
        assert_eq!(decoded.decode_body::<BeginRequest>().unwrap(), body);
    }

    #[test]
    fn every_message_type_round_trips() {
        let bodies: Vec<(MessageType, Vec<u8>)> = vec![
            (
                MessageType::GlobalBegin,
                serde_json::to_vec(&BeginRequest {
                    application_id: "app".into(),
                    transaction_name: "t".into(),
                    timeout_ms: 60_000,
                })
                .unwrap(),
            ),
            (
                MessageType::GlobalCommit,
                serde_json::to_vec(&XidRequest { xid: "app:1:1".into() }).unwrap(),
            ),
            (
                MessageType::GlobalRollback,
                serde_json::to_vec(&XidRequest { xid: "app:1:2".into() }).unwrap(),
            ),
            (
                MessageType::GlobalStatus,
                serde_json::to_vec(&XidRequest { xid: "app:1:3".into() }).unwrap(),
            ),
            (
                MessageType::BranchRegister,
                serde_json::to_vec(&BranchRegisterRequest {
                    xid: "app:1:1".into(),
                    resource_group_id: "default".into(),
                    resource_id: "sqlite:orders".into(),
                    branch_type: BranchType::At,
                    lock_key: Some("account:1".into()),
                    application_data: None,
                })
                .unwrap(),
            ),
            (
                MessageType::BranchStatusReport,
                serde_json::to_vec(&BranchReportRequest {
                    branch_id: 1001,
                    status: BranchStatus::PhaseOneDone,
                })
                .unwrap(),
            ),
            (
                MessageType::Result,
                serde_json::to_vec(&RpcResponse::ok().with_xid("app:1:1")).unwrap(),
            ),
        ];

        for (idx, (message_type, body)) in bodies.into_iter().enumerate() {
            let message = RpcMessage::new(idx as u32, message_type, body);
            assert_eq!(round_trip(&message), message);
        }
    }

    #[test]
    fn empty_body_is_allowed() {
        let message = RpcMessage::new(1, MessageType::GlobalStatus, Vec::new());
        assert_eq!(round_trip(&message), message);
    }

    #[test]
    fn decode_is_incremental_across_split_buffers() {
        let body = XidRequest { xid: "svc:1700000000000:1".into() };
        let message = RpcMessage::request(42, MessageType::GlobalCommit, &body).unwrap();
        let mut encoded = BytesMut::new();
        encode_frame(&message, &mut encoded).unwrap();

        let mut buf = BytesMut::new();
        // Feed one byte at a time; decode must return None until complete.
        let total = encoded.len();
        for (fed, byte) in encoded.iter().enumerate() {
            buf.put_u8(*byte);
            let result = decode_frame(&mut buf).unwrap();
            if fed + 1 < total {
                assert!(result.is_none(), "incomplete frame after {} bytes", fed + 1);
            } else {
                assert_eq!(result.unwrap(), message);
            }
        }
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let first = RpcMessage::request(1, MessageType::GlobalStatus, &XidRequest { xid: "a:1:1".into() }).unwrap();
        let second = RpcMessage::request(2, MessageType::GlobalStatus, &XidRequest { xid: "a:1:2".into() }).unwrap();
        let mut buf = BytesMut::new();
        encode_frame(&first, &mut buf).unwrap();
        encode_frame(&second, &mut buf).unwrap();

        assert_eq!(decode_frame(&mut buf).unwrap().unwrap(), first);
        assert_eq!(decode_frame(&mut buf).unwrap().unwrap(), second);
        assert!(decode_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn bad_magic_is_a_wire_error() {
        let mut buf = BytesMut::new();
        buf.put_u16(0xDEAD);
        buf.put_u8(VERSION);
        buf.put_u8(MessageType::GlobalBegin.as_u8());
        buf.put_u32(1);
        buf.put_u32(0);
        assert!(matches!(decode_frame(&mut buf), Err(CoreError::Wire(_))));
    }

    #[test]
    fn newer_version_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(MAGIC);
        buf.put_u8(VERSION + 1);
        buf.put_u8(MessageType::GlobalBegin.as_u8());
        buf.put_u32(1);
        buf.put_u32(0);
        assert!(matches!(decode_frame(&mut buf), Err(CoreError::Wire(_))));
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(55);
        buf.put_u32(1);
        buf.put_u32(0);
        assert!(matches!(decode_frame(&mut buf), Err(CoreError::Wire(_))));
    }

    #[test]
    fn oversized_body_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(MessageType::GlobalBegin.as_u8());
        buf.put_u32(1);
        buf.put_u32((MAX_BODY_BYTES + 1) as u32);
        assert!(matches!(decode_frame(&mut buf), Err(CoreError::Wire(_))));
    }

    #[test]
    fn non_default_codec_fails_encode() {
        let mut message = RpcMessage::new(1, MessageType::GlobalBegin, Vec::new());
        message.codec = 1;
        let mut buf = BytesMut::new();
        assert!(matches!(encode_frame(&message, &mut buf), Err(CoreError::Protocol(_))));
    }
}
