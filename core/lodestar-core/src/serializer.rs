//! Pluggable message-body serialization.
//!
//! The wire protocol reserves a codec byte per message; only JSON (0) ships
//! with the framework. Alternative codecs implement [`BodyCodec`] and must be
//! symmetric: `decode(encode(x)) = x` for every supported body shape.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::protocol::CODEC_JSON;

/// A symmetric, deterministic body codec.
pub trait BodyCodec: Send + Sync {
    /// The codec byte this implementation answers to.
    fn codec_byte(&self) -> u8;

    fn encode_value(&self, value: &Value) -> CoreResult<Vec<u8>>;

    fn decode_value(&self, bytes: &[u8]) -> CoreResult<Value>;
}

/// Encode a typed body through a codec.
pub fn encode_body<T: Serialize>(codec: &dyn BodyCodec, body: &T) -> CoreResult<Vec<u8>> {
    let value = serde_json::to_value(body)?;
    codec.encode_value(&value)
}

/// Decode a typed body through a codec.
pub fn decode_body<T: DeserializeOwned>(codec: &dyn BodyCodec, bytes: &[u8]) -> CoreResult<T> {
    let value = codec.decode_value(bytes)?;
    serde_json::from_value(value).map_err(|e| CoreError::Serialization(e.to_string()))
}

/// The default codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl BodyCodec for JsonCodec {
    fn codec_byte(&self) -> u8 {
        CODEC_JSON
    }

    fn encode_value(&self, value: &Value) -> CoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode_value(&self, bytes: &[u8]) -> CoreResult<Value> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BeginRequest, RpcResponse};

    #[test]
    fn json_codec_round_trips_request_bodies() {
        let codec = JsonCodec;
        let body = BeginRequest {
            application_id: "svc".into(),
            transaction_name: "order-pay".into(),
            timeout_ms: 10_000,
        };
        let bytes = encode_body(&codec, &body).unwrap();
        let back: BeginRequest = decode_body(&codec, &bytes).unwrap();
        assert_eq!(back, body);
    }

    #[test]
    fn json_codec_round_trips_responses() {
        let codec = JsonCodec;
        let body = RpcResponse::ok().with_xid("svc:1:1").with_branch_id(1001);
        let bytes = encode_body(&codec, &body).unwrap();
        let back: RpcResponse = decode_body(&codec, &bytes).unwrap();
        assert_eq!(back, body);
    }

    #[test]
    fn malformed_bytes_are_a_serialization_error() {
        let codec = JsonCodec;
        assert!(decode_body::<RpcResponse>(&codec, b"{not json").is_err());
    }
}
