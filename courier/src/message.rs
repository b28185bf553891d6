/// Message module for the courier delivery service
///
/// Defines the delivery request carried on a service topic and the JSON codec used
/// on both sides of the broker: the submission API encodes, the dispatcher decodes.
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire name of the only supported request kind.
pub const KIND_HTTP_GET: &str = "httpget";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    #[serde(rename = "httpget", alias = "http-get")]
    HttpGet,
}

/// A decoded delivery request: fetch `target` with the given `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRequest {
    #[serde(rename = "type")]
    pub kind: RequestKind,
    #[serde(rename = "http_request")]
    pub target: String,
}

impl DeliveryRequest {
    pub fn http_get(target: impl Into<String>) -> Self {
        Self {
            kind: RequestKind::HttpGet,
            target: target.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unable to decode message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("message has an empty http_request")]
    EmptyTarget,
}

#[derive(Debug, Error)]
#[error("unable to encode message: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

pub trait Decoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<DeliveryRequest, DecodeError>;
}

pub trait Encoder: Send + Sync {
    fn encode(&self, request: &DeliveryRequest) -> Result<Vec<u8>, EncodeError>;
}

/// JSON envelope codec: `{"type": "httpget", "http_request": "<url>"}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Decoder for JsonCodec {
    fn decode(&self, bytes: &[u8]) -> Result<DeliveryRequest, DecodeError> {
        let request: DeliveryRequest = serde_json::from_slice(bytes)?;
        if request.target.is_empty() {
            return Err(DecodeError::EmptyTarget);
        }
        Ok(request)
    }
}

impl Encoder for JsonCodec {
    fn encode(&self, request: &DeliveryRequest) -> Result<Vec<u8>, EncodeError> {
        Ok(serde_json::to_vec(request)?)
    }
}
