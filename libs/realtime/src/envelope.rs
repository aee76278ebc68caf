//! Wire Message Envelope
//!
//! JSON wire protocol for the connection layer. Every frame is one envelope:
//! a tagged union of request/response/notification sharing a correlation id
//! and an epoch-millisecond timestamp.
//!
//! ## Frame format
//!
//! Frames are UTF-8 JSON, optionally lz4-compressed above a size threshold.
//! A plain frame always begins with `{`; a compressed frame begins with the
//! zero marker byte followed by an lz4 block with prepended size (the raw
//! size prefix alone would be ambiguous, since its low byte can be `{`).
//! Encoding only compresses when the result is actually smaller, so small
//! or incompressible payloads go out as-is.

use crate::compression::Compressor;
use crate::{epoch_millis, RealtimeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Response status carried by `response` envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Wire envelope, tagged by `type`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Request {
        #[serde(rename = "correlationId")]
        correlation_id: Uuid,
        timestamp: u64,
        action: String,
        payload: Value,
    },
    Response {
        #[serde(rename = "correlationId")]
        correlation_id: Uuid,
        timestamp: u64,
        status: ResponseStatus,
        payload: Value,
        /// Retry hint in milliseconds, set only on rate-limit rejections
        #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
        retry_after: Option<u64>,
    },
    Notification {
        #[serde(rename = "correlationId")]
        correlation_id: Uuid,
        timestamp: u64,
        event: String,
        payload: Value,
    },
}

impl Envelope {
    /// Create a request envelope with a fresh correlation id
    pub fn request(action: impl Into<String>, payload: Value) -> Self {
        Envelope::Request {
            correlation_id: Uuid::new_v4(),
            timestamp: epoch_millis(),
            action: action.into(),
            payload,
        }
    }

    /// Create a success response correlated to an earlier request
    pub fn success(correlation_id: Uuid, payload: Value) -> Self {
        Envelope::Response {
            correlation_id,
            timestamp: epoch_millis(),
            status: ResponseStatus::Success,
            payload,
            retry_after: None,
        }
    }

    /// Create an error response; the payload is a human-readable message
    pub fn error(correlation_id: Uuid, message: impl Into<String>) -> Self {
        Envelope::Response {
            correlation_id,
            timestamp: epoch_millis(),
            status: ResponseStatus::Error,
            payload: Value::String(message.into()),
            retry_after: None,
        }
    }

    /// Create a rate-limit error response with a retry-after hint
    pub fn rate_limited(correlation_id: Uuid, retry_after_ms: u64) -> Self {
        Envelope::Response {
            correlation_id,
            timestamp: epoch_millis(),
            status: ResponseStatus::Error,
            payload: Value::String("Rate limit exceeded".to_string()),
            retry_after: Some(retry_after_ms),
        }
    }

    /// Create a notification envelope
    pub fn notification(event: impl Into<String>, payload: Value) -> Self {
        Envelope::Notification {
            correlation_id: Uuid::new_v4(),
            timestamp: epoch_millis(),
            event: event.into(),
            payload,
        }
    }

    /// Correlation id shared by all variants
    pub fn correlation_id(&self) -> Uuid {
        match self {
            Envelope::Request { correlation_id, .. }
            | Envelope::Response { correlation_id, .. }
            | Envelope::Notification { correlation_id, .. } => *correlation_id,
        }
    }

    /// Envelope timestamp in epoch milliseconds
    pub fn timestamp(&self) -> u64 {
        match self {
            Envelope::Request { timestamp, .. }
            | Envelope::Response { timestamp, .. }
            | Envelope::Notification { timestamp, .. } => *timestamp,
        }
    }

    /// Serialize to a wire frame, compressing large frames best-effort
    pub fn encode(&self, compressor: &Compressor) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)
            .map_err(|e| RealtimeError::protocol(format!("Envelope serialization failed: {}", e)))?;
        Ok(compressor.maybe_compress(json))
    }

    /// Parse a wire frame, transparently decompressing compressed frames
    pub fn decode(data: &[u8], compressor: &Compressor) -> Result<Self> {
        if data.is_empty() {
            return Err(RealtimeError::protocol("Empty frame"));
        }

        let json;
        let bytes: &[u8] = if data[0] == b'{' {
            data
        } else {
            json = compressor.decompress(data)?;
            &json
        };

        serde_json::from_slice(bytes)
            .map_err(|_| RealtimeError::protocol("Invalid message format"))
    }
}
