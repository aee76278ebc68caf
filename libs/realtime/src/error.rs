//! Realtime Layer Error Types
//!
//! Error taxonomy for the connection layer: protocol violations, timeouts,
//! resource exhaustion, and security rejections each get a distinct variant
//! so callers can branch on failure class rather than string-match.

use crate::ConnectionId;
use thiserror::Error;

/// Main error type for the realtime connection layer
#[derive(Error, Debug)]
pub enum RealtimeError {
    /// Connection-level errors (unknown id, closed socket, send failure)
    #[error("Connection error: {message} (connection: {connection_id:?})")]
    Connection {
        message: String,
        connection_id: Option<ConnectionId>,
    },

    /// Malformed frames, invalid envelopes, unknown actions
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// An awaited operation exceeded its deadline
    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Per-connection rate limit exceeded
    #[error("Rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// A bounded resource is at capacity
    #[error("Resource exhausted: {resource}: {message}")]
    ResourceExhausted { resource: String, message: String },

    /// Token validation or connection-accounting rejections
    #[error("Security error: {message}")]
    Security { message: String },

    /// Compression/decompression failures (internal; encode paths fall back)
    #[error("Compression error: {message}")]
    Compression { message: String },

    /// The peer answered a request with an error response
    #[error("Remote error: {message}")]
    Remote { message: String },

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for realtime operations
pub type Result<T> = std::result::Result<T, RealtimeError>;

impl RealtimeError {
    /// Create a connection error
    pub fn connection(message: impl Into<String>, connection_id: Option<ConnectionId>) -> Self {
        Self::Connection {
            message: message.into(),
            connection_id,
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Create a security error
    pub fn security(message: impl Into<String>) -> Self {
        Self::Security {
            message: message.into(),
        }
    }

    /// Create a compression error
    pub fn compression(message: impl Into<String>) -> Self {
        Self::Compression {
            message: message.into(),
        }
    }

    /// Create a remote error from a peer's error response payload
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    /// Check if this error class is worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            RealtimeError::Connection { .. } => true,
            RealtimeError::Timeout { .. } => true,
            RealtimeError::RateLimited { .. } => true,
            RealtimeError::ResourceExhausted { .. } => true,
            RealtimeError::Io(_) => true,
            RealtimeError::Protocol { .. } => false,
            RealtimeError::Security { .. } => false,
            RealtimeError::Compression { .. } => false,
            RealtimeError::Remote { .. } => false,
        }
    }

    /// Error category label for metrics
    pub fn category(&self) -> &'static str {
        match self {
            RealtimeError::Connection { .. } => "connection",
            RealtimeError::Protocol { .. } => "protocol",
            RealtimeError::Timeout { .. } => "timeout",
            RealtimeError::RateLimited { .. } => "rate_limited",
            RealtimeError::ResourceExhausted { .. } => "resource_exhausted",
            RealtimeError::Security { .. } => "security",
            RealtimeError::Compression { .. } => "compression",
            RealtimeError::Remote { .. } => "remote",
            RealtimeError::Io(_) => "io",
        }
    }
}
