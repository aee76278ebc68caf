//! Queue Error Types

use thiserror::Error;

/// Errors surfaced by the work queue and its store abstractions
#[derive(Error, Debug)]
pub enum QueueError {
    /// Total queued size across all priorities is at the configured cap
    #[error("queue is full")]
    Full,

    /// The queue has been stopped and no longer accepts work
    #[error("Queue is stopped")]
    Stopped,

    /// Backing store failure (connection, protocol, capacity)
    #[error("Store error: {message}")]
    Store { message: String },

    /// A stored message failed to encode or decode
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

impl QueueError {
    /// Create a store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Whether the operation is worth retrying later
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Full | QueueError::Store { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_message_is_stable() {
        assert_eq!(QueueError::Full.to_string(), "queue is full");
    }

    #[test]
    fn test_retryable() {
        assert!(QueueError::Full.is_retryable());
        assert!(QueueError::store("down").is_retryable());
        assert!(!QueueError::Stopped.is_retryable());
    }
}
