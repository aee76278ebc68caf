//! Cluster Error Types

use thiserror::Error;
use workqueue::QueueError;

/// Errors surfaced by the load balancer and cluster membership layer
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Selection was requested with no active node in the pool
    #[error("No available nodes")]
    NoAvailableNodes,

    /// An operation referenced a node id not in the pool
    #[error("Unknown node: {id}")]
    UnknownNode { id: String },

    /// A health probe could not be executed at all
    #[error("Probe error: {message}")]
    Probe { message: String },

    /// Pub/sub bus failure
    #[error("Bus error: {0}")]
    Bus(#[from] QueueError),

    /// A cluster wire message failed to encode or decode
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for cluster operations
pub type Result<T> = std::result::Result<T, ClusterError>;

impl ClusterError {
    /// Create a probe error
    pub fn probe(message: impl Into<String>) -> Self {
        Self::Probe {
            message: message.into(),
        }
    }

    pub fn unknown_node(id: impl Into<String>) -> Self {
        Self::UnknownNode { id: id.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            ClusterError::unknown_node("node-3").to_string(),
            "Unknown node: node-3"
        );
        assert_eq!(
            ClusterError::NoAvailableNodes.to_string(),
            "No available nodes"
        );
    }
}
