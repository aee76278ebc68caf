//! Queue Message Records

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Priority class. Dequeue order is strict: every high-priority message
/// drains before any medium one, and so on. No fairness or weighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// All priorities in dequeue order
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work as stored in a priority list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub id: Uuid,
    pub payload: Value,
    pub priority: Priority,
    pub enqueued_at_ms: u64,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl QueueMessage {
    pub fn new(payload: Value, priority: Priority, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            priority,
            enqueued_at_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            retry_count: 0,
            max_retries,
        }
    }

    /// Whether another retry is allowed after a failure
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_order() {
        assert_eq!(
            Priority::ALL,
            [Priority::High, Priority::Medium, Priority::Low]
        );
    }

    #[test]
    fn test_message_serde_shape() {
        let msg = QueueMessage::new(json!({"task": "resize"}), Priority::High, 3);
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["priority"], "high");
        assert_eq!(value["retryCount"], 0);
        assert_eq!(value["maxRetries"], 3);
        assert!(value["enqueuedAtMs"].is_u64());
    }

    #[test]
    fn test_can_retry() {
        let mut msg = QueueMessage::new(json!({}), Priority::Low, 2);
        assert!(msg.can_retry());
        msg.retry_count = 2;
        assert!(!msg.can_retry());
    }
}
