//! Store Abstractions
//!
//! The queue and cluster layers talk to their backing store through two
//! narrow traits: an ordered list per name, and a fire-and-forget pub/sub
//! bus. The external store is the single source of truth for queue
//! contents; in-memory implementations here back tests and single-process
//! deployments.

use crate::{QueueError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::sync::broadcast;

/// Ordered lists keyed by name. `push` appends at the tail, `pop` takes
/// from the head.
#[async_trait]
pub trait ListStore: Send + Sync {
    async fn push(&self, list: &str, item: Vec<u8>) -> Result<()>;
    async fn pop(&self, list: &str) -> Result<Option<Vec<u8>>>;
    async fn len(&self, list: &str) -> Result<usize>;
    async fn clear(&self, list: &str) -> Result<()>;
}

/// Fire-and-forget pub/sub channels. No replay, no acknowledgement:
/// subscribers only see messages published while subscribed.
#[async_trait]
pub trait PubSubBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()>;
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Vec<u8>>;
}

/// In-process `ListStore`
#[derive(Debug, Default)]
pub struct MemoryStore {
    lists: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ListStore for MemoryStore {
    async fn push(&self, list: &str, item: Vec<u8>) -> Result<()> {
        self.lists
            .lock()
            .entry(list.to_string())
            .or_default()
            .push_back(item);
        Ok(())
    }

    async fn pop(&self, list: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .lists
            .lock()
            .get_mut(list)
            .and_then(|l| l.pop_front()))
    }

    async fn len(&self, list: &str) -> Result<usize> {
        Ok(self.lists.lock().get(list).map(|l| l.len()).unwrap_or(0))
    }

    async fn clear(&self, list: &str) -> Result<()> {
        self.lists.lock().remove(list);
        Ok(())
    }
}

const BUS_CAPACITY: usize = 256;

/// In-process `PubSubBus` over tokio broadcast channels
#[derive(Debug, Default)]
pub struct MemoryBus {
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(BUS_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl PubSubBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        // No subscribers is not an error for fire-and-forget pub/sub
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Vec<u8>> {
        self.sender(channel).subscribe()
    }
}

impl From<broadcast::error::RecvError> for QueueError {
    fn from(e: broadcast::error::RecvError) -> Self {
        QueueError::store(format!("Bus receive failed: {}", e))
    }
}
