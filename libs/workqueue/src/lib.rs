//! Durable Priority Work Queue
//!
//! At-least-once background processing over an external list store, with
//! strict priority ordering, bounded concurrency, fixed-delay retries, and
//! edge-triggered backpressure events. The [`store`] module also hosts the
//! pub/sub bus abstraction shared with the cluster layer.

pub mod error;
pub mod message;
pub mod queue;
pub mod store;

pub use error::{QueueError, Result};
pub use message::{Priority, QueueMessage};
pub use queue::{
    MessageListener, MessageQueue, QueueConfig, QueueEvent, QueueSizes, QueueStats,
};
pub use store::{ListStore, MemoryBus, MemoryStore, PubSubBus};
