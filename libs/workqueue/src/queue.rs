//! Priority Work Queue
//!
//! Durable, at-least-once work queue over a [`ListStore`], one list per
//! priority class. The store is the single source of truth for queued
//! items; the only in-memory state is the in-flight set, so multiple
//! process instances can safely share one logical queue.
//!
//! Listeners are observers, not a consumer group: every registered listener
//! runs (awaited) for every dequeued message, and any listener error or a
//! processing timeout fails the whole message. Failed messages retry after
//! a fixed delay at the tail of their original priority list, then emit a
//! single `Failed` event once retries are exhausted.

use crate::message::{Priority, QueueMessage};
use crate::store::ListStore;
use crate::{QueueError, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Queue tuning knobs
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Name prefix for the backing lists
    pub name: String,
    /// Hard cap on total queued items across all priorities
    pub max_size: usize,
    /// Backpressure events fire when total size crosses this threshold
    pub backpressure_threshold: usize,
    /// Maximum concurrently processing messages
    pub concurrency: usize,
    /// Per-message processing deadline; exceeding it counts as a failure
    pub processing_timeout: Duration,
    /// Fixed delay before a failed message re-enters its priority list
    pub retry_delay: Duration,
    /// Consumer poll interval when idle or at the concurrency cap
    pub poll_interval: Duration,
    /// Retry budget for messages enqueued without an explicit one
    pub default_max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "queue".to_string(),
            max_size: 10_000,
            backpressure_threshold: 8_000,
            concurrency: 4,
            processing_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            default_max_retries: 3,
        }
    }
}

/// Lifecycle events emitted on the queue's broadcast channel
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// Total size crossed the backpressure threshold (edge-triggered)
    BackpressureStart { size: usize },
    /// Total size dropped back below the threshold (edge-triggered)
    BackpressureEnd { size: usize },
    /// A message exhausted its retries and was dropped
    Failed { message: QueueMessage },
}

/// A message observer. Returning an error fails the message.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, message: &QueueMessage) -> std::result::Result<(), String>;
}

struct FnListener<F>(F);

#[async_trait]
impl<F, Fut> MessageListener for FnListener<F>
where
    F: Fn(QueueMessage) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = std::result::Result<(), String>> + Send,
{
    async fn on_message(&self, message: &QueueMessage) -> std::result::Result<(), String> {
        (self.0)(message.clone()).await
    }
}

/// Point-in-time queue counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub processed: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub retries: u64,
    pub failed: u64,
    pub in_flight: usize,
    pub backpressure_active: bool,
}

/// Queue size per priority class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSizes {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl QueueSizes {
    pub fn total(&self) -> usize {
        self.high + self.medium + self.low
    }
}

struct QueueInner {
    config: QueueConfig,
    store: Arc<dyn ListStore>,
    listeners: RwLock<Vec<Arc<dyn MessageListener>>>,
    events: broadcast::Sender<QueueEvent>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    paused: AtomicBool,
    stopped: AtomicBool,
    backpressure: AtomicBool,
    in_flight: AtomicUsize,
    enqueued: AtomicU64,
    processed: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    retries: AtomicU64,
    failed: AtomicU64,
    processing_time_us: AtomicU64,
}

/// Handle to one logical queue. Cloning shares the same queue.
#[derive(Clone)]
pub struct MessageQueue {
    inner: Arc<QueueInner>,
}

impl MessageQueue {
    pub fn new(config: QueueConfig, store: Arc<dyn ListStore>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(QueueInner {
                config,
                store,
                listeners: RwLock::new(Vec::new()),
                events,
                consumer: Mutex::new(None),
                paused: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                backpressure: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                enqueued: AtomicU64::new(0),
                processed: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                timeouts: AtomicU64::new(0),
                retries: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                processing_time_us: AtomicU64::new(0),
            }),
        }
    }

    /// Append a message to its priority list. Rejects when the queue is at
    /// capacity; crossing the backpressure threshold emits a single
    /// `BackpressureStart` event.
    pub async fn enqueue(
        &self,
        payload: Value,
        priority: Priority,
        max_retries: Option<u32>,
    ) -> Result<Uuid> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let size = self.inner.total_size().await?;
        if size >= self.inner.config.max_size {
            return Err(QueueError::Full);
        }

        let message = QueueMessage::new(
            payload,
            priority,
            max_retries.unwrap_or(self.inner.config.default_max_retries),
        );
        self.inner.push_message(&message).await?;
        self.inner.enqueued.fetch_add(1, Ordering::Relaxed);

        let new_size = size + 1;
        if new_size >= self.inner.config.backpressure_threshold
            && !self.inner.backpressure.swap(true, Ordering::SeqCst)
        {
            self.inner
                .emit(QueueEvent::BackpressureStart { size: new_size });
        }
        Ok(message.id)
    }

    /// Register an observer. Every listener runs for every message.
    pub fn add_listener(&self, listener: Arc<dyn MessageListener>) {
        self.inner.listeners.write().push(listener);
    }

    /// Register a plain async closure as an observer
    pub fn add_listener_fn<F, Fut>(&self, f: F)
    where
        F: Fn(QueueMessage) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        self.add_listener(Arc::new(FnListener(f)));
    }

    /// Subscribe to queue lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Start the consumer loop. A no-op if already running.
    pub fn start(&self) {
        let mut guard = self.inner.consumer.lock();
        if guard.is_some() || self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        *guard = Some(tokio::spawn(consumer_loop(weak)));
        debug!(queue = %self.inner.config.name, "consumer started");
    }

    /// Suspend dequeuing without losing queued data. In-flight messages
    /// keep their timeout guards and may still retry.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    /// Resume dequeuing after `pause`
    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Drop every queued item across all priorities
    pub async fn clear(&self) -> Result<()> {
        for priority in Priority::ALL {
            self.inner
                .store
                .clear(&self.inner.list_name(priority))
                .await?;
        }
        if self.inner.backpressure.swap(false, Ordering::SeqCst) {
            self.inner.emit(QueueEvent::BackpressureEnd { size: 0 });
        }
        Ok(())
    }

    /// Halt the consumer loop and reject further enqueues. Idempotent.
    /// Queued data stays in the store.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.inner.consumer.lock().take() {
            handle.abort();
        }
        debug!(queue = %self.inner.config.name, "queue stopped");
    }

    /// Per-priority sizes from the backing store
    pub async fn sizes(&self) -> Result<QueueSizes> {
        Ok(QueueSizes {
            high: self.inner.list_len(Priority::High).await?,
            medium: self.inner.list_len(Priority::Medium).await?,
            low: self.inner.list_len(Priority::Low).await?,
        })
    }

    /// Counter snapshot
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.inner.enqueued.load(Ordering::Relaxed),
            processed: self.inner.processed.load(Ordering::Relaxed),
            errors: self.inner.errors.load(Ordering::Relaxed),
            timeouts: self.inner.timeouts.load(Ordering::Relaxed),
            retries: self.inner.retries.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.load(Ordering::SeqCst),
            backpressure_active: self.inner.backpressure.load(Ordering::SeqCst),
        }
    }

    /// Mean processing time of successfully processed messages
    pub fn mean_processing_time(&self) -> Duration {
        let processed = self.inner.processed.load(Ordering::Relaxed);
        if processed == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.inner.processing_time_us.load(Ordering::Relaxed) / processed)
    }
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        if let Some(handle) = self.consumer.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("name", &self.inner.config.name)
            .field("in_flight", &self.inner.in_flight.load(Ordering::SeqCst))
            .finish()
    }
}

async fn consumer_loop(weak: Weak<QueueInner>) {
    loop {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let poll = inner.config.poll_interval;

        if inner.paused.load(Ordering::SeqCst)
            || inner.in_flight.load(Ordering::SeqCst) >= inner.config.concurrency
        {
            drop(inner);
            tokio::time::sleep(poll).await;
            continue;
        }

        match inner.dequeue_next().await {
            Ok(Some(message)) => {
                inner.in_flight.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(process_message(inner, message));
                // Keep draining without sleeping while there is work
                continue;
            }
            Ok(None) => {}
            Err(e) => warn!(queue = %inner.config.name, error = %e, "dequeue failed"),
        }
        drop(inner);
        tokio::time::sleep(poll).await;
    }
}

async fn process_message(inner: Arc<QueueInner>, message: QueueMessage) {
    let started = Instant::now();
    let outcome =
        tokio::time::timeout(inner.config.processing_timeout, inner.run_listeners(&message)).await;
    inner.in_flight.fetch_sub(1, Ordering::SeqCst);

    match outcome {
        Ok(Ok(())) => {
            inner.processed.fetch_add(1, Ordering::Relaxed);
            inner
                .processing_time_us
                .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        }
        Ok(Err(error)) => {
            inner.errors.fetch_add(1, Ordering::Relaxed);
            debug!(queue = %inner.config.name, id = %message.id, error = %error, "listener failed");
            inner.retry_or_fail(message).await;
        }
        Err(_) => {
            inner.timeouts.fetch_add(1, Ordering::Relaxed);
            warn!(queue = %inner.config.name, id = %message.id, "processing timed out");
            inner.retry_or_fail(message).await;
        }
    }
}

impl QueueInner {
    fn list_name(&self, priority: Priority) -> String {
        format!("{}:{}", self.config.name, priority)
    }

    async fn list_len(&self, priority: Priority) -> Result<usize> {
        self.store.len(&self.list_name(priority)).await
    }

    async fn total_size(&self) -> Result<usize> {
        let mut total = 0;
        for priority in Priority::ALL {
            total += self.list_len(priority).await?;
        }
        Ok(total)
    }

    async fn push_message(&self, message: &QueueMessage) -> Result<()> {
        let bytes = serde_json::to_vec(message)?;
        self.store.push(&self.list_name(message.priority), bytes).await
    }

    /// Pop the head of the highest-priority non-empty list. Undecodable
    /// records are dropped with a warning rather than wedging the list.
    async fn dequeue_next(&self) -> Result<Option<QueueMessage>> {
        for priority in Priority::ALL {
            let list = self.list_name(priority);
            while let Some(bytes) = self.store.pop(&list).await? {
                match serde_json::from_slice::<QueueMessage>(&bytes) {
                    Ok(message) => {
                        self.check_backpressure_end().await;
                        return Ok(Some(message));
                    }
                    Err(e) => {
                        self.errors.fetch_add(1, Ordering::Relaxed);
                        warn!(queue = %self.config.name, list = %list, error = %e, "dropping undecodable record");
                    }
                }
            }
        }
        Ok(None)
    }

    async fn check_backpressure_end(&self) {
        if !self.backpressure.load(Ordering::SeqCst) {
            return;
        }
        let Ok(size) = self.total_size().await else {
            return;
        };
        if size < self.config.backpressure_threshold
            && self.backpressure.swap(false, Ordering::SeqCst)
        {
            self.emit(QueueEvent::BackpressureEnd { size });
        }
    }

    async fn run_listeners(&self, message: &QueueMessage) -> std::result::Result<(), String> {
        let listeners: Vec<Arc<dyn MessageListener>> = self.listeners.read().clone();
        // Every listener runs even when an earlier one fails
        let mut first_error = None;
        for listener in listeners {
            if let Err(e) = listener.on_message(message).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    async fn retry_or_fail(&self, mut message: QueueMessage) {
        if message.can_retry() {
            self.retries.fetch_add(1, Ordering::Relaxed);
            message.retry_count += 1;
            tokio::time::sleep(self.config.retry_delay).await;
            if self.stopped.load(Ordering::SeqCst) {
                debug!(id = %message.id, "dropping retry after stop");
                return;
            }
            // Tail of the same priority list: newer messages may overtake
            if let Err(e) = self.push_message(&message).await {
                warn!(id = %message.id, error = %e, "re-enqueue failed");
            }
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
            self.emit(QueueEvent::Failed { message });
        }
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
