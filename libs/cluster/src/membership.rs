//! Cluster Membership
//!
//! Coordinates process instances over a shared [`PubSubBus`] using two
//! channels: heartbeat and broadcast. Each node publishes a heartbeat on a
//! fixed interval and on every local connection change; receivers maintain
//! a peer table and prune entries whose last heartbeat exceeds the timeout.
//!
//! This is pure pub/sub: no replay, no acknowledgement. A broadcast reaches
//! the peers subscribed at publish time and nothing more.

use crate::{ClusterError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use workqueue::PubSubBus;

const HEARTBEAT_CHANNEL: &str = "cluster:heartbeat";
const BROADCAST_CHANNEL: &str = "cluster:broadcast";

/// Membership tuning knobs
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// This node's identity on the bus
    pub node_id: String,
    pub heartbeat_interval: Duration,
    /// A peer silent for longer than this is pruned
    pub node_timeout: Duration,
    pub prune_interval: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: Uuid::new_v4().to_string(),
            heartbeat_interval: Duration::from_secs(5),
            node_timeout: Duration::from_secs(15),
            prune_interval: Duration::from_secs(2),
        }
    }
}

/// Messages on the heartbeat channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum MemberMessage {
    Heartbeat {
        #[serde(rename = "nodeId")]
        node_id: String,
        connections: usize,
        load: f64,
        #[serde(rename = "timestampMs")]
        timestamp_ms: u64,
    },
    Leave {
        #[serde(rename = "nodeId")]
        node_id: String,
    },
}

/// Envelope on the broadcast channel
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BroadcastEnvelope {
    origin: String,
    channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    exclude: Option<String>,
    payload: Value,
}

/// Local events emitted as the peer table changes
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// First heartbeat from a previously unknown peer
    NodeJoined { node_id: String },
    /// Peer published an explicit leave
    NodeLeft { node_id: String },
    /// Peer pruned after missing heartbeats
    NodeTimeout { node_id: String },
    /// A peer's broadcast, re-emitted locally
    Broadcast {
        origin: String,
        channel: String,
        payload: Value,
    },
}

/// Last known state of one peer
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub node_id: String,
    pub connections: usize,
    pub load: f64,
    pub last_seen: Instant,
}

/// Membership snapshot
#[derive(Debug, Clone)]
pub struct ClusterStats {
    pub node_id: String,
    pub peer_count: usize,
    pub connections: usize,
}

struct ClusterInner {
    config: ClusterConfig,
    bus: Arc<dyn PubSubBus>,
    peers: DashMap<String, PeerInfo>,
    connections: AtomicUsize,
    events: broadcast::Sender<ClusterEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

/// Handle to this process's cluster membership. Cloning shares state.
#[derive(Clone)]
pub struct ClusterManager {
    inner: Arc<ClusterInner>,
}

impl ClusterManager {
    pub fn new(config: ClusterConfig, bus: Arc<dyn PubSubBus>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ClusterInner {
                config,
                bus,
                peers: DashMap::new(),
                connections: AtomicUsize::new(0),
                events,
                tasks: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribe to the bus channels and start the heartbeat publisher and
    /// prune loops. A no-op if already started or stopped.
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() || self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        let heartbeat_rx = self.inner.bus.subscribe(HEARTBEAT_CHANNEL);
        let broadcast_rx = self.inner.bus.subscribe(BROADCAST_CHANNEL);

        let weak = Arc::downgrade(&self.inner);
        tasks.push(tokio::spawn(publisher_loop(weak.clone())));
        tasks.push(tokio::spawn(prune_loop(weak.clone())));
        tasks.push(tokio::spawn(heartbeat_listener(weak.clone(), heartbeat_rx)));
        tasks.push(tokio::spawn(broadcast_listener(weak, broadcast_rx)));
        info!(node_id = %self.inner.config.node_id, "cluster membership started");
    }

    /// Record one more local connection and announce it immediately
    pub async fn connection_added(&self) {
        self.inner.connections.fetch_add(1, Ordering::SeqCst);
        self.inner.publish_heartbeat().await;
    }

    /// Record one less local connection and announce it immediately
    pub async fn connection_removed(&self) {
        let _ = self
            .inner
            .connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                Some(c.saturating_sub(1))
            });
        self.inner.publish_heartbeat().await;
    }

    /// Publish a message to every peer. Each peer re-emits it locally as a
    /// [`ClusterEvent::Broadcast`] unless it is the origin or matches
    /// `exclude`.
    pub async fn broadcast(
        &self,
        channel: impl Into<String>,
        payload: Value,
        exclude: Option<&str>,
    ) -> Result<()> {
        let envelope = BroadcastEnvelope {
            origin: self.inner.config.node_id.clone(),
            channel: channel.into(),
            exclude: exclude.map(str::to_string),
            payload,
        };
        let bytes = serde_json::to_vec(&envelope)?;
        self.inner
            .bus
            .publish(BROADCAST_CHANNEL, bytes)
            .await
            .map_err(ClusterError::Bus)
    }

    /// Publish a graceful leave and halt the background loops. Idempotent.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let leave = MemberMessage::Leave {
            node_id: self.inner.config.node_id.clone(),
        };
        if let Ok(bytes) = serde_json::to_vec(&leave) {
            if let Err(e) = self.inner.bus.publish(HEARTBEAT_CHANNEL, bytes).await {
                warn!(error = %e, "failed to publish leave");
            }
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        info!(node_id = %self.inner.config.node_id, "cluster membership stopped");
    }

    /// Subscribe to local membership events
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of the peer table
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.inner.peers.iter().map(|e| e.value().clone()).collect()
    }

    pub fn peer(&self, node_id: &str) -> Option<PeerInfo> {
        self.inner.peers.get(node_id).map(|e| e.clone())
    }

    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    pub fn stats(&self) -> ClusterStats {
        ClusterStats {
            node_id: self.inner.config.node_id.clone(),
            peer_count: self.inner.peers.len(),
            connections: self.inner.connections.load(Ordering::SeqCst),
        }
    }
}

impl Drop for ClusterInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for ClusterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterManager")
            .field("node_id", &self.inner.config.node_id)
            .field("peers", &self.inner.peers.len())
            .finish()
    }
}

async fn publisher_loop(weak: Weak<ClusterInner>) {
    loop {
        let interval = {
            let Some(inner) = weak.upgrade() else { return };
            inner.config.heartbeat_interval
        };
        tokio::time::sleep(interval).await;
        let Some(inner) = weak.upgrade() else { return };
        inner.publish_heartbeat().await;
    }
}

async fn prune_loop(weak: Weak<ClusterInner>) {
    loop {
        let (interval, timeout) = {
            let Some(inner) = weak.upgrade() else { return };
            (inner.config.prune_interval, inner.config.node_timeout)
        };
        tokio::time::sleep(interval).await;
        let Some(inner) = weak.upgrade() else { return };

        let expired: Vec<String> = inner
            .peers
            .iter()
            .filter(|e| e.last_seen.elapsed() > timeout)
            .map(|e| e.key().clone())
            .collect();
        for node_id in expired {
            if inner.peers.remove(&node_id).is_some() {
                warn!(node_id = %node_id, "peer timed out");
                inner.emit(ClusterEvent::NodeTimeout { node_id });
            }
        }
    }
}

async fn heartbeat_listener(
    weak: Weak<ClusterInner>,
    mut rx: broadcast::Receiver<Vec<u8>>,
) {
    loop {
        let bytes = match rx.recv().await {
            Ok(bytes) => bytes,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!(skipped = n, "heartbeat listener lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(inner) = weak.upgrade() else { return };

        let message: MemberMessage = match serde_json::from_slice(&bytes) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "undecodable heartbeat message");
                continue;
            }
        };
        match message {
            MemberMessage::Heartbeat {
                node_id,
                connections,
                load,
                ..
            } => {
                if node_id == inner.config.node_id {
                    continue;
                }
                let known = inner.peers.contains_key(&node_id);
                inner.peers.insert(
                    node_id.clone(),
                    PeerInfo {
                        node_id: node_id.clone(),
                        connections,
                        load,
                        last_seen: Instant::now(),
                    },
                );
                if !known {
                    debug!(node_id = %node_id, "peer joined");
                    inner.emit(ClusterEvent::NodeJoined { node_id });
                }
            }
            MemberMessage::Leave { node_id } => {
                if node_id == inner.config.node_id {
                    continue;
                }
                if inner.peers.remove(&node_id).is_some() {
                    debug!(node_id = %node_id, "peer left");
                    inner.emit(ClusterEvent::NodeLeft { node_id });
                }
            }
        }
    }
}

async fn broadcast_listener(
    weak: Weak<ClusterInner>,
    mut rx: broadcast::Receiver<Vec<u8>>,
) {
    loop {
        let bytes = match rx.recv().await {
            Ok(bytes) => bytes,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!(skipped = n, "broadcast listener lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(inner) = weak.upgrade() else { return };

        let envelope: BroadcastEnvelope = match serde_json::from_slice(&bytes) {
            Ok(e) => e,
            Err(e) => {
                debug!(error = %e, "undecodable broadcast message");
                continue;
            }
        };
        let me = &inner.config.node_id;
        if envelope.origin == *me || envelope.exclude.as_deref() == Some(me.as_str()) {
            continue;
        }
        inner.emit(ClusterEvent::Broadcast {
            origin: envelope.origin,
            channel: envelope.channel,
            payload: envelope.payload,
        });
    }
}

impl ClusterInner {
    async fn publish_heartbeat(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let connections = self.connections.load(Ordering::SeqCst);
        let message = MemberMessage::Heartbeat {
            node_id: self.config.node_id.clone(),
            connections,
            // Load proxy derived from connection count
            load: connections as f64 / 100.0,
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        };
        match serde_json::to_vec(&message) {
            Ok(bytes) => {
                if let Err(e) = self.bus.publish(HEARTBEAT_CHANNEL, bytes).await {
                    warn!(error = %e, "failed to publish heartbeat");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode heartbeat"),
        }
    }

    fn emit(&self, event: ClusterEvent) {
        let _ = self.events.send(event);
    }
}
