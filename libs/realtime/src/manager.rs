//! Connection Manager
//!
//! The message router and connection registry. Owns the connection table and
//! the pending-request table exclusively; everything else interacts through
//! the public operations here. An acceptor registers sockets with
//! `add_client` and feeds inbound events through `handle_frame`,
//! `handle_pong`, and `handle_close`.
//!
//! Inbound frames run a linear pipeline: activity update → rate limit →
//! decompress → parse → dispatch by type. Handler failures become error
//! responses on the same connection; they never cross the dispatch boundary.
//! Frames rejected before parsing (rate limit, malformed) are answered with
//! the nil correlation id, since the original id is unknowable at that stage.

use crate::compression::Compressor;
use crate::config::ManagerConfig;
use crate::envelope::{Envelope, ResponseStatus};
use crate::heartbeat::HeartbeatMonitor;
use crate::metrics::RealtimeMetrics;
use crate::rate_limit::RateLimiter;
use crate::socket::ClientSocket;
use crate::{ConnectionId, RealtimeError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// Context handed to action handlers alongside the request payload
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub connection_id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub correlation_id: Uuid,
}

/// Handler outcome: a success payload or an error message for the peer
pub type HandlerResult = std::result::Result<Value, String>;

/// One registered action handler
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, payload: Value, ctx: HandlerContext) -> HandlerResult;
}

/// Closure adapter so route modules can register plain async functions
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(Value, HandlerContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, payload: Value, ctx: HandlerContext) -> HandlerResult {
        (self.0)(payload, ctx).await
    }
}

/// Public snapshot of one tracked connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub connected_at: Instant,
    pub last_activity: Instant,
}

struct Connection {
    remote_addr: SocketAddr,
    connected_at: Instant,
    last_activity: Mutex<Instant>,
    socket: Arc<dyn ClientSocket>,
}

struct ManagerInner {
    config: ManagerConfig,
    connections: DashMap<ConnectionId, Connection>,
    handlers: DashMap<String, Arc<dyn ActionHandler>>,
    pending: DashMap<Uuid, oneshot::Sender<std::result::Result<Value, String>>>,
    rate_limiter: RateLimiter,
    heartbeat: HeartbeatMonitor,
    compressor: Compressor,
    metrics: Arc<RealtimeMetrics>,
}

/// The connection registry and message router. Cloning yields a handle to
/// the same manager.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(config: ManagerConfig) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ManagerInner>| {
            let weak = weak.clone();
            let heartbeat = HeartbeatMonitor::new(
                config.heartbeat.clone(),
                Arc::new(move |id| {
                    if let Some(inner) = weak.upgrade() {
                        inner.remove_client(id);
                    }
                }),
            );
            ManagerInner {
                rate_limiter: RateLimiter::new(config.rate_limit.clone()),
                compressor: Compressor::new(config.compression.clone()),
                config,
                connections: DashMap::new(),
                handlers: DashMap::new(),
                pending: DashMap::new(),
                heartbeat,
                metrics: Arc::new(RealtimeMetrics::new()),
            }
        });
        Self { inner }
    }

    /// Register an accepted socket. Starts heartbeat monitoring with the
    /// first connection. Returns the fresh connection id.
    pub fn add_client(&self, socket: Arc<dyn ClientSocket>, remote_addr: SocketAddr) -> ConnectionId {
        let id = ConnectionId::new();
        let now = Instant::now();
        self.inner.connections.insert(
            id,
            Connection {
                remote_addr,
                connected_at: now,
                last_activity: Mutex::new(now),
                socket: socket.clone(),
            },
        );
        self.inner.metrics.connection_opened();
        self.inner.heartbeat.track(id, socket);
        if self.inner.connections.len() == 1 {
            self.inner.heartbeat.start();
        }
        debug!(connection_id = %id, remote_addr = %remote_addr, "client added");
        id
    }

    /// Remove a connection and all per-connection state. Idempotent. Stops
    /// heartbeat monitoring when no connections remain.
    pub fn remove_client(&self, id: ConnectionId) {
        self.inner.remove_client(id);
    }

    /// Associate an action name with a handler. Last registration wins.
    pub fn register_handler(&self, action: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.inner.handlers.insert(action.into(), handler);
    }

    /// Register a plain async closure as an action handler
    pub fn register_handler_fn<F, Fut>(&self, action: impl Into<String>, f: F)
    where
        F: Fn(Value, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_handler(action, Arc::new(FnHandler(f)));
    }

    /// Send a request to a connection and await the correlated response.
    ///
    /// Exactly one of three outcomes occurs: the response payload, a
    /// `Remote` error carrying the peer's error message, or a `Timeout`
    /// after the configured deadline. The pending entry is removed in every
    /// case, so a late response is a silent no-op.
    pub async fn send_request(
        &self,
        id: ConnectionId,
        action: impl Into<String>,
        payload: Value,
    ) -> Result<Value> {
        let socket = self
            .inner
            .connections
            .get(&id)
            .map(|c| c.socket.clone())
            .ok_or_else(|| RealtimeError::connection("Unknown connection", Some(id)))?;

        if self.inner.rate_limiter.is_rate_limited(id) {
            self.inner.metrics.rate_limited();
            return Err(RealtimeError::RateLimited {
                retry_after_ms: self.inner.rate_limiter.reset_time(id).as_millis() as u64,
            });
        }

        let envelope = Envelope::request(action, payload);
        let correlation_id = envelope.correlation_id();
        let frame = envelope.encode(&self.inner.compressor)?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(correlation_id, tx);
        self.inner.metrics.request_sent();

        if let Err(e) = socket.send(frame).await {
            self.inner.pending.remove(&correlation_id);
            self.inner.metrics.socket_error();
            return Err(e);
        }

        let timeout = self.inner.config.request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(RealtimeError::remote(message)),
            Ok(Err(_)) => Err(RealtimeError::connection(
                "Connection closed while awaiting response",
                Some(id),
            )),
            Err(_) => {
                // Release the entry now so a late response is a no-op
                self.inner.pending.remove(&correlation_id);
                self.inner.metrics.request_timeout();
                Err(RealtimeError::timeout(
                    "send_request",
                    timeout.as_millis() as u64,
                ))
            }
        }
    }

    /// Broadcast a notification to every open connection
    pub async fn broadcast(&self, event: impl Into<String>, payload: Value) -> Result<usize> {
        self.broadcast_filtered(event, payload, |_| true).await
    }

    /// Broadcast a notification to every open connection matching `filter`.
    /// The envelope is encoded (and compressed) once; returns the number of
    /// connections it was delivered to.
    pub async fn broadcast_filtered(
        &self,
        event: impl Into<String>,
        payload: Value,
        filter: impl Fn(&ConnectionInfo) -> bool,
    ) -> Result<usize> {
        let envelope = Envelope::notification(event, payload);
        let frame = envelope.encode(&self.inner.compressor)?;

        let targets: Vec<Arc<dyn ClientSocket>> = self
            .inner
            .connections
            .iter()
            .filter(|entry| entry.socket.is_open() && filter(&entry.info(*entry.key())))
            .map(|entry| entry.socket.clone())
            .collect();

        let sends = targets.iter().map(|socket| socket.send(frame.clone()));
        let mut delivered = 0;
        for result in join_all(sends).await {
            match result {
                Ok(()) => {
                    self.inner.metrics.broadcast_sent();
                    delivered += 1;
                }
                Err(e) => {
                    self.inner.metrics.socket_error();
                    debug!(error = %e, "broadcast send failed");
                }
            }
        }
        Ok(delivered)
    }

    /// Process one inbound frame from a connection
    pub async fn handle_frame(&self, id: ConnectionId, data: &[u8]) {
        let Some(conn) = self.inner.connections.get(&id) else {
            debug!(connection_id = %id, "frame from unknown connection");
            return;
        };
        *conn.last_activity.lock() = Instant::now();
        let socket = conn.socket.clone();
        let remote_addr = conn.remote_addr;
        drop(conn);

        if self.inner.rate_limiter.is_rate_limited(id) {
            self.inner.metrics.rate_limited();
            let retry_after = self.inner.rate_limiter.reset_time(id).as_millis() as u64;
            self.send_envelope(&socket, &Envelope::rate_limited(Uuid::nil(), retry_after))
                .await;
            return;
        }

        let envelope = match Envelope::decode(data, &self.inner.compressor) {
            Ok(env) => env,
            Err(e) => {
                if matches!(e, RealtimeError::Compression { .. }) {
                    self.inner.metrics.compression_fallback();
                }
                self.inner.metrics.protocol_error();
                debug!(connection_id = %id, error = %e, "malformed frame");
                self.send_envelope(&socket, &Envelope::error(Uuid::nil(), "Invalid message format"))
                    .await;
                return;
            }
        };

        match envelope {
            Envelope::Request {
                correlation_id,
                action,
                payload,
                ..
            } => {
                self.inner.metrics.request_received();
                self.dispatch_request(id, remote_addr, &socket, correlation_id, action, payload)
                    .await;
            }
            Envelope::Response {
                correlation_id,
                status,
                payload,
                ..
            } => {
                self.inner.metrics.response_received();
                self.resolve_pending(correlation_id, status, payload);
            }
            Envelope::Notification { event, .. } => {
                // Notifications never get a reply
                self.inner.metrics.notification_received();
                debug!(connection_id = %id, event = %event, "notification received");
            }
        }
    }

    /// Record a transport-level pong from a connection
    pub fn handle_pong(&self, id: ConnectionId) {
        self.inner.heartbeat.record_pong(id);
        if let Some(conn) = self.inner.connections.get(&id) {
            *conn.last_activity.lock() = Instant::now();
        }
    }

    /// Transport close event: always cleans up connection state
    pub fn handle_close(&self, id: ConnectionId) {
        self.remove_client(id);
    }

    /// Transport error event: recorded, never an automatic disconnect
    pub fn handle_socket_error(&self, id: ConnectionId, error: &RealtimeError) {
        self.inner.metrics.socket_error();
        warn!(connection_id = %id, error = %error, "socket error");
    }

    /// Number of registered connections
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Snapshot of one connection, if registered
    pub fn connection_info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.inner.connections.get(&id).map(|c| c.info(id))
    }

    /// Number of requests currently awaiting a response
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Shared metrics registry
    pub fn metrics(&self) -> Arc<RealtimeMetrics> {
        self.inner.metrics.clone()
    }

    /// Rate limiter, exposed for header-building collaborators
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.inner.rate_limiter
    }

    async fn dispatch_request(
        &self,
        id: ConnectionId,
        remote_addr: SocketAddr,
        socket: &Arc<dyn ClientSocket>,
        correlation_id: Uuid,
        action: String,
        payload: Value,
    ) {
        let Some(handler) = self.inner.handlers.get(&action).map(|h| h.clone()) else {
            self.send_envelope(
                socket,
                &Envelope::error(correlation_id, format!("Unknown action: {}", action)),
            )
            .await;
            return;
        };

        let ctx = HandlerContext {
            connection_id: id,
            remote_addr,
            correlation_id,
        };
        let reply = match handler.handle(payload, ctx).await {
            Ok(result) => Envelope::success(correlation_id, result),
            Err(message) => {
                self.inner.metrics.handler_error();
                debug!(
                    connection_id = %id,
                    correlation_id = %correlation_id,
                    action = %action,
                    error = %message,
                    "handler failed"
                );
                Envelope::error(correlation_id, message)
            }
        };
        self.send_envelope(socket, &reply).await;
    }

    fn resolve_pending(&self, correlation_id: Uuid, status: ResponseStatus, payload: Value) {
        let Some((_, tx)) = self.inner.pending.remove(&correlation_id) else {
            // Already timed out, or unsolicited
            debug!(correlation_id = %correlation_id, "response with no pending request");
            return;
        };
        let outcome = match status {
            ResponseStatus::Success => Ok(payload),
            ResponseStatus::Error => Err(match payload {
                Value::String(s) => s,
                other => other.to_string(),
            }),
        };
        let _ = tx.send(outcome);
    }

    async fn send_envelope(&self, socket: &Arc<dyn ClientSocket>, envelope: &Envelope) {
        let frame = match envelope.encode(&self.inner.compressor) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to encode outbound envelope");
                return;
            }
        };
        match socket.send(frame).await {
            Ok(()) => self.inner.metrics.response_sent(),
            Err(e) => {
                self.inner.metrics.socket_error();
                warn!(error = %e, "failed to send envelope");
            }
        }
    }
}

impl ManagerInner {
    fn remove_client(&self, id: ConnectionId) {
        let Some((_, conn)) = self.connections.remove(&id) else {
            return;
        };
        self.heartbeat.untrack(id);
        self.rate_limiter.remove_key(id);
        self.metrics.connection_closed();
        if self.connections.is_empty() {
            self.heartbeat.stop();
        }
        tokio::spawn(async move { conn.socket.close().await });
        debug!(connection_id = %id, "client removed");
    }
}

impl Connection {
    fn info(&self, id: ConnectionId) -> ConnectionInfo {
        ConnectionInfo {
            id,
            remote_addr: self.remote_addr,
            connected_at: self.connected_at,
            last_activity: *self.last_activity.lock(),
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.connection_count())
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeartbeatConfig, RateLimitConfig};
    use crate::test_utils::MockSocket;
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 50000)
    }

    fn manager() -> ConnectionManager {
        ConnectionManager::new(ManagerConfig::default())
    }

    fn decode_last(socket: &MockSocket) -> Envelope {
        let comp = Compressor::default();
        Envelope::decode(&socket.last_frame().expect("no frame sent"), &comp).unwrap()
    }

    #[tokio::test]
    async fn test_add_then_remove_leaves_no_state() {
        let mgr = manager();
        let socket = Arc::new(MockSocket::new());
        let id = mgr.add_client(socket, addr());

        assert_eq!(mgr.connection_count(), 1);
        mgr.remove_client(id);
        assert_eq!(mgr.connection_count(), 0);
        assert_eq!(mgr.rate_limiter().tracked_keys(), 0);
        assert!(mgr.connection_info(id).is_none());

        // Idempotent
        mgr.remove_client(id);
        assert_eq!(mgr.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_request_dispatch_success() {
        let mgr = manager();
        mgr.register_handler_fn("echo", |payload, _ctx| async move { Ok(payload) });

        let socket = Arc::new(MockSocket::new());
        let id = mgr.add_client(socket.clone(), addr());

        let req = Envelope::request("echo", json!({"hello": "world"}));
        let corr = req.correlation_id();
        let frame = req.encode(&Compressor::default()).unwrap();
        mgr.handle_frame(id, &frame).await;

        match decode_last(&socket) {
            Envelope::Response {
                correlation_id,
                status,
                payload,
                ..
            } => {
                assert_eq!(correlation_id, corr);
                assert_eq!(status, ResponseStatus::Success);
                assert_eq!(payload["hello"], "world");
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_response() {
        let mgr = manager();
        mgr.register_handler_fn("getPet", |_payload, _ctx| async move {
            Err("boom".to_string())
        });

        let socket = Arc::new(MockSocket::new());
        let id = mgr.add_client(socket.clone(), addr());

        let req = Envelope::request("getPet", json!({}));
        let corr = req.correlation_id();
        mgr.handle_frame(id, &req.encode(&Compressor::default()).unwrap())
            .await;

        match decode_last(&socket) {
            Envelope::Response {
                correlation_id,
                status,
                payload,
                ..
            } => {
                assert_eq!(correlation_id, corr);
                assert_eq!(status, ResponseStatus::Error);
                assert_eq!(payload, "boom");
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_action_response() {
        let mgr = manager();
        let socket = Arc::new(MockSocket::new());
        let id = mgr.add_client(socket.clone(), addr());

        let req = Envelope::request("nope", json!({}));
        mgr.handle_frame(id, &req.encode(&Compressor::default()).unwrap())
            .await;

        match decode_last(&socket) {
            Envelope::Response { status, payload, .. } => {
                assert_eq!(status, ResponseStatus::Error);
                assert_eq!(payload, "Unknown action: nope");
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_last_handler_registration_wins() {
        let mgr = manager();
        mgr.register_handler_fn("v", |_p, _c| async move { Ok(json!(1)) });
        mgr.register_handler_fn("v", |_p, _c| async move { Ok(json!(2)) });

        let socket = Arc::new(MockSocket::new());
        let id = mgr.add_client(socket.clone(), addr());
        let req = Envelope::request("v", json!({}));
        mgr.handle_frame(id, &req.encode(&Compressor::default()).unwrap())
            .await;

        match decode_last(&socket) {
            Envelope::Response { payload, .. } => assert_eq!(payload, 2),
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_open() {
        let mgr = manager();
        let socket = Arc::new(MockSocket::new());
        let id = mgr.add_client(socket.clone(), addr());

        mgr.handle_frame(id, b"{broken json").await;

        match decode_last(&socket) {
            Envelope::Response { correlation_id, status, payload, .. } => {
                assert_eq!(correlation_id, Uuid::nil());
                assert_eq!(status, ResponseStatus::Error);
                assert_eq!(payload, "Invalid message format");
            }
            other => panic!("expected response, got {:?}", other),
        }
        assert_eq!(mgr.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_undecompressable_frame_counts_fallback_metric() {
        let mgr = manager();
        let socket = Arc::new(MockSocket::new());
        let id = mgr.add_client(socket.clone(), addr());

        // Marker byte followed by garbage: fails in decompression, not JSON
        mgr.handle_frame(id, &[0x00, 0xde, 0xad, 0xbe, 0xef]).await;

        let snap = mgr.metrics().snapshot();
        assert_eq!(snap.compression_fallbacks, 1);
        assert_eq!(snap.protocol_errors, 1);
        assert_eq!(mgr.connection_count(), 1);

        match decode_last(&socket) {
            Envelope::Response { correlation_id, status, .. } => {
                assert_eq!(correlation_id, Uuid::nil());
                assert_eq!(status, ResponseStatus::Error);
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_request_resolved_by_response() {
        let mgr = manager();
        let socket = Arc::new(MockSocket::new());
        let id = mgr.add_client(socket.clone(), addr());

        let mgr2 = mgr.clone();
        let pending = tokio::spawn(async move {
            mgr2.send_request(id, "fetch", json!({"q": 1})).await
        });

        // Wait for the request frame to hit the socket, then answer it
        let comp = Compressor::default();
        let sent = loop {
            if let Some(frame) = socket.last_frame() {
                break Envelope::decode(&frame, &comp).unwrap();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        let corr = sent.correlation_id();

        let response = Envelope::success(corr, json!({"answer": 42}));
        mgr.handle_frame(id, &response.encode(&comp).unwrap()).await;

        let value = pending.await.unwrap().unwrap();
        assert_eq!(value["answer"], 42);
        assert_eq!(mgr.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_request_rejected_by_error_response() {
        let mgr = manager();
        let socket = Arc::new(MockSocket::new());
        let id = mgr.add_client(socket.clone(), addr());

        let mgr2 = mgr.clone();
        let pending = tokio::spawn(async move { mgr2.send_request(id, "fetch", json!({})).await });

        let comp = Compressor::default();
        let sent = loop {
            if let Some(frame) = socket.last_frame() {
                break Envelope::decode(&frame, &comp).unwrap();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        let response = Envelope::error(sent.correlation_id(), "not found");
        mgr.handle_frame(id, &response.encode(&comp).unwrap()).await;

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, RealtimeError::Remote { ref message } if message == "not found"));
        assert_eq!(mgr.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_request_times_out_and_releases_entry() {
        let mut config = ManagerConfig::default();
        config.request_timeout = Duration::from_millis(30);
        let mgr = ConnectionManager::new(config);

        let socket = Arc::new(MockSocket::new());
        let id = mgr.add_client(socket, addr());

        let err = mgr.send_request(id, "fetch", json!({})).await.unwrap_err();
        assert!(matches!(err, RealtimeError::Timeout { .. }));
        assert_eq!(mgr.pending_count(), 0);
        assert_eq!(mgr.metrics().snapshot().request_timeouts, 1);
    }

    #[tokio::test]
    async fn test_late_response_is_a_no_op() {
        let mut config = ManagerConfig::default();
        config.request_timeout = Duration::from_millis(20);
        let mgr = ConnectionManager::new(config);

        let socket = Arc::new(MockSocket::new());
        let id = mgr.add_client(socket.clone(), addr());

        let _ = mgr.send_request(id, "fetch", json!({})).await;

        let comp = Compressor::default();
        let sent = Envelope::decode(&socket.last_frame().unwrap(), &comp).unwrap();
        let late = Envelope::success(sent.correlation_id(), json!("late"));
        // Must not panic or resolve anything
        mgr.handle_frame(id, &late.encode(&comp).unwrap()).await;
        assert_eq!(mgr.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_open_connections() {
        let mgr = manager();
        let a = Arc::new(MockSocket::new());
        let b = Arc::new(MockSocket::new());
        mgr.add_client(a.clone(), addr());
        mgr.add_client(b.clone(), addr());

        let delivered = mgr
            .broadcast("pet.created", json!({"name": "Rex"}))
            .await
            .unwrap();
        assert_eq!(delivered, 2);

        for socket in [&a, &b] {
            match decode_last(socket) {
                Envelope::Notification { event, payload, .. } => {
                    assert_eq!(event, "pet.created");
                    assert_eq!(payload["name"], "Rex");
                }
                other => panic!("expected notification, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_broadcast_filter_and_closed_sockets() {
        let mgr = manager();
        let open = Arc::new(MockSocket::new());
        let closed = Arc::new(MockSocket::new());
        let filtered = Arc::new(MockSocket::new());

        let open_id = mgr.add_client(open.clone(), addr());
        mgr.add_client(closed.clone(), addr());
        mgr.add_client(filtered.clone(), addr());
        closed.close().await;

        let delivered = mgr
            .broadcast_filtered("ev", json!({}), |info| info.id == open_id)
            .await
            .unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(open.sent_count(), 1);
        assert_eq!(closed.sent_count(), 0);
        assert_eq!(filtered.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_rate_limited_frame_gets_retry_after() {
        let mut config = ManagerConfig::default();
        config.rate_limit = RateLimitConfig {
            window: Duration::from_secs(60),
            max_requests: 1,
        };
        let mgr = ConnectionManager::new(config);

        let socket = Arc::new(MockSocket::new());
        let id = mgr.add_client(socket.clone(), addr());

        let comp = Compressor::default();
        let req = Envelope::request("x", json!({}));
        let frame = req.encode(&comp).unwrap();
        mgr.handle_frame(id, &frame).await; // consumes the single slot
        mgr.handle_frame(id, &frame).await; // rejected

        match decode_last(&socket) {
            Envelope::Response {
                correlation_id,
                status,
                retry_after,
                ..
            } => {
                assert_eq!(correlation_id, Uuid::nil());
                assert_eq!(status, ResponseStatus::Error);
                assert!(retry_after.is_some());
            }
            other => panic!("expected response, got {:?}", other),
        }
        assert_eq!(mgr.metrics().snapshot().rate_limited, 1);
        assert_eq!(mgr.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_notification_never_gets_a_reply() {
        let mgr = manager();
        let socket = Arc::new(MockSocket::new());
        let id = mgr.add_client(socket.clone(), addr());

        let note = Envelope::notification("fyi", json!({}));
        mgr.handle_frame(id, &note.encode(&Compressor::default()).unwrap())
            .await;

        assert_eq!(socket.sent_count(), 0);
        assert_eq!(mgr.metrics().snapshot().notifications_received, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_removes_connection() {
        let mut config = ManagerConfig::default();
        config.heartbeat = HeartbeatConfig {
            interval: Duration::from_millis(20),
            pong_timeout: Duration::from_millis(15),
            max_missed: 2,
        };
        let mgr = ConnectionManager::new(config);

        let socket = Arc::new(MockSocket::new());
        mgr.add_client(socket, addr());
        assert_eq!(mgr.connection_count(), 1);

        // Never answer pings
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(mgr.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_socket_error_does_not_disconnect() {
        let mgr = manager();
        let socket = Arc::new(MockSocket::new());
        let id = mgr.add_client(socket, addr());

        mgr.handle_socket_error(id, &RealtimeError::connection("reset", Some(id)));
        assert_eq!(mgr.connection_count(), 1);
        assert_eq!(mgr.metrics().snapshot().socket_errors, 1);
    }
}
