//! Connection Layer Metrics
//!
//! Lock-free counters updated on the hot path, exposed as a point-in-time
//! snapshot for external scraping. The counter names in `MetricsSnapshot`
//! are part of the observable contract; exposition format is the outer
//! layer's concern.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Shared metrics registry for the connection layer
#[derive(Debug, Default)]
pub struct RealtimeMetrics {
    active_connections: AtomicI64,
    total_connections: AtomicU64,
    requests_received: AtomicU64,
    responses_received: AtomicU64,
    notifications_received: AtomicU64,
    requests_sent: AtomicU64,
    responses_sent: AtomicU64,
    broadcasts_sent: AtomicU64,
    rate_limited: AtomicU64,
    protocol_errors: AtomicU64,
    handler_errors: AtomicU64,
    socket_errors: AtomicU64,
    request_timeouts: AtomicU64,
    compression_fallbacks: AtomicU64,
}

/// Point-in-time view of all counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub active_connections: i64,
    pub total_connections: u64,
    pub requests_received: u64,
    pub responses_received: u64,
    pub notifications_received: u64,
    pub requests_sent: u64,
    pub responses_sent: u64,
    pub broadcasts_sent: u64,
    pub rate_limited: u64,
    pub protocol_errors: u64,
    pub handler_errors: u64,
    pub socket_errors: u64,
    pub request_timeouts: u64,
    pub compression_fallbacks: u64,
}

impl RealtimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn request_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_received(&self) {
        self.responses_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn notification_received(&self) {
        self.notifications_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_sent(&self) {
        self.responses_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broadcast_sent(&self) {
        self.broadcasts_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn socket_error(&self) {
        self.socket_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_timeout(&self) {
        self.request_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn compression_fallback(&self) {
        self.compression_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            requests_received: self.requests_received.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            notifications_received: self.notifications_received.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_sent: self.responses_sent.load(Ordering::Relaxed),
            broadcasts_sent: self.broadcasts_sent.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            socket_errors: self.socket_errors.load(Ordering::Relaxed),
            request_timeouts: self.request_timeouts.load(Ordering::Relaxed),
            compression_fallbacks: self.compression_fallbacks.load(Ordering::Relaxed),
        }
    }
}
