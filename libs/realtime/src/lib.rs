//! Realtime Connection Layer
//!
//! Transport-agnostic messaging over long-lived client sockets: a connection
//! registry with request/response correlation and broadcast fan-out, plus the
//! per-connection policies that surround it (rate limiting, heartbeat
//! liveness, compression, auth tokens) and a circuit breaker for outbound
//! dependencies.
//!
//! The transport is abstracted behind [`ClientSocket`]; an acceptor owns the
//! actual sockets and feeds events into [`ConnectionManager`].

pub mod breaker;
pub mod compression;
pub mod config;
pub mod envelope;
pub mod error;
pub mod heartbeat;
pub mod manager;
pub mod metrics;
pub mod rate_limit;
pub mod security;
pub mod socket;
pub mod test_utils;
pub mod timer;

pub use breaker::{BreakerError, BreakerStats, CircuitBreaker, CircuitState};
pub use compression::Compressor;
pub use config::{
    BreakerConfig, CompressionConfig, HeartbeatConfig, ManagerConfig, RateLimitConfig,
    SecurityConfig,
};
pub use envelope::{Envelope, ResponseStatus};
pub use error::{RealtimeError, Result};
pub use heartbeat::HeartbeatMonitor;
pub use manager::{ActionHandler, ConnectionInfo, ConnectionManager, HandlerContext, HandlerResult};
pub use metrics::{MetricsSnapshot, RealtimeMetrics};
pub use rate_limit::RateLimiter;
pub use security::{SecurityManager, TokenInfo};
pub use socket::ClientSocket;
pub use timer::OneShot;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Opaque identifier for one tracked connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh connection id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds since the Unix epoch, for wire timestamps
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
