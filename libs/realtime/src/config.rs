//! Configuration Types
//!
//! Per-component configuration with production defaults. Everything is
//! serde-deserializable so a composition root can load one file and hand
//! each component its section.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// How long `send_request` waits for a correlated response
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    pub rate_limit: RateLimitConfig,
    pub heartbeat: HeartbeatConfig,
    pub compression: CompressionConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            rate_limit: RateLimitConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            compression: CompressionConfig::default(),
        }
    }
}

/// Fixed-window rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Window length
    #[serde(with = "duration_ms")]
    pub window: Duration,
    /// Requests admitted per window per key
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 100,
        }
    }
}

/// Heartbeat monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between ping sweeps
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    /// How long to wait for a pong before counting a miss
    #[serde(with = "duration_ms")]
    pub pong_timeout: Duration,
    /// Consecutive misses before the connection is declared dead
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            max_missed: 3,
        }
    }
}

/// Frame compression configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// Frames smaller than this are never compressed
    pub threshold_bytes: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_bytes: 1024,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// How long the circuit stays open before a half-open probe window
    #[serde(with = "duration_ms")]
    pub reset_timeout: Duration,
    /// Concurrent trial calls admitted while half-open
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

/// Security manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Token lifetime
    #[serde(with = "duration_ms")]
    pub token_ttl: Duration,
    /// Active tokens allowed per user; issuing past the cap evicts oldest
    pub max_tokens_per_user: usize,
    /// Concurrent connections allowed per remote IP
    pub max_connections_per_ip: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            token_ttl: Duration::from_secs(3600),
            max_tokens_per_user: 5,
            max_connections_per_ip: 20,
        }
    }
}

/// Serialize durations as integer milliseconds on the wire
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
