//! Circuit Breaker
//!
//! Finite-state machine guarding one logical protected operation:
//!
//! ```text
//! CLOSED ──failure_threshold──> OPEN ──reset_timeout──> HALF_OPEN
//!   ^                            ^                         │
//!   └────────── success ─────────┴──────── failure ────────┘
//! ```
//!
//! The OPEN→HALF_OPEN transition is scheduled on a timer when the circuit
//! opens, not discovered lazily by the next call. Half-open admits a
//! bounded number of concurrent trial calls; excess trials are rejected as
//! at-capacity without counting against the failure threshold.

use crate::config::BreakerConfig;
use crate::timer::OneShot;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use thiserror::Error;
use tracing::info;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Failing, calls are rejected without invoking the operation
    Open,
    /// Probing recovery with a bounded number of trial calls
    HalfOpen,
}

/// Errors produced by the breaker itself, distinct from operation errors
#[derive(Debug, Error)]
pub enum BreakerError {
    #[error("Circuit '{name}' is open")]
    Open { name: String },

    #[error("Circuit '{name}' is half-open and at trial capacity")]
    AtCapacity { name: String },

    #[error(transparent)]
    Operation(#[from] anyhow::Error),
}

/// Point-in-time breaker statistics
#[derive(Debug, Clone)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
    pub avg_latency_us: f64,
    pub state_changed_at: Instant,
}

struct StateData {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_in_flight: u32,
    reset_timer: Option<OneShot>,
    changed_at: Instant,
}

struct BreakerInner {
    name: String,
    config: BreakerConfig,
    state: Mutex<StateData>,
    total_calls: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    rejected_calls: AtomicU64,
    latency_total_us: AtomicU64,
}

/// Circuit breaker for one protected operation category. Cloning yields a
/// handle to the same breaker.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<BreakerInner>,
}

/// Releases a half-open trial slot on every exit path
struct TrialSlot {
    inner: Arc<BreakerInner>,
}

impl Drop for TrialSlot {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            inner: Arc::new(BreakerInner {
                name: name.into(),
                config,
                state: Mutex::new(StateData {
                    state: CircuitState::Closed,
                    consecutive_failures: 0,
                    half_open_in_flight: 0,
                    reset_timer: None,
                    changed_at: Instant::now(),
                }),
                total_calls: AtomicU64::new(0),
                total_successes: AtomicU64::new(0),
                total_failures: AtomicU64::new(0),
                rejected_calls: AtomicU64::new(0),
                latency_total_us: AtomicU64::new(0),
            }),
        }
    }

    /// Run `operation` under the breaker. Open circuits reject without
    /// invoking the operation; failures count toward the threshold.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let _slot = self.admit()?;

        self.inner.total_calls.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let result = operation().await;
        self.inner
            .latency_total_us
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);

        match result {
            Ok(value) => {
                self.inner.record_success();
                Ok(value)
            }
            Err(err) => {
                self.inner.record_failure();
                Err(BreakerError::Operation(err))
            }
        }
    }

    /// Like `execute`, but an open circuit or failed operation resolves to
    /// the fallback's result instead of an error.
    pub async fn execute_with_fallback<T, F, Fut, FB, FbFut>(
        &self,
        operation: F,
        fallback: FB,
    ) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
        FB: FnOnce() -> FbFut,
        FbFut: std::future::Future<Output = T>,
    {
        match self.execute(operation).await {
            Ok(value) => value,
            Err(_) => fallback().await,
        }
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.inner.state.lock().state
    }

    /// Statistics for observability; recorded on every call regardless of
    /// state.
    pub fn stats(&self) -> BreakerStats {
        let state = self.inner.state.lock();
        let calls = self.inner.total_calls.load(Ordering::Relaxed);
        let total_us = self.inner.latency_total_us.load(Ordering::Relaxed);
        BreakerStats {
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            total_calls: calls,
            total_successes: self.inner.total_successes.load(Ordering::Relaxed),
            total_failures: self.inner.total_failures.load(Ordering::Relaxed),
            rejected_calls: self.inner.rejected_calls.load(Ordering::Relaxed),
            avg_latency_us: if calls == 0 {
                0.0
            } else {
                total_us as f64 / calls as f64
            },
            state_changed_at: state.changed_at,
        }
    }

    /// Cancel any scheduled reset timer. Idempotent; required to avoid
    /// leaking the OPEN→HALF_OPEN callback when discarding a breaker.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        state.reset_timer = None;
    }

    /// Force a state (tests and operational overrides)
    #[doc(hidden)]
    pub fn force_state(&self, new_state: CircuitState) {
        let mut state = self.inner.state.lock();
        let weak = Arc::downgrade(&self.inner);
        state.transition_to(new_state, &self.inner.name, &self.inner.config, weak);
    }

    fn admit(&self) -> Result<Option<TrialSlot>, BreakerError> {
        let mut state = self.inner.state.lock();
        match state.state {
            CircuitState::Closed => Ok(None),
            CircuitState::Open => {
                self.inner.rejected_calls.fetch_add(1, Ordering::Relaxed);
                Err(BreakerError::Open {
                    name: self.inner.name.clone(),
                })
            }
            CircuitState::HalfOpen => {
                if state.half_open_in_flight >= self.inner.config.half_open_max_calls {
                    self.inner.rejected_calls.fetch_add(1, Ordering::Relaxed);
                    return Err(BreakerError::AtCapacity {
                        name: self.inner.name.clone(),
                    });
                }
                state.half_open_in_flight += 1;
                Ok(Some(TrialSlot {
                    inner: self.inner.clone(),
                }))
            }
        }
    }
}

impl BreakerInner {
    fn record_success(self: &Arc<Self>) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        if state.state == CircuitState::HalfOpen {
            let weak = Arc::downgrade(self);
            state.transition_to(CircuitState::Closed, &self.name, &self.config, weak);
        }
    }

    fn record_failure(self: &Arc<Self>) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        state.consecutive_failures += 1;

        let should_open = match state.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => {
                state.consecutive_failures >= self.config.failure_threshold
            }
            CircuitState::Open => false,
        };
        if should_open {
            let weak = Arc::downgrade(self);
            state.transition_to(CircuitState::Open, &self.name, &self.config, weak);
        }
    }
}

impl StateData {
    fn transition_to(
        &mut self,
        new_state: CircuitState,
        name: &str,
        config: &BreakerConfig,
        inner: Weak<BreakerInner>,
    ) {
        if self.state == new_state {
            return;
        }
        info!(
            breaker = name,
            from = ?self.state,
            to = ?new_state,
            "circuit breaker state transition"
        );
        self.state = new_state;
        self.changed_at = Instant::now();
        self.half_open_in_flight = 0;
        self.reset_timer = None;

        if new_state == CircuitState::Open {
            // Schedule the half-open probe window now; nothing polls for it
            let reset = config.reset_timeout;
            self.reset_timer = Some(OneShot::arm(reset, move || {
                if let Some(inner) = inner.upgrade() {
                    let mut state = inner.state.lock();
                    if state.state == CircuitState::Open {
                        let weak = Arc::downgrade(&inner);
                        state.transition_to(
                            CircuitState::HalfOpen,
                            &inner.name,
                            &inner.config,
                            weak,
                        );
                    }
                }
            }));
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}
