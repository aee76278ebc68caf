//! Heartbeat Monitor
//!
//! Liveness detection over all tracked sockets with a single shared ping
//! scheduler instead of one timer per connection. Each sweep pings every
//! open socket and arms a per-socket pong timeout; `max_missed` consecutive
//! misses hands the connection to the caller-supplied timeout callback.
//! Timer usage is O(1) in the number of connections for the scheduler plus
//! one armed `OneShot` per in-flight pong.

use crate::config::HeartbeatConfig;
use crate::socket::ClientSocket;
use crate::timer::OneShot;
use crate::ConnectionId;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Invoked when a connection misses too many heartbeats; expected to remove
/// the connection from the owning registry.
pub type TimeoutCallback = Arc<dyn Fn(ConnectionId) + Send + Sync>;

#[derive(Debug)]
struct Tracked {
    socket: Arc<dyn ClientSocket>,
    missed: u32,
    pong_timer: Option<OneShot>,
}

struct HeartbeatInner {
    config: HeartbeatConfig,
    tracked: DashMap<ConnectionId, Tracked>,
    tick_task: Mutex<Option<JoinHandle<()>>>,
    on_timeout: TimeoutCallback,
}

/// Shared ping scheduler for all tracked connections
pub struct HeartbeatMonitor {
    inner: Arc<HeartbeatInner>,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig, on_timeout: TimeoutCallback) -> Self {
        Self {
            inner: Arc::new(HeartbeatInner {
                config,
                tracked: DashMap::new(),
                tick_task: Mutex::new(None),
                on_timeout,
            }),
        }
    }

    /// Start the shared ping scheduler. Idempotent: an already-running
    /// scheduler is stopped and restarted.
    pub fn start(&self) {
        self.stop();

        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick would ping before any pong could
            // possibly have arrived; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { return };
                inner.sweep().await;
            }
        });

        *self.inner.tick_task.lock() = Some(task);
    }

    /// Stop the scheduler and cancel every pending pong timeout. Tracked
    /// connections are kept, so `start` resumes monitoring them.
    pub fn stop(&self) {
        if let Some(task) = self.inner.tick_task.lock().take() {
            task.abort();
        }
        for mut entry in self.inner.tracked.iter_mut() {
            entry.pong_timer = None;
        }
    }

    /// Begin monitoring a socket
    pub fn track(&self, id: ConnectionId, socket: Arc<dyn ClientSocket>) {
        self.inner.tracked.insert(
            id,
            Tracked {
                socket,
                missed: 0,
                pong_timer: None,
            },
        );
    }

    /// Stop monitoring a socket; idempotent
    pub fn untrack(&self, id: ConnectionId) {
        self.inner.tracked.remove(&id);
    }

    /// Record a received pong: clears the pending timeout and the missed
    /// counter for this connection.
    pub fn record_pong(&self, id: ConnectionId) {
        if let Some(mut entry) = self.inner.tracked.get_mut(&id) {
            entry.pong_timer = None;
            entry.missed = 0;
        }
    }

    /// Number of connections currently monitored
    pub fn tracked_count(&self) -> usize {
        self.inner.tracked.len()
    }

    /// Whether the scheduler is running
    pub fn is_running(&self) -> bool {
        self.inner
            .tick_task
            .lock()
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }
}

impl HeartbeatInner {
    /// One scheduler tick: ping every open socket and arm its pong timeout
    async fn sweep(self: &Arc<Self>) {
        let targets: Vec<(ConnectionId, Arc<dyn ClientSocket>)> = self
            .tracked
            .iter()
            .filter(|e| e.socket.is_open())
            .map(|e| (*e.key(), e.socket.clone()))
            .collect();

        for (id, socket) in targets {
            if let Err(e) = socket.ping().await {
                debug!(connection_id = %id, error = %e, "heartbeat ping failed");
            }

            let weak = Arc::downgrade(self);
            let timer = OneShot::arm(self.config.pong_timeout, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_pong_timeout(id);
                }
            });
            if let Some(mut entry) = self.tracked.get_mut(&id) {
                // Replacing the handle cancels any previous timeout
                entry.pong_timer = Some(timer);
            }
        }
    }

    fn on_pong_timeout(self: Arc<Self>, id: ConnectionId) {
        let expired = match self.tracked.get_mut(&id) {
            Some(mut entry) => {
                entry.missed += 1;
                entry.pong_timer = None;
                debug!(connection_id = %id, missed = entry.missed, "missed heartbeat");
                entry.missed >= self.config.max_missed
            }
            None => return,
        };

        if expired {
            // Drop the map guard before the callback: it usually calls
            // back into untrack for the same id.
            self.tracked.remove(&id);
            warn!(connection_id = %id, "heartbeat timeout, removing connection");
            (self.on_timeout)(id);
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for HeartbeatMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatMonitor")
            .field("tracked", &self.inner.tracked.len())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockSocket;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fast_config() -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(20),
            pong_timeout: Duration::from_millis(15),
            max_missed: 3,
        }
    }

    fn monitor_with_counter(config: HeartbeatConfig) -> (HeartbeatMonitor, Arc<AtomicUsize>) {
        let timeouts = Arc::new(AtomicUsize::new(0));
        let counter = timeouts.clone();
        let monitor = HeartbeatMonitor::new(
            config,
            Arc::new(move |_id| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (monitor, timeouts)
    }

    #[tokio::test]
    async fn test_pings_tracked_sockets() {
        let (monitor, _) = monitor_with_counter(fast_config());
        let socket = Arc::new(MockSocket::new());
        monitor.track(ConnectionId::new(), socket.clone());
        monitor.start();

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(socket.ping_count() >= 2);
        monitor.stop();
    }

    #[tokio::test]
    async fn test_timeout_fires_after_max_missed() {
        let (monitor, timeouts) = monitor_with_counter(fast_config());
        let socket = Arc::new(MockSocket::new());
        let id = ConnectionId::new();
        monitor.track(id, socket);
        monitor.start();

        // No pongs ever arrive: 3 misses at ~35ms apart
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.tracked_count(), 0);
        monitor.stop();
    }

    #[tokio::test]
    async fn test_pong_clears_missed_counter() {
        let (monitor, timeouts) = monitor_with_counter(fast_config());
        let socket = Arc::new(MockSocket::new());
        let id = ConnectionId::new();
        monitor.track(id, socket);
        monitor.start();

        // Answer every ping for a while
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            monitor.record_pong(id);
        }
        assert_eq!(timeouts.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.tracked_count(), 1);
        monitor.stop();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (monitor, timeouts) = monitor_with_counter(fast_config());
        monitor.track(ConnectionId::new(), Arc::new(MockSocket::new()));
        monitor.start();
        monitor.stop();
        monitor.stop();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(timeouts.load(Ordering::SeqCst), 0);
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (monitor, _) = monitor_with_counter(fast_config());
        monitor.start();
        monitor.start();
        assert!(monitor.is_running());
        monitor.stop();
    }

    #[tokio::test]
    async fn test_closed_sockets_are_not_pinged() {
        let (monitor, _) = monitor_with_counter(fast_config());
        let socket = Arc::new(MockSocket::new());
        socket.close().await;
        monitor.track(ConnectionId::new(), socket.clone());
        monitor.start();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(socket.ping_count(), 0);
        monitor.stop();
    }
}
