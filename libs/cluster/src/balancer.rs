//! Load Balancer
//!
//! Backend node pool with pluggable selection strategies and background
//! health checking. Active nodes are polled on a fixed interval; after
//! `max_failures` consecutive probe failures a node flips inactive and is
//! excluded from selection. A separate, slower recovery loop polls inactive
//! nodes and flips them back on the first success.
//!
//! Probes run against a snapshot of the pool so the node list is never
//! locked across an HTTP call.

use crate::{ClusterError, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Node selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Cyclic index over currently active nodes
    RoundRobin,
    /// Active node with the fewest tracked connections
    LeastConnections,
    /// Probability proportional to configured weight
    WeightedRandom,
}

/// One backend in the pool
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    /// Health-check URL, also handed back to callers on selection
    pub address: String,
    pub weight: u32,
    pub active: bool,
    pub connections: usize,
    pub consecutive_failures: u32,
    pub last_check: Option<Instant>,
}

/// Balancer tuning knobs
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    pub strategy: Strategy,
    /// Poll interval for active nodes
    pub check_interval: Duration,
    /// Poll interval for inactive nodes
    pub recovery_interval: Duration,
    /// Consecutive failures before a node flips inactive
    pub max_failures: u32,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::RoundRobin,
            check_interval: Duration::from_secs(10),
            recovery_interval: Duration::from_secs(30),
            max_failures: 3,
        }
    }
}

/// Health transitions emitted on the balancer's broadcast channel
#[derive(Debug, Clone)]
pub enum BalancerEvent {
    NodeDown { id: String },
    NodeRecovered { id: String },
}

/// Pool counts snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalancerStats {
    pub total_nodes: usize,
    pub active_nodes: usize,
    pub inactive_nodes: usize,
}

/// One health check against a node address. `Ok(())` means healthy.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, address: &str) -> Result<()>;
}

/// HTTP GET probe; any 2xx status is healthy
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClusterError::probe(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, address: &str) -> Result<()> {
        let response = self
            .client
            .get(address)
            .send()
            .await
            .map_err(|e| ClusterError::probe(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ClusterError::probe(format!(
                "Unhealthy status: {}",
                response.status()
            )))
        }
    }
}

struct BalancerInner {
    config: BalancerConfig,
    nodes: RwLock<Vec<Node>>,
    cursor: AtomicUsize,
    probe: Arc<dyn HealthProbe>,
    events: broadcast::Sender<BalancerEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to one node pool. Cloning shares the same pool.
#[derive(Clone)]
pub struct LoadBalancer {
    inner: Arc<BalancerInner>,
}

impl LoadBalancer {
    pub fn new(config: BalancerConfig, probe: Arc<dyn HealthProbe>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(BalancerInner {
                config,
                nodes: RwLock::new(Vec::new()),
                cursor: AtomicUsize::new(0),
                probe,
                events,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Add a node to the pool, active and with zero connections. Replaces
    /// any existing node with the same id.
    pub fn add_node(&self, id: impl Into<String>, address: impl Into<String>, weight: u32) {
        let node = Node {
            id: id.into(),
            address: address.into(),
            weight: weight.max(1),
            active: true,
            connections: 0,
            consecutive_failures: 0,
            last_check: None,
        };
        let mut nodes = self.inner.nodes.write();
        nodes.retain(|n| n.id != node.id);
        info!(node_id = %node.id, address = %node.address, "node added");
        nodes.push(node);
    }

    /// Remove a node from the pool; returns whether it was present
    pub fn remove_node(&self, id: &str) -> bool {
        let mut nodes = self.inner.nodes.write();
        let before = nodes.len();
        nodes.retain(|n| n.id != id);
        nodes.len() != before
    }

    /// Select an active node under the configured strategy
    pub fn select(&self) -> Result<Node> {
        let nodes = self.inner.nodes.read();
        let active: Vec<&Node> = nodes.iter().filter(|n| n.active).collect();
        if active.is_empty() {
            return Err(ClusterError::NoAvailableNodes);
        }

        let chosen = match self.inner.config.strategy {
            Strategy::RoundRobin => {
                let idx = self.inner.cursor.fetch_add(1, Ordering::Relaxed) % active.len();
                active[idx]
            }
            Strategy::LeastConnections => active
                .iter()
                .min_by_key(|n| n.connections)
                .copied()
                .ok_or(ClusterError::NoAvailableNodes)?,
            Strategy::WeightedRandom => {
                let total: u32 = active.iter().map(|n| n.weight).sum();
                let mut roll = rand::thread_rng().gen_range(0..total);
                let mut pick = active[active.len() - 1];
                for &node in &active {
                    if roll < node.weight {
                        pick = node;
                        break;
                    }
                    roll -= node.weight;
                }
                pick
            }
        };
        Ok(chosen.clone())
    }

    /// Track one more in-flight request on a node
    pub fn increment_connections(&self, id: &str) -> Result<()> {
        self.inner.with_node(id, |n| n.connections += 1)
    }

    /// Release one in-flight request on a node
    pub fn decrement_connections(&self, id: &str) -> Result<()> {
        self.inner
            .with_node(id, |n| n.connections = n.connections.saturating_sub(1))
    }

    /// Report a failure observed out-of-band (e.g. a request timeout),
    /// independent of the periodic health check
    pub fn mark_node_unhealthy(&self, id: &str) -> Result<()> {
        let event = {
            let mut nodes = self.inner.nodes.write();
            let node = nodes
                .iter_mut()
                .find(|n| n.id == id)
                .ok_or_else(|| ClusterError::unknown_node(id))?;
            BalancerInner::record_failure(node, self.inner.config.max_failures)
        };
        if let Some(event) = event {
            self.inner.emit(event);
        }
        Ok(())
    }

    /// Start the health-check and recovery loops. A no-op if running.
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        tasks.push(tokio::spawn(health_loop(weak.clone(), false)));
        tasks.push(tokio::spawn(health_loop(weak, true)));
    }

    /// Halt the background loops. Idempotent; the pool itself is kept.
    pub fn stop(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Subscribe to node health transitions
    pub fn subscribe(&self) -> broadcast::Receiver<BalancerEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of every node in the pool
    pub fn nodes(&self) -> Vec<Node> {
        self.inner.nodes.read().clone()
    }

    /// Snapshot of one node
    pub fn node(&self, id: &str) -> Option<Node> {
        self.inner.nodes.read().iter().find(|n| n.id == id).cloned()
    }

    pub fn stats(&self) -> BalancerStats {
        let nodes = self.inner.nodes.read();
        let active = nodes.iter().filter(|n| n.active).count();
        BalancerStats {
            total_nodes: nodes.len(),
            active_nodes: active,
            inactive_nodes: nodes.len() - active,
        }
    }
}

impl Drop for BalancerInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("LoadBalancer")
            .field("strategy", &self.inner.config.strategy)
            .field("active", &stats.active_nodes)
            .field("inactive", &stats.inactive_nodes)
            .finish()
    }
}

/// One loop body serves both roles: `recovery` polls inactive nodes on the
/// slower interval, otherwise active nodes on the check interval.
async fn health_loop(weak: Weak<BalancerInner>, recovery: bool) {
    loop {
        let interval = {
            let Some(inner) = weak.upgrade() else { return };
            if recovery {
                inner.config.recovery_interval
            } else {
                inner.config.check_interval
            }
        };
        tokio::time::sleep(interval).await;

        let Some(inner) = weak.upgrade() else { return };
        let targets: Vec<(String, String)> = inner
            .nodes
            .read()
            .iter()
            .filter(|n| n.active != recovery)
            .map(|n| (n.id.clone(), n.address.clone()))
            .collect();

        for (id, address) in targets {
            let healthy = inner.probe.check(&address).await.is_ok();
            inner.apply_probe_result(&id, healthy, recovery);
        }
    }
}

impl BalancerInner {
    fn with_node(&self, id: &str, f: impl FnOnce(&mut Node)) -> Result<()> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| ClusterError::unknown_node(id))?;
        f(node);
        Ok(())
    }

    fn apply_probe_result(&self, id: &str, healthy: bool, recovery: bool) {
        let event = {
            let mut nodes = self.nodes.write();
            let Some(node) = nodes.iter_mut().find(|n| n.id == id) else {
                return;
            };
            node.last_check = Some(Instant::now());
            match (recovery, healthy) {
                (false, true) => {
                    node.consecutive_failures = 0;
                    None
                }
                (false, false) => Self::record_failure(node, self.config.max_failures),
                (true, true) => {
                    node.active = true;
                    node.consecutive_failures = 0;
                    Some(BalancerEvent::NodeRecovered { id: node.id.clone() })
                }
                (true, false) => {
                    debug!(node_id = %id, "inactive node still unhealthy");
                    None
                }
            }
        };
        if let Some(event) = event {
            self.emit(event);
        }
    }

    fn record_failure(node: &mut Node, max_failures: u32) -> Option<BalancerEvent> {
        node.consecutive_failures += 1;
        if node.active && node.consecutive_failures >= max_failures {
            node.active = false;
            warn!(
                node_id = %node.id,
                failures = node.consecutive_failures,
                "node flipped inactive"
            );
            return Some(BalancerEvent::NodeDown {
                id: node.id.clone(),
            });
        }
        None
    }

    fn emit(&self, event: BalancerEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashmap::DashMap;

    /// Scriptable probe: health per address, defaulting to healthy
    #[derive(Debug, Default)]
    struct ScriptedProbe {
        unhealthy: DashMap<String, bool>,
    }

    impl ScriptedProbe {
        fn set_healthy(&self, address: &str, healthy: bool) {
            self.unhealthy.insert(address.to_string(), !healthy);
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn check(&self, address: &str) -> Result<()> {
            match self.unhealthy.get(address) {
                Some(entry) if *entry => Err(ClusterError::probe("scripted failure")),
                _ => Ok(()),
            }
        }
    }

    fn balancer(strategy: Strategy) -> (LoadBalancer, Arc<ScriptedProbe>) {
        let probe = Arc::new(ScriptedProbe::default());
        let config = BalancerConfig {
            strategy,
            check_interval: Duration::from_millis(10),
            recovery_interval: Duration::from_millis(15),
            max_failures: 2,
        };
        (LoadBalancer::new(config, probe.clone()), probe)
    }

    #[tokio::test]
    async fn test_round_robin_cycles_active_nodes() {
        let (lb, _) = balancer(Strategy::RoundRobin);
        lb.add_node("a", "http://a/health", 1);
        lb.add_node("b", "http://b/health", 1);

        let picks: Vec<String> = (0..4).map(|_| lb.select().unwrap().id).collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }

    #[tokio::test]
    async fn test_least_connections_picks_minimum() {
        let (lb, _) = balancer(Strategy::LeastConnections);
        lb.add_node("a", "http://a/health", 1);
        lb.add_node("b", "http://b/health", 1);

        lb.increment_connections("a").unwrap();
        lb.increment_connections("a").unwrap();
        lb.increment_connections("b").unwrap();
        assert_eq!(lb.select().unwrap().id, "b");

        lb.decrement_connections("a").unwrap();
        lb.decrement_connections("a").unwrap();
        assert_eq!(lb.select().unwrap().id, "a");
    }

    #[tokio::test]
    async fn test_weighted_random_only_picks_active() {
        let (lb, _) = balancer(Strategy::WeightedRandom);
        lb.add_node("heavy", "http://a/health", 10);
        lb.add_node("light", "http://b/health", 1);
        for _ in 0..2 {
            lb.mark_node_unhealthy("light").unwrap();
        }

        for _ in 0..50 {
            assert_eq!(lb.select().unwrap().id, "heavy");
        }
    }

    #[tokio::test]
    async fn test_select_with_no_nodes() {
        let (lb, _) = balancer(Strategy::RoundRobin);
        assert!(matches!(lb.select(), Err(ClusterError::NoAvailableNodes)));
    }

    #[tokio::test]
    async fn test_mark_unhealthy_flips_after_max_failures() {
        let (lb, _) = balancer(Strategy::RoundRobin);
        lb.add_node("a", "http://a/health", 1);
        let mut events = lb.subscribe();

        lb.mark_node_unhealthy("a").unwrap();
        assert!(lb.node("a").unwrap().active);

        lb.mark_node_unhealthy("a").unwrap();
        assert!(!lb.node("a").unwrap().active);
        assert!(matches!(
            events.try_recv().unwrap(),
            BalancerEvent::NodeDown { id } if id == "a"
        ));
    }

    #[tokio::test]
    async fn test_health_loop_downs_and_recovers_node() {
        let (lb, probe) = balancer(Strategy::RoundRobin);
        lb.add_node("a", "http://a/health", 1);
        let mut events = lb.subscribe();
        probe.set_healthy("http://a/health", false);
        lb.start();

        // max_failures=2 at a 10ms check interval
        loop {
            match events.recv().await.unwrap() {
                BalancerEvent::NodeDown { id } => {
                    assert_eq!(id, "a");
                    break;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(!lb.node("a").unwrap().active);
        assert!(lb.select().is_err());

        probe.set_healthy("http://a/health", true);
        loop {
            if let BalancerEvent::NodeRecovered { id } = events.recv().await.unwrap() {
                assert_eq!(id, "a");
                break;
            }
        }
        assert!(lb.node("a").unwrap().active);
        assert_eq!(lb.select().unwrap().id, "a");
        lb.stop();
        lb.stop();
    }

    #[tokio::test]
    async fn test_unknown_node_operations_error() {
        let (lb, _) = balancer(Strategy::RoundRobin);
        assert!(lb.increment_connections("ghost").is_err());
        assert!(lb.mark_node_unhealthy("ghost").is_err());
        assert!(!lb.remove_node("ghost"));
    }
}
