//! Cluster Coordination
//!
//! Two independent concerns for multi-instance deployments: a load balancer
//! over backend nodes with background health checking, and pub/sub cluster
//! membership with heartbeats and peer-to-peer broadcast fan-out.

pub mod balancer;
pub mod error;
pub mod membership;

pub use balancer::{
    BalancerConfig, BalancerEvent, BalancerStats, HealthProbe, HttpHealthProbe, LoadBalancer,
    Node, Strategy,
};
pub use error::{ClusterError, Result};
pub use membership::{ClusterConfig, ClusterEvent, ClusterManager, ClusterStats, PeerInfo};
