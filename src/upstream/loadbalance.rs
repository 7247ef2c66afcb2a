//! Load-balancing strategies over the healthy subset of a group's servers.
//!
//! Enum-based dispatch, no trait objects. Every strategy receives the
//! candidate slice in declared order plus the client IP and returns one
//! instance; in-flight accounting is attributed by the proxy handler via
//! [`RequestGuard`].

pub mod ip_hash;
pub mod least_conn;
pub mod round_robin;
pub mod weighted;

use crate::config::{LoadBalancingStrategy, Scheme, ServerConfig};
use ip_hash::IpHashBalancer;
use least_conn::LeastConnBalancer;
use round_robin::RoundRobinBalancer;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use weighted::WeightedBalancer;

/// A server with its shared per-request counters. Cheap to clone — the
/// counters are behind `Arc`.
#[derive(Debug, Clone)]
pub struct UpstreamInstance {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub scheme: Scheme,
    pub weight: u32,
    pub active_requests: Arc<AtomicUsize>,
    /// Pre-computed "host:port", shared so selection never allocates.
    endpoint: Arc<str>,
}

impl UpstreamInstance {
    #[inline]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn active(&self) -> usize {
        self.active_requests.load(Ordering::Relaxed)
    }

    /// Attribute an in-flight request to this server. The returned guard
    /// decrements the counter when the request completes or fails, so the
    /// next selection always sees the post-decrement value.
    pub fn begin_request(&self) -> RequestGuard {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
        RequestGuard {
            counter: self.active_requests.clone(),
        }
    }
}

impl From<&ServerConfig> for UpstreamInstance {
    fn from(server: &ServerConfig) -> Self {
        let endpoint: Arc<str> = format!("{}:{}", server.host, server.port).into();
        Self {
            id: server.id.clone(),
            host: server.host.clone(),
            port: server.port,
            scheme: server.protocol,
            weight: server.weight.max(1),
            active_requests: Arc::new(AtomicUsize::new(0)),
            endpoint,
        }
    }
}

/// RAII in-flight marker.
pub struct RequestGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

pub enum LoadBalancer {
    RoundRobin(RoundRobinBalancer),
    Weighted(WeightedBalancer),
    LeastConnections(LeastConnBalancer),
    IpHash(IpHashBalancer),
}

impl LoadBalancer {
    pub fn new(strategy: LoadBalancingStrategy) -> Self {
        match strategy {
            LoadBalancingStrategy::RoundRobin => Self::RoundRobin(RoundRobinBalancer::new()),
            LoadBalancingStrategy::Weighted => Self::Weighted(WeightedBalancer::new()),
            LoadBalancingStrategy::LeastConnections => {
                Self::LeastConnections(LeastConnBalancer::new())
            }
            LoadBalancingStrategy::IpHash => Self::IpHash(IpHashBalancer::new()),
        }
    }

    /// Pick one instance from the healthy subset, in declared order.
    pub fn select(
        &self,
        candidates: &[UpstreamInstance],
        client_ip: IpAddr,
    ) -> Option<UpstreamInstance> {
        if candidates.is_empty() {
            return None;
        }
        match self {
            Self::RoundRobin(lb) => lb.select(candidates),
            Self::Weighted(lb) => lb.select(candidates),
            Self::LeastConnections(lb) => lb.select(candidates),
            Self::IpHash(lb) => lb.select(candidates, client_ip),
        }
    }
}
