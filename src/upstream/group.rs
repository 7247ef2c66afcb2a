//! Runtime representation of an upstream group: the live counterpart of the
//! declarative `UpstreamConfig`, owning load-balancer state, health state,
//! affinity, and failure accounting for its servers.

use crate::config::UpstreamConfig;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use super::affinity::{AffinityMap, FailureTracker};
use super::health::HealthState;
use super::loadbalance::{LoadBalancer, UpstreamInstance};

pub struct UpstreamGroup {
    pub id: String,
    config: UpstreamConfig,
    /// Enabled servers in declared order.
    servers: Vec<UpstreamInstance>,
    lb: LoadBalancer,
    pub health: Arc<HealthState>,
    pub affinity: Option<Arc<AffinityMap>>,
    pub failures: Option<FailureTracker>,
}

impl UpstreamGroup {
    pub fn new(id: impl Into<String>, config: UpstreamConfig) -> Self {
        let servers: Vec<UpstreamInstance> = config
            .servers
            .iter()
            .filter(|s| s.enabled)
            .map(UpstreamInstance::from)
            .collect();
        let lb = LoadBalancer::new(config.load_balancing_strategy);
        let affinity = config
            .session_affinity
            .clone()
            .map(|cfg| Arc::new(AffinityMap::new(cfg)));
        let failures = config.failover.clone().map(FailureTracker::new);

        Self {
            id: id.into(),
            config,
            servers,
            lb,
            health: Arc::new(HealthState::new()),
            affinity,
            failures,
        }
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    pub fn instances(&self) -> &[UpstreamInstance] {
        &self.servers
    }

    pub fn server(&self, id: &str) -> Option<&UpstreamInstance> {
        self.servers.iter().find(|s| s.id == id)
    }

    /// Per-request deadline for this group.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.config.timeout)
    }

    pub fn retry_budget(&self) -> u32 {
        self.config
            .retry_policy
            .as_ref()
            .map(|r| r.max_retries)
            .unwrap_or(0)
    }

    /// The currently selectable servers in declared order: enabled, not
    /// probe-confirmed unhealthy, and not marked down by failure
    /// accounting.
    pub fn selectable_subset(&self) -> Vec<UpstreamInstance> {
        self.servers
            .iter()
            .filter(|s| self.health.is_selectable(&s.id))
            .filter(|s| {
                self.failures
                    .as_ref()
                    .map(|f| !f.is_down(&s.id))
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// Whether `server_id` is in the selectable subset right now.
    pub fn is_available(&self, server_id: &str) -> bool {
        self.server(server_id).is_some()
            && self.health.is_selectable(server_id)
            && self
                .failures
                .as_ref()
                .map(|f| !f.is_down(server_id))
                .unwrap_or(true)
    }

    pub fn select(
        &self,
        candidates: &[UpstreamInstance],
        client_ip: IpAddr,
    ) -> Option<UpstreamInstance> {
        self.lb.select(candidates, client_ip)
    }

    pub fn record_failure(&self, server_id: &str) {
        self.health.record_passive_failure(server_id);
        if let Some(failures) = &self.failures {
            failures.record_failure(server_id);
        }
    }
}

/// Registry of live groups keyed by stable id. Routes reference groups by
/// id only; the records hold plain data and no back-references.
#[derive(Clone, Default)]
pub struct GroupStore {
    groups: Arc<DashMap<String, Arc<UpstreamGroup>>>,
}

impl GroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Arc<UpstreamGroup>> {
        self.groups.get(id).map(|entry| entry.value().clone())
    }

    pub fn insert(&self, group: UpstreamGroup) {
        self.groups.insert(group.id.clone(), Arc::new(group));
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn for_each(&self, mut f: impl FnMut(&str, &Arc<UpstreamGroup>)) {
        for entry in self.groups.iter() {
            f(entry.key(), entry.value());
        }
    }

    /// All affinity maps, for the session cleanup timer.
    pub fn affinity_maps(&self) -> Vec<Arc<AffinityMap>> {
        let mut maps = Vec::new();
        self.for_each(|_, group| {
            if let Some(map) = &group.affinity {
                maps.push(map.clone());
            }
        });
        maps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoadBalancingStrategy, Scheme, ServerConfig};

    fn group_with(servers: Vec<ServerConfig>) -> UpstreamGroup {
        UpstreamGroup::new(
            "g1",
            UpstreamConfig {
                servers,
                load_balancing_strategy: LoadBalancingStrategy::RoundRobin,
                health_check: None,
                session_affinity: None,
                failover: Some(crate::config::FailoverConfig {
                    max_failures: 2,
                    window: 10.0,
                    cooldown: 30.0,
                }),
                retry_policy: None,
                timeout: 30.0,
                tls_verify: true,
            },
        )
    }

    fn server(id: &str, enabled: bool) -> ServerConfig {
        ServerConfig {
            id: id.to_string(),
            host: "127.0.0.1".to_string(),
            port: 9000,
            protocol: Scheme::Http,
            weight: 1,
            enabled,
        }
    }

    #[test]
    fn test_disabled_servers_excluded_at_build() {
        let group = group_with(vec![server("a", true), server("b", false)]);
        assert_eq!(group.instances().len(), 1);
        assert_eq!(group.instances()[0].id, "a");
    }

    #[test]
    fn test_subset_excludes_unhealthy() {
        let group = group_with(vec![server("a", true), server("b", true)]);
        group.health.record_probe("a", false, 1, 1);
        let subset = group.selectable_subset();
        assert_eq!(subset.len(), 1);
        assert_eq!(subset[0].id, "b");
    }

    #[test]
    fn test_subset_excludes_marked_down() {
        let group = group_with(vec![server("a", true), server("b", true)]);
        group.record_failure("a");
        group.record_failure("a");
        let subset = group.selectable_subset();
        assert_eq!(subset.len(), 1);
        assert_eq!(subset[0].id, "b");
        assert!(!group.is_available("a"));
    }
}
