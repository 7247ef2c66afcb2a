//! Active upstream health probing plus passive failure feedback.
//!
//! Active probes own all state transitions: N consecutive failing probes
//! mark a server unhealthy, M consecutive passes bring it back. Data-path
//! failures are recorded but never change state.

use crate::config::HealthCheckConfig;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::group::{GroupStore, UpstreamGroup};

const PROBE_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

const STATUS_UNKNOWN: u8 = 0;
const STATUS_HEALTHY: u8 = 1;
const STATUS_UNHEALTHY: u8 = 2;

#[derive(Default)]
struct NodeHealth {
    status: AtomicU8,
    /// Consecutive probe results in the current direction.
    streak: AtomicU32,
    passive_failures: AtomicU64,
}

/// Health state per server id. Writer is the health monitor; the proxy
/// handler only reads.
#[derive(Default)]
pub struct HealthState {
    nodes: DashMap<String, NodeHealth>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, server_id: &str) -> HealthStatus {
        match self.nodes.get(server_id) {
            Some(node) => match node.status.load(Ordering::Acquire) {
                STATUS_HEALTHY => HealthStatus::Healthy,
                STATUS_UNHEALTHY => HealthStatus::Unhealthy,
                _ => HealthStatus::Unknown,
            },
            None => HealthStatus::Unknown,
        }
    }

    /// Unknown servers are selectable; only a confirmed-unhealthy server is
    /// excluded from the subset.
    pub fn is_selectable(&self, server_id: &str) -> bool {
        self.status(server_id) != HealthStatus::Unhealthy
    }

    pub fn passive_failures(&self, server_id: &str) -> u64 {
        self.nodes
            .get(server_id)
            .map(|n| n.passive_failures.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Data-path failure feedback. Recorded only — active probes own the
    /// state transitions.
    pub fn record_passive_failure(&self, server_id: &str) {
        self.node(server_id)
            .passive_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Apply one active probe result, transitioning state at the
    /// configured streak thresholds.
    pub fn record_probe(
        &self,
        server_id: &str,
        passed: bool,
        healthy_threshold: u32,
        unhealthy_threshold: u32,
    ) -> HealthStatus {
        let node = self.node(server_id);
        let status = node.status.load(Ordering::Acquire);

        if passed {
            match status {
                STATUS_HEALTHY => {
                    node.streak.store(0, Ordering::Relaxed);
                }
                _ => {
                    let streak = node.streak.fetch_add(1, Ordering::Relaxed) + 1;
                    // A single pass promotes an unknown server; a previously
                    // unhealthy one needs the full healthy streak.
                    let needed = if status == STATUS_UNHEALTHY {
                        healthy_threshold
                    } else {
                        1
                    };
                    if streak >= needed {
                        node.status.store(STATUS_HEALTHY, Ordering::Release);
                        node.streak.store(0, Ordering::Relaxed);
                    }
                }
            }
        } else {
            match status {
                STATUS_UNHEALTHY => {
                    node.streak.store(0, Ordering::Relaxed);
                }
                _ => {
                    let streak = node.streak.fetch_add(1, Ordering::Relaxed) + 1;
                    if streak >= unhealthy_threshold {
                        node.status.store(STATUS_UNHEALTHY, Ordering::Release);
                        node.streak.store(0, Ordering::Relaxed);
                    }
                }
            }
        }
        self.status(server_id)
    }

    fn node(&self, server_id: &str) -> dashmap::mapref::one::Ref<'_, String, NodeHealth> {
        if let Some(node) = self.nodes.get(server_id) {
            return node;
        }
        self.nodes
            .entry(server_id.to_string())
            .or_default()
            .downgrade()
    }
}

/// Build the shared probe client.
pub fn build_probe_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .no_proxy()
        .build()
        .expect("failed to build health probe client")
}

/// Spawn one probe loop per group that has health checking configured.
/// The loops stop when `cancel` fires; cancelling twice is a no-op.
pub fn spawn_health_checks(
    groups: &GroupStore,
    client: reqwest::Client,
    tracker: &TaskTracker,
    cancel: CancellationToken,
) {
    groups.for_each(|_, group| {
        let Some(hc) = group.config().health_check.clone() else {
            return;
        };
        let group = group.clone();
        let client = client.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            let interval = Duration::from_secs_f64(hc.interval);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => return,
                }
                probe_group(&client, &group, &hc).await;
            }
        });
    });
}

/// One probe round over a group's enabled servers.
pub async fn probe_group(client: &reqwest::Client, group: &Arc<UpstreamGroup>, hc: &HealthCheckConfig) {
    stream::iter(group.instances().to_vec())
        .map(|server| {
            let client = client.clone();
            let group = group.clone();
            let hc = hc.clone();
            async move {
                probe_one(&client, &group, &hc, &server).await;
            }
        })
        .buffer_unordered(PROBE_CONCURRENCY)
        .collect::<()>()
        .await;
}

async fn probe_one(
    client: &reqwest::Client,
    group: &Arc<UpstreamGroup>,
    hc: &HealthCheckConfig,
    server: &super::loadbalance::UpstreamInstance,
) {
    let url = format!(
        "{}://{}:{}{}",
        server.scheme, server.host, server.port, hc.path
    );
    let method =
        reqwest::Method::from_bytes(hc.method.as_bytes()).unwrap_or(reqwest::Method::GET);

    let result = client
        .request(method, &url)
        .timeout(Duration::from_secs_f64(hc.timeout))
        .send()
        .await;

    let passed = match result {
        Ok(resp) => resp.status().as_u16() == hc.expected_status,
        Err(_) => false,
    };

    let before = group.health.status(&server.id);
    let after = group.health.record_probe(
        &server.id,
        passed,
        hc.healthy_threshold,
        hc.unhealthy_threshold,
    );

    metrics::counter!(
        "proxy_engine_health_probe_total",
        "group" => group.id.clone(),
        "server" => server.id.clone(),
        "result" => if passed { "pass" } else { "fail" },
    )
    .increment(1);

    if before != after {
        metrics::gauge!(
            "proxy_engine_upstream_health_status",
            "group" => group.id.clone(),
            "server" => server.id.clone(),
        )
        .set(if after == HealthStatus::Healthy { 1.0 } else { 0.0 });
        match after {
            HealthStatus::Unhealthy => warn!(
                "health: server marked unhealthy, group={}, server={}",
                group.id, server.id
            ),
            _ => debug!(
                "health: server status changed, group={}, server={}, status={:?}",
                group.id, server.id, after
            ),
        }
    }
}
