pub mod affinity;
pub mod group;
pub mod health;
pub mod loadbalance;
pub mod transport;

pub use affinity::{AffinityMap, FailureTracker};
pub use group::{GroupStore, UpstreamGroup};
pub use health::{build_probe_client, spawn_health_checks, HealthState, HealthStatus};
pub use loadbalance::{LoadBalancer, RequestGuard, UpstreamInstance};
pub use transport::{Connector, UpstreamIo};
