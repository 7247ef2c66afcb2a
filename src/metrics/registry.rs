use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Latency histogram bounds in seconds: 1ms doubling up to ~16s.
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.002, 0.004, 0.008, 0.016, 0.032, 0.064, 0.128, 0.256, 0.512, 1.024, 2.048, 4.096,
    8.192, 16.384,
];

/// Thin handle around the global Prometheus recorder.
///
/// After `Metrics::install()` the `metrics` crate macros can be used
/// anywhere in the codebase; the handle is retained solely for rendering
/// the `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global recorder and register metric descriptions. Call
    /// once at startup. Falls back to the already-installed recorder in
    /// test binaries that build several runtimes.
    pub fn install() -> Option<Self> {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .ok()?;

        describe_gauge!(
            "proxy_engine_state",
            Unit::Count,
            "Runtime state: 0 stopped, 1 starting, 2 running, 3 stopping, 4 error"
        );
        describe_gauge!(
            "proxy_engine_uptime_seconds",
            Unit::Seconds,
            "Seconds since the runtime entered the running state"
        );
        describe_gauge!(
            "proxy_engine_active_gateways",
            Unit::Count,
            "Number of bound listeners"
        );
        describe_gauge!(
            "proxy_engine_memory_heap_used_bytes",
            Unit::Bytes,
            "Process data segment size"
        );
        describe_gauge!(
            "proxy_engine_memory_heap_total_bytes",
            Unit::Bytes,
            "Total program size"
        );
        describe_gauge!(
            "proxy_engine_memory_rss_bytes",
            Unit::Bytes,
            "Resident set size"
        );

        describe_counter!(
            "proxy_engine_requests_total",
            Unit::Count,
            "Total requests processed"
        );
        describe_histogram!(
            "proxy_engine_request_duration_seconds",
            Unit::Seconds,
            "Request duration from the client's perspective"
        );
        describe_counter!(
            "proxy_engine_upstream_retries_total",
            Unit::Count,
            "Upstream retry attempts"
        );
        describe_counter!(
            "proxy_engine_bytes_in_total",
            Unit::Bytes,
            "Request bytes read from clients"
        );
        describe_counter!(
            "proxy_engine_bytes_out_total",
            Unit::Bytes,
            "Response bytes written to clients"
        );

        describe_counter!(
            "proxy_engine_connections_total",
            Unit::Count,
            "Client connections accepted"
        );
        describe_gauge!(
            "proxy_engine_connections_active",
            Unit::Count,
            "Client connections currently open"
        );
        describe_counter!(
            "proxy_engine_connections_rejected_total",
            Unit::Count,
            "Accepts rejected by the max-connection cap"
        );

        describe_counter!(
            "proxy_engine_pool_reuse_total",
            Unit::Count,
            "Pooled connections handed out from the idle set"
        );
        describe_counter!(
            "proxy_engine_pool_wait_total",
            Unit::Count,
            "Pool acquires that had to wait for a release"
        );
        describe_counter!(
            "proxy_engine_pool_reaped_total",
            Unit::Count,
            "Idle pooled connections discarded by the reaper"
        );

        describe_counter!(
            "proxy_engine_health_probe_total",
            Unit::Count,
            "Active health probe attempts"
        );
        describe_gauge!(
            "proxy_engine_upstream_health_status",
            Unit::Count,
            "Upstream health: 1 healthy, 0 unhealthy"
        );
        describe_counter!(
            "proxy_engine_failover_marked_down_total",
            Unit::Count,
            "Servers marked down by failure accounting"
        );

        describe_counter!(
            "proxy_engine_auth_rejected_total",
            Unit::Count,
            "Requests rejected by the auth middleware"
        );
        describe_counter!(
            "proxy_engine_rate_limited_total",
            Unit::Count,
            "Requests rejected by the rate limiter"
        );

        Some(Self { handle })
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
