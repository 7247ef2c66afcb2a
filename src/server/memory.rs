//! Process memory sampling for the metrics endpoint and the threshold
//! watchdog, read from `/proc/self/statm`.

use crate::config::MemoryConfig;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, warn};

const SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryUsage {
    /// Data segment size — the closest statm proxy for live heap bytes.
    pub heap_used: u64,
    /// Total program size.
    pub heap_total: u64,
    /// Resident set size.
    pub rss: u64,
}

/// Sample current process memory. Returns zeroes on platforms without
/// procfs rather than failing the caller.
pub fn sample() -> MemoryUsage {
    match std::fs::read_to_string("/proc/self/statm") {
        Ok(statm) => parse_statm(&statm).unwrap_or_default(),
        Err(_) => MemoryUsage::default(),
    }
}

/// statm fields are page counts: size resident shared text lib data dt.
fn parse_statm(content: &str) -> Option<MemoryUsage> {
    let page_size = 4096u64;
    let mut fields = content.split_whitespace();
    let size: u64 = fields.next()?.parse().ok()?;
    let resident: u64 = fields.next()?.parse().ok()?;
    let _shared = fields.next()?;
    let _text = fields.next()?;
    let _lib = fields.next()?;
    let data: u64 = fields.next()?.parse().ok()?;
    Some(MemoryUsage {
        heap_used: data * page_size,
        heap_total: size * page_size,
        rss: resident * page_size,
    })
}

/// Record the current sample into the metrics gauges.
pub fn record_gauges() {
    let usage = sample();
    metrics::gauge!("proxy_engine_memory_heap_used_bytes").set(usage.heap_used as f64);
    metrics::gauge!("proxy_engine_memory_heap_total_bytes").set(usage.heap_total as f64);
    metrics::gauge!("proxy_engine_memory_rss_bytes").set(usage.rss as f64);
}

/// Periodic sampler plus the warning/critical threshold watchdog.
pub fn spawn_watchdog(
    config: Option<MemoryConfig>,
    tracker: &TaskTracker,
    cancel: CancellationToken,
) {
    tracker.spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(SAMPLE_INTERVAL) => {}
                _ = cancel.cancelled() => return,
            }
            let usage = sample();
            record_gauges();
            if let Some(thresholds) = &config {
                if usage.heap_used >= thresholds.critical_threshold {
                    error!(
                        heap_used = usage.heap_used,
                        threshold = thresholds.critical_threshold,
                        "memory usage above critical threshold"
                    );
                } else if usage.heap_used >= thresholds.warning_threshold {
                    warn!(
                        heap_used = usage.heap_used,
                        threshold = thresholds.warning_threshold,
                        "memory usage above warning threshold"
                    );
                }
            }
        }
    });
}
