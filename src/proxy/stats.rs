//! Per-engine request statistics: plain integer counters plus a
//! fixed-bucket exponential latency histogram, mirrored to the metrics
//! recorder for the /metrics endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Exponential bucket upper bounds in milliseconds: 1, 2, 4, ... 16384.
pub const LATENCY_BUCKETS_MS: [u64; 15] = [
    1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16_384,
];

pub struct ProxyStats {
    pub total: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    /// One slot per bucket bound plus an overflow slot.
    latency: [AtomicU64; 16],
}

impl Default for ProxyStats {
    fn default() -> Self {
        Self {
            total: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            latency: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl ProxyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, latency: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    pub fn record_failure(&self, latency: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    fn record_latency(&self, latency: Duration) {
        let ms = latency.as_millis() as u64;
        let slot = LATENCY_BUCKETS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.latency[slot].fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    /// Cumulative counts per latency bucket (last slot is overflow).
    pub fn latency_buckets(&self) -> [u64; 16] {
        let mut out = [0u64; 16];
        for (i, slot) in self.latency.iter().enumerate() {
            out[i] = slot.load(Ordering::Relaxed);
        }
        out
    }
}
