use super::UpstreamInstance;
use std::sync::atomic::{AtomicU64, Ordering};

/// Circular counter modulo the candidate count. Server order is the
/// declared order, so a stable subset yields strict alternation.
pub struct RoundRobinBalancer {
    counter: AtomicU64,
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&self, candidates: &[UpstreamInstance]) -> Option<UpstreamInstance> {
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        let idx = (count % candidates.len() as u64) as usize;
        Some(candidates[idx].clone())
    }
}
