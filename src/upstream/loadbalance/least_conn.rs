use super::UpstreamInstance;

/// Fewest in-flight requests wins; ties break by declared order.
#[derive(Default)]
pub struct LeastConnBalancer;

impl LeastConnBalancer {
    pub fn new() -> Self {
        Self
    }

    pub fn select(&self, candidates: &[UpstreamInstance]) -> Option<UpstreamInstance> {
        // First-wins on ties, so declared order decides between equals.
        let mut best: Option<&UpstreamInstance> = None;
        let mut best_active = usize::MAX;
        for candidate in candidates {
            let active = candidate.active();
            if active < best_active {
                best_active = active;
                best = Some(candidate);
            }
        }
        best.cloned()
    }
}
