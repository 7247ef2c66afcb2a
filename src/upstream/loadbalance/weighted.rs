use super::UpstreamInstance;
use std::collections::HashMap;
use std::sync::Mutex;

/// Smooth weighted round-robin (the nginx scheme).
///
/// Each selection adds every candidate's weight to its current score, picks
/// the highest score (first in declared order on ties), then subtracts the
/// total weight from the winner. Over any window of sum(w) selections on a
/// fixed candidate set, server i is chosen exactly w_i times, without the
/// bursts a naive weighted rotation produces.
pub struct WeightedBalancer {
    current: Mutex<HashMap<String, i64>>,
}

impl Default for WeightedBalancer {
    fn default() -> Self {
        Self {
            current: Mutex::new(HashMap::new()),
        }
    }
}

impl WeightedBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&self, candidates: &[UpstreamInstance]) -> Option<UpstreamInstance> {
        let mut current = self.current.lock().unwrap();
        let total: i64 = candidates.iter().map(|c| c.weight as i64).sum();

        let mut best: Option<usize> = None;
        let mut best_score = i64::MIN;
        for (i, candidate) in candidates.iter().enumerate() {
            let score = current.entry(candidate.id.clone()).or_insert(0);
            *score += candidate.weight as i64;
            if *score > best_score {
                best_score = *score;
                best = Some(i);
            }
        }

        let winner = &candidates[best?];
        *current.get_mut(&winner.id).unwrap() -= total;
        Some(winner.clone())
    }
}
