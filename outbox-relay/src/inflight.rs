//! In-flight tracker (C5): which row ids are currently claimed by the
//! producer pipeline, with a monotonic elapsed-time stamp so a system
//! clock step cannot cause premature or delayed sweeps, and so a
//! `stuckThreshold` configured in real seconds means what it says.

use crate::clock::now_millis;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Lock-free concurrent set of claimed row ids, keyed by id, valued by the
/// elapsed-millis clock reading at claim time.
#[derive(Clone)]
pub struct InFlightTracker {
    claims: Arc<DashMap<i64, u64>>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self {
            claims: Arc::new(DashMap::new()),
        }
    }

    /// Returns true iff `id` was not already tracked, and is now tracked
    /// with a fresh claim timestamp.
    pub fn try_claim(&self, id: i64) -> bool {
        let claimed_at = now_millis();
        match self.claims.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(claimed_at);
                true
            }
        }
    }

    /// Removes `id` unconditionally.
    pub fn release(&self, id: i64) {
        self.claims.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Forcibly removes entries claimed longer than `stuck_threshold` ago,
    /// returning the count removed. Each removal is logged as a reaper
    /// alert: it implies a worker hang.
    pub fn sweep(&self, stuck_threshold: Duration) -> usize {
        let now = now_millis();
        let threshold_ms = stuck_threshold.as_millis() as u64;
        let stuck: Vec<i64> = self
            .claims
            .iter()
            .filter(|entry| now.saturating_sub(*entry.value()) > threshold_ms)
            .map(|entry| *entry.key())
            .collect();

        for id in &stuck {
            self.claims.remove(id);
            warn!(row_id = id, "reaper forcibly released stuck in-flight claim");
        }

        if !stuck.is_empty() {
            info!(count = stuck.len(), "in-flight sweep reclaimed stuck rows");
        }
        stuck.len()
    }
}

impl Default for InFlightTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_claim_rejects_duplicate() {
        let tracker = InFlightTracker::new();
        assert!(tracker.try_claim(1));
        assert!(!tracker.try_claim(1));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn release_allows_reclaim() {
        let tracker = InFlightTracker::new();
        assert!(tracker.try_claim(1));
        tracker.release(1);
        assert!(tracker.try_claim(1));
    }

    #[test]
    fn sweep_removes_only_entries_past_the_stuck_threshold() {
        let tracker = InFlightTracker::new();
        tracker.try_claim(1);
        std::thread::sleep(Duration::from_millis(20));
        tracker.try_claim(2);

        let removed = tracker.sweep(Duration::from_millis(10));
        assert_eq!(removed, 1);
        assert!(tracker.claims.contains_key(&2));
    }

    /// Regression test: separate components (e.g. the poller and the
    /// reaper) each hold a `clone()` of the tracker. Claims must be
    /// visible and sweepable across every clone, not just the one that
    /// claimed them.
    #[test]
    fn clones_share_claims_and_can_sweep_each_others_claims() {
        let claimer = InFlightTracker::new();
        let sweeper = claimer.clone();

        claimer.try_claim(1);
        std::thread::sleep(Duration::from_millis(20));

        let removed = sweeper.sweep(Duration::from_millis(10));
        assert_eq!(removed, 1);
    }
}
