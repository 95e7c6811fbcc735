//! Idle-resource reaper (C11): periodically evicts idle entries from the
//! per-key lock registry and emergency-reclaims stuck entries from the
//! in-flight tracker.

use crate::inflight::InFlightTracker;
use crate::keylock::KeyLockRegistry;
use crate::metrics::RelayMetrics;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    pub key_lock_idle_threshold: Duration,
    pub key_lock_max_retained: usize,
    pub in_flight_stuck_threshold: Duration,
}

pub struct Reaper {
    key_locks: Arc<KeyLockRegistry>,
    in_flight: InFlightTracker,
    config: ReaperConfig,
    metrics: Arc<RelayMetrics>,
}

impl Reaper {
    pub fn new(
        key_locks: Arc<KeyLockRegistry>,
        in_flight: InFlightTracker,
        config: ReaperConfig,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            key_locks,
            in_flight,
            config,
            metrics,
        }
    }

    /// One reaper pass: evict idle key locks, sweep stuck in-flight
    /// claims. Exposed separately from `run` so it is unit-testable
    /// without a timer.
    pub fn sweep_once(&self) {
        let evicted = self.key_locks.evict_idle(
            self.config.key_lock_idle_threshold,
            self.config.key_lock_max_retained,
        );
        if evicted > 0 {
            info!(evicted, "reaper evicted idle key locks");
        }
        self.metrics.key_lock_count.set(self.key_locks.len() as i64);

        let reclaimed = self.in_flight.sweep(self.config.in_flight_stuck_threshold);
        if reclaimed > 0 {
            info!(reclaimed, "reaper reclaimed stuck in-flight rows");
        }
        self.metrics.in_flight_count.set(self.in_flight.len() as i64);
    }

    pub async fn run(&self, mut cancel: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_once(),
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sweep_once_evicts_idle_locks_and_reclaims_stuck_claims() {
        let key_locks = Arc::new(KeyLockRegistry::new());
        {
            let _handle = key_locks.acquire("A").await;
        }
        let in_flight = InFlightTracker::new();
        in_flight.try_claim(1);

        tokio::time::sleep(Duration::from_millis(20)).await;

        let metrics = Arc::new(RelayMetrics::new("test-reaper"));
        let reaper = Reaper::new(
            key_locks.clone(),
            in_flight.clone(),
            ReaperConfig {
                interval: Duration::from_secs(60),
                key_lock_idle_threshold: Duration::from_millis(10),
                key_lock_max_retained: 5000,
                in_flight_stuck_threshold: Duration::from_millis(10),
            },
            metrics,
        );

        reaper.sweep_once();

        assert_eq!(key_locks.len(), 0);
        assert_eq!(in_flight.len(), 0);
    }

    #[tokio::test]
    async fn sweep_once_does_not_touch_fresh_entries() {
        let key_locks = Arc::new(KeyLockRegistry::new());
        let fresh_handle = key_locks.acquire("A").await;

        let in_flight = InFlightTracker::new();
        in_flight.try_claim(1);

        let metrics = Arc::new(RelayMetrics::new("test-reaper-fresh"));
        let reaper = Reaper::new(
            key_locks.clone(),
            in_flight.clone(),
            ReaperConfig {
                interval: Duration::from_secs(60),
                key_lock_idle_threshold: Duration::from_secs(120),
                key_lock_max_retained: 5000,
                in_flight_stuck_threshold: Duration::from_secs(1_800),
            },
            metrics,
        );

        reaper.sweep_once();

        assert_eq!(in_flight.len(), 1);
        assert_eq!(key_locks.len(), 1);
        drop(fresh_handle);
    }
}
