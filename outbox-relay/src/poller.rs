//! Producer poller (C6): periodically, and on manual trigger, pulls the
//! next batch of candidate rows from the store and hands them to the
//! worker pool via a bounded channel; applies adaptive backoff and
//! backpressure.

use crate::error::RelayError;
use crate::inflight::InFlightTracker;
use crate::metrics::RelayMetrics;
use crate::model::OutboxRow;
use crate::store::OutboxStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub batch_size: i64,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub adaptive_backoff: bool,
}

/// Outcome of one poll-fetch-claim-enqueue pass. `fetched` is the number of
/// rows the store actually returned; `enqueued` is the subset of those that
/// were newly claimed and handed to the channel. A fetch can return rows
/// that are all already in-flight (duplicate suppression, spec §8), in
/// which case `fetched > 0` but `enqueued == 0` — that is a real, non-empty
/// fetch and must not be treated the same as an empty one for backoff
/// purposes (spec §4.6 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    pub fetched: usize,
    pub enqueued: usize,
}

/// One poll-fetch-claim-enqueue pass, shared by the poller's own loop
/// (C6) and the manual-trigger facade (C12), which performs exactly this
/// sequence without the surrounding sleep/backoff steps.
pub async fn poll_once<S: OutboxStore>(
    store: &S,
    in_flight: &InFlightTracker,
    sender: &async_channel::Sender<OutboxRow>,
    batch_size: i64,
    metrics: &RelayMetrics,
) -> Result<PollOutcome, RelayError> {
    let rows = store.fetch_next_batch(batch_size).await?;
    let fetched = rows.len();

    if rows.is_empty() {
        metrics.empty_polls_total.inc();
        return Ok(PollOutcome { fetched: 0, enqueued: 0 });
    }

    let mut enqueued = 0;
    for row in rows {
        if !in_flight.try_claim(row.id) {
            debug!(row_id = row.id, "row already in-flight, skipping");
            continue;
        }
        metrics.in_flight_count.set(in_flight.len() as i64);

        if sender.send(row).await.is_err() {
            // Channel closed: shutting down.
            break;
        }
        enqueued += 1;
    }
    Ok(PollOutcome { fetched, enqueued })
}

pub struct Poller<S> {
    store: Arc<S>,
    in_flight: InFlightTracker,
    sender: async_channel::Sender<OutboxRow>,
    config: PollerConfig,
    metrics: Arc<RelayMetrics>,
    current_delay: AtomicU64,
}

impl<S: OutboxStore> Poller<S> {
    pub fn new(
        store: Arc<S>,
        in_flight: InFlightTracker,
        sender: async_channel::Sender<OutboxRow>,
        config: PollerConfig,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        let base_millis = config.base_delay.as_millis() as u64;
        Self {
            store,
            in_flight,
            sender,
            config,
            metrics,
            current_delay: AtomicU64::new(base_millis),
        }
    }

    fn delay(&self) -> Duration {
        Duration::from_millis(self.current_delay.load(Ordering::SeqCst))
    }

    fn reset_delay(&self) {
        self.current_delay.store(
            self.config.base_delay.as_millis() as u64,
            Ordering::SeqCst,
        );
    }

    fn grow_delay(&self) {
        if !self.config.adaptive_backoff {
            return;
        }
        let current = self.current_delay.load(Ordering::SeqCst) as f64;
        let max = self.config.max_delay.as_millis() as f64;
        let grown = (current * self.config.backoff_multiplier).min(max) as u64;
        self.current_delay.store(grown.max(1), Ordering::SeqCst);
    }

    /// Runs until `cancel` signals shutdown. On shutdown the poller stops
    /// claiming new rows and the channel is left for the worker pool to
    /// drain before it closes.
    pub async fn run(&self, mut cancel: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *cancel.borrow() {
                break;
            }

            self.metrics
                .current_delay_ms
                .set(self.current_delay.load(Ordering::SeqCst) as i64);

            // Step 1: backpressure check.
            if self.sender.len() as f64 >= self.sender.capacity().unwrap_or(usize::MAX) as f64 * 0.8
            {
                self.grow_delay();
                if sleep_or_cancel(self.delay(), &mut cancel).await {
                    break;
                }
                continue;
            }

            match poll_once(
                self.store.as_ref(),
                &self.in_flight,
                &self.sender,
                self.config.batch_size,
                &self.metrics,
            )
            .await
            {
                Ok(PollOutcome { fetched: 0, .. }) => {
                    self.grow_delay();
                    if sleep_or_cancel(self.delay(), &mut cancel).await {
                        break;
                    }
                }
                Ok(_) => {
                    // Store returned real rows, even if every one was
                    // already in-flight (duplicate suppression): that is
                    // not an idle source, so backoff resets rather than
                    // growing.
                    self.reset_delay();
                }
                Err(RelayError::StoreUnavailable(e)) => {
                    warn!(error = %e, "store unavailable, backing off");
                    self.grow_delay();
                    if sleep_or_cancel(self.delay(), &mut cancel).await {
                        break;
                    }
                }
                Err(RelayError::QueryTimeout(d)) => {
                    warn!(timeout = ?d, "query timed out, backing off");
                    self.grow_delay();
                    if sleep_or_cancel(self.delay(), &mut cancel).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "unexpected poll error");
                    if sleep_or_cancel(self.delay(), &mut cancel).await {
                        break;
                    }
                }
            }
        }
    }
}

/// Sleeps for `duration` unless cancellation fires first. Returns true if
/// cancellation fired.
async fn sleep_or_cancel(duration: Duration, cancel: &mut tokio::sync::watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = cancel.changed() => *cancel.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fake::{sample_row, FakeOutboxStore};

    #[tokio::test]
    async fn poll_once_claims_oldest_per_key_and_enqueues() {
        let store = FakeOutboxStore::default();
        store.rows.lock().await.push(sample_row(1, "A"));
        store.rows.lock().await.push(sample_row(2, "A"));

        let tracker = InFlightTracker::new();
        let (tx, rx) = async_channel::bounded(10);
        let metrics = RelayMetrics::new("test-poller-1");

        let outcome = poll_once(&store, &tracker, &tx, 10, &metrics).await.unwrap();
        assert_eq!(outcome, PollOutcome { fetched: 1, enqueued: 1 });
        let row = rx.recv().await.unwrap();
        assert_eq!(row.id, 1);
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn poll_once_skips_already_claimed_rows() {
        let store = FakeOutboxStore::default();
        store.rows.lock().await.push(sample_row(1, "A"));

        let tracker = InFlightTracker::new();
        tracker.try_claim(1);

        let (tx, _rx) = async_channel::bounded(10);
        let metrics = RelayMetrics::new("test-poller-2");

        let outcome = poll_once(&store, &tracker, &tx, 10, &metrics).await.unwrap();
        assert_eq!(outcome, PollOutcome { fetched: 1, enqueued: 0 });
    }

    #[tokio::test]
    async fn poll_once_reports_fetched_rows_even_when_all_are_already_in_flight() {
        let store = FakeOutboxStore::default();
        store.rows.lock().await.push(sample_row(1, "A"));
        store.rows.lock().await.push(sample_row(2, "B"));

        let tracker = InFlightTracker::new();
        tracker.try_claim(1);
        tracker.try_claim(2);

        let (tx, _rx) = async_channel::bounded(10);
        let metrics = RelayMetrics::new("test-poller-3");

        let outcome = poll_once(&store, &tracker, &tx, 10, &metrics).await.unwrap();
        assert_eq!(outcome.fetched, 2);
        assert_eq!(outcome.enqueued, 0);
    }
}
