//! Manual-trigger facade (C12): a synchronous entry point exposed to the
//! API boundary that performs one poll iteration and reports how many
//! rows entered the channel, plus the statistics entry point (spec §6).

use crate::inflight::InFlightTracker;
use crate::keylock::KeyLockRegistry;
use crate::metrics::RelayMetrics;
use crate::model::{OutboxRow, StatsSnapshot, TriggerResult};
use crate::poller::poll_once;
use crate::store::OutboxStore;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct ManualTrigger<S> {
    store: Arc<S>,
    in_flight: InFlightTracker,
    key_locks: Arc<KeyLockRegistry>,
    sender: async_channel::Sender<OutboxRow>,
    metrics: Arc<RelayMetrics>,
    batch_size: i64,
    trigger_count: AtomicU64,
}

impl<S: OutboxStore> ManualTrigger<S> {
    pub fn new(
        store: Arc<S>,
        in_flight: InFlightTracker,
        key_locks: Arc<KeyLockRegistry>,
        sender: async_channel::Sender<OutboxRow>,
        metrics: Arc<RelayMetrics>,
        batch_size: i64,
    ) -> Self {
        Self {
            store,
            in_flight,
            key_locks,
            sender,
            metrics,
            batch_size,
            trigger_count: AtomicU64::new(0),
        }
    }

    /// Performs exactly one iteration equivalent to the poller's
    /// fetch-claim-enqueue steps, without the sleep/backoff steps.
    pub async fn trigger_once(&self) -> TriggerResult {
        self.trigger_count.fetch_add(1, Ordering::SeqCst);

        match poll_once(
            self.store.as_ref(),
            &self.in_flight,
            &self.sender,
            self.batch_size,
            &self.metrics,
        )
        .await
        {
            Ok(outcome) => TriggerResult {
                success: true,
                messages_added: outcome.enqueued,
                timestamp: Utc::now(),
            },
            Err(_) => TriggerResult {
                success: false,
                messages_added: 0,
                timestamp: Utc::now(),
            },
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            in_flight_count: self.in_flight.len(),
            key_lock_count: self.key_locks.len(),
            manual_trigger_count: self.trigger_count.load(Ordering::SeqCst),
            now: Utc::now(),
        }
    }
}
