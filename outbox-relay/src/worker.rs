//! Producer worker pool (C7): consumes the channel, acquires the per-key
//! mutex, calls the serializer and broker client, and on success enqueues
//! the row id into the publish-mark batcher; on failure, releases the
//! in-flight claim so the row is re-polled.

use crate::batcher::{BatchSink, MarkBatcher};
use crate::broker::BrokerClient;
use crate::error::RelayError;
use crate::inflight::InFlightTracker;
use crate::keylock::KeyLockRegistry;
use crate::metrics::RelayMetrics;
use crate::model::OutboxRow;
use crate::serializer::Serializer;
use crate::store::OutboxStore;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct WorkerPool<S, B, K> {
    receiver: async_channel::Receiver<OutboxRow>,
    serializer: Arc<dyn Serializer>,
    broker: Arc<B>,
    topic: String,
    key_locks: Arc<KeyLockRegistry>,
    in_flight: InFlightTracker,
    publish_batcher: Arc<MarkBatcher<K>>,
    store: Arc<S>,
    max_retries: i32,
    metrics: Arc<RelayMetrics>,
}

impl<S, B, K> WorkerPool<S, B, K>
where
    S: OutboxStore + 'static,
    B: BrokerClient + 'static,
    K: BatchSink + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        receiver: async_channel::Receiver<OutboxRow>,
        serializer: Arc<dyn Serializer>,
        broker: Arc<B>,
        topic: String,
        key_locks: Arc<KeyLockRegistry>,
        in_flight: InFlightTracker,
        publish_batcher: Arc<MarkBatcher<K>>,
        store: Arc<S>,
        max_retries: i32,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            receiver,
            serializer,
            broker,
            topic,
            key_locks,
            in_flight,
            publish_batcher,
            store,
            max_retries,
            metrics,
        }
    }

    /// Spawns `count` worker tasks, all consuming the same multi-consumer
    /// channel. Returns their join handles so the caller can await a
    /// graceful shutdown.
    pub fn spawn(
        self: Arc<Self>,
        count: usize,
        cancel: tokio::sync::watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        (0..count)
            .map(|_| {
                let pool = Arc::clone(&self);
                let cancel = cancel.clone();
                tokio::spawn(async move { pool.run(cancel).await })
            })
            .collect()
    }

    async fn run(&self, mut cancel: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                row = self.receiver.recv() => {
                    match row {
                        Ok(row) => self.process_row(row, &mut cancel).await,
                        Err(_) => break,
                    }
                }
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn process_row(&self, row: OutboxRow, cancel: &mut tokio::sync::watch::Receiver<bool>) {
        let row_id = row.id;
        let handle = self.key_locks.acquire(&row.routing_key).await;

        // Cancellation during publish is treated as a row failure: the
        // claim is released and the row is re-polled after restart.
        let outcome = tokio::select! {
            result = self.publish_row(&row) => result,
            _ = cancel.changed() => Err(RelayError::CancelRequested),
        };
        drop(handle);

        match outcome {
            Ok(()) => {
                self.publish_batcher.enqueue(row_id).await;
                self.in_flight.release(row_id);
                self.metrics.in_flight_count.set(self.in_flight.len() as i64);
                self.metrics.produced_total.inc();
            }
            Err(RelayError::ProduceFatal { message, .. }) => {
                warn!(row_id, error = %message, "fatal publish failure, marking row failed");
                if let Err(e) = self.store.mark_failed(row_id, &message, self.max_retries).await {
                    warn!(row_id, error = %e, "failed to mark row as failed");
                }
                self.in_flight.release(row_id);
                self.metrics.in_flight_count.set(self.in_flight.len() as i64);
                self.metrics.publish_failed_total.inc();
            }
            Err(e) => {
                debug!(row_id, error = %e, "transient publish failure, row will be re-polled");
                self.in_flight.release(row_id);
                self.metrics.in_flight_count.set(self.in_flight.len() as i64);
                self.metrics.publish_failed_total.inc();
            }
        }
    }

    async fn publish_row(&self, row: &OutboxRow) -> Result<(), RelayError> {
        let (key, headers, value) =
            self.serializer.serialize(row).map_err(|e| match e {
                RelayError::SerializationError { row_id, source } => {
                    RelayError::SerializationError { row_id, source }
                }
                other => other,
            })?;

        self.broker
            .publish(&self.topic, &key, &value, &headers)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::PublishSink;
    use crate::broker::fake::FakeBrokerClient;
    use crate::serializer::SchemaRegistryFramedSerializer;
    use crate::store::fake::{sample_row, FakeOutboxStore};

    #[tokio::test]
    async fn successful_publish_enqueues_into_batcher_and_releases_claim() {
        let store = Arc::new(FakeOutboxStore::default());
        store.rows.lock().await.push(sample_row(1, "A"));

        let (tx, rx) = async_channel::bounded(10);
        let in_flight = InFlightTracker::new();
        in_flight.try_claim(1);

        let broker = Arc::new(FakeBrokerClient::default());
        let key_locks = Arc::new(KeyLockRegistry::new());
        let batcher = MarkBatcher::new(Arc::new(PublishSink::new(Arc::clone(&store))), 100);
        let metrics = Arc::new(RelayMetrics::new("test-worker-1"));

        let pool = Arc::new(WorkerPool::new(
            rx,
            Arc::new(SchemaRegistryFramedSerializer::new(1)),
            Arc::clone(&broker),
            "topic".to_string(),
            key_locks,
            in_flight.clone(),
            Arc::clone(&batcher),
            Arc::clone(&store),
            5,
            metrics,
        ));

        let (_cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
        tx.send(sample_row(1, "A")).await.unwrap();
        drop(tx);

        pool.run(cancel_rx).await;

        assert_eq!(in_flight.len(), 0);
        assert_eq!(broker.delivered.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn same_key_rows_are_delivered_in_ascending_id_order() {
        let store = Arc::new(FakeOutboxStore::default());
        store.rows.lock().await.push(sample_row(1, "Z"));
        store.rows.lock().await.push(sample_row(2, "Z"));

        let (tx, rx) = async_channel::bounded(10);
        let in_flight = InFlightTracker::new();
        in_flight.try_claim(1);
        in_flight.try_claim(2);

        let broker = Arc::new(FakeBrokerClient::default());
        let key_locks = Arc::new(KeyLockRegistry::new());
        let batcher = MarkBatcher::new(Arc::new(PublishSink::new(Arc::clone(&store))), 100);
        let metrics = Arc::new(RelayMetrics::new("test-worker-3"));

        // Two worker tasks racing for the same key: the per-key mutex must
        // still serialize delivery order to match claim order.
        let pool = Arc::new(WorkerPool::new(
            rx,
            Arc::new(SchemaRegistryFramedSerializer::new(1)),
            broker.clone(),
            "topic".to_string(),
            key_locks,
            in_flight.clone(),
            batcher,
            Arc::clone(&store),
            5,
            metrics,
        ));

        let (_cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
        tx.send(sample_row(1, "Z")).await.unwrap();
        tx.send(sample_row(2, "Z")).await.unwrap();
        drop(tx);

        let handles = pool.spawn(2, cancel_rx);
        for h in handles {
            h.await.unwrap();
        }

        let delivered = broker.delivered.lock().await;
        assert_eq!(delivered.len(), 2);
        let ids: Vec<i64> = delivered
            .iter()
            .map(|(_, _, v)| crate::serializer::extract_row_id(v).unwrap())
            .collect();
        assert!(ids[0] < ids[1], "expected ascending delivery order, got {ids:?}");
    }

    #[tokio::test]
    async fn fatal_failure_marks_row_failed() {
        let store = Arc::new(FakeOutboxStore::default());
        store.rows.lock().await.push(sample_row(1, "A"));

        let (tx, rx) = async_channel::bounded(10);
        let in_flight = InFlightTracker::new();
        in_flight.try_claim(1);

        let broker = Arc::new(FakeBrokerClient::default());
        broker.fail_fatal.store(true, std::sync::atomic::Ordering::SeqCst);

        let key_locks = Arc::new(KeyLockRegistry::new());
        let batcher = MarkBatcher::new(Arc::new(PublishSink::new(Arc::clone(&store))), 100);
        let metrics = Arc::new(RelayMetrics::new("test-worker-2"));

        let pool = Arc::new(WorkerPool::new(
            rx,
            Arc::new(SchemaRegistryFramedSerializer::new(1)),
            broker,
            "topic".to_string(),
            key_locks,
            in_flight.clone(),
            batcher,
            Arc::clone(&store),
            5,
            metrics,
        ));

        let (_cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
        tx.send(sample_row(1, "A")).await.unwrap();
        drop(tx);
        pool.run(cancel_rx).await;

        let rows = store.rows.lock().await;
        assert_eq!(rows[0].error_code.as_deref(), Some("fatal"));
    }
}
