//! Top-level service wiring: starts both pipelines, owns their join
//! handles, and drives a watch-channel shutdown sequence — poller stops
//! first, the channel drains through the worker pool, then the batchers
//! perform one final flush.

use crate::batcher::{MarkBatcher, PublishSink, ReceiveSink};
use crate::broker::RdKafkaBrokerClient;
use crate::config::RelayConfig;
use crate::consumer::{ConsumerConfig, ConsumerFetcher};
use crate::inflight::InFlightTracker;
use crate::keylock::KeyLockRegistry;
use crate::manual_trigger::ManualTrigger;
use crate::metrics::RelayMetrics;
use crate::model::OutboxRow;
use crate::poller::{Poller, PollerConfig};
use crate::reaper::{Reaper, ReaperConfig};
use crate::serializer::SchemaRegistryFramedSerializer;
use crate::store::SqlxOutboxStore;
use crate::worker::WorkerPool;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Owns every background task handle so they can be joined on shutdown.
pub struct RelayService {
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    poller_handle: JoinHandle<()>,
    worker_handles: Vec<JoinHandle<()>>,
    consumer_handles: Vec<JoinHandle<()>>,
    publish_batcher_handle: JoinHandle<()>,
    receive_batcher_handle: JoinHandle<()>,
    reaper_handle: JoinHandle<()>,
    pub manual_trigger: Arc<ManualTrigger<SqlxOutboxStore>>,
}

impl RelayService {
    pub async fn start(config: RelayConfig, pool: PgPool) -> anyhow::Result<Self> {
        let store = Arc::new(SqlxOutboxStore::new(
            pool,
            config.database_connection_pool_size,
            config.require_processed_flag,
        ));
        let metrics = Arc::new(RelayMetrics::new("outbox-relay"));
        let in_flight = InFlightTracker::new();
        let key_locks = Arc::new(KeyLockRegistry::new());

        let (channel_tx, channel_rx) = async_channel::bounded::<OutboxRow>(config.max_producer_buffer);
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        let publish_sink = Arc::new(PublishSink::new(Arc::clone(&store)));
        let publish_batcher = MarkBatcher::with_flush_counter(
            publish_sink,
            config.publish_batch_size,
            Some(metrics.publish_batch_flush_total.clone()),
        );
        let publish_batcher_handle = tokio::spawn(
            Arc::clone(&publish_batcher)
                .run(Duration::from_millis(config.publish_flush_interval_ms), shutdown_rx.clone()),
        );

        let receive_sink = Arc::new(ReceiveSink::new(Arc::clone(&store)));
        let receive_batcher = MarkBatcher::with_flush_counter(
            receive_sink,
            config.consumer_batch_size,
            Some(metrics.receive_batch_flush_total.clone()),
        );
        let receive_batcher_handle = tokio::spawn(Arc::clone(&receive_batcher).run_with_throughput_log(
            Duration::from_millis(config.consumer_flush_interval_ms),
            Some(Duration::from_secs(10)),
            shutdown_rx.clone(),
        ));

        let broker = Arc::new(RdKafkaBrokerClient::new(&config.bootstrap_servers)?);
        let serializer = Arc::new(SchemaRegistryFramedSerializer::new(1));

        let worker_pool = Arc::new(WorkerPool::new(
            channel_rx,
            serializer,
            Arc::clone(&broker),
            config.topic_name.clone(),
            Arc::clone(&key_locks),
            in_flight.clone(),
            Arc::clone(&publish_batcher),
            Arc::clone(&store),
            config.max_retries,
            Arc::clone(&metrics),
        ));
        let worker_handles = worker_pool.spawn(config.max_concurrent_producers, shutdown_rx.clone());

        let poller = Arc::new(Poller::new(
            Arc::clone(&store),
            in_flight.clone(),
            channel_tx.clone(),
            PollerConfig {
                batch_size: config.batch_size,
                base_delay: Duration::from_millis(config.polling_interval_ms),
                max_delay: Duration::from_millis(config.max_polling_interval_ms),
                backoff_multiplier: config.backoff_multiplier,
                adaptive_backoff: config.enable_adaptive_backoff,
            },
            Arc::clone(&metrics),
        ));
        let poller_for_task = Arc::clone(&poller);
        let poller_cancel = shutdown_rx.clone();
        let poller_handle = tokio::spawn(async move { poller_for_task.run(poller_cancel).await });

        let mut consumer_handles = Vec::new();
        for i in 0..config.consumer_instance_count {
            let consumer_config = ConsumerConfig {
                bootstrap_servers: config.bootstrap_servers.clone(),
                group_id: "outbox-relay-consumer".to_string(),
                topic: config.topic_name.clone(),
                instance_id: format!("outbox-relay-consumer-{i}"),
            };
            let fetcher = ConsumerFetcher::new(
                &consumer_config,
                Arc::clone(&receive_batcher),
                Arc::clone(&metrics),
            )?;
            let cancel = shutdown_rx.clone();
            consumer_handles.push(tokio::spawn(async move { fetcher.run(cancel).await }));
        }

        let reaper = Reaper::new(
            Arc::clone(&key_locks),
            in_flight.clone(),
            ReaperConfig {
                interval: Duration::from_secs(config.reaper_interval_secs),
                key_lock_idle_threshold: Duration::from_secs(config.key_lock_idle_threshold_secs),
                key_lock_max_retained: config.key_lock_max_retained,
                in_flight_stuck_threshold: Duration::from_secs(config.in_flight_stuck_threshold_secs),
            },
            Arc::clone(&metrics),
        );
        let reaper_cancel = shutdown_rx.clone();
        let reaper_handle = tokio::spawn(async move { reaper.run(reaper_cancel).await });

        let manual_trigger = Arc::new(ManualTrigger::new(
            Arc::clone(&store),
            in_flight,
            key_locks,
            channel_tx,
            metrics,
            config.batch_size,
        ));

        info!("relay service started");

        Ok(Self {
            shutdown_tx,
            poller_handle,
            worker_handles,
            consumer_handles,
            publish_batcher_handle,
            receive_batcher_handle,
            reaper_handle,
            manual_trigger,
        })
    }

    /// Poller stops first (no new claims), workers drain the channel,
    /// then batchers perform one final flush with a bounded grace period.
    pub async fn shutdown(self) {
        info!("shutting down relay service");
        let _ = self.shutdown_tx.send(true);

        let grace = Duration::from_secs(10);
        for (name, handle) in [("poller", self.poller_handle)] {
            await_with_timeout(name, handle, grace).await;
        }
        for (i, handle) in self.worker_handles.into_iter().enumerate() {
            await_with_timeout(&format!("worker-{i}"), handle, grace).await;
        }
        for (i, handle) in self.consumer_handles.into_iter().enumerate() {
            await_with_timeout(&format!("consumer-{i}"), handle, grace).await;
        }
        await_with_timeout("reaper", self.reaper_handle, grace).await;
        await_with_timeout("publish-batcher", self.publish_batcher_handle, grace).await;
        await_with_timeout("receive-batcher", self.receive_batcher_handle, grace).await;

        info!("relay service shut down");
    }
}

async fn await_with_timeout(name: &str, handle: JoinHandle<()>, grace: Duration) {
    match tokio::time::timeout(grace, handle).await {
        Ok(Ok(())) => info!(task = name, "shut down gracefully"),
        Ok(Err(_)) => warn!(task = name, "task panicked during shutdown"),
        Err(_) => warn!(task = name, "did not shut down within grace period"),
    }
}
