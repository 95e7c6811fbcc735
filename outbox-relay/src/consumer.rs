//! Consumer fetcher (C9): reads messages from the broker, extracts the
//! row identifier from the wire format, and appends it into the
//! receive-mark batcher (C10).

use crate::batcher::{BatchSink, MarkBatcher};
use crate::metrics::RelayMetrics;
use crate::serializer::extract_row_id;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use std::time::Duration;
use tracing::{debug, error, warn};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub bootstrap_servers: String,
    pub group_id: String,
    pub topic: String,
    /// Distinct per spawned fetcher; partition assignment among instances
    /// is delegated to the broker's group-coordination protocol.
    pub instance_id: String,
}

pub struct ConsumerFetcher<K> {
    consumer: StreamConsumer,
    batcher: std::sync::Arc<MarkBatcher<K>>,
    metrics: std::sync::Arc<RelayMetrics>,
}

impl<K: BatchSink + 'static> ConsumerFetcher<K> {
    pub fn new(
        config: &ConsumerConfig,
        batcher: std::sync::Arc<MarkBatcher<K>>,
        metrics: std::sync::Arc<RelayMetrics>,
    ) -> Result<Self, rdkafka::error::KafkaError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &config.group_id)
            .set("group.instance.id", &config.instance_id)
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .create()?;

        consumer.subscribe(&[&config.topic])?;

        Ok(Self { consumer, batcher, metrics })
    }

    /// Runs until `cancel` signals shutdown.
    pub async fn run(&self, mut cancel: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *cancel.borrow() {
                break;
            }

            let recv = tokio::time::timeout(Duration::from_millis(10), self.consumer.recv());

            tokio::select! {
                result = recv => {
                    match result {
                        Ok(Ok(msg)) => {
                            if let Some(payload) = msg.payload() {
                                match extract_row_id(payload) {
                                    Ok(id) => {
                                        self.metrics.consumer_received_total.inc();
                                        self.batcher.enqueue(id).await
                                    }
                                    Err(e) => warn!(error = %e, "failed to extract row id from message"),
                                }
                            }
                        }
                        Ok(Err(e)) => {
                            error!(error = %e, "kafka consumer error, flushing and retrying");
                            self.batcher.flush().await;
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                        Err(_) => {
                            // Poll deadline elapsed with no message; loop.
                            debug!("consumer poll deadline elapsed");
                        }
                    }
                }
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        self.batcher.flush().await;
                        break;
                    }
                }
            }
        }
    }
}
