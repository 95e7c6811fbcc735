//! Broker client wrapper (C3): publish one key/value/headers tuple with
//! at-least-once semantics, report per-message delivery outcome.

use crate::error::{RelayError, RelayResult};
use crate::serializer::HeaderMap;
use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use resilience::{
    with_retry, with_timeout_result, CircuitBreaker, CircuitBreakerError, ServiceConfig,
    TimeoutError,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        value: &[u8],
        headers: &HeaderMap,
    ) -> RelayResult<DeliveryReport>;
}

/// `rdkafka`-backed broker client. The producer MUST be configured with
/// `enable.idempotence = true`, `acks = all`, and
/// `max.in.flight.requests.per.connection <= 5`.
pub struct RdKafkaBrokerClient {
    producer: FutureProducer,
    resilience: ServiceConfig,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl RdKafkaBrokerClient {
    pub fn new(bootstrap_servers: &str) -> RelayResult<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("max.in.flight.requests.per.connection", "5")
            .create()
            .map_err(|e| RelayError::Other(anyhow::anyhow!("failed to create producer: {e}")))?;

        let resilience = resilience::kafka_config();
        let circuit_breaker = Arc::new(CircuitBreaker::new(resilience.circuit_breaker.clone()));
        Ok(Self {
            producer,
            resilience,
            circuit_breaker,
        })
    }

    pub fn from_producer(producer: FutureProducer) -> Self {
        let resilience = resilience::kafka_config();
        let circuit_breaker = Arc::new(CircuitBreaker::new(resilience.circuit_breaker.clone()));
        Self {
            producer,
            resilience,
            circuit_breaker,
        }
    }
}

#[async_trait]
impl BrokerClient for RdKafkaBrokerClient {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        value: &[u8],
        headers: &HeaderMap,
    ) -> RelayResult<DeliveryReport> {
        let mut owned_headers = OwnedHeaders::new();
        for (k, v) in headers.0.iter() {
            owned_headers = owned_headers.insert(Header {
                key: k.as_str(),
                value: Some(v.as_bytes()),
            });
        }

        // A fatal-classified error (bad topic, message too large) never
        // benefits from a retry; only transient errors go through the
        // bounded retry loop.
        let first = self.send_once(topic, key, value, &owned_headers).await;
        let first_err = match first {
            Ok((partition, offset)) => {
                info!(topic, partition, offset, "message published to broker");
                return Ok(DeliveryReport {
                    topic: topic.to_string(),
                    partition,
                    offset,
                });
            }
            Err(e) if is_fatal(&e) => {
                return Err(RelayError::ProduceFatal {
                    row_id: 0,
                    message: e.to_string(),
                })
            }
            Err(e) => e,
        };

        // The retry loop is what hammers a down broker repeatedly; gate it
        // behind the circuit breaker so a persistently unavailable broker
        // fails fast instead of paying the full retry backoff on every
        // publish.
        let retry_cfg = self.resilience.retry.clone();
        let result = self
            .circuit_breaker
            .call(|| async {
                with_retry(retry_cfg.clone(), || async {
                    self.send_once(topic, key, value, &owned_headers).await
                })
                .await
            })
            .await;

        match result {
            Ok((partition, offset)) => {
                info!(topic, partition, offset, "message published to broker (retried)");
                Ok(DeliveryReport {
                    topic: topic.to_string(),
                    partition,
                    offset,
                })
            }
            Err(CircuitBreakerError::Open) => {
                warn!(
                    topic,
                    circuit_state = ?self.circuit_breaker.state(),
                    "kafka circuit breaker open, failing publish fast"
                );
                Err(RelayError::ProduceTransient {
                    row_id: 0,
                    message: "kafka circuit breaker open".to_string(),
                })
            }
            Err(CircuitBreakerError::CallFailed(_)) => Err(RelayError::ProduceTransient {
                row_id: 0,
                message: first_err.to_string(),
            }),
        }
    }
}

impl RdKafkaBrokerClient {
    async fn send_once(
        &self,
        topic: &str,
        key: &str,
        value: &[u8],
        headers: &OwnedHeaders,
    ) -> Result<(i32, i64), rdkafka::error::KafkaError> {
        let record = FutureRecord::to(topic)
            .key(key)
            .payload(value)
            .headers(headers.clone());

        match with_timeout_result(self.resilience.timeout.duration, async {
            self.producer
                .send(record, Duration::from_secs(0))
                .await
                .map_err(|(err, _)| err)
        })
        .await
        {
            Ok(result) => Ok(result),
            Err(TimeoutError::Elapsed(_)) => Err(rdkafka::error::KafkaError::MessageProduction(
                rdkafka::types::RDKafkaErrorCode::OperationTimedOut,
            )),
            Err(TimeoutError::OperationFailed(_)) => Err(rdkafka::error::KafkaError::MessageProduction(
                rdkafka::types::RDKafkaErrorCode::Fail,
            )),
        }
    }
}

/// Classifies a Kafka producer error as non-retriable. Kept deliberately
/// narrow: anything not recognized here is treated as transient so a
/// transport hiccup never strands a row in terminal failure.
fn is_fatal(err: &rdkafka::error::KafkaError) -> bool {
    use rdkafka::types::RDKafkaErrorCode::*;
    matches!(
        err.rdkafka_error_code(),
        Some(MessageSizeTooLarge) | Some(UnknownTopicOrPartition) | Some(TopicAuthorizationFailed)
    )
}


#[cfg(test)]
mod tests {
    use super::fake::*;
    use super::*;

    #[tokio::test]
    async fn fake_broker_records_deliveries_in_order() {
        let broker = FakeBrokerClient::default();
        broker
            .publish("t", "A", b"one", &HeaderMap::default())
            .await
            .unwrap();
        broker
            .publish("t", "A", b"two", &HeaderMap::default())
            .await
            .unwrap();

        let delivered = broker.delivered.lock().await;
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].2, b"one");
        assert_eq!(delivered[1].2, b"two");
    }

    #[tokio::test]
    async fn fake_broker_can_simulate_transient_failure() {
        let broker = FakeBrokerClient::default();
        broker
            .fail_next
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let result = broker.publish("t", "A", b"one", &HeaderMap::default()).await;
        assert!(matches!(result, Err(RelayError::ProduceTransient { .. })));
    }
}
