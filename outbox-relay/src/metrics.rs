//! Prometheus metrics for the relay core.

use prometheus::{IntCounter, IntGauge, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct RelayMetrics {
    pub produced_total: IntCounter,
    pub publish_failed_total: IntCounter,
    pub empty_polls_total: IntCounter,
    pub in_flight_count: IntGauge,
    pub key_lock_count: IntGauge,
    pub current_delay_ms: IntGauge,
    pub consumer_received_total: IntCounter,
    pub publish_batch_flush_total: IntCounter,
    pub receive_batch_flush_total: IntCounter,
}

impl RelayMetrics {
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let produced_total = counter(
            "relay_produced_total",
            "Total rows successfully published to the broker",
            service,
        );
        let publish_failed_total = counter(
            "relay_publish_failed_total",
            "Total publish attempts that failed",
            service,
        );
        let empty_polls_total = counter(
            "relay_empty_polls_total",
            "Total poller iterations that returned no rows",
            service,
        );
        let in_flight_count = gauge(
            "relay_inflight_count",
            "Current number of rows claimed by the producer pipeline",
            service,
        );
        let key_lock_count = gauge(
            "relay_keylock_count",
            "Current number of per-key lock entries retained",
            service,
        );
        let current_delay_ms = gauge(
            "relay_current_delay_ms",
            "Current poller adaptive-backoff delay in milliseconds",
            service,
        );
        let consumer_received_total = counter(
            "relay_consumer_received_total",
            "Total messages fetched by the consumer pipeline",
            service,
        );
        let publish_batch_flush_total = counter(
            "relay_publish_batch_flush_total",
            "Total publish-mark batch flushes",
            service,
        );
        let receive_batch_flush_total = counter(
            "relay_receive_batch_flush_total",
            "Total receive-mark batch flushes",
            service,
        );

        for metric in [
            Box::new(produced_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(publish_failed_total.clone()),
            Box::new(empty_polls_total.clone()),
            Box::new(in_flight_count.clone()),
            Box::new(key_lock_count.clone()),
            Box::new(current_delay_ms.clone()),
            Box::new(consumer_received_total.clone()),
            Box::new(publish_batch_flush_total.clone()),
            Box::new(receive_batch_flush_total.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("failed to register relay metric: {}", e);
            }
        }

        Self {
            produced_total,
            publish_failed_total,
            empty_polls_total,
            in_flight_count,
            key_lock_count,
            current_delay_ms,
            consumer_received_total,
            publish_batch_flush_total,
            receive_batch_flush_total,
        }
    }
}

fn counter(name: &str, help: &str, service: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(name, help).const_label("service", service.to_string()))
        .expect("valid metric opts")
}

fn gauge(name: &str, help: &str, service: &str) -> IntGauge {
    IntGauge::with_opts(Opts::new(name, help).const_label("service", service.to_string()))
        .expect("valid metric opts")
}
