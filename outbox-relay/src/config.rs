//! Configuration binding for the relay core (spec §6 configuration table).

use anyhow::{anyhow, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub bootstrap_servers: String,
    pub topic_name: String,
    pub schema_registry_url: String,
    pub database_url: String,

    pub batch_size: i64,
    pub polling_interval_ms: u64,
    pub max_polling_interval_ms: u64,
    pub backoff_multiplier: f64,
    pub enable_adaptive_backoff: bool,

    pub max_concurrent_producers: usize,
    pub max_producer_buffer: usize,
    pub database_connection_pool_size: usize,

    pub publish_batch_size: usize,
    pub publish_flush_interval_ms: u64,
    pub consumer_batch_size: usize,
    pub consumer_flush_interval_ms: u64,
    pub consumer_instance_count: usize,

    pub max_retries: i32,
    pub reaper_interval_secs: u64,
    pub key_lock_idle_threshold_secs: u64,
    pub key_lock_max_retained: usize,
    pub in_flight_stuck_threshold_secs: u64,

    /// Gate `FetchNextBatch` on `processed_flag = true` (spec §9 open
    /// question: implemented as a configurable predicate).
    pub require_processed_flag: bool,

    pub log_level: String,
    pub enable_metrics: bool,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .set_default("bootstrap_servers", "localhost:9092")?
            .set_default("topic_name", "outbox-events")?
            .set_default("schema_registry_url", "")?
            .set_default("database_url", "")?
            .set_default("batch_size", 100)?
            .set_default("polling_interval_ms", 250)?
            .set_default("max_polling_interval_ms", 30_000)?
            .set_default("backoff_multiplier", 2.0)?
            .set_default("enable_adaptive_backoff", true)?
            .set_default("max_concurrent_producers", 8)?
            .set_default("max_producer_buffer", 1_000)?
            .set_default("database_connection_pool_size", 10)?
            .set_default("publish_batch_size", 500)?
            .set_default("publish_flush_interval_ms", 1_000)?
            .set_default("consumer_batch_size", 5_000)?
            .set_default("consumer_flush_interval_ms", 50)?
            .set_default("consumer_instance_count", 1)?
            .set_default("max_retries", 5)?
            .set_default("reaper_interval_secs", 60)?
            .set_default("key_lock_idle_threshold_secs", 120)?
            .set_default("key_lock_max_retained", 5_000)?
            .set_default("in_flight_stuck_threshold_secs", 1_800)?
            .set_default("require_processed_flag", true)?
            .set_default("log_level", "info")?
            .set_default("enable_metrics", true)?
            .add_source(config::Environment::default().separator("__"))
            .build()?;

        config.try_deserialize()
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_registry_url.is_empty() {
            return Err(anyhow!("schema registry URL is required"));
        }
        if self.database_url.is_empty() {
            return Err(anyhow!("database URL is required"));
        }
        if self.batch_size <= 0 {
            return Err(anyhow!("batch size must be greater than 0"));
        }
        if self.max_polling_interval_ms < self.polling_interval_ms {
            return Err(anyhow!(
                "max polling interval must be >= base polling interval"
            ));
        }
        if self.max_concurrent_producers == 0 {
            return Err(anyhow!("max concurrent producers must be greater than 0"));
        }
        if self.max_producer_buffer == 0 {
            return Err(anyhow!("max producer buffer must be greater than 0"));
        }
        if self.publish_batch_size == 0 || self.consumer_batch_size == 0 {
            return Err(anyhow!("batcher sizes must be greater than 0"));
        }
        if self.backoff_multiplier <= 1.0 {
            return Err(anyhow!("backoff multiplier must be greater than 1.0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RelayConfig {
        RelayConfig {
            bootstrap_servers: "localhost:9092".into(),
            topic_name: "outbox-events".into(),
            schema_registry_url: "http://localhost:8081".into(),
            database_url: "postgres://localhost/test".into(),
            batch_size: 100,
            polling_interval_ms: 250,
            max_polling_interval_ms: 30_000,
            backoff_multiplier: 2.0,
            enable_adaptive_backoff: true,
            max_concurrent_producers: 8,
            max_producer_buffer: 1_000,
            database_connection_pool_size: 10,
            publish_batch_size: 500,
            publish_flush_interval_ms: 1_000,
            consumer_batch_size: 5_000,
            consumer_flush_interval_ms: 50,
            consumer_instance_count: 1,
            max_retries: 5,
            reaper_interval_secs: 60,
            key_lock_idle_threshold_secs: 120,
            key_lock_max_retained: 5_000,
            in_flight_stuck_threshold_secs: 1_800,
            require_processed_flag: true,
            log_level: "info".into(),
            enable_metrics: true,
        }
    }

    #[test]
    fn validates_a_well_formed_config() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn rejects_missing_schema_registry_url() {
        let mut cfg = sample();
        cfg.schema_registry_url.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_inverted_polling_bounds() {
        let mut cfg = sample();
        cfg.max_polling_interval_ms = 10;
        cfg.polling_interval_ms = 250;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_batch_size() {
        let mut cfg = sample();
        cfg.batch_size = 0;
        assert!(cfg.validate().is_err());
    }
}
