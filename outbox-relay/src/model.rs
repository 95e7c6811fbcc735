//! Data model shared by every relay component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Retry counter value signaling a row has exhausted its retry budget and is
/// excluded from `FetchNextBatch` until an operator intervenes.
pub const TERMINAL_FAILURE_RETRY_COUNT: i32 = -1;

/// A row in the outbox table, as read by the producer pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRow {
    pub id: i64,
    pub routing_key: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub publish_flag: bool,
    pub processed_flag: bool,
    pub produced_at: Option<DateTime<Utc>>,
    pub received_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Process-local claim held by the producer pipeline while a row id is
/// in the channel or being worked on. `claimed_at_millis` is a monotonic
/// elapsed-time reading (`clock::now_millis`), never a wall-clock
/// timestamp, so a system clock step cannot affect sweeps.
#[derive(Debug, Clone, Copy)]
pub struct InFlightEntry {
    pub id: i64,
    pub claimed_at_millis: u64,
}

/// A lazily-created per-key lock, tracked for idle eviction.
pub struct KeyLockEntry {
    pub mutex: std::sync::Arc<tokio::sync::Mutex<()>>,
    pub last_used_millis: std::sync::atomic::AtomicU64,
}

impl KeyLockEntry {
    pub fn new(now_millis: u64) -> Self {
        Self {
            mutex: std::sync::Arc::new(tokio::sync::Mutex::new(())),
            last_used_millis: std::sync::atomic::AtomicU64::new(now_millis),
        }
    }
}

/// Transient accumulation of row ids awaiting back-marking. Plain
/// `VecDeque`; callers are responsible for holding a lock around mutation
/// (see `batcher::MarkBatcher`).
#[derive(Debug, Default)]
pub struct IdBuffer {
    ids: VecDeque<i64>,
}

impl IdBuffer {
    pub fn push(&mut self, id: i64) {
        self.ids.push_back(id);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Take the current contents, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<i64> {
        std::mem::take(&mut self.ids).into_iter().collect()
    }

    /// Re-append ids after a failed flush, capped so a persistently failing
    /// sink cannot grow the buffer without bound.
    pub fn requeue_capped(&mut self, ids: Vec<i64>, cap: usize) {
        for id in ids {
            if self.ids.len() >= cap {
                break;
            }
            self.ids.push_back(id);
        }
    }
}

/// Snapshot returned by the statistics entry point (spec §6).
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub in_flight_count: usize,
    pub key_lock_count: usize,
    pub manual_trigger_count: u64,
    pub now: DateTime<Utc>,
}

/// Result of the manual-trigger entry point (spec §6).
#[derive(Debug, Clone, Serialize)]
pub struct TriggerResult {
    pub success: bool,
    pub messages_added: usize,
    pub timestamp: DateTime<Utc>,
}
