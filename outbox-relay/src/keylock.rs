//! Per-key mutex registry (C4): mints/retrieves a mutual-exclusion
//! primitive keyed by routing key, tracks last-use, evicts idle entries.

use crate::clock::now_millis;
use crate::model::KeyLockEntry;
use dashmap::DashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::info;

/// Holds the lock for one routing key until dropped.
pub struct KeyLockHandle {
    _guard: OwnedMutexGuard<()>,
}

pub struct KeyLockRegistry {
    entries: Arc<DashMap<String, Arc<KeyLockEntry>>>,
}

impl KeyLockRegistry {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Returns a release handle once this caller uniquely holds the
    /// routing key's mutex. Creation of a new entry and lookup of an
    /// existing one are atomic with respect to other acquirers (I7): the
    /// `DashMap::entry` API never exposes a torn intermediate state.
    pub async fn acquire(&self, routing_key: &str) -> KeyLockHandle {
        let entry = self
            .entries
            .entry(routing_key.to_string())
            .or_insert_with(|| Arc::new(KeyLockEntry::new(now_millis())))
            .clone();

        entry.last_used_millis.store(now_millis(), Ordering::SeqCst);
        let guard = Arc::clone(&entry.mutex).lock_owned().await;
        entry.last_used_millis.store(now_millis(), Ordering::SeqCst);

        KeyLockHandle { _guard: guard }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry whose mutex is currently unheld and whose
    /// `last_used_millis` is older than `idle_threshold`; if entries still
    /// exceed `max_retained`, evicts the oldest-used first. Active (held)
    /// entries are never evicted.
    pub fn evict_idle(&self, idle_threshold: Duration, max_retained: usize) -> usize {
        let now = now_millis();
        let idle_ms = idle_threshold.as_millis() as u64;
        let mut removed = 0usize;

        let idle_keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| {
                let unheld = e.value().mutex.try_lock().is_ok();
                let idle = now.saturating_sub(e.value().last_used_millis.load(Ordering::SeqCst))
                    > idle_ms;
                unheld && idle
            })
            .map(|e| e.key().clone())
            .collect();

        for key in idle_keys {
            if self.entries.remove(&key).is_some() {
                removed += 1;
            }
        }

        if self.entries.len() > max_retained {
            let mut by_age: Vec<(String, u64)> = self
                .entries
                .iter()
                .filter(|e| e.value().mutex.try_lock().is_ok())
                .map(|e| (e.key().clone(), e.value().last_used_millis.load(Ordering::SeqCst)))
                .collect();
            by_age.sort_by_key(|(_, last_used)| *last_used);

            let over = self.entries.len().saturating_sub(max_retained);
            for (key, _) in by_age.into_iter().take(over) {
                if self.entries.remove(&key).is_some() {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            info!(removed, remaining = self.entries.len(), "evicted idle key locks");
        }
        removed
    }
}

impl Default for KeyLockRegistry {
    fn default() -> Self {
        Self::new()
    }
}
