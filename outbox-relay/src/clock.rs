//! Monotonic elapsed-time clock shared by the in-flight tracker (C5) and
//! the per-key lock registry (C4).
//!
//! Neither component may use `SystemTime`/`chrono::Utc::now` — a backward
//! system clock step would make a fresh claim look instantly stale. But a
//! per-operation counter (bumped only when `try_claim`/`acquire` runs) is
//! just as wrong the other way: its rate of advance depends on request
//! volume, not wall-clock time, so a "120 second" or "30 minute" threshold
//! configured in real seconds would fire early under high churn and never
//! under low churn. `std::time::Instant` is the correct primitive for
//! both: monotonic, immune to clock steps, and its deltas are real
//! elapsed time.

use std::sync::OnceLock;
use std::time::Instant;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Milliseconds elapsed since the first call to any `clock` function in
/// this process. Monotonic and immune to system clock adjustments.
pub fn now_millis() -> u64 {
    epoch().elapsed().as_millis() as u64
}
