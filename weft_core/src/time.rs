//! Monotonic millisecond clock used by the timer set and the reactor.
//!
//! Grounded in `original_source/ljrServer/timer.cpp`'s `GetCurrentMS()`,
//! which reads `CLOCK_MONOTONIC` and truncates to milliseconds.

use std::time::Instant;

/// Returns the current time as milliseconds since an arbitrary epoch.
///
/// The epoch is process-local (tied to [`Instant`]'s internal reference
/// point), so values are only meaningful relative to each other.
pub fn now_ms() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}
