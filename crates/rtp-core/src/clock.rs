//! Monotonic millisecond clock.
//!
//! The forwarding engine never owns timers; it reads this clock on demand
//! when planning (bitrate queries, stream active time).

use std::sync::OnceLock;
use std::time::Instant;

static BASE: OnceLock<Instant> = OnceLock::new();

/// Monotonic milliseconds elapsed since the first call in this process.
pub fn now_ms() -> u64 {
    let base = BASE.get_or_init(Instant::now);
    base.elapsed().as_millis() as u64
}
