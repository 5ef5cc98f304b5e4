//! Monotonic time helpers.
//!
//! Timestamps are nanoseconds since an arbitrary process-local epoch, so
//! they can be carried through command payloads as plain `u64`s.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Current monotonic time in nanoseconds.
pub fn now_ns() -> u64 {
    epoch().elapsed().as_nanos() as u64
}

/// Sleeps until `target_ns`. Returns immediately if the target has passed.
pub fn sleep_until_ns(target_ns: u64) {
    let now = now_ns();
    if target_ns > now {
        std::thread::sleep(Duration::from_nanos(target_ns - now));
    }
}
