//! Process-monotonic microsecond clock.
//!
//! Statistics and frame pacing need a cheap monotonic timestamp that fits in
//! an atomic. Anchoring an `Instant` at first use and handing out
//! microseconds since that epoch gives a `u64` that every counter in the
//! crate can store and subtract safely.

use std::time::Instant;

lazy_static::lazy_static! {
    static ref EPOCH: Instant = Instant::now();
}

/// Microseconds elapsed since the process clock epoch.
///
/// The epoch is pinned the first time any clock user runs, so values are
/// only comparable within one process.
#[inline]
pub fn now_us() -> u64 {
    EPOCH.elapsed().as_micros() as u64
}
