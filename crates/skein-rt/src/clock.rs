// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Monotonic nanosecond clock shared by timers and deadlines.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds since the process epoch. Never returns 0, so 0 can stand
/// for "no deadline".
pub fn now_ns() -> u64 {
    let elapsed = EPOCH.get_or_init(Instant::now).elapsed();
    u64::try_from(elapsed.as_nanos())
        .unwrap_or(u64::MAX - 1)
        .saturating_add(1)
}

/// Duration in nanoseconds, saturating.
pub fn duration_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Absolute deadline `d` from now, saturating at `u64::MAX`.
pub fn deadline_after(d: Duration) -> u64 {
    now_ns().saturating_add(duration_ns(d))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_and_nonzero() {
        let a = now_ns();
        let b = now_ns();
        assert!(a >= 1);
        assert!(b >= a);
    }

    #[test]
    fn deadline_saturates() {
        assert_eq!(deadline_after(Duration::MAX), u64::MAX);
    }
}
