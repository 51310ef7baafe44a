//! Monotonic microsecond counter
//!
//! Counts from the first call in this process.

use std::time::Instant;

static EPOCH: spin::Once<Instant> = spin::Once::new();

/// Microseconds since the counter was first read.
#[must_use]
pub fn now_us() -> u64 {
    let epoch = EPOCH.call_once(Instant::now);
    u64::try_from(epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic() {
        let a = now_us();
        let b = now_us();
        assert!(b >= a);
    }
}
