//! System clock
//!
//! Monotonic microsecond clock used for timeouts, timeslices and log
//! timestamps. With [`ClockSource::Manual`] the clock only moves when the
//! kernel is told to advance it, which keeps tests deterministic.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::ClockSource;

pub struct Clock {
    source: ClockSource,
    manual_us: AtomicU64,
    host_base: u64,
}

impl Clock {
    pub fn new(source: ClockSource) -> Self {
        Self {
            source,
            manual_us: AtomicU64::new(0),
            host_base: kestrel_arch::timer::now_us(),
        }
    }

    /// Current time in microseconds since boot.
    #[inline]
    pub fn now(&self) -> u64 {
        match self.source {
            ClockSource::Manual => self.manual_us.load(Ordering::Acquire),
            ClockSource::Host => kestrel_arch::timer::now_us().saturating_sub(self.host_base),
        }
    }

    /// Move a manual clock forward. Has no effect on the host clock.
    pub fn advance(&self, us: u64) -> u64 {
        match self.source {
            ClockSource::Manual => self.manual_us.fetch_add(us, Ordering::AcqRel) + us,
            ClockSource::Host => self.now(),
        }
    }

    #[inline]
    pub fn source(&self) -> ClockSource {
        self.source
    }
}
