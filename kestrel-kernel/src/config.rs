//! Kernel configuration
//!
//! Compile-time limits live here as constants. Everything that may differ
//! between two boots of the same binary is part of [`KernelConfig`].

use log::LevelFilter;

use crate::error::{KernelError, KernelResult};

// -- Limits

/// Maximum number of CPUs supported.
pub const MAX_CPUS: usize = kestrel_arch::MAX_CPUS;

/// Maximum number of live contexts (the handle index is 16 bits wide).
pub const MAX_CONTEXTS: usize = 4096;

/// Priority of a context created without explicit scheduling parameters.
pub const DEFAULT_PRIO: u8 = 1;

/// Highest fixed priority.
pub const MAX_PRIO: u8 = 255;

/// Default timeslice length in microseconds.
pub const DEFAULT_TIMESLICE_US: u64 = 10_000;

/// Longest donation chain followed when resolving a helping relation.
pub const HELPING_CHAIN_MAX: usize = 16;

/// Initial value of the RCU batch counters.
///
/// Starting below zero makes counter wrap-around show up early.
pub const RCU_BATCH_START: i64 = -300;

/// Period of the per-CPU RCU timeout while callbacks are outstanding.
pub const RCU_IDLE_PERIOD_US: u64 = 2_000;

/// Number of dispatch steps `run_cpu` takes before handing control back.
pub const DISPATCH_ROUND_LIMIT: usize = 64;

/// Number of all-CPU rounds `run_until_idle` takes before giving up.
pub const IDLE_ROUND_LIMIT: usize = 10_000;

// -- Boot configuration

/// Source of the kernel's microsecond clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ClockSource {
    /// Clock only moves through [`Kernel::advance_clock`](crate::Kernel::advance_clock).
    #[default]
    Manual,
    /// The arch layer's monotonic host counter.
    Host,
}

/// Boot-time kernel configuration.
#[derive(Clone, Copy, Debug)]
pub struct KernelConfig {
    /// Number of CPUs brought online at boot.
    pub num_cpus: usize,
    /// Clock driving timeouts and timeslices.
    pub clock: ClockSource,
    /// Timeslice given to contexts that do not request one.
    pub timeslice_us: u64,
    /// Maximum level recorded by the kernel logger.
    pub log_level: LevelFilter,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            num_cpus: 1,
            clock: ClockSource::Manual,
            timeslice_us: DEFAULT_TIMESLICE_US,
            log_level: LevelFilter::Debug,
        }
    }
}

impl KernelConfig {
    #[must_use]
    pub const fn with_cpus(mut self, num_cpus: usize) -> Self {
        self.num_cpus = num_cpus;
        self
    }

    #[must_use]
    pub const fn with_clock(mut self, clock: ClockSource) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub const fn with_timeslice_us(mut self, timeslice_us: u64) -> Self {
        self.timeslice_us = timeslice_us;
        self
    }

    #[must_use]
    pub const fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }

    /// Check the configuration against the compile-time limits.
    pub fn validate(&self) -> KernelResult<()> {
        if self.num_cpus == 0 || self.num_cpus > MAX_CPUS || self.timeslice_us == 0 {
            return Err(KernelError::EInval);
        }
        Ok(())
    }
}
