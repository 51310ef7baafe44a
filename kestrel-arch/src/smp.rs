//! SMP support
//!
//! Inter-processor interrupts are modelled as a mailbox of pending bits
//! per CPU. Sending sets a bit; the target CPU takes and clears all of its
//! bits when it next handles events.

use core::sync::atomic::{AtomicU32, Ordering};

/// Maximum number of CPUs supported
pub const MAX_CPUS: usize = 8;

/// Inter-processor interrupt kinds.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ipi {
    /// The target's pending-request queue became non-empty.
    Request = 1 << 0,
    /// A request that every CPU must handle.
    GlobalRequest = 1 << 1,
    /// The target should re-run its scheduler.
    Reschedule = 1 << 2,
}

/// Set of IPIs taken from a mailbox.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IpiSet(u32);

impl IpiSet {
    #[inline]
    #[must_use]
    pub const fn contains(self, ipi: Ipi) -> bool {
        self.0 & ipi as u32 != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Per-CPU IPI mailbox.
pub struct IpiMailbox {
    pending: [AtomicU32; MAX_CPUS],
    sent: AtomicU32,
}

impl IpiMailbox {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pending: [const { AtomicU32::new(0) }; MAX_CPUS],
            sent: AtomicU32::new(0),
        }
    }

    /// Raise `ipi` on `cpu`.
    ///
    /// Out-of-range CPUs are ignored.
    pub fn send(&self, cpu: usize, ipi: Ipi) {
        if let Some(slot) = self.pending.get(cpu) {
            slot.fetch_or(ipi as u32, Ordering::Release);
            self.sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Take and clear all IPIs pending on `cpu`.
    #[must_use]
    pub fn take(&self, cpu: usize) -> IpiSet {
        self.pending
            .get(cpu)
            .map_or(IpiSet::default(), |slot| IpiSet(slot.swap(0, Ordering::Acquire)))
    }

    /// Peek at the IPIs pending on `cpu`.
    #[must_use]
    pub fn pending(&self, cpu: usize) -> IpiSet {
        self.pending
            .get(cpu)
            .map_or(IpiSet::default(), |slot| IpiSet(slot.load(Ordering::Acquire)))
    }

    /// Total number of IPIs sent so far.
    #[must_use]
    pub fn sent_count(&self) -> u32 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl Default for IpiMailbox {
    fn default() -> Self {
        Self::new()
    }
}
