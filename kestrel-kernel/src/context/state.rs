//! Context state word
//!
//! The state of a context is one atomic word of [`ThreadState`] flags.
//! Remote CPUs read it without locks, so every update is a single atomic
//! read-modify-write.

use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Thread state flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ThreadState: u32 {
        /// Can be scheduled.
        const READY = 0x1;
        /// DRQs are pending for this context.
        const DRQ_READY = 0x2;
        /// Waiting to send a message.
        const SEND_WAIT = 0x4;
        /// Waiting for a message.
        const RECEIVE_WAIT = 0x8;
        /// Receiving a message in the context of the next sender.
        const RECEIVE_IN_PROGRESS = 0x10;
        /// Passively receiving until this flag is cleared.
        const IPC_TRANSFER = 0x20;
        /// The receiver cancelled the operation.
        const TRANSFER_FAILED = 0x40;
        /// Cancel the current activity.
        const CANCEL = 0x80;
        /// The IPC timeout hit, or a zero receive timeout found no sender.
        const TIMEOUT = 0x100;
        /// Allocated but inactive.
        const DEAD = 0x200;
        /// About to be killed.
        const DYING = 0x400;
        /// `finish_migration` must run on the new home CPU first.
        const FINISH_MIGRATION = 0x1000;
        const NEED_RESCHED = 0x2000;
        /// Owns the FPU.
        const FPU_OWNER = 0x8000;
        /// Sent an exception and waits for the reply.
        const IN_EXCEPTION = 0x40000;
        /// Waits for the answer to a DRQ.
        const DRQ_WAIT = 0x100000;
        /// Waits for an RCU grace period.
        const WAITING = 0x200000;
        const VCPU_ENABLED = 0x400000;

        const READY_MASK = Self::READY.bits() | Self::DRQ_READY.bits();
        const IPC_MASK = Self::SEND_WAIT.bits()
            | Self::RECEIVE_WAIT.bits()
            | Self::RECEIVE_IN_PROGRESS.bits();
        const FULL_IPC_MASK = Self::IPC_MASK.bits()
            | Self::CANCEL.bits()
            | Self::TRANSFER_FAILED.bits()
            | Self::TIMEOUT.bits()
            | Self::IPC_TRANSFER.bits();
        /// Any of these stops a sender waiting for its receiver.
        const IPC_ABORT_MASK = Self::TRANSFER_FAILED.bits()
            | Self::CANCEL.bits()
            | Self::TIMEOUT.bits()
            | Self::IPC_TRANSFER.bits();
        const SWITCH_HAZARDS = Self::FINISH_MIGRATION.bits() | Self::NEED_RESCHED.bits();
    }
}

/// Atomic cell holding a [`ThreadState`].
pub struct StateWord(AtomicU32);

impl StateWord {
    pub const fn new(initial: ThreadState) -> Self {
        Self(AtomicU32::new(initial.bits()))
    }

    #[inline]
    pub fn get(&self) -> ThreadState {
        ThreadState::from_bits_retain(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn add(&self, bits: ThreadState) {
        self.0.fetch_or(bits.bits(), Ordering::AcqRel);
    }

    #[inline]
    pub fn del(&self, bits: ThreadState) {
        self.0.fetch_and(!bits.bits(), Ordering::AcqRel);
    }

    /// Clear `del` and set `add` in one step. Returns the previous state.
    pub fn change(&self, del: ThreadState, add: ThreadState) -> ThreadState {
        self.update(|s| Some((s - del) | add)).unwrap_or(ThreadState::empty())
    }

    /// Like [`change`](Self::change), but only if none of the bits in `del`
    /// vanished concurrently: fails if `(state & del) != del`.
    pub fn change_safely(&self, del: ThreadState, add: ThreadState) -> bool {
        self.update(|s| s.contains(del).then(|| (s - del) | add)).is_some()
    }

    /// Apply `f` until the update sticks or `f` declines.
    ///
    /// Returns the state `f` accepted.
    pub fn update(&self, mut f: impl FnMut(ThreadState) -> Option<ThreadState>) -> Option<ThreadState> {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            let old = ThreadState::from_bits_retain(cur);
            let new = f(old)?;
            match self.0.compare_exchange_weak(cur, new.bits(), Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Some(old),
                Err(actual) => cur = actual,
            }
        }
    }
}
