//! Per-CPU timeout queue
//!
//! Maintains a priority queue of absolute wake-up times per CPU. The timer
//! interrupt path pops every expired entry and delivers it according to
//! its kind:
//!
//! - IPC timeouts set `READY | TIMEOUT` on their owner and deblock it
//! - the RCU timeout runs the CPU's RCU callbacks
//!
//! Cancellation is lazy: an entry stays in the heap until it expires and
//! is then dropped if its owner no longer refers to it. The timeslice
//! timeout is not queued here; it is the ready queue's `timeslice_end`.

extern crate alloc;

use alloc::collections::BinaryHeap;
use alloc::sync::Arc;
use core::cmp::Ordering;

use kestrel_abi::{Timeout, Utcb};
use kestrel_arch::INVALID_CPU;

use crate::context::{Context, ContextRef, ThreadState};
use crate::cpu::Cpu;

/// What an expired timeout acts on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutKind {
    /// IPC send or receive timeout of a context.
    Ipc(ContextRef),
    /// Periodic RCU processing of the CPU.
    Rcu,
}

struct Entry {
    wake: u64,
    id: u64,
    kind: TimeoutKind,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.wake == other.wake && self.id == other.id
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: earliest wake first, then arming order.
        other.wake.cmp(&self.wake).then_with(|| other.id.cmp(&self.id))
    }
}

pub struct TimeoutQueue {
    heap: BinaryHeap<Entry>,
    next_id: u64,
}

impl TimeoutQueue {
    pub const fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_id: 0,
        }
    }

    /// Arm a timeout firing at `wake`. Returns its id.
    pub fn arm(&mut self, wake: u64, kind: TimeoutKind) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Entry { wake, id, kind });
        id
    }

    /// Pop the earliest entry if it is due at `now`.
    pub fn pop_expired(&mut self, now: u64) -> Option<(u64, TimeoutKind)> {
        if self.heap.peek()?.wake > now {
            return None;
        }
        self.heap.pop().map(|e| (e.id, e.kind))
    }

    /// Wake time of the earliest entry.
    pub fn next_wake(&self) -> Option<u64> {
        self.heap.peek().map(|e| e.wake)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl Default for TimeoutQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A context's armed IPC timeout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpcTimeout {
    /// CPU whose queue holds the entry, [`INVALID_CPU`] while migrating.
    pub cpu: usize,
    pub id: u64,
    pub wake: u64,
    /// Expired before it was reset.
    pub hit: bool,
}

impl Context {
    /// Arm an IPC timeout at absolute time `wake` on the home CPU.
    pub fn set_timeout(&self, wake: u64) {
        let Some(cpu) = self.home() else {
            return;
        };
        let id = cpu.timeouts.lock().arm(wake, TimeoutKind::Ipc(self.me()));
        *self.timeout.lock() = Some(IpcTimeout {
            cpu: cpu.id(),
            id,
            wake,
            hit: false,
        });
    }

    /// Resolve `t` against `now`. Absolute timeouts read the UTCB, whose
    /// lock is released again before this returns.
    pub(crate) fn wake_time(&self, t: Timeout, now: u64) -> u64 {
        let utcb = self.utcb.lock();
        t.microsecs(now, &utcb)
    }

    /// Disarm the IPC timeout. Returns whether it had hit.
    pub fn reset_timeout(&self) -> bool {
        self.timeout.lock().take().is_some_and(|t| t.hit)
    }

    /// Whether an IPC timeout is armed and has not hit yet.
    pub fn timeout_armed(&self) -> bool {
        self.timeout.lock().is_some_and(|t| !t.hit)
    }

    /// Arm the timeout of a blocking IPC phase.
    ///
    /// A zero timeout, or one already in the past, completes the wait at
    /// once by setting `READY | TIMEOUT`.
    pub(crate) fn setup_timer(&self, timeout: Timeout, utcb: &Utcb) {
        if timeout.is_never() {
            return;
        }
        if timeout.is_zero() {
            self.state_add(ThreadState::READY | ThreadState::TIMEOUT);
            return;
        }

        let now = self.kernel().now();
        let wake = timeout.microsecs(now, utcb);
        if wake > now {
            self.set_timeout(wake);
        } else {
            self.state_add(ThreadState::READY | ThreadState::TIMEOUT);
        }
    }

    /// Deliver an expired IPC timeout. Runs on `cpu`, the home CPU.
    ///
    /// Returns whether the CPU must reschedule.
    pub(crate) fn ipc_timeout_expired(self: &Arc<Self>, id: u64, cpu: &Cpu) -> bool {
        {
            let mut t = self.timeout.lock();
            match t.as_mut() {
                Some(t) if t.id == id && t.cpu == cpu.id() && !t.hit => t.hit = true,
                _ => return false,
            }
        }

        let ipc = self.state() & ThreadState::IPC_MASK;
        if ipc.is_empty() || ipc.contains(ThreadState::RECEIVE_IN_PROGRESS) {
            return false;
        }

        log::trace!(target: "kestrel::ipc", "timeout hit {:?}", self.me());
        self.state_add(ThreadState::READY | ThreadState::TIMEOUT);
        cpu.deblock_current(self, false)
    }

    /// Detach the IPC timeout from its CPU for a migration.
    pub(crate) fn detach_timeout(&self) {
        if let Some(t) = self.timeout.lock().as_mut() {
            t.cpu = INVALID_CPU;
        }
    }

    /// Re-arm a timeout detached by a migration on the new home CPU,
    /// unless it already hit.
    pub(crate) fn enqueue_timeout_again(&self) {
        let Some(cpu) = self.home() else {
            return;
        };
        if !cpu.is_online() {
            return;
        }
        let mut t = self.timeout.lock();
        if let Some(t) = t.as_mut() {
            if t.hit || t.cpu != INVALID_CPU {
                return;
            }
            t.id = cpu.timeouts.lock().arm(t.wake, TimeoutKind::Ipc(self.me()));
            t.cpu = cpu.id();
        }
    }
}
