//! Scheduler
//!
//! Two scheduling policies sit behind one interface:
//!
//! - [`fp`]: fixed priorities 0-255, round robin within a priority
//! - [`wfq`]: weighted fair queueing with virtual deadlines
//!
//! Both are always compiled and tested. The `sched-fp` / `sched-wfq`
//! features pick the one bound to [`SchedContext`] and [`ActiveQueue`];
//! `sched-wfq` wins when both are enabled.
//!
//! # Key Concepts
//!
//! - **Scheduling context**: a context's parameter block (priority or
//!   deadline/weight) plus the time left of its current timeslice.
//! - **Current sched**: the scheduling context whose timeslice a CPU is
//!   consuming. It can belong to a different context than the one running
//!   (time-slice donation on a direct IPC switch, helping).
//! - **Domination**: a strict order deciding whether a woken context
//!   preempts the running one.

use core::fmt;

use crate::context::ContextRef;
use crate::error::KernelResult;

pub mod dispatch;
pub mod fp;
pub mod migrate;
pub mod ready_queue;
pub mod schedule;
pub mod wfq;

pub use dispatch::CpuRun;
pub use migrate::Migration;
pub use ready_queue::ReadyQueue;

#[cfg(feature = "sched-wfq")]
pub type SchedContext = wfq::WfqSched;
#[cfg(feature = "sched-wfq")]
pub type ActiveQueue = wfq::WfqQueue;

#[cfg(not(feature = "sched-wfq"))]
pub type SchedContext = fp::FpSched;
#[cfg(not(feature = "sched-wfq"))]
pub type ActiveQueue = fp::FpQueue;

/// Per-CPU ready queue of the active policy.
pub type CpuReadyQueue = ReadyQueue<SchedContext>;

// -- Parameters

/// Scheduling parameters as requested by user level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedParams {
    /// Fixed priority. Priorities above 255 are clamped, a zero quantum
    /// selects the default timeslice.
    FixedPrio { prio: u16, quantum_us: u64 },
    /// Weighted fair queueing. Quantum and weight must be non-zero.
    Wfq { quantum_us: u64, weight: u32 },
}

impl SchedParams {
    #[must_use]
    pub const fn fixed_prio(prio: u16) -> Self {
        Self::FixedPrio { prio, quantum_us: 0 }
    }

    #[must_use]
    pub const fn wfq(quantum_us: u64, weight: u32) -> Self {
        Self::Wfq { quantum_us, weight }
    }
}

impl Default for SchedParams {
    fn default() -> Self {
        Self::fixed_prio(crate::config::DEFAULT_PRIO as u16)
    }
}

// -- Policy interface

/// A scheduling context of one policy.
pub trait SchedPolicy: Copy + Send + Sync + fmt::Debug + 'static {
    /// Ready-queue structure ordering contexts of this policy.
    type Queue: RunQueue<Self>;

    /// Scheduling context with default parameters.
    fn new(default_quantum: u64) -> Self;

    /// Scheduling context of a CPU's kernel (idle) context.
    fn idle(default_quantum: u64) -> Self;

    /// Apply user parameters. Only called while the context is dequeued.
    fn set(&mut self, params: &SchedParams, default_quantum: u64) -> KernelResult<()>;

    /// Whether `self` must run before `other`. A strict order: never true
    /// in both directions, never true for the idle context.
    fn dominates(&self, other: &Self) -> bool;

    /// Refill the timeslice at the end of a period.
    fn replenish(&mut self);

    /// Adjust a context that wakes up against the CPU's current sched.
    fn deblock_refill(&mut self, _current: Option<&Self>) {}

    fn left(&self) -> u64;
    fn set_left(&mut self, left: u64);
    fn quantum(&self) -> u64;

    /// Priority used to order IPC senders.
    fn prio(&self) -> u8;
}

/// Ordered set of ready contexts.
///
/// Entries carry a snapshot of the scheduling context taken at enqueue
/// time; parameters only change while a context is dequeued.
pub trait RunQueue<S>: Send {
    fn new() -> Self;

    /// Register the CPU's idle context. It is always considered queued.
    fn set_idle(&mut self, ctx: ContextRef, sc: &S);

    /// Insert `ctx`. `is_current` puts it before its equals.
    fn enqueue(&mut self, ctx: ContextRef, sc: &S, is_current: bool);
    fn dequeue(&mut self, ctx: ContextRef);

    /// Move `ctx` behind its equals (after its timeslice was refilled).
    fn requeue(&mut self, ctx: ContextRef, sc: &S);

    fn next_to_run(&self) -> Option<ContextRef>;
    fn contains(&self, ctx: ContextRef) -> bool;

    /// Number of queued contexts, not counting the idle context.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
