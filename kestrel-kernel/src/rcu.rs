//! Read-copy-update
//!
//! Callbacks submitted with [`Rcu::call`] run once every CPU that was
//! active when their batch started has passed a quiescent state. Each CPU
//! moves its callbacks through three lists:
//!
//! - `n`: submitted, not yet assigned to a batch
//! - `c`: waiting for batch `batch` to complete
//! - `d`: grace period over, ready to run
//!
//! The global state counts batches. A batch starts with the set of
//! active CPUs to wait for; every CPU reports one quiescent state for it,
//! and when the last one does the batch is complete and the next pending
//! batch starts. An idle CPU leaves the set of active CPUs and counts as
//! quiescent at once, so an idle CPU never holds up a grace period.
//!
//! Batch numbers start at [`RCU_BATCH_START`] and are compared with
//! wrapping arithmetic.
//!
//! # Locking
//!
//! Per-CPU data is locked before the global state. Callbacks run with no
//! lock held; they may submit further callbacks.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;

use spin::Mutex;

use crate::config::RCU_BATCH_START;
use crate::context::{Context, ThreadState};

/// An RCU callback. Returns whether its CPU must reschedule.
pub type RcuCallback = Box<dyn FnOnce() -> bool + Send>;

#[inline]
fn batch_ge(a: i64, b: i64) -> bool {
    a.wrapping_sub(b) >= 0
}

#[inline]
fn bit(cpu: usize) -> u32 {
    1 << cpu
}

struct RcuGlobal {
    /// Current batch.
    current: i64,
    /// Last completed batch.
    completed: i64,
    /// A batch is requested to start after the current one.
    next_pending: bool,
    /// CPUs that still owe a quiescent state for `current`.
    cpus: u32,
    /// CPUs that are not idle.
    active_cpus: u32,
}

impl RcuGlobal {
    fn start_batch(&mut self) {
        if self.next_pending && self.completed == self.current {
            self.next_pending = false;
            self.current = self.current.wrapping_add(1);
            self.cpus = self.active_cpus;
            log::trace!(target: "kestrel::rcu", "batch {} started, cpus {:#x}", self.current, self.cpus);
            if self.cpus == 0 {
                // Nobody to wait for.
                self.completed = self.current;
            }
        }
    }

    fn cpu_quiet(&mut self, cpu: usize) {
        self.cpus &= !bit(cpu);
        if self.cpus == 0 {
            self.completed = self.current;
            log::trace!(target: "kestrel::rcu", "batch {} completed", self.completed);
            self.start_batch();
        }
    }
}

/// RCU state of one CPU.
pub struct RcuData {
    /// Batch the quiescent state tracking refers to.
    q_batch: i64,
    /// A quiescent state passed since `q_batch` started.
    q_passed: bool,
    /// This CPU owes a quiescent state for `q_batch`.
    pending: bool,
    idle: bool,
    /// Batch the callbacks in `c` wait for.
    batch: i64,
    n: VecDeque<RcuCallback>,
    c: VecDeque<RcuCallback>,
    d: VecDeque<RcuCallback>,
    len: usize,
}

impl RcuData {
    fn new() -> Self {
        Self {
            q_batch: RCU_BATCH_START,
            q_passed: false,
            pending: false,
            idle: true,
            batch: RCU_BATCH_START,
            n: VecDeque::new(),
            c: VecDeque::new(),
            d: VecDeque::new(),
            len: 0,
        }
    }

    fn check_quiescent_state(&mut self, g: &mut RcuGlobal, cpu: usize) {
        if self.q_batch != g.current {
            // A new grace period started.
            self.pending = true;
            self.q_passed = false;
            self.q_batch = g.current;
            return;
        }
        if !self.pending || !self.q_passed {
            return;
        }
        self.pending = false;
        if self.q_batch == g.current {
            g.cpu_quiet(cpu);
        }
    }

    fn has_work(&self, g: &RcuGlobal) -> bool {
        // Grace period of the current callbacks is over.
        (!self.c.is_empty() && batch_ge(g.completed, self.batch))
            // New callbacks wait for a batch.
            || (self.c.is_empty() && !self.n.is_empty())
            || !self.d.is_empty()
            // A quiescent state is owed.
            || self.q_batch != g.current
            || self.pending
    }
}

pub struct Rcu {
    global: Mutex<RcuGlobal>,
    data: Vec<Mutex<RcuData>>,
}

impl Rcu {
    /// RCU state for `num_cpus` CPUs, all idle.
    pub fn new(num_cpus: usize) -> Self {
        Self {
            global: Mutex::new(RcuGlobal {
                current: RCU_BATCH_START,
                completed: RCU_BATCH_START,
                next_pending: false,
                cpus: 0,
                active_cpus: 0,
            }),
            data: (0..num_cpus).map(|_| Mutex::new(RcuData::new())).collect(),
        }
    }

    /// Queue `cb` on `cpu`'s new list.
    pub fn call(&self, cpu: usize, cb: RcuCallback) {
        let Some(d) = self.data.get(cpu) else {
            log::warn!(target: "kestrel::rcu", "call on invalid cpu {}, running callback now", cpu);
            cb();
            return;
        };
        log::trace!(target: "kestrel::rcu", "call on cpu {}", cpu);
        let mut d = d.lock();
        d.n.push_back(cb);
        d.len += 1;
    }

    /// Advance `cpu`'s callback lists and run the callbacks whose grace
    /// period is over.
    ///
    /// Returns whether a callback asked for a reschedule.
    pub fn process_callbacks(&self, cpu: usize) -> bool {
        let Some(data) = self.data.get(cpu) else {
            return false;
        };
        let done = {
            let mut d = data.lock();
            let mut g = self.global.lock();

            if !d.c.is_empty() && batch_ge(g.completed, d.batch) {
                let c = mem::take(&mut d.c);
                d.d.extend(c);
            }

            if !d.n.is_empty() && d.c.is_empty() {
                d.c = mem::take(&mut d.n);
                d.batch = g.current.wrapping_add(1);
                if !g.next_pending {
                    g.next_pending = true;
                    g.start_batch();
                }
            }

            d.check_quiescent_state(&mut g, cpu);
            mem::take(&mut d.d)
        };

        if done.is_empty() {
            return false;
        }
        let count = done.len();
        log::trace!(target: "kestrel::rcu", "cpu {} runs {} callbacks", cpu, count);
        let mut need_resched = false;
        for cb in done {
            need_resched |= cb();
        }
        let mut d = data.lock();
        d.len = d.len.saturating_sub(count);
        need_resched
    }

    /// Whether `cpu` has RCU work to do.
    pub fn pending(&self, cpu: usize) -> bool {
        let Some(d) = self.data.get(cpu) else {
            return false;
        };
        let d = d.lock();
        let g = self.global.lock();
        d.has_work(&g)
    }

    /// Whether `cpu` may enter idle: no callbacks wait for a batch and
    /// nothing is pending.
    pub fn idle(&self, cpu: usize) -> bool {
        let Some(d) = self.data.get(cpu) else {
            return true;
        };
        let d = d.lock();
        let g = self.global.lock();
        d.c.is_empty() && !d.has_work(&g)
    }

    /// Record a quiescent state of `cpu`.
    #[inline]
    pub fn inc_q_cnt(&self, cpu: usize) {
        if let Some(d) = self.data.get(cpu) {
            d.lock().q_passed = true;
        }
    }

    /// Pass a quiescent state and process callbacks if `cpu` has work.
    pub fn do_pending_work(&self, cpu: usize) -> bool {
        if self.pending(cpu) {
            self.inc_q_cnt(cpu);
            return self.process_callbacks(cpu);
        }
        false
    }

    /// Whether any CPU holds callbacks that have not run yet.
    pub fn has_pending_work(&self) -> bool {
        self.data.iter().any(|d| d.lock().len > 0)
    }

    /// Number of callbacks `cpu` holds.
    pub fn queued(&self, cpu: usize) -> usize {
        self.data.get(cpu).map_or(0, |d| d.lock().len)
    }

    /// Remove `cpu` from the set of CPUs grace periods wait for.
    pub fn enter_idle(&self, cpu: usize) {
        let Some(d) = self.data.get(cpu) else {
            return;
        };
        let mut d = d.lock();
        if d.idle {
            return;
        }
        d.idle = true;
        let mut g = self.global.lock();
        g.active_cpus &= !bit(cpu);
        if d.q_batch != g.current || d.pending {
            d.q_batch = g.current;
            d.pending = false;
            g.cpu_quiet(cpu);
        }
        log::trace!(target: "kestrel::rcu", "cpu {} idle", cpu);
    }

    /// Add `cpu` back to the set of CPUs grace periods wait for.
    pub fn leave_idle(&self, cpu: usize) {
        let Some(d) = self.data.get(cpu) else {
            return;
        };
        let mut d = d.lock();
        if !d.idle {
            return;
        }
        d.idle = false;
        let mut g = self.global.lock();
        g.active_cpus |= bit(cpu);
        d.q_batch = g.current;
    }

    /// Whether `cpu` is excluded from grace periods.
    pub fn is_idle(&self, cpu: usize) -> bool {
        self.data.get(cpu).is_some_and(|d| d.lock().idle)
    }

    /// Take a dead CPU out of RCU and hand its callbacks to `to`.
    pub fn take_cpu_offline(&self, cpu: usize, to: usize) {
        if cpu == to {
            return;
        }
        let (Some(dead), Some(alive)) = (self.data.get(cpu), self.data.get(to)) else {
            return;
        };
        let lists = {
            let mut d = dead.lock();
            let mut g = self.global.lock();
            g.active_cpus &= !bit(cpu);
            if g.current != g.completed {
                g.cpu_quiet(cpu);
            }
            d.idle = true;
            d.pending = false;
            let len = mem::take(&mut d.len);
            let mut lists = mem::take(&mut d.c);
            lists.extend(mem::take(&mut d.n));
            lists.extend(mem::take(&mut d.d));
            (lists, len)
        };
        log::info!(target: "kestrel::rcu", "cpu {} offline, {} callbacks moved to cpu {}", cpu, lists.1, to);
        let mut a = alive.lock();
        a.n.extend(lists.0);
        a.len += lists.1;
    }

    /// Bring `cpu` back into RCU after it came online.
    pub fn take_cpu_online(&self, cpu: usize) {
        self.leave_idle(cpu);
    }
}

impl Context {
    /// Block until a grace period has passed.
    ///
    /// Used by teardown paths: afterwards no CPU holds a reference to an
    /// object this context unlinked before the call.
    pub async fn rcu_wait(self: &Arc<Self>) {
        let cpu = kestrel_arch::cpu_id();
        self.state_change(ThreadState::READY, ThreadState::WAITING);
        let me = self.clone();
        self.kernel().rcu().call(
            cpu,
            Box::new(move || me.xcpu_state_change(ThreadState::WAITING, ThreadState::READY, false)),
        );
        log::debug!(target: "kestrel::rcu", "{:?} waits for a grace period", self.me());
        while self.block_if(|s| s.contains(ThreadState::WAITING)) {
            self.schedule().await;
        }
    }
}
