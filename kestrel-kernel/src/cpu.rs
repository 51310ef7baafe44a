//! Per-CPU kernel state
//!
//! One [`Cpu`] per configured CPU, created at boot and never resized. It
//! holds everything the scheduler of that CPU owns:
//!
//! - the ready queue with the current timeslice
//! - the pending-request queue filled by remote CPUs
//! - the timeout queue
//! - the current context and the kernel (idle) context
//! - the reschedule and pending-switch flags read by the dispatcher
//!
//! A `Cpu` has no back-reference to the kernel; operations that need the
//! clock or the context table reach it through the context they act on.

extern crate alloc;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use kestrel_arch::IrqSpinMutex;
use spin::{Mutex, Once};

use crate::config::RCU_IDLE_PERIOD_US;
use crate::context::{Context, ContextRef, PendingRqq};
use crate::sched::ready_queue::SavedTimeslice;
use crate::sched::{CpuReadyQueue, SchedContext, SchedPolicy};
use crate::timeout::{TimeoutKind, TimeoutQueue};

pub struct Cpu {
    id: usize,
    online: AtomicBool,

    pub(crate) pending: IrqSpinMutex<PendingRqq>,
    pub(crate) rq: Mutex<CpuReadyQueue>,
    pub(crate) timeouts: IrqSpinMutex<TimeoutQueue>,

    current: Mutex<Option<Arc<Context>>>,
    kernel_ctx: Once<Arc<Context>>,

    need_resched: AtomicBool,
    pending_switch: AtomicU32,
    timer_irq: AtomicBool,
    rcu_timeout_armed: AtomicBool,
}

impl Cpu {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            online: AtomicBool::new(true),
            pending: IrqSpinMutex::new(PendingRqq::new()),
            rq: Mutex::new(CpuReadyQueue::new()),
            timeouts: IrqSpinMutex::new(TimeoutQueue::new()),
            current: Mutex::new(None),
            kernel_ctx: Once::new(),
            need_resched: AtomicBool::new(false),
            pending_switch: AtomicU32::new(ContextRef::NULL.raw()),
            timer_irq: AtomicBool::new(false),
            rcu_timeout_armed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    // -- Current and kernel context

    /// The context this CPU is running.
    pub fn current_context(&self) -> Option<Arc<Context>> {
        self.current.lock().clone()
    }

    /// Whether `ctx` is the context this CPU is running.
    pub fn is_current(&self, ctx: ContextRef) -> bool {
        self.current.lock().as_ref().is_some_and(|c| c.me() == ctx)
    }

    /// Make `ctx` the running context. Returns the previous one.
    pub(crate) fn set_current(&self, ctx: Option<Arc<Context>>) -> Option<Arc<Context>> {
        core::mem::replace(&mut *self.current.lock(), ctx)
    }

    /// The CPU's kernel context, which runs when nothing else is ready.
    pub fn kernel_context(&self) -> Option<Arc<Context>> {
        self.kernel_ctx.get().cloned()
    }

    pub(crate) fn set_kernel_context(&self, ctx: Arc<Context>) {
        self.kernel_ctx.call_once(|| ctx);
    }

    // -- Dispatcher flags

    #[inline]
    pub fn set_need_resched(&self) {
        self.need_resched.store(true, Ordering::Release);
    }

    #[inline]
    pub fn need_resched(&self) -> bool {
        self.need_resched.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn take_need_resched(&self) -> bool {
        self.need_resched.swap(false, Ordering::AcqRel)
    }

    /// Ask the dispatcher to switch to `target` directly, bypassing the
    /// ready queue.
    #[inline]
    pub(crate) fn set_pending_switch(&self, target: ContextRef) {
        self.pending_switch.store(target.raw(), Ordering::Release);
    }

    #[inline]
    pub(crate) fn take_pending_switch(&self) -> Option<ContextRef> {
        ContextRef::from_raw(self.pending_switch.swap(ContextRef::NULL.raw(), Ordering::AcqRel)).as_option()
    }

    #[inline]
    pub fn has_pending_switch(&self) -> bool {
        self.pending_switch.load(Ordering::Acquire) != ContextRef::NULL.raw()
    }

    /// Latch a timer interrupt for the next dispatch step.
    #[inline]
    pub(crate) fn raise_timer_irq(&self) {
        self.timer_irq.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn take_timer_irq(&self) -> bool {
        self.timer_irq.swap(false, Ordering::AcqRel)
    }

    // -- Timeslices

    /// Make the scheduling context of `ctx` the one this CPU consumes.
    ///
    /// The previous owner gets back the time it has left, or a fresh
    /// timeslice if it used up the old one.
    pub fn set_current_sched(&self, ctx: &Context) {
        let kernel = ctx.kernel();
        let now = kernel.now();
        let mut rq = self.rq.lock();
        if rq.current_sched() == Some(ctx.me()) {
            return;
        }
        let sc = ctx.sched();
        let Some(saved) = rq.set_current_sched(ctx.me(), sc, now) else {
            return;
        };
        let (prev, left) = match saved {
            SavedTimeslice::Left(prev, left) => (prev, Some(left)),
            SavedTimeslice::Expired(prev) => (prev, None),
        };
        if let Some(prev) = kernel.context(prev) {
            let mut psc = prev.sched.lock();
            match left {
                Some(left) => psc.set_left(left),
                None => psc.replenish(),
            }
        }
    }

    /// Forget the current timeslice.
    pub(crate) fn invalidate_sched(&self) {
        self.rq.lock().invalidate_sched();
    }

    /// Owner of the timeslice this CPU consumes.
    pub fn current_sched(&self) -> Option<ContextRef> {
        self.rq.lock().current_sched()
    }

    // -- Ready queue

    /// Make `ctx`, homed on this CPU, ready here.
    ///
    /// `running` is the scheduling context of the running context. Returns
    /// whether `ctx` should preempt it.
    pub fn deblock(&self, ctx: &Context, running: Option<SchedContext>, lazy: bool) -> bool {
        let mut rq = self.rq.lock();
        let mut sc = ctx.sched.lock();
        rq.deblock(ctx.me(), &mut sc, running.as_ref(), lazy)
    }

    /// [`deblock`](Self::deblock) against this CPU's running context.
    pub fn deblock_current(&self, ctx: &Context, lazy: bool) -> bool {
        let running = self
            .current_context()
            .filter(|c| c.me() != ctx.me())
            .map(|c| c.sched());
        self.deblock(ctx, running, lazy)
    }

    /// Queue `ctx` unless it already is.
    pub(crate) fn ready_enqueue(&self, ctx: &Context) {
        let mut rq = self.rq.lock();
        let sc = *ctx.sched.lock();
        rq.ready_enqueue(ctx.me(), &sc);
    }

    pub(crate) fn ready_dequeue(&self, ctx: ContextRef) {
        self.rq.lock().ready_dequeue(ctx);
    }

    /// Whether `ctx` is queued here.
    pub fn in_ready_list(&self, ctx: ContextRef) -> bool {
        self.rq.lock().contains(ctx)
    }

    /// Number of queued contexts, not counting the kernel context.
    pub fn ready_len(&self) -> usize {
        self.rq.lock().len()
    }

    // -- RCU

    /// Arm the periodic RCU timeout unless it is armed.
    pub(crate) fn arm_rcu_timeout(&self, now: u64) {
        if !self.rcu_timeout_armed.swap(true, Ordering::AcqRel) {
            self.timeouts.lock().arm(now + RCU_IDLE_PERIOD_US, TimeoutKind::Rcu);
        }
    }

    pub(crate) fn rcu_timeout_fired(&self) {
        self.rcu_timeout_armed.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::boot;
    use crate::sched::SchedParams;
    use crate::thread::ThreadConfig;

    #[test]
    fn test_pending_switch_is_taken_once() {
        let k = boot(1);
        let cpu = k.cpu(0);
        let t = k.create_thread(ThreadConfig::new("t")).unwrap();
        assert!(!cpu.has_pending_switch());
        cpu.set_pending_switch(t.me());
        assert!(cpu.has_pending_switch());
        assert_eq!(cpu.take_pending_switch(), Some(t.me()));
        assert_eq!(cpu.take_pending_switch(), None);
    }

    #[test]
    fn test_set_current_sched_writes_back_left_time() {
        let k = boot(1);
        let cpu = k.cpu(0);
        let a = k
            .create_thread(ThreadConfig::new("a").params(SchedParams::FixedPrio { prio: 3, quantum_us: 1000 }))
            .unwrap();
        let b = k.create_thread(ThreadConfig::new("b")).unwrap();

        cpu.set_current_sched(&a);
        assert_eq!(cpu.current_sched(), Some(a.me()));
        k.advance_clock(400);
        cpu.set_current_sched(&b);
        assert_eq!(a.sched().left(), 600);

        k.advance_clock(100_000);
        cpu.set_current_sched(&a);
        // b used up its timeslice: replenished.
        assert_eq!(b.sched().left(), b.sched().quantum());
    }

    #[test]
    fn test_rcu_timeout_armed_once() {
        let k = boot(1);
        let cpu = k.cpu(0);
        let before = cpu.timeouts.lock().len();
        cpu.arm_rcu_timeout(0);
        cpu.arm_rcu_timeout(0);
        assert_eq!(cpu.timeouts.lock().len(), before + 1);
        cpu.rcu_timeout_fired();
        cpu.arm_rcu_timeout(0);
        assert_eq!(cpu.timeouts.lock().len(), before + 2);
    }
}
