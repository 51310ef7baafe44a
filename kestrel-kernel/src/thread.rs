//! Thread lifecycle
//!
//! Creation parameters ([`ThreadConfig`]) and the operations that end or
//! reconfigure a thread: [`kill`](Context::kill), [`halt`](Context::halt)
//! and [`set_sched_params`](Context::set_sched_params).
//!
//! # Kill
//!
//! Killing is two-phase. `kill` only marks the thread `CANCEL | READY`,
//! installs the kill continuation as its exit work and makes it runnable;
//! a thread on another CPU is reached through a DRQ. Whatever the thread
//! was blocked in sees the cancel bit and unwinds (a pending IPC fails with
//! `CANCELED`), then the continuation ([`do_kill`](Context::do_kill)) runs
//! in the dying thread itself:
//!
//! 1. disarm the IPC timeout and fail every sender queued on the thread
//! 2. leave whatever sender queue the thread is on
//! 3. mark it `DEAD`, which makes every new sender fail with `NOT_EXISTENT`
//! 4. wait for a grace period, so no CPU still holds a reference obtained
//!    before the thread died
//! 5. force it off all CPUs and let the kernel context drop the last table
//!    entry

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;

use kestrel_arch::INVALID_CPU;

use crate::context::{Context, ContextRef, Drq, DrqResult, ThreadState};
use crate::error::{KernelError, KernelResult};
use crate::sched::{Migration, SchedContext, SchedParams, SchedPolicy};
use crate::space::Space;

/// Parameters of [`Kernel::create_thread`](crate::Kernel::create_thread).
#[derive(Clone, Debug)]
pub struct ThreadConfig {
    pub(crate) name: &'static str,
    pub(crate) cpu: usize,
    pub(crate) params: SchedParams,
    pub(crate) space: Option<Arc<Space>>,
    pub(crate) pager: ContextRef,
    pub(crate) exc_handler: ContextRef,
    pub(crate) sigma0: bool,
}

impl ThreadConfig {
    /// A thread on CPU 0 with default parameters, in a new space.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            cpu: 0,
            params: SchedParams::default(),
            space: None,
            pager: ContextRef::NULL,
            exc_handler: ContextRef::NULL,
            sigma0: false,
        }
    }

    #[must_use]
    pub fn on_cpu(mut self, cpu: usize) -> Self {
        self.cpu = cpu;
        self
    }

    /// Fixed priority with the default timeslice.
    #[must_use]
    pub fn prio(mut self, prio: u16) -> Self {
        self.params = SchedParams::fixed_prio(prio);
        self
    }

    #[must_use]
    pub fn params(mut self, params: SchedParams) -> Self {
        self.params = params;
        self
    }

    /// Share `space` instead of creating one.
    #[must_use]
    pub fn space(mut self, space: Arc<Space>) -> Self {
        self.space = Some(space);
        self
    }

    #[must_use]
    pub fn pager(mut self, pager: ContextRef) -> Self {
        self.pager = pager;
        self
    }

    #[must_use]
    pub fn exc_handler(mut self, handler: ContextRef) -> Self {
        self.exc_handler = handler;
        self
    }

    /// The root pager: an unresolvable page fault of sigma0 is fatal.
    #[must_use]
    pub fn sigma0(mut self) -> Self {
        self.sigma0 = true;
        self
    }
}

impl Context {
    /// Start killing this thread.
    ///
    /// Returns whether the calling CPU must reschedule.
    pub fn kill(self: &Arc<Self>) -> bool {
        log::debug!(target: "kestrel::sched", "kill {:?} ({})", self.me(), self.name());
        if self.home_cpu() == kestrel_arch::cpu_id() {
            self.prepare_kill();
            let resched = self
                .home()
                .is_some_and(|cpu| cpu.deblock_current(self, false));
            if resched {
                if let Some(cpu) = self.home() {
                    cpu.set_need_resched();
                }
            }
            return resched;
        }

        let drq = Drq::new(
            ContextRef::NULL,
            Box::new(|ctx| {
                ctx.prepare_kill();
                DrqResult::NEED_RESCHED | DrqResult::NO_ANSWER
            }),
        );
        self.enqueue_drq(Arc::new(drq))
    }

    fn prepare_kill(self: &Arc<Self>) {
        self.state_add(ThreadState::CANCEL | ThreadState::READY);
        let me = self.clone();
        self.work
            .lock()
            .put_exit_work(Box::pin(async move { me.do_kill().await }));
    }

    /// The kill continuation, run by the dying thread.
    async fn do_kill(self: &Arc<Self>) {
        self.reset_timeout();

        loop {
            let next = self.ipc.senders.lock().pop_first();
            let Some(r) = next else {
                break;
            };
            self.vcpu_update_state();
            if let Some(s) = self.kernel().context(r) {
                s.ipc_receiver_aborted(self).await;
            }
            self.preemption_point().await;
        }
        self.leave_wait_queue();
        self.vcpu_update_state();
        self.thread_lock.invalidate(self).await;

        self.state_add(ThreadState::DEAD);
        if let Some(cpu) = self.home() {
            cpu.ready_dequeue(self.me());
        }

        self.rcu_wait().await;

        self.state_del(ThreadState::READY_MASK);
        if let Some(cpu) = self.home() {
            cpu.ready_dequeue(self.me());
        }
        log::debug!(target: "kestrel::sched", "{:?} ({}) dead", self.me(), self.name());

        // Never runs again: only the kernel context can drop it now.
        self.force_to_invalid_cpu();
        let me = self.me();
        self.kernel_context_drq(Box::new(move |kc| {
            if let Ok(ctx) = kc.kernel().release_context(me) {
                ctx.work.lock().clear();
            }
            DrqResult::NO_ANSWER | DrqResult::NEED_RESCHED
        }))
        .await;
    }

    /// Stop a thread that has nothing left to do. It stays dead until
    /// made ready again.
    pub async fn halt(self: &Arc<Self>) {
        self.state_del(ThreadState::CANCEL);
        if self.state_change_safely(ThreadState::READY, ThreadState::CANCEL | ThreadState::DEAD) {
            while !self.state().contains(ThreadState::READY) {
                self.schedule().await;
            }
        }
    }

    /// Install new scheduling parameters and, with `cpu`, move the thread
    /// to that CPU. `caller` is the current context and waits for the
    /// change.
    pub async fn set_sched_params(
        self: &Arc<Self>,
        caller: &Arc<Context>,
        params: SchedParams,
        cpu: Option<usize>,
    ) -> KernelResult<()> {
        let quantum = self.kernel().config().timeslice_us;
        SchedContext::new(quantum).set(&params, quantum)?;

        let target = cpu.unwrap_or(self.home_cpu());
        if target == INVALID_CPU || target >= self.kernel().num_cpus() {
            return Err(KernelError::EInval);
        }
        if !self.kernel().cpu(target).is_online() {
            return Err(KernelError::EBusy);
        }
        self.migrate(caller, Migration::new(target, params)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::boot;
    use crate::sched::CpuRun;

    #[test]
    fn test_config_builder() {
        let cfg = ThreadConfig::new("t").on_cpu(1).prio(7).sigma0();
        assert_eq!(cfg.cpu, 1);
        assert_eq!(cfg.params, SchedParams::fixed_prio(7));
        assert!(cfg.sigma0);
        assert!(cfg.space.is_none());
    }

    #[test]
    fn test_kill_removes_thread() {
        let k = boot(1);
        let t = k.create_thread(ThreadConfig::new("t")).unwrap();
        t.activate();
        k.run_until_idle().unwrap();
        let r = t.me();

        {
            let _g = kestrel_arch::enter_cpu(0);
            t.kill();
        }
        k.run_until_idle().unwrap();

        assert!(k.context(r).is_none());
        assert!(t.state().contains(ThreadState::DEAD));
        assert_eq!(t.home_cpu(), INVALID_CPU);
        assert_eq!(k.run_cpu(0), CpuRun::Idle);
    }

    #[test]
    fn test_killed_slot_is_reused_after_grace_period() {
        let k = boot(1);
        let t = k.create_thread(ThreadConfig::new("t")).unwrap();
        t.activate();
        k.run_until_idle().unwrap();
        let r = t.me();

        {
            let _g = kestrel_arch::enter_cpu(0);
            t.kill();
        }
        // Only marked so far.
        assert!(k.context(r).is_some());
        assert!(!t.state().contains(ThreadState::DEAD));

        k.run_until_idle().unwrap();
        assert!(k.context(r).is_none());
        assert_eq!(k.rcu().queued(0), 0);

        let u = k.create_thread(ThreadConfig::new("u")).unwrap();
        assert_eq!(u.me().index(), r.index());
        assert_ne!(u.me().generation(), r.generation());
        // The stale handle does not reach the new thread.
        assert!(k.context(r).is_none());
        assert_eq!(k.context(u.me()).map(|c| c.me()), Some(u.me()));

        u.activate();
        k.run_until_idle().unwrap();
        assert_eq!(k.run_cpu(0), CpuRun::User(u.me()));
    }

    #[test]
    fn test_remote_kill() {
        let k = boot(2);
        let t = k.create_thread(ThreadConfig::new("t").on_cpu(1)).unwrap();
        t.activate();
        k.run_until_idle().unwrap();
        let r = t.me();

        {
            let _g = kestrel_arch::enter_cpu(0);
            t.kill();
        }
        k.run_until_idle().unwrap();
        assert!(k.context(r).is_none());
        assert_eq!(k.run_cpu(1), CpuRun::Idle);
    }

    #[test]
    fn test_set_sched_params_rejects_bad_cpu() {
        let k = boot(1);
        let t = k.create_thread(ThreadConfig::new("t")).unwrap();
        let result = Arc::new(spin::Mutex::new(None));
        let (res, me) = (result.clone(), t.clone());
        k.spawn(&t, async move {
            let r = me.set_sched_params(&me, SchedParams::fixed_prio(3), Some(4)).await;
            *res.lock() = Some(r);
        })
        .unwrap();
        k.run_until_idle().unwrap();
        assert_eq!(*result.lock(), Some(Err(KernelError::EInval)));
    }

    #[cfg(not(feature = "sched-wfq"))]
    #[test]
    fn test_set_sched_params_changes_prio() {
        let k = boot(1);
        let t = k.create_thread(ThreadConfig::new("t").prio(2)).unwrap();
        let me = t.clone();
        k.spawn(&t, async move {
            me.set_sched_params(&me, SchedParams::fixed_prio(9), None)
                .await
                .unwrap();
        })
        .unwrap();
        k.run_until_idle().unwrap();
        assert_eq!(t.prio(), 9);
    }
}
