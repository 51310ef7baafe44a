//! Context migration
//!
//! A migration moves a context to another home CPU and installs new
//! scheduling parameters in one step. It runs in two phases:
//!
//! 1. `migrate_away` on the old home CPU: leave the ready queue, drop out
//!    of the pending queue, apply the parameters, set the new home CPU and
//!    mark `FINISH_MIGRATION`.
//! 2. `migrate_to`: queue the context in the new CPU's pending queue (or
//!    deblock it directly if that is the calling CPU). The new CPU
//!    finishes the migration before the context runs again.
//!
//! A context cannot take itself off its own CPU: migrating the current
//! context is delegated to the CPU's kernel context through a DRQ.
//!
//! # Locking
//!
//! Ready queue of the source CPU, then the source pending queue, then the
//! destination pending queue. No two pending queues are held at once.

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use kestrel_arch::{Ipi, INVALID_CPU};

use super::{SchedParams, SchedPolicy};
use crate::context::{Context, DrqResult, PendingRqq, ThreadState};
use crate::cpu::Cpu;
use crate::error::KernelResult;

/// A requested move to `cpu` with new parameters.
#[derive(Debug)]
pub struct Migration {
    pub cpu: usize,
    pub params: SchedParams,
    in_progress: AtomicBool,
}

impl Migration {
    pub fn new(cpu: usize, params: SchedParams) -> Self {
        Self {
            cpu,
            params,
            in_progress: AtomicBool::new(false),
        }
    }

    /// Whether the requester may return: the migration was carried out or
    /// superseded by a later one.
    #[inline]
    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    fn release(&self) {
        self.in_progress.store(true, Ordering::Release);
    }
}

enum Start {
    /// Nothing left to move; the flag says whether to reschedule.
    Done(bool),
    Migrate(Arc<Migration>),
}

impl Context {
    /// Migrate this context as described by `info` and wait, as `caller`,
    /// until the move was done.
    ///
    /// A migration still pending from an earlier call is superseded: its
    /// requester is released but its parameters are dropped.
    pub async fn migrate(self: &Arc<Self>, caller: &Arc<Context>, info: Migration) {
        let info = Arc::new(info);
        log::debug!(target: "kestrel::migrate", "{:?}: cpu {} -> {} ({:?})",
            self.me(), self.home_cpu(), info.cpu, info.params);

        let old = self.migration.lock().replace(info.clone());
        if let Some(old) = old {
            old.release();
        }

        let home = self.home_cpu();
        let resched = if home == kestrel_arch::cpu_id() || self.kernel().num_cpus() == 1 {
            self.do_migration()
        } else {
            self.migrate_xcpu(home)
        };
        if resched {
            if let Some(cpu) = self.kernel().current_cpu() {
                cpu.set_need_resched();
            }
        }

        while !info.in_progress() {
            caller.schedule().await;
        }
    }

    /// Whether a migration request waits in the slot.
    #[inline]
    pub fn migration_pending(&self) -> bool {
        self.migration.lock().is_some()
    }

    /// Take the request from the slot. A request for the current home CPU
    /// only changes the parameters.
    fn start_migration(&self) -> Start {
        let Some(m) = self.migration.lock().take() else {
            return Start::Done(false);
        };
        if m.cpu == self.home_cpu() {
            if let Err(e) = self.apply_sched_params(&m.params) {
                log::warn!(target: "kestrel::migrate", "{:?}: bad parameters {:?}: {}", self.me(), m.params, e);
            }
            m.release();
            return Start::Done(true);
        }
        Start::Migrate(m)
    }

    /// Carry out the pending migration on the home CPU, which is the
    /// calling CPU. Returns whether it must reschedule.
    pub(crate) fn do_migration(self: &Arc<Self>) -> bool {
        let m = match self.start_migration() {
            Start::Done(resched) => return resched,
            Start::Migrate(m) => m,
        };

        let current = self.kernel().current_cpu().is_some_and(|c| c.is_current(self.me()));
        if current {
            debug_assert!(self.on_home_cpu());
            let me = self.clone();
            self.kernel_context_drq_sync(Box::new(move |_| {
                let target = m.cpu;
                me.migrate_away(&m, false);
                me.migrate_to(target);
                DrqResult::NO_ANSWER | DrqResult::NEED_RESCHED
            }));
            return true;
        }

        let target = m.cpu;
        let resched = self.migrate_away(&m, false);
        resched | self.migrate_to(target)
    }

    /// [`do_migration`](Self::do_migration) for a context that is not
    /// current, found while draining the pending queue.
    pub(crate) fn initiate_migration(self: &Arc<Self>) -> bool {
        debug_assert!(!self.kernel().current_cpu().is_some_and(|c| c.is_current(self.me())));
        let m = match self.start_migration() {
            Start::Done(resched) => return resched,
            Start::Migrate(m) => m,
        };
        let target = m.cpu;
        let resched = self.migrate_away(&m, false);
        resched | self.migrate_to(target)
    }

    /// Finish a migration on the new home CPU if one is outstanding.
    pub(crate) fn try_finish_migration(&self) {
        if self.state().contains(ThreadState::FINISH_MIGRATION) {
            self.state_del(ThreadState::FINISH_MIGRATION);
            self.finish_migration();
        }
    }

    /// Last step of a migration, on the new home CPU.
    pub(crate) fn finish_migration(&self) {
        log::trace!(target: "kestrel::migrate", "{:?} arrived on cpu {}", self.me(), self.home_cpu());
        self.enqueue_timeout_again();
    }

    /// Apply new parameters on the home CPU, requeueing if queued.
    pub(crate) fn apply_sched_params(&self, params: &SchedParams) -> KernelResult<()> {
        let quantum = self.kernel().config().timeslice_us;
        let Some(cpu) = self.home() else {
            let mut sc = self.sched.lock();
            sc.set(params, quantum)?;
            sc.replenish();
            return Ok(());
        };

        let mut rq = cpu.rq.lock();
        let queued = rq.contains(self.me());
        rq.ready_dequeue(self.me());
        let mut sc = self.sched.lock();
        let res = sc.set(params, quantum);
        sc.replenish();
        if queued {
            rq.ready_enqueue(self.me(), &sc);
        }
        res
    }

    /// Leave the ready queue of `cpu`. Returns whether `cpu` must pick a
    /// new context.
    fn leave_ready_queue(&self, cpu: &Cpu, remote: bool) -> bool {
        self.detach_timeout();
        {
            let mut rq = cpu.rq.lock();
            // Leave the scheduler if it is waiting for us.
            if rq.schedule_in_progress == Some(self.me()) {
                rq.schedule_in_progress = None;
            }
            rq.ready_dequeue(self.me());
        }

        if !remote && cpu.current_sched() == Some(self.me()) {
            if let Some(kc) = cpu.kernel_context() {
                cpu.set_current_sched(&kc);
            }
            return true;
        }
        false
    }

    /// Hand over to the new home CPU. `q` is the locked pending queue of
    /// the old one.
    fn hand_over(&self, m: &Migration, q: &mut PendingRqq) {
        q.dequeue(self);
        {
            let mut sc = self.sched.lock();
            if let Err(e) = sc.set(&m.params, self.kernel().config().timeslice_us) {
                log::warn!(target: "kestrel::migrate", "{:?}: bad parameters {:?}: {}", self.me(), m.params, e);
            }
            sc.replenish();
        }

        debug_assert!(!self.pending_queued.load(Ordering::Acquire));
        self.state_add(ThreadState::FINISH_MIGRATION);
        self.set_home_cpu(m.cpu);
        m.release();
    }

    fn migrate_away(&self, m: &Migration, remote: bool) -> bool {
        let Some(cpu) = (if remote { self.home() } else { self.kernel().current_cpu() }) else {
            return false;
        };
        debug_assert!(!cpu.is_current(self.me()));

        let resched = self.leave_ready_queue(cpu, remote);
        let mut q = cpu.pending.lock();
        self.hand_over(m, &mut q);
        resched
    }

    fn migrate_to(self: &Arc<Self>, target: usize) -> bool {
        let kernel = self.kernel();
        let Some(cpu) = kernel.try_cpu(target) else {
            return false;
        };

        let ipi = {
            let mut q = cpu.pending.lock();
            if self.home_cpu() == target && !cpu.is_online() {
                drop(q);
                self.handle_drq();
                return false;
            }

            // Migrated again meanwhile.
            if self.home_cpu() != target || self.pending_queued.load(Ordering::Acquire) {
                return false;
            }

            if target == kestrel_arch::cpu_id() {
                drop(q);
                let mut resched = self.handle_drq();
                if self.state().intersects(ThreadState::READY_MASK) {
                    resched |= cpu.deblock_current(self, false);
                }
                return resched;
            }

            q.enqueue(self)
        };

        if ipi {
            kernel.ipi().send(target, Ipi::Request);
        }
        false
    }

    /// Have the home CPU `home` carry out the migration. If it went
    /// offline, do it from here.
    fn migrate_xcpu(self: &Arc<Self>, home: usize) -> bool {
        let kernel = self.kernel();
        let Some(cpu) = kernel.try_cpu(home) else {
            return false;
        };

        let ipi = {
            let mut q = cpu.pending.lock();
            if self.home_cpu() != home {
                return false;
            }

            // The context stays on `home` while we hold its pending lock.
            if !cpu.is_online() {
                let m = match self.start_migration() {
                    Start::Done(resched) => return resched,
                    Start::Migrate(m) => m,
                };
                let target = m.cpu;
                self.leave_ready_queue(cpu, true);
                self.hand_over(&m, &mut q);
                drop(q);
                return self.migrate_to(target);
            }

            q.enqueue(self)
        };

        if ipi {
            kernel.ipi().send(home, Ipi::Request);
        }
        false
    }

    /// Take this context off all CPUs for good.
    pub(crate) fn force_to_invalid_cpu(&self) {
        if let Some(m) = self.migration.lock().take() {
            m.release();
        }
        match self.home() {
            Some(cpu) => {
                let mut q = cpu.pending.lock();
                q.dequeue(self);
                self.set_home_cpu(INVALID_CPU);
            }
            None => self.set_home_cpu(INVALID_CPU),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::boot;
    use crate::sched::CpuRun;
    use crate::thread::ThreadConfig;

    #[test]
    fn test_blocked_context_moves_to_new_cpu() {
        let k = boot(2);
        let t = k.create_thread(ThreadConfig::new("t").on_cpu(0)).unwrap();
        let caller = k.create_thread(ThreadConfig::new("caller").on_cpu(0)).unwrap();
        t.activate();
        k.run_until_idle().unwrap();
        assert!(k.cpu(0).in_ready_list(t.me()));

        // Block t, then move it while it is not running.
        t.state_del(ThreadState::READY);
        let (target, me) = (t.clone(), caller.clone());
        k.spawn(&caller, async move {
            target.migrate(&me, Migration::new(1, SchedParams::fixed_prio(3))).await;
            assert_eq!(target.home_cpu(), 1);
        })
        .unwrap();
        k.run_until_idle().unwrap();

        assert_eq!(t.home_cpu(), 1);
        assert!(!k.cpu(0).in_ready_list(t.me()));
        assert!(!t.state().contains(ThreadState::FINISH_MIGRATION));
        assert_eq!(t.prio(), 3);

        // A wakeup from cpu 0 lands on cpu 1 only.
        {
            let _g = kestrel_arch::enter_cpu(0);
            t.activate();
        }
        k.run_until_idle().unwrap();
        assert!(!k.cpu(0).in_ready_list(t.me()));
        assert_eq!(k.run_cpu(1), CpuRun::User(t.me()));
    }

    #[test]
    fn test_same_cpu_migration_only_sets_params() {
        let k = boot(2);
        let t = k.create_thread(ThreadConfig::new("t").on_cpu(1)).unwrap();
        let caller = k.create_thread(ThreadConfig::new("caller").on_cpu(0)).unwrap();
        let (target, me) = (t.clone(), caller.clone());
        k.spawn(&caller, async move {
            target.migrate(&me, Migration::new(1, SchedParams::fixed_prio(7))).await;
        })
        .unwrap();
        k.run_until_idle().unwrap();
        assert_eq!(t.home_cpu(), 1);
        assert_eq!(t.prio(), 7);
        assert!(!t.migration_pending());
    }

    #[test]
    fn test_current_context_migrates_itself() {
        let k = boot(2);
        let t = k.create_thread(ThreadConfig::new("t").on_cpu(0)).unwrap();
        let ran_on = Arc::new(core::sync::atomic::AtomicUsize::new(usize::MAX));
        let (me, r) = (t.clone(), ran_on.clone());
        k.spawn(&t, async move {
            me.migrate(&me, Migration::new(1, SchedParams::fixed_prio(2))).await;
            r.store(kestrel_arch::cpu_id(), Ordering::SeqCst);
        })
        .unwrap();
        k.run_until_idle().unwrap();

        // The rest of the work ran on the new CPU.
        assert_eq!(ran_on.load(Ordering::SeqCst), 1);
        assert_eq!(t.home_cpu(), 1);
        assert!(!k.cpu(0).in_ready_list(t.me()));
        assert_eq!(k.run_cpu(1), CpuRun::User(t.me()));
        assert_eq!(k.run_cpu(0), CpuRun::Idle);
    }

    #[test]
    fn test_superseded_migration_releases_requester() {
        let k = boot(2);
        let t = k.create_thread(ThreadConfig::new("t").on_cpu(0)).unwrap();
        let first = Arc::new(Migration::new(1, SchedParams::fixed_prio(9)));
        *t.migration.lock() = Some(first.clone());
        let second = Migration::new(0, SchedParams::fixed_prio(4));

        let caller = k.create_thread(ThreadConfig::new("caller").on_cpu(0)).unwrap();
        let (target, me) = (t.clone(), caller.clone());
        k.spawn(&caller, async move {
            target.migrate(&me, second).await;
        })
        .unwrap();
        k.run_until_idle().unwrap();

        assert!(first.in_progress());
        assert_eq!(t.home_cpu(), 0);
        assert_eq!(t.prio(), 4);
    }

    #[test]
    fn test_force_to_invalid_cpu() {
        let k = boot(1);
        let t = k.create_thread(ThreadConfig::new("t")).unwrap();
        t.force_to_invalid_cpu();
        assert_eq!(t.home_cpu(), INVALID_CPU);
        assert!(t.home().is_none());
    }
}
