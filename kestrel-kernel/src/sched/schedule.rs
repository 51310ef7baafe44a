//! Scheduling primitives of a context
//!
//! These run inside a context's kernel work. None of them switches stacks:
//! a switch is requested from the CPU's dispatcher (need-resched flag or a
//! pending direct switch) and takes effect at the following suspension
//! point, after which the caller resumes once it is picked again.
//!
//! # Switch results
//!
//! | Result    | Meaning                                                    |
//! |-----------|------------------------------------------------------------|
//! | `Ok`      | The target ran (or was handed the CPU) and we are back      |
//! | `Failed`  | The target runs on another CPU or is not ready             |
//! | `Resched` | A request handled for the target needs another pick        |
//!
//! Callers retry or fall back to [`Context::schedule`]; no scheduling
//! failure is ever reported to user level.

extern crate alloc;

use alloc::sync::Arc;

use kestrel_arch::INVALID_CPU;

use crate::context::{Context, ContextRef, HelpingMode, Switch, SwitchLock, ThreadState};
use crate::task::yield_now;

impl Context {
    /// Give up the CPU and let the dispatcher pick the next context.
    ///
    /// A context that is still ready is queued again and may be picked
    /// right away. Callers re-check their wait condition afterwards.
    pub async fn schedule(&self) {
        match self.kernel().current_cpu() {
            Some(cpu) if self.on_home_cpu() => cpu.set_need_resched(),
            // Not on the home CPU: let the kernel context of the CPU we
            // are on run the scheduler.
            Some(cpu) => {
                cpu.set_need_resched();
                log::trace!(target: "kestrel::sched", "{:?} schedules away from cpu {}", self.me(), cpu.id());
            }
            None => {}
        }
        yield_now().await;
    }

    /// Let the dispatcher handle events without giving up the CPU.
    #[inline]
    pub async fn preemption_point(&self) {
        yield_now().await;
    }

    /// Queue this context on its home CPU if it is ready.
    pub(crate) fn update_ready_list(&self) {
        if !self.on_home_cpu() || !self.state().intersects(ThreadState::READY_MASK) {
            return;
        }
        if let Some(cpu) = self.home() {
            cpu.ready_enqueue(self);
        }
    }

    /// Make `t`'s timeslice current and switch to it.
    pub(crate) async fn schedule_switch_to_locked(self: &Arc<Self>, t: &Arc<Context>) -> Switch {
        let Some(cpu) = self.kernel().current_cpu() else {
            return Switch::Failed;
        };
        cpu.set_current_sched(t);
        if t.me() == self.me() {
            return t.switch_handle_drq();
        }
        self.switch_exec_locked(t, HelpingMode::NotHelping).await
    }

    /// Switch to `t` without touching the current timeslice, so `t` runs
    /// on ours.
    pub async fn switch_exec_locked(self: &Arc<Self>, t: &Arc<Context>, mode: HelpingMode) -> Switch {
        let Some(cpu) = self.kernel().current_cpu() else {
            return Switch::Failed;
        };
        if t.me() == self.me() {
            return self.switch_handle_drq();
        }

        if t.home_cpu() != cpu.id() {
            return Switch::Failed;
        }
        let running = t.running_on();
        if running != INVALID_CPU && running != cpu.id() {
            // Still running elsewhere (migrating in): have it picked later.
            if t.state().intersects(ThreadState::READY_MASK) && !cpu.in_ready_list(t.me()) {
                cpu.ready_enqueue(t);
            }
            return Switch::Failed;
        }
        if !t.state().intersects(ThreadState::READY_MASK) {
            return Switch::Failed;
        }

        self.update_ready_list();
        t.set_helper(mode, self.me());
        log::trace!(target: "kestrel::sched", "switch {:?} -> {:?} ({:?})", self.me(), t.me(), mode);
        cpu.set_pending_switch(t.me());
        yield_now().await;
        Switch::Ok
    }

    /// [`switch_exec_locked`](Self::switch_exec_locked) with helping, as
    /// long as `lock` is still held by `owner`.
    pub(crate) async fn switch_exec_helping(
        self: &Arc<Self>,
        t: &Arc<Context>,
        lock: &SwitchLock,
        owner: ContextRef,
    ) -> Switch {
        if !lock.held_by(owner) {
            return Switch::Failed;
        }
        self.switch_exec_locked(t, HelpingMode::Helping).await
    }

    /// Switch to `t`, or schedule if that fails.
    pub async fn switch_to_locked(self: &Arc<Self>, t: &Arc<Context>) {
        if self.switch_exec_locked(t, HelpingMode::NotHelping).await != Switch::Ok {
            self.schedule().await;
        }
    }

    /// Wake `to` on this CPU and switch to it if it should preempt us.
    ///
    /// Returns whether a switch was attempted.
    pub async fn deblock_and_schedule(self: &Arc<Self>, to: &Arc<Context>) -> bool {
        let Some(cpu) = self.kernel().current_cpu() else {
            return false;
        };
        if cpu.deblock(to, Some(self.sched()), true) {
            self.switch_to_locked(to).await;
            return true;
        }
        false
    }

    /// Set the ready bit and deblock on the home CPU.
    ///
    /// Returns whether the calling CPU must reschedule.
    pub fn activate(self: &Arc<Self>) -> bool {
        log::debug!(target: "kestrel::sched", "activate {:?} ({}) on cpu {}", self.me(), self.name(), self.home_cpu());
        let resched = self.xcpu_state_change(ThreadState::empty(), ThreadState::READY, false);
        if resched {
            if let Some(cpu) = self.kernel().current_cpu() {
                cpu.set_need_resched();
            }
        }
        resched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::boot;
    use crate::sched::CpuRun;
    use crate::thread::ThreadConfig;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_activate_makes_context_run() {
        let k = boot(1);
        let t = k.create_thread(ThreadConfig::new("t")).unwrap();
        assert!(!t.state().contains(ThreadState::READY));
        {
            let _g = kestrel_arch::enter_cpu(0);
            t.activate();
        }
        assert!(t.state().contains(ThreadState::READY));
        k.run_until_idle().unwrap();
        assert_eq!(k.run_cpu(0), CpuRun::User(t.me()));
    }

    #[test]
    fn test_switch_to_not_ready_fails() {
        let k = boot(1);
        let a = k.create_thread(ThreadConfig::new("a")).unwrap();
        let b = k.create_thread(ThreadConfig::new("b")).unwrap();
        let result = Arc::new(AtomicUsize::new(0));

        let (r, me, target) = (result.clone(), a.clone(), b.clone());
        k.spawn(&a, async move {
            let sw = me.switch_exec_locked(&target, HelpingMode::NotHelping).await;
            r.store(if sw == Switch::Failed { 1 } else { 2 }, Ordering::SeqCst);
        })
        .unwrap();
        k.run_until_idle().unwrap();
        assert_eq!(result.load(Ordering::SeqCst), 1);
    }

    #[cfg(not(feature = "sched-wfq"))]
    #[test]
    fn test_direct_switch_donates_timeslice() {
        let k = boot(1);
        let a = k.create_thread(ThreadConfig::new("a").prio(9)).unwrap();
        let b = k.create_thread(ThreadConfig::new("b").prio(2)).unwrap();
        let seen = Arc::new(AtomicUsize::new(usize::MAX));

        // b is ready but would never be picked over a.
        let (s, kb) = (seen.clone(), k);
        k.spawn(&b, async move {
            let cpu = kb.cpu(0);
            s.store(cpu.current_sched().map_or(0, |r| r.raw() as usize), Ordering::SeqCst);
        })
        .unwrap();
        let (me, target) = (a.clone(), b.clone());
        k.spawn(&a, async move {
            me.switch_exec_locked(&target, HelpingMode::Helping).await;
        })
        .unwrap();
        k.run_until_idle().unwrap();

        // b ran on a's timeslice, on a's behalf.
        assert_eq!(seen.load(Ordering::SeqCst), a.me().raw() as usize);
        assert_eq!(b.helper(), a.me());
    }
}
