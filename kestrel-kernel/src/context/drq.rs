//! Deferred requests (DRQs)
//!
//! A DRQ is a function executed in the context of its target, on the
//! target's home CPU. Posting to a context of the current CPU runs the
//! function in line; posting to a context of another CPU queues the request
//! in the target's inbox, queues the target in its CPU's pending queue and
//! raises a request IPI if that queue was empty.
//!
//! Unless the function answers [`DrqResult::NO_ANSWER`], the request is
//! sent back to its requester as a reply, which clears the requester's
//! `DRQ_WAIT` bit.

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use super::{Context, ContextRef, Switch, ThreadState};

/// Function run by a DRQ on its target.
pub type DrqFn = Box<dyn FnOnce(&Arc<Context>) -> DrqResult + Send>;

bitflags! {
    /// Answer of a DRQ function.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DrqResult: u8 {
        /// The target CPU must reschedule.
        const NEED_RESCHED = 0x1;
        /// Do not reply to the requester.
        const NO_ANSWER = 0x2;
    }
}

impl DrqResult {
    /// Plain completion: reply, no reschedule.
    #[inline]
    pub const fn done() -> Self {
        Self::empty()
    }
}

/// Whether the requester waits for the reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrqWait {
    Wait,
    NoWait,
}

pub struct Drq {
    requester: ContextRef,
    func: Mutex<Option<DrqFn>>,
    answered: AtomicBool,
}

impl Drq {
    pub fn new(requester: ContextRef, func: DrqFn) -> Self {
        Self {
            requester,
            func: Mutex::new(Some(func)),
            answered: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn requester(&self) -> ContextRef {
        self.requester
    }

    fn take_func(&self) -> Option<DrqFn> {
        self.func.lock().take()
    }

    fn is_reply(&self) -> bool {
        self.answered.load(Ordering::Acquire)
    }
}

impl Context {
    /// Run `func` in the context of `target`, posted by `self`, the
    /// current context.
    ///
    /// With [`DrqWait::Wait`] this is a suspension point: `self` blocks
    /// until the reply arrives.
    pub async fn drq(&self, target: &Arc<Context>, func: DrqFn, wait: DrqWait) {
        log::trace!(target: "kestrel::drq", "{:?} -> {:?} on cpu {} ({:?})",
            self.me(), target.me(), target.home_cpu(), wait);
        if wait == DrqWait::Wait {
            self.state_add(ThreadState::DRQ_WAIT);
        }

        if target.enqueue_drq(Arc::new(Drq::new(self.me(), func))) {
            if let Some(cpu) = self.kernel().current_cpu() {
                cpu.set_need_resched();
            }
        }

        if wait == DrqWait::Wait {
            while self.block_if(|s| s.contains(ThreadState::DRQ_WAIT)) {
                self.schedule().await;
            }
        }
    }

    /// Queue `drq` for execution in this context.
    ///
    /// Returns whether the calling CPU must reschedule.
    pub(crate) fn enqueue_drq(self: &Arc<Self>, drq: Arc<Drq>) -> bool {
        let current = kestrel_arch::cpu_id();
        let home = self.home_cpu();
        if home == current {
            return self.execute_drq_local(drq, false);
        }

        self.drq_q.lock().push_back(drq.clone());

        // We may have migrated to the calling CPU meanwhile.
        let home = self.home_cpu();
        if home == current {
            return self.deq_exec_drq(&drq, false);
        }

        let Some(cpu) = self.kernel().try_cpu(home) else {
            return false;
        };
        let ipi = {
            let mut q = cpu.pending.lock();
            if self.home_cpu() != home {
                // The new home CPU picks the request up.
                return false;
            }
            if !cpu.is_online() {
                return self.deq_exec_drq(&drq, true);
            }
            q.enqueue(self)
        };
        if ipi {
            self.kernel().ipi().send(home, kestrel_arch::Ipi::Request);
        }
        false
    }

    fn execute_drq_local(self: &Arc<Self>, drq: Arc<Drq>, offline: bool) -> bool {
        let do_sched = self.execute_request(drq, true);

        if !offline && !self.on_home_cpu() {
            return false;
        }

        if self.state().intersects(ThreadState::READY_MASK) {
            if let Some(cpu) = self.home() {
                let sc = self.sched();
                let mut rq = cpu.rq.lock();
                if !rq.contains(self.me()) {
                    rq.ready_enqueue(self.me(), &sc);
                    return true;
                }
            }
        }
        do_sched
    }

    fn deq_exec_drq(self: &Arc<Self>, drq: &Arc<Drq>, offline: bool) -> bool {
        let empty = {
            let mut q = self.drq_q.lock();
            let Some(pos) = q.iter().position(|d| Arc::ptr_eq(d, drq)) else {
                // Already handled.
                return false;
            };
            q.remove(pos);
            q.is_empty()
        };
        if empty && self.state().contains(ThreadState::DRQ_READY) {
            self.state_del(ThreadState::DRQ_READY);
        }
        self.execute_drq_local(drq.clone(), offline)
    }

    /// Execute one request (or reply) addressed to this context.
    pub(crate) fn execute_request(self: &Arc<Self>, drq: Arc<Drq>, local: bool) -> bool {
        if drq.requester() == self.me() && drq.is_reply() {
            log::trace!(target: "kestrel::drq", "reply for {:?}", self.me());
            self.state_change(ThreadState::DRQ_WAIT, ThreadState::READY);
            self.handle_remote_state_change();
            return !self.state().intersects(ThreadState::READY_MASK);
        }

        let mut answer = DrqResult::done();
        if let Some(func) = drq.take_func() {
            self.handle_remote_state_change();
            answer = func(self);
        }

        let mut need_resched = answer.contains(DrqResult::NEED_RESCHED);
        if !answer.contains(DrqResult::NO_ANSWER) {
            if let Some(requester) = self.kernel().context(drq.requester()) {
                if local {
                    requester.state_change(ThreadState::DRQ_WAIT, ThreadState::READY);
                    return need_resched;
                }
                drq.answered.store(true, Ordering::Release);
                need_resched |= requester.enqueue_drq(drq);
            }
        }
        need_resched
    }

    #[inline]
    pub fn drq_pending(&self) -> bool {
        !self.drq_q.lock().is_empty()
    }

    /// Drain the inbox. Returns whether a reschedule is needed.
    fn handle_requests(self: &Arc<Self>) -> bool {
        let mut need_resched = false;
        loop {
            let next = self.drq_q.lock().pop_front();
            let Some(drq) = next else {
                return need_resched;
            };
            need_resched |= self.execute_request(drq, false);
        }
    }

    /// Handle switch hazards and all pending DRQs of this context.
    ///
    /// Must run on the home CPU. Returns whether a reschedule is needed.
    pub(crate) fn handle_drq(self: &Arc<Self>) -> bool {
        let mut resched = false;
        let st = self.state();
        if st.intersects(ThreadState::SWITCH_HAZARDS) {
            self.state_del(ThreadState::SWITCH_HAZARDS);
            if st.contains(ThreadState::FINISH_MIGRATION) {
                self.finish_migration();
            }
            if st.contains(ThreadState::NEED_RESCHED) {
                resched = true;
            }
        }

        if !self.drq_pending() {
            return resched;
        }

        resched |= self.handle_requests();
        self.state_del(ThreadState::DRQ_READY);
        resched || !self.state().intersects(ThreadState::READY_MASK)
    }

    /// Run [`handle_drq`](Self::handle_drq) after switching to this context.
    pub(crate) fn switch_handle_drq(self: &Arc<Self>) -> Switch {
        if self.on_home_cpu() && self.handle_drq() {
            Switch::Resched
        } else {
            Switch::Ok
        }
    }

    /// Run `func` on the current CPU's kernel context.
    ///
    /// Used for work a context cannot do on its own behalf, such as
    /// removing itself from its CPU.
    pub(crate) async fn kernel_context_drq(self: &Arc<Self>, func: DrqFn) {
        let Some(cpu) = self.kernel().current_cpu() else {
            return;
        };
        if self.on_home_cpu() {
            self.update_ready_list();
        }

        let Some(kc) = cpu.kernel_context() else {
            return;
        };
        if kc.me() == self.me() {
            if func(&kc).contains(DrqResult::NEED_RESCHED) {
                cpu.set_need_resched();
            }
            return;
        }

        kc.drq_q.lock().push_back(Arc::new(Drq::new(ContextRef::NULL, func)));
        self.schedule_switch_to_locked(&kc).await;
    }

    /// [`kernel_context_drq`](Self::kernel_context_drq) for the
    /// dispatcher, which is not a suspendable context: the switch to the
    /// kernel context is left to the next dispatch step.
    pub(crate) fn kernel_context_drq_sync(self: &Arc<Self>, func: DrqFn) {
        let Some(cpu) = self.kernel().current_cpu() else {
            return;
        };
        if self.on_home_cpu() {
            self.update_ready_list();
        }
        let Some(kc) = cpu.kernel_context() else {
            return;
        };
        if kc.me() == self.me() {
            if func(&kc).contains(DrqResult::NEED_RESCHED) {
                cpu.set_need_resched();
            }
            return;
        }
        kc.drq_q.lock().push_back(Arc::new(Drq::new(ContextRef::NULL, func)));
        cpu.set_current_sched(&kc);
        cpu.set_pending_switch(kc.me());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::boot;
    use crate::thread::ThreadConfig;
    use core::sync::atomic::AtomicUsize;

    #[test]
    fn test_remote_drq_runs_on_target_cpu() {
        let k = boot(2);
        let t = k.create_thread(ThreadConfig::new("t").on_cpu(1)).unwrap();
        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        let s = seen.clone();
        k.post_drq(&t, Box::new(move |ctx| {
            s.store(kestrel_arch::cpu_id(), Ordering::SeqCst);
            assert_eq!(ctx.home_cpu(), 1);
            DrqResult::done()
        }));
        // Queued, not executed yet.
        assert_eq!(seen.load(Ordering::SeqCst), usize::MAX);
        assert!(k.ipi().pending(1).contains(kestrel_arch::Ipi::Request));

        k.run_until_idle().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(!t.drq_pending());
    }

    #[test]
    fn test_waiting_drq_blocks_until_reply() {
        let k = boot(2);
        let a = k.create_thread(ThreadConfig::new("a").on_cpu(0)).unwrap();
        let b = k.create_thread(ThreadConfig::new("b").on_cpu(1)).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicBool::new(false));

        let (h, d, target) = (hits.clone(), done.clone(), b.clone());
        let me = a.clone();
        k.spawn(&a, async move {
            me.drq(&target, Box::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
                DrqResult::done()
            }), DrqWait::Wait).await;
            d.store(true, Ordering::SeqCst);
        }).unwrap();

        k.run_until_idle().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(done.load(Ordering::SeqCst));
        assert!(!a.state().contains(ThreadState::DRQ_WAIT));
    }

    #[test]
    fn test_local_drq_executes_in_line() {
        let k = boot(1);
        let a = k.create_thread(ThreadConfig::new("a")).unwrap();
        let b = k.create_thread(ThreadConfig::new("b")).unwrap();
        let order = Arc::new(AtomicUsize::new(0));

        let (o, target, me) = (order.clone(), b.clone(), a.clone());
        k.spawn(&a, async move {
            let o2 = o.clone();
            me.drq(&target, Box::new(move |_| {
                o2.store(1, Ordering::SeqCst);
                DrqResult::done()
            }), DrqWait::NoWait).await;
            // Ran before drq() returned.
            assert_eq!(o.load(Ordering::SeqCst), 1);
            o.store(2, Ordering::SeqCst);
        }).unwrap();

        k.run_until_idle().unwrap();
        assert_eq!(order.load(Ordering::SeqCst), 2);
    }
}
