//! Cross-CPU pending requests
//!
//! Each CPU owns a queue of contexts that have work waiting for that CPU:
//! DRQs, a state change made by a remote CPU, or a migration. A context is
//! in at most one such queue. The queue is drained from the request IPI
//! handler of its CPU.

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use super::{Context, ContextRef, ThreadState};
use crate::cpu::Cpu;
use crate::kernel::Kernel;

/// State change recorded by a remote CPU, applied by the home CPU as
/// `state = (state & !del) | add`.
#[derive(Clone, Copy, Debug)]
pub struct RemoteStateChange {
    add: ThreadState,
    del: ThreadState,
}

impl RemoteStateChange {
    pub const fn new() -> Self {
        Self {
            add: ThreadState::empty(),
            del: ThreadState::empty(),
        }
    }

    #[inline]
    fn pending(&self) -> bool {
        !self.add.is_empty() || !self.del.is_empty()
    }

    /// Compose with a further change.
    fn push(&mut self, del: ThreadState, add: ThreadState) {
        self.add = (self.add - del) | add;
        self.del = (self.del - add) | del;
    }

    fn take(&mut self) -> Option<(ThreadState, ThreadState)> {
        if !self.pending() {
            return None;
        }
        let r = (self.del, self.add);
        *self = Self::new();
        Some(r)
    }
}

/// Per-CPU queue of contexts with pending remote work.
#[derive(Default)]
pub struct PendingRqq {
    queue: VecDeque<ContextRef>,
}

impl PendingRqq {
    pub const fn new() -> Self {
        Self { queue: VecDeque::new() }
    }

    /// Queue `ctx` unless it already is. Returns whether the queue was
    /// empty, which means the owning CPU needs a request IPI.
    pub(crate) fn enqueue(&mut self, ctx: &Context) -> bool {
        if ctx.pending_queued.swap(true, Ordering::AcqRel) {
            return false;
        }
        let was_empty = self.queue.is_empty();
        self.queue.push_back(ctx.me());
        was_empty
    }

    /// Remove `ctx` if it is queued.
    pub(crate) fn dequeue(&mut self, ctx: &Context) {
        if ctx.pending_queued.swap(false, Ordering::AcqRel) {
            self.queue.retain(|r| *r != ctx.me());
        }
    }

    fn pop(&mut self, kernel: &Kernel) -> Option<Option<Arc<Context>>> {
        let r = self.queue.pop_front()?;
        let ctx = kernel.context(r);
        if let Some(c) = &ctx {
            c.pending_queued.store(false, Ordering::Release);
        }
        Some(ctx)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

impl Context {
    /// Change the state of a context that may live on another CPU.
    ///
    /// On the home CPU the change is applied at once and, if it makes the
    /// context ready, the context is deblocked; the return value then says
    /// whether it should preempt the current context. Otherwise the change
    /// is recorded for the home CPU and `false` is returned.
    pub fn xcpu_state_change(self: &Arc<Self>, del: ThreadState, add: ThreadState, lazy: bool) -> bool {
        let current = kestrel_arch::cpu_id();
        if self.home_cpu() != current {
            let mut remote = self.remote.lock();
            if self.home_cpu() != current {
                remote.push(del, add);
                drop(remote);
                log::trace!(target: "kestrel::drq", "remote state change {:?}: -{:?} +{:?}", self.me(), del, add);
                self.pending_rqq_enqueue();
                return false;
            }
        }

        self.state_change(del, add);
        if add.intersects(ThreadState::READY_MASK) {
            if let Some(cpu) = self.kernel().try_cpu(current) {
                return cpu.deblock_current(self, lazy);
            }
        }
        false
    }

    /// Apply a state change recorded by a remote CPU.
    pub(crate) fn handle_remote_state_change(&self) {
        let change = self.remote.lock().take();
        if let Some((del, add)) = change {
            self.state_change(del, add);
        }
    }

    /// Move this context to `cpu`, folding in any outstanding remote state
    /// change first.
    pub(crate) fn set_home_cpu(&self, cpu: usize) {
        let mut remote = self.remote.lock();
        if let Some((del, add)) = remote.take() {
            self.state_change(del, add);
        }
        self.store_home_cpu(cpu);
    }

    /// Queue this context on its home CPU's pending queue.
    pub(crate) fn pending_rqq_enqueue(&self) {
        let home = self.home_cpu();
        let Some(cpu) = self.kernel().try_cpu(home) else {
            // Forced off all CPUs: nobody else will apply it.
            self.handle_remote_state_change();
            return;
        };
        let ipi = {
            let mut q = cpu.pending.lock();
            if self.home_cpu() != home {
                // The new home CPU is responsible now.
                return;
            }
            if !cpu.is_online() {
                self.handle_remote_state_change();
                return;
            }
            q.enqueue(self)
        };
        if ipi {
            self.kernel().ipi().send(home, kestrel_arch::Ipi::Request);
        }
    }
}

/// Drain the pending queue of `cpu`, the calling CPU.
///
/// Returns whether a reschedule is needed, and the current context if it
/// must be migrated once the whole queue is handled.
pub(crate) fn handle_requests(kernel: &Kernel, cpu: &Cpu) -> (bool, Option<Arc<Context>>) {
    let mut resched = false;
    let mut mq = None;
    let curr = cpu.current_context();
    let is_curr = |c: &Arc<Context>| curr.as_ref().is_some_and(|cur| cur.me() == c.me());

    loop {
        let next = cpu.pending.lock().pop(kernel);
        let c = match next {
            None => break,
            Some(None) => continue,
            Some(Some(c)) => c,
        };

        c.handle_remote_state_change();
        if c.migration_pending() {
            // The current context moves only after the whole queue is
            // handled, or the rest would run on the wrong CPU.
            if !is_curr(&c) {
                resched |= c.initiate_migration();
                if c.home_cpu() != cpu.id() {
                    continue;
                }
            } else {
                mq = Some(c.clone());
            }
        } else {
            c.try_finish_migration();
        }

        if c.drq_pending() {
            if !is_curr(&c) {
                c.state_add(ThreadState::DRQ_READY);
            } else {
                resched |= c.handle_drq();
            }
        }

        if !is_curr(&c) && c.state().intersects(ThreadState::READY_MASK) {
            let running = curr
                .as_ref()
                .filter(|cur| cur.home_cpu() == cpu.id())
                .map(|cur| cur.sched());
            resched |= cpu.deblock(&c, running, false);
        }
    }
    (resched, mq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::boot;
    use crate::thread::ThreadConfig;

    #[test]
    fn test_remote_state_change_composes() {
        let mut r = RemoteStateChange::new();
        r.push(ThreadState::empty(), ThreadState::READY);
        r.push(ThreadState::READY, ThreadState::CANCEL);
        let (del, add) = r.take().unwrap();
        assert_eq!(add, ThreadState::CANCEL);
        assert!(del.contains(ThreadState::READY));
        assert!(r.take().is_none());
    }

    #[test]
    fn test_remote_change_is_deferred_to_home_cpu() {
        let k = boot(2);
        let t = k.create_thread(ThreadConfig::new("t").on_cpu(1)).unwrap();
        {
            let _cpu = kestrel_arch::enter_cpu(0);
            assert!(!t.xcpu_state_change(ThreadState::empty(), ThreadState::CANCEL, false));
        }
        assert!(!t.state().contains(ThreadState::CANCEL));
        assert_eq!(k.cpu(1).pending.lock().len(), 1);

        k.run_until_idle().unwrap();
        assert!(t.state().contains(ThreadState::CANCEL));
        assert!(k.cpu(1).pending.lock().is_empty());
    }

    #[test]
    fn test_enqueue_once() {
        let k = boot(1);
        let t = k.create_thread(ThreadConfig::new("t")).unwrap();
        let mut q = PendingRqq::new();
        assert!(q.enqueue(&t));
        assert!(!q.enqueue(&t));
        assert_eq!(q.len(), 1);
        q.dequeue(&t);
        assert!(q.is_empty());
    }
}
