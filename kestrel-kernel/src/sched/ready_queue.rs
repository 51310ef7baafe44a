//! Per-CPU ready queue
//!
//! Wraps a policy's [`RunQueue`] with the CPU-wide scheduling state: the
//! scheduling context whose timeslice is being consumed
//! (`current_sched`), the end of that timeslice and the marker used to
//! detect re-entrant scheduling.
//!
//! The queue never touches a context directly. Operations that need a
//! context's scheduling context take it (or a snapshot) as an argument;
//! the caller holds the ready-queue lock first and the context's sched
//! lock second.

use super::{RunQueue, SchedPolicy};
use crate::context::ContextRef;

pub struct ReadyQueue<S: SchedPolicy> {
    queue: S::Queue,
    current: Option<(ContextRef, S)>,
    timeslice_end: u64,
    idle: ContextRef,
    pub schedule_in_progress: Option<ContextRef>,
}

/// What happened to the scheduling context that was current before a
/// call to [`ReadyQueue::set_current_sched`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SavedTimeslice {
    /// Time was left; store it.
    Left(ContextRef, u64),
    /// The timeslice was used up; replenish it.
    Expired(ContextRef),
}

impl<S: SchedPolicy> ReadyQueue<S> {
    pub fn new() -> Self {
        Self {
            queue: S::Queue::new(),
            current: None,
            timeslice_end: u64::MAX,
            idle: ContextRef::NULL,
            schedule_in_progress: None,
        }
    }

    pub fn set_idle(&mut self, ctx: ContextRef, sc: &S) {
        self.idle = ctx;
        self.queue.set_idle(ctx, sc);
    }

    #[inline]
    pub fn idle(&self) -> ContextRef {
        self.idle
    }

    // -- Current timeslice

    #[inline]
    pub fn current_sched(&self) -> Option<ContextRef> {
        self.current.map(|(r, _)| r)
    }

    #[inline]
    pub fn current_snapshot(&self) -> Option<&S> {
        self.current.as_ref().map(|(_, s)| s)
    }

    #[inline]
    pub fn timeslice_end(&self) -> u64 {
        self.timeslice_end
    }

    /// Make `sc` (owned by `owner`) the timeslice being consumed.
    ///
    /// Returns how the previous timeslice ended so the caller can write
    /// the result back into its owner's scheduling context.
    pub fn set_current_sched(&mut self, owner: ContextRef, sc: S, now: u64) -> Option<SavedTimeslice> {
        let saved = self.current.map(|(prev, _)| {
            if self.timeslice_end > now {
                SavedTimeslice::Left(prev, self.timeslice_end - now)
            } else {
                SavedTimeslice::Expired(prev)
            }
        });
        self.timeslice_end = now.saturating_add(sc.left());
        self.current = Some((owner, sc));
        log::trace!(target: "kestrel::sched", "load timeslice {:?} left {}", owner, sc.left());
        saved
    }

    /// Forget the current timeslice; the next schedule picks a new one.
    pub fn invalidate_sched(&mut self) {
        self.current = None;
        self.timeslice_end = u64::MAX;
    }

    /// Whether the current timeslice has run out at `now`.
    #[inline]
    pub fn timeslice_expired(&self, now: u64) -> bool {
        self.current.is_some() && now >= self.timeslice_end
    }

    // -- Queue membership

    /// Queue `ctx` unless it already is. The owner of the current
    /// timeslice goes in front of its equals.
    pub fn ready_enqueue(&mut self, ctx: ContextRef, sc: &S) {
        if self.queue.contains(ctx) {
            return;
        }
        let is_current = self.current_sched() == Some(ctx);
        self.queue.enqueue(ctx, sc, is_current);
    }

    pub fn enqueue(&mut self, ctx: ContextRef, sc: &S) {
        self.queue.enqueue(ctx, sc, false);
    }

    pub fn ready_dequeue(&mut self, ctx: ContextRef) {
        if ctx == self.idle {
            return;
        }
        self.queue.dequeue(ctx);
    }

    pub fn requeue(&mut self, ctx: ContextRef, sc: &S) {
        self.queue.requeue(ctx, sc);
    }

    #[inline]
    pub fn contains(&self, ctx: ContextRef) -> bool {
        self.queue.contains(ctx)
    }

    #[inline]
    pub fn next_to_run(&self) -> Option<ContextRef> {
        self.queue.next_to_run()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Make `ctx` ready on this CPU.
    ///
    /// Returns whether the woken context should run in place of the
    /// running one, whose scheduling context is `running`. With `lazy`
    /// set and a reschedule due, the context is not enqueued: the caller
    /// switches to it directly.
    pub fn deblock(&mut self, ctx: ContextRef, sc: &mut S, running: Option<&S>, lazy: bool) -> bool {
        let mut res = true;
        if self.current_sched() == Some(ctx) {
            if running.is_some_and(|r| r.dominates(sc)) {
                res = false;
            }
        } else {
            sc.deblock_refill(self.current_snapshot());
            if self.current_snapshot().is_some_and(|cs| cs.dominates(sc))
                || running.is_some_and(|r| r.dominates(sc))
            {
                res = false;
            }
        }

        if res && lazy {
            return true;
        }

        self.ready_enqueue(ctx, sc);
        res
    }

    /// Leave the timeslice of `from` and queue `to` instead.
    pub fn switch_sched(&mut self, from: ContextRef, to: ContextRef, to_sc: &S) {
        if self.current_sched() == Some(from) {
            self.invalidate_sched();
        }
        self.ready_dequeue(from);
        self.enqueue(to, to_sc);
    }
}

impl<S: SchedPolicy> Default for ReadyQueue<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::fp::FpSched;
    use crate::sched::SchedParams;

    fn sc(prio: u16) -> FpSched {
        let mut s = FpSched::new(1000);
        s.set(&SchedParams::fixed_prio(prio), 1000).unwrap();
        s
    }

    fn r(i: u16) -> ContextRef {
        ContextRef::new(i, 0)
    }

    #[test]
    fn test_set_current_sched_saves_left() {
        let mut rq = ReadyQueue::<FpSched>::new();
        assert_eq!(rq.set_current_sched(r(1), sc(5), 100), None);
        assert_eq!(rq.timeslice_end(), 1100);
        assert_eq!(rq.set_current_sched(r(2), sc(5), 400), Some(SavedTimeslice::Left(r(1), 700)));
        assert_eq!(rq.set_current_sched(r(1), sc(5), 5000), Some(SavedTimeslice::Expired(r(2))));
        assert_eq!(rq.current_sched(), Some(r(1)));
    }

    #[test]
    fn test_deblock_preempts_lower_priority() {
        let mut rq = ReadyQueue::<FpSched>::new();
        rq.set_current_sched(r(1), sc(5), 0);
        let running = sc(5);

        let mut high = sc(10);
        assert!(rq.deblock(r(2), &mut high, Some(&running), false));
        assert!(rq.contains(r(2)));

        let mut low = sc(1);
        assert!(!rq.deblock(r(3), &mut low, Some(&running), false));
        assert!(rq.contains(r(3)));
    }

    #[test]
    fn test_lazy_deblock_skips_enqueue() {
        let mut rq = ReadyQueue::<FpSched>::new();
        rq.set_current_sched(r(1), sc(5), 0);
        let mut high = sc(10);
        assert!(rq.deblock(r(2), &mut high, Some(&sc(5)), true));
        assert!(!rq.contains(r(2)));

        // No reschedule due: enqueued even when lazy.
        let mut low = sc(1);
        assert!(!rq.deblock(r(3), &mut low, Some(&sc(5)), true));
        assert!(rq.contains(r(3)));
    }

    #[test]
    fn test_idle_is_never_dequeued() {
        let mut rq = ReadyQueue::<FpSched>::new();
        rq.set_idle(r(0), &FpSched::idle(1000));
        rq.ready_dequeue(r(0));
        assert_eq!(rq.next_to_run(), Some(r(0)));
    }

    #[test]
    fn test_switch_sched_invalidates_current() {
        let mut rq = ReadyQueue::<FpSched>::new();
        rq.set_current_sched(r(1), sc(3), 0);
        rq.enqueue(r(1), &sc(3));
        rq.switch_sched(r(1), r(2), &sc(3));
        assert_eq!(rq.current_sched(), None);
        assert!(!rq.contains(r(1)));
        assert!(rq.contains(r(2)));
    }
}
