//! Weighted fair queueing
//!
//! Each context has a virtual deadline. The earliest deadline runs; a
//! replenished timeslice pushes the deadline by `quantum / weight`, so a
//! heavier context comes back sooner. The CPU's idle context is never
//! queued and runs only when nothing else is ready.

extern crate alloc;

use alloc::collections::{BTreeMap, BTreeSet};

use super::{RunQueue, SchedParams, SchedPolicy};
use crate::config::MAX_PRIO;
use crate::context::ContextRef;
use crate::error::{KernelError, KernelResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WfqSched {
    dl: u64,
    weight: u32,
    quantum: u64,
    /// Deadline advance per replenish.
    qdw: u64,
    left: u64,
    idle: bool,
    prio: u8,
}

impl WfqSched {
    #[inline]
    pub fn deadline(&self) -> u64 {
        self.dl
    }

    #[inline]
    pub fn weight(&self) -> u32 {
        self.weight
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.idle
    }

    fn apply(&mut self, quantum: u64, weight: u32) {
        self.quantum = quantum;
        self.weight = weight;
        // A weight above the quantum must still move the deadline.
        self.qdw = (quantum / weight as u64).max(1);
    }
}

impl SchedPolicy for WfqSched {
    type Queue = WfqQueue;

    fn new(default_quantum: u64) -> Self {
        let mut sc = Self {
            dl: 0,
            weight: 1,
            quantum: default_quantum,
            qdw: default_quantum,
            left: default_quantum,
            idle: false,
            prio: crate::config::DEFAULT_PRIO,
        };
        sc.apply(default_quantum, crate::config::DEFAULT_PRIO as u32 + 1);
        sc
    }

    fn idle(default_quantum: u64) -> Self {
        Self {
            idle: true,
            prio: 0,
            ..Self::new(default_quantum)
        }
    }

    fn set(&mut self, params: &SchedParams, default_quantum: u64) -> KernelResult<()> {
        match *params {
            SchedParams::Wfq { quantum_us, weight } => {
                if quantum_us == 0 || weight == 0 {
                    return Err(KernelError::EInval);
                }
                self.apply(quantum_us, weight);
                self.prio = 0;
            }
            // A priority request becomes a weight: prio + 1 shares.
            SchedParams::FixedPrio { prio, quantum_us } => {
                let prio = prio.min(MAX_PRIO as u16) as u8;
                let quantum = if quantum_us == 0 { default_quantum } else { quantum_us };
                self.apply(quantum, prio as u32 + 1);
                self.prio = prio;
            }
        }
        Ok(())
    }

    fn dominates(&self, other: &Self) -> bool {
        if self.idle {
            return false;
        }
        if other.idle {
            return true;
        }
        self.dl < other.dl
    }

    fn replenish(&mut self) {
        self.left = self.quantum;
        self.dl += self.qdw;
    }

    /// A context that slept past the current deadline catches up to it,
    /// collecting the time it is owed (at most one quantum).
    fn deblock_refill(&mut self, current: Option<&Self>) {
        let da = current.map_or(0, |c| c.dl);
        if self.dl >= da {
            return;
        }
        self.left = self
            .left
            .saturating_add((da - self.dl).saturating_mul(self.weight as u64))
            .min(self.quantum);
        self.dl = da;
    }

    fn left(&self) -> u64 {
        self.left
    }

    fn set_left(&mut self, left: u64) {
        self.left = left;
    }

    fn quantum(&self) -> u64 {
        self.quantum
    }

    fn prio(&self) -> u8 {
        self.prio
    }
}

/// Deadline-ordered ready set.
///
/// Entries with equal deadlines keep their insertion order.
pub struct WfqQueue {
    heap: BTreeSet<(u64, u64, ContextRef)>,
    members: BTreeMap<ContextRef, (u64, u64)>,
    idle: Option<ContextRef>,
    seq: u64,
}

impl WfqQueue {
    fn insert(&mut self, ctx: ContextRef, dl: u64, seq: u64) {
        self.heap.insert((dl, seq, ctx));
        self.members.insert(ctx, (dl, seq));
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

impl RunQueue<WfqSched> for WfqQueue {
    fn new() -> Self {
        Self {
            heap: BTreeSet::new(),
            members: BTreeMap::new(),
            idle: None,
            seq: 0,
        }
    }

    fn set_idle(&mut self, ctx: ContextRef, _sc: &WfqSched) {
        self.idle = Some(ctx);
    }

    fn enqueue(&mut self, ctx: ContextRef, sc: &WfqSched, is_current: bool) {
        if Some(ctx) == self.idle || self.members.contains_key(&ctx) {
            return;
        }
        // The current context wins ties against earlier entries.
        let seq = if is_current { 0 } else { self.next_seq() };
        self.insert(ctx, sc.dl, seq);
    }

    fn dequeue(&mut self, ctx: ContextRef) {
        if let Some((dl, seq)) = self.members.remove(&ctx) {
            self.heap.remove(&(dl, seq, ctx));
        }
    }

    fn requeue(&mut self, ctx: ContextRef, sc: &WfqSched) {
        if Some(ctx) == self.idle {
            return;
        }
        self.dequeue(ctx);
        let seq = self.next_seq();
        self.insert(ctx, sc.dl, seq);
    }

    fn next_to_run(&self) -> Option<ContextRef> {
        self.heap.first().map(|&(_, _, ctx)| ctx).or(self.idle)
    }

    fn contains(&self, ctx: ContextRef) -> bool {
        Some(ctx) == self.idle || self.members.contains_key(&ctx)
    }

    fn len(&self) -> usize {
        self.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sc(quantum: u64, weight: u32) -> WfqSched {
        let mut s = WfqSched::new(1000);
        s.set(&SchedParams::wfq(quantum, weight), 1000).unwrap();
        s
    }

    fn r(i: u16) -> ContextRef {
        ContextRef::new(i, 0)
    }

    #[test]
    fn test_rejects_zero_weight() {
        let mut s = WfqSched::new(1000);
        assert_eq!(s.set(&SchedParams::wfq(100, 0), 1000), Err(KernelError::EInval));
        assert_eq!(s.set(&SchedParams::wfq(0, 1), 1000), Err(KernelError::EInval));
    }

    #[test]
    fn test_replenish_advances_deadline() {
        let mut heavy = sc(1000, 4);
        let mut light = sc(1000, 1);
        heavy.replenish();
        light.replenish();
        assert_eq!(heavy.deadline(), 250);
        assert_eq!(light.deadline(), 1000);
        assert!(heavy.dominates(&light));
        assert!(!light.dominates(&heavy));
    }

    #[test]
    fn test_heavy_weight_still_advances_deadline() {
        let mut heavy = sc(100, 1000);
        let mut light = sc(100, 1);
        heavy.replenish();
        assert_eq!(heavy.deadline(), 1);
        heavy.replenish();
        assert_eq!(heavy.deadline(), 2);

        // Round robin with an equal peer still alternates.
        let mut peer = sc(100, 1000);
        peer.replenish();
        assert!(!heavy.dominates(&peer) && peer.dominates(&heavy));
        light.replenish();
        assert!(heavy.dominates(&light));
    }

    #[test]
    fn test_idle_never_dominates() {
        let idle = WfqSched::idle(1000);
        let other = sc(1000, 1);
        assert!(!idle.dominates(&other));
        assert!(!idle.dominates(&idle));
        assert!(other.dominates(&idle));
    }

    #[test]
    fn test_dominates_is_antisymmetric() {
        let mut a = sc(100, 1);
        let b = sc(100, 1);
        assert!(!a.dominates(&b) && !b.dominates(&a));
        a.replenish();
        assert!(b.dominates(&a) && !a.dominates(&b));
    }

    #[test]
    fn test_queue_order_and_idle() {
        let mut q = WfqQueue::new();
        q.set_idle(r(0), &WfqSched::idle(1000));
        assert_eq!(q.next_to_run(), Some(r(0)));

        let mut a = sc(1000, 1);
        let b = sc(1000, 2);
        q.enqueue(r(1), &a, false);
        q.enqueue(r(2), &b, false);
        // Equal deadlines: insertion order.
        assert_eq!(q.next_to_run(), Some(r(1)));

        a.replenish();
        q.requeue(r(1), &a);
        assert_eq!(q.next_to_run(), Some(r(2)));

        q.dequeue(r(2));
        q.dequeue(r(1));
        assert!(q.is_empty());
        assert_eq!(q.next_to_run(), Some(r(0)));
        assert!(q.contains(r(0)));
    }

    #[test]
    fn test_deblock_refill_catches_up() {
        let mut cur = sc(1000, 1);
        cur.replenish();
        cur.replenish();
        let mut sleeper = sc(1000, 1);
        sleeper.set_left(10);
        sleeper.deblock_refill(Some(&cur));
        assert_eq!(sleeper.deadline(), cur.deadline());
        assert_eq!(sleeper.left(), 1000);
    }
}
