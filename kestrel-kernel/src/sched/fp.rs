//! Fixed-priority scheduling
//!
//! 256 priority levels, FIFO lists within a level. A context whose
//! timeslice ran out is moved behind the other contexts of its level.

extern crate alloc;

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use super::{RunQueue, SchedParams, SchedPolicy};
use crate::config::{DEFAULT_PRIO, MAX_PRIO};
use crate::context::ContextRef;
use crate::error::{KernelError, KernelResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FpSched {
    prio: u8,
    quantum: u64,
    left: u64,
}

impl SchedPolicy for FpSched {
    type Queue = FpQueue;

    fn new(default_quantum: u64) -> Self {
        Self {
            prio: DEFAULT_PRIO,
            quantum: default_quantum,
            left: default_quantum,
        }
    }

    fn idle(default_quantum: u64) -> Self {
        Self {
            prio: 0,
            quantum: default_quantum,
            left: default_quantum,
        }
    }

    fn set(&mut self, params: &SchedParams, default_quantum: u64) -> KernelResult<()> {
        match *params {
            SchedParams::FixedPrio { prio, quantum_us } => {
                self.prio = prio.min(MAX_PRIO as u16) as u8;
                self.quantum = if quantum_us == 0 { default_quantum } else { quantum_us };
                Ok(())
            }
            SchedParams::Wfq { .. } => Err(KernelError::EInval),
        }
    }

    #[inline]
    fn dominates(&self, other: &Self) -> bool {
        self.prio > other.prio
    }

    #[inline]
    fn replenish(&mut self) {
        self.left = self.quantum;
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

/// Ready lists indexed by priority.
pub struct FpQueue {
    lists: Vec<VecDeque<ContextRef>>,
    members: BTreeMap<ContextRef, u8>,
    idle: Option<ContextRef>,
    highest: u8,
}

impl FpQueue {
    fn recompute_highest(&mut self) {
        while self.highest > 0 && self.lists[self.highest as usize].is_empty() {
            self.highest -= 1;
        }
    }
}

impl RunQueue<FpSched> for FpQueue {
    fn new() -> Self {
        Self {
            lists: (0..=MAX_PRIO as usize).map(|_| VecDeque::new()).collect(),
            members: BTreeMap::new(),
            idle: None,
            highest: 0,
        }
    }

    fn set_idle(&mut self, ctx: ContextRef, sc: &FpSched) {
        self.idle = Some(ctx);
        self.enqueue(ctx, sc, false);
    }

    fn enqueue(&mut self, ctx: ContextRef, sc: &FpSched, is_current: bool) {
        if self.members.contains_key(&ctx) {
            return;
        }
        let prio = sc.prio;
        if prio > self.highest {
            self.highest = prio;
        }
        let list = &mut self.lists[prio as usize];
        if is_current {
            list.push_front(ctx);
        } else {
            list.push_back(ctx);
        }
        self.members.insert(ctx, prio);
    }

    fn dequeue(&mut self, ctx: ContextRef) {
        let Some(prio) = self.members.remove(&ctx) else {
            return;
        };
        let list = &mut self.lists[prio as usize];
        if let Some(pos) = list.iter().position(|c| *c == ctx) {
            list.remove(pos);
        }
        self.recompute_highest();
    }

    fn requeue(&mut self, ctx: ContextRef, sc: &FpSched) {
        match self.members.get(&ctx) {
            None => self.enqueue(ctx, sc, false),
            Some(&prio) => {
                let list = &mut self.lists[prio as usize];
                if let Some(pos) = list.iter().position(|c| *c == ctx) {
                    list.remove(pos);
                    list.push_back(ctx);
                }
            }
        }
    }

    fn next_to_run(&self) -> Option<ContextRef> {
        self.lists[self.highest as usize].front().copied()
    }

    fn contains(&self, ctx: ContextRef) -> bool {
        self.members.contains_key(&ctx)
    }

    fn len(&self) -> usize {
        let idle = self.idle.is_some_and(|i| self.members.contains_key(&i));
        self.members.len() - idle as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sc(prio: u8) -> FpSched {
        let mut s = FpSched::new(1000);
        s.set(&SchedParams::fixed_prio(prio as u16), 1000).unwrap();
        s
    }

    fn r(i: u32) -> ContextRef {
        ContextRef::new(i as u16, 0)
    }

    #[test]
    fn test_highest_priority_first() {
        let mut q = FpQueue::new();
        q.enqueue(r(1), &sc(5), false);
        q.enqueue(r(2), &sc(10), false);
        q.enqueue(r(3), &sc(7), false);
        assert_eq!(q.next_to_run(), Some(r(2)));
        q.dequeue(r(2));
        assert_eq!(q.next_to_run(), Some(r(3)));
        q.dequeue(r(3));
        assert_eq!(q.next_to_run(), Some(r(1)));
    }

    #[test]
    fn test_round_robin_within_priority() {
        let mut q = FpQueue::new();
        q.enqueue(r(1), &sc(3), false);
        q.enqueue(r(2), &sc(3), false);
        assert_eq!(q.next_to_run(), Some(r(1)));
        q.requeue(r(1), &sc(3));
        assert_eq!(q.next_to_run(), Some(r(2)));
    }

    #[test]
    fn test_current_goes_first() {
        let mut q = FpQueue::new();
        q.enqueue(r(1), &sc(3), false);
        q.enqueue(r(2), &sc(3), true);
        assert_eq!(q.next_to_run(), Some(r(2)));
        // Double enqueue is ignored.
        q.enqueue(r(1), &sc(3), true);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_set_clamps_and_defaults() {
        let mut s = FpSched::new(1000);
        s.set(&SchedParams::FixedPrio { prio: 300, quantum_us: 0 }, 1000).unwrap();
        assert_eq!(s.prio(), 255);
        assert_eq!(s.quantum(), 1000);
        assert_eq!(s.set(&SchedParams::wfq(10, 1), 1000), Err(KernelError::EInval));
    }

    #[test]
    fn test_dominates_is_strict() {
        for a in [0u8, 1, 5, 255] {
            for b in [0u8, 1, 5, 255] {
                let (x, y) = (sc(a), sc(b));
                assert!(!(x.dominates(&y) && y.dominates(&x)));
            }
            let idle = FpSched::idle(1000);
            assert!(!idle.dominates(&sc(a)));
        }
    }
}
