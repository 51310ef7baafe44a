//! Priority-ordered sender queue of a receiver.
//!
//! # Queue Invariants
//!
//! - Entries are sorted by descending priority
//! - Entries of equal priority are in FIFO order
//! - A context appears at most once

extern crate alloc;

use alloc::collections::VecDeque;

use crate::context::ContextRef;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Entry {
    ctx: ContextRef,
    prio: u8,
}

/// Senders waiting for a receiver to become ready.
#[derive(Debug, Default)]
pub struct SenderList {
    entries: VecDeque<Entry>,
}

impl SenderList {
    pub const fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Insert `ctx` behind all senders of priority `prio` or higher.
    ///
    /// Returns `false` if `ctx` is already queued.
    pub fn enqueue(&mut self, ctx: ContextRef, prio: u8) -> bool {
        if self.contains(ctx) {
            return false;
        }
        let pos = self
            .entries
            .iter()
            .position(|e| e.prio < prio)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, Entry { ctx, prio });
        true
    }

    /// Remove `ctx`. Returns whether it was queued.
    pub fn dequeue(&mut self, ctx: ContextRef) -> bool {
        match self.entries.iter().position(|e| e.ctx == ctx) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    /// The sender served next.
    #[inline]
    pub fn first(&self) -> Option<ContextRef> {
        self.entries.front().map(|e| e.ctx)
    }

    pub fn pop_first(&mut self) -> Option<ContextRef> {
        self.entries.pop_front().map(|e| e.ctx)
    }

    #[inline]
    pub fn contains(&self, ctx: ContextRef) -> bool {
        self.entries.iter().any(|e| e.ctx == ctx)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = ContextRef> + '_ {
        self.entries.iter().map(|e| e.ctx)
    }
}
