//! Context arena
//!
//! Contexts live in a slot table and are named by generation-checked
//! handles. Freeing a slot bumps its generation, so a stale handle held
//! by a sender list, a DRQ or a timeout never resolves to the slot's next
//! occupant.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use spin::RwLock;

use super::Context;
use crate::config::MAX_CONTEXTS;
use crate::error::{KernelError, KernelResult};

/// Handle of a context.
///
/// Bits 0-15 hold the slot index, bits 16-31 the slot generation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ContextRef(u32);

impl ContextRef {
    /// Handle naming no context.
    pub const NULL: Self = Self(u32::MAX);

    #[inline]
    #[must_use]
    pub const fn new(index: u16, generation: u16) -> Self {
        Self(index as u32 | (generation as u32) << 16)
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        (self.0 & 0xffff) as usize
    }

    #[inline]
    #[must_use]
    pub const fn generation(self) -> u16 {
        (self.0 >> 16) as u16
    }

    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::NULL.0
    }

    /// `None` for the null handle.
    #[inline]
    #[must_use]
    pub const fn as_option(self) -> Option<Self> {
        if self.is_valid() { Some(self) } else { None }
    }
}

impl fmt::Debug for ContextRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "ctx#{}.{}", self.index(), self.generation())
        } else {
            write!(f, "ctx#null")
        }
    }
}

struct Slot {
    generation: u16,
    ctx: Option<Arc<Context>>,
}

pub struct ContextTable {
    slots: RwLock<Vec<Slot>>,
}

impl ContextTable {
    pub const fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Insert a context built by `build` from its future handle.
    pub fn insert(&self, build: impl FnOnce(ContextRef) -> Arc<Context>) -> KernelResult<Arc<Context>> {
        let mut slots = self.slots.write();
        let index = match slots.iter().position(|s| s.ctx.is_none()) {
            Some(i) => i,
            None if slots.len() < MAX_CONTEXTS => {
                slots.push(Slot { generation: 0, ctx: None });
                slots.len() - 1
            }
            None => return Err(KernelError::ENomem),
        };
        let handle = ContextRef::new(index as u16, slots[index].generation);
        let ctx = build(handle);
        slots[index].ctx = Some(ctx.clone());
        Ok(ctx)
    }

    /// Resolve a handle. Stale and null handles resolve to `None`.
    pub fn get(&self, r: ContextRef) -> Option<Arc<Context>> {
        if !r.is_valid() {
            return None;
        }
        let slots = self.slots.read();
        let slot = slots.get(r.index())?;
        if slot.generation != r.generation() {
            return None;
        }
        slot.ctx.clone()
    }

    /// Free the slot of `r`, returning its context.
    pub fn remove(&self, r: ContextRef) -> KernelResult<Arc<Context>> {
        let mut slots = self.slots.write();
        let slot = slots.get_mut(r.index()).ok_or(KernelError::ENoent)?;
        if slot.generation != r.generation() {
            return Err(KernelError::ENoent);
        }
        let ctx = slot.ctx.take().ok_or(KernelError::ENoent)?;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(ctx)
    }

    /// Number of live contexts.
    pub fn len(&self) -> usize {
        self.slots.read().iter().filter(|s| s.ctx.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ContextTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_fields() {
        let r = ContextRef::new(7, 3);
        assert_eq!(r.index(), 7);
        assert_eq!(r.generation(), 3);
        assert!(r.is_valid());
        assert!(!ContextRef::NULL.is_valid());
        assert_eq!(ContextRef::NULL.as_option(), None);
        assert_eq!(ContextRef::from_raw(r.raw()), r);
    }

    #[test]
    fn test_null_and_unknown_handles_resolve_to_none() {
        let table = ContextTable::new();
        assert!(table.get(ContextRef::NULL).is_none());
        assert!(table.get(ContextRef::new(5, 0)).is_none());
        assert_eq!(table.remove(ContextRef::new(5, 0)).err(), Some(KernelError::ENoent));
        assert!(table.is_empty());
    }
}
