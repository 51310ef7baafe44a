//! Tasks (address spaces)
//!
//! A [`Space`] is the protection domain of one or more threads. The kernel
//! core only needs three things from it:
//!
//! - an object space mapping capability indices to kernel objects, used to
//!   translate object items of an IPC
//! - a memory and an I/O port space, the targets of mapping items
//! - an existence flag, cleared when the task is destroyed, after which
//!   nothing can be mapped into it
//!
//! The page tables themselves are an external collaborator; a mapping here
//! is a record of page number and rights.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use kestrel_abi::{CapRights, Fpage, FpageType, L4Error, Mword, SndItem};
use spin::Mutex;

use crate::context::ContextRef;
use crate::ipc::IpcGate;

static NEXT_SPACE_ID: AtomicU32 = AtomicU32::new(1);

/// A kernel object reachable through a capability.
#[derive(Clone, Debug)]
pub enum KObject {
    Thread(ContextRef),
    Gate(Arc<IpcGate>),
}

impl KObject {
    /// Whether a receiver in `space` can name this object by a local id
    /// instead of a mapping.
    pub fn is_local(&self, space: &Space) -> bool {
        match self {
            Self::Gate(g) => g.bound_space() == Some(space.id()),
            Self::Thread(_) => false,
        }
    }

    /// The local id handed to a receiver in the bound space.
    pub fn obj_id(&self) -> Mword {
        match self {
            Self::Gate(g) => g.label(),
            Self::Thread(r) => r.raw() as Mword,
        }
    }

    fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Thread(a), Self::Thread(b)) => a == b,
            (Self::Gate(a), Self::Gate(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// An object capability: the object plus the rights it grants.
#[derive(Clone, Debug)]
pub struct ObjCap {
    pub obj: KObject,
    pub rights: CapRights,
}

pub struct Space {
    id: u32,
    alive: AtomicBool,
    objects: Mutex<BTreeMap<Mword, ObjCap>>,
    pages: Mutex<BTreeMap<Mword, CapRights>>,
    io: Mutex<BTreeMap<Mword, CapRights>>,
}

impl Space {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed),
            alive: AtomicBool::new(true),
            objects: Mutex::new(BTreeMap::new()),
            pages: Mutex::new(BTreeMap::new()),
            io: Mutex::new(BTreeMap::new()),
        })
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Mark the task destroyed and drop all its mappings.
    pub fn destroy(&self) {
        self.alive.store(false, Ordering::Release);
        self.objects.lock().clear();
        self.pages.lock().clear();
        self.io.lock().clear();
    }

    // -- Object space

    pub fn insert_obj(&self, index: Mword, obj: KObject, rights: CapRights) {
        self.objects.lock().insert(index, ObjCap { obj, rights });
    }

    pub fn lookup_obj(&self, index: Mword) -> Option<ObjCap> {
        self.objects.lock().get(&index).cloned()
    }

    /// Capability index under which `obj` is mapped here.
    pub fn find_obj(&self, obj: &KObject) -> Option<Mword> {
        self.objects
            .lock()
            .iter()
            .find(|(_, c)| c.obj.same(obj))
            .map(|(i, _)| *i)
    }

    // -- Memory and I/O space

    pub fn insert_page(&self, page: Mword, rights: CapRights) {
        self.pages.lock().insert(page, rights);
    }

    pub fn lookup_page(&self, page: Mword) -> Option<CapRights> {
        self.pages.lock().get(&page).copied()
    }

    pub fn insert_port(&self, port: Mword, rights: CapRights) {
        self.io.lock().insert(port, rights);
    }

    pub fn lookup_port(&self, port: Mword) -> Option<CapRights> {
        self.io.lock().get(&port).copied()
    }

    /// Map (or grant) the part of `sfp` in `src` that falls into the
    /// receive window `rfp` of `dst`.
    ///
    /// The smaller of the two flexpages determines the size; the send
    /// item's hot spot selects the part of the larger one. Rights are
    /// reduced to those of `sfp`. Only existing source mappings are
    /// transferred.
    pub fn fpage_map(src: &Space, sfp: Fpage, dst: &Space, rfp: Fpage, item: SndItem) -> L4Error {
        if !dst.is_alive() {
            return L4Error::OVERFLOW;
        }
        if !src.is_alive() {
            return L4Error::MAP_FAILED;
        }
        let rfp = if rfp.is_all_spaces() {
            Fpage::new(sfp.ty(), 0, Fpage::WHOLE_SPACE, CapRights::ALL)
        } else {
            rfp
        };
        if sfp.ty() != rfp.ty() {
            return L4Error::MAP_FAILED;
        }

        let hot_spot = item.index();
        let (src_base, dst_base, order) = if sfp.order() > rfp.order() {
            let off = hot_spot & (sfp.size() - 1) & !(rfp.size() - 1);
            (sfp.base() + off, rfp.base(), rfp.order())
        } else {
            let off = hot_spot & (rfp.size() - 1) & !(sfp.size() - 1);
            (sfp.base(), rfp.base() + off, sfp.order())
        };
        let size: Mword = 1 << order;
        let mask = sfp.rights();

        log::trace!(target: "kestrel::ipc", "map {:?} space {} {:#x} -> space {} {:#x} ({} entries, grant {})",
            sfp.ty(), src.id(), src_base, dst.id(), dst_base, size, item.is_grant());

        match sfp.ty() {
            FpageType::Memory => {
                let moved = take_range(&src.pages, src_base, size, item.is_grant(), |r| r.intersect(mask));
                put_range(&dst.pages, moved, src_base, dst_base);
            }
            FpageType::Io => {
                let moved = take_range(&src.io, src_base, size, item.is_grant(), |r| r.intersect(mask));
                put_range(&dst.io, moved, src_base, dst_base);
            }
            FpageType::Obj => {
                let moved = take_range(&src.objects, src_base, size, item.is_grant(), |c| ObjCap {
                    obj: c.obj.clone(),
                    rights: c.rights.intersect(mask),
                });
                put_range(&dst.objects, moved, src_base, dst_base);
            }
            FpageType::Special => return L4Error::MAP_FAILED,
        }
        L4Error::NONE
    }
}

fn take_range<V: Clone>(
    map: &Mutex<BTreeMap<Mword, V>>,
    base: Mword,
    size: Mword,
    grant: bool,
    reduce: impl Fn(&V) -> V,
) -> Vec<(Mword, V)> {
    let mut map = map.lock();
    let end = base.saturating_add(size);
    let moved: Vec<_> = map.range(base..end).map(|(k, v)| (*k, reduce(v))).collect();
    if grant {
        for (k, _) in &moved {
            map.remove(k);
        }
    }
    moved
}

fn put_range<V>(map: &Mutex<BTreeMap<Mword, V>>, entries: Vec<(Mword, V)>, src_base: Mword, dst_base: Mword) {
    let mut map = map.lock();
    for (k, v) in entries {
        map.insert(dst_base + (k - src_base), v);
    }
}

impl core::fmt::Debug for Space {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Space")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_memory_window() {
        let a = Space::new();
        let b = Space::new();
        for p in 0x100..0x104 {
            a.insert_page(p, CapRights::RWX);
        }
        let sfp = Fpage::mem(0x100, 2, CapRights::RW);
        let rfp = Fpage::mem(0x800, 2, CapRights::RWX);
        let err = Space::fpage_map(&a, sfp, &b, rfp, SndItem::map(0, false, false));
        assert!(err.ok());
        assert_eq!(b.lookup_page(0x802), Some(CapRights::RW));
        assert_eq!(a.lookup_page(0x102), Some(CapRights::RWX));
    }

    #[test]
    fn test_grant_moves_mapping() {
        let a = Space::new();
        let b = Space::new();
        a.insert_port(0x60, CapRights::RW);
        let err = Space::fpage_map(&a, Fpage::io(0x60, 0), &b, Fpage::io(0x70, 0), SndItem::map(0, true, false));
        assert!(err.ok());
        assert_eq!(a.lookup_port(0x60), None);
        assert_eq!(b.lookup_port(0x70), Some(CapRights::RW));
    }

    #[test]
    fn test_larger_send_page_uses_hot_spot() {
        let a = Space::new();
        let b = Space::new();
        for p in 0..16 {
            a.insert_page(p, CapRights::R);
        }
        // 16-page send flexpage into a 4-page window at hot spot page 8.
        let item = SndItem::map(8, false, false);
        let err = Space::fpage_map(&a, Fpage::mem(0, 4, CapRights::R), &b, Fpage::mem(0x40, 2, CapRights::R), item);
        assert!(err.ok());
        assert_eq!(b.lookup_page(0x40), Some(CapRights::R));
        assert_eq!(b.lookup_page(0x44), None);
    }

    #[test]
    fn test_all_spaces_window_maps_at_hot_spot() {
        let a = Space::new();
        let b = Space::new();
        a.insert_page(0x1234, CapRights::RW);
        let item = SndItem::map(0x1234, false, false);
        let err = Space::fpage_map(&a, Fpage::mem(0x1234, 0, CapRights::RW), &b, Fpage::all_spaces(), item);
        assert!(err.ok());
        assert_eq!(b.lookup_page(0x1234), Some(CapRights::RW));
    }

    #[test]
    fn test_dead_receiver_overflows() {
        let a = Space::new();
        let b = Space::new();
        b.destroy();
        let err = Space::fpage_map(&a, Fpage::mem(0, 0, CapRights::R), &b, Fpage::mem(0, 0, CapRights::R), SndItem::map(0, false, false));
        assert_eq!(err, L4Error::OVERFLOW);
    }
}
