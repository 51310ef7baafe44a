//! Flexpages and typed message items
//!
//! A typed item occupies two message words: a control word and a
//! flexpage. The sender places its items after the untyped words of the
//! message; the receiver declares matching receive buffers in the buffer
//! registers of its UTCB, indexed by [`BufDesc`].
//!
//! # Flexpage layout
//!
//! | Bits  | Field                                        |
//! |-------|----------------------------------------------|
//! | 0-3   | rights                                       |
//! | 4-5   | type (nil, memory, I/O port, object)         |
//! | 6-11  | order (log2 of the size in pages / ports / objects) |
//! | 12-63 | base page number, port number or object index |

use crate::Mword;
use crate::rights::CapRights;

/// Resource type described by a flexpage.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FpageType {
    /// The nil flexpage (or a special one).
    Special = 0,
    Memory = 1,
    Io = 2,
    Obj = 3,
}

/// A flexpage: a naturally aligned, power-of-two sized resource range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Fpage(Mword);

impl Fpage {
    const RIGHTS_MASK: Mword = 0xf;
    const TYPE_SHIFT: u32 = 4;
    const ORDER_SHIFT: u32 = 6;
    const ORDER_MASK: Mword = 0x3f;
    const BASE_SHIFT: u32 = 12;

    /// The nil flexpage.
    pub const NIL: Self = Self(0);

    /// Order of a flexpage covering a whole space.
    pub const WHOLE_SPACE: u8 = 63;

    #[inline]
    #[must_use]
    pub const fn new(ty: FpageType, base: Mword, order: u8, rights: CapRights) -> Self {
        Self(
            (base << Self::BASE_SHIFT)
                | (((order as Mword) & Self::ORDER_MASK) << Self::ORDER_SHIFT)
                | ((ty as Mword) << Self::TYPE_SHIFT)
                | (rights.bits() as Mword),
        )
    }

    /// Memory flexpage starting at page number `page`.
    #[inline]
    #[must_use]
    pub const fn mem(page: Mword, order: u8, rights: CapRights) -> Self {
        Self::new(FpageType::Memory, page, order, rights)
    }

    /// I/O port flexpage.
    #[inline]
    #[must_use]
    pub const fn io(port: Mword, order: u8) -> Self {
        Self::new(FpageType::Io, port, order, CapRights::RW)
    }

    /// Object (capability) flexpage starting at capability index `index`.
    #[inline]
    #[must_use]
    pub const fn obj(index: Mword, order: u8, rights: CapRights) -> Self {
        Self::new(FpageType::Obj, index, order, rights)
    }

    /// Receive window accepting any resource type, anywhere.
    #[inline]
    #[must_use]
    pub const fn all_spaces() -> Self {
        Self::new(FpageType::Special, 0, Self::WHOLE_SPACE, CapRights::NONE)
    }

    #[inline]
    #[must_use]
    pub const fn is_all_spaces(self) -> bool {
        matches!(self.ty(), FpageType::Special) && self.order() == Self::WHOLE_SPACE
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: Mword) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> Mword {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn ty(self) -> FpageType {
        match (self.0 >> Self::TYPE_SHIFT) & 0x3 {
            1 => FpageType::Memory,
            2 => FpageType::Io,
            3 => FpageType::Obj,
            _ => FpageType::Special,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_nil(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn order(self) -> u8 {
        ((self.0 >> Self::ORDER_SHIFT) & Self::ORDER_MASK) as u8
    }

    /// Number of pages, ports or objects covered.
    #[inline]
    #[must_use]
    pub const fn size(self) -> Mword {
        1 << self.order()
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> Mword {
        (self.0 >> Self::BASE_SHIFT) & !(self.size() - 1)
    }

    #[inline]
    #[must_use]
    pub const fn rights(self) -> CapRights {
        CapRights::from_bits((self.0 & Self::RIGHTS_MASK) as u8)
    }

    /// Reduce the rights to those in `mask`.
    #[inline]
    #[must_use]
    pub const fn mask_rights(self, mask: CapRights) -> Self {
        Self((self.0 & !Self::RIGHTS_MASK) | (self.rights().intersect(mask).bits() as Mword))
    }
}

/// Control word of a typed send item.
///
/// | Bits  | Field                                         |
/// |-------|-----------------------------------------------|
/// | 0     | compound (next item uses the same buffer)     |
/// | 1     | grant (remove from sender after mapping)      |
/// | 3     | map item marker                               |
/// | 4-7   | attributes (memory caching, object flags)     |
/// | 12-63 | send base (offset hint in the receive window) |
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct SndItem(Mword);

impl SndItem {
    pub const COMPOUND: Mword = 0x1;
    pub const GRANT: Mword = 0x2;
    pub const MAP: Mword = 0x8;

    /// Build a map item control word.
    #[inline]
    #[must_use]
    pub const fn map(base: Mword, grant: bool, compound: bool) -> Self {
        let mut raw = Self::MAP | (base << 12);
        if grant {
            raw |= Self::GRANT;
        }
        if compound {
            raw |= Self::COMPOUND;
        }
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: Mword) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> Mword {
        self.0
    }

    /// A void item carries nothing and is skipped by the transfer.
    #[inline]
    #[must_use]
    pub const fn is_void(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn compound(self) -> bool {
        self.0 & Self::COMPOUND != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_grant(self) -> bool {
        self.0 & Self::GRANT != 0
    }

    #[inline]
    #[must_use]
    pub const fn attr(self) -> u8 {
        ((self.0 >> 4) & 0xf) as u8
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> Mword {
        self.0 >> 12
    }
}

/// Control word of a receive buffer.
///
/// Memory and I/O buffers, and object buffers without
/// [`BufItem::SMALL_OBJ`], are followed by a flexpage word describing the
/// receive window. A small object buffer is a single word naming one
/// capability slot by index in bits 12 and up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct BufItem(Mword);

impl BufItem {
    /// Forward incoming mappings instead of installing them.
    pub const FORWARD: Mword = 0x1;
    /// Single-word object buffer.
    pub const SMALL_OBJ: Mword = 0x2;
    /// Receive a local id instead of a mapping when possible.
    pub const RCV_ID: Mword = 0x4;
    /// Marker that distinguishes a present buffer from the void one.
    pub const MAP: Mword = 0x8;

    #[inline]
    #[must_use]
    pub const fn new(flags: Mword) -> Self {
        Self(Self::MAP | flags)
    }

    /// Small object buffer for capability slot `index`.
    #[inline]
    #[must_use]
    pub const fn small_obj(index: Mword, flags: Mword) -> Self {
        Self(Self::MAP | Self::SMALL_OBJ | flags | (index << 12))
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: Mword) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> Mword {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_void(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn is_small_obj(self) -> bool {
        self.0 & Self::SMALL_OBJ != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_rcv_id(self) -> bool {
        self.0 & Self::RCV_ID != 0
    }

    #[inline]
    #[must_use]
    pub const fn forward(self) -> bool {
        self.0 & Self::FORWARD != 0
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> Mword {
        self.0 >> 12
    }
}

/// Receive word type codes written over a delivered item's control word.
pub mod rcv_type {
    use crate::Mword;

    /// A mapping was installed.
    pub const MAP_SOMETHING: Mword = 0;
    pub const MAP_NOTHING: Mword = 2;
    /// An object id (capability index and rights) was delivered.
    pub const ID: Mword = 4;
    /// The sender's own flexpage was delivered (same address space).
    pub const FLEXPAGE: Mword = 6;
}

/// Buffer descriptor: where each kind of receive buffer starts.
///
/// | Bits  | Field                          |
/// |-------|--------------------------------|
/// | 0-4   | first memory buffer            |
/// | 5-9   | first I/O buffer               |
/// | 10-14 | first object buffer            |
/// | 24    | receiver accepts FPU state     |
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct BufDesc(Mword);

impl BufDesc {
    pub const INHERIT_FPU: Mword = 1 << 24;

    #[inline]
    #[must_use]
    pub const fn new(mem: usize, io: usize, obj: usize, inherit_fpu: bool) -> Self {
        let mut raw = (mem as Mword & 0x1f)
            | ((io as Mword & 0x1f) << 5)
            | ((obj as Mword & 0x1f) << 10);
        if inherit_fpu {
            raw |= Self::INHERIT_FPU;
        }
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: Mword) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> Mword {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn mem(self) -> usize {
        (self.0 & 0x1f) as usize
    }

    #[inline]
    #[must_use]
    pub const fn io(self) -> usize {
        ((self.0 >> 5) & 0x1f) as usize
    }

    #[inline]
    #[must_use]
    pub const fn obj(self) -> usize {
        ((self.0 >> 10) & 0x1f) as usize
    }

    #[inline]
    #[must_use]
    pub const fn inherit_fpu(self) -> bool {
        self.0 & Self::INHERIT_FPU != 0
    }
}
