//! Flexpage and capability access rights
//!
//! Rights are packed into the low four bits of a flexpage. Interpretation
//! is object-type specific:
//!
//! - **X / S**: execute for memory, the "special" right for objects
//! - **W**: write for memory, send-side authority for objects
//! - **R**: read
//! - **D**: delete (objects only)
//!
//! Rights can only be reduced while travelling through IPC, never escalated.

use core::fmt;

/// Access rights of a flexpage or capability.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct CapRights(u8);

impl CapRights {
    pub const NONE: Self = Self(0);
    /// Execute (memory) / special (objects).
    pub const X: Self = Self(1 << 0);
    pub const S: Self = Self::X;
    pub const W: Self = Self(1 << 1);
    pub const R: Self = Self(1 << 2);
    pub const D: Self = Self(1 << 3);

    pub const RW: Self = Self(Self::R.0 | Self::W.0);
    pub const RWX: Self = Self(Self::R.0 | Self::W.0 | Self::X.0);
    /// Every right an object capability can carry.
    pub const CRWSD: Self = Self(0x0f);
    pub const ALL: Self = Self(0x0f);

    /// Create rights from raw bits, masking off anything above bit 3.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0x0f)
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    #[inline]
    #[must_use]
    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Rights in `self` that are not in `other`.
    #[inline]
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for CapRights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapRights({})", self)
    }
}

impl fmt::Display for CapRights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}",
            if self.contains(Self::R) { "R" } else { "-" },
            if self.contains(Self::W) { "W" } else { "-" },
            if self.contains(Self::X) { "X" } else { "-" },
            if self.contains(Self::D) { "D" } else { "-" },
        )
    }
}

impl core::ops::BitAnd for CapRights {
    type Output = Self;

    #[inline]
    fn bitand(self, rhs: Self) -> Self::Output {
        self.intersect(rhs)
    }
}

impl core::ops::BitOr for CapRights {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rights_bits() {
        assert_eq!(CapRights::RW.bits(), 0x6);
        assert_eq!(CapRights::from_bits(0xff), CapRights::ALL);
        assert!(CapRights::ALL.contains(CapRights::D));
        assert!(!CapRights::R.contains(CapRights::W));
    }

    #[test]
    fn test_rights_reduce() {
        let r = CapRights::CRWSD.without(CapRights::S);
        assert_eq!(r, CapRights::R | CapRights::W | CapRights::D);
        assert_eq!(r & CapRights::RW, CapRights::RW);
    }

    #[test]
    fn test_rights_display() {
        assert_eq!(CapRights::RW.to_string(), "RW--");
        assert_eq!(CapRights::ALL.to_string(), "RWXD");
    }
}
