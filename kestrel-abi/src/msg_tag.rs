//! Message tag
//!
//! The tag describes an IPC message: how many untyped words and typed items
//! follow in the UTCB, a few control flags, and a protocol label.
//!
//! # Layout
//!
//! | Bits   | Field                        |
//! |--------|------------------------------|
//! | 0-5    | untyped word count           |
//! | 6-11   | typed item count             |
//! | 12-15  | flags                        |
//! | 16-63  | protocol label (signed)      |

use core::fmt;

use crate::Mword;

/// Protocol labels defined by the kernel.
///
/// Negative labels are reserved for kernel-synthesised messages.
pub struct Label;

impl Label {
    pub const NONE: i64 = 0;
    pub const ALLOW_SYSCALL: i64 = 1;
    pub const IRQ: i64 = -1;
    pub const PAGE_FAULT: i64 = -2;
    pub const PREEMPTION: i64 = -3;
    pub const SYS_EXCEPTION: i64 = -4;
    pub const EXCEPTION: i64 = -5;
    pub const SIGMA0: i64 = -6;
    pub const IO_PAGE_FAULT: i64 = -8;
    pub const KOBJECT: i64 = -10;
    pub const THREAD: i64 = -12;
    pub const SCHEDULER: i64 = -14;
}

/// IPC message tag.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct MsgTag(Mword);

impl MsgTag {
    /// Sender transfers its FPU state (the receiver must agree).
    pub const TRANSFER_FPU: Mword = 0x1000;
    /// Sender does not donate its time slice to the receiver.
    pub const SCHEDULE: Mword = 0x2000;
    /// Propagate an incoming call (send only).
    pub const PROPAGATE: Mword = 0x4000;
    /// Output flag: the operation failed, details in the UTCB error word.
    pub const ERROR: Mword = 0x8000;

    /// Flags that are never passed on to the receiver.
    pub const RCV_FLAGS: Mword = Self::ERROR;

    const WORDS_MASK: Mword = 0x3f;
    const ITEMS_SHIFT: u32 = 6;
    const ITEMS_MASK: Mword = 0x3f;
    const FLAGS_MASK: Mword = 0xf000;
    const LABEL_SHIFT: u32 = 16;

    /// Build a tag.
    #[inline]
    #[must_use]
    pub const fn new(words: usize, items: usize, flags: Mword, label: i64) -> Self {
        Self(
            (words as Mword & Self::WORDS_MASK)
                | ((items as Mword & Self::ITEMS_MASK) << Self::ITEMS_SHIFT)
                | (flags & Self::FLAGS_MASK)
                | ((label as Mword) << Self::LABEL_SHIFT),
        )
    }

    /// The tag of a failed IPC without payload.
    #[inline]
    #[must_use]
    pub const fn error() -> Self {
        Self::new(0, 0, Self::ERROR, 0)
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

    /// Number of untyped message words.
    #[inline]
    #[must_use]
    pub const fn words(self) -> usize {
        (self.0 & Self::WORDS_MASK) as usize
    }

    /// Number of typed items (each two words).
    #[inline]
    #[must_use]
    pub const fn items(self) -> usize {
        ((self.0 >> Self::ITEMS_SHIFT) & Self::ITEMS_MASK) as usize
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> Mword {
        self.0 & Self::FLAGS_MASK
    }

    /// Protocol label.
    #[inline]
    #[must_use]
    pub const fn label(self) -> i64 {
        (self.0 as i64) >> Self::LABEL_SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn has_error(self) -> bool {
        self.0 & Self::ERROR != 0
    }

    #[inline]
    #[must_use]
    pub const fn transfer_fpu(self) -> bool {
        self.0 & Self::TRANSFER_FPU != 0
    }

    /// Whether the sender allows a direct switch to the receiver.
    #[inline]
    #[must_use]
    pub const fn do_switch(self) -> bool {
        self.0 & Self::SCHEDULE == 0
    }

    /// Same tag with the error flag set or cleared.
    #[inline]
    #[must_use]
    pub const fn with_error(self, error: bool) -> Self {
        if error {
            Self(self.0 | Self::ERROR)
        } else {
            Self(self.0 & !Self::ERROR)
        }
    }
}

impl fmt::Debug for MsgTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgTag")
            .field("label", &self.label())
            .field("words", &self.words())
            .field("items", &self.items())
            .field("flags", &format_args!("{:#x}", self.flags()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_fields() {
        let tag = MsgTag::new(2, 1, MsgTag::TRANSFER_FPU, Label::PAGE_FAULT);
        assert_eq!(tag.words(), 2);
        assert_eq!(tag.items(), 1);
        assert_eq!(tag.label(), Label::PAGE_FAULT);
        assert!(tag.transfer_fpu());
        assert!(tag.do_switch());
        assert!(!tag.has_error());
    }

    #[test]
    fn test_tag_error_flag() {
        let tag = MsgTag::new(3, 0, MsgTag::SCHEDULE, 42).with_error(true);
        assert!(tag.has_error());
        assert!(!tag.do_switch());
        assert_eq!(tag.label(), 42);
        assert!(!tag.with_error(false).has_error());
        assert!(MsgTag::error().has_error());
    }
}
