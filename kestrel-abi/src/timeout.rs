//! IPC timeouts
//!
//! A timeout is a 16-bit value encoding either "never", "zero", a relative
//! interval as `mantissa << exponent` microseconds, or an absolute point in
//! time stored in the UTCB buffer registers.
//!
//! # Layout
//!
//! | Bits  | Relative      | Absolute                 |
//! |-------|---------------|--------------------------|
//! | 0-9   | mantissa      | UTCB buffer index (0-5)  |
//! | 10-14 | exponent      | -                        |
//! | 15    | 0             | 1                        |

use crate::Mword;
use crate::utcb::{Utcb, MAX_BUFFERS};

/// An encoded send or receive timeout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Timeout(u16);

impl Timeout {
    /// Wait forever.
    pub const NEVER: Self = Self(0);
    /// Do not wait at all.
    pub const ZERO: Self = Self(0x400);

    const ABS_MASK: u16 = 0x8000;
    const EXP_MASK: u16 = 0x7c00;
    const EXP_SHIFT: u16 = 10;
    const MAN_MASK: u16 = 0x3ff;

    /// Relative timeout of `man << exp` microseconds.
    ///
    /// `exp == 0` means never, `man == 0` with `exp != 0` means zero.
    #[inline]
    #[must_use]
    pub const fn new(man: u16, exp: u16) -> Self {
        Self(((exp << Self::EXP_SHIFT) & Self::EXP_MASK) | (man & Self::MAN_MASK))
    }

    /// Smallest encodable relative timeout of at least `us` microseconds.
    #[must_use]
    pub const fn from_micros(us: u64) -> Self {
        if us == 0 {
            return Self::ZERO;
        }
        let mut exp = 1u16;
        loop {
            let man = us.div_ceil(1u64 << exp);
            if man <= Self::MAN_MASK as u64 {
                return Self::new(man as u16, exp);
            }
            if exp == 31 {
                return Self::new(Self::MAN_MASK, 31);
            }
            exp += 1;
        }
    }

    /// Absolute timeout read from UTCB buffer register `index`.
    #[inline]
    #[must_use]
    pub const fn absolute(index: u16) -> Self {
        Self(Self::ABS_MASK | (index & 0x3f))
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u16 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_never(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == Self::ZERO.0
    }

    /// Whether the timeout is neither never nor zero.
    #[inline]
    #[must_use]
    pub const fn is_finite(self) -> bool {
        !self.is_never() && !self.is_zero()
    }

    #[inline]
    #[must_use]
    pub const fn is_absolute(self) -> bool {
        self.0 & Self::ABS_MASK != 0
    }

    #[inline]
    #[must_use]
    pub const fn exp(self) -> u16 {
        (self.0 & Self::EXP_MASK) >> Self::EXP_SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn man(self) -> u16 {
        self.0 & Self::MAN_MASK
    }

    /// Absolute wake-up time of a relative timeout, 0 for a zero timeout.
    #[inline]
    #[must_use]
    pub const fn microsecs_rel(self, clock: u64) -> u64 {
        if self.man() == 0 {
            0
        } else {
            clock + ((self.man() as u64) << self.exp())
        }
    }

    /// Absolute wake-up time of this timeout.
    ///
    /// # Arguments
    ///
    /// * `clock` - Current value of the kernel clock in microseconds.
    /// * `utcb` - UTCB holding the time value of an absolute timeout.
    #[must_use]
    pub fn microsecs(self, clock: u64, utcb: &Utcb) -> u64 {
        if self.is_absolute() {
            let idx = ((self.0 & 0x3f) as usize).min(MAX_BUFFERS - 1);
            utcb.buffers[idx] as u64
        } else {
            self.microsecs_rel(clock)
        }
    }
}

/// Receive and send timeout of one IPC operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct TimeoutPair {
    pub rcv: Timeout,
    pub snd: Timeout,
}

impl TimeoutPair {
    /// Never time out in either phase.
    pub const NEVER: Self = Self { rcv: Timeout::NEVER, snd: Timeout::NEVER };

    #[inline]
    #[must_use]
    pub const fn new(rcv: Timeout, snd: Timeout) -> Self {
        Self { rcv, snd }
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: Mword) -> Self {
        Self {
            rcv: Timeout::from_raw(raw as u16),
            snd: Timeout::from_raw((raw >> 16) as u16),
        }
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> Mword {
        self.rcv.raw() as Mword | (self.snd.raw() as Mword) << 16
    }
}
