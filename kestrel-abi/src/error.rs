//! IPC error word
//!
//! Every failed IPC operation reports exactly one [`L4Error`] in the
//! caller's UTCB. The lowest bit of the code records the phase (send or
//! receive) in which the failure occurred; the `R_*` codes of the
//! taxonomy are the receive-phase twins of the send-phase codes.

use core::fmt;

use crate::Mword;

/// Phase of an IPC operation an error belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Send phase.
    Snd,
    /// Receive phase.
    Rcv,
}

/// IPC error codes.
///
/// Odd values are receive-phase errors.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Success.
    None = 0x00,
    /// Send timeout.
    Timeout = 0x02,
    /// Receive timeout.
    RTimeout = 0x03,
    /// Partner (destination, pager, exception handler) does not exist.
    NotExistent = 0x04,
    /// Send phase cancelled.
    Canceled = 0x06,
    /// Receive phase cancelled.
    RCanceled = 0x07,
    /// Message or typed-item buffer mismatch.
    Overflow = 0x08,
    /// Receive-side buffer mismatch.
    ROverflow = 0x09,
    /// Send transfer timeout.
    XferTimeout = 0x0a,
    /// Receive transfer timeout.
    RXferTimeout = 0x0b,
    /// Send phase aborted.
    Aborted = 0x0c,
    /// Receive phase aborted.
    RAborted = 0x0d,
    /// A mapping could not be established (send side).
    MapFailed = 0x10,
    /// A mapping could not be established (receive side).
    RMapFailed = 0x11,
}

impl ErrorCode {
    /// Decode a raw code, ignoring unknown values.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0x00 => Self::None,
            0x02 => Self::Timeout,
            0x03 => Self::RTimeout,
            0x04 => Self::NotExistent,
            0x06 => Self::Canceled,
            0x07 => Self::RCanceled,
            0x08 => Self::Overflow,
            0x09 => Self::ROverflow,
            0x0a => Self::XferTimeout,
            0x0b => Self::RXferTimeout,
            0x0c => Self::Aborted,
            0x0d => Self::RAborted,
            0x10 => Self::MapFailed,
            0x11 => Self::RMapFailed,
            _ => return None,
        })
    }

    /// Short description for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "ok",
            Self::Timeout => "send timeout",
            Self::RTimeout => "receive timeout",
            Self::NotExistent => "partner does not exist",
            Self::Canceled => "send canceled",
            Self::RCanceled => "receive canceled",
            Self::Overflow => "send buffer overflow",
            Self::ROverflow => "receive buffer overflow",
            Self::XferTimeout => "send transfer timeout",
            Self::RXferTimeout => "receive transfer timeout",
            Self::Aborted => "send aborted",
            Self::RAborted => "receive aborted",
            Self::MapFailed => "send mapping failed",
            Self::RMapFailed => "receive mapping failed",
        }
    }
}

/// The error word written to the UTCB of a thread whose IPC failed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct L4Error(u8);

impl L4Error {
    /// No error.
    pub const NONE: Self = Self(ErrorCode::None as u8);
    pub const TIMEOUT: Self = Self(ErrorCode::Timeout as u8);
    pub const R_TIMEOUT: Self = Self(ErrorCode::RTimeout as u8);
    pub const NOT_EXISTENT: Self = Self(ErrorCode::NotExistent as u8);
    pub const CANCELED: Self = Self(ErrorCode::Canceled as u8);
    pub const R_CANCELED: Self = Self(ErrorCode::RCanceled as u8);
    pub const OVERFLOW: Self = Self(ErrorCode::Overflow as u8);
    pub const ABORTED: Self = Self(ErrorCode::Aborted as u8);
    pub const R_ABORTED: Self = Self(ErrorCode::RAborted as u8);
    pub const MAP_FAILED: Self = Self(ErrorCode::MapFailed as u8);

    const RCV_BIT: u8 = 1;

    /// Build an error from a code.
    #[inline]
    #[must_use]
    pub const fn new(code: ErrorCode) -> Self {
        Self(code as u8)
    }

    /// Re-tag an error with the given phase.
    ///
    /// `L4Error::TIMEOUT.in_phase(Phase::Rcv)` is `R_TIMEOUT`.
    #[inline]
    #[must_use]
    pub const fn in_phase(self, phase: Phase) -> Self {
        if self.0 == 0 {
            return self;
        }
        match phase {
            Phase::Snd => Self(self.0 & !Self::RCV_BIT),
            Phase::Rcv => Self(self.0 | Self::RCV_BIT),
        }
    }

    /// Build from the raw word stored in a UTCB.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: Mword) -> Self {
        Self((raw & 0x1f) as u8)
    }

    /// Raw value as stored in the UTCB.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> Mword {
        self.0 as Mword
    }

    /// Whether this value reports success.
    #[inline]
    #[must_use]
    pub const fn ok(self) -> bool {
        self.0 == 0
    }

    /// Phase the error occurred in.
    #[inline]
    #[must_use]
    pub const fn phase(self) -> Phase {
        if self.0 & Self::RCV_BIT != 0 {
            Phase::Rcv
        } else {
            Phase::Snd
        }
    }

    /// Decoded error code, `None` for unknown raw values.
    #[inline]
    #[must_use]
    pub const fn code(self) -> Option<ErrorCode> {
        ErrorCode::from_raw(self.0)
    }
}

impl From<ErrorCode> for L4Error {
    fn from(code: ErrorCode) -> Self {
        Self::new(code)
    }
}

impl fmt::Debug for L4Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code() {
            Some(code) => write!(f, "L4Error::{:?}", code),
            None => write!(f, "L4Error({:#x})", self.0),
        }
    }
}

impl fmt::Display for L4Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code() {
            Some(code) => write!(f, "{}", code.as_str()),
            None => write!(f, "unknown IPC error {:#x}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_retag() {
        assert_eq!(L4Error::TIMEOUT.in_phase(Phase::Rcv), L4Error::R_TIMEOUT);
        assert_eq!(L4Error::R_CANCELED.in_phase(Phase::Snd), L4Error::CANCELED);
        assert_eq!(L4Error::NONE.in_phase(Phase::Rcv), L4Error::NONE);
        assert_eq!(L4Error::R_TIMEOUT.phase(), Phase::Rcv);
        assert_eq!(L4Error::OVERFLOW.phase(), Phase::Snd);
    }

    #[test]
    fn test_raw_decoding() {
        assert_eq!(L4Error::from_raw(0x04).code(), Some(ErrorCode::NotExistent));
        assert_eq!(L4Error::from_raw(0x1e).code(), None);
        assert!(L4Error::from_raw(0).ok());
        assert!(!L4Error::MAP_FAILED.ok());
    }
}
