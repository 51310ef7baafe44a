//! User thread control block and syscall frame
//!
//! The UTCB is the per-thread memory shared between a thread and the
//! kernel. It holds the message registers of an IPC, the receive buffer
//! registers and the error word of the last IPC.
//!
//! # Layout
//!
//! | Field      | Words | Content                                   |
//! |------------|-------|-------------------------------------------|
//! | `values`   | 63    | untyped words, followed by typed items    |
//! | `buf_desc` | 1     | [`BufDesc`]                               |
//! | `buffers`  | 58    | receive buffers, absolute timeout values  |
//! | `error`    | 1     | [`L4Error`] of the last IPC               |
//! | `user`     | 3     | reserved for the user-level runtime       |

use crate::error::L4Error;
use crate::fpage::BufDesc;
use crate::msg_tag::MsgTag;
use crate::timeout::TimeoutPair;
use crate::Mword;

/// Number of message registers.
pub const MAX_WORDS: usize = 63;

/// Number of buffer registers.
pub const MAX_BUFFERS: usize = 58;

/// User thread control block.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct Utcb {
    pub values: [Mword; MAX_WORDS],
    pub buf_desc: BufDesc,
    pub buffers: [Mword; MAX_BUFFERS],
    pub error: L4Error,
    pub user: [Mword; 3],
}

impl Utcb {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            values: [0; MAX_WORDS],
            buf_desc: BufDesc::from_raw(0),
            buffers: [0; MAX_BUFFERS],
            error: L4Error::NONE,
            user: [0; 3],
        }
    }

    /// Record `error` for the caller and return the error tag.
    #[inline]
    pub fn commit_error(&mut self, error: L4Error, tag: MsgTag) -> MsgTag {
        self.error = error;
        tag.with_error(true)
    }
}

impl Default for Utcb {
    fn default() -> Self {
        Self::new()
    }
}

/// The IPC part of a thread's saved user register frame.
///
/// Input: `tag`, `from` (receive specifier / sender label) and `timeouts`.
/// Output: result `tag` and the label of the partner in `from`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyscallFrame {
    pub tag: MsgTag,
    pub from: Mword,
    pub timeouts: TimeoutPair,
}

impl SyscallFrame {
    #[must_use]
    pub const fn new(tag: MsgTag, from: Mword, timeouts: TimeoutPair) -> Self {
        Self { tag, from, timeouts }
    }
}
