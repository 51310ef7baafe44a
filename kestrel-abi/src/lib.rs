//! kestrel IPC ABI
//!
//! Shared definitions for the boundary between user-level threads and the
//! kernel's IPC path. This crate is `no_std` and has no dependencies, so it
//! can be linked into the kernel and into user-level runtimes alike.
//!
//! # Modules
//!
//! - [`error`] - The IPC error word ([`L4Error`])
//! - [`msg_tag`] - Message tag and protocol labels
//! - [`timeout`] - Encoded send/receive timeouts
//! - [`rights`] - Flexpage and capability access rights
//! - [`fpage`] - Flexpages, send items, receive buffers
//! - [`utcb`] - User thread control block and syscall frame

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod fpage;
pub mod msg_tag;
pub mod rights;
pub mod timeout;
pub mod utcb;

/// Machine word as seen by user-level code.
pub type Mword = u64;

pub use error::{ErrorCode, L4Error, Phase};
pub use fpage::{BufDesc, BufItem, Fpage, FpageType, SndItem};
pub use msg_tag::{Label, MsgTag};
pub use rights::CapRights;
pub use timeout::{Timeout, TimeoutPair};
pub use utcb::{SyscallFrame, Utcb, MAX_BUFFERS, MAX_WORDS};
