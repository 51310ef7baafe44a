//! Inter-Process Communication (IPC) subsystem.
//!
//! Synchronous rendezvous IPC between contexts. Every context plays two
//! roles at once:
//!
//! - **Sender**: queues itself in priority order on a receiver that is not
//!   ready and waits until the receiver takes the message, the send
//!   timeout hits or the operation is cancelled.
//! - **Receiver**: accepts either from one named partner (closed wait) or
//!   from the head of its sender queue (open wait).
//!
//! # Operations
//!
//! All of them funnel into [`Context::do_ipc`], the combined send and
//! receive:
//!
//! - **Send**: send phase only
//! - **Receive**: receive phase only, open or closed
//! - **Call**: send, then closed receive from the same partner; a
//!   successful call installs the caller in the receiver
//! - **Reply and wait**: send to the stored caller, then open receive
//!
//! Page-fault and exception messages ([`fault`]) and IPC gates ([`gate`])
//! are built on the same entry point.
//!
//! # Errors
//!
//! IPC failures are never Rust errors: the result tag carries the error
//! flag and the [`kestrel_abi::L4Error`] lands in the UTCB.

extern crate alloc;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

use bitflags::bitflags;
use kestrel_abi::CapRights;
use spin::Mutex;

use crate::context::ContextRef;

pub mod fault;
pub mod gate;
pub mod queue;
pub mod receiver;
pub mod rendezvous;
pub mod sender;
pub mod transfer;

pub use gate::IpcGate;
pub use queue::SenderList;

bitflags! {
    /// Phases requested by an invocation of a thread or gate capability.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct IpcOp: u8 {
        const SEND = 1 << 0;
        const RECV = 1 << 1;
        /// Receive from anybody instead of the invoked partner.
        const OPEN_WAIT = 1 << 2;
        /// Send to the stored caller instead of the invoked partner.
        const REPLY = 1 << 3;

        const CALL = Self::SEND.bits() | Self::RECV.bits();
        const REPLY_AND_WAIT = Self::REPLY.bits() | Self::RECV.bits() | Self::OPEN_WAIT.bits();
    }
}

/// Willingness of a receiver to take a message from a given sender.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RcvState {
    NotReceiving,
    /// In receive wait and this sender is acceptable.
    IpcReceive,
    /// Not in receive wait, but takes the message as an asynchronous
    /// upcall.
    IrqReceive,
}

impl RcvState {
    #[inline]
    pub fn is_receiving(self) -> bool {
        self != Self::NotReceiving
    }
}

/// Outcome of the send handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckSender {
    /// The receiver is ready; the sender transfers.
    Ok,
    /// The sender was queued on the receiver.
    Queued,
    /// The message was transferred by the receiver's CPU.
    Done,
    /// Partner invalid or not ready with a zero timeout.
    Failed,
}

impl CheckSender {
    pub(crate) fn to_raw(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Queued => 1,
            Self::Done => 2,
            Self::Failed => 3,
        }
    }

    pub(crate) fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Ok,
            1 => Self::Queued,
            2 => Self::Done,
            _ => Self::Failed,
        }
    }
}

/// Outcome of withdrawing a queued send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortState {
    /// The message was already delivered.
    Done,
    /// The sender was dequeued.
    Cancel,
    /// The receiver is taking the message right now.
    InProgress,
}

/// The context a reply goes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Caller {
    pub ctx: ContextRef,
    pub rights: CapRights,
}

/// The queue a blocked sender is enqueued on.
#[derive(Clone, Debug, Default)]
pub enum WaitQueue {
    #[default]
    None,
    Receiver(ContextRef),
    Gate(Arc<IpcGate>),
}

/// IPC state of a context, for both roles.
pub struct IpcState {
    // Receiver role
    partner: AtomicU32,
    rcv_prepared: AtomicBool,
    pub(crate) senders: Mutex<SenderList>,
    caller: Mutex<Option<Caller>>,
    async_ipc: AtomicBool,
    irq_pending: AtomicBool,

    // Sender role
    wait_queue: Mutex<WaitQueue>,
    send_rights: AtomicU8,
}

impl IpcState {
    pub const fn new() -> Self {
        Self {
            partner: AtomicU32::new(u32::MAX),
            rcv_prepared: AtomicBool::new(false),
            senders: Mutex::new(SenderList::new()),
            caller: Mutex::new(None),
            async_ipc: AtomicBool::new(false),
            irq_pending: AtomicBool::new(false),
            wait_queue: Mutex::new(WaitQueue::None),
            send_rights: AtomicU8::new(0),
        }
    }

    /// The pinned sender of a closed wait, or the sender being received
    /// from.
    pub fn partner(&self) -> Option<ContextRef> {
        ContextRef::from_raw(self.partner.load(Ordering::Acquire)).as_option()
    }

    pub(crate) fn set_partner(&self, partner: Option<ContextRef>) {
        let raw = partner.unwrap_or(ContextRef::NULL).raw();
        self.partner.store(raw, Ordering::Release);
    }

    /// Whether a receive phase follows the send phase.
    #[inline]
    pub fn prepared(&self) -> bool {
        self.rcv_prepared.load(Ordering::Acquire)
    }

    pub(crate) fn set_prepared(&self, prepared: bool) {
        self.rcv_prepared.store(prepared, Ordering::Release);
    }

    pub fn caller(&self) -> Option<Caller> {
        *self.caller.lock()
    }

    pub(crate) fn set_caller(&self, caller: Option<Caller>) {
        *self.caller.lock() = caller;
    }

    /// Number of queued senders.
    pub fn queued_senders(&self) -> usize {
        self.senders.lock().len()
    }

    pub fn has_sender(&self, sender: ContextRef) -> bool {
        self.senders.lock().contains(sender)
    }

    #[inline]
    pub fn async_ipc_enabled(&self) -> bool {
        self.async_ipc.load(Ordering::Acquire)
    }

    pub(crate) fn set_async_ipc(&self, enabled: bool) {
        self.async_ipc.store(enabled, Ordering::Release);
    }

    /// Sticky "a sender is waiting" flag of an asynchronous receiver.
    #[inline]
    pub fn irq_pending(&self) -> bool {
        self.irq_pending.load(Ordering::Acquire)
    }

    pub(crate) fn set_irq_pending(&self, pending: bool) {
        self.irq_pending.store(pending, Ordering::Release);
    }

    pub fn wait_queue(&self) -> WaitQueue {
        self.wait_queue.lock().clone()
    }

    pub(crate) fn set_wait_queue(&self, q: WaitQueue) {
        *self.wait_queue.lock() = q;
    }

    /// Clear the wait queue and return the old one.
    pub(crate) fn take_wait_queue(&self) -> WaitQueue {
        core::mem::take(&mut *self.wait_queue.lock())
    }

    pub(crate) fn send_rights(&self) -> CapRights {
        CapRights::from_bits(self.send_rights.load(Ordering::Acquire))
    }

    pub(crate) fn set_send_rights(&self, rights: CapRights) {
        self.send_rights.store(rights.bits(), Ordering::Release);
    }
}

impl Default for IpcState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests;
