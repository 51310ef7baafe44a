//! Receiver role of a context.
//!
//! The handshake of a sender with this receiver runs on the receiver's
//! home CPU (in line, or as a DRQ from the sender's CPU) and is decided
//! under the sender-list lock: the first sender to pass [`sender_ok`]
//! there gets the transfer, everybody else is queued in priority order.
//!
//! [`sender_ok`]: Context::sender_ok

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU8, Ordering};

use kestrel_abi::{CapRights, L4Error};
use kestrel_arch::INVALID_CPU;

use super::{AbortState, Caller, CheckSender, RcvState, SenderList, WaitQueue};
use crate::context::{Context, ContextRef, DrqResult, DrqWait, ThreadState};

impl Context {
    /// Enter the receive part of an IPC: pin `sender` for a closed wait
    /// (`None` for open wait) and note whether there is a receive phase.
    pub(crate) fn prepare_receive(&self, sender: Option<ContextRef>, have_receive: bool) {
        self.ipc.set_prepared(have_receive);
        self.ipc.set_partner(sender);
    }

    /// Whether this receiver would take a message from `sender` now.
    pub fn sender_ok(&self, sender: &Context) -> RcvState {
        let senders = self.ipc.senders.lock();
        self.sender_ok_locked(sender, &senders)
    }

    fn sender_ok_locked(&self, sender: &Context, senders: &SenderList) -> RcvState {
        let ipc = self.state() & ThreadState::IPC_MASK;
        // Still in the send phase, or not receiving at all.
        if ipc != ThreadState::RECEIVE_WAIT {
            return self.vcpu_async_ipc(sender);
        }

        let partner = self.ipc.partner();
        if partner.is_none() && senders.first().is_none_or(|h| h == sender.me()) {
            return RcvState::IpcReceive;
        }
        if partner == Some(sender.me()) {
            return RcvState::IpcReceive;
        }
        RcvState::NotReceiving
    }

    /// Take the message as an upcall if asynchronous IPC is enabled and
    /// no IPC is in progress.
    fn vcpu_async_ipc(&self, sender: &Context) -> RcvState {
        if self.state().intersects(ThreadState::IPC_MASK) {
            return RcvState::NotReceiving;
        }
        if !self.state().contains(ThreadState::VCPU_ENABLED) || !self.ipc.async_ipc_enabled() {
            return RcvState::NotReceiving;
        }

        log::trace!(target: "kestrel::ipc", "{:?}: async upcall from {:?}", self.me(), sender.me());
        self.ipc.set_partner(Some(sender.me()));
        self.ipc.set_prepared(true);
        self.state_add(ThreadState::RECEIVE_WAIT);
        RcvState::IrqReceive
    }

    /// Decide the handshake with `sender`, queueing it if this receiver
    /// is not ready and `timeout` allows waiting.
    ///
    /// Runs on this receiver's home CPU.
    pub(crate) fn check_sender(&self, sender: &Arc<Context>, timeout: bool) -> CheckSender {
        if self.is_invalid() {
            sender.utcb.lock().error = L4Error::NOT_EXISTENT;
            return CheckSender::Failed;
        }

        let mut senders = self.ipc.senders.lock();
        if self.sender_ok_locked(sender, &senders).is_receiving() {
            return CheckSender::Ok;
        }
        if !timeout {
            drop(senders);
            sender.utcb.lock().error = L4Error::TIMEOUT;
            return CheckSender::Failed;
        }

        sender.ipc.set_wait_queue(WaitQueue::Receiver(self.me()));
        senders.enqueue(sender.me(), sender.prio());
        drop(senders);
        self.vcpu_set_irq_pending();
        log::trace!(target: "kestrel::ipc", "{:?} queued on {:?}", sender.me(), self.me());
        CheckSender::Queued
    }

    /// Queued sender to take the message from: the pinned one for a
    /// closed wait, the head of the queue for an open wait.
    pub(crate) fn get_next_sender(&self, sender: Option<ContextRef>) -> Option<Arc<Context>> {
        let next = {
            let senders = self.ipc.senders.lock();
            match sender {
                Some(s) => senders.contains(s).then_some(s),
                None => senders.first(),
            }
        }?;
        if sender.is_none() {
            self.ipc.set_partner(Some(next));
        }
        self.kernel().context(next)
    }

    /// Whether this receiver is taking a message from `sender` right now.
    pub fn in_ipc(&self, sender: ContextRef) -> bool {
        self.state().contains(ThreadState::RECEIVE_IN_PROGRESS) && self.ipc.partner() == Some(sender)
    }

    /// Whether this context is dead or forced off all CPUs.
    pub fn is_invalid(&self) -> bool {
        self.home_cpu() == INVALID_CPU || self.state().contains(ThreadState::DEAD)
    }

    // -- Caller

    pub fn caller(&self) -> Option<Caller> {
        self.ipc.caller()
    }

    pub(crate) fn set_caller(&self, caller: ContextRef, rights: CapRights) {
        self.ipc.set_caller(Some(Caller { ctx: caller, rights }));
    }

    pub fn reset_caller(&self) {
        self.ipc.set_caller(None);
    }

    // -- Asynchronous IPC

    /// Enable or disable asynchronous (upcall) IPC for this receiver.
    pub fn set_async_ipc(&self, enabled: bool) {
        self.ipc.set_async_ipc(enabled);
        if enabled {
            self.state_add(ThreadState::VCPU_ENABLED);
        } else {
            self.state_del(ThreadState::VCPU_ENABLED);
            self.ipc.set_irq_pending(false);
        }
    }

    fn vcpu_set_irq_pending(&self) {
        if self.state().contains(ThreadState::VCPU_ENABLED) {
            self.ipc.set_irq_pending(true);
        }
    }

    /// Drop the pending flag once no sender is left.
    pub(crate) fn vcpu_update_state(&self) {
        if !self.state().contains(ThreadState::VCPU_ENABLED) {
            return;
        }
        if self.ipc.senders.lock().is_empty() {
            self.ipc.set_irq_pending(false);
        }
    }

    // -- Abort

    fn dequeue_aborted(&self, sender: &Context) -> AbortState {
        if self.ipc.senders.lock().dequeue(sender.me()) {
            sender.ipc.set_wait_queue(WaitQueue::None);
            self.vcpu_update_state();
            AbortState::Cancel
        } else if self.in_ipc(sender.me()) {
            AbortState::InProgress
        } else {
            AbortState::Done
        }
    }

    /// Withdraw `sender` from this receiver, on this receiver's CPU.
    ///
    /// `current` is the calling context; it waits for the DRQ if this
    /// receiver lives on another CPU.
    pub(crate) async fn receiver_abort_send(self: &Arc<Self>, sender: &Arc<Context>, current: &Context) -> AbortState {
        if self.on_home_cpu() {
            return self.dequeue_aborted(sender);
        }

        let result = Arc::new(AtomicU8::new(0));
        let (r, s) = (result.clone(), sender.clone());
        current
            .drq(
                self,
                Box::new(move |rcv| {
                    let abt = match rcv.dequeue_aborted(&s) {
                        AbortState::Done => 0,
                        AbortState::Cancel => 1,
                        AbortState::InProgress => 2,
                    };
                    r.store(abt, Ordering::Release);
                    DrqResult::done()
                }),
                DrqWait::Wait,
            )
            .await;
        match result.load(Ordering::Acquire) {
            1 => AbortState::Cancel,
            2 => AbortState::InProgress,
            _ => AbortState::Done,
        }
    }
}
