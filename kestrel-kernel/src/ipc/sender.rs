//! Sender role of a context.
//!
//! A sender that finds its receiver not ready queues itself on the
//! receiver and sleeps in [`do_send_wait`](Context::do_send_wait) until one
//! of three things happens:
//!
//! - the receiver takes the message ([`ipc_send_msg`], run by the receiver)
//! - the receiver dies or cancels ([`ipc_receiver_aborted`])
//! - the send timeout hits or the sender is cancelled, in which case the
//!   sender withdraws itself with [`abort_send`]
//!
//! [`ipc_send_msg`]: Context::ipc_send_msg
//! [`ipc_receiver_aborted`]: Context::ipc_receiver_aborted
//! [`abort_send`]: Context::abort_send

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU8, Ordering};

use kestrel_abi::{L4Error, MsgTag, Timeout};

use super::{AbortState, CheckSender, WaitQueue};
use crate::context::{Context, DrqResult, DrqWait, ThreadState};

impl Context {
    /// Whether this sender is queued on a receiver or a gate.
    pub fn in_sender_list(&self) -> bool {
        !matches!(self.ipc.wait_queue(), WaitQueue::None)
    }

    /// Remove this sender from whatever queue it waits on.
    ///
    /// Returns whether it was still queued.
    pub(crate) fn leave_wait_queue(&self) -> bool {
        match self.ipc.take_wait_queue() {
            WaitQueue::None => false,
            WaitQueue::Receiver(r) => {
                let Some(rcv) = self.kernel().context(r) else {
                    return false;
                };
                let queued = rcv.ipc.senders.lock().dequeue(self.me());
                rcv.vcpu_update_state();
                queued
            }
            WaitQueue::Gate(g) => g.dequeue(self.me()),
        }
    }

    /// Deliver this queued sender's message to `recv`, on behalf of
    /// `recv`, and wake this sender.
    pub(crate) async fn ipc_send_msg(self: &Arc<Self>, recv: &Arc<Context>) {
        let tag = self.regs().tag;
        let ok = self.transfer_msg(tag, recv, self.ipc.send_rights());
        self.leave_wait_queue();
        recv.vcpu_update_state();

        self.regs.lock().tag = tag.with_error(!ok);

        let mut add = ThreadState::READY;
        if self.ipc.prepared() {
            add |= ThreadState::RECEIVE_WAIT;
        }
        let del = ThreadState::IPC_MASK | ThreadState::IPC_TRANSFER;
        if self.xcpu_state_change(del, add, true) {
            recv.switch_to_locked(self).await;
        }
    }

    /// The receiver this sender was queued on went away; `current` is the
    /// context running the teardown.
    pub(crate) async fn ipc_receiver_aborted(self: &Arc<Self>, current: &Arc<Context>) {
        self.ipc.set_wait_queue(WaitQueue::None);
        log::trace!(target: "kestrel::ipc", "{:?}: receiver aborted", self.me());
        let add = ThreadState::TRANSFER_FAILED | ThreadState::READY;
        if self.xcpu_state_change(ThreadState::empty(), add, true) {
            current.switch_to_locked(self).await;
        }
    }

    /// Withdraw a queued send from `partner` and report `e` if the message
    /// was not delivered yet.
    ///
    /// Returns `true` if the send was aborted, `false` if the message got
    /// through after all.
    pub(crate) async fn abort_send(self: &Arc<Self>, e: L4Error, partner: &Arc<Context>) -> bool {
        self.state_del(ThreadState::FULL_IPC_MASK);

        let abt = if matches!(self.ipc.wait_queue(), WaitQueue::Gate(_)) {
            self.leave_wait_queue();
            AbortState::Cancel
        } else {
            partner.receiver_abort_send(self, self).await
        };

        match abt {
            AbortState::Cancel => {
                self.utcb.lock().error = e;
                true
            }
            AbortState::InProgress => {
                // The receiver copies right now; wait until it is done.
                self.state_add(ThreadState::IPC_TRANSFER);
                while self.block_if(|s| s.contains(ThreadState::IPC_TRANSFER)) {
                    self.schedule().await;
                }
                false
            }
            AbortState::Done => false,
        }
    }

    /// Wait in `partner`'s sender queue for the message to be taken.
    ///
    /// Returns whether the message was delivered.
    pub(crate) async fn do_send_wait(self: &Arc<Self>, partner: &Arc<Context>, snd_t: Timeout) -> bool {
        if snd_t.is_finite() {
            let now = self.kernel().now();
            let wake = self.wake_time(snd_t, now);
            if wake == 0 || wake <= now {
                return !self.abort_send(L4Error::TIMEOUT, partner).await;
            }
            self.set_timeout(wake);
        }

        let mask = ThreadState::SEND_WAIT | ThreadState::IPC_ABORT_MASK;
        while self.block_if(|s| s & mask == ThreadState::SEND_WAIT) {
            self.schedule().await;
        }
        self.reset_timeout();

        let st = self.state() & mask;
        if st == ThreadState::TRANSFER_FAILED | ThreadState::SEND_WAIT {
            self.state_del(ThreadState::FULL_IPC_MASK);
            self.utcb.lock().error = L4Error::CANCELED;
            return false;
        }
        if st == ThreadState::CANCEL | ThreadState::SEND_WAIT {
            return !self.abort_send(L4Error::CANCELED, partner).await;
        }
        if st == ThreadState::TIMEOUT | ThreadState::SEND_WAIT {
            return !self.abort_send(L4Error::TIMEOUT, partner).await;
        }
        true
    }

    /// Send handshake with a receiver on this CPU.
    pub(crate) fn handshake_receiver(self: &Arc<Self>, partner: &Arc<Context>, snd_t: Timeout) -> CheckSender {
        match partner.check_sender(self, !snd_t.is_zero()) {
            CheckSender::Failed => CheckSender::Failed,
            CheckSender::Queued => {
                self.state_add(ThreadState::SEND_WAIT);
                CheckSender::Queued
            }
            _ => {
                partner.state_change(ThreadState::IPC_MASK | ThreadState::READY, ThreadState::IPC_TRANSFER);
                CheckSender::Ok
            }
        }
    }

    /// Send handshake with a receiver on another CPU, run there as a DRQ.
    ///
    /// A short message is copied by the receiver's CPU right away
    /// ([`CheckSender::Done`]); a message with items is left to this
    /// sender ([`CheckSender::Ok`]).
    pub(crate) async fn remote_handshake_receiver(
        self: &Arc<Self>,
        tag: MsgTag,
        partner: &Arc<Context>,
        have_receive: bool,
        snd_t: Timeout,
    ) -> CheckSender {
        self.state_add(ThreadState::SEND_WAIT);

        let result = Arc::new(AtomicU8::new(CheckSender::Failed.to_raw()));
        let (r, sender) = (result.clone(), self.clone());
        let timeout = !snd_t.is_zero();
        self.drq(
            partner,
            Box::new(move |rcv| {
                let (res, resched) = rcv.remote_ipc_send(&sender, tag, have_receive, timeout);
                r.store(res.to_raw(), Ordering::Release);
                if resched {
                    DrqResult::NEED_RESCHED
                } else {
                    DrqResult::done()
                }
            }),
            DrqWait::Wait,
        )
        .await;

        CheckSender::from_raw(result.load(Ordering::Acquire))
    }

    /// Receiver half of [`remote_handshake_receiver`], on this receiver's
    /// CPU. Returns the handshake result and whether to reschedule.
    ///
    /// [`remote_handshake_receiver`]: Context::remote_handshake_receiver
    fn remote_ipc_send(
        self: &Arc<Self>,
        sender: &Arc<Context>,
        tag: MsgTag,
        have_receive: bool,
        timeout: bool,
    ) -> (CheckSender, bool) {
        match self.check_sender(sender, timeout) {
            CheckSender::Failed => {
                sender.xcpu_state_change(ThreadState::IPC_MASK, ThreadState::empty(), false);
                return (CheckSender::Failed, false);
            }
            CheckSender::Queued => return (CheckSender::Queued, false),
            _ => {}
        }

        if tag.items() > 0 {
            sender.xcpu_state_change(ThreadState::SEND_WAIT, ThreadState::READY, false);
            self.state_change(ThreadState::IPC_MASK | ThreadState::READY, ThreadState::IPC_TRANSFER);
            return (CheckSender::Ok, true);
        }

        let ok = sender.transfer_msg(tag, self, sender.ipc.send_rights());
        if ok && have_receive {
            sender.xcpu_state_change(ThreadState::SEND_WAIT, ThreadState::RECEIVE_WAIT, false);
        } else {
            sender.xcpu_state_change(ThreadState::IPC_MASK, ThreadState::empty(), false);
        }

        self.state_change(ThreadState::IPC_MASK, ThreadState::READY);
        if let Some(cpu) = self.kernel().current_cpu() {
            if self.home_cpu() == cpu.id() && !cpu.is_current(self.me()) {
                cpu.ready_enqueue(self);
            }
        }
        (if ok { CheckSender::Done } else { CheckSender::Failed }, true)
    }
}
