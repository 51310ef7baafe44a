//! The combined send and receive operation.
//!
//! [`Context::do_ipc`] runs the send phase (handshake, transfer or
//! queueing) and then the receive phase (take the next queued sender or
//! sleep). After a successful send to a partner on the same CPU the
//! sender may hand its timeslice to the partner directly.
//!
//! # Result
//!
//! | Outcome                          | Tag               | UTCB error     |
//! |----------------------------------|-------------------|----------------|
//! | Success                          | message tag       | unchanged      |
//! | Send phase failed                | error tag         | send error     |
//! | Receive timed out                | error flag set    | `R_TIMEOUT`    |
//! | Receive cancelled                | error flag set    | `R_CANCELED`   |

extern crate alloc;

use alloc::sync::Arc;

use kestrel_abi::{CapRights, L4Error, MsgTag, SyscallFrame, Timeout, TimeoutPair};

use super::{CheckSender, IpcOp};
use crate::context::{Context, HelpingMode, Switch, ThreadState};

/// Partners of the two phases of an invocation.
pub(crate) struct IpcPhases<'a> {
    pub partner: Option<&'a Arc<Context>>,
    pub have_receive: bool,
    pub sender: Option<&'a Arc<Context>>,
}

impl<'a> IpcPhases<'a> {
    /// Resolve `op` on the invoked thread `target`. An empty `op` is a
    /// call. `None` if the operation has nothing to do.
    pub(crate) fn new(op: IpcOp, target: Option<&'a Arc<Context>>) -> Option<Self> {
        let op = if op.is_empty() { IpcOp::CALL } else { op };
        let have_receive = op.contains(IpcOp::RECV);
        let open_wait = op.contains(IpcOp::OPEN_WAIT);
        let partner = if op.contains(IpcOp::SEND) { target } else { None };
        let sender = if have_receive && !open_wait { target } else { None };

        let valid = if op.contains(IpcOp::SEND) {
            partner.is_some()
        } else {
            have_receive && (open_wait || sender.is_some())
        };
        valid.then_some(Self {
            partner,
            have_receive,
            sender,
        })
    }
}

/// Whether a completed send hands the CPU straight to its receiver.
///
/// Only a call, or a sender running on a donated timeslice, switches; a
/// sender that already has the next message queued keeps running to take
/// it.
fn direct_switch(allowed: bool, sender_queued: bool, closed_wait: bool, own_timeslice: bool) -> bool {
    allowed && !sender_queued && (closed_wait || !own_timeslice)
}

impl Context {
    /// Send `tag` to `partner` (if any), then receive from `sender`
    /// (closed wait) or from anybody (open wait) if `have_receive`.
    ///
    /// `self` is the current context. `rights` are the rights of the
    /// capability the operation was invoked through.
    pub async fn do_ipc(
        self: &Arc<Self>,
        tag: MsgTag,
        partner: Option<&Arc<Context>>,
        have_receive: bool,
        sender: Option<&Arc<Context>>,
        t: TimeoutPair,
        rights: CapRights,
    ) {
        self.regs.lock().tag = tag;
        self.ipc.set_send_rights(rights);
        self.prepare_receive(sender.map(|s| s.me()), have_receive);

        let mut do_switch = false;
        let mut activate_partner = false;

        if let Some(partner) = partner {
            let same_cpu = partner.home_cpu() == kestrel_arch::cpu_id();
            let result = if partner.is_invalid() {
                // Dead or off all CPUs: nobody would answer a DRQ.
                self.utcb.lock().error = L4Error::NOT_EXISTENT;
                CheckSender::Failed
            } else if same_cpu {
                do_switch = tag.do_switch();
                self.handshake_receiver(partner, t.snd)
            } else {
                self.remote_handshake_receiver(tag, partner, have_receive, t.snd).await
            };

            let ok = match result {
                CheckSender::Done => true,
                CheckSender::Queued => self.do_send_wait(partner, t.snd).await,
                CheckSender::Failed => {
                    self.state_del(ThreadState::IPC_MASK);
                    false
                }
                CheckSender::Ok => {
                    if same_cpu {
                        partner.reset_timeout();
                    }
                    let ok = self.transfer_msg(tag, partner, rights);
                    if ok && have_receive {
                        self.state_add(ThreadState::RECEIVE_WAIT);
                    }
                    activate_partner = partner.me() != self.me();
                    ok
                }
            };

            if !ok {
                // No receive phase after a failed send.
                self.regs.lock().tag = MsgTag::error();
                if activate_partner {
                    self.activate_ipc_partner(partner, false, false, false).await;
                }
                self.state_del(ThreadState::FULL_IPC_MASK);
                return;
            }
        } else {
            self.state_add(ThreadState::RECEIVE_WAIT);
        }

        let have_receive = self.state().contains(ThreadState::RECEIVE_WAIT);
        let next = if have_receive {
            self.get_next_sender(sender.map(|s| s.me()))
        } else {
            None
        };

        if activate_partner {
            if let Some(partner) = partner {
                let closed_wait = have_receive && sender.is_some();
                self.activate_ipc_partner(partner, do_switch, next.is_some(), closed_wait)
                    .await;
            }
        }

        if let Some(next) = next {
            self.state_change(ThreadState::IPC_MASK, ThreadState::RECEIVE_IN_PROGRESS);
            next.ipc_send_msg(self).await;
            self.state_del(ThreadState::IPC_MASK);
        } else if have_receive && self.state() & ThreadState::FULL_IPC_MASK == ThreadState::RECEIVE_WAIT {
            self.goto_sleep(t.rcv).await;
        }

        if !self.state().intersects(ThreadState::FULL_IPC_MASK) {
            return;
        }
        while self.block_if(|s| s.contains(ThreadState::IPC_TRANSFER)) {
            self.schedule().await;
        }
        if !self.state().intersects(ThreadState::FULL_IPC_MASK) {
            return;
        }

        // The receive phase did not finish: cancelled or timed out.
        let err = if self.state().contains(ThreadState::CANCEL) {
            L4Error::R_CANCELED
        } else {
            L4Error::R_TIMEOUT
        };
        {
            let mut regs = self.regs.lock();
            regs.tag = self.utcb.lock().commit_error(err, regs.tag);
        }
        if let Some(s) = sender {
            // A reply can no longer reach us.
            if s.caller().is_some_and(|c| c.ctx == self.me()) {
                s.reset_caller();
            }
        }
        log::debug!(target: "kestrel::ipc", "{:?}: receive aborted: {:?}", self.me(), err);
        self.state_del(ThreadState::FULL_IPC_MASK);
    }

    /// Make the receiver of a completed transfer ready again and, if
    /// allowed, switch to it on our timeslice. `sender_queued` is set when
    /// the receive phase already has a sender to take.
    ///
    /// Returns whether a switch was attempted.
    async fn activate_ipc_partner(
        self: &Arc<Self>,
        partner: &Arc<Context>,
        do_switch: bool,
        sender_queued: bool,
        closed_wait: bool,
    ) -> bool {
        let cpu = match self.kernel().current_cpu() {
            Some(cpu) if partner.home_cpu() == cpu.id() => cpu,
            _ => {
                partner.xcpu_state_change(ThreadState::IPC_TRANSFER, ThreadState::READY, false);
                return false;
            }
        };

        let own_timeslice = cpu.current_sched() == Some(self.me());
        let do_switch = direct_switch(do_switch, sender_queued, closed_wait, own_timeslice);
        partner.state_change(ThreadState::IPC_TRANSFER, ThreadState::READY);
        if do_switch {
            if self.switch_exec_locked(partner, HelpingMode::NotHelping).await != Switch::Ok {
                self.schedule().await;
            }
            return true;
        }
        self.deblock_and_schedule(partner).await
    }

    /// Sleep in receive wait until a sender arrives or `t` expires.
    async fn goto_sleep(self: &Arc<Self>, t: Timeout) {
        if t.is_never() {
            self.state_del(ThreadState::READY);
        } else if t.is_zero() {
            self.state_change(ThreadState::IPC_MASK, ThreadState::READY | ThreadState::TIMEOUT);
        } else {
            let now = self.kernel().now();
            let wake = self.wake_time(t, now);
            if wake > now {
                self.state_del(ThreadState::READY);
                self.set_timeout(wake);
            } else {
                self.state_change(ThreadState::IPC_MASK, ThreadState::READY | ThreadState::TIMEOUT);
            }
        }

        self.schedule().await;
        self.reset_timeout();
    }

    // -- Entry points

    /// Invoke the thread capability `target` with operation `op` on
    /// behalf of this, the current, context.
    ///
    /// `target` may only be missing for an open wait. An empty `op` is a
    /// call.
    pub async fn ipc_invoke(
        self: &Arc<Self>,
        target: Option<&Arc<Context>>,
        op: IpcOp,
        frame: SyscallFrame,
        rights: CapRights,
    ) {
        self.set_regs(frame);
        if op.contains(IpcOp::REPLY) {
            return self.reply_and_wait(op, frame).await;
        }

        let Some(p) = IpcPhases::new(op, target) else {
            self.commit_error(L4Error::NOT_EXISTENT);
            return;
        };
        self.do_ipc(frame.tag, p.partner, p.have_receive, p.sender, frame.timeouts, rights)
            .await;
    }

    /// Reply to the stored caller, then wait for the next message if `op`
    /// has a receive phase.
    async fn reply_and_wait(self: &Arc<Self>, op: IpcOp, frame: SyscallFrame) {
        let caller = self
            .caller()
            .and_then(|c| self.kernel().context(c.ctx).map(|ctx| (ctx, c.rights)));
        self.reset_caller();
        let Some((partner, rights)) = caller else {
            self.commit_error(L4Error::NOT_EXISTENT);
            return;
        };

        log::trace!(target: "kestrel::ipc", "{:?}: reply to {:?}", self.me(), partner.me());
        self.do_ipc(frame.tag, Some(&partner), op.contains(IpcOp::RECV), None, frame.timeouts, rights)
            .await;
    }

    /// Fail the current operation with `err`.
    pub(crate) fn commit_error(&self, err: L4Error) {
        let mut regs = self.regs.lock();
        regs.tag = self.utcb.lock().commit_error(err, regs.tag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_switch_only_without_queued_sender() {
        // A call switches unless the next sender is already waiting.
        assert!(direct_switch(true, false, true, true));
        assert!(!direct_switch(true, true, true, true));

        // A send on our own timeslice keeps running.
        assert!(!direct_switch(true, false, false, true));
        // On a donated timeslice it passes the CPU on.
        assert!(direct_switch(true, false, false, false));
        assert!(!direct_switch(true, true, false, false));

        // The sender asked not to switch.
        assert!(!direct_switch(false, false, true, false));
    }

    #[test]
    fn test_phases_of_operations() {
        let p = IpcPhases::new(IpcOp::RECV | IpcOp::OPEN_WAIT, None).unwrap();
        assert!(p.partner.is_none() && p.sender.is_none() && p.have_receive);

        // Nothing to send to, nobody to wait for.
        assert!(IpcPhases::new(IpcOp::SEND, None).is_none());
        assert!(IpcPhases::new(IpcOp::RECV, None).is_none());
    }
}
