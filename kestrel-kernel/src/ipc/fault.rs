//! Page-fault and exception IPC
//!
//! Both are calls made by the kernel on behalf of the faulting context:
//!
//! - a page fault goes to the context's pager as a two-word message
//!   (fault address with the access bits, instruction pointer) and opens a
//!   receive window covering all spaces for the mapping in the reply
//! - an exception goes to the exception handler with the exception state
//!   words and the FPU state
//!
//! The UTCB fields used for the message are saved before and restored
//! after the call, so the interrupted user-level IPC state survives.

extern crate alloc;

use alloc::sync::Arc;

use kestrel_abi::{BufDesc, BufItem, CapRights, Fpage, L4Error, Label, MsgTag, Mword, TimeoutPair, MAX_WORDS};

use crate::context::{Context, ThreadState};

/// UTCB fields overwritten by a page-fault message.
struct PfUtcbSaver {
    values: [Mword; 2],
    buf_desc: BufDesc,
    buffers: [Mword; 2],
}

impl PfUtcbSaver {
    fn save(ctx: &Context) -> Self {
        let u = ctx.utcb.lock();
        Self {
            values: [u.values[0], u.values[1]],
            buf_desc: u.buf_desc,
            buffers: [u.buffers[0], u.buffers[1]],
        }
    }

    fn restore(&self, ctx: &Context) {
        let mut u = ctx.utcb.lock();
        u.values[..2].copy_from_slice(&self.values);
        u.buf_desc = self.buf_desc;
        u.buffers[..2].copy_from_slice(&self.buffers);
    }
}

/// First page-fault message word: page address with the access bits.
#[inline]
fn pf_msg_word0(pfa: Mword, error_code: Mword) -> Mword {
    (pfa & !0x7) | (error_code & 0x7)
}

impl Context {
    /// Ask the pager to resolve a page fault at `pfa` and wait for the
    /// reply.
    ///
    /// Returns whether the fault was resolved. A context without a pager
    /// sends the fault to itself and blocks until it is cancelled; sigma0
    /// without a pager cannot make progress and halts the system.
    pub async fn handle_page_fault(self: &Arc<Self>, pfa: Mword, error_code: Mword, ip: Mword) -> bool {
        let pager = match self.kernel().context(self.pager()) {
            Some(p) => p,
            None if self.is_sigma0() => {
                panic!("sigma0 {:?}: unresolvable page fault at {:#x} (ip {:#x})", self.me(), pfa, ip)
            }
            None => self.clone(),
        };
        log::trace!(target: "kestrel::ipc", "{:?}: page fault {:#x} at ip {:#x} -> {:?}", self.me(), pfa, ip, pager.me());

        let saved = PfUtcbSaver::save(self);
        let saved_regs = self.regs();
        {
            let mut u = self.utcb.lock();
            u.buf_desc = BufDesc::new(0, 0, 0, true);
            u.buffers[0] = BufItem::new(BufItem::MAP).raw();
            u.buffers[1] = Fpage::all_spaces().raw();
            u.values[0] = pf_msg_word0(pfa, error_code);
            u.values[1] = ip;
        }

        let tag = MsgTag::new(2, 0, 0, Label::PAGE_FAULT);
        self.do_ipc(tag, Some(&pager), true, Some(&pager), TimeoutPair::NEVER, CapRights::ALL)
            .await;

        let failed = self.regs().tag.has_error();
        let success = {
            let u = self.utcb.lock();
            if failed {
                // A vanished pager fails the fault; a cancelled one is retried.
                !(u.error == L4Error::NOT_EXISTENT && !self.state().contains(ThreadState::CANCEL))
            } else {
                // The pager rejects the mapping with -1 in word 0.
                u.values[0] != Mword::MAX
            }
        };

        saved.restore(self);
        self.set_regs(saved_regs);
        if !success {
            log::warn!(target: "kestrel::ipc", "{:?} ({}): page fault at {:#x} not resolved", self.me(), self.name(), pfa);
        }
        success
    }

    /// Send the exception state `words` to the exception handler and wait
    /// for the reply, which leaves the new state in the message registers.
    ///
    /// Returns whether the handler answered without error.
    pub async fn send_exception(self: &Arc<Self>, words: &[Mword]) -> bool {
        let Some(handler) = self.kernel().context(self.exc_handler()) else {
            log::warn!(target: "kestrel::ipc", "{:?}: exception without handler", self.me());
            return false;
        };

        self.state_change(ThreadState::CANCEL, ThreadState::IN_EXCEPTION);

        let n = words.len().min(MAX_WORDS);
        let saved_regs = self.regs();
        let buf_desc = {
            let mut u = self.utcb.lock();
            let buf_desc = u.buf_desc;
            u.buf_desc = BufDesc::new(0, 0, 0, true);
            u.values[..n].copy_from_slice(&words[..n]);
            buf_desc
        };

        let tag = MsgTag::new(n, 0, MsgTag::TRANSFER_FPU, Label::EXCEPTION);
        self.do_ipc(tag, Some(&handler), true, Some(&handler), TimeoutPair::NEVER, CapRights::ALL)
            .await;

        let ok = !self.regs().tag.has_error();
        self.utcb.lock().buf_desc = buf_desc;
        self.set_regs(saved_regs);
        self.state_del(ThreadState::IN_EXCEPTION);
        ok
    }
}
