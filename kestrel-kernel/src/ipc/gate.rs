//! IPC gates
//!
//! A gate is a kernel object naming a thread plus a label. Invoking a gate
//! capability runs the same rendezvous as invoking the thread itself, but
//! the receiver sees the gate's label (with the rights of the invoked
//! capability in the low bits) as the sender identity instead of the
//! sending thread.
//!
//! A gate can exist before a thread is bound to it. Senders invoking an
//! unbound gate wait on the gate (with their send timeout) until
//! [`IpcGate::bind`] wakes them.

extern crate alloc;

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use kestrel_abi::{CapRights, L4Error, Mword, SyscallFrame, Timeout};
use spin::Mutex;

use super::{IpcOp, SenderList, WaitQueue};
use super::rendezvous::IpcPhases;
use crate::context::{Context, ContextRef, ThreadState};
use crate::kernel::Kernel;

pub struct IpcGate {
    kernel: &'static Kernel,
    label: Mword,
    thread: AtomicU32,
    /// Space id of the bound thread, 0 while unbound.
    space: AtomicU32,
    waiting: Mutex<SenderList>,
}

impl IpcGate {
    /// Create an unbound gate. The low four bits of `label` are replaced
    /// by the invoker's rights on delivery.
    pub fn new(kernel: &'static Kernel, label: Mword) -> Arc<Self> {
        Arc::new(Self {
            kernel,
            label: label & !0xf,
            thread: AtomicU32::new(ContextRef::NULL.raw()),
            space: AtomicU32::new(0),
            waiting: Mutex::new(SenderList::new()),
        })
    }

    #[inline]
    pub fn label(&self) -> Mword {
        self.label
    }

    /// The bound thread, if it still exists.
    pub fn thread(&self) -> Option<Arc<Context>> {
        let r = ContextRef::from_raw(self.thread.load(Ordering::Acquire));
        self.kernel.context(r)
    }

    /// Id of the bound thread's space.
    pub fn bound_space(&self) -> Option<u32> {
        match self.space.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Bind `thread` and wake everybody waiting for a binding.
    pub fn bind(&self, thread: &Arc<Context>) {
        self.space.store(thread.space().id(), Ordering::Release);
        self.thread.store(thread.me().raw(), Ordering::Release);
        log::debug!(target: "kestrel::ipc", "gate {:#x} bound to {:?}", self.label, thread.me());
        self.unblock_all();
    }

    /// Detach the bound thread. Later invocations block again.
    pub fn unbind(&self) {
        self.thread.store(ContextRef::NULL.raw(), Ordering::Release);
        self.space.store(0, Ordering::Release);
    }

    /// Unbind, release all waiters and wait for a grace period, after
    /// which no CPU still uses the gate through a stale lookup.
    pub async fn destroy(self: &Arc<Self>, current: &Arc<Context>) {
        self.unbind();
        self.unblock_all();
        current.rcu_wait().await;
        log::debug!(target: "kestrel::ipc", "gate {:#x} destroyed", self.label);
    }

    /// Remove `ctx` from the waiters. Returns whether it was waiting.
    pub(crate) fn dequeue(&self, ctx: ContextRef) -> bool {
        self.waiting.lock().dequeue(ctx)
    }

    /// Number of senders waiting for a binding.
    pub fn waiting(&self) -> usize {
        self.waiting.lock().len()
    }

    fn unblock_all(&self) {
        loop {
            let Some(r) = self.waiting.lock().pop_first() else {
                return;
            };
            let Some(w) = self.kernel.context(r) else {
                continue;
            };
            w.ipc.set_wait_queue(WaitQueue::None);
            w.activate();
        }
    }

    /// Wait for a thread to be bound, up to `t`.
    async fn block(self: &Arc<Self>, ct: &Arc<Context>, t: Timeout) -> L4Error {
        let now = self.kernel.now();
        let wake = if t.is_never() { 0 } else { ct.wake_time(t, now) };
        if !t.is_never() && (t.is_zero() || wake <= now) {
            return L4Error::TIMEOUT;
        }

        {
            let mut q = self.waiting.lock();
            ct.ipc.set_wait_queue(WaitQueue::Gate(self.clone()));
            q.enqueue(ct.me(), ct.prio());
        }
        ct.state_change(ThreadState::READY, ThreadState::SEND_WAIT);
        if wake != 0 {
            ct.set_timeout(wake);
        }

        ct.schedule().await;

        ct.state_change(ThreadState::IPC_MASK, ThreadState::READY);
        let hit = ct.reset_timeout();
        if ct.in_sender_list() && hit {
            ct.leave_wait_queue();
            return L4Error::TIMEOUT;
        }
        L4Error::NONE
    }

    /// Invoke the gate with operation `op` on behalf of `caller`, the
    /// current context, through a capability with `rights`.
    pub async fn invoke(self: &Arc<Self>, caller: &Arc<Context>, op: IpcOp, frame: SyscallFrame, rights: CapRights) {
        caller.set_regs(frame);

        if self.thread().is_none() {
            let e = self.block(caller, frame.timeouts.snd).await;
            if e != L4Error::NONE {
                caller.commit_error(e);
                return;
            }
        }

        let thread = self.thread();
        let Some(p) = IpcPhases::new(op, thread.as_ref()) else {
            caller.commit_error(L4Error::NOT_EXISTENT);
            return;
        };

        caller.regs.lock().from = self.label | rights.bits() as Mword;
        log::trace!(target: "kestrel::ipc", "{:?}: invoke gate {:#x}", caller.me(), self.label);
        caller
            .do_ipc(frame.tag, p.partner, p.have_receive, p.sender, frame.timeouts, rights)
            .await;
    }
}

impl fmt::Debug for IpcGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcGate")
            .field("label", &format_args!("{:#x}", self.label))
            .field("thread", &ContextRef::from_raw(self.thread.load(Ordering::Relaxed)))
            .field("space", &self.space.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::boot;
    use crate::thread::ThreadConfig;
    use kestrel_abi::{MsgTag, TimeoutPair};

    #[test]
    fn test_bind_records_space() {
        let k = boot(1);
        let r = k.create_thread(ThreadConfig::new("r")).unwrap();
        let g = IpcGate::new(k, 0x5f3);
        assert_eq!(g.label(), 0x5f0);
        assert!(g.thread().is_none());
        assert_eq!(g.bound_space(), None);

        g.bind(&r);
        assert_eq!(g.thread().map(|t| t.me()), Some(r.me()));
        assert_eq!(g.bound_space(), Some(r.space().id()));

        g.unbind();
        assert!(g.thread().is_none());
    }

    #[test]
    fn test_unbound_gate_zero_timeout() {
        let k = boot(1);
        let s = k.create_thread(ThreadConfig::new("s")).unwrap();
        let g = IpcGate::new(k, 0x100);
        let frame = SyscallFrame {
            tag: MsgTag::new(1, 0, 0, 0),
            timeouts: TimeoutPair { rcv: Timeout::NEVER, snd: Timeout::ZERO },
            ..SyscallFrame::default()
        };

        let (gate, me) = (g.clone(), s.clone());
        k.spawn(&s, async move {
            gate.invoke(&me, IpcOp::SEND, frame, CapRights::W).await;
        })
        .unwrap();
        k.run_until_idle().unwrap();

        assert!(s.regs().tag.has_error());
        assert_eq!(s.utcb().error, L4Error::TIMEOUT);
        assert_eq!(g.waiting(), 0);
    }

    #[test]
    fn test_unbound_gate_past_absolute_timeout() {
        let k = boot(1);
        let s = k.create_thread(ThreadConfig::new("s")).unwrap();
        let g = IpcGate::new(k, 0x200);
        s.utcb.lock().buffers[0] = 5;
        k.advance_clock(100);
        let frame = SyscallFrame {
            tag: MsgTag::new(1, 0, 0, 0),
            timeouts: TimeoutPair { rcv: Timeout::NEVER, snd: Timeout::absolute(0) },
            ..SyscallFrame::default()
        };

        let (gate, me) = (g.clone(), s.clone());
        k.spawn(&s, async move {
            gate.invoke(&me, IpcOp::SEND, frame, CapRights::W).await;
        })
        .unwrap();
        k.run_until_idle().unwrap();

        assert_eq!(s.utcb().error, L4Error::TIMEOUT);
        assert_eq!(g.waiting(), 0);
        assert!(!s.timeout_armed());
        // The UTCB is free again.
        assert!(s.utcb.try_lock().is_some());
    }

    #[test]
    fn test_waiter_sends_once_bound() {
        let k = boot(1);
        let r = k.create_thread(ThreadConfig::new("r")).unwrap();
        let s = k.create_thread(ThreadConfig::new("s")).unwrap();
        let g = IpcGate::new(k, 0x700);
        let frame = SyscallFrame {
            tag: MsgTag::new(1, 0, 0, 0),
            timeouts: TimeoutPair::NEVER,
            ..SyscallFrame::default()
        };
        s.utcb.lock().values[0] = 42;

        let (gate, me) = (g.clone(), s.clone());
        k.spawn(&s, async move {
            gate.invoke(&me, IpcOp::SEND, frame, CapRights::W).await;
        })
        .unwrap();
        k.run_until_idle().unwrap();
        assert_eq!(g.waiting(), 1);
        assert!(s.state().contains(ThreadState::SEND_WAIT));

        let me = r.clone();
        k.spawn(&r, async move {
            me.ipc_invoke(None, IpcOp::RECV | IpcOp::OPEN_WAIT, SyscallFrame::default(), CapRights::ALL)
                .await;
        })
        .unwrap();
        k.run_until_idle().unwrap();

        {
            let _g = kestrel_arch::enter_cpu(0);
            g.bind(&r);
        }
        k.run_until_idle().unwrap();

        assert_eq!(g.waiting(), 0);
        assert!(!s.regs().tag.has_error());
        assert_eq!(r.utcb().values[0], 42);
        assert_eq!(r.regs().from, 0x700 | CapRights::W.bits() as Mword);
    }
}
