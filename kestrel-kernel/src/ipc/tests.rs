//! End-to-end IPC scenarios on a booted kernel.

use super::*;

use alloc::sync::Arc;
use core::sync::atomic::AtomicUsize;

use kestrel_abi::{L4Error, Label, MsgTag, Mword, SyscallFrame, Timeout, TimeoutPair};

use crate::context::ThreadState;
use crate::kernel::tests::boot;
use crate::sched::CpuRun;
use crate::thread::ThreadConfig;

fn frame(words: usize, t: TimeoutPair) -> SyscallFrame {
    SyscallFrame::new(MsgTag::new(words, 0, 0, 0), 0, t)
}

fn open_wait() -> IpcOp {
    IpcOp::RECV | IpcOp::OPEN_WAIT
}

#[cfg(not(feature = "sched-wfq"))]
#[test]
fn test_call_and_reply() {
    let k = boot(1);
    let a = k.create_thread(ThreadConfig::new("a").prio(10)).unwrap();
    let b = k.create_thread(ThreadConfig::new("b").prio(5)).unwrap();

    let me = b.clone();
    k.spawn(&b, async move {
        me.ipc_invoke(None, open_wait(), frame(0, TimeoutPair::NEVER), CapRights::ALL).await;
    })
    .unwrap();
    k.run_until_idle().unwrap();
    assert!(b.state().contains(ThreadState::RECEIVE_WAIT));

    a.utcb().values[..3].copy_from_slice(&[1, 2, 3]);
    let (me, partner) = (a.clone(), b.clone());
    k.spawn(&a, async move {
        me.ipc_invoke(Some(&partner), IpcOp::CALL, frame(3, TimeoutPair::NEVER), CapRights::ALL)
            .await;
    })
    .unwrap();
    k.run_until_idle().unwrap();

    // B runs on A's timeslice with the message.
    assert_eq!(&b.utcb().values[..3], &[1, 2, 3]);
    assert_eq!(b.regs().tag.words(), 3);
    assert_eq!(b.caller(), Some(Caller { ctx: a.me(), rights: CapRights::ALL }));
    assert_eq!(k.cpu(0).current_sched(), Some(a.me()));

    // A gets its CPU back and sleeps in the closed wait for B.
    assert_eq!(k.yield_current(0), CpuRun::User(b.me()));
    assert!(a.state().contains(ThreadState::RECEIVE_WAIT));
    assert!(!a.state().contains(ThreadState::READY));
    assert_eq!(a.ipc.partner(), Some(b.me()));

    b.utcb().values[0] = 99;
    let me = b.clone();
    k.spawn(&b, async move {
        me.ipc_invoke(None, IpcOp::REPLY, frame(1, TimeoutPair::NEVER), CapRights::ALL)
            .await;
    })
    .unwrap();
    k.run_until_idle().unwrap();

    assert_eq!(a.utcb().values[0], 99);
    assert!(!a.regs().tag.has_error());
    assert_eq!(b.caller(), None);
    assert!(!a.state().intersects(ThreadState::FULL_IPC_MASK));
    assert_eq!(k.run_cpu(0), CpuRun::User(a.me()));
}

#[test]
fn test_reply_without_caller_fails() {
    let k = boot(1);
    let b = k.create_thread(ThreadConfig::new("b")).unwrap();
    let me = b.clone();
    k.spawn(&b, async move {
        me.ipc_invoke(None, IpcOp::REPLY, frame(0, TimeoutPair::NEVER), CapRights::ALL)
            .await;
    })
    .unwrap();
    k.run_until_idle().unwrap();
    assert!(b.regs().tag.has_error());
    assert_eq!(b.utcb().error, L4Error::NOT_EXISTENT);
}

#[test]
fn test_zero_send_timeout_to_busy_receiver() {
    let k = boot(1);
    let a = k.create_thread(ThreadConfig::new("a")).unwrap();
    let b = k.create_thread(ThreadConfig::new("b")).unwrap();

    let (me, partner) = (a.clone(), b.clone());
    let t = TimeoutPair::new(Timeout::NEVER, Timeout::ZERO);
    k.spawn(&a, async move {
        me.ipc_invoke(Some(&partner), IpcOp::SEND, frame(1, t), CapRights::ALL).await;
    })
    .unwrap();
    k.run_until_idle().unwrap();

    assert!(a.regs().tag.has_error());
    assert_eq!(a.utcb().error, L4Error::TIMEOUT);
    assert_eq!(b.ipc.queued_senders(), 0);
    assert!(!a.state().intersects(ThreadState::FULL_IPC_MASK));
}

#[test]
fn test_killed_sender_is_dequeued() {
    let k = boot(1);
    let a = k.create_thread(ThreadConfig::new("a")).unwrap();
    let b = k.create_thread(ThreadConfig::new("b")).unwrap();
    b.set_async_ipc(true);
    // B is busy with an IPC of its own: senders queue up.
    b.state_add(ThreadState::SEND_WAIT);

    let (me, partner) = (a.clone(), b.clone());
    k.spawn(&a, async move {
        me.ipc_invoke(Some(&partner), IpcOp::SEND, frame(1, TimeoutPair::NEVER), CapRights::ALL)
            .await;
    })
    .unwrap();
    k.run_until_idle().unwrap();
    assert!(b.ipc.has_sender(a.me()));
    assert!(b.ipc.irq_pending());
    assert!(a.in_sender_list());

    let r = a.me();
    {
        let _g = kestrel_arch::enter_cpu(0);
        a.kill();
    }
    k.run_until_idle().unwrap();

    assert_eq!(a.utcb().error, L4Error::CANCELED);
    assert!(a.regs().tag.has_error());
    assert_eq!(b.ipc.queued_senders(), 0);
    assert!(!b.ipc.irq_pending());
    assert!(k.context(r).is_none());
}

#[test]
fn test_killed_receiver_fails_queued_sender() {
    let k = boot(1);
    let a = k.create_thread(ThreadConfig::new("a")).unwrap();
    let b = k.create_thread(ThreadConfig::new("b")).unwrap();

    let (me, partner) = (a.clone(), b.clone());
    k.spawn(&a, async move {
        me.ipc_invoke(Some(&partner), IpcOp::SEND, frame(1, TimeoutPair::NEVER), CapRights::ALL)
            .await;
    })
    .unwrap();
    k.run_until_idle().unwrap();
    assert!(b.ipc.has_sender(a.me()));

    {
        let _g = kestrel_arch::enter_cpu(0);
        b.kill();
    }
    k.run_until_idle().unwrap();

    assert!(a.regs().tag.has_error());
    assert_eq!(a.utcb().error, L4Error::CANCELED);
    assert!(!a.in_sender_list());
    assert!(k.context(b.me()).is_none());

    // The dead receiver is gone for new senders too.
    let (me, partner) = (a.clone(), b.clone());
    k.spawn(&a, async move {
        me.ipc_invoke(Some(&partner), IpcOp::SEND, frame(1, TimeoutPair::NEVER), CapRights::ALL)
            .await;
    })
    .unwrap();
    k.run_until_idle().unwrap();
    assert_eq!(a.utcb().error, L4Error::NOT_EXISTENT);
}

#[test]
fn test_receive_timeout() {
    let k = boot(1);
    let b = k.create_thread(ThreadConfig::new("b")).unwrap();
    let t = TimeoutPair::new(Timeout::from_micros(1000), Timeout::NEVER);

    let me = b.clone();
    k.spawn(&b, async move {
        me.ipc_invoke(None, open_wait(), frame(0, t), CapRights::ALL).await;
    })
    .unwrap();
    k.run_until_idle().unwrap();
    assert!(b.state().contains(ThreadState::RECEIVE_WAIT));
    assert!(b.timeout_armed());

    k.advance_clock(5000);
    k.run_until_idle().unwrap();

    assert!(b.regs().tag.has_error());
    assert_eq!(b.utcb().error, L4Error::R_TIMEOUT);
    assert!(!b.timeout_armed());
    assert!(!b.state().intersects(ThreadState::FULL_IPC_MASK));
}

#[test]
fn test_send_timeout_expires_and_dequeues() {
    let k = boot(1);
    let a = k.create_thread(ThreadConfig::new("a")).unwrap();
    let b = k.create_thread(ThreadConfig::new("b")).unwrap();
    let t = TimeoutPair::new(Timeout::NEVER, Timeout::from_micros(1000));

    let (me, partner) = (a.clone(), b.clone());
    k.spawn(&a, async move {
        me.ipc_invoke(Some(&partner), IpcOp::SEND, frame(1, t), CapRights::ALL).await;
    })
    .unwrap();
    k.run_until_idle().unwrap();
    assert!(b.ipc.has_sender(a.me()));
    assert!(a.timeout_armed());

    k.advance_clock(5000);
    k.run_until_idle().unwrap();

    // Send phase: plain TIMEOUT, not the receive variant.
    assert!(a.regs().tag.has_error());
    assert_eq!(a.utcb().error, L4Error::TIMEOUT);
    assert!(!b.ipc.has_sender(a.me()));
    assert!(!a.in_sender_list());
    assert!(!a.timeout_armed());
    assert!(!a.state().intersects(ThreadState::FULL_IPC_MASK));
}

#[test]
fn test_zero_receive_timeout_without_sender() {
    let k = boot(1);
    let b = k.create_thread(ThreadConfig::new("b")).unwrap();
    let t = TimeoutPair::new(Timeout::ZERO, Timeout::NEVER);

    let me = b.clone();
    k.spawn(&b, async move {
        me.ipc_invoke(None, open_wait(), frame(0, t), CapRights::ALL).await;
    })
    .unwrap();
    k.run_until_idle().unwrap();

    // Failed without the clock moving.
    assert_eq!(k.now(), 0);
    assert!(b.regs().tag.has_error());
    assert_eq!(b.utcb().error, L4Error::R_TIMEOUT);
    assert!(!b.timeout_armed());
    assert!(!b.state().intersects(ThreadState::FULL_IPC_MASK));
}

#[test]
fn test_killed_cross_cpu_sender_is_dequeued() {
    let k = boot(2);
    let a = k.create_thread(ThreadConfig::new("a").on_cpu(0)).unwrap();
    let b = k.create_thread(ThreadConfig::new("b").on_cpu(1)).unwrap();

    let (me, partner) = (a.clone(), b.clone());
    k.spawn(&a, async move {
        me.ipc_invoke(Some(&partner), IpcOp::SEND, frame(1, TimeoutPair::NEVER), CapRights::ALL)
            .await;
    })
    .unwrap();
    k.run_until_idle().unwrap();
    assert!(b.ipc.has_sender(a.me()));
    assert!(a.state().contains(ThreadState::SEND_WAIT));

    // The sender unwinds on CPU 0; the queue it leaves lives on CPU 1.
    let r = a.me();
    {
        let _g = kestrel_arch::enter_cpu(0);
        a.kill();
    }
    k.run_until_idle().unwrap();

    assert_eq!(a.utcb().error, L4Error::CANCELED);
    assert!(a.regs().tag.has_error());
    assert!(!a.in_sender_list());
    assert_eq!(b.ipc.queued_senders(), 0);
    assert!(k.context(r).is_none());
    assert!(!b.drq_pending());
}

#[test]
fn test_cross_cpu_send() {
    let k = boot(2);
    let a = k.create_thread(ThreadConfig::new("a").on_cpu(0)).unwrap();
    let b = k.create_thread(ThreadConfig::new("b").on_cpu(1)).unwrap();

    let me = b.clone();
    k.spawn(&b, async move {
        me.ipc_invoke(None, open_wait(), frame(0, TimeoutPair::NEVER), CapRights::ALL).await;
    })
    .unwrap();
    k.run_until_idle().unwrap();

    a.utcb().values[..2].copy_from_slice(&[5, 6]);
    let (me, partner) = (a.clone(), b.clone());
    k.spawn(&a, async move {
        me.ipc_invoke(Some(&partner), IpcOp::SEND, frame(2, TimeoutPair::NEVER), CapRights::ALL)
            .await;
    })
    .unwrap();
    k.run_until_idle().unwrap();

    assert!(!a.regs().tag.has_error());
    assert_eq!(&b.utcb().values[..2], &[5, 6]);
    assert!(!a.state().intersects(ThreadState::FULL_IPC_MASK));
    assert!(!b.state().intersects(ThreadState::FULL_IPC_MASK));
    assert_eq!(k.run_cpu(1), CpuRun::User(b.me()));
}

#[cfg(not(feature = "sched-wfq"))]
#[test]
fn test_open_wait_serves_highest_priority_sender() {
    let k = boot(1);
    let b = k.create_thread(ThreadConfig::new("b")).unwrap();
    let lo = k.create_thread(ThreadConfig::new("lo").prio(3)).unwrap();
    let hi = k.create_thread(ThreadConfig::new("hi").prio(7)).unwrap();

    for (s, word) in [(&lo, 3), (&hi, 7)] {
        s.utcb().values[0] = word;
        let (me, partner) = (s.clone(), b.clone());
        k.spawn(s, async move {
            me.ipc_invoke(Some(&partner), IpcOp::SEND, frame(1, TimeoutPair::NEVER), CapRights::ALL)
                .await;
        })
        .unwrap();
    }
    k.run_until_idle().unwrap();
    assert_eq!(b.ipc.queued_senders(), 2);

    let me = b.clone();
    k.spawn(&b, async move {
        me.ipc_invoke(None, open_wait(), frame(0, TimeoutPair::NEVER), CapRights::ALL).await;
    })
    .unwrap();
    k.run_until_idle().unwrap();

    assert_eq!(b.utcb().values[0], 7);
    assert!(!hi.in_sender_list());
    assert!(!hi.regs().tag.has_error());
    assert!(b.ipc.has_sender(lo.me()));
}

#[cfg(not(feature = "sched-wfq"))]
#[test]
fn test_queued_sender_served_instead_of_switch() {
    let k = boot(1);
    let a = k.create_thread(ThreadConfig::new("a").prio(10)).unwrap();
    let b = k.create_thread(ThreadConfig::new("b").prio(5)).unwrap();
    let c = k.create_thread(ThreadConfig::new("c").prio(3)).unwrap();

    let me = b.clone();
    k.spawn(&b, async move {
        me.ipc_invoke(None, open_wait(), frame(0, TimeoutPair::NEVER), CapRights::ALL).await;
    })
    .unwrap();
    k.run_until_idle().unwrap();

    // C waits on A, which is not receiving yet.
    c.utcb().values[0] = 9;
    let (me, partner) = (c.clone(), a.clone());
    k.spawn(&c, async move {
        me.ipc_invoke(Some(&partner), IpcOp::SEND, frame(1, TimeoutPair::NEVER), CapRights::ALL)
            .await;
    })
    .unwrap();
    k.run_until_idle().unwrap();
    assert!(a.ipc.has_sender(c.me()));

    // Send to B and wait for anybody: C is taken at once and A keeps
    // the CPU instead of switching to B.
    a.utcb().values[0] = 7;
    let (me, partner) = (a.clone(), b.clone());
    k.spawn(&a, async move {
        let op = IpcOp::SEND | IpcOp::RECV | IpcOp::OPEN_WAIT;
        me.ipc_invoke(Some(&partner), op, frame(1, TimeoutPair::NEVER), CapRights::ALL).await;
    })
    .unwrap();
    k.run_until_idle().unwrap();

    assert_eq!(b.utcb().values[0], 7);
    assert_eq!(a.utcb().values[0], 9);
    assert!(!a.regs().tag.has_error());
    assert!(!c.regs().tag.has_error());
    assert_eq!(a.ipc.queued_senders(), 0);
    assert!(!a.state().intersects(ThreadState::FULL_IPC_MASK));
    assert!(!b.state().intersects(ThreadState::FULL_IPC_MASK));
    assert!(b.state().contains(ThreadState::READY));
    assert_eq!(k.run_cpu(0), CpuRun::User(a.me()));
}

#[test]
fn test_page_fault_rejected_by_pager() {
    let k = boot(1);
    let pager = k.create_thread(ThreadConfig::new("pager")).unwrap();
    let c = k.create_thread(ThreadConfig::new("c").pager(pager.me())).unwrap();

    let me = pager.clone();
    k.spawn(&pager, async move {
        me.ipc_invoke(None, open_wait(), frame(0, TimeoutPair::NEVER), CapRights::ALL).await;
    })
    .unwrap();
    k.run_until_idle().unwrap();

    let result = Arc::new(AtomicUsize::new(0));
    let (res, me) = (result.clone(), c.clone());
    k.spawn(&c, async move {
        let ok = me.handle_page_fault(0x4000_1234, 0x2, 0x1000).await;
        res.store(if ok { 1 } else { 2 }, Ordering::SeqCst);
    })
    .unwrap();
    k.run_until_idle().unwrap();

    let tag = pager.regs().tag;
    assert_eq!(tag.label(), Label::PAGE_FAULT);
    assert_eq!(tag.words(), 2);
    assert_eq!(pager.utcb().values[0], 0x4000_1232);
    assert_eq!(pager.utcb().values[1], 0x1000);
    assert_eq!(pager.caller().map(|c| c.ctx), Some(c.me()));

    pager.utcb().values[0] = Mword::MAX;
    let me = pager.clone();
    k.spawn(&pager, async move {
        me.ipc_invoke(None, IpcOp::REPLY, frame(1, TimeoutPair::NEVER), CapRights::ALL)
            .await;
    })
    .unwrap();
    k.run_until_idle().unwrap();

    assert_eq!(result.load(Ordering::SeqCst), 2);
    // The interrupted UTCB state is back.
    assert_eq!(c.utcb().values[0], 0);
}

#[test]
fn test_page_fault_resolved() {
    let k = boot(1);
    let pager = k.create_thread(ThreadConfig::new("pager")).unwrap();
    let c = k.create_thread(ThreadConfig::new("c").pager(pager.me())).unwrap();

    let me = pager.clone();
    k.spawn(&pager, async move {
        me.ipc_invoke(None, open_wait(), frame(0, TimeoutPair::NEVER), CapRights::ALL).await;
    })
    .unwrap();
    k.run_until_idle().unwrap();

    let result = Arc::new(AtomicUsize::new(0));
    let (res, me) = (result.clone(), c.clone());
    k.spawn(&c, async move {
        let ok = me.handle_page_fault(0x8000, 0x1, 0x2000).await;
        res.store(if ok { 1 } else { 2 }, Ordering::SeqCst);
    })
    .unwrap();
    k.run_until_idle().unwrap();

    let me = pager.clone();
    k.spawn(&pager, async move {
        me.ipc_invoke(None, IpcOp::REPLY, frame(0, TimeoutPair::NEVER), CapRights::ALL)
            .await;
    })
    .unwrap();
    k.run_until_idle().unwrap();

    assert_eq!(result.load(Ordering::SeqCst), 1);
    assert!(!c.state().intersects(ThreadState::FULL_IPC_MASK));
}

#[test]
fn test_exception_reaches_handler() {
    let k = boot(1);
    let h = k.create_thread(ThreadConfig::new("h")).unwrap();
    let c = k.create_thread(ThreadConfig::new("c").exc_handler(h.me())).unwrap();

    let me = h.clone();
    k.spawn(&h, async move {
        me.ipc_invoke(None, open_wait(), frame(0, TimeoutPair::NEVER), CapRights::ALL).await;
    })
    .unwrap();
    k.run_until_idle().unwrap();

    let result = Arc::new(AtomicUsize::new(0));
    let (res, me) = (result.clone(), c.clone());
    k.spawn(&c, async move {
        let ok = me.send_exception(&[0xd, 0xe, 0xa, 0xd]).await;
        res.store(if ok { 1 } else { 2 }, Ordering::SeqCst);
    })
    .unwrap();
    k.run_until_idle().unwrap();

    assert_eq!(h.regs().tag.label(), Label::EXCEPTION);
    assert_eq!(&h.utcb().values[..4], &[0xd, 0xe, 0xa, 0xd]);
    assert!(c.state().contains(ThreadState::IN_EXCEPTION));

    let me = h.clone();
    k.spawn(&h, async move {
        me.ipc_invoke(None, IpcOp::REPLY, frame(0, TimeoutPair::NEVER), CapRights::ALL)
            .await;
    })
    .unwrap();
    k.run_until_idle().unwrap();

    assert_eq!(result.load(Ordering::SeqCst), 1);
    assert!(!c.state().contains(ThreadState::IN_EXCEPTION));
}

#[test]
fn test_exception_without_handler() {
    let k = boot(1);
    let c = k.create_thread(ThreadConfig::new("c")).unwrap();
    let result = Arc::new(AtomicUsize::new(0));
    let (res, me) = (result.clone(), c.clone());
    k.spawn(&c, async move {
        let ok = me.send_exception(&[1]).await;
        res.store(if ok { 1 } else { 2 }, Ordering::SeqCst);
    })
    .unwrap();
    k.run_until_idle().unwrap();
    assert_eq!(result.load(Ordering::SeqCst), 2);
}
