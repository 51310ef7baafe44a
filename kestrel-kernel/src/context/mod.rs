//! Execution contexts
//!
//! A [`Context`] is the kernel's unit of scheduling and of IPC: it carries
//! the thread state word, a scheduling context, its home CPU, the helping
//! relation, a DRQ inbox, a migration slot and the IPC registers. The
//! thread-level operations (IPC roles, kill, migration) are implemented in
//! their own modules as further `impl Context` blocks.
//!
//! # Sub-modules
//!
//! - [`state`]: the atomic thread state word
//! - [`table`]: generation-checked arena of all contexts
//! - [`drq`]: deferred requests executed in the context of their target
//! - [`pending`]: per-CPU queue of contexts with remote work
//! - [`switch_lock`]: helping lock
//!
//! # Locking
//!
//! A context's fields are protected by their own spin locks. Across
//! contexts the order is: pending queue of the source CPU, pending queue of
//! the destination CPU, ready queue, scheduling context. No lock is held
//! across a suspension point.

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use kestrel_abi::{SyscallFrame, Utcb};
use kestrel_arch::INVALID_CPU;
use spin::Mutex;

use crate::cpu::Cpu;
use crate::ipc::IpcState;
use crate::kernel::Kernel;
use crate::sched::{Migration, SchedContext, SchedPolicy};
use crate::space::Space;
use crate::task::TaskContext;
use crate::timeout::IpcTimeout;

pub mod drq;
pub mod pending;
pub mod state;
pub mod switch_lock;
pub mod table;

pub use drq::{Drq, DrqFn, DrqResult, DrqWait};
pub use pending::PendingRqq;
pub use state::ThreadState;
pub use switch_lock::SwitchLock;
pub use table::{ContextRef, ContextTable};

use pending::RemoteStateChange;
use state::StateWord;

/// How a direct switch affects the helping relation of its target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HelpingMode {
    /// The target runs on behalf of the switching context.
    Helping,
    /// The target runs for itself.
    NotHelping,
    /// Leave the relation unchanged.
    IgnoreHelping,
}

/// Result of a switch attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Switch {
    Ok,
    /// The target is running elsewhere or not ready.
    Failed,
    /// A pending request for the target needs another scheduling pass.
    Resched,
}

/// Simulated FPU register file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FpuState {
    pub regs: [u64; 8],
}

/// Parameters of a new context.
pub(crate) struct ContextInit {
    pub name: &'static str,
    pub space: Arc<Space>,
    pub sched: SchedContext,
    pub home_cpu: usize,
    pub state: ThreadState,
    pub pager: ContextRef,
    pub exc_handler: ContextRef,
    pub sigma0: bool,
    pub is_kernel: bool,
}

pub struct Context {
    me: ContextRef,
    this: Weak<Context>,
    kernel: &'static Kernel,
    name: &'static str,
    is_kernel: bool,
    sigma0: bool,

    state: StateWord,
    home_cpu: AtomicUsize,
    running_on: AtomicUsize,
    woken: AtomicBool,

    pub(crate) sched: Mutex<SchedContext>,
    helper: AtomicU32,
    donatee: AtomicU32,
    lock_cnt: AtomicU32,

    pub(crate) drq_q: Mutex<VecDeque<Arc<Drq>>>,
    pub(crate) pending_queued: AtomicBool,
    pub(crate) remote: Mutex<RemoteStateChange>,
    pub(crate) migration: Mutex<Option<Arc<Migration>>>,
    pub(crate) timeout: Mutex<Option<IpcTimeout>>,
    pub(crate) work: Mutex<TaskContext>,

    pub(crate) ipc: IpcState,
    pub(crate) utcb: Mutex<Utcb>,
    pub(crate) regs: Mutex<SyscallFrame>,
    pub(crate) fpu: Mutex<FpuState>,
    space: Arc<Space>,
    pager: AtomicU32,
    exc_handler: AtomicU32,
    pub(crate) thread_lock: SwitchLock,
}

impl Context {
    pub(crate) fn new(kernel: &'static Kernel, me: ContextRef, this: Weak<Context>, init: ContextInit) -> Self {
        Self {
            me,
            this,
            kernel,
            name: init.name,
            is_kernel: init.is_kernel,
            sigma0: init.sigma0,
            state: StateWord::new(init.state),
            home_cpu: AtomicUsize::new(init.home_cpu),
            running_on: AtomicUsize::new(INVALID_CPU),
            woken: AtomicBool::new(false),
            sched: Mutex::new(init.sched),
            helper: AtomicU32::new(me.raw()),
            donatee: AtomicU32::new(ContextRef::NULL.raw()),
            lock_cnt: AtomicU32::new(0),
            drq_q: Mutex::new(VecDeque::new()),
            pending_queued: AtomicBool::new(false),
            remote: Mutex::new(RemoteStateChange::new()),
            migration: Mutex::new(None),
            timeout: Mutex::new(None),
            work: Mutex::new(TaskContext::new()),
            ipc: IpcState::new(),
            utcb: Mutex::new(Utcb::new()),
            regs: Mutex::new(SyscallFrame::default()),
            fpu: Mutex::new(FpuState::default()),
            space: init.space,
            pager: AtomicU32::new(init.pager.raw()),
            exc_handler: AtomicU32::new(init.exc_handler.raw()),
            thread_lock: SwitchLock::new(),
        }
    }

    // -- Identity

    #[inline]
    pub fn me(&self) -> ContextRef {
        self.me
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn kernel(&self) -> &'static Kernel {
        self.kernel
    }

    /// Strong reference to this context, `None` while it is being dropped.
    #[inline]
    pub fn arc(&self) -> Option<Arc<Context>> {
        self.this.upgrade()
    }

    /// Whether this is the kernel (idle) context of a CPU.
    #[inline]
    pub fn is_kernel_context(&self) -> bool {
        self.is_kernel
    }

    #[inline]
    pub fn is_sigma0(&self) -> bool {
        self.sigma0
    }

    #[inline]
    pub fn space(&self) -> &Arc<Space> {
        &self.space
    }

    pub fn pager(&self) -> ContextRef {
        ContextRef::from_raw(self.pager.load(Ordering::Acquire))
    }

    pub fn set_pager(&self, pager: ContextRef) {
        self.pager.store(pager.raw(), Ordering::Release);
    }

    pub fn exc_handler(&self) -> ContextRef {
        ContextRef::from_raw(self.exc_handler.load(Ordering::Acquire))
    }

    pub fn set_exc_handler(&self, handler: ContextRef) {
        self.exc_handler.store(handler.raw(), Ordering::Release);
    }

    // -- State word

    #[inline]
    pub fn state(&self) -> ThreadState {
        self.state.get()
    }

    #[inline]
    pub fn state_add(&self, bits: ThreadState) {
        self.state.add(bits);
    }

    #[inline]
    pub fn state_del(&self, bits: ThreadState) {
        self.state.del(bits);
    }

    /// Clear `del` and set `add` atomically; returns the previous state.
    #[inline]
    pub fn state_change(&self, del: ThreadState, add: ThreadState) -> ThreadState {
        self.state.change(del, add)
    }

    /// Clear `del` and set `add`, but only if all of `del` is still set.
    #[inline]
    pub fn state_change_safely(&self, del: ThreadState, add: ThreadState) -> bool {
        self.state.change_safely(del, add)
    }

    /// Clear the ready bit if `cond` holds for the current state.
    ///
    /// Wait loops use this instead of a separate test and clear, so a
    /// wake-up that lands between the two is never lost.
    pub fn block_if(&self, cond: impl Fn(ThreadState) -> bool) -> bool {
        self.state
            .update(|s| cond(s).then(|| s - ThreadState::READY))
            .is_some()
    }

    pub(crate) fn apply_state(&self, keep: ThreadState, add: ThreadState) {
        let _ = self.state.update(|s| Some((s & keep) | add));
    }

    // -- CPU affinity

    #[inline]
    pub fn home_cpu(&self) -> usize {
        self.home_cpu.load(Ordering::Acquire)
    }

    pub(crate) fn store_home_cpu(&self, cpu: usize) {
        self.home_cpu.store(cpu, Ordering::Release);
    }

    /// CPU this context is current on, [`INVALID_CPU`] if none.
    #[inline]
    pub fn running_on(&self) -> usize {
        self.running_on.load(Ordering::Acquire)
    }

    pub(crate) fn set_running_on(&self, cpu: usize) {
        self.running_on.store(cpu, Ordering::Release);
    }

    /// The home CPU, if it exists.
    pub(crate) fn home(&self) -> Option<&'static Cpu> {
        self.kernel.try_cpu(self.home_cpu())
    }

    /// Whether the calling CPU is this context's home.
    #[inline]
    pub fn on_home_cpu(&self) -> bool {
        self.home_cpu() == kestrel_arch::cpu_id()
    }

    // -- Waker

    pub(crate) fn mark_woken(&self) {
        self.woken.store(true, Ordering::Release);
    }

    pub(crate) fn take_woken(&self) -> bool {
        self.woken.swap(false, Ordering::AcqRel)
    }

    // -- Scheduling context

    /// Copy of the scheduling context.
    pub fn sched(&self) -> SchedContext {
        *self.sched.lock()
    }

    /// Priority used to order this context as an IPC sender.
    pub fn prio(&self) -> u8 {
        self.sched.lock().prio()
    }

    // -- Helping

    pub fn helper(&self) -> ContextRef {
        ContextRef::from_raw(self.helper.load(Ordering::Acquire))
    }

    pub(crate) fn set_helper(&self, mode: HelpingMode, current: ContextRef) {
        match mode {
            HelpingMode::Helping => self.helper.store(current.raw(), Ordering::Release),
            HelpingMode::NotHelping => self.helper.store(self.me.raw(), Ordering::Release),
            HelpingMode::IgnoreHelping => {}
        }
    }

    pub fn donatee(&self) -> ContextRef {
        ContextRef::from_raw(self.donatee.load(Ordering::Acquire))
    }

    pub(crate) fn store_donatee(&self, r: ContextRef) {
        self.donatee.store(r.raw(), Ordering::Release);
    }

    /// Number of switch locks held.
    pub fn lock_cnt(&self) -> u32 {
        self.lock_cnt.load(Ordering::Acquire)
    }

    pub(crate) fn inc_lock_cnt(&self) {
        self.lock_cnt.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_lock_cnt(&self) {
        self.lock_cnt.fetch_sub(1, Ordering::AcqRel);
    }

    // -- Kernel work

    /// Whether kernel work is installed.
    pub fn has_kernel_work(&self) -> bool {
        self.work.lock().has_pending_work()
    }

    // -- Registers

    pub fn utcb(&self) -> spin::MutexGuard<'_, Utcb> {
        self.utcb.lock()
    }

    pub fn regs(&self) -> SyscallFrame {
        *self.regs.lock()
    }

    pub fn set_regs(&self, frame: SyscallFrame) {
        *self.regs.lock() = frame;
    }

    pub fn fpu(&self) -> FpuState {
        *self.fpu.lock()
    }

    pub fn set_fpu(&self, fpu: FpuState) {
        *self.fpu.lock() = fpu;
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("me", &self.me)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("home_cpu", &self.home_cpu())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::boot;
    use crate::thread::ThreadConfig;

    #[test]
    fn test_block_if_only_when_condition_holds() {
        let k = boot(1);
        let t = k.create_thread(ThreadConfig::new("t")).unwrap();
        t.state_add(ThreadState::READY | ThreadState::SEND_WAIT);
        assert!(!t.block_if(|s| s.contains(ThreadState::RECEIVE_WAIT)));
        assert!(t.state().contains(ThreadState::READY));
        assert!(t.block_if(|s| s.contains(ThreadState::SEND_WAIT)));
        assert!(!t.state().contains(ThreadState::READY));
    }

    #[test]
    fn test_helper_modes() {
        let k = boot(1);
        let a = k.create_thread(ThreadConfig::new("a")).unwrap();
        let b = k.create_thread(ThreadConfig::new("b")).unwrap();
        assert_eq!(b.helper(), b.me());
        b.set_helper(HelpingMode::Helping, a.me());
        assert_eq!(b.helper(), a.me());
        b.set_helper(HelpingMode::IgnoreHelping, ContextRef::NULL);
        assert_eq!(b.helper(), a.me());
        b.set_helper(HelpingMode::NotHelping, a.me());
        assert_eq!(b.helper(), b.me());
    }
}
