//! The kernel instance
//!
//! [`Kernel`] owns everything that exists once per boot: the CPUs, the
//! context table, the RCU state, the IPI mailbox and the clock. It is
//! leaked at boot and handed around as `&'static Kernel`, which is what
//! every context keeps a reference to.
//!
//! # Driving the kernel
//!
//! The kernel does not run by itself. A host thread calls
//! [`run_cpu`](Kernel::run_cpu) to act as one CPU until it has nothing left
//! to do for the moment, or [`run_until_idle`](Kernel::run_until_idle) to
//! step all CPUs round robin on the calling thread until the whole system
//! settles. The latter is what tests use: with the manual clock the
//! outcome is fully deterministic.

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::future::Future;

use kestrel_arch::IpiMailbox;

use crate::clock::Clock;
use crate::config::{KernelConfig, DISPATCH_ROUND_LIMIT, IDLE_ROUND_LIMIT};
use crate::context::{pending, Context, ContextInit, ContextRef, ContextTable, Drq, DrqFn, ThreadState};
use crate::cpu::Cpu;
use crate::error::{KernelError, KernelResult};
use crate::rcu::Rcu;
use crate::sched::dispatch::{dispatch_step, end_timeslice};
use crate::sched::{CpuRun, SchedContext, SchedPolicy};
use crate::space::Space;
use crate::thread::ThreadConfig;

pub struct Kernel {
    config: KernelConfig,
    clock: Clock,
    cpus: Vec<Cpu>,
    contexts: ContextTable,
    rcu: Rcu,
    ipi: IpiMailbox,
}

impl Kernel {
    /// Boot a kernel: bring up `config.num_cpus` CPUs, each running its
    /// kernel context.
    pub fn boot(config: KernelConfig) -> KernelResult<&'static Kernel> {
        config.validate()?;
        crate::logging::init(config.log_level);

        let kernel: &'static Kernel = Box::leak(Box::new(Kernel {
            config,
            clock: Clock::new(config.clock),
            cpus: (0..config.num_cpus).map(Cpu::new).collect(),
            contexts: ContextTable::new(),
            rcu: Rcu::new(config.num_cpus),
            ipi: IpiMailbox::new(),
        }));

        for cpu in &kernel.cpus {
            kernel.boot_cpu(cpu)?;
        }
        log::info!("kestrel: {} cpu(s) online, timeslice {} us", config.num_cpus, config.timeslice_us);
        Ok(kernel)
    }

    fn boot_cpu(&'static self, cpu: &Cpu) -> KernelResult<()> {
        let init = ContextInit {
            name: "kernel",
            space: Space::new(),
            sched: SchedContext::idle(self.config.timeslice_us),
            home_cpu: cpu.id(),
            state: ThreadState::READY,
            pager: ContextRef::NULL,
            exc_handler: ContextRef::NULL,
            sigma0: false,
            is_kernel: true,
        };
        let kc = self.insert_context(init)?;

        cpu.rq.lock().set_idle(kc.me(), &kc.sched());
        cpu.set_kernel_context(kc.clone());
        cpu.set_current(Some(kc.clone()));
        kc.set_running_on(cpu.id());
        self.rcu.leave_idle(cpu.id());
        log::debug!(target: "kestrel::sched", "cpu {}: kernel context {:?}", cpu.id(), kc.me());
        Ok(())
    }

    fn insert_context(&'static self, init: ContextInit) -> KernelResult<Arc<Context>> {
        self.contexts
            .insert(|me| Arc::new_cyclic(|this| Context::new(self, me, this.clone(), init)))
    }

    // -- Accessors

    #[inline]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    #[inline]
    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    /// CPU `n`.
    ///
    /// # Panics
    ///
    /// If `n` is not below [`num_cpus`](Self::num_cpus).
    #[inline]
    pub fn cpu(&self, n: usize) -> &Cpu {
        &self.cpus[n]
    }

    #[inline]
    pub fn try_cpu(&self, n: usize) -> Option<&Cpu> {
        self.cpus.get(n)
    }

    /// The CPU the calling host thread currently acts as.
    #[inline]
    pub fn current_cpu(&self) -> Option<&Cpu> {
        self.try_cpu(kestrel_arch::cpu_id())
    }

    /// Resolve a context handle.
    #[inline]
    pub fn context(&self, r: ContextRef) -> Option<Arc<Context>> {
        self.contexts.get(r)
    }

    /// Number of live contexts, kernel contexts included.
    pub fn num_contexts(&self) -> usize {
        self.contexts.len()
    }

    /// Drop the table entry of a dead context.
    pub(crate) fn release_context(&self, r: ContextRef) -> KernelResult<Arc<Context>> {
        let ctx = self.contexts.remove(r)?;
        log::debug!(target: "kestrel::sched", "released {:?} ({})", r, ctx.name());
        Ok(ctx)
    }

    #[inline]
    pub fn ipi(&self) -> &IpiMailbox {
        &self.ipi
    }

    #[inline]
    pub fn rcu(&self) -> &Rcu {
        &self.rcu
    }

    /// Current time in microseconds.
    #[inline]
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    // -- Contexts

    /// Create a thread. It starts blocked, with no state bits set; use
    /// [`Context::activate`] or [`spawn`](Self::spawn) to run it.
    pub fn create_thread(&'static self, cfg: ThreadConfig) -> KernelResult<Arc<Context>> {
        let cpu = self.try_cpu(cfg.cpu).ok_or(KernelError::EInval)?;
        if !cpu.is_online() {
            return Err(KernelError::EBusy);
        }

        let quantum = self.config.timeslice_us;
        let mut sched = SchedContext::new(quantum);
        sched.set(&cfg.params, quantum)?;
        sched.replenish();

        let init = ContextInit {
            name: cfg.name,
            space: cfg.space.unwrap_or_else(Space::new),
            sched,
            home_cpu: cfg.cpu,
            state: ThreadState::empty(),
            pager: cfg.pager,
            exc_handler: cfg.exc_handler,
            sigma0: cfg.sigma0,
            is_kernel: false,
        };
        let ctx = self.insert_context(init)?;
        log::debug!(target: "kestrel::sched", "created {:?} ({}) on cpu {}", ctx.me(), cfg.name, cfg.cpu);
        Ok(ctx)
    }

    /// Enter the kernel on behalf of `ctx`: install `work` as its kernel
    /// work and make it ready.
    pub fn spawn<F>(&self, ctx: &Arc<Context>, work: F) -> KernelResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        {
            let mut task = ctx.work.lock();
            if task.has_pending_work() && !task.has_exit_work() {
                return Err(KernelError::EBusy);
            }
            task.put_kernel_work(Box::pin(work));
        }
        ctx.activate();
        Ok(())
    }

    /// Post `func` to `ctx` without waiting for it.
    pub fn post_drq(&self, ctx: &Arc<Context>, func: DrqFn) -> bool {
        ctx.enqueue_drq(Arc::new(Drq::new(ContextRef::NULL, func)))
    }

    // -- Driving

    /// Act as CPU `n` until it runs user code, goes idle or the round
    /// limit is reached.
    pub fn run_cpu(&'static self, n: usize) -> CpuRun {
        let Some(cpu) = self.try_cpu(n) else {
            return CpuRun::Offline;
        };
        let mut run = CpuRun::Busy;
        for _ in 0..DISPATCH_ROUND_LIMIT {
            run = dispatch_step(self, cpu);
            if run != CpuRun::Busy {
                break;
            }
        }
        run
    }

    /// Step all CPUs until none has work or events left.
    ///
    /// Outstanding RCU callbacks keep the system going: every CPU gets a
    /// timer tick so grace periods can complete.
    pub fn run_until_idle(&'static self) -> KernelResult<()> {
        for _ in 0..IDLE_ROUND_LIMIT {
            let mut busy = false;
            for cpu in &self.cpus {
                busy |= self.run_cpu(cpu.id()) == CpuRun::Busy;
            }
            // A CPU stepped late in the round may have posted to an earlier one.
            if busy || self.cpus.iter().any(|c| self.has_events(c)) {
                continue;
            }
            if !self.rcu.has_pending_work() {
                return Ok(());
            }
            for cpu in self.cpus.iter().filter(|c| c.is_online()) {
                cpu.raise_timer_irq();
            }
        }
        log::warn!("kestrel: system did not settle after {} rounds", IDLE_ROUND_LIMIT);
        Err(KernelError::EBusy)
    }

    fn has_events(&self, cpu: &Cpu) -> bool {
        if !cpu.is_online() {
            return false;
        }
        let now = self.now();
        !self.ipi.pending(cpu.id()).is_empty()
            || !cpu.pending.lock().is_empty()
            || cpu.need_resched()
            || cpu.has_pending_switch()
            || cpu.timeouts.lock().next_wake().is_some_and(|w| w <= now)
            || cpu.rq.lock().timeslice_expired(now)
    }

    /// Move the manual clock forward. Returns the new time.
    pub fn advance_clock(&self, us: u64) -> u64 {
        self.clock.advance(us)
    }

    /// Deliver a timer interrupt to CPU `n` and run it.
    pub fn tick(&'static self, n: usize) -> CpuRun {
        let Some(cpu) = self.try_cpu(n) else {
            return CpuRun::Offline;
        };
        cpu.raise_timer_irq();
        self.run_cpu(n)
    }

    /// End the current timeslice of CPU `n` early and run it.
    pub fn yield_current(&'static self, n: usize) -> CpuRun {
        let Some(cpu) = self.try_cpu(n) else {
            return CpuRun::Offline;
        };
        {
            let _on_cpu = kestrel_arch::enter_cpu(n);
            end_timeslice(self, cpu);
            cpu.set_need_resched();
        }
        self.run_cpu(n)
    }

    // -- CPU hotplug

    /// Take CPU `n` offline. Its RCU callbacks move to another online CPU;
    /// requests for contexts homed there run in line from then on.
    pub fn set_cpu_offline(&'static self, n: usize) -> KernelResult<()> {
        let cpu = self.try_cpu(n).ok_or(KernelError::EInval)?;
        if !cpu.is_online() {
            return Ok(());
        }
        let to = (0..self.num_cpus())
            .find(|&c| c != n && self.cpus[c].is_online())
            .ok_or(KernelError::EBusy)?;

        {
            let _on_cpu = kestrel_arch::enter_cpu(n);
            let _ = self.ipi.take(n);
            pending::handle_requests(self, cpu);
        }
        cpu.set_online(false);
        self.rcu.take_cpu_offline(n, to);
        log::info!("kestrel: cpu {} offline", n);
        Ok(())
    }

    pub fn set_cpu_online(&'static self, n: usize) -> KernelResult<()> {
        let cpu = self.try_cpu(n).ok_or(KernelError::EInval)?;
        if cpu.is_online() {
            return Ok(());
        }
        cpu.set_online(true);
        self.rcu.take_cpu_online(n);
        cpu.set_need_resched();
        log::info!("kestrel: cpu {} online", n);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use log::LevelFilter;

    /// A fresh kernel with `n` CPUs and the manual clock.
    pub(crate) fn boot(n: usize) -> &'static Kernel {
        crate::logging::disable_console();
        Kernel::boot(KernelConfig::default().with_cpus(n).with_log_level(LevelFilter::Warn)).unwrap()
    }

    #[test]
    fn test_boot_rejects_bad_config() {
        assert_eq!(
            Kernel::boot(KernelConfig::default().with_cpus(0)).err(),
            Some(KernelError::EInval)
        );
    }

    #[test]
    fn test_boot_installs_kernel_contexts() {
        let k = boot(3);
        assert_eq!(k.num_cpus(), 3);
        assert_eq!(k.num_contexts(), 3);
        for n in 0..3 {
            let kc = k.cpu(n).kernel_context().unwrap();
            assert!(kc.is_kernel_context());
            assert_eq!(kc.home_cpu(), n);
            assert!(k.cpu(n).is_current(kc.me()));
        }
    }

    #[test]
    fn test_create_thread_on_missing_cpu() {
        let k = boot(1);
        assert_eq!(
            k.create_thread(ThreadConfig::new("t").on_cpu(2)).err(),
            Some(KernelError::EInval)
        );
    }

    #[test]
    fn test_spawn_twice_is_busy() {
        let k = boot(1);
        let t = k.create_thread(ThreadConfig::new("t")).unwrap();
        k.spawn(&t, async {}).unwrap();
        assert_eq!(k.spawn(&t, async {}), Err(KernelError::EBusy));
        k.run_until_idle().unwrap();
        assert!(!t.has_kernel_work());
        assert!(k.spawn(&t, async {}).is_ok());
    }

    #[test]
    fn test_offline_cpu_refuses_threads() {
        let k = boot(2);
        k.run_until_idle().unwrap();
        k.set_cpu_offline(1).unwrap();
        assert_eq!(k.run_cpu(1), CpuRun::Offline);
        assert_eq!(
            k.create_thread(ThreadConfig::new("t").on_cpu(1)).err(),
            Some(KernelError::EBusy)
        );
        // The last online CPU stays.
        assert_eq!(k.set_cpu_offline(0), Err(KernelError::EBusy));

        k.set_cpu_online(1).unwrap();
        assert!(k.create_thread(ThreadConfig::new("t").on_cpu(1)).is_ok());
    }

    #[test]
    fn test_settles_after_post_to_earlier_cpu() {
        use crate::context::{DrqResult, DrqWait};
        use core::sync::atomic::{AtomicBool, Ordering};

        let k = boot(2);
        let a = k.create_thread(ThreadConfig::new("a").on_cpu(0)).unwrap();
        let b = k.create_thread(ThreadConfig::new("b").on_cpu(1)).unwrap();
        let ran = Arc::new(AtomicBool::new(false));

        // CPU 1 is stepped after CPU 0 and posts back to it in the
        // last busy round.
        let (r, me, target) = (ran.clone(), b.clone(), a.clone());
        k.spawn(&b, async move {
            me.drq(&target, Box::new(move |ctx| {
                assert_eq!(ctx.home_cpu(), 0);
                r.store(true, Ordering::SeqCst);
                DrqResult::done()
            }), DrqWait::NoWait).await;
        }).unwrap();

        k.run_until_idle().unwrap();
        assert!(ran.load(Ordering::SeqCst));
        assert!(!a.drq_pending());
        assert!(!b.drq_pending());
        assert!(k.ipi().pending(0).is_empty());
    }

    #[test]
    fn test_tick_and_yield_keep_single_thread_running() {
        let k = boot(1);
        let t = k.create_thread(ThreadConfig::new("t")).unwrap();
        t.activate();
        k.run_until_idle().unwrap();
        assert_eq!(k.tick(0), CpuRun::User(t.me()));
        assert_eq!(k.yield_current(0), CpuRun::User(t.me()));
    }
}
