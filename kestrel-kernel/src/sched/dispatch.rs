//! CPU dispatch loop
//!
//! This is the core of the execution model. A context's kernel activity
//! is a future; the dispatcher of a CPU decides which context is current
//! and polls the current context's work.
//!
//! # Flow
//!
//! One dispatch step:
//!
//! 1. Handle events: request and reschedule IPIs, the timer interrupt
//!    (expired timeouts, end of the current timeslice, RCU work)
//! 2. Pick a context if a reschedule or a direct switch is due
//! 3. Poll the current context's kernel work:
//!    - `Poll::Pending`: the work reached a suspension point; the step
//!      ends and the CPU stays busy
//!    - `Poll::Ready`: look for further work (the exit continuation)
//! 4. No work left: the context returns to user mode, or the CPU goes
//!    idle if its kernel context is current
//!
//! A context in user mode keeps the CPU until an event makes the
//! dispatcher pick again; equal priorities do not preempt each other
//! before the timeslice ends.

extern crate alloc;

use alloc::sync::Arc;
use core::task::{Context as TaskCx, Poll};

use kestrel_arch::{Ipi, INVALID_CPU};

use crate::context::pending;
use crate::context::{Context, ContextRef, Switch, ThreadState};
use crate::cpu::Cpu;
use crate::kernel::Kernel;
use crate::sched::SchedPolicy;
use crate::task::waker::create_waker;
use crate::timeout::TimeoutKind;

/// Outcome of running a CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuRun {
    /// The kernel context is current and nothing is left to do.
    Idle,
    /// The context returned to user mode.
    User(ContextRef),
    /// Kernel work is in progress.
    Busy,
    Offline,
}

/// State machine for the dispatch loop.
enum State {
    /// Pick the context to run.
    PickNewContext,
    /// Poll the current context's kernel work.
    ProcessWork,
    /// Return to user mode or idle.
    ReturnToUser,
}

/// Upper bound of RCU rounds the kernel context runs before going idle.
const IDLE_RCU_ROUNDS: usize = 8;

/// Run one dispatch step on `cpu`.
pub(crate) fn dispatch_step(kernel: &'static Kernel, cpu: &Cpu) -> CpuRun {
    if !cpu.is_online() {
        return CpuRun::Offline;
    }
    let _on_cpu = kestrel_arch::enter_cpu(cpu.id());

    handle_events(kernel, cpu);

    let mut state = if cpu.need_resched() || cpu.has_pending_switch() || cpu.current_context().is_none() {
        State::PickNewContext
    } else {
        State::ProcessWork
    };

    loop {
        match state {
            State::PickNewContext => {
                pick(kernel, cpu);
                state = State::ProcessWork;
            }

            State::ProcessWork => {
                let Some(cur) = cpu.current_context() else {
                    state = State::PickNewContext;
                    continue;
                };
                if !cur.state().intersects(ThreadState::READY_MASK) {
                    state = State::PickNewContext;
                    continue;
                }

                let work = cur.work.lock().take_next();
                let Some(mut work) = work else {
                    state = State::ReturnToUser;
                    continue;
                };

                let waker = create_waker(&cur);
                let mut cx = TaskCx::from_waker(&waker);
                match work.as_mut().poll(&mut cx) {
                    Poll::Ready(()) => {
                        // Look for more work (the exit continuation).
                        state = State::ProcessWork;
                    }
                    Poll::Pending => {
                        if cur.home_cpu() == INVALID_CPU && cur.state().contains(ThreadState::DEAD) {
                            // Off all CPUs for good: never resumed.
                            drop(work);
                        } else {
                            cur.work.lock().put_back(work);
                        }
                        if !cur.take_woken() {
                            log::warn!(target: "kestrel::sched", "{:?} pending without a suspension point", cur.me());
                        }
                        return CpuRun::Busy;
                    }
                }
            }

            State::ReturnToUser => {
                if cpu.need_resched() || cpu.has_pending_switch() {
                    state = State::PickNewContext;
                    continue;
                }
                let Some(cur) = cpu.current_context() else {
                    return CpuRun::Idle;
                };
                if !cur.is_kernel_context() {
                    return CpuRun::User(cur.me());
                }

                let rcu = kernel.rcu();
                for _ in 0..IDLE_RCU_ROUNDS {
                    if !rcu.pending(cpu.id()) {
                        break;
                    }
                    if rcu.do_pending_work(cpu.id()) {
                        cpu.set_need_resched();
                    }
                }
                if cpu.need_resched() {
                    state = State::PickNewContext;
                    continue;
                }
                if rcu.idle(cpu.id()) {
                    rcu.enter_idle(cpu.id());
                } else {
                    cpu.arm_rcu_timeout(kernel.now());
                }
                return CpuRun::Idle;
            }
        }
    }
}

// -- Events

fn handle_events(kernel: &'static Kernel, cpu: &Cpu) {
    let ipis = kernel.ipi().take(cpu.id());
    if ipis.contains(Ipi::Request) || ipis.contains(Ipi::GlobalRequest) || !cpu.pending.lock().is_empty() {
        handle_remote_requests_irq(kernel, cpu);
    }
    if ipis.contains(Ipi::Reschedule) {
        cpu.set_need_resched();
    }

    let now = kernel.now();
    let timer = cpu.take_timer_irq()
        || cpu.timeouts.lock().next_wake().is_some_and(|w| w <= now)
        || cpu.rq.lock().timeslice_expired(now);
    if timer {
        handle_timer_interrupt(kernel, cpu, now);
    }
}

/// Drain the pending-request queue, then do RCU work, migrate the current
/// context if it asked for it and handle its DRQs.
fn handle_remote_requests_irq(kernel: &'static Kernel, cpu: &Cpu) {
    let (mut resched, migrate_current) = pending::handle_requests(kernel, cpu);
    resched |= kernel.rcu().do_pending_work(cpu.id());

    if let Some(c) = migrate_current {
        resched |= c.do_migration();
    }

    let cur = cpu.current_context();
    if let Some(c) = &cur {
        if c.on_home_cpu() && c.drq_pending() {
            resched |= c.handle_drq();
        }
    }

    let in_progress = cpu.rq.lock().schedule_in_progress.take();
    if in_progress.is_some() {
        if let Some(c) = &cur {
            c.update_ready_list();
        }
        cpu.set_need_resched();
    } else if resched {
        cpu.set_need_resched();
    }
}

fn handle_timer_interrupt(kernel: &'static Kernel, cpu: &Cpu, now: u64) {
    let mut resched = kernel.rcu().do_pending_work(cpu.id());
    resched |= do_timeouts(kernel, cpu, now);

    if cpu.rq.lock().timeslice_expired(now) {
        end_timeslice(kernel, cpu);
        resched = true;
    }
    if resched {
        cpu.set_need_resched();
    }
}

fn do_timeouts(kernel: &'static Kernel, cpu: &Cpu, now: u64) -> bool {
    let mut resched = false;
    loop {
        let next = cpu.timeouts.lock().pop_expired(now);
        let Some((id, kind)) = next else {
            return resched;
        };
        match kind {
            TimeoutKind::Ipc(r) => {
                if let Some(ctx) = kernel.context(r) {
                    resched |= ctx.ipc_timeout_expired(id, cpu);
                }
            }
            TimeoutKind::Rcu => {
                cpu.rcu_timeout_fired();
                resched |= kernel.rcu().process_callbacks(cpu.id());
            }
        }
    }
}

/// Replenish the current timeslice and move its owner behind its equals.
pub(crate) fn end_timeslice(kernel: &Kernel, cpu: &Cpu) {
    let mut rq = cpu.rq.lock();
    let Some(owner) = rq.current_sched() else {
        return;
    };
    rq.invalidate_sched();
    if let Some(ctx) = kernel.context(owner) {
        let mut sc = ctx.sched.lock();
        sc.replenish();
        if rq.contains(owner) {
            rq.requeue(owner, &sc);
        }
    }
    log::trace!(target: "kestrel::sched", "cpu {}: timeslice of {:?} ended", cpu.id(), owner);
}

// -- Picking

fn pick(kernel: &'static Kernel, cpu: &Cpu) {
    cpu.take_need_resched();

    // A direct switch keeps the current timeslice.
    if let Some(r) = cpu.take_pending_switch() {
        if let Some(t) = kernel.context(r).filter(|t| can_run_here(t, cpu)) {
            switch_to(kernel, cpu, &t);
            if t.switch_handle_drq() != Switch::Resched {
                return;
            }
        }
    }

    if let Some(cur) = cpu.current_context() {
        if cur.home_cpu() == cpu.id() && cur.state().intersects(ThreadState::READY_MASK) {
            cpu.ready_enqueue(&cur);
        }
    }

    loop {
        let next = cpu.rq.lock().next_to_run();
        let Some(r) = next else {
            // Not even the kernel context: nothing to run.
            return;
        };
        let Some(t) = kernel.context(r) else {
            cpu.ready_dequeue(r);
            continue;
        };
        if !t.is_kernel_context()
            && (t.home_cpu() != cpu.id() || !t.state().intersects(ThreadState::READY_MASK))
        {
            cpu.ready_dequeue(r);
            continue;
        }

        let running = t.running_on();
        if running != INVALID_CPU && running != cpu.id() {
            // Still current on its old CPU: run the kernel context and
            // try again once that CPU let go.
            cpu.rq.lock().schedule_in_progress = Some(r);
            if let Some(kc) = cpu.kernel_context() {
                switch_to(kernel, cpu, &kc);
            }
            cpu.set_need_resched();
            return;
        }

        cpu.set_current_sched(&t);
        switch_to(kernel, cpu, &t);
        if t.switch_handle_drq() != Switch::Resched {
            return;
        }
    }
}

fn can_run_here(t: &Context, cpu: &Cpu) -> bool {
    let running = t.running_on();
    t.home_cpu() == cpu.id()
        && t.state().intersects(ThreadState::READY_MASK)
        && (running == INVALID_CPU || running == cpu.id())
}

fn switch_to(kernel: &'static Kernel, cpu: &Cpu, t: &Arc<Context>) {
    let prev = cpu.set_current(Some(t.clone()));
    if let Some(p) = prev {
        if p.me() == t.me() {
            return;
        }
        p.set_running_on(INVALID_CPU);
        log::trace!(target: "kestrel::sched", "cpu {}: {:?} -> {:?}", cpu.id(), p.me(), t.me());
    }
    t.set_running_on(cpu.id());
    if !t.is_kernel_context() {
        kernel.rcu().leave_idle(cpu.id());
    }
}
