//! CPU control
//!
//! Each host thread carries a CPU id "register" and an interrupt mask. A
//! thread that has not entered a CPU reports [`INVALID_CPU`].

use std::cell::Cell;

/// CPU id of a thread that does not currently act as any CPU, and the home
/// CPU of a context that must not run anywhere.
pub const INVALID_CPU: usize = usize::MAX;

thread_local! {
    static CPU_ID: Cell<usize> = const { Cell::new(INVALID_CPU) };
    static IRQ_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Get the current CPU id.
#[inline]
#[must_use]
pub fn cpu_id() -> usize {
    CPU_ID.with(Cell::get)
}

/// Make the calling host thread act as CPU `id`.
///
/// The previous id is restored when the guard is dropped, so entering a
/// CPU nests.
#[must_use = "the CPU is left again when the guard is dropped"]
pub fn enter_cpu(id: usize) -> CpuGuard {
    let prev = CPU_ID.with(|c| c.replace(id));
    CpuGuard { prev, _not_send: core::marker::PhantomData }
}

/// Guard returned by [`enter_cpu`].
///
/// `!Send`: leaving a CPU on another host thread would corrupt that
/// thread's id register.
pub struct CpuGuard {
    prev: usize,
    _not_send: core::marker::PhantomData<*const ()>,
}

impl CpuGuard {
    /// CPU id the guard restores on drop.
    #[must_use]
    pub fn previous(&self) -> usize {
        self.prev
    }
}

impl Drop for CpuGuard {
    fn drop(&mut self) {
        CPU_ID.with(|c| c.set(self.prev));
    }
}

/// Disable interrupts and return the previous state.
#[inline]
#[must_use]
pub fn disable_interrupts() -> bool {
    IRQ_ENABLED.with(|c| c.replace(false))
}

/// Enable interrupts.
#[inline]
pub fn enable_interrupts() {
    IRQ_ENABLED.with(|c| c.set(true));
}

/// Restore the interrupt state returned by [`disable_interrupts`].
#[inline]
pub fn restore_interrupts(prev: bool) {
    IRQ_ENABLED.with(|c| c.set(prev));
}

#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    IRQ_ENABLED.with(Cell::get)
}

/// Spin-wait hint used in busy loops that wait for another CPU.
#[inline]
pub fn pause() {
    core::hint::spin_loop();
    std::thread::yield_now();
}
