//! Kernel work of a context
//!
//! Every blocking kernel path is written as an `async` function. A context
//! that enters the kernel (an IPC, a page fault, a kill continuation) gets
//! the corresponding future installed as its kernel work; the per-CPU
//! dispatcher polls it whenever the context is picked to run.
//!
//! A suspension point is a [`yield_now`]: the future returns
//! `Poll::Pending` once, the dispatcher picks the next context to run and
//! the future resumes the next time its context is picked. Callers always
//! re-check their wait condition after a yield.

extern crate alloc;

use alloc::boxed::Box;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context as TaskCx, Poll};

pub mod waker;

/// A context's in-kernel activity.
pub type KernelWork = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Pending kernel activity of a context.
///
/// `kernel_work` is the operation the context is executing. `exit_work`
/// runs once the current operation has finished, before the context would
/// return to user mode (the kill continuation).
#[derive(Default)]
pub struct TaskContext {
    kernel_work: Option<KernelWork>,
    exit_work: Option<KernelWork>,
}

impl TaskContext {
    pub const fn new() -> Self {
        Self {
            kernel_work: None,
            exit_work: None,
        }
    }

    pub fn put_kernel_work(&mut self, work: KernelWork) {
        debug_assert!(self.kernel_work.is_none(), "double-scheduled kernel work");
        self.kernel_work = Some(work);
    }

    pub fn put_exit_work(&mut self, work: KernelWork) {
        // A second kill while the first is pending is a no-op.
        if self.exit_work.is_none() {
            self.exit_work = Some(work);
        }
    }

    /// Take the next piece of work: the running operation first, then the
    /// exit continuation.
    pub fn take_next(&mut self) -> Option<KernelWork> {
        self.kernel_work.take().or_else(|| self.exit_work.take())
    }

    /// Put back work that returned `Poll::Pending`.
    pub fn put_back(&mut self, work: KernelWork) {
        debug_assert!(self.kernel_work.is_none(), "kernel work replaced while polled");
        self.kernel_work = Some(work);
    }

    #[inline]
    pub fn has_pending_work(&self) -> bool {
        self.kernel_work.is_some() || self.exit_work.is_some()
    }

    #[inline]
    pub fn has_exit_work(&self) -> bool {
        self.exit_work.is_some()
    }

    /// Drop all work (the context is being destroyed).
    pub fn clear(&mut self) {
        self.kernel_work = None;
        self.exit_work = None;
    }
}

/// Give up the CPU once.
///
/// The returned future wakes its own waker and reports `Pending` on the
/// first poll, and completes on the second.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskCx<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use core::task::Waker;

    #[test]
    fn test_yield_now_pends_once() {
        let mut fut = Box::pin(yield_now());
        let mut cx = TaskCx::from_waker(Waker::noop());
        assert!(fut.as_mut().poll(&mut cx).is_pending());
        assert!(fut.as_mut().poll(&mut cx).is_ready());
    }

    #[test]
    fn test_work_order() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut task = TaskContext::new();
        let h = hits.clone();
        task.put_exit_work(Box::pin(async move {
            h.store(2, Ordering::SeqCst);
        }));
        let h = hits.clone();
        task.put_kernel_work(Box::pin(async move {
            h.store(1, Ordering::SeqCst);
        }));

        let mut cx = TaskCx::from_waker(Waker::noop());
        let mut first = task.take_next().unwrap();
        assert!(first.as_mut().poll(&mut cx).is_ready());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let mut second = task.take_next().unwrap();
        assert!(second.as_mut().poll(&mut cx).is_ready());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(!task.has_pending_work());
    }
}
