//! Context waker
//!
//! Waking a context's kernel work only records that the work asked to be
//! polled again. Whether the context actually runs is decided by its
//! thread state and the ready queue, never by the waker:
//!
//! - woken during the poll: the work passed a suspension point and stays
//!   runnable as far as the dispatcher is concerned
//! - not woken: the work is waiting for something outside the kernel's
//!   scheduling model, which the dispatcher reports as an anomaly

extern crate alloc;

use alloc::sync::{Arc, Weak};
use alloc::task::Wake;
use core::task::Waker;

use crate::context::Context;

struct ContextWaker {
    ctx: Weak<Context>,
}

impl Wake for ContextWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.mark_woken();
        }
    }
}

/// Create a waker for the kernel work of `ctx`.
pub fn create_waker(ctx: &Arc<Context>) -> Waker {
    Waker::from(Arc::new(ContextWaker {
        ctx: Arc::downgrade(ctx),
    }))
}
