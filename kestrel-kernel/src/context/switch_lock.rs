//! Helping lock
//!
//! A [`SwitchLock`] implements priority inheritance by lending time: a
//! context that finds the lock taken switches to the owner with
//! [`HelpingMode::Helping`], so the owner runs on the waiter's timeslice
//! until it releases the lock. On release the owner switches back to its
//! helper.
//!
//! A lock can be invalidated while contended (its object is being
//! destroyed); waiters then get [`LockStatus::Invalid`].

extern crate alloc;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use super::{Context, ContextRef, HelpingMode, Switch};
use crate::config::HELPING_CHAIN_MAX;
use crate::error::{KernelError, KernelResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockStatus {
    /// The lock was free and the caller got it.
    NotLocked,
    /// The caller already held the lock.
    Locked,
    /// The lock no longer exists.
    Invalid,
}

const FREE: u32 = ContextRef::NULL.raw();
const INVALID: u32 = FREE - 1;

pub struct SwitchLock {
    owner: AtomicU32,
}

impl SwitchLock {
    pub const fn new() -> Self {
        Self { owner: AtomicU32::new(FREE) }
    }

    #[inline]
    pub fn valid(&self) -> bool {
        self.owner.load(Ordering::Acquire) != INVALID
    }

    /// Current owner, `None` if free or invalid.
    pub fn owner(&self) -> Option<ContextRef> {
        match self.owner.load(Ordering::Acquire) {
            FREE | INVALID => None,
            raw => Some(ContextRef::from_raw(raw)),
        }
    }

    /// Take the lock if it is free.
    pub fn try_lock(&self, ctx: &Context) -> LockStatus {
        match self.owner.compare_exchange(FREE, ctx.me().raw(), Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                ctx.inc_lock_cnt();
                LockStatus::NotLocked
            }
            Err(INVALID) => LockStatus::Invalid,
            Err(o) if o == ctx.me().raw() => LockStatus::Locked,
            Err(_) => LockStatus::Locked,
        }
    }

    /// Acquire the lock for `ctx`, the current context, helping the owner
    /// while it is taken.
    pub async fn lock(&self, ctx: &Arc<Context>) -> LockStatus {
        loop {
            match self.owner.load(Ordering::Acquire) {
                INVALID => return LockStatus::Invalid,
                o if o == ctx.me().raw() => return LockStatus::Locked,
                FREE => {
                    if self.try_lock(ctx) == LockStatus::NotLocked {
                        return LockStatus::NotLocked;
                    }
                }
                o => self.help(ctx, ContextRef::from_raw(o)).await,
            }
        }
    }

    async fn help(&self, ctx: &Arc<Context>, owner: ContextRef) {
        let kernel = ctx.kernel();
        let target = kernel
            .context(owner)
            .and_then(|o| resolve_helping(&o, ctx).ok());
        let sw = match target {
            Some(t) if t.me() != ctx.me() => {
                let _ = set_donatee(ctx, t.me());
                let sw = ctx.switch_exec_helping(&t, self, owner).await;
                ctx.store_donatee(ContextRef::NULL);
                sw
            }
            _ => Switch::Failed,
        };
        if sw == Switch::Failed {
            ctx.schedule().await;
        }
    }

    /// Release the lock held by `ctx` and switch back to a helper.
    pub async fn clear(&self, ctx: &Arc<Context>) {
        if self
            .owner
            .compare_exchange(ctx.me().raw(), FREE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        ctx.dec_lock_cnt();
        switch_to_helper(ctx).await;
    }

    /// Release and invalidate the lock; later lockers get
    /// [`LockStatus::Invalid`].
    pub async fn invalidate(&self, ctx: &Arc<Context>) {
        let prev = self.owner.swap(INVALID, Ordering::AcqRel);
        if prev == ctx.me().raw() {
            ctx.dec_lock_cnt();
            switch_to_helper(ctx).await;
        }
    }

    /// Whether the lock is still owned by `owner`.
    #[inline]
    pub(crate) fn held_by(&self, owner: ContextRef) -> bool {
        self.owner.load(Ordering::Acquire) == owner.raw()
    }
}

impl Default for SwitchLock {
    fn default() -> Self {
        Self::new()
    }
}

async fn switch_to_helper(ctx: &Arc<Context>) {
    let h = ctx.helper();
    if h == ctx.me() {
        return;
    }
    ctx.set_helper(HelpingMode::NotHelping, ctx.me());
    let helper = ctx.kernel().context(h);
    let sw = match helper {
        Some(h) if h.on_home_cpu() => ctx.switch_exec_locked(&h, HelpingMode::IgnoreHelping).await,
        _ => Switch::Failed,
    };
    if sw != Switch::Ok {
        ctx.schedule().await;
    }
}

/// Follow the donation chain starting at `target` to the context that
/// actually has to run.
///
/// A chain leading back to `caller` resolves to `target` itself.
pub fn resolve_helping(target: &Arc<Context>, caller: &Context) -> KernelResult<Arc<Context>> {
    let kernel = caller.kernel();
    let mut t = target.clone();
    for _ in 0..HELPING_CHAIN_MAX {
        let d = t.donatee();
        if !d.is_valid() {
            return Ok(t);
        }
        if d == caller.me() {
            return Ok(target.clone());
        }
        match kernel.context(d) {
            Some(next) => t = next,
            None => return Ok(t),
        }
    }
    Err(KernelError::EBusy)
}

/// Record that `ctx` lends its time to `donatee`.
///
/// Refuses a donation that would close a cycle through `ctx` or exceed the
/// maximum chain length.
pub fn set_donatee(ctx: &Context, donatee: ContextRef) -> KernelResult<()> {
    let kernel = ctx.kernel();
    let mut r = donatee;
    for _ in 0..HELPING_CHAIN_MAX {
        if r == ctx.me() {
            return Err(KernelError::EBusy);
        }
        let Some(c) = kernel.context(r) else {
            ctx.store_donatee(donatee);
            return Ok(());
        };
        r = c.donatee();
        if !r.is_valid() {
            ctx.store_donatee(donatee);
            return Ok(());
        }
    }
    Err(KernelError::EBusy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::boot;
    use crate::thread::ThreadConfig;
    use core::sync::atomic::AtomicUsize;

    #[test]
    fn test_donation_cycle_rejected() {
        let k = boot(1);
        let a = k.create_thread(ThreadConfig::new("a")).unwrap();
        let b = k.create_thread(ThreadConfig::new("b")).unwrap();
        let c = k.create_thread(ThreadConfig::new("c")).unwrap();
        set_donatee(&a, b.me()).unwrap();
        set_donatee(&b, c.me()).unwrap();
        assert_eq!(set_donatee(&c, a.me()), Err(KernelError::EBusy));
        assert_eq!(set_donatee(&a, a.me()), Err(KernelError::EBusy));
        assert!(!c.donatee().is_valid());
    }

    #[test]
    fn test_resolve_follows_chain() {
        let k = boot(1);
        let a = k.create_thread(ThreadConfig::new("a")).unwrap();
        let b = k.create_thread(ThreadConfig::new("b")).unwrap();
        let c = k.create_thread(ThreadConfig::new("c")).unwrap();
        set_donatee(&b, c.me()).unwrap();
        assert_eq!(resolve_helping(&b, &a).unwrap().me(), c.me());
        // Back at the caller: run the target itself.
        set_donatee(&c, a.me()).unwrap();
        assert_eq!(resolve_helping(&b, &a).unwrap().me(), b.me());
    }

    #[test]
    fn test_try_lock_and_invalid() {
        let k = boot(1);
        let a = k.create_thread(ThreadConfig::new("a")).unwrap();
        let b = k.create_thread(ThreadConfig::new("b")).unwrap();
        let lock = SwitchLock::new();
        assert_eq!(lock.try_lock(&a), LockStatus::NotLocked);
        assert_eq!(a.lock_cnt(), 1);
        assert_eq!(lock.try_lock(&a), LockStatus::Locked);
        assert_eq!(lock.owner(), Some(a.me()));
        assert!(lock.held_by(a.me()));
        assert!(!lock.held_by(b.me()));
        lock.owner.store(INVALID, Ordering::Release);
        assert_eq!(lock.try_lock(&b), LockStatus::Invalid);
        assert!(!lock.valid());
    }

    #[cfg(not(feature = "sched-wfq"))]
    #[test]
    fn test_contended_lock_helps_owner() {
        let k = boot(1);
        let lock: &'static SwitchLock = alloc::boxed::Box::leak(alloc::boxed::Box::new(SwitchLock::new()));
        let owner = k.create_thread(ThreadConfig::new("owner").prio(2)).unwrap();
        let waiter = k.create_thread(ThreadConfig::new("waiter").prio(5)).unwrap();
        let order = Arc::new(AtomicUsize::new(0));

        let (o, me, w) = (order.clone(), owner.clone(), waiter.clone());
        k.spawn(&owner, async move {
            assert_eq!(lock.lock(&me).await, LockStatus::NotLocked);
            // Wake the higher-priority waiter while holding the lock.
            let (o2, w2) = (o.clone(), w.clone());
            k.spawn(&w, async move {
                assert_eq!(lock.lock(&w2).await, LockStatus::NotLocked);
                // The owner finished its critical section first.
                assert_eq!(o2.load(Ordering::SeqCst), 1);
                lock.clear(&w2).await;
            })
            .unwrap();
            me.schedule().await;
            o.fetch_add(1, Ordering::SeqCst);
            lock.clear(&me).await;
        })
        .unwrap();
        k.run_until_idle().unwrap();

        assert_eq!(lock.owner(), None);
        assert_eq!(order.load(Ordering::SeqCst), 1);
        assert_eq!(owner.lock_cnt(), 0);
        assert_eq!(waiter.lock_cnt(), 0);
    }
}
