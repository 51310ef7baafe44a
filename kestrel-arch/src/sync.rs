//! Interrupt-safe synchronisation primitives
//!
//! Provides [`IrqSpinMutex`] which disables interrupts while held, so that
//! state shared with the IPI and timer paths of the same CPU cannot be
//! re-entered by them.
//!
//! # Example
//!
//! ```
//! use kestrel_arch::sync::IrqSpinMutex;
//!
//! let counter = IrqSpinMutex::new(0u64);
//! {
//!     let mut guard = counter.lock();
//!     *guard += 1;
//! }   // Interrupts restored here
//! assert_eq!(*counter.lock(), 1);
//! ```

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use crate::cpu::{disable_interrupts, restore_interrupts};

/// A spinlock that disables interrupts while held.
///
/// The lock must be released before any suspension point of the holder.
pub struct IrqSpinMutex<T> {
    inner: spin::Mutex<T>,
}

impl<T> IrqSpinMutex<T> {
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self { inner: spin::Mutex::new(value) }
    }

    /// Acquire the lock, disabling interrupts first.
    #[must_use]
    pub fn lock(&self) -> IrqSpinMutexGuard<'_, T> {
        let irq = disable_interrupts();
        IrqSpinMutexGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            irq,
            _not_send: core::marker::PhantomData,
        }
    }

    /// Try to acquire the lock without spinning.
    ///
    /// Interrupts stay untouched if the lock is already held.
    #[must_use]
    pub fn try_lock(&self) -> Option<IrqSpinMutexGuard<'_, T>> {
        let irq = disable_interrupts();
        match self.inner.try_lock() {
            Some(guard) => Some(IrqSpinMutexGuard {
                guard: ManuallyDrop::new(guard),
                irq,
                _not_send: core::marker::PhantomData,
            }),
            None => {
                restore_interrupts(irq);
                None
            }
        }
    }

    /// Racy check, for diagnostics only.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: Default> Default for IrqSpinMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for IrqSpinMutex<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("IrqSpinMutex").field("data", &*guard).finish(),
            None => f.debug_struct("IrqSpinMutex").field("data", &"<locked>").finish(),
        }
    }
}

/// Guard that restores the saved interrupt state after unlocking.
///
/// `!Send` because restoring interrupts on another host thread would
/// change the wrong CPU's mask.
pub struct IrqSpinMutexGuard<'a, T> {
    guard: ManuallyDrop<spin::MutexGuard<'a, T>>,
    irq: bool,
    _not_send: core::marker::PhantomData<*const ()>,
}

impl<T> Deref for IrqSpinMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for IrqSpinMutexGuard<'_, T> {
    fn drop(&mut self) {
        // Release the lock before interrupts come back on.
        // SAFETY: the guard is dropped exactly once, here, and never used
        // afterwards.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        restore_interrupts(self.irq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::interrupts_enabled;

    #[test]
    fn test_lock_masks_interrupts() {
        let m = IrqSpinMutex::new(5u32);
        {
            let mut g = m.lock();
            assert!(!interrupts_enabled());
            *g += 1;
            assert!(m.try_lock().is_none());
            assert!(!interrupts_enabled());
        }
        assert!(interrupts_enabled());
        assert_eq!(*m.lock(), 6);
    }
}
