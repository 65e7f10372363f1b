//! Test-and-set spinlock family (C3).
//!
//! `Spinlock` and `SpinlockIrqSave` share the contract: a single 32-bit word, CAS 0->1 to
//! acquire, store 0 to release. Between failed CAS attempts each spins on a relaxed load instead
//! of retrying the CAS directly — a two-level spin that avoids hammering the cache line with
//! exclusive-access RMW traffic while the lock is visibly held. x86-64's total store order makes
//! the release itself safe as a plain store; a port to a weaker memory model would need to
//! upgrade that store to `Release`.

use core::cell::UnsafeCell;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::irq::{self, IrqFlags};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// A busy-waiting mutual-exclusion lock.
pub struct Spinlock<T: ?Sized> {
    locked: AtomicU32,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for Spinlock<T> {}
unsafe impl<T: ?Sized + Send> Send for Spinlock<T> {}

/// RAII guard releasing a [`Spinlock`] on drop.
pub struct SpinlockGuard<'a, T: ?Sized> {
    lock: &'a Spinlock<T>,
}

impl<T> Spinlock<T> {
    /// Creates a new, unlocked spinlock around `data`.
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicU32::new(UNLOCKED),
            data: UnsafeCell::new(data),
        }
    }

    /// Consumes the lock, returning the wrapped value without acquiring it.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Spinlock<T> {
    fn acquire(&self) {
        loop {
            if self
                .locked
                .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            while self.locked.load(Ordering::Relaxed) != UNLOCKED {
                core::hint::spin_loop();
            }
        }
    }

    fn release(&self) {
        self.locked.store(UNLOCKED, Ordering::Release);
    }

    /// Spins until the lock is acquired.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        self.acquire();
        SpinlockGuard { lock: self }
    }

    /// Attempts one CAS; returns `None` if the lock was already held.
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        self.locked
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinlockGuard { lock: self })
    }

    /// Returns `true` if the lock is currently held, without acquiring it.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed) != UNLOCKED
    }
}

impl<T: ?Sized + Default> Default for Spinlock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> Deref for SpinlockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// A [`Spinlock`] that additionally disables interrupts for the duration of the critical
/// section, restoring the prior interrupt-enable state on release.
pub struct SpinlockIrqSave<T: ?Sized> {
    inner: Spinlock<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SpinlockIrqSave<T> {}
unsafe impl<T: ?Sized + Send> Send for SpinlockIrqSave<T> {}

/// RAII guard releasing a [`SpinlockIrqSave`] and restoring `RFLAGS.IF` on drop.
pub struct SpinlockIrqSaveGuard<'a, T: ?Sized> {
    inner: ManuallyDrop<SpinlockGuard<'a, T>>,
    flags: IrqFlags,
}

impl<T> SpinlockIrqSave<T> {
    /// Creates a new, unlocked lock around `data`.
    pub const fn new(data: T) -> Self {
        Self {
            inner: Spinlock::new(data),
        }
    }

    /// Consumes the lock, returning the wrapped value without acquiring it.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: ?Sized> SpinlockIrqSave<T> {
    /// Snapshots the interrupt flag, disables interrupts, then spins until acquired.
    pub fn lock(&self) -> SpinlockIrqSaveGuard<'_, T> {
        let flags = irq::nested_disable();
        SpinlockIrqSaveGuard {
            inner: ManuallyDrop::new(self.inner.lock()),
            flags,
        }
    }

    /// Snapshots the interrupt flag, disables interrupts, then attempts one CAS.
    pub fn try_lock(&self) -> Option<SpinlockIrqSaveGuard<'_, T>> {
        let flags = irq::nested_disable();
        match self.inner.try_lock() {
            Some(guard) => Some(SpinlockIrqSaveGuard {
                inner: ManuallyDrop::new(guard),
                flags,
            }),
            None => {
                irq::nested_enable(flags);
                None
            }
        }
    }
}

impl<T: ?Sized + Default> Default for SpinlockIrqSave<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> Deref for SpinlockIrqSaveGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: ?Sized> DerefMut for SpinlockIrqSaveGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T: ?Sized> Drop for SpinlockIrqSaveGuard<'_, T> {
    fn drop(&mut self) {
        unsafe { ManuallyDrop::drop(&mut self.inner) };
        irq::nested_enable(self.flags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_transitions() {
        let lock = Spinlock::new(0);
        assert!(!lock.is_locked());
        {
            let mut guard = lock.lock();
            assert!(lock.is_locked());
            *guard = 42;
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 42);
    }

    #[test]
    fn trylock_free_vs_held() {
        let lock = Spinlock::new(0);
        let guard = lock.try_lock();
        assert!(guard.is_some());
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn only_one_cas_succeeds_while_held() {
        let lock = Spinlock::new(());
        let _guard = lock.lock();
        for _ in 0..8 {
            assert!(lock.try_lock().is_none());
        }
    }

    #[test]
    fn irqsave_roundtrip_restores_flag() {
        irq::nested_enable(true);
        let lock = SpinlockIrqSave::new(7);
        let guard = lock.lock();
        assert_eq!(*guard, 7);
        drop(guard);
        assert!(lock.try_lock().is_some());
    }
}
