//! Reader-writer lock (C3): a single signed 32-bit counter.
//!
//! `counter > 0` means that many readers hold the lock, `0` means free, `-1` means one writer
//! holds it; no other negative value is legal. Readers and writers both optimistically adjust
//! the counter and back off on conflict. This scheme is writer-starvable by design — a steady
//! stream of readers can keep a waiting writer spinning forever — which trades fairness for a
//! single-word, allocation-free representation. Fairness is explicitly not a goal here; compare
//! to a phase-fair design if that trade is ever revisited.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicI32, Ordering};

const WRITER: i32 = -1;
const FREE: i32 = 0;

/// A reader-writer lock built on a single signed counter.
pub struct RwLock<T: ?Sized> {
    counter: AtomicI32,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for RwLock<T> {}
unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}

/// RAII guard for a shared (`read`) acquisition.
pub struct RwLockReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

/// RAII guard for an exclusive (`write`) acquisition.
pub struct RwLockWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T> RwLock<T> {
    /// Creates a new, unlocked lock around `data`.
    pub const fn new(data: T) -> Self {
        Self {
            counter: AtomicI32::new(FREE),
            data: UnsafeCell::new(data),
        }
    }

    /// Consumes the lock, returning the wrapped value without acquiring it.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> RwLock<T> {
    /// Acquires the lock for shared (read) access, spinning across any writer.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        loop {
            let previous = self.counter.fetch_add(1, Ordering::Acquire);
            if previous >= FREE {
                return RwLockReadGuard { lock: self };
            }
            // A writer was present: undo the speculative increment and wait it out.
            self.counter.fetch_sub(1, Ordering::Relaxed);
            while self.counter.load(Ordering::Relaxed) < FREE {
                core::hint::spin_loop();
            }
        }
    }

    /// Acquires the lock for exclusive (write) access, spinning across any reader or writer.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        loop {
            let previous = self.counter.fetch_add(WRITER, Ordering::Acquire);
            if previous == FREE {
                return RwLockWriteGuard { lock: self };
            }
            // Someone else (reader or writer) was present: undo and wait for fully free.
            self.counter.fetch_sub(WRITER, Ordering::Relaxed);
            while self.counter.load(Ordering::Relaxed) != FREE {
                core::hint::spin_loop();
            }
        }
    }

    /// Returns the raw counter value. Exposed for the lock test harness and the invariant
    /// verifier, which both observe this value directly rather than through a guard.
    pub fn raw_counter(&self) -> i32 {
        self.counter.load(Ordering::Relaxed)
    }
}

impl<T: ?Sized + Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> Deref for RwLockReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.counter.fetch_sub(1, Ordering::Release);
    }
}

impl<T: ?Sized> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.counter.fetch_add(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_counter_transitions() {
        let lock = RwLock::new(0);
        assert_eq!(lock.raw_counter(), FREE);
        {
            let _r1 = lock.read();
            assert_eq!(lock.raw_counter(), 1);
            let _r2 = lock.read();
            assert_eq!(lock.raw_counter(), 2);
        }
        assert_eq!(lock.raw_counter(), FREE);
        {
            let _w = lock.write();
            assert_eq!(lock.raw_counter(), WRITER);
        }
        assert_eq!(lock.raw_counter(), FREE);
    }

    #[test]
    fn counter_never_below_writer_sentinel() {
        let lock = RwLock::new(());
        let w = lock.write();
        assert_eq!(lock.raw_counter(), -1);
        drop(w);
        assert_eq!(lock.raw_counter(), 0);
    }

    #[test]
    fn concurrent_readers_each_observe_positive_counter() {
        let lock = RwLock::new(0);
        let guards = [lock.read(), lock.read(), lock.read()];
        for _ in &guards {
            assert!(lock.raw_counter() > 0);
        }
    }

    #[test]
    fn write_excludes_subsequent_read_until_released() {
        let lock = RwLock::new(0);
        let w = lock.write();
        assert_eq!(lock.raw_counter(), WRITER);
        drop(w);
        let r = lock.read();
        assert!(lock.raw_counter() > 0);
        drop(r);
        assert_eq!(lock.raw_counter(), FREE);
    }
}
