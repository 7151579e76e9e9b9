//! Test-and-set spinlocks and the deadlock-free pair acquisition.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_utils::Backoff;

use crate::RawLock;

/// Backoff mode: busy-spin only. For locks whose critical sections are
/// a handful of instructions.
pub const NONSTOP: bool = false;
/// Backoff mode: spin, then yield to the scheduler. For locks that may
/// be held across longer maintenance work.
pub const YIELD: bool = true;

/// A test-and-set spinlock.
///
/// The `MODE` parameter selects the contention backoff: [`NONSTOP`]
/// never leaves the CPU, [`YIELD`] escalates to `yield` once spinning
/// stops making progress.
pub struct RawSpinLock<const MODE: bool = false> {
    locked: AtomicBool,
}

impl<const MODE: bool> RawSpinLock<MODE> {
    /// Creates an unlocked lock.
    #[inline]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }
}

impl<const MODE: bool> Default for RawSpinLock<MODE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const MODE: bool> RawLock for RawSpinLock<MODE> {
    fn lock(&self) {
        let backoff = Backoff::new();
        while self.locked.swap(true, Ordering::Acquire) {
            if MODE == YIELD {
                backoff.snooze();
            } else {
                backoff.spin();
            }
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        !self.locked.swap(true, Ordering::Acquire)
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// Acquires two locks of the same kind without deadlocking.
///
/// Both are taken in canonical (address) order, so any two threads
/// contending for the same pair agree on the order regardless of which
/// side each calls it from.
///
/// # Panics
///
/// Panics in debug builds if both references name the same lock.
#[inline]
pub fn lock_pair<L: RawLock>(a: &L, b: &L) {
    debug_assert!(!std::ptr::eq(a, b), "lock_pair called on a single lock");
    if (a as *const L) < (b as *const L) {
        a.lock();
        b.lock();
    } else {
        b.lock();
        a.lock();
    }
}

/// A value protected by a [`RawSpinLock`], accessed through an RAII
/// guard.
pub struct SpinMutex<T, const MODE: bool = false> {
    lock: RawSpinLock<MODE>,
    value: UnsafeCell<T>,
}

// Safety: the guard hands out &T / &mut T only while the flag lock is
// held, so access is externally synchronized.
unsafe impl<T: Send, const MODE: bool> Send for SpinMutex<T, MODE> {}
unsafe impl<T: Send, const MODE: bool> Sync for SpinMutex<T, MODE> {}

impl<T, const MODE: bool> SpinMutex<T, MODE> {
    /// Creates a new mutex holding `value`.
    #[inline]
    pub const fn new(value: T) -> Self {
        Self {
            lock: RawSpinLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, returning a guard that releases it on drop.
    #[inline]
    pub fn lock(&self) -> SpinGuard<'_, T, MODE> {
        self.lock.lock();
        SpinGuard { mutex: self }
    }

    /// Returns a mutable reference to the value without locking.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

/// RAII guard for [`SpinMutex`].
pub struct SpinGuard<'a, T, const MODE: bool> {
    mutex: &'a SpinMutex<T, MODE>,
}

impl<T, const MODE: bool> Deref for SpinGuard<'_, T, MODE> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: the guard holds the lock.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T, const MODE: bool> DerefMut for SpinGuard<'_, T, MODE> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock.
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T, const MODE: bool> Drop for SpinGuard<'_, T, MODE> {
    #[inline]
    fn drop(&mut self) {
        // Safety: the guard holds the lock.
        unsafe { self.mutex.lock.unlock() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn lock_unlock() {
        let lock: RawSpinLock = RawSpinLock::new();
        lock.lock();
        assert!(!lock.try_lock());
        unsafe { lock.unlock() };
        assert!(lock.try_lock());
        unsafe { lock.unlock() };
    }

    #[test]
    fn mutex_counts_across_threads() {
        let mutex = Arc::new(SpinMutex::<u64>::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        *mutex.lock() += 1;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*mutex.lock(), 40_000);
    }

    #[test]
    fn pair_order_is_consistent() {
        let a: RawSpinLock = RawSpinLock::new();
        let b: RawSpinLock = RawSpinLock::new();

        lock_pair(&a, &b);
        assert!(!a.try_lock());
        assert!(!b.try_lock());
        unsafe {
            a.unlock();
            b.unlock();
        }

        lock_pair(&b, &a);
        assert!(!a.try_lock());
        assert!(!b.try_lock());
        unsafe {
            a.unlock();
            b.unlock();
        }
    }
}
