//! Reentrancy and nesting-level layers over raw locks.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{RawLock, RawRwLock};

/// Returns an identifier for the calling thread, unique among live
/// threads and never zero.
#[inline]
fn thread_token() -> usize {
    thread_local! {
        static TOKEN: u8 = const { 0 };
    }
    TOKEN.with(|slot| slot as *const u8 as usize)
}

/// A same-thread reentrancy layer over a raw lock.
///
/// The exclusive side becomes recursive: re-acquisition by the owning
/// thread bumps a depth counter instead of touching the base lock, and
/// only the outermost release actually unlocks. The shared side (when
/// the base is a [`RawRwLock`]) passes through untouched - shared
/// acquisitions count readers and are naturally reentrant.
pub struct Recursive<L> {
    base: L,
    /// Thread token of the exclusive owner, 0 when unowned.
    owner: AtomicUsize,
    /// Written only by the owning thread.
    depth: UnsafeCell<usize>,
}

// Safety: `depth` is only accessed by the thread that owns the base
// lock; handover is ordered by the base lock's release/acquire.
unsafe impl<L: Send> Send for Recursive<L> {}
unsafe impl<L: Send + Sync> Sync for Recursive<L> {}

impl<L> Recursive<L> {
    /// Wraps a raw lock.
    #[inline]
    pub const fn new(base: L) -> Self {
        Self {
            base,
            owner: AtomicUsize::new(0),
            depth: UnsafeCell::new(0),
        }
    }

    /// Returns `true` if the calling thread holds the exclusive side.
    #[inline]
    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == thread_token()
    }
}

impl<L: RawLock> RawLock for Recursive<L> {
    fn lock(&self) {
        let me = thread_token();
        if self.owner.load(Ordering::Relaxed) == me {
            // Safety: we are the owner; nobody else touches depth.
            unsafe { *self.depth.get() += 1 };
            return;
        }

        self.base.lock();
        self.owner.store(me, Ordering::Relaxed);
        // Safety: we just became the owner.
        unsafe { *self.depth.get() = 1 };
    }

    fn try_lock(&self) -> bool {
        let me = thread_token();
        if self.owner.load(Ordering::Relaxed) == me {
            // Safety: we are the owner.
            unsafe { *self.depth.get() += 1 };
            return true;
        }

        if self.base.try_lock() {
            self.owner.store(me, Ordering::Relaxed);
            // Safety: we just became the owner.
            unsafe { *self.depth.get() = 1 };
            true
        } else {
            false
        }
    }

    unsafe fn unlock(&self) {
        debug_assert!(self.is_held_by_current_thread());
        // Safety: we are the owner (caller contract).
        let depth = unsafe { &mut *self.depth.get() };
        *depth -= 1;
        if *depth == 0 {
            self.owner.store(0, Ordering::Relaxed);
            // Safety: forwarded from the caller; this is the
            // outermost release.
            unsafe { self.base.unlock() };
        }
    }
}

impl<L: RawRwLock> RawRwLock for Recursive<L> {
    #[inline]
    fn lock_shared(&self) {
        self.base.lock_shared();
    }

    #[inline]
    fn try_lock_shared(&self) -> bool {
        self.base.try_lock_shared()
    }

    #[inline]
    unsafe fn unlock_shared(&self) {
        // Safety: forwarded from the caller.
        unsafe { self.base.unlock_shared() };
    }
}

/// A nesting-level counter layered over a (recursive) lock.
///
/// The counter is bumped on every successful exclusive acquisition and
/// decremented on every release, so code holding the lock can ask how
/// deep it is nested - in particular whether it is at the top of the
/// stack (`level() == 1`), the only place heavyweight side work is
/// allowed to run.
pub struct LevelCounter<L> {
    base: L,
    /// Protected by the base lock's exclusive side.
    level: UnsafeCell<u32>,
}

// Safety: `level` is only accessed while the base lock is held
// exclusively; handover is ordered by the base lock.
unsafe impl<L: Send> Send for LevelCounter<L> {}
unsafe impl<L: Send + Sync> Sync for LevelCounter<L> {}

impl<L> LevelCounter<L> {
    /// Wraps a lock.
    #[inline]
    pub const fn new(base: L) -> Self {
        Self {
            base,
            level: UnsafeCell::new(0),
        }
    }

    /// Returns the current exclusive nesting depth.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the lock exclusively; the counter
    /// is not synchronized on its own.
    #[inline]
    pub unsafe fn level(&self) -> u32 {
        // Safety: caller holds the exclusive lock.
        unsafe { *self.level.get() }
    }
}

impl<L: RawLock> RawLock for LevelCounter<L> {
    fn lock(&self) {
        self.base.lock();
        // Safety: we hold the exclusive lock.
        unsafe { *self.level.get() += 1 };
    }

    fn try_lock(&self) -> bool {
        if self.base.try_lock() {
            // Safety: we hold the exclusive lock.
            unsafe { *self.level.get() += 1 };
            true
        } else {
            false
        }
    }

    unsafe fn unlock(&self) {
        // Safety: caller holds the exclusive lock.
        unsafe { *self.level.get() -= 1 };
        // Safety: forwarded from the caller.
        unsafe { self.base.unlock() };
    }
}

impl<L: RawRwLock> RawRwLock for LevelCounter<L> {
    #[inline]
    fn lock_shared(&self) {
        self.base.lock_shared();
    }

    #[inline]
    fn try_lock_shared(&self) -> bool {
        self.base.try_lock_shared()
    }

    #[inline]
    unsafe fn unlock_shared(&self) {
        // Safety: forwarded from the caller.
        unsafe { self.base.unlock_shared() };
    }
}
