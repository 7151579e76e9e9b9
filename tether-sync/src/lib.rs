//! # tether-sync
//!
//! Spin-lock primitives for fine-grained concurrent data structures.
//!
//! ## Design Philosophy
//!
//! Everything here is a userspace spinlock: short critical sections,
//! no OS parking, contention handled by exponential backoff that
//! escalates from CPU pauses to scheduler yields. The building blocks
//! compose through the [`RawLock`] / [`RawRwLock`] traits:
//!
//! - [`RawSpinLock`] - test-and-set flag lock with a const-generic
//!   backoff mode
//! - [`SpinMutex`] - data-carrying, guard-returning wrapper
//! - [`RwSpinLock`] - writer-biased reader/writer spinlock
//! - [`RwSpinLockReaderBiased`] - the reader-biased sibling
//! - [`Recursive`] - same-thread reentrancy over any raw lock
//! - [`LevelCounter`] - nesting-level tracking over a (recursive) lock
//!
//! Layers stack the way they are listed:
//!
//! ```
//! use tether_sync::{LevelCounter, RawLock, Recursive, RwSpinLock};
//!
//! let lock: LevelCounter<Recursive<RwSpinLock>> = LevelCounter::new(Recursive::new(RwSpinLock::new()));
//! lock.lock();
//! assert!(lock.try_lock()); // same thread re-enters
//! unsafe {
//!     assert_eq!(lock.level(), 2);
//!     lock.unlock();
//!     lock.unlock();
//! }
//! ```

#![warn(missing_docs)]

mod recursive;
mod rw;
mod spin;

pub use recursive::{LevelCounter, Recursive};
pub use rw::{RwSpinLock, RwSpinLockReaderBiased};
pub use spin::{NONSTOP, RawSpinLock, SpinGuard, SpinMutex, YIELD, lock_pair};

/// A raw mutual-exclusion lock.
///
/// Implementations are `lock`/`unlock` pairs with no guard object; the
/// caller is responsible for balancing acquisitions. Use [`SpinMutex`]
/// when RAII scoping is enough.
pub trait RawLock {
    /// Acquires the lock, spinning until it is available.
    fn lock(&self);

    /// Attempts to acquire the lock without spinning.
    fn try_lock(&self) -> bool;

    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock (for recursive locks: one level
    /// of it).
    unsafe fn unlock(&self);
}

/// A raw reader/writer lock.
///
/// Extends [`RawLock`] (the exclusive mode) with a shared mode.
pub trait RawRwLock: RawLock {
    /// Acquires the lock in shared mode, spinning until available.
    fn lock_shared(&self);

    /// Attempts to acquire the lock in shared mode without spinning.
    fn try_lock_shared(&self) -> bool;

    /// Releases one shared acquisition.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock in shared mode.
    unsafe fn unlock_shared(&self);
}
