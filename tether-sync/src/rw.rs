//! Reader/writer spinlocks.
//!
//! Two variants with opposite starvation trade-offs. The writer-biased
//! lock is the default: a waiting writer blocks new readers, so a
//! steady read load cannot starve updates. The reader-biased variant
//! lets readers stream through and should only be used where writers
//! are known to be rare and tolerant.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crossbeam_utils::Backoff;

use crate::{RawLock, RawRwLock};

#[inline]
fn spin_while(mut cond: impl FnMut() -> bool) {
    let backoff = Backoff::new();
    while cond() {
        backoff.snooze();
    }
}

/// A writer-biased reader/writer spinlock.
///
/// Exclusive acquisition claims the `write_now` flag and then waits
/// for in-flight readers to drain; once the flag is up, new readers
/// back off, so the writer is guaranteed to get in. Shared acquisition
/// optimistically bumps the reader count and re-checks the flag,
/// rolling back if a writer slipped in during the transaction.
///
/// One `swap` for lock/unlock, one `fetch_add` for shared
/// lock/unlock on the fast paths.
pub struct RwSpinLock {
    readers: AtomicU32,
    write_now: AtomicBool,
}

impl RwSpinLock {
    /// Creates an unlocked lock.
    #[inline]
    pub const fn new() -> Self {
        Self {
            readers: AtomicU32::new(0),
            write_now: AtomicBool::new(false),
        }
    }

    /// Downgrades an exclusive hold to a shared one without a gap
    /// another writer could slip into.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock exclusively.
    #[inline]
    pub unsafe fn unlock_and_lock_shared(&self) {
        self.readers.fetch_add(1, Ordering::Acquire);
        // Safety: forwarded from the caller.
        unsafe { self.unlock() };
    }

    /// Attempts to upgrade a shared hold to an exclusive one.
    ///
    /// Succeeds only if the caller is the sole reader and no writer is
    /// pending; on success the shared hold is consumed.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock in shared mode.
    pub unsafe fn try_upgrade_shared_to_unique(&self) -> bool {
        // Fast fail: other readers present.
        if self.readers.load(Ordering::Acquire) != 1 {
            return false;
        }

        if self.write_now.swap(true, Ordering::Acquire) {
            return false;
        }

        if self.readers.load(Ordering::Acquire) == 1 {
            // Safety: forwarded from the caller.
            unsafe { self.unlock_shared() };
            true
        } else {
            // Safety: we own write_now; restore it.
            unsafe { self.unlock() };
            false
        }
    }
}

impl Default for RwSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RawLock for RwSpinLock {
    fn lock(&self) {
        spin_while(|| self.write_now.swap(true, Ordering::Acquire));

        // Wait for in-flight readers to drain.
        spin_while(|| self.readers.load(Ordering::Acquire) != 0);
    }

    fn try_lock(&self) -> bool {
        // Fast fail: readers present.
        if self.readers.load(Ordering::Acquire) != 0 {
            return false;
        }

        if self.write_now.swap(true, Ordering::Acquire) {
            return false;
        }

        if self.readers.load(Ordering::Acquire) == 0 {
            true
        } else {
            // A reader got its increment in before seeing our flag;
            // restore the flag and let it through.
            // Safety: we own write_now.
            unsafe { self.unlock() };
            false
        }
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.write_now.store(false, Ordering::Release);
    }
}

impl RawRwLock for RwSpinLock {
    fn lock_shared(&self) {
        loop {
            spin_while(|| self.write_now.load(Ordering::Acquire));

            self.readers.fetch_add(1, Ordering::Acquire);

            // Rare: a writer claimed the flag between our check and
            // increment. Back out and go another round.
            if !self.write_now.load(Ordering::Acquire) {
                return;
            }
            // Safety: we hold the increment we are rolling back.
            unsafe { self.unlock_shared() };
        }
    }

    fn try_lock_shared(&self) -> bool {
        if self.write_now.load(Ordering::Acquire) {
            return false;
        }

        self.readers.fetch_add(1, Ordering::Acquire);

        if !self.write_now.load(Ordering::Acquire) {
            true
        } else {
            // Safety: we hold the increment we are rolling back.
            unsafe { self.unlock_shared() };
            false
        }
    }

    #[inline]
    unsafe fn unlock_shared(&self) {
        self.readers.fetch_sub(1, Ordering::Release);
    }
}

/// A reader-biased reader/writer spinlock.
///
/// Readers never wait for a pending writer, only for one that already
/// holds the lock. A continuous reader stream can therefore starve
/// writers; prefer [`RwSpinLock`] unless that is acceptable.
pub struct RwSpinLockReaderBiased {
    readers: AtomicU32,
    write_now: AtomicBool,
}

impl RwSpinLockReaderBiased {
    /// Creates an unlocked lock.
    #[inline]
    pub const fn new() -> Self {
        Self {
            readers: AtomicU32::new(0),
            write_now: AtomicBool::new(false),
        }
    }
}

impl Default for RwSpinLockReaderBiased {
    fn default() -> Self {
        Self::new()
    }
}

impl RawLock for RwSpinLockReaderBiased {
    fn lock(&self) {
        loop {
            // Readers first.
            spin_while(|| self.readers.load(Ordering::Acquire) != 0);

            spin_while(|| self.write_now.swap(true, Ordering::Acquire));

            if self.readers.load(Ordering::Acquire) == 0 {
                return;
            }
            // A reader arrived while we claimed the flag; give way.
            // Safety: we own write_now.
            unsafe { self.unlock() };
        }
    }

    fn try_lock(&self) -> bool {
        if self.readers.load(Ordering::Acquire) != 0 {
            return false;
        }
        if self.write_now.swap(true, Ordering::Acquire) {
            return false;
        }
        if self.readers.load(Ordering::Acquire) == 0 {
            true
        } else {
            // Safety: we own write_now.
            unsafe { self.unlock() };
            false
        }
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.write_now.store(false, Ordering::Release);
    }
}

impl RawRwLock for RwSpinLockReaderBiased {
    fn lock_shared(&self) {
        self.readers.fetch_add(1, Ordering::Acquire);

        // Wait out a writer that already holds the lock.
        spin_while(|| self.write_now.load(Ordering::Acquire));
    }

    #[inline]
    fn try_lock_shared(&self) -> bool {
        self.readers.fetch_add(1, Ordering::Acquire);
        if self.write_now.load(Ordering::Acquire) {
            // Safety: we hold the increment we are rolling back.
            unsafe { self.unlock_shared() };
            false
        } else {
            true
        }
    }

    #[inline]
    unsafe fn unlock_shared(&self) {
        self.readers.fetch_sub(1, Ordering::Release);
    }
}
