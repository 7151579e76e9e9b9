//! Intrusive list of chunks with spare capacity.
//!
//! Consulted first on every emplace so holes opened by compaction get
//! refilled before a fresh chunk is allocated. Membership flips only
//! under the owning chunk's maintenance lock; the links themselves are
//! guarded by the list's own lock, which is always the innermost of
//! the two.

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_utils::Backoff;
use tether_sync::{RawLock as _, RawSpinLock};

use crate::chunk::Chunk;

pub(crate) struct FreeList<T, const N: usize> {
    lock: RawSpinLock,
    /// Lock-free fast fail for the common "head chunk has room" path.
    is_empty: AtomicBool,
    /// Guarded by `lock`.
    head: std::cell::UnsafeCell<*const Chunk<T, N>>,
}

// Safety: the raw head and the chunks' intrusive links are only
// touched under `lock`; no element data is reached through this type.
unsafe impl<T, const N: usize> Send for FreeList<T, N> {}
unsafe impl<T, const N: usize> Sync for FreeList<T, N> {}

impl<T, const N: usize> FreeList<T, N> {
    pub(crate) fn new() -> Self {
        Self {
            lock: RawSpinLock::new(),
            is_empty: AtomicBool::new(true),
            head: std::cell::UnsafeCell::new(ptr::null()),
        }
    }

    /// Splices `chunk` in at the head. Caller holds `chunk`'s
    /// maintenance lock; a no-op if it is already a member.
    pub(crate) fn add(&self, chunk: &Chunk<T, N>) {
        if chunk.in_free_list.load(Ordering::Relaxed) {
            return;
        }

        self.lock.lock();
        // Safety: head and all free links are guarded by `lock`; every
        // listed chunk is kept alive by the container's linked list
        // (membership is cleared before a chunk can be unlinked).
        unsafe {
            let old_head = *self.head.get();
            let links = &mut *chunk.free_links.get();
            links.prev = ptr::null();
            links.next = old_head;
            if !old_head.is_null() {
                (*(*old_head).free_links.get()).prev = chunk as *const _;
            }
            *self.head.get() = chunk as *const _;
        }
        self.is_empty.store(false, Ordering::Release);
        chunk.in_free_list.store(true, Ordering::Relaxed);
        // Safety: taken above.
        unsafe { self.lock.unlock() };
    }

    /// Splices `chunk` out. Caller holds `chunk`'s maintenance lock;
    /// a no-op if it is not a member.
    pub(crate) fn erase(&self, chunk: &Chunk<T, N>) {
        if !chunk.in_free_list.load(Ordering::Relaxed) {
            return;
        }

        self.lock.lock();
        // Safety: as in `add`.
        unsafe {
            let links = &mut *chunk.free_links.get();
            let (prev, next) = (links.prev, links.next);

            if !prev.is_null() {
                (*(*prev).free_links.get()).next = next;
            }
            if !next.is_null() {
                (*(*next).free_links.get()).prev = prev;
            }
            if ptr::eq(*self.head.get(), chunk) {
                *self.head.get() = next;
            }
            if (*self.head.get()).is_null() {
                self.is_empty.store(true, Ordering::Release);
            }

            links.prev = ptr::null();
            links.next = ptr::null();
        }
        chunk.in_free_list.store(false, Ordering::Relaxed);
        // Safety: taken above.
        unsafe { self.lock.unlock() };
    }

    /// Pops the first member with its maintenance lock held, ready for
    /// an emplace. The chunk stays in the list; emplace removes it
    /// only once it fills up.
    ///
    /// Never blocks on a maintenance lock while holding the list lock
    /// (that order is reversed everywhere else); contention is handled
    /// by dropping the list lock and retrying.
    pub(crate) fn pop_available_locked(&self) -> Option<Arc<Chunk<T, N>>> {
        if self.is_empty.load(Ordering::Acquire) {
            return None;
        }

        let backoff = Backoff::new();
        loop {
            self.lock.lock();
            // Safety: head is guarded by `lock`.
            let head = unsafe { *self.head.get() };
            if head.is_null() {
                // Safety: taken above.
                unsafe { self.lock.unlock() };
                return None;
            }

            // Safety: listed chunks are alive (see `add`), and they
            // stay listed while we hold the list lock.
            let chunk = unsafe { &*head };
            if chunk.maint_lock.try_lock() {
                let arc = chunk.self_arc();
                // Safety: taken above.
                unsafe { self.lock.unlock() };
                match arc {
                    Some(arc) => return Some(arc),
                    None => {
                        // A chunk cannot normally die while listed;
                        // bail to the head-chunk path.
                        debug_assert!(false, "free list held a dying chunk");
                        // Safety: taken in the branch above.
                        unsafe { chunk.maint_lock.unlock() };
                        return None;
                    }
                }
            }

            // Safety: taken above.
            unsafe { self.lock.unlock() };
            backoff.snooze();
        }
    }
}
