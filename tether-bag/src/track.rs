//! Trackable cursors and the per-slot registries that keep them honest.
//!
//! Every slot owns a registry: an intrusive list of all outstanding
//! [`Tracked`] cursors naming that slot. Maintenance drives the two
//! registry operations:
//!
//! - element dies ([`track_delete`]) - every cursor on the slot is
//!   nulled out;
//! - element moves ([`track_move`]) - cursors on the destination slot
//!   (whose element is gone) are nulled, cursors on the source slot
//!   are retargeted, and the source list is spliced onto the
//!   destination.
//!
//! A cursor's own fields are guarded by its private lock; list links
//! are guarded by the registry lock. Paths that take the cursor lock
//! first only ever *try* the registry lock and back off, so the two
//! directions cannot deadlock.

use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};

use tether_sync::{RawLock as _, RawRwLock as _, RawSpinLock, lock_pair};

use crate::CHECK_ALIVENESS_ON_LOCK;
use crate::chunk::{Chunk, SlotMut, SlotRef};
use crate::maintain::maintain_and_release;

/// Per-slot cursor registry.
pub(crate) struct Trackable<T, const N: usize> {
    /// Fast-fail flag so slots without cursors skip the lock entirely.
    has_any: AtomicBool,
    lock: RawSpinLock,
    /// Head of the intrusive cursor list; guarded by `lock`.
    head: UnsafeHead<T, N>,
}

type UnsafeHead<T, const N: usize> = std::cell::UnsafeCell<*mut TrackedCore<T, N>>;

impl<T, const N: usize> Trackable<T, N> {
    pub(crate) const fn new() -> Self {
        Self {
            has_any: AtomicBool::new(false),
            lock: RawSpinLock::new(),
            head: std::cell::UnsafeCell::new(ptr::null_mut()),
        }
    }
}

/// The registered state of a cursor. Boxed behind [`Tracked`] so the
/// registry's intrusive pointers survive moves of the owning handle.
pub(crate) struct TrackedCore<T, const N: usize> {
    /// Guards `chunk` and `index`.
    lock: RawSpinLock,
    /// Nulled by the registry when the element dies. Non-null under
    /// `lock` implies the chunk is still allocated: invalidation takes
    /// this lock before the chunk can go away.
    chunk: std::cell::UnsafeCell<*const Chunk<T, N>>,
    index: std::cell::UnsafeCell<usize>,
    /// Intrusive list links; guarded by the slot registry's lock.
    prev: std::cell::UnsafeCell<*mut TrackedCore<T, N>>,
    next: std::cell::UnsafeCell<*mut TrackedCore<T, N>>,
}

/// Walks a registry list, calling `closure` with each core's lock
/// held. Caller holds the registry lock, which pins the list shape.
fn walk<T, const N: usize>(
    mut cursor: *mut TrackedCore<T, N>,
    mut closure: impl FnMut(&TrackedCore<T, N>),
) {
    while !cursor.is_null() {
        // Safety: cores stay allocated while registered; the registry
        // lock (held by our caller) blocks deregistration.
        let core = unsafe { &*cursor };
        core.lock.lock();
        closure(core);
        // Safety: links are stable under the registry lock.
        let next = unsafe { *core.next.get() };
        // Safety: taken above.
        unsafe { core.lock.unlock() };
        cursor = next;
    }
}

/// Invalidates every cursor registered on `(chunk, index)`.
///
/// Runs when the slot's element dies: compaction destroying a dead
/// slot, merge draining a source chunk, chunk teardown.
pub(crate) fn track_delete<T, const N: usize>(chunk: &Chunk<T, N>, index: usize) {
    let registry = &chunk.trackables[index];
    if !registry.has_any.load(Ordering::Acquire) {
        return;
    }

    registry.lock.lock();

    // Safety: head is guarded by the registry lock.
    walk(unsafe { *registry.head.get() }, |core| {
        // Safety: `chunk` is guarded by the core's lock, held by walk.
        unsafe { *core.chunk.get() = ptr::null() };
    });

    // Safety: head is guarded by the registry lock. Stale prev/next in
    // the detached cores are never read again: a null chunk short-
    // circuits every cursor path before it looks at links.
    unsafe { *registry.head.get() = ptr::null_mut() };
    registry.has_any.store(false, Ordering::Release);

    // Safety: taken above.
    unsafe { registry.lock.unlock() };
}

/// Retargets cursors for an element moving from one slot to another
/// (within a chunk during compaction, across chunks during merge).
///
/// Cursors on the destination slot named a previously-destroyed
/// element; they die rather than silently rebind to an unrelated one.
/// Cursors on the source slot follow their element.
pub(crate) fn track_move<T, const N: usize>(
    from_chunk: &Chunk<T, N>,
    from_index: usize,
    to_chunk: &Chunk<T, N>,
    to_index: usize,
) {
    if ptr::eq(from_chunk, to_chunk) && from_index == to_index {
        return;
    }

    let from = &from_chunk.trackables[from_index];
    let to = &to_chunk.trackables[to_index];

    let have_from = from.has_any.load(Ordering::Acquire);
    let have_to = to.has_any.load(Ordering::Acquire);
    if !have_from && !have_to {
        return;
    }

    lock_pair(&from.lock, &to.lock);

    // Safety: heads are guarded by the registry locks held above; core
    // fields are guarded by the per-core lock held by walk.
    walk(unsafe { *to.head.get() }, |core| {
        // Safety: core lock held by walk.
        unsafe { *core.chunk.get() = ptr::null() };
    });

    walk(unsafe { *from.head.get() }, |core| {
        // Safety: core lock held by walk.
        unsafe {
            *core.chunk.get() = to_chunk as *const _;
            *core.index.get() = to_index;
        }
    });

    // Safety: heads are guarded by the registry locks held above.
    let moved = unsafe {
        let moved = *from.head.get();
        *to.head.get() = moved;
        *from.head.get() = ptr::null_mut();
        moved
    };

    from.has_any.store(false, Ordering::Release);
    to.has_any.store(!moved.is_null(), Ordering::Release);

    // Safety: taken by lock_pair above.
    unsafe {
        from.lock.unlock();
        to.lock.unlock();
    }
}

// =============================================================================
// Tracked
// =============================================================================

/// A stable cursor to one element of a
/// [`ChunkedBag`](crate::ChunkedBag).
///
/// The container retargets the cursor when its element is relocated by
/// compaction or a merge, and invalidates it when the element dies.
/// Dereferencing goes through [`Tracked::lock`]/[`Tracked::lock_shared`],
/// which returns `None` once the element is gone.
///
/// Cursors may outlive the container; they simply come back dead.
pub struct Tracked<T, const N: usize> {
    core: NonNull<TrackedCore<T, N>>,
    _marker: PhantomData<TrackedCore<T, N>>,
}

// Safety: every field of the core is lock-guarded; element access is
// only handed out per the Access guard's rules.
unsafe impl<T: Send + Sync, const N: usize> Send for Tracked<T, N> {}
unsafe impl<T: Send + Sync, const N: usize> Sync for Tracked<T, N> {}

impl<T, const N: usize> Tracked<T, N> {
    /// Registers a new cursor on `(chunk, index)`.
    ///
    /// # Safety
    ///
    /// The caller must hold either the chunk's lock or its maintenance
    /// lock, so the slot can neither move nor die before registration
    /// completes.
    pub(crate) unsafe fn register(chunk: &Chunk<T, N>, index: usize) -> Self {
        let core = Box::into_raw(Box::new(TrackedCore {
            lock: RawSpinLock::new(),
            chunk: std::cell::UnsafeCell::new(chunk as *const _),
            index: std::cell::UnsafeCell::new(index),
            prev: std::cell::UnsafeCell::new(ptr::null_mut()),
            next: std::cell::UnsafeCell::new(ptr::null_mut()),
        }));

        let registry = &chunk.trackables[index];
        registry.lock.lock();
        // Safety: head and links are guarded by the registry lock; the
        // new core is not yet visible to anyone else.
        unsafe {
            let old_head = *registry.head.get();
            (*core).next.get().write(old_head);
            if !old_head.is_null() {
                *(*old_head).prev.get() = core;
            }
            *registry.head.get() = core;
        }
        registry.has_any.store(true, Ordering::Release);
        // Safety: taken above.
        unsafe { registry.lock.unlock() };

        Self {
            // Safety: Box::into_raw never returns null.
            core: unsafe { NonNull::new_unchecked(core) },
            _marker: PhantomData,
        }
    }

    #[inline]
    fn core(&self) -> &TrackedCore<T, N> {
        // Safety: the core is owned by this handle and freed only in
        // its Drop.
        unsafe { self.core.as_ref() }
    }

    /// Acquires the element for exclusive access.
    ///
    /// Returns `None` if the element has been erased (or died with its
    /// container). Dropping the returned guard releases the chunk and
    /// gives maintenance a chance to run.
    pub fn lock(&self) -> Option<Access<T, N, false>> {
        self.lock_impl::<false>()
    }

    /// Acquires the element for shared access.
    pub fn lock_shared(&self) -> Option<Access<T, N, true>> {
        self.lock_impl::<true>()
    }

    fn lock_impl<const SHARED: bool>(&self) -> Option<Access<T, N, SHARED>> {
        let core = self.core();
        loop {
            core.lock.lock();
            // Safety: guarded by the core lock taken above.
            let chunk_ptr = unsafe { *core.chunk.get() };
            if chunk_ptr.is_null() {
                // Safety: taken above.
                unsafe { core.lock.unlock() };
                return None;
            }

            // Safety: non-null under the core lock implies the chunk
            // is still allocated (invalidation must take this lock
            // first, and chunk teardown invalidates before freeing).
            let chunk = unsafe { &*chunk_ptr };

            // Only ever *try* the chunk lock here: blocking while
            // holding the core lock would deadlock with maintenance,
            // which nulls `chunk` under the chunk's exclusive hold.
            let locked = if SHARED {
                chunk.lock.try_lock_shared()
            } else {
                chunk.lock.try_lock()
            };

            if locked {
                // Safety: guarded by the core lock.
                let index = unsafe { *core.index.get() };
                // Safety: taken above.
                unsafe { core.lock.unlock() };

                if CHECK_ALIVENESS_ON_LOCK && !chunk.is_alive(index) {
                    // Release the hold like any other before reporting
                    // the cursor dead.
                    maintain_and_release::<T, N, SHARED>(chunk, None);
                    return None;
                }

                return Some(Access {
                    chunk: chunk_ptr,
                    index,
                    _marker: PhantomData,
                });
            }

            // Safety: taken above.
            unsafe { core.lock.unlock() };
            std::thread::yield_now();
        }
    }
}

impl<T, const N: usize> Drop for Tracked<T, N> {
    fn drop(&mut self) {
        let core = self.core();
        loop {
            core.lock.lock();
            // Safety: guarded by the core lock.
            let chunk_ptr = unsafe { *core.chunk.get() };
            if chunk_ptr.is_null() {
                // Already invalidated; nothing to detach from.
                // Safety: taken above.
                unsafe { core.lock.unlock() };
                break;
            }

            // Safety: non-null under the core lock pins the chunk.
            let chunk = unsafe { &*chunk_ptr };
            // Safety: guarded by the core lock.
            let index = unsafe { *core.index.get() };
            let registry = &chunk.trackables[index];

            if registry.lock.try_lock() {
                // Safety: links and head are guarded by the registry
                // lock; our own fields by the core lock.
                unsafe {
                    let prev = *core.prev.get();
                    let next = *core.next.get();

                    if !prev.is_null() {
                        *(*prev).next.get() = next;
                    } else {
                        debug_assert_eq!(*registry.head.get(), self.core.as_ptr());
                        *registry.head.get() = next;
                    }
                    if !next.is_null() {
                        *(*next).prev.get() = prev;
                    }
                    if (*registry.head.get()).is_null() {
                        registry.has_any.store(false, Ordering::Release);
                    }

                    registry.lock.unlock();
                    core.lock.unlock();
                }
                break;
            }

            // Safety: taken above.
            unsafe { core.lock.unlock() };
            std::thread::yield_now();
        }

        // Safety: detached (or never reachable); nobody else holds a
        // pointer to the core anymore.
        drop(unsafe { Box::from_raw(self.core.as_ptr()) });
    }
}

impl<T, const N: usize> std::fmt::Debug for Tracked<T, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core();
        core.lock.lock();
        // Safety: guarded by the core lock.
        let dead = unsafe { (*core.chunk.get()).is_null() };
        // Safety: taken above.
        unsafe { core.lock.unlock() };
        f.debug_struct("Tracked")
            .field("dead", &dead)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Access
// =============================================================================

/// Scoped access to a tracked element, holding its chunk's lock in the
/// mode named by `SHARED`.
///
/// Dropping the guard releases the chunk and triggers maintenance,
/// which may compact, merge, or delete the chunk.
pub struct Access<T, const N: usize, const SHARED: bool> {
    chunk: *const Chunk<T, N>,
    index: usize,
    /// Ties unlock to the acquiring thread (the recursive lock tracks
    /// its owner), so the guard must not cross threads.
    _marker: PhantomData<*mut T>,
}

impl<T, const N: usize, const SHARED: bool> Access<T, N, SHARED> {
    #[inline]
    pub(crate) fn chunk(&self) -> &Chunk<T, N> {
        // Safety: the guard's hold keeps the chunk from tearing down.
        unsafe { &*self.chunk }
    }

    #[inline]
    pub(crate) fn index(&self) -> usize {
        self.index
    }
}

impl<T, const N: usize> Access<T, N, false> {
    /// Borrows the element.
    ///
    /// # Panics
    ///
    /// Panics if a nested visit holds the slot mutably.
    #[inline]
    pub fn get(&self) -> SlotRef<'_, T> {
        // Safety: the guard holds the chunk exclusively.
        unsafe { self.chunk().element_ref(self.index) }
    }

    /// Borrows the element mutably.
    ///
    /// # Panics
    ///
    /// Panics if a nested visit holds the slot in any mode.
    #[inline]
    pub fn get_mut(&self) -> SlotMut<'_, T> {
        // Safety: the guard holds the chunk exclusively.
        unsafe { self.chunk().element_mut(self.index) }
    }
}

impl<T, const N: usize> Deref for Access<T, N, true> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: the guard holds the chunk in shared mode, so no
        // mutable access exists anywhere.
        unsafe { self.chunk().element(self.index) }
    }
}

impl<T, const N: usize, const SHARED: bool> Drop for Access<T, N, SHARED> {
    fn drop(&mut self) {
        maintain_and_release::<T, N, SHARED>(self.chunk(), None);
    }
}
