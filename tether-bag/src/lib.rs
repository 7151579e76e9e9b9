//! # tether-bag
//!
//! A thread-safe, unordered, chunked bag with stable external cursors.
//!
//! Elements live in contiguous fixed-size arenas ("chunks") strung on
//! a doubly-linked list. Emplacement, erasure, and iteration are all
//! concurrent; erased slots are reclaimed opportunistically when locks
//! are released - compaction moves live elements from a chunk's tail
//! into its holes, nearly-empty chunks merge into a neighbor, empty
//! ones are unlinked. [`Tracked`] cursors survive all of it: the
//! container retargets them when their element is relocated and
//! invalidates them when it dies.
//!
//! ## What this is not
//!
//! There is no ordering of any kind: iteration order is unspecified
//! and changes as maintenance shuffles elements. Concurrent modifiers
//! may hide an element from an in-flight iteration or expose a new one
//! to it. Indices are not stable - only [`Tracked`] cursors are.
//!
//! ## Example
//!
//! ```
//! use tether_bag::ChunkedBag;
//!
//! let bag: ChunkedBag<i32, 4> = ChunkedBag::new();
//!
//! for i in 0..10 {
//!     bag.emplace(i);
//! }
//! let two = bag.emplace(-2).into_tracked();
//!
//! // Erase the odd values.
//! bag.iterate(|entry| {
//!     if *entry.get() % 2 != 0 {
//!         bag.erase(&entry);
//!     }
//! });
//!
//! // The cursor followed its element through compaction.
//! assert_eq!(*two.lock().unwrap().get(), -2);
//! ```
//!
//! ## Locking
//!
//! Per-chunk, two locks: a writer-biased recursive RW spinlock owning
//! the element data (exclusive for mutating visits and maintenance,
//! shared for read-only visits), and a plain maintenance spinlock for
//! structural state. Acquisition order, outermost first: cursor lock,
//! maintenance handle, head lock, chunk RW lock, chunk maintenance
//! lock, free-list lock, slot registry lock. Same-tier pairs go
//! through address-ordered acquisition.
//!
//! The chunk lock is recursive, so a visit closure may erase, iterate,
//! or lock cursors on the chunk it is standing in without
//! self-deadlock; maintenance refuses to run anywhere but the
//! outermost release.
//!
//! ## Element contract
//!
//! Elements are relocated bitwise during compaction and merges (no
//! `Clone` involved) and dropped by the container on erase-reclaim or
//! teardown. `T::drop` must not panic; a panicking drop can leave a
//! chunk's bookkeeping inconsistent.

#![warn(missing_docs)]

mod chunk;
mod free_list;
mod maintain;
mod track;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tether_sync::{RawLock as _, RawRwLock as _, SpinMutex};

use crate::chunk::Chunk;
use crate::maintain::maintain_and_release;

pub use crate::chunk::{Entry, SlotMut, SlotRef};
pub use crate::track::{Access, Tracked};

pub(crate) use crate::free_list::FreeList;

/// Reclaim holes right after each erase instead of waiting for the
/// next iteration. Lower peak footprint, more chunk-lock traffic.
pub(crate) const ERASE_IMMEDIATELY: bool = !cfg!(feature = "deferred-erase");

/// Re-check the aliveness bit when a cursor acquires its chunk. The
/// registry already invalidates cursors on death; this only guards
/// against stale handles held past an erase.
pub(crate) const CHECK_ALIVENESS_ON_LOCK: bool = cfg!(feature = "check-aliveness");

/// Route from a chunk back to the container's free list for
/// maintenance that outlives the container handle (cursor access
/// releases). The container nulls it during teardown.
pub(crate) type MaintHandle<T, const N: usize> = Arc<SpinMutex<Option<Arc<FreeList<T, N>>>>>;

/// The chunk capacity the container would pick for `T` on its own:
/// roughly 2 KiB worth of elements, but never fewer than 32.
///
/// ```
/// use tether_bag::{ChunkedBag, default_capacity};
///
/// let bag: ChunkedBag<u64, { default_capacity::<u64>() }> = ChunkedBag::new();
/// # drop(bag);
/// ```
pub const fn default_capacity<T>() -> usize {
    let size = if size_of::<T>() == 0 {
        1
    } else {
        size_of::<T>()
    };
    let per_chunk = 2048 / size;
    if per_chunk < 32 { 32 } else { per_chunk }
}

// =============================================================================
// ChunkedBag
// =============================================================================

/// A thread-safe, unordered, chunked bag of `T` with stable
/// [`Tracked`] cursors. `N` is the per-chunk capacity; see
/// [`default_capacity`] for the recommended value.
///
/// All operations take `&self` and may be called from any number of
/// threads concurrently.
pub struct ChunkedBag<T, const N: usize> {
    /// The head chunk - newest, and the one receiving emplacements.
    first: SpinMutex<Option<Arc<Chunk<T, N>>>>,
    free_list: Arc<FreeList<T, N>>,
    maint_handle: MaintHandle<T, N>,
}

impl<T, const N: usize> ChunkedBag<T, N> {
    /// Creates an empty bag. No chunk is allocated until the first
    /// emplace.
    pub fn new() -> Self {
        let free_list = Arc::new(FreeList::new());
        Self {
            first: SpinMutex::new(None),
            maint_handle: Arc::new(SpinMutex::new(Some(Arc::clone(&free_list)))),
            free_list,
        }
    }

    // -------------------------------------------------------------------------
    // Emplace
    // -------------------------------------------------------------------------

    /// Inserts an element, returning a [`Reserved`] builder.
    ///
    /// The builder holds the slot pinned; call
    /// [`Reserved::into_tracked`] to pay for a cursor, or just drop it
    /// to decline.
    ///
    /// ```
    /// use tether_bag::ChunkedBag;
    ///
    /// let bag: ChunkedBag<u32, 32> = ChunkedBag::new();
    /// bag.emplace(1);
    /// let cursor = bag.emplace(2).into_tracked();
    /// assert_eq!(*cursor.lock().unwrap().get(), 2);
    /// ```
    pub fn emplace(&self, value: T) -> Reserved<T, N> {
        // A chunk with spare capacity first; holes get refilled before
        // fresh chunks are allocated. Either path hands the chunk back
        // with its maintenance lock held.
        let chunk = match self.free_list.pop_available_locked() {
            Some(chunk) => chunk,
            None => self.emplace_target(),
        };

        let index = chunk.emplace(value);

        if chunk.in_free_list.load(Ordering::Relaxed) && chunk.is_full() {
            self.free_list.erase(&chunk);
        }

        Reserved { chunk, index }
    }

    /// Returns the head chunk with its maintenance lock held,
    /// allocating or replacing the head as needed.
    fn emplace_target(&self) -> Arc<Chunk<T, N>> {
        let mut first = self.first.lock();

        let head = first.get_or_insert_with(|| Chunk::new(Arc::clone(&self.maint_handle), true));
        head.maint_lock.lock();

        if head.is_full() {
            let fresh = Chunk::new(Arc::clone(&self.maint_handle), false);
            fresh.next.store(Some(Arc::clone(head)));
            head.prev.store(Some(Arc::clone(&fresh)));
            fresh.is_first.store(true, Ordering::Release);

            fresh.maint_lock.lock();

            let prev_head = std::mem::replace(head, fresh);
            // Safety: taken above; the old head keeps its other locks.
            unsafe { prev_head.maint_lock.unlock() };
            prev_head.is_first.store(false, Ordering::Release);
            // prev_head stays reachable through the new head's `next`.
        }

        Arc::clone(head)
    }

    // -------------------------------------------------------------------------
    // Erase
    // -------------------------------------------------------------------------

    /// Erases the element behind an iteration handle.
    ///
    /// The slot is only marked dead; the element is destroyed when
    /// maintenance reclaims the hole. Legal under both iteration
    /// modes.
    pub fn erase<const SHARED: bool>(&self, entry: &Entry<'_, T, N, SHARED>) {
        entry.chunk.erase(entry.index);

        if ERASE_IMMEDIATELY && entry.chunk.lock.try_lock() {
            maintain_and_release::<T, N, false>(entry.chunk, Some(&*self.free_list));
        }
    }

    /// Erases the element behind a cursor. A dead cursor is a no-op,
    /// as is a cursor whose element was already erased.
    pub fn erase_tracked(&self, cursor: &Tracked<T, N>) {
        let Some(access) = cursor.lock() else {
            return;
        };

        let chunk = access.chunk();
        let index = access.index();
        if chunk.is_alive(index) {
            chunk.erase(index);

            if ERASE_IMMEDIATELY && chunk.lock.try_lock() {
                // Nested under the access guard's hold, so this only
                // bumps the hole count bookkeeping; the guard's own
                // release below runs the real maintenance.
                maintain_and_release::<T, N, false>(chunk, Some(&*self.free_list));
            }
        }
    }

    // -------------------------------------------------------------------------
    // Iterate
    // -------------------------------------------------------------------------

    /// Visits every live element under an exclusive chunk hold; the
    /// closure may mutate elements and erase through its [`Entry`].
    ///
    /// Every chunk present at the start is visited exactly once, with
    /// no element visited twice; a concurrently prepended head may be
    /// missed, and concurrently erased elements may be skipped. Chunks
    /// locked by other threads are revisited until they yield
    /// (liveness, not snapshot semantics).
    pub fn iterate<F>(&self, f: F)
    where
        F: FnMut(Entry<'_, T, N, false>),
    {
        self.iterate_impl::<false, F>(f);
    }

    /// Visits every live element under a shared chunk hold; read-only
    /// access, but erasing through the [`Entry`] is still legal.
    pub fn iterate_shared<F>(&self, f: F)
    where
        F: FnMut(Entry<'_, T, N, true>),
    {
        self.iterate_impl::<true, F>(f);
    }

    fn iterate_impl<const SHARED: bool, F>(&self, mut f: F)
    where
        F: FnMut(Entry<'_, T, N, SHARED>),
    {
        fn try_lock_chunk<T, const N: usize, const SHARED: bool>(chunk: &Chunk<T, N>) -> bool {
            if SHARED {
                chunk.lock.try_lock_shared()
            } else {
                chunk.lock.try_lock()
            }
        }

        let mut skipped: Vec<Arc<Chunk<T, N>>> = Vec::new();

        let mut cursor = self.first.lock().clone();
        while let Some(chunk) = cursor {
            if try_lock_chunk::<T, N, SHARED>(&chunk) {
                chunk.visit::<SHARED, F>(&mut f);
                maintain_and_release::<T, N, SHARED>(&chunk, Some(&*self.free_list));
            } else {
                skipped.push(Arc::clone(&chunk));
            }
            cursor = chunk.next.load_full();
        }

        // Busy chunks are retried until every one has been visited.
        while !skipped.is_empty() {
            skipped.retain(|chunk| {
                if try_lock_chunk::<T, N, SHARED>(chunk) {
                    chunk.visit::<SHARED, F>(&mut f);
                    maintain_and_release::<T, N, SHARED>(chunk, Some(&*self.free_list));
                    false
                } else {
                    true
                }
            });
            if !skipped.is_empty() {
                std::thread::yield_now();
            }
        }
    }

    // -------------------------------------------------------------------------
    // Observability
    // -------------------------------------------------------------------------

    /// Number of chunks currently linked. Debug/observability only;
    /// the answer may be stale by the time it returns.
    pub fn chunk_count(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.first.lock().clone();
        while let Some(chunk) = cursor {
            count += 1;
            cursor = chunk.next.load_full();
        }
        count
    }
}

impl<T, const N: usize> Default for ChunkedBag<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> std::fmt::Debug for ChunkedBag<T, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedBag")
            .field("chunks", &self.chunk_count())
            .finish_non_exhaustive()
    }
}

impl<T, const N: usize> Drop for ChunkedBag<T, N> {
    fn drop(&mut self) {
        // Quiesce first: once the handle is empty, a late cursor
        // release can no longer reach the free list, and any release
        // already inside it has finished (the slot's lock serializes
        // us behind it).
        *self.maint_handle.lock() = None;

        // Cut the list iteratively so dropping the head cannot recurse
        // down the whole chain. Each chunk's own teardown waits out
        // concurrent cursor holds (it takes the exclusive lock) and
        // runs once the last traverser drops its handle.
        let mut cursor = self.first.get_mut().take();
        while let Some(chunk) = cursor {
            chunk.lock.lock();
            chunk.maint_lock.lock();
            let next = chunk.next.swap(None);
            chunk.prev.store(None);
            // Safety: both taken above.
            unsafe {
                chunk.maint_lock.unlock();
                chunk.lock.unlock();
            }
            cursor = next;
        }
    }
}

// =============================================================================
// Reserved
// =============================================================================

/// A just-emplaced element, pinned until this builder is resolved.
///
/// Returned by [`ChunkedBag::emplace`]. The slot cannot move or die
/// while the builder lives, so a cursor registered through
/// [`Reserved::into_tracked`] can never miss its element. Dropping the
/// builder simply releases the pin.
pub struct Reserved<T, const N: usize> {
    chunk: Arc<Chunk<T, N>>,
    index: usize,
}

impl<T, const N: usize> Reserved<T, N> {
    /// Registers and returns a trackable cursor for the new element.
    pub fn into_tracked(self) -> Tracked<T, N> {
        // Safety: we hold the chunk's maintenance lock, which pins the
        // slot until `self` drops - after registration.
        unsafe { Tracked::register(&self.chunk, self.index) }
    }
}

impl<T, const N: usize> Drop for Reserved<T, N> {
    fn drop(&mut self) {
        // Safety: emplace acquired the maintenance lock and handed its
        // release to us.
        unsafe { self.chunk.maint_lock.unlock() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emplace_and_read_back() {
        let bag: ChunkedBag<u64, 4> = ChunkedBag::new();

        let cursor = bag.emplace(42).into_tracked();
        bag.emplace(7);

        assert_eq!(*cursor.lock().unwrap().get(), 42);
        assert_eq!(bag.chunk_count(), 1);
    }

    #[test]
    fn overflow_allocates_new_head() {
        let bag: ChunkedBag<u64, 4> = ChunkedBag::new();

        for i in 0..4 {
            bag.emplace(i);
        }
        assert_eq!(bag.chunk_count(), 1);

        bag.emplace(4);
        assert_eq!(bag.chunk_count(), 2);
    }

    #[test]
    fn iterate_sees_everything() {
        let bag: ChunkedBag<u64, 4> = ChunkedBag::new();
        for i in 0..10 {
            bag.emplace(i);
        }

        let mut seen = Vec::new();
        bag.iterate(|entry| seen.push(*entry.get()));
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());

        let mut sum = 0;
        bag.iterate_shared(|entry| sum += *entry.get());
        assert_eq!(sum, 45);
    }

    #[test]
    fn erase_inside_iterate() {
        let bag: ChunkedBag<u64, 4> = ChunkedBag::new();
        for i in 0..10 {
            bag.emplace(i);
        }

        bag.iterate(|entry| {
            if *entry.get() % 2 == 1 {
                bag.erase(&entry);
            }
        });

        let mut seen = Vec::new();
        bag.iterate(|entry| seen.push(*entry.get()));
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 2, 4, 6, 8]);
    }

    #[test]
    fn erase_inside_shared_iterate() {
        let bag: ChunkedBag<u64, 4> = ChunkedBag::new();
        for i in 0..8 {
            bag.emplace(i);
        }

        bag.iterate_shared(|entry| {
            if *entry.get() < 4 {
                bag.erase(&entry);
            }
        });

        let mut seen = Vec::new();
        bag.iterate(|entry| seen.push(*entry.get()));
        seen.sort_unstable();
        assert_eq!(seen, vec![4, 5, 6, 7]);
    }

    #[test]
    fn mutate_through_entries() {
        let bag: ChunkedBag<u64, 4> = ChunkedBag::new();
        for i in 0..6 {
            bag.emplace(i);
        }

        bag.iterate(|entry| *entry.get_mut() *= 10);

        let mut sum = 0;
        bag.iterate_shared(|entry| sum += *entry.get());
        assert_eq!(sum, 150);
    }

    #[test]
    fn nested_iterate_reenters_without_deadlock() {
        let bag: ChunkedBag<u64, 4> = ChunkedBag::new();
        for i in 0..4 {
            bag.emplace(i);
        }

        let mut inner_total = 0;
        bag.iterate(|_outer| {
            bag.iterate(|inner| {
                inner_total += *inner.get();
            });
        });

        // 4 outer visits, each summing all 4 elements.
        assert_eq!(inner_total, 4 * 6);
    }

    #[test]
    fn dropping_reserved_skips_the_cursor() {
        let bag: ChunkedBag<u64, 4> = ChunkedBag::new();
        bag.emplace(1);

        let mut count = 0;
        bag.iterate(|_| count += 1);
        assert_eq!(count, 1);
    }

    #[test]
    fn elements_drop_with_the_bag() {
        use std::sync::atomic::AtomicUsize;

        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Counted;
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        {
            let bag: ChunkedBag<Counted, 4> = ChunkedBag::new();
            for _ in 0..10 {
                bag.emplace(Counted);
            }
            // Erased-but-unreclaimed elements are destroyed too.
            let mut first = true;
            bag.iterate(|entry| {
                if first {
                    bag.erase(&entry);
                    first = false;
                }
            });
        }

        assert_eq!(DROPS.load(Ordering::SeqCst), 10);
    }
}
