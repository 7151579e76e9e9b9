//! Fixed-capacity element arenas and the handles used to visit them.
//!
//! A chunk owns raw storage for up to `N` elements, a per-slot
//! aliveness bitmap, and a high-water mark `size`: slot `i` holds a
//! live element iff `alive[i]` is set and `i < size`. Erasure only
//! clears the bit and counts the hole; reclamation is maintenance's
//! job (see [`crate::maintain`]).
//!
//! Locking (see the crate docs for the full order):
//!
//! - `lock` - recursive, level-counting, writer-biased RW spinlock.
//!   Exclusive for single-threaded maintenance and mutating visits,
//!   shared for read-only visits.
//! - `maint_lock` - guards structural state: `size`/`deleted_count`
//!   transitions, free-list membership, linked-list rewiring. Taken
//!   while already holding `lock` exclusively, or standalone during
//!   emplace.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use crossbeam_utils::CachePadded;

use tether_sync::{LevelCounter, RawLock as _, RawSpinLock, Recursive, RwSpinLock, YIELD};

use crate::track::{Trackable, Tracked};
use crate::{ERASE_IMMEDIATELY, MaintHandle};

/// The chunk ownership lock: writer-biased RW spinlock, recursive in
/// exclusive mode, with a nesting-level counter on top so maintenance
/// can refuse to run below the outermost frame.
pub(crate) type ChunkLock = LevelCounter<Recursive<RwSpinLock>>;

/// Free-list intrusive links. Read and written only under the free
/// list's own lock.
pub(crate) struct FreeLinks<T, const N: usize> {
    pub(crate) prev: *const Chunk<T, N>,
    pub(crate) next: *const Chunk<T, N>,
}

/// A fixed-capacity arena for up to `N` elements.
pub(crate) struct Chunk<T, const N: usize> {
    /// Ownership lock; padded so contended acquisition does not false-share
    /// with the counters below.
    pub(crate) lock: CachePadded<ChunkLock>,
    /// Structural lock; may be held across compaction, so it yields.
    pub(crate) maint_lock: RawSpinLock<YIELD>,

    /// Whether this chunk is the current emplace target. Advisory for
    /// maintenance (never merge or delete the head); transitions only
    /// under the container's head lock.
    pub(crate) is_first: AtomicBool,

    /// High-water mark: slots `[0, size)` have been constructed since
    /// the last compaction.
    size: AtomicUsize,
    /// Dead slots within `[0, size)`. Reset only by compaction.
    deleted_count: AtomicUsize,

    /// Kept apart from the values: most visits skip dead slots without
    /// touching element memory.
    alive: [AtomicBool; N],
    storage: [UnsafeCell<MaybeUninit<T>>; N],

    /// RefCell-discipline borrow flags for exclusive-mode element
    /// access; see [`SlotRef`]/[`SlotMut`].
    borrows: [UnsafeCell<u8>; N],

    /// Per-slot cursor registries.
    pub(crate) trackables: [Trackable<T, N>; N],

    /// Linked-list edges. Shared ownership with atomic swap so readers
    /// can traverse without any lock; rewired only under `maint_lock`.
    pub(crate) prev: ArcSwapOption<Chunk<T, N>>,
    pub(crate) next: ArcSwapOption<Chunk<T, N>>,

    pub(crate) in_free_list: AtomicBool,
    pub(crate) free_links: UnsafeCell<FreeLinks<T, N>>,

    /// Route back to the container's free list for maintenance that
    /// runs after the container handle is out of reach (cursor access
    /// release). Nulled by the container's teardown.
    pub(crate) maint_handle: MaintHandle<T, N>,

    me: Weak<Chunk<T, N>>,
}

// Safety: all shared state is atomics, lock-guarded UnsafeCells, or
// ArcSwap. Elements are handed out as &T only under a shared or
// exclusive hold (T: Sync) and as &mut T only under an exclusive hold
// (T: Send).
unsafe impl<T: Send, const N: usize> Send for Chunk<T, N> {}
unsafe impl<T: Send + Sync, const N: usize> Sync for Chunk<T, N> {}

impl<T, const N: usize> Chunk<T, N> {
    /// Chunks whose live count sinks to this threshold try to merge
    /// with a neighbor. Guards against the pathological "many
    /// nearly-empty chunks" shape only.
    pub(crate) const MERGE_THRESHOLD: usize = N / 4;

    pub(crate) fn new(maint_handle: MaintHandle<T, N>, is_first: bool) -> Arc<Self> {
        const {
            assert!(N > 0, "chunk capacity must be nonzero");
        }
        Arc::new_cyclic(|me| Self {
            lock: CachePadded::new(LevelCounter::new(Recursive::new(RwSpinLock::new()))),
            maint_lock: RawSpinLock::new(),
            is_first: AtomicBool::new(is_first),
            size: AtomicUsize::new(0),
            deleted_count: AtomicUsize::new(0),
            alive: [const { AtomicBool::new(false) }; N],
            storage: [const { UnsafeCell::new(MaybeUninit::uninit()) }; N],
            borrows: [const { UnsafeCell::new(0) }; N],
            trackables: [const { Trackable::new() }; N],
            prev: ArcSwapOption::const_empty(),
            next: ArcSwapOption::const_empty(),
            in_free_list: AtomicBool::new(false),
            free_links: UnsafeCell::new(FreeLinks {
                prev: ptr::null(),
                next: ptr::null(),
            }),
            maint_handle,
            me: me.clone(),
        })
    }

    /// Upgrades `&self` back to a shared handle. `None` once the last
    /// handle is gone and the chunk is tearing down.
    #[inline]
    pub(crate) fn self_arc(&self) -> Option<Arc<Self>> {
        self.me.upgrade()
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn deleted_count(&self) -> usize {
        self.deleted_count.load(Ordering::Relaxed)
    }

    /// Live element count. Racy outside the locks; decision sites
    /// re-check under `maint_lock`.
    #[inline]
    pub(crate) fn alive_count(&self) -> usize {
        self.size().saturating_sub(self.deleted_count())
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.size() == N
    }

    #[inline]
    pub(crate) fn is_first(&self) -> bool {
        self.is_first.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_alive(&self, index: usize) -> bool {
        self.alive[index].load(Ordering::Acquire)
    }

    // -------------------------------------------------------------------------
    // Element storage
    // -------------------------------------------------------------------------

    /// Raw pointer to the element in `index`. Whether the bytes are a
    /// live `T` is governed by `alive`/`size`; the caller must know.
    #[inline]
    pub(crate) fn slot_ptr(&self, index: usize) -> *mut T {
        debug_assert!(index < N);
        self.storage[index].get().cast::<T>()
    }

    /// Shared reference to the element in `index`.
    ///
    /// # Safety
    ///
    /// The caller must hold the chunk lock (either mode) and the slot
    /// must contain a constructed element. No [`SlotMut`] may be
    /// outstanding for the slot (guaranteed under a shared hold, where
    /// none can exist).
    #[inline]
    pub(crate) unsafe fn element<'a>(&'a self, index: usize) -> &'a T {
        // Safety: per the contract above.
        unsafe { &*self.slot_ptr(index) }
    }

    /// Borrow-checked shared access for exclusive-mode holders.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the chunk lock exclusively and the
    /// slot must contain a constructed element.
    ///
    /// # Panics
    ///
    /// Panics if the slot is mutably borrowed (nested visit).
    pub(crate) unsafe fn element_ref<'a>(&'a self, index: usize) -> SlotRef<'a, T> {
        // Safety: the exclusive hold makes this thread the only one
        // touching the flag.
        let flag = unsafe { &mut *self.borrows[index].get() };
        assert!(*flag != BORROW_MUT, "element already mutably borrowed");
        assert!(*flag < BORROW_MUT - 1, "element borrow overflow");
        *flag += 1;
        SlotRef {
            // Safety: constructed element per the contract.
            value: unsafe { &*self.slot_ptr(index) },
            flag: &self.borrows[index],
        }
    }

    /// Borrow-checked mutable access for exclusive-mode holders.
    ///
    /// # Safety
    ///
    /// Same contract as [`Chunk::element_ref`].
    ///
    /// # Panics
    ///
    /// Panics if the slot is borrowed in any mode (nested visit).
    pub(crate) unsafe fn element_mut<'a>(&'a self, index: usize) -> SlotMut<'a, T> {
        // Safety: the exclusive hold makes this thread the only one
        // touching the flag.
        let flag = unsafe { &mut *self.borrows[index].get() };
        assert!(*flag == 0, "element already borrowed");
        *flag = BORROW_MUT;
        SlotMut {
            value: self.slot_ptr(index),
            flag: &self.borrows[index],
            _marker: std::marker::PhantomData,
        }
    }

    // -------------------------------------------------------------------------
    // Core operations
    // -------------------------------------------------------------------------

    /// Constructs `value` in the next slot and returns its index.
    ///
    /// Caller must hold `maint_lock` and the chunk must not be full.
    pub(crate) fn emplace(&self, value: T) -> usize {
        let index = self.size.load(Ordering::Relaxed);
        debug_assert!(index < N, "emplace into a full chunk");

        // Safety: slots at and above `size` hold no element, and
        // readers never touch a slot before observing its aliveness
        // bit, stored with release below.
        unsafe { self.slot_ptr(index).write(value) };
        self.alive[index].store(true, Ordering::Release);
        self.size.fetch_add(1, Ordering::Release);

        index
    }

    /// Marks the slot dead. The element itself lives on until
    /// compaction or chunk teardown - erase runs on hot paths under a
    /// shared hold and must not move anything.
    pub(crate) fn erase(&self, index: usize) {
        assert!(index < N, "erase index out of bounds");

        // swap, not store: erasing an already-dead slot (a stale
        // handle) must not inflate the hole count.
        if self.alive[index].swap(false, Ordering::Release) {
            self.deleted_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Calls `f` for every live slot. Caller must hold the chunk lock
    /// in the mode named by `SHARED`.
    pub(crate) fn visit<const SHARED: bool, F>(&self, f: &mut F)
    where
        F: FnMut(Entry<'_, T, N, SHARED>),
    {
        let size = self.size();
        let ordering = if ERASE_IMMEDIATELY {
            Ordering::Acquire
        } else {
            Ordering::Relaxed
        };
        for index in 0..size {
            if !self.alive[index].load(ordering) {
                continue;
            }
            f(Entry { chunk: self, index });
        }
    }

    // -------------------------------------------------------------------------
    // Maintenance mutators (compact / merge); all require the exclusive
    // lock plus maint_lock.
    // -------------------------------------------------------------------------

    #[inline]
    pub(crate) fn set_alive(&self, index: usize, alive: bool) {
        self.alive[index].store(alive, Ordering::Release);
    }

    #[inline]
    pub(crate) fn store_size(&self, size: usize) {
        self.size.store(size, Ordering::Release);
    }

    #[inline]
    pub(crate) fn bump_size(&self) {
        self.size.fetch_add(1, Ordering::Release);
    }

    #[inline]
    pub(crate) fn reset_deleted(&self) {
        self.deleted_count.store(0, Ordering::Relaxed);
    }
}

impl<T, const N: usize> Drop for Chunk<T, N> {
    fn drop(&mut self) {
        // Late cursors can still reach us through their registered
        // pointers until we cut them. Hold the exclusive lock so any
        // access guard created in the meantime drains first, then
        // invalidate every slot's registry - dead slots included, they
        // may still carry cursors - before destroying elements.
        self.lock.lock();

        let size = self.size.load(Ordering::Acquire);
        for index in 0..size {
            crate::track::track_delete(self, index);

            // Dead slots still own their element until compaction runs;
            // slots that were moved out have already left `[0, size)`.
            // Safety: every slot below the high-water mark holds a
            // constructed element nobody can reach anymore.
            unsafe { ptr::drop_in_place(self.slot_ptr(index)) };
        }

        // Safety: taken above.
        unsafe { self.lock.unlock() };
    }
}

// =============================================================================
// Borrow-flagged element guards
// =============================================================================

const BORROW_MUT: u8 = u8::MAX;

/// Shared reference to an element, checked against concurrent same-
/// thread mutable borrows from nested visits.
pub struct SlotRef<'a, T> {
    value: &'a T,
    flag: &'a UnsafeCell<u8>,
}

impl<T> Deref for SlotRef<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.value
    }
}

impl<T> Drop for SlotRef<'_, T> {
    #[inline]
    fn drop(&mut self) {
        // Safety: flags are only touched by the thread holding the
        // chunk exclusively; we are it.
        unsafe { *self.flag.get() -= 1 };
    }
}

/// Mutable reference to an element, checked against any other borrow
/// of the same slot from nested visits.
pub struct SlotMut<'a, T> {
    value: *mut T,
    flag: &'a UnsafeCell<u8>,
    _marker: std::marker::PhantomData<&'a mut T>,
}

impl<T> Deref for SlotMut<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: the borrow flag grants this guard unique access.
        unsafe { &*self.value }
    }
}

impl<T> DerefMut for SlotMut<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the borrow flag grants this guard unique access.
        unsafe { &mut *self.value }
    }
}

impl<T> Drop for SlotMut<'_, T> {
    #[inline]
    fn drop(&mut self) {
        // Safety: flags are only touched by the thread holding the
        // chunk exclusively; we are it.
        unsafe { *self.flag.get() = 0 };
    }
}

// =============================================================================
// Entry
// =============================================================================

/// Handle to one live element, passed to iteration closures.
///
/// `SHARED` mirrors the hold the iteration runs under: exclusive
/// entries (`SHARED = false`) can borrow the element mutably, shared
/// entries only immutably. Either kind can be erased through
/// [`ChunkedBag::erase`](crate::ChunkedBag::erase) or promoted to a
/// [`Tracked`] cursor.
pub struct Entry<'a, T, const N: usize, const SHARED: bool> {
    pub(crate) chunk: &'a Chunk<T, N>,
    pub(crate) index: usize,
}

impl<'a, T, const N: usize, const SHARED: bool> Entry<'a, T, N, SHARED> {
    /// Registers a trackable cursor on this element.
    ///
    /// The cursor stays valid across compaction and merges (it is
    /// retargeted) and goes dead when the element does.
    pub fn tracked(&self) -> Tracked<T, N> {
        // Safety: the iteration hold on the chunk pins the slot: no
        // compaction, merge, or teardown can run concurrently.
        unsafe { Tracked::register(self.chunk, self.index) }
    }
}

impl<'a, T, const N: usize> Entry<'a, T, N, false> {
    /// Borrows the element.
    ///
    /// # Panics
    ///
    /// Panics if a nested visit of the same slot holds it mutably.
    #[inline]
    pub fn get(&self) -> SlotRef<'_, T> {
        // Safety: an exclusive entry witnesses the exclusive hold; the
        // slot was alive when the entry was produced and nothing can
        // move it while the hold lasts.
        unsafe { self.chunk.element_ref(self.index) }
    }

    /// Borrows the element mutably.
    ///
    /// # Panics
    ///
    /// Panics if a nested visit of the same slot holds it in any mode.
    #[inline]
    pub fn get_mut(&self) -> SlotMut<'_, T> {
        // Safety: as in `get`.
        unsafe { self.chunk.element_mut(self.index) }
    }
}

impl<'a, T, const N: usize> Entry<'a, T, N, true> {
    /// Borrows the element.
    #[inline]
    pub fn get(&self) -> &T {
        // Safety: a shared entry witnesses a shared hold; no mutable
        // access can exist anywhere while it lasts.
        unsafe { self.chunk.element(self.index) }
    }
}
