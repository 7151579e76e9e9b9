//! Maintenance: compaction, merging, chunk removal.
//!
//! Runs piggybacked on lock releases - after a visit, after an erase
//! (in erase-immediately mode), when a cursor access guard drops. The
//! entry point is [`maintain_and_release`], which decides among no-op,
//! compact, merge, and remove, then releases the hold it was given.
//!
//! Two hard rules:
//!
//! - maintenance runs only at the outermost lock level
//!   (`lock.level() == 1`) - never as a side effect of a nested visit;
//! - a shared hold is never upgraded by blocking. It is dropped and
//!   exclusive is *tried*; on failure some other release will get to
//!   the work eventually.

use std::ptr;
use std::sync::Arc;

use tether_sync::{RawLock as _, RawRwLock as _, lock_pair};

use crate::chunk::Chunk;
use crate::free_list::FreeList;
use crate::track::{track_delete, track_move};

/// Runs the free-list closure against `direct` when the caller is the
/// container itself, else through the chunk's maintenance handle -
/// which the container nulls at teardown, so late releases quietly
/// skip free-list work. The handle's lock is held across `f`; teardown
/// waits on it before it starts freeing chunks.
fn with_free_list<T, const N: usize>(
    chunk: &Chunk<T, N>,
    direct: Option<&FreeList<T, N>>,
    f: impl FnOnce(&FreeList<T, N>),
) {
    if let Some(free_list) = direct {
        f(free_list);
        return;
    }
    let guard = chunk.maint_handle.lock();
    if let Some(free_list) = guard.as_deref() {
        f(free_list);
    }
}

/// Caller holds `chunk`'s maintenance lock.
fn try_add_to_free_list<T, const N: usize>(chunk: &Chunk<T, N>, direct: Option<&FreeList<T, N>>) {
    if !chunk.in_free_list.load(std::sync::atomic::Ordering::Relaxed)
        && !chunk.is_full()
        && !chunk.is_first()
    {
        with_free_list(chunk, direct, |free_list| free_list.add(chunk));
    }
}

/// Caller holds `chunk`'s maintenance lock.
fn try_remove_from_free_list<T, const N: usize>(
    chunk: &Chunk<T, N>,
    direct: Option<&FreeList<T, N>>,
) {
    if chunk.in_free_list.load(std::sync::atomic::Ordering::Relaxed) {
        with_free_list(chunk, direct, |free_list| free_list.erase(chunk));
    }
}

/// Densifies a chunk in place: moves live elements from the tail into
/// dead holes until no holes remain below the high-water mark.
///
/// Caller holds the chunk exclusively plus its maintenance lock.
pub(crate) fn compact<T, const N: usize>(chunk: &Chunk<T, N>) {
    let mut deleted_left = chunk.deleted_count();
    let mut size = chunk.size();

    let mut index = 0;
    while index < size {
        if chunk.is_alive(index) {
            index += 1;
            continue;
        }

        // Peel dead slots off the tail first; their elements die here.
        while size > 0 && !chunk.is_alive(size - 1) {
            track_delete(chunk, size - 1);
            // Safety: dead slots below the high-water mark still own a
            // constructed element (erase defers destruction to us).
            unsafe { ptr::drop_in_place(chunk.slot_ptr(size - 1)) };
            deleted_left -= 1;
            size -= 1;
        }
        if index >= size {
            break;
        }

        // Relocate the tail element into the hole. Cursors first, so a
        // registered cursor never observes the half-moved state (the
        // exclusive hold keeps them from dereferencing meanwhile).
        track_move(chunk, size - 1, chunk, index);
        // Safety: the hole owns a dead element (dropped here), the
        // tail owns a live one (relocated bitwise; the source slot
        // leaves the high-water range and is never dropped).
        unsafe {
            let hole = chunk.slot_ptr(index);
            let tail = chunk.slot_ptr(size - 1);
            ptr::drop_in_place(hole);
            ptr::copy_nonoverlapping(tail, hole, 1);
        }
        chunk.set_alive(index, true);
        chunk.set_alive(size - 1, false);
        size -= 1;

        deleted_left -= 1;
        if deleted_left == 0 {
            break;
        }
        index += 1;
    }

    chunk.reset_deleted();
    chunk.store_size(size);
}

/// Drains every live element of `from` into `to`.
///
/// Caller holds both chunks exclusively plus both maintenance locks,
/// and has verified the combined live count fits.
pub(crate) fn merge<T, const N: usize>(to: &Chunk<T, N>, from: &Chunk<T, N>) {
    if to.deleted_count() > 0 {
        compact(to);
    }

    let from_size = from.size();
    for index in 0..from_size {
        if !from.is_alive(index) {
            // Dead slots still own an element and may still carry
            // cursors; both end here, along with the chunk.
            track_delete(from, index);
            // Safety: as in compact's tail peel.
            unsafe { ptr::drop_in_place(from.slot_ptr(index)) };
            continue;
        }

        let to_index = to.size();
        debug_assert!(to_index < N);

        track_move(from, index, to, to_index);
        // Safety: the destination slot is above `to`'s high-water mark
        // (uninitialized), the source owns a live element which is
        // relocated bitwise and not dropped.
        unsafe { ptr::copy_nonoverlapping(from.slot_ptr(index), to.slot_ptr(to_index), 1) };
        to.set_alive(to_index, true);
        to.bump_size();
    }

    from.store_size(0);
    from.reset_deleted();
}

/// Unlinks `chunk` from the container's list.
///
/// Caller holds the chunk exclusively plus its maintenance lock.
/// Returns a handle the caller must keep alive until it is done
/// touching the chunk; concurrent traversals keep their own.
///
/// The CASes tolerate losing to a concurrent unlink of a neighbor -
/// whoever wins took responsibility for that edge, and the next
/// maintenance pass re-attempts anything left over. Only `prev` is
/// zeroed: the `next` edge must survive so traversals that already
/// reached this chunk can continue past it.
pub(crate) fn remove_chunk<T, const N: usize>(chunk: &Chunk<T, N>) -> Option<Arc<Chunk<T, N>>> {
    let this = chunk.self_arc()?;

    let prev = chunk.prev.load_full();
    let next = chunk.next.load_full();

    if let Some(prev) = &prev {
        let expected = Some(Arc::clone(&this));
        let _ = prev.next.compare_and_swap(&expected, next.clone());
    }
    if let Some(next) = &next {
        let expected = Some(Arc::clone(&this));
        let _ = next.prev.compare_and_swap(&expected, prev.clone());
    }

    chunk.prev.store(None);

    Some(this)
}

fn can_merge<T, const N: usize>(a: &Chunk<T, N>, b: &Chunk<T, N>) -> bool {
    !a.is_first()
        && !b.is_first()
        && a.alive_count() + b.alive_count() <= Chunk::<T, N>::MERGE_THRESHOLD
}

/// Attempts to merge `chunk` (held exclusively by the caller) with a
/// neighbor. Returns whether a merge happened, plus a keep-alive for
/// the absorbed chunk.
fn try_merge_with<T, const N: usize>(
    chunk: &Chunk<T, N>,
    other: &Chunk<T, N>,
    direct: Option<&FreeList<T, N>>,
) -> (bool, Option<Arc<Chunk<T, N>>>) {
    if !can_merge(chunk, other) {
        return (false, None);
    }

    if !other.lock.try_lock() {
        return (false, None);
    }
    // A recursive acquisition means this thread is already inside a
    // visit of `other` further up the stack; moving its elements out
    // from under that frame is off the table.
    // Safety: we hold `other` exclusively.
    if unsafe { other.lock.level() } != 1 {
        // Safety: taken above.
        unsafe { other.lock.unlock() };
        return (false, None);
    }

    lock_pair(&chunk.maint_lock, &other.maint_lock);

    let mut keep_alive = None;
    let merged = can_merge(chunk, other);
    if merged {
        // Merge into whichever side carries more, so fewer elements
        // move.
        let (to, from) = if chunk.alive_count() > other.alive_count() {
            (chunk, other)
        } else {
            (other, chunk)
        };

        merge(to, from);

        try_remove_from_free_list(from, direct);
        try_add_to_free_list(to, direct);

        keep_alive = remove_chunk(from);
    }

    // Safety: all three taken above.
    unsafe {
        chunk.maint_lock.unlock();
        other.maint_lock.unlock();
        other.lock.unlock();
    }

    (merged, keep_alive)
}

/// The maintenance body; runs under the chunk's exclusive lock.
///
/// Returns a keep-alive for any chunk unlinked along the way
/// (possibly `chunk` itself). The caller must not drop it until after
/// it has released `chunk`'s lock: it may be the last handle, and the
/// chunk's teardown would otherwise run under our own feet.
fn try_maintain<T, const N: usize>(
    chunk: &Chunk<T, N>,
    need_merge: bool,
    direct: Option<&FreeList<T, N>>,
) -> Option<Arc<Chunk<T, N>>> {
    // Only at the top of the stack: a nested visit above us may hold
    // element borrows into this chunk.
    // Safety: we hold the exclusive lock.
    if unsafe { chunk.lock.level() } != 1 {
        return None;
    }

    let mut keep_alive: Option<Arc<Chunk<T, N>>> = None;

    // Empty non-head chunk: unlink it outright.
    if chunk.alive_count() == 0 && !chunk.is_first() {
        chunk.maint_lock.lock();
        if chunk.alive_count() == 0 && !chunk.is_first() {
            try_remove_from_free_list(chunk, direct);
            keep_alive = remove_chunk(chunk);
            // Safety: taken above.
            unsafe { chunk.maint_lock.unlock() };
            return keep_alive;
        }
        // Safety: taken above.
        unsafe { chunk.maint_lock.unlock() };
    }

    if need_merge {
        let mut merged = false;
        if let Some(prev) = chunk.prev.load_full() {
            let (did, keep) = try_merge_with(chunk, &*prev, direct);
            merged = did;
            if keep.is_some() {
                keep_alive = keep;
            }
        }
        if !merged {
            if let Some(next) = chunk.next.load_full() {
                let (_, keep) = try_merge_with(chunk, &*next, direct);
                if keep.is_some() {
                    keep_alive = keep;
                }
            }
        }
    }

    // Still holes left (merge may have emptied us instead)?
    if chunk.deleted_count() > 0 {
        chunk.maint_lock.lock();
        compact(chunk);
        try_add_to_free_list(chunk, direct);
        // Safety: taken above.
        unsafe { chunk.maint_lock.unlock() };
    }

    keep_alive
}

/// Decides among no-op / compact / merge / remove for `chunk`, then
/// releases the hold the caller arrived with (`SHARED` names its
/// mode).
///
/// `direct` is the container's own free list when the container is the
/// caller; cursor-release paths pass `None` and route through the
/// chunk's maintenance handle instead.
pub(crate) fn maintain_and_release<T, const N: usize, const SHARED: bool>(
    chunk: &Chunk<T, N>,
    direct: Option<&FreeList<T, N>>,
) {
    let need_merge = !chunk.is_first() && chunk.alive_count() <= Chunk::<T, N>::MERGE_THRESHOLD;
    let need_compact = chunk.deleted_count() > 0;
    let need_maintain = need_merge || need_compact;

    if !SHARED {
        let keep_alive = if need_maintain {
            try_maintain(chunk, need_merge, direct)
        } else {
            None
        };
        // Safety: the caller held the exclusive lock and handed its
        // release to us.
        unsafe { chunk.lock.unlock() };
        // Only now may an unlinked chunk's last handle go: its
        // teardown re-takes the lock we just released.
        drop(keep_alive);
    } else {
        // Safety: the caller held the shared lock and handed its
        // release to us.
        unsafe { chunk.lock.unlock_shared() };

        // No blocking upgrade - try exclusive; if someone else is in,
        // their release will maintain.
        if need_maintain && chunk.lock.try_lock() {
            let keep_alive = try_maintain(chunk, need_merge, direct);
            // Safety: taken above.
            unsafe { chunk.lock.unlock() };
            drop(keep_alive);
        }
    }
}
