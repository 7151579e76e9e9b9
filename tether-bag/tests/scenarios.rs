//! End-to-end scenarios at tiny chunk capacities, where every
//! maintenance path fires within a handful of operations.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use tether_bag::ChunkedBag;

fn live_values<const N: usize>(bag: &ChunkedBag<i64, N>) -> Vec<i64> {
    let mut values = Vec::new();
    bag.iterate(|entry| values.push(*entry.get()));
    values.sort_unstable();
    values
}

#[test]
fn cursor_survives_erase_and_compaction() {
    let bag: ChunkedBag<i64, 4> = ChunkedBag::new();

    for i in 0..15 {
        bag.emplace(i);
    }
    let cursor = bag.emplace(-1).into_tracked();

    // Erase the first element the walk hands us; compaction will
    // shuffle a tail element into the hole.
    let mut erased = None;
    bag.iterate(|entry| {
        if erased.is_none() {
            erased = Some(*entry.get());
            bag.erase(&entry);
        }
    });
    let erased = erased.unwrap();

    assert_eq!(*cursor.lock().unwrap().get(), -1);

    let live = live_values(&bag);
    assert_eq!(live.len(), 15);
    assert!(!live.contains(&erased) || erased == -1);
}

#[test]
fn mass_erase_shrinks_the_chunk_list_and_reuse_refills_it() {
    let bag: ChunkedBag<i64, 4> = ChunkedBag::new();

    let total = 80;
    for i in 0..total {
        bag.emplace(i);
    }
    assert_eq!(bag.chunk_count(), 20);
    let full_sum: i64 = (0..total).sum();
    assert_eq!(full_sum, 3160);

    // Erase with probability 0.70.
    let mut rng = SmallRng::seed_from_u64(42);
    let mut erased = Vec::new();
    bag.iterate(|entry| {
        if rng.gen_bool(0.70) {
            erased.push(*entry.get());
            bag.erase(&entry);
        }
    });
    assert!(!erased.is_empty());

    // Emptied chunks were unlinked along the way.
    assert!(bag.chunk_count() < 20);

    let erased_sum: i64 = erased.iter().sum();
    let live_sum: i64 = live_values(&bag).iter().sum();
    assert_eq!(live_sum, full_sum - erased_sum);

    // Re-emplace what was erased; the freed capacity is reused.
    for value in erased {
        bag.emplace(value);
    }
    let live_sum: i64 = live_values(&bag).iter().sum();
    assert_eq!(live_sum, full_sum);
}

#[test]
fn erased_cursor_goes_dead_and_stays_dead() {
    let bag: ChunkedBag<i64, 4> = ChunkedBag::new();

    let cursor = bag.emplace(99).into_tracked();
    assert!(cursor.lock().is_some());

    bag.erase_tracked(&cursor);
    assert!(cursor.lock().is_none());
    assert!(cursor.lock_shared().is_none());

    // A second erase through the dead cursor is a no-op.
    bag.erase_tracked(&cursor);

    // A replacement element must not revive the old cursor, even
    // though it lands in the same slot.
    bag.emplace(100);
    assert!(cursor.lock().is_none());
    assert_eq!(live_values(&bag), vec![100]);
}

#[test]
fn compaction_retargets_cursor_on_moved_element() {
    let bag: ChunkedBag<i64, 4> = ChunkedBag::new();

    // Two chunks: the first-filled chunk holds 0..=3, the head 4..=7.
    for i in 0..8 {
        bag.emplace(i);
    }
    assert_eq!(bag.chunk_count(), 2);

    // Cursor on the last slot of the older chunk.
    let mut cursor = None;
    bag.iterate(|entry| {
        if *entry.get() == 3 {
            cursor = Some(entry.tracked());
        }
    });
    let cursor = cursor.unwrap();

    // Erase the older chunk's first element; compaction moves 3 into
    // the vacated slot and must drag the cursor along.
    bag.iterate(|entry| {
        if *entry.get() == 0 {
            bag.erase(&entry);
        }
    });

    assert_eq!(*cursor.lock().unwrap().get(), 3);
    assert_eq!(live_values(&bag), vec![1, 2, 3, 4, 5, 6, 7]);
}

#[test]
fn cursor_invalidated_when_destination_slot_reused() {
    let bag: ChunkedBag<i64, 4> = ChunkedBag::new();

    for i in 0..8 {
        bag.emplace(i);
    }

    // Cursor on the element that is about to be erased: compaction
    // moving another element into its slot must not rebind it.
    let mut doomed = None;
    bag.iterate(|entry| {
        if *entry.get() == 0 {
            doomed = Some(entry.tracked());
        }
    });
    let doomed = doomed.unwrap();

    bag.iterate(|entry| {
        if *entry.get() == 0 {
            bag.erase(&entry);
        }
    });

    assert!(doomed.lock().is_none());
}

#[test]
fn draining_a_chunk_unlinks_it() {
    let bag: ChunkedBag<i64, 4> = ChunkedBag::new();

    for i in 0..8 {
        bag.emplace(i);
    }
    assert_eq!(bag.chunk_count(), 2);

    // Erase everything in the older (non-head) chunk.
    bag.iterate(|entry| {
        if *entry.get() < 4 {
            bag.erase(&entry);
        }
    });

    assert_eq!(bag.chunk_count(), 1);
    assert_eq!(live_values(&bag), vec![4, 5, 6, 7]);
}

#[test]
fn draining_two_neighbors_merges_them() {
    // Threshold is N / 4 = 2: two non-head chunks with one survivor
    // each can merge.
    let bag: ChunkedBag<i64, 8> = ChunkedBag::new();

    for i in 0..24 {
        bag.emplace(i);
    }
    assert_eq!(bag.chunk_count(), 3);

    // Leave one element in each of the two older chunks (0..=7 and
    // 8..=15); the head chunk (16..=23) is untouched.
    bag.iterate(|entry| {
        let value = *entry.get();
        if value < 16 && value != 0 && value != 8 {
            bag.erase(&entry);
        }
    });

    assert_eq!(bag.chunk_count(), 2);

    let mut expected = vec![0, 8];
    expected.extend(16..24);
    assert_eq!(live_values(&bag), expected);
}

#[test]
fn cursor_outlives_the_bag() {
    let bag: ChunkedBag<i64, 4> = ChunkedBag::new();
    let cursor = bag.emplace(7).into_tracked();
    let bystander = bag.emplace(8).into_tracked();

    assert_eq!(*cursor.lock().unwrap().get(), 7);
    drop(bag);

    // Both cursors went dead with their container; releasing them
    // afterwards must not touch the departed free list.
    assert!(cursor.lock().is_none());
    assert!(bystander.lock().is_none());
    drop(cursor);
    drop(bystander);
}

#[test]
fn shared_iteration_reads_while_erasing() {
    let bag: ChunkedBag<i64, 4> = ChunkedBag::new();
    for i in 0..16 {
        bag.emplace(i);
    }

    // erase(handle) is legal under a shared hold - it only flips the
    // aliveness bit and counts the hole.
    let mut sum = 0;
    bag.iterate_shared(|entry| {
        sum += *entry.get();
        if *entry.get() % 4 == 0 {
            bag.erase(&entry);
        }
    });
    assert_eq!(sum, (0..16).sum::<i64>());

    assert_eq!(
        live_values(&bag),
        (0..16).filter(|v| v % 4 != 0).collect::<Vec<_>>()
    );
}

#[test]
fn emplace_reuses_holes_before_growing() {
    let bag: ChunkedBag<i64, 4> = ChunkedBag::new();
    for i in 0..16 {
        bag.emplace(i);
    }
    let chunks_before = bag.chunk_count();

    // Punch holes in the older chunks.
    bag.iterate(|entry| {
        if *entry.get() % 2 == 0 {
            bag.erase(&entry);
        }
    });

    // Refill: the free list must hand back the compacted chunks
    // instead of growing the list.
    for i in 0..8 {
        bag.emplace(100 + i);
    }
    assert!(bag.chunk_count() <= chunks_before);
    assert_eq!(live_values(&bag).len(), 16);
}

#[test]
fn tiny_bag_lifecycle() {
    // One chunk, every slot state exercised.
    let bag: ChunkedBag<i64, 4> = ChunkedBag::new();

    let a = bag.emplace(1).into_tracked();
    let b = bag.emplace(2).into_tracked();

    bag.erase_tracked(&a);
    assert!(a.lock().is_none());
    assert_eq!(*b.lock().unwrap().get(), 2);

    bag.iterate(|entry| *entry.get_mut() += 10);
    assert_eq!(*b.lock().unwrap().get(), 12);

    bag.erase_tracked(&b);
    assert_eq!(live_values(&bag), Vec::<i64>::new());

    // The lone chunk is the head; it never unlinks.
    assert_eq!(bag.chunk_count(), 1);
}
