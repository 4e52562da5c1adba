//! Property-based tests for the allocators and containers.
//!
//! Lists are checked against `Vec`, tables against `hashbrown::HashMap`,
//! under random operation sequences.

use bedrock_mem::allocator::ALLOC_ALIGN;
use bedrock_mem::{Allocator, Arena, HashTable, List, Pool};
use proptest::prelude::*;

// ============================================================================
// List
// ============================================================================

#[derive(Debug, Clone)]
enum ListOp {
    Append(u32),
    Insert { seed: usize, negative: bool, value: u32 },
    Remove { seed: usize, negative: bool },
    StableRemove { seed: usize, negative: bool },
    RemoveRange { seed: usize, count: usize },
    MoveToFront { seed: usize },
    Pop,
    Shrink,
}

fn list_op() -> impl Strategy<Value = ListOp> {
    prop_oneof![
        4 => any::<u32>().prop_map(ListOp::Append),
        2 => (any::<usize>(), any::<bool>(), any::<u32>())
            .prop_map(|(seed, negative, value)| ListOp::Insert { seed, negative, value }),
        1 => (any::<usize>(), any::<bool>())
            .prop_map(|(seed, negative)| ListOp::Remove { seed, negative }),
        1 => (any::<usize>(), any::<bool>())
            .prop_map(|(seed, negative)| ListOp::StableRemove { seed, negative }),
        1 => (any::<usize>(), 0usize..8)
            .prop_map(|(seed, count)| ListOp::RemoveRange { seed, count }),
        1 => any::<usize>().prop_map(|seed| ListOp::MoveToFront { seed }),
        1 => Just(ListOp::Pop),
        1 => Just(ListOp::Shrink),
    ]
}

/// `position` as a list index, counted from the end when `negative`.
fn as_index(position: usize, len: usize, negative: bool) -> isize {
    if negative {
        position as isize - len as isize
    } else {
        position as isize
    }
}

fn apply(list: &mut List<'_, u32>, model: &mut Vec<u32>, op: &ListOp) {
    let len = model.len();
    match *op {
        ListOp::Append(value) => {
            list.append(value);
            model.push(value);
        }
        ListOp::Insert { seed, negative, value } => {
            let position = seed % (len + 1);
            let negative = negative && position < len;
            list.insert(as_index(position, len, negative), value);
            model.insert(position, value);
        }
        ListOp::Remove { seed, negative } => {
            if len == 0 {
                assert_eq!(list.remove(0), None);
            } else {
                let position = seed % len;
                let removed = list.remove(as_index(position, len, negative));
                assert_eq!(removed, Some(model.swap_remove(position)));
            }
        }
        ListOp::StableRemove { seed, negative } => {
            if len == 0 {
                assert_eq!(list.stable_remove(0), None);
            } else {
                let position = seed % len;
                let removed = list.stable_remove(as_index(position, len, negative));
                assert_eq!(removed, Some(model.remove(position)));
            }
        }
        ListOp::RemoveRange { seed, count } => {
            let position = seed % (len + 1);
            let count = count.min(len - position);
            list.stable_remove_range(position as isize, count);
            model.drain(position..position + count);
        }
        ListOp::MoveToFront { seed } => {
            if len > 0 {
                let position = seed % len;
                list.move_to_front(position as isize);
                let value = model.remove(position);
                model.insert(0, value);
            }
        }
        ListOp::Pop => {
            assert_eq!(list.pop(), model.pop());
        }
        ListOp::Shrink => {
            list.shrink();
            assert_eq!(list.capacity(), list.len());
        }
    }
}

proptest! {
    #[test]
    fn test_list_matches_vec(ops in proptest::collection::vec(list_op(), 0..200)) {
        let mut list = List::new();
        let mut model = Vec::new();
        for op in &ops {
            apply(&mut list, &mut model, op);
            prop_assert_eq!(list.as_slice(), model.as_slice());
            prop_assert!(list.len() <= list.capacity());
        }
    }

    #[test]
    fn test_list_in_arena_matches_vec(ops in proptest::collection::vec(list_op(), 0..100)) {
        let arena = Arena::with_capacity(256 * 1024);
        let mut list = List::new_in(arena.as_allocator());
        let mut model = Vec::new();
        for op in &ops {
            apply(&mut list, &mut model, op);
        }
        prop_assert_eq!(list.as_slice(), model.as_slice());
    }

    #[test]
    fn test_negative_index_matches_positive(
        values in proptest::collection::vec(any::<i64>(), 1..64),
        seed in any::<usize>(),
    ) {
        let list = List::from_slice_in(&values, Allocator::UNSET);
        let position = seed % values.len();
        let negative = position as isize - values.len() as isize;
        prop_assert_eq!(list[negative], list[position as isize]);
        prop_assert_eq!(list[negative], values[position]);
    }

    #[test]
    fn test_growth_keeps_prefix(
        first in proptest::collection::vec(any::<u8>(), 0..64),
        extra in 0usize..4096,
    ) {
        let mut list = List::from_slice_in(&first, Allocator::UNSET);
        list.ensure_space(extra);
        prop_assert!(list.capacity() >= first.len() + extra);
        prop_assert_eq!(list.as_slice(), first.as_slice());
    }
}

// ============================================================================
// Arena
// ============================================================================

proptest! {
    #[test]
    fn test_arena_allocations_are_disjoint(
        sizes in proptest::collection::vec(1usize..256, 1..64),
    ) {
        let arena = Arena::with_capacity(64 * 1024);
        let mut ranges = Vec::new();
        for &size in &sizes {
            let ptr = arena.allocate_bytes(size).as_ptr().addr();
            prop_assert_eq!(ptr % ALLOC_ALIGN, 0);
            ranges.push((ptr, ptr + size));
        }
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            prop_assert!(pair[0].1 <= pair[1].0);
        }
        prop_assert!(arena.used() <= arena.capacity());
    }

    #[test]
    fn test_arena_rewind_restores_cursor(
        before in proptest::collection::vec(1usize..128, 0..16),
        after in proptest::collection::vec(1usize..128, 0..16),
    ) {
        let mut arena = Arena::with_capacity(16 * 1024);
        for &size in &before {
            let _ = arena.allocate_bytes(size);
        }
        let mark = arena.mark();
        for &size in &after {
            let _ = arena.allocate_bytes(size);
        }
        arena.rewind(mark);
        prop_assert_eq!(arena.used(), mark.offset());

        // The next allocation starts where the first post-mark one did.
        let again = arena.allocate_bytes(1);
        arena.rewind(mark);
        let replay = arena.allocate_bytes(1);
        prop_assert_eq!(again, replay);
    }

    #[test]
    fn test_arena_grow_in_place(steps in proptest::collection::vec(1usize..512, 1..16)) {
        let arena = Arena::with_capacity(16 * 1024);
        let handle = arena.as_allocator();
        let mut size = steps[0];
        let ptr = handle.allocate(size).unwrap();
        for &next in &steps[1..] {
            let moved = unsafe { handle.reallocate(next, Some(ptr), size) }.unwrap();
            prop_assert_eq!(moved, ptr);
            prop_assert_eq!(arena.used(), next);
            size = next;
        }
    }
}

// ============================================================================
// Pool
// ============================================================================

proptest! {
    #[test]
    fn test_pool_values_never_move(
        values in proptest::collection::vec(any::<u64>(), 1..300),
        block_size in 64usize..512,
    ) {
        let pool = Pool::new_in(block_size, Allocator::UNSET);
        let slots: Vec<&mut u64> = values.iter().map(|&v| pool.alloc(v)).collect();
        for (slot, value) in slots.iter().zip(&values) {
            prop_assert_eq!(**slot, *value);
        }
    }
}

// ============================================================================
// Hash table
// ============================================================================

#[derive(Debug, Clone)]
enum TableOp {
    Insert(u16, u32),
    Upsert(u16, u32),
    Find(u16),
}

fn table_op() -> impl Strategy<Value = TableOp> {
    prop_oneof![
        (0u16..512, any::<u32>()).prop_map(|(k, v)| TableOp::Insert(k, v)),
        (0u16..512, 1u32..100).prop_map(|(k, v)| TableOp::Upsert(k, v)),
        (0u16..512).prop_map(TableOp::Find),
    ]
}

fn run_table_ops<S: std::hash::BuildHasher>(
    table: &mut HashTable<'_, u16, u32, S>,
    ops: &[TableOp],
) -> hashbrown::HashMap<u16, u32> {
    let mut model = hashbrown::HashMap::new();
    for op in ops {
        match *op {
            TableOp::Insert(key, value) => {
                let inserted = table.insert(key, value).is_some();
                let absent = !model.contains_key(&key);
                assert_eq!(inserted, absent);
                model.entry(key).or_insert(value);
            }
            TableOp::Upsert(key, delta) => {
                let slot = table.upsert(key);
                *slot = slot.wrapping_add(delta);
                let entry = model.entry(key).or_insert(0);
                *entry = entry.wrapping_add(delta);
            }
            TableOp::Find(key) => {
                assert_eq!(table.find(&key), model.get(&key));
            }
        }
    }
    model
}

proptest! {
    #[test]
    fn test_table_matches_hashbrown(ops in proptest::collection::vec(table_op(), 0..400)) {
        let mut table = HashTable::new();
        let model = run_table_ops(&mut table, &ops);

        prop_assert_eq!(table.len(), model.len());
        prop_assert!(table.len() <= table.max_load());
        for (key, value) in &model {
            prop_assert_eq!(table.find(key), Some(value));
        }
        prop_assert_eq!(table.iter().count(), model.len());
    }

    #[test]
    fn test_table_with_ahash_matches_hashbrown(
        ops in proptest::collection::vec(table_op(), 0..400),
    ) {
        let mut table = HashTable::with_hasher_in(ahash::RandomState::new(), Allocator::UNSET);
        let model = run_table_ops(&mut table, &ops);
        for (key, value) in &model {
            prop_assert_eq!(table.find(key), Some(value));
        }
    }

    #[test]
    fn test_rehash_preserves_membership(keys in proptest::collection::hash_set(any::<u64>(), 1..600)) {
        let mut table = HashTable::new();
        for (i, &key) in keys.iter().enumerate() {
            let before = table.capacity();
            table.insert(key, i);
            let after = table.capacity();
            if before != 0 && after != before {
                prop_assert_eq!(after, before * 2);
            }
        }
        for (i, key) in keys.iter().enumerate() {
            prop_assert_eq!(table.find(key), Some(&i));
        }
    }

    #[test]
    fn test_duplicate_insert_keeps_original(key in any::<i32>(), first in any::<u8>(), second in any::<u8>()) {
        let mut table = HashTable::new();
        prop_assert!(table.insert(key, first).is_some());
        prop_assert!(table.insert(key, second).is_none());
        prop_assert_eq!(table.find(&key), Some(&first));
    }
}
