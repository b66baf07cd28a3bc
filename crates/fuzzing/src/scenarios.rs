//! Deterministic tests of specific heap behaviors: sentinels, the fit policy,
//! splitting, each coalescing case, and every reallocation path.

use super::*;
use segregated_fit::{
    layout::{adjusted_size, CHUNK_SIZE, MIN_BLOCK_SIZE, OVERHEAD, WORD},
    size_class, AllocError, Allocator, BlockState, HeapStats, SegregatedAllocator,
    SingleThreadedLock,
};
use std::alloc::Layout;

const MEGABYTE: usize = 1 << 20;

/// The arena length of a freshly bootstrapped heap: pad, prologue header and
/// footer, epilogue header.
const BOOTSTRAP_LEN: usize = 4 * WORD;

/// A block size in the smallest class above the minimum block.
const SMALL: usize = MIN_BLOCK_SIZE + DOUBLE_WORD;

fn heap() -> TestHeap {
    let _ = env_logger::try_init();
    new_heap(MEGABYTE).unwrap()
}

/// Allocate a block of exactly `block_size` bytes.
fn alloc_block(heap: &mut TestHeap, block_size: usize) -> Addr {
    let addr = heap.allocate(block_size - OVERHEAD).unwrap().unwrap();
    assert_eq!(heap.block_size(addr), block_size);
    addr
}

fn in_free_list(heap: &TestHeap, class: usize, addr: Addr) -> bool {
    heap.free_list(class).any(|a| a == addr)
}

fn free_block_count(heap: &TestHeap) -> usize {
    heap.blocks().filter(|b| b.is_free()).count()
}

fn fill(heap: &mut TestHeap, addr: Addr, len: usize, byte: u8) {
    heap.payload_mut(addr)[..len].fill(byte);
}

fn holds(heap: &TestHeap, addr: Addr, len: usize, byte: u8) -> bool {
    heap.payload(addr)[..len].iter().all(|b| *b == byte)
}

#[test]
fn bootstrap_creates_only_sentinels() {
    let mut heap = heap();
    assert_eq!(heap.arena().len(), BOOTSTRAP_LEN);
    assert_eq!(heap.blocks().count(), 0);
    assert_eq!(
        heap.check().unwrap(),
        HeapStats {
            arena_len: BOOTSTRAP_LEN,
            ..HeapStats::default()
        }
    );
    heap.log_blocks();

    // The first allocation grows the arena by a whole chunk.
    let a = heap.allocate(1).unwrap().unwrap();
    assert_eq!(a.offset(), BOOTSTRAP_LEN);
    assert_eq!(heap.arena().len(), BOOTSTRAP_LEN + CHUNK_SIZE);
    heap.check().unwrap();
}

#[test]
fn bootstrap_fails_without_room_for_sentinels() {
    let _ = env_logger::try_init();
    assert!(new_heap(2 * WORD).is_err());
}

#[test]
fn freed_block_is_reused_by_smaller_request() {
    let mut heap = heap();

    let a = heap.allocate(24).unwrap().unwrap();
    assert_eq!(heap.block_size(a), adjusted_size(24).unwrap());
    assert_eq!(a.offset() % DOUBLE_WORD, 0);

    let b = heap.allocate(40).unwrap().unwrap();
    assert_ne!(a, b);
    assert!(a.offset() + heap.block_size(a) <= b.offset());

    heap.free(Some(a));
    heap.check().unwrap();

    let c = heap.allocate(16).unwrap().unwrap();
    assert_eq!(c, a);
    heap.check().unwrap();
}

#[test]
fn zero_sized_and_null_requests() {
    let mut heap = heap();

    assert_eq!(heap.allocate(0).unwrap(), None);
    assert_eq!(heap.arena().len(), BOOTSTRAP_LEN);

    heap.free(None);
    heap.check().unwrap();

    // Reallocating nothing allocates.
    let a = heap.reallocate(None, 24).unwrap().unwrap();
    assert!(!block_is_free(&heap, a));

    // Reallocating to zero frees.
    assert_eq!(heap.reallocate(Some(a), 0).unwrap(), None);
    assert!(block_is_free(&heap, a));
    assert_eq!(heap.check().unwrap().allocated_blocks, 0);
}

fn block_is_free(heap: &TestHeap, addr: Addr) -> bool {
    heap.blocks()
        .find(|b| b.addr == addr)
        .map_or(false, |b| b.is_free())
}

#[test]
fn oversized_request_fails_cleanly() {
    let mut heap = heap();
    assert!(heap.allocate(usize::MAX).is_err());
    assert!(heap.allocate(2 * MEGABYTE).is_err());
    assert_eq!(heap.arena().len(), BOOTSTRAP_LEN);
    heap.check().unwrap();
}

#[test]
fn exhaustion_then_recovery() {
    let _ = env_logger::try_init();
    let mut heap = new_heap(BOOTSTRAP_LEN + CHUNK_SIZE).unwrap();

    // Needs more than one chunk once header and footer are added.
    assert!(matches!(heap.allocate(CHUNK_SIZE), Err(AllocError)));
    assert_eq!(heap.arena().len(), BOOTSTRAP_LEN);

    let a = heap.allocate(CHUNK_SIZE / 2).unwrap().unwrap();
    let b = heap.allocate(CHUNK_SIZE / 4).unwrap().unwrap();
    assert!(heap.allocate(CHUNK_SIZE / 2).is_err());

    // Freeing makes room again, without growing.
    heap.free(Some(a));
    let c = heap.allocate(CHUNK_SIZE / 2).unwrap().unwrap();
    assert_eq!(c, a);
    assert_eq!(heap.arena().len(), BOOTSTRAP_LEN + CHUNK_SIZE);

    heap.free(Some(b));
    heap.free(Some(c));
    let stats = heap.check().unwrap();
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.free_bytes, CHUNK_SIZE);
}

#[test]
fn tightest_fit_within_first_fitting_class() {
    let mut heap = heap();

    let larger = 128;
    let tighter = 80 + DOUBLE_WORD;
    let request = 80;
    assert_eq!(size_class(larger), size_class(tighter));
    assert_eq!(size_class(request), size_class(tighter));

    let _g0 = alloc_block(&mut heap, SMALL);
    let a = alloc_block(&mut heap, larger);
    let _g1 = alloc_block(&mut heap, SMALL);
    let b = alloc_block(&mut heap, tighter);
    let _g2 = alloc_block(&mut heap, SMALL);

    // Free the tighter block first so that the larger one is at the head of
    // the list, where a plain first fit would take it.
    heap.free(Some(b));
    heap.free(Some(a));
    assert_eq!(heap.free_list(size_class(larger)).next(), Some(a));

    // The tighter block wins, and is used whole since its slack is smaller
    // than a block.
    let c = heap.allocate(request - OVERHEAD).unwrap().unwrap();
    assert_eq!(c, b);
    assert_eq!(heap.block_size(c), tighter);

    // Then the larger one, split.
    let arena_len = heap.arena().len();
    let d = heap.allocate(request - OVERHEAD).unwrap().unwrap();
    assert_eq!(d, a);
    assert_eq!(heap.block_size(d), request);
    let rest = heap
        .blocks()
        .find(|b| b.addr.offset() == a.offset() + request)
        .unwrap();
    assert!(rest.is_free());
    assert_eq!(rest.size, larger - request);
    assert!(in_free_list(&heap, size_class(larger - request), rest.addr));

    // Neither allocation needed the arena to grow.
    assert_eq!(heap.arena().len(), arena_len);
    heap.check().unwrap();
}

#[test]
fn split_only_when_remainder_is_a_whole_block() {
    let block = 128;

    for (request, expected_size) in [
        (block - MIN_BLOCK_SIZE, block - MIN_BLOCK_SIZE),
        (block - MIN_BLOCK_SIZE + DOUBLE_WORD, block),
        (block, block),
    ] {
        let mut heap = heap();
        let _g0 = alloc_block(&mut heap, SMALL);
        let a = alloc_block(&mut heap, block);
        let _g1 = alloc_block(&mut heap, SMALL);
        heap.free(Some(a));

        let b = heap.allocate(request - OVERHEAD).unwrap().unwrap();
        assert_eq!(b, a);
        assert_eq!(
            heap.block_size(b),
            expected_size,
            "placing a {request} byte block in a {block} byte block"
        );
        heap.check().unwrap();
    }
}

/// Allocate four neighbors `[prev, middle, next, guard]`, free the ones that
/// `free_prev` and `free_next` say, then free `middle` and return what it
/// merged into.
fn coalesce_case(free_prev: bool, free_next: bool) -> (TestHeap, [Addr; 3]) {
    let mut heap = heap();
    let prev = alloc_block(&mut heap, SMALL);
    let middle = alloc_block(&mut heap, SMALL);
    let next = alloc_block(&mut heap, SMALL);
    let _guard = alloc_block(&mut heap, SMALL);

    if free_prev {
        heap.free(Some(prev));
    }
    if free_next {
        heap.free(Some(next));
    }
    heap.free(Some(middle));
    heap.check().unwrap();

    // The merged block plus the tail of the chunk after the guard.
    assert_eq!(free_block_count(&heap), 2);
    (heap, [prev, middle, next])
}

#[test]
fn coalesce_neither_neighbor_free() {
    let (heap, [_, middle, _]) = coalesce_case(false, false);
    assert_eq!(heap.block_size(middle), SMALL);
    assert!(in_free_list(&heap, size_class(SMALL), middle));
}

#[test]
fn coalesce_with_previous() {
    let (heap, [prev, middle, _]) = coalesce_case(true, false);
    assert_eq!(heap.block_size(prev), 2 * SMALL);
    assert!(in_free_list(&heap, size_class(2 * SMALL), prev));
    assert!(!in_free_list(&heap, size_class(SMALL), middle));
}

#[test]
fn coalesce_with_next() {
    let (heap, [_, middle, next]) = coalesce_case(false, true);
    assert_eq!(heap.block_size(middle), 2 * SMALL);
    assert!(in_free_list(&heap, size_class(2 * SMALL), middle));
    assert!(!in_free_list(&heap, size_class(SMALL), next));
}

#[test]
fn coalesce_with_both() {
    let (heap, [prev, _, _]) = coalesce_case(true, true);
    assert_eq!(heap.block_size(prev), 3 * SMALL);
    assert!(in_free_list(&heap, size_class(3 * SMALL), prev));
    assert_eq!(heap.free_list(size_class(SMALL)).count(), 0);
}

#[test]
fn merged_block_is_refiled_by_merged_size() {
    let mut heap = heap();
    let x = alloc_block(&mut heap, SMALL);
    let y = alloc_block(&mut heap, SMALL);
    let _z = alloc_block(&mut heap, SMALL);

    heap.free(Some(y));
    assert!(in_free_list(&heap, size_class(SMALL), y));
    heap.free(Some(x));

    let merged = heap.blocks().find(|b| b.addr == x).unwrap();
    assert_eq!(merged.size, 2 * SMALL);
    assert!(matches!(merged.state, BlockState::Free { .. }));
    assert!(in_free_list(&heap, size_class(2 * SMALL), x));
    assert_ne!(size_class(SMALL), size_class(2 * SMALL));
    assert_eq!(heap.free_list(size_class(SMALL)).count(), 0);
    heap.check().unwrap();
}

#[test]
fn free_block_links_are_visible_while_free() {
    let mut heap = heap();
    let a = alloc_block(&mut heap, SMALL);
    let _g0 = alloc_block(&mut heap, SMALL);
    let b = alloc_block(&mut heap, SMALL);
    let _g1 = alloc_block(&mut heap, SMALL);

    heap.free(Some(a));
    heap.free(Some(b));

    // Most recently freed first.
    let states: Vec<_> = heap
        .blocks()
        .filter(|blk| blk.addr == a || blk.addr == b)
        .map(|blk| blk.state)
        .collect();
    assert_eq!(
        states,
        [
            BlockState::Free {
                next: None,
                prev: Some(b)
            },
            BlockState::Free {
                next: Some(a),
                prev: None
            },
        ]
    );
}

#[test]
fn realloc_shrink_keeps_block() {
    let mut heap = heap();
    let a = heap.allocate(200).unwrap().unwrap();
    let size = heap.block_size(a);
    fill(&mut heap, a, 200, 0xAB);

    let b = heap.reallocate(Some(a), 10).unwrap().unwrap();
    assert_eq!(b, a);
    assert_eq!(heap.block_size(b), size);
    assert!(holds(&heap, b, 200, 0xAB));

    // Growing back within the retained capacity is free too.
    let c = heap.reallocate(Some(b), heap.usable_size(b)).unwrap().unwrap();
    assert_eq!(c, a);
    heap.check().unwrap();
}

#[test]
fn realloc_grows_in_place_into_free_successor() {
    let mut heap = heap();
    let a = alloc_block(&mut heap, SMALL);
    let b = alloc_block(&mut heap, 128);
    let _guard = alloc_block(&mut heap, SMALL);
    fill(&mut heap, a, SMALL - OVERHEAD, 0x5A);
    heap.free(Some(b));

    let c = heap.reallocate(Some(a), SMALL - OVERHEAD + 1).unwrap().unwrap();
    assert_eq!(c, a);
    assert_eq!(heap.block_size(c), SMALL + 128);
    assert!(holds(&heap, c, SMALL - OVERHEAD, 0x5A));
    assert_eq!(heap.free_list(size_class(128)).count(), 0);
    heap.check().unwrap();
}

#[test]
fn realloc_moves_and_preserves_contents() {
    let mut heap = heap();
    let a = alloc_block(&mut heap, SMALL);
    let _guard = alloc_block(&mut heap, SMALL);
    let old_len = SMALL - OVERHEAD;
    fill(&mut heap, a, old_len, 0xC3);

    let b = heap.reallocate(Some(a), 500).unwrap().unwrap();
    assert_ne!(b, a);
    assert!(heap.usable_size(b) >= 500);
    assert!(holds(&heap, b, old_len, 0xC3));

    // The old block went back on a free list.
    assert!(in_free_list(&heap, size_class(SMALL), a));
    heap.check().unwrap();
}

#[test]
fn realloc_failure_leaves_block_intact() {
    let _ = env_logger::try_init();
    let mut heap = new_heap(BOOTSTRAP_LEN + CHUNK_SIZE).unwrap();

    let a = heap.allocate(100).unwrap().unwrap();
    fill(&mut heap, a, 100, 0x77);
    let arena_len = heap.arena().len();

    assert!(matches!(
        heap.reallocate(Some(a), 2 * CHUNK_SIZE),
        Err(AllocError)
    ));
    assert!(!block_is_free(&heap, a));
    assert!(holds(&heap, a, 100, 0x77));
    assert_eq!(heap.arena().len(), arena_len);
    heap.check().unwrap();
}

#[test]
fn absorbed_block_coalesces_and_is_reused_exactly() {
    let mut heap = heap();
    let p = heap.allocate(24).unwrap().unwrap();
    let f = heap.allocate(100).unwrap().unwrap();
    let _guard = heap.allocate(24).unwrap().unwrap();
    let merged_size = heap.block_size(p) + heap.block_size(f);

    // Free the 100 byte block, then grow its predecessor into it.
    heap.free(Some(f));
    let p = heap.reallocate(Some(p), 100).unwrap().unwrap();
    assert_eq!(heap.block_size(p), merged_size);

    // Freeing the grown block leaves one free block of the merged size...
    heap.free(Some(p));
    assert!(in_free_list(&heap, size_class(merged_size), p));
    heap.check().unwrap();

    // ...which a request of exactly that size takes whole, without growing.
    let arena_len = heap.arena().len();
    let q = heap.allocate(merged_size - OVERHEAD).unwrap().unwrap();
    assert_eq!(q, p);
    assert_eq!(heap.block_size(q), merged_size);
    assert_eq!(heap.arena().len(), arena_len);
    heap.check().unwrap();
}

#[test]
fn large_requests_grow_by_more_than_a_chunk() {
    let mut heap = heap();
    let size = 3 * CHUNK_SIZE;
    let a = heap.allocate(size).unwrap().unwrap();
    assert_eq!(heap.block_size(a), adjusted_size(size).unwrap());
    assert_eq!(heap.arena().len(), BOOTSTRAP_LEN + adjusted_size(size).unwrap());

    // Nothing left over to split, so the only block is ours.
    let stats = heap.check().unwrap();
    assert_eq!(stats.allocated_blocks, 1);
    assert_eq!(stats.free_blocks, 0);

    heap.free(Some(a));
    let stats = heap.check().unwrap();
    assert_eq!(stats.free_blocks, 1);
    assert!(in_free_list(&heap, size_class(stats.free_bytes), a));
}

type TestAllocator = SegregatedAllocator<FixedArena<Global>, SingleThreadedLock>;

fn allocator() -> TestAllocator {
    let _ = env_logger::try_init();
    let arena = FixedArena::new(Global, MEGABYTE).unwrap();
    SegregatedAllocator::new(arena, SingleThreadedLock::new()).unwrap()
}

#[test]
fn allocator_backs_collections() {
    let allocator = allocator();
    {
        let mut v = allocator_api2::vec::Vec::new_in(&allocator);
        for i in 0..10_000u64 {
            v.push(i);
        }
        assert!(v.iter().copied().eq(0..10_000));

        let b = allocator_api2::boxed::Box::new_in([7u8; 100], &allocator);
        assert!(b.iter().all(|x| *x == 7));

        v.truncate(10);
        v.shrink_to_fit();
        assert!(v.iter().copied().eq(0..10));
        allocator.check().unwrap();
    }

    let stats = allocator.check().unwrap();
    assert_eq!(stats.allocated_blocks, 0);
    assert_eq!(stats.free_blocks, 1);
}

#[test]
fn allocator_refuses_over_aligned_layouts() {
    let allocator = allocator();
    let layout = Layout::from_size_align(64, 2 * DOUBLE_WORD).unwrap();
    assert!(allocator.allocate(layout).is_err());

    let layout = Layout::from_size_align(64, DOUBLE_WORD).unwrap();
    let block = allocator.allocate(layout).unwrap();
    assert_eq!(block.cast::<u8>().as_ptr() as usize % DOUBLE_WORD, 0);
    assert!(block.len() >= 64);
    unsafe { allocator.deallocate(block.cast(), layout) };
    allocator.check().unwrap();
}

#[test]
fn allocator_zero_sized_layouts_skip_the_heap() {
    let allocator = allocator();
    let layout = Layout::from_size_align(0, 8).unwrap();
    let block = allocator.allocate(layout).unwrap();
    assert_eq!(block.len(), 0);
    assert_eq!(block.cast::<u8>().as_ptr() as usize % 8, 0);
    unsafe { allocator.deallocate(block.cast(), layout) };

    allocator.with_heap(|heap| {
        assert_eq!(heap.arena().len(), BOOTSTRAP_LEN);
    });
}

#[test]
#[should_panic(expected = "re-entrant heap access")]
fn allocator_panics_on_reentrant_use() {
    let allocator = allocator();
    let layout = Layout::from_size_align(8, 8).unwrap();
    allocator.with_heap(|_| {
        let _ = allocator.allocate(layout);
    });
}

#[test]
fn allocator_is_unlocked_after_a_panic() {
    let allocator = allocator();
    let layout = Layout::from_size_align(8, 8).unwrap();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        allocator.with_heap(|_| {
            let _ = allocator.allocate(layout);
        })
    }));
    assert!(result.is_err());

    // The outer critical section released the lock while unwinding.
    let block = allocator.allocate(layout).unwrap();
    unsafe { allocator.deallocate(block.cast(), layout) };
    allocator.check().unwrap();
}

#[test]
fn allocator_grow_zeroed_and_shrink() {
    let allocator = allocator();
    let old = Layout::from_size_align(24, 8).unwrap();
    let new = Layout::from_size_align(200, 8).unwrap();

    let block = allocator.allocate(old).unwrap();
    unsafe { block.cast::<u8>().as_ptr().write_bytes(0xAA, old.size()) };

    let grown = unsafe { allocator.grow_zeroed(block.cast(), old, new) }.unwrap();
    assert!(grown.len() >= new.size());
    let bytes = unsafe { grown.as_ref() };
    assert!(bytes[..old.size()].iter().all(|b| *b == 0xAA));
    assert!(bytes[old.size()..new.size()].iter().all(|b| *b == 0));

    let shrunk = unsafe { allocator.shrink(grown.cast(), new, old) }.unwrap();
    assert_eq!(shrunk.cast::<u8>(), grown.cast::<u8>());

    unsafe { allocator.deallocate(shrunk.cast(), old) };
    let heap = allocator.into_heap();
    assert_eq!(heap.check().unwrap().allocated_blocks, 0);
}
