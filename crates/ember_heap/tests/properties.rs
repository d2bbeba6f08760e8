//! Property tests over random allocate/free sequences.

use std::ptr::NonNull;
use std::sync::Arc;

use ember_heap::{AllocKind, BlockInfo, Heap, BLOCK_ALIGN, BLOCK_FOOTER_SIZE, BLOCK_HEADER_SIZE};
use proptest::prelude::*;

const CAPACITY: usize = 64 * 1024;

/// Keeps worst-case fragmentation well below the capacity.
const MAX_LIVE: usize = 32;

#[derive(Clone, Debug)]
enum Op {
    Alloc(usize),
    Free(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0usize..512).prop_map(Op::Alloc),
        2 => any::<usize>().prop_map(Op::Free),
    ]
}

/// Runs `ops` against a fresh heap, checking `check` after every step.
/// Returns the heap and the pointers still live.
fn run(
    ops: &[Op],
    mut check: impl FnMut(&Heap, &[BlockInfo]),
) -> (Arc<Heap>, Vec<NonNull<u8>>) {
    let heap = Heap::new("prop", CAPACITY);
    let mut live = Vec::new();
    for op in ops {
        match *op {
            Op::Alloc(size) if live.len() < MAX_LIVE => live.push(heap.alloc(size, AllocKind::Malloc)),
            Op::Free(pick) if !live.is_empty() => {
                let ptr = live.swap_remove(pick % live.len());
                heap.free(ptr, AllocKind::Malloc).unwrap();
            }
            _ => {}
        }
        check(&heap, &heap.blocks());
    }
    (heap, live)
}

proptest! {
    #[test]
    fn prop_blocks_tile_the_arena(ops in prop::collection::vec(op(), 1..200)) {
        run(&ops, |heap, blocks| {
            let mut offset = 0;
            for block in blocks {
                assert_eq!(block.offset, offset);
                assert_eq!(block.size % BLOCK_ALIGN, 0);
                offset = block.end();
            }
            assert_eq!(offset, heap.capacity());
        });
    }

    #[test]
    fn prop_counters_match_blocks(ops in prop::collection::vec(op(), 1..200)) {
        run(&ops, |heap, blocks| {
            let stats = heap.stats();
            let live: Vec<_> = blocks.iter().filter(|b| b.in_use).collect();
            assert_eq!(stats.used, live.iter().map(|b| b.size).sum::<usize>());
            assert_eq!(stats.requested, live.iter().map(|b| b.requested).sum::<usize>());
            assert_eq!(stats.used + stats.total_free, heap.capacity());
            assert!(live.iter().all(|b| b.requested + BLOCK_HEADER_SIZE + BLOCK_FOOTER_SIZE <= b.size));
        });
    }

    #[test]
    fn prop_no_adjacent_free_blocks(ops in prop::collection::vec(op(), 1..200)) {
        run(&ops, |_, blocks| {
            assert!(blocks.windows(2).all(|w| w[0].in_use || w[1].in_use));
        });
    }

    #[test]
    fn prop_freeing_everything_restores_one_block(ops in prop::collection::vec(op(), 1..200)) {
        let (heap, live) = run(&ops, |_, _| {});
        for ptr in live {
            heap.free(ptr, AllocKind::Malloc).unwrap();
        }
        heap.verify_integrity();
        let blocks = heap.blocks();
        prop_assert_eq!(blocks.len(), 1);
        prop_assert_eq!(blocks[0].size, CAPACITY);
    }
}
