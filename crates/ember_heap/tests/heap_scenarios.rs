//! Integration tests for single-heap allocation, coalescing and leak audits.

#![allow(unsafe_code)]

use ember_heap::{AllocKind, CoalesceMode, Heap, HeapConfig, HeapError, HeapScope};

#[test]
fn test_first_fit_reuses_freed_block() {
    let heap = Heap::new("first-fit", 1024);
    let a = heap.alloc(100, AllocKind::Malloc);
    let b = heap.alloc(200, AllocKind::Malloc);

    heap.free(a, AllocKind::Malloc).unwrap();
    let c = heap.alloc(50, AllocKind::Malloc);
    assert_eq!(c, a);

    // 160-byte hole split into C (96) and a 64-byte free block.
    let blocks = heap.blocks();
    assert_eq!((blocks[0].offset, blocks[0].size, blocks[0].in_use), (0, 96, true));
    assert_eq!((blocks[1].offset, blocks[1].size, blocks[1].in_use), (96, 64, false));
    assert_eq!((blocks[2].offset, blocks[2].size, blocks[2].in_use), (160, 256, true));

    heap.free(b, AllocKind::Malloc).unwrap();
    heap.free(c, AllocKind::Malloc).unwrap();
    heap.verify_integrity();
}

#[test]
fn test_small_leftover_is_not_split() {
    let heap = Heap::new("no-split", 1024);
    let a = heap.alloc(100, AllocKind::Malloc);
    let b = heap.alloc(200, AllocKind::Malloc);
    heap.free(a, AllocKind::Malloc).unwrap();

    // Needs 128 of the 160-byte hole; 32 leftover bytes stay with the block.
    let c = heap.alloc(92, AllocKind::Malloc);
    assert_eq!(c, a);
    assert_eq!(heap.blocks()[0].size, 160);
    assert_eq!(heap.stats().used, 160 + 256);

    heap.free(b, AllocKind::Malloc).unwrap();
    heap.free(c, AllocKind::Malloc).unwrap();
}

#[test]
fn test_free_coalesces_both_neighbours() {
    let heap = Heap::new("coalesce", 1024);
    let a = heap.alloc(16, AllocKind::Malloc);
    let b = heap.alloc(16, AllocKind::Malloc);
    let c = heap.alloc(16, AllocKind::Malloc);
    let fence = heap.alloc(16, AllocKind::Malloc);

    heap.free(a, AllocKind::Malloc).unwrap();
    heap.free(c, AllocKind::Malloc).unwrap();
    assert_eq!(heap.stats().free_blocks, 3);

    heap.free(b, AllocKind::Malloc).unwrap();
    let blocks = heap.blocks();
    assert_eq!(blocks.len(), 3);
    assert_eq!((blocks[0].offset, blocks[0].size, blocks[0].in_use), (0, 192, false));
    assert!(blocks[1].in_use);
    heap.verify_integrity();

    heap.free(fence, AllocKind::Malloc).unwrap();
    let blocks = heap.blocks();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].size, heap.capacity());
}

#[test]
fn test_round_trip_restores_single_block() {
    let heap = Heap::new("round-trip", 16 * 1024);
    let sizes = [1, 7, 31, 32, 33, 100, 255, 512, 1000];

    let ptrs: Vec<_> = sizes.iter().map(|&size| heap.alloc(size, AllocKind::New)).collect();
    assert_eq!(heap.stats().live_blocks, sizes.len());

    // Free in an order that exercises both merge directions.
    for ptr in ptrs.iter().step_by(2).chain(ptrs.iter().skip(1).step_by(2)) {
        heap.free(*ptr, AllocKind::New).unwrap();
    }

    let stats = heap.stats();
    assert_eq!(stats.used, 0);
    assert_eq!(stats.requested, 0);
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.largest_free, heap.capacity());
    assert_eq!(stats.allocations, sizes.len() as u64);
}

#[test]
fn test_next_then_stop_can_leave_neighbours_apart() {
    let config = HeapConfig {
        coalesce: CoalesceMode::NextThenStop,
        ..HeapConfig::default()
    };
    let heap = Heap::with_config("legacy-merge", 1024, config);
    let a = heap.alloc(16, AllocKind::Malloc);
    let b = heap.alloc(16, AllocKind::Malloc);

    heap.free(a, AllocKind::Malloc).unwrap();
    heap.free(b, AllocKind::Malloc).unwrap();

    // b took the tail remainder and stopped; a stays a separate block.
    assert_eq!(heap.stats().free_blocks, 2);
    heap.verify_integrity();
}

#[test]
fn test_leak_audit_reports_window() {
    let heap = Heap::new("audit", 4096);
    let setup = heap.alloc(64, AllocKind::Static);
    heap.set_mark_for_leak_testing();

    let ptrs: Vec<_> = [10, 20, 30]
        .iter()
        .map(|&size| heap.alloc(size, AllocKind::Malloc))
        .collect();

    let leaks = heap.find_leaks();
    assert_eq!(leaks.iter().map(|l| l.size).collect::<Vec<_>>(), vec![10, 20, 30]);
    assert!(leaks.windows(2).all(|w| w[0].id < w[1].id));
    assert!(leaks.iter().all(|l| l.location.file().ends_with("heap_scenarios.rs")));

    for ptr in ptrs {
        heap.free(ptr, AllocKind::Malloc).unwrap();
    }
    assert!(heap.find_leaks().is_empty());
    heap.check_for_leaks();

    heap.free(setup, AllocKind::Static).unwrap();
}

#[test]
#[should_panic(expected = "3 leaked allocations (60 bytes)")]
fn test_leak_audit_is_fatal() {
    let heap = Heap::new("audit-fatal", 4096);
    heap.set_mark_for_leak_testing();
    for size in [10, 20, 30] {
        let _ = heap.alloc(size, AllocKind::Malloc);
    }
    heap.check_for_leaks();
}

#[test]
fn test_kind_mismatch_does_not_stop_the_heap() {
    let heap = Heap::new("kinds", 1024);
    let ptr = heap.alloc(40, AllocKind::New);

    assert!(matches!(
        heap.free(ptr, AllocKind::NewArray),
        Err(HeapError::KindMismatch { .. })
    ));

    let again = heap.alloc(40, AllocKind::New);
    assert_eq!(again, ptr);
    heap.free(again, AllocKind::New).unwrap();
}

#[test]
fn test_nested_heap_lives_in_parent() {
    let outer = Heap::new("outer", 8192);
    let inner = {
        let _scope = HeapScope::enter(&outer);
        Heap::new("inner", 1024)
    };

    let outer_blocks = outer.blocks();
    assert!(outer_blocks[0].in_use);
    assert_eq!(outer_blocks[0].kind, AllocKind::Heap);
    assert_eq!(outer_blocks[0].requested, 1024);

    let ptr = inner.alloc(100, AllocKind::Malloc);
    assert!(inner.contains(ptr));
    assert!(outer.contains(ptr));
    inner.free(ptr, AllocKind::Malloc).unwrap();

    drop(inner);
    assert_eq!(outer.stats().live_blocks, 0);
    outer.verify_integrity();
}

#[test]
fn test_config_from_toml_drives_heap() {
    let config = HeapConfig::from_toml_str(
        r#"
        uninit_pattern = 0xAA
        freed_pattern = 0xBB
        "#,
    )
    .unwrap();
    let heap = Heap::with_config("toml", 1024, config);

    let ptr = heap.alloc(8, AllocKind::Malloc);
    // SAFETY: live 8-byte allocation.
    let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 8).to_vec() };
    assert_eq!(bytes, vec![0xAA; 8]);
    heap.free(ptr, AllocKind::Malloc).unwrap();
}
