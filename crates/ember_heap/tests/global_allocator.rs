//! Integration tests with `RoutedAllocator` installed as the global allocator.

use ember_heap::{Heap, HeapScope, RoutedAllocator};

#[global_allocator]
static ALLOCATOR: RoutedAllocator = RoutedAllocator;

#[test]
fn test_collections_land_in_scoped_heap() {
    let heap = Heap::new("collections", 64 * 1024);

    let names = {
        let _scope = HeapScope::enter(&heap);
        let names: Vec<String> = (0..16).map(|i| format!("entity-{i}")).collect();
        assert!(heap.stats().live_blocks >= 17);
        names
    };
    assert_eq!(names[15], "entity-15");

    // Dropped outside the scope; the blocks still find their heap.
    drop(names);
    assert_eq!(heap.stats().live_blocks, 0);
    heap.verify_integrity();
}

#[test]
fn test_allocations_outside_scope_skip_heaps() {
    let heap = Heap::new("untouched", 4096);
    let boxed = Box::new([7u8; 256]);
    assert_eq!(heap.stats().allocations, 0);
    assert_eq!(boxed[255], 7);
}

#[test]
fn test_growth_inside_scope_reallocates_in_heap() {
    let heap = Heap::new("growth", 64 * 1024);
    {
        let _scope = HeapScope::enter(&heap);
        let mut values = Vec::new();
        for i in 0..1000u32 {
            values.push(i);
        }
        assert_eq!(values.iter().sum::<u32>(), 999 * 1000 / 2);
        assert_eq!(heap.stats().live_blocks, 1);
    }
    assert_eq!(heap.stats().live_blocks, 0);
    assert!(heap.stats().allocations > 1);
}
