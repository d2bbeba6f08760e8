//! Block record table plus the free list, live list and adjacency chain
//! threaded through it.
//!
//! Nothing here touches arena bytes; [`crate::Heap`] owns those and stamps
//! headers and canaries around the operations below.

use super::list::{BlockList, Iter};
use super::{Block, BlockId, Links, BLOCK_HEADER_SIZE};

/// All block records of one heap.
///
/// Records that were absorbed by a merge are parked on `vacant` and reused by
/// the next split, so the table only grows to the peak block count.
pub(crate) struct BlockArena {
    blocks: Vec<Block>,
    vacant: Vec<BlockId>,
    free: BlockList,
    live: BlockList,
    first: BlockId,
}

/// Walks the adjacency chain in address order.
pub(crate) struct Physical<'a> {
    blocks: &'a [Block],
    current: Option<BlockId>,
}

impl BlockArena {
    /// One free block spanning `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        let mut arena = Self {
            blocks: vec![Block::free(0, capacity)],
            vacant: Vec::new(),
            free: BlockList::new(),
            live: BlockList::new(),
            first: BlockId::from_index(0),
        };
        arena.free.push_front(&mut arena.blocks, arena.first);
        arena
    }

    #[inline]
    pub fn get(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    #[inline]
    pub fn get_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    /// Record at `index`, if the index is in range and not parked.
    pub fn lookup(&self, index: usize) -> Option<(BlockId, &Block)> {
        let block = self.blocks.get(index)?;
        // Parked records are zero-sized.
        if block.size == 0 {
            return None;
        }
        Some((BlockId::from_index(index), block))
    }

    /// Number of records ever created, parked ones included.
    #[inline]
    pub fn record_count(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn first(&self) -> BlockId {
        self.first
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn free_ids(&self) -> Iter<'_> {
        self.free.iter(&self.blocks)
    }

    /// Live blocks, oldest allocation first.
    pub fn live_ids(&self) -> Iter<'_> {
        self.live.iter(&self.blocks)
    }

    pub fn physical(&self) -> Physical<'_> {
        Physical {
            blocks: &self.blocks,
            current: Some(self.first),
        }
    }

    /// Total bytes of all free blocks.
    pub fn total_free(&self) -> usize {
        self.free_ids().map(|id| self.get(id).size).sum()
    }

    /// Size of the largest free block, zero if there is none.
    pub fn largest_free(&self) -> usize {
        self.free_ids().map(|id| self.get(id).size).max().unwrap_or(0)
    }

    /// First block on the free list that can hold `required` bytes.
    ///
    /// First-fit in list order: recently freed blocks sit at the head and are
    /// tried before untouched space.
    pub fn first_fit(&self, required: usize) -> Option<BlockId> {
        self.free_ids().find(|&id| self.get(id).size >= required)
    }

    /// Cuts the free block `id` down to `required` bytes when the leftover is
    /// worth keeping.
    ///
    /// The remainder takes the split block's place on the free list and is
    /// spliced into the adjacency chain right after it. Returns the remainder,
    /// or `None` when the leftover is not larger than a header.
    pub fn split(&mut self, id: BlockId, required: usize) -> Option<BlockId> {
        let block = self.get(id);
        debug_assert!(!block.in_use && block.size >= required);

        if block.size - required <= BLOCK_HEADER_SIZE {
            return None;
        }

        let split_at = block.start + required;
        let next = block.adjacent.next;

        let mut remainder = Block::free(split_at, block.end);
        remainder.adjacent = Links {
            prev: Some(id),
            next,
        };
        let remainder = self.allocate_record(remainder);

        if let Some(next) = next {
            self.get_mut(next).adjacent.prev = Some(remainder);
        }

        let block = self.get_mut(id);
        block.end = split_at;
        block.size = required;
        block.adjacent.next = Some(remainder);

        self.free.insert_before(&mut self.blocks, id, remainder);

        Some(remainder)
    }

    /// Moves `id` from the free list to the live list.
    pub fn mark_live(&mut self, id: BlockId) {
        self.free.remove(&mut self.blocks, id);
        self.blocks[id.index()].in_use = true;
        self.live.push_back(&mut self.blocks, id);
    }

    /// Takes `id` off the live list. It belongs to no status list until
    /// [`BlockArena::release`] puts it back on the free list.
    pub fn mark_free(&mut self, id: BlockId) {
        self.live.remove(&mut self.blocks, id);

        let block = self.get_mut(id);
        block.in_use = false;
        block.requested = 0;
        block.id = 0;
    }

    /// Pushes the detached free block `id` onto the free list head.
    pub fn release(&mut self, id: BlockId) {
        debug_assert!(!self.get(id).in_use);
        self.free.push_front(&mut self.blocks, id);
    }

    /// Absorbs the next physical neighbour into the detached block `id` if
    /// that neighbour is free.
    pub fn try_merge_with_next(&mut self, id: BlockId) -> bool {
        let Some(next) = self.get(id).adjacent.next else {
            return false;
        };
        if self.get(next).in_use {
            return false;
        }

        self.free.remove(&mut self.blocks, next);

        let (end, after) = {
            let next = self.get(next);
            (next.end, next.adjacent.next)
        };

        let block = self.get_mut(id);
        block.end = end;
        block.size = end - block.start;
        block.adjacent.next = after;

        if let Some(after) = after {
            self.get_mut(after).adjacent.prev = Some(id);
        }

        self.vacate(next);
        true
    }

    /// Lets the previous physical neighbour absorb the detached block `id` if
    /// that neighbour is free.
    ///
    /// The neighbour leaves the free list too. Returns the surviving block.
    pub fn try_merge_with_prev(&mut self, id: BlockId) -> Option<BlockId> {
        let prev = self.get(id).adjacent.prev?;
        if self.get(prev).in_use {
            return None;
        }

        self.free.remove(&mut self.blocks, prev);

        let (end, after) = {
            let block = self.get(id);
            (block.end, block.adjacent.next)
        };

        let survivor = self.get_mut(prev);
        survivor.end = end;
        survivor.size = end - survivor.start;
        survivor.adjacent.next = after;

        if let Some(after) = after {
            self.get_mut(after).adjacent.prev = Some(prev);
        }

        self.vacate(id);
        Some(prev)
    }

    fn allocate_record(&mut self, block: Block) -> BlockId {
        if let Some(id) = self.vacant.pop() {
            self.blocks[id.index()] = block;
            return id;
        }
        self.blocks.push(block);
        BlockId::from_index(self.blocks.len() - 1)
    }

    fn vacate(&mut self, id: BlockId) {
        self.blocks[id.index()] = Block::free(0, 0);
        self.vacant.push(id);
    }
}

impl Iterator for Physical<'_> {
    type Item = BlockId;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.current?;
        self.current = self.blocks[id.index()].adjacent.next;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans(arena: &BlockArena) -> Vec<(usize, usize, bool)> {
        arena
            .physical()
            .map(|id| {
                let b = arena.get(id);
                (b.start, b.end, b.in_use)
            })
            .collect()
    }

    /// Takes a block the way the heap does: first fit, split, go live.
    fn take(arena: &mut BlockArena, required: usize) -> BlockId {
        let id = arena.first_fit(required).unwrap();
        let _ = arena.split(id, required);
        arena.mark_live(id);
        id
    }

    /// Gives a block back the way the heap does in `Both` mode.
    fn give(arena: &mut BlockArena, id: BlockId) -> BlockId {
        arena.mark_free(id);
        let _ = arena.try_merge_with_next(id);
        let survivor = arena.try_merge_with_prev(id).unwrap_or(id);
        arena.release(survivor);
        survivor
    }

    #[test]
    fn test_new_arena_is_one_free_block() {
        let arena = BlockArena::new(1024);
        assert_eq!(spans(&arena), vec![(0, 1024, false)]);
        assert_eq!(arena.free_count(), 1);
        assert_eq!(arena.live_count(), 0);
        assert_eq!(arena.largest_free(), 1024);
    }

    #[test]
    fn test_split_keeps_chain_contiguous() {
        let mut arena = BlockArena::new(1024);
        let a = take(&mut arena, 160);
        let b = take(&mut arena, 256);

        assert_eq!(
            spans(&arena),
            vec![(0, 160, true), (160, 416, true), (416, 1024, false)]
        );
        assert_eq!(arena.get(a).adjacent.next, Some(b));
        assert_eq!(arena.get(b).adjacent.prev, Some(a));
        assert_eq!(arena.total_free(), 608);
    }

    #[test]
    fn test_no_split_for_small_leftover() {
        let mut arena = BlockArena::new(96);
        let id = arena.first_fit(64).unwrap();

        // 32 bytes left: not more than a header.
        assert!(arena.split(id, 64).is_none());
        assert_eq!(arena.get(id).size, 96);
    }

    #[test]
    fn test_merge_both_neighbours() {
        let mut arena = BlockArena::new(1024);
        let a = take(&mut arena, 64);
        let b = take(&mut arena, 64);
        let c = take(&mut arena, 64);
        let _guard = take(&mut arena, 64);

        give(&mut arena, a);
        give(&mut arena, c);
        assert_eq!(arena.free_count(), 3);

        let survivor = give(&mut arena, b);
        assert_eq!(survivor, a);
        assert_eq!(spans(&arena)[0], (0, 192, false));
        assert_eq!(arena.free_count(), 2);
    }

    #[test]
    fn test_merge_restores_single_block() {
        let mut arena = BlockArena::new(1024);
        let a = take(&mut arena, 128);
        let b = take(&mut arena, 128);

        give(&mut arena, b);
        give(&mut arena, a);

        assert_eq!(spans(&arena), vec![(0, 1024, false)]);
        assert_eq!(arena.free_count(), 1);
    }

    #[test]
    fn test_live_neighbour_is_not_merged() {
        let mut arena = BlockArena::new(1024);
        let a = take(&mut arena, 64);
        let _b = take(&mut arena, 64);

        arena.mark_free(a);
        assert!(!arena.try_merge_with_next(a));
        assert!(arena.try_merge_with_prev(a).is_none());
        arena.release(a);
    }

    #[test]
    fn test_vacant_records_are_reused() {
        let mut arena = BlockArena::new(1024);
        let a = take(&mut arena, 64);
        let b = take(&mut arena, 64);
        let records = arena.record_count();

        give(&mut arena, b);
        give(&mut arena, a);
        let _ = take(&mut arena, 64);
        let _ = take(&mut arena, 64);

        assert_eq!(arena.record_count(), records);
        assert!(arena.lookup(records).is_none());
        assert!(arena.lookup(0).is_some());
    }

    #[test]
    fn test_freed_block_goes_to_head() {
        let mut arena = BlockArena::new(1024);
        let a = take(&mut arena, 160);
        let _b = take(&mut arena, 256);

        give(&mut arena, a);
        assert_eq!(arena.free_ids().next(), Some(a));
        assert_eq!(arena.first_fit(96), Some(a));
    }
}
