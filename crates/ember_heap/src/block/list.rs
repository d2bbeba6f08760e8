//! Intrusive doubly linked list over block status links.
//!
//! Nodes are block records addressed by [`BlockId`], so the list never
//! allocates: linking and unlinking only rewrites the `status` pair of the
//! records involved.

use super::{Block, BlockId};

/// Head/tail of one status list (free or live).
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct BlockList {
    head: Option<BlockId>,
    tail: Option<BlockId>,
    len: usize,
}

/// Iterator over the ids of a [`BlockList`], head first.
pub(crate) struct Iter<'a> {
    blocks: &'a [Block],
    current: Option<BlockId>,
    remaining: usize,
}

impl BlockList {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Links `id` in front of the current head.
    pub fn push_front(&mut self, blocks: &mut [Block], id: BlockId) {
        blocks[id.index()].status.prev = None;
        blocks[id.index()].status.next = self.head;

        match self.head {
            Some(head) => blocks[head.index()].status.prev = Some(id),
            None => self.tail = Some(id),
        }

        self.head = Some(id);
        self.len += 1;
    }

    /// Links `id` after the current tail.
    pub fn push_back(&mut self, blocks: &mut [Block], id: BlockId) {
        blocks[id.index()].status.prev = self.tail;
        blocks[id.index()].status.next = None;

        match self.tail {
            Some(tail) => blocks[tail.index()].status.next = Some(id),
            None => self.head = Some(id),
        }

        self.tail = Some(id);
        self.len += 1;
    }

    /// Links `id` immediately before `at`, which must be on this list.
    pub fn insert_before(&mut self, blocks: &mut [Block], at: BlockId, id: BlockId) {
        let prev = blocks[at.index()].status.prev;

        blocks[id.index()].status.prev = prev;
        blocks[id.index()].status.next = Some(at);
        blocks[at.index()].status.prev = Some(id);

        match prev {
            Some(prev) => blocks[prev.index()].status.next = Some(id),
            None => self.head = Some(id),
        }

        self.len += 1;
    }

    /// Unlinks `id`, which must be on this list.
    pub fn remove(&mut self, blocks: &mut [Block], id: BlockId) {
        let links = blocks[id.index()].status;

        match links.prev {
            Some(prev) => blocks[prev.index()].status.next = links.next,
            None => self.head = links.next,
        }
        match links.next {
            Some(next) => blocks[next.index()].status.prev = links.prev,
            None => self.tail = links.prev,
        }

        blocks[id.index()].status.prev = None;
        blocks[id.index()].status.next = None;
        self.len -= 1;
    }

    pub fn iter<'a>(&self, blocks: &'a [Block]) -> Iter<'a> {
        Iter {
            blocks,
            current: self.head,
            remaining: self.len,
        }
    }
}

impl Iterator for Iter<'_> {
    type Item = BlockId;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.current?;
        self.current = self.blocks[id.index()].status.next;
        self.remaining = self.remaining.saturating_sub(1);
        Some(id)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(count: usize) -> Vec<Block> {
        (0..count).map(|i| Block::free(i * 64, (i + 1) * 64)).collect()
    }

    fn ids(list: &BlockList, blocks: &[Block]) -> Vec<usize> {
        list.iter(blocks).map(BlockId::index).collect()
    }

    #[test]
    fn test_new_list_is_empty() {
        let blocks = records(1);
        let list = BlockList::new();

        assert_eq!(list.len(), 0);
        assert!(list.iter(&blocks).next().is_none());
    }

    #[test]
    fn test_push_front_and_back() {
        let mut blocks = records(3);
        let mut list = BlockList::new();

        list.push_back(&mut blocks, BlockId::from_index(1));
        list.push_front(&mut blocks, BlockId::from_index(0));
        list.push_back(&mut blocks, BlockId::from_index(2));

        assert_eq!(ids(&list, &blocks), vec![0, 1, 2]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_insert_before_head_and_middle() {
        let mut blocks = records(4);
        let mut list = BlockList::new();

        list.push_back(&mut blocks, BlockId::from_index(0));
        list.push_back(&mut blocks, BlockId::from_index(1));
        list.insert_before(&mut blocks, BlockId::from_index(1), BlockId::from_index(2));
        list.insert_before(&mut blocks, BlockId::from_index(0), BlockId::from_index(3));

        assert_eq!(ids(&list, &blocks), vec![3, 0, 2, 1]);
    }

    #[test]
    fn test_remove_head_tail_middle() {
        let mut blocks = records(4);
        let mut list = BlockList::new();
        for i in 0..4 {
            list.push_back(&mut blocks, BlockId::from_index(i));
        }

        list.remove(&mut blocks, BlockId::from_index(0));
        assert_eq!(ids(&list, &blocks), vec![1, 2, 3]);

        list.remove(&mut blocks, BlockId::from_index(3));
        assert_eq!(ids(&list, &blocks), vec![1, 2]);

        list.remove(&mut blocks, BlockId::from_index(1));
        list.remove(&mut blocks, BlockId::from_index(2));
        assert_eq!(list.len(), 0);
        assert!(list.iter(&blocks).next().is_none());

        // Reusable after draining.
        list.push_front(&mut blocks, BlockId::from_index(2));
        assert_eq!(ids(&list, &blocks), vec![2]);
    }
}
