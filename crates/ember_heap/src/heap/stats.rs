//! Snapshots handed out by a heap. They are copies; holding one does not
//! hold the heap lock.

use crate::block::{AllocKind, Block, SourceLocation};

/// Usage counters of a heap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Arena size in bytes.
    pub capacity: usize,
    /// Bytes held by live blocks, headers and padding included.
    pub used: usize,
    /// Bytes callers asked for.
    pub requested: usize,
    /// High-water mark of `used`.
    pub peak: usize,
    /// Number of live blocks.
    pub live_blocks: usize,
    /// Number of free blocks.
    pub free_blocks: usize,
    /// Bytes held by free blocks.
    pub total_free: usize,
    /// Size of the largest free block.
    pub largest_free: usize,
    /// Allocations made over the heap's lifetime.
    pub allocations: u64,
}

impl HeapStats {
    /// `used / capacity` as a percentage.
    #[must_use]
    pub fn usage_percent(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.used as f64 * 100.0 / self.capacity as f64
    }

    /// `1 - largest_free / total_free`: zero when all free space is one
    /// block, approaching one as it splinters.
    #[must_use]
    pub fn fragmentation(&self) -> f64 {
        if self.total_free == 0 {
            return 0.0;
        }
        1.0 - self.largest_free as f64 / self.total_free as f64
    }
}

/// One block of the adjacency chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Arena offset of the block.
    pub offset: usize,
    /// Block size, header and canary included.
    pub size: usize,
    /// Bytes requested by the caller. Zero for free blocks.
    pub requested: usize,
    /// Whether the block is live.
    pub in_use: bool,
    /// Allocation id. Zero for free blocks.
    pub id: u64,
    /// Allocation kind. Meaningless for free blocks.
    pub kind: AllocKind,
    /// Call site. Meaningless for free blocks.
    pub location: SourceLocation,
}

impl BlockInfo {
    pub(crate) fn from_block(block: &Block) -> Self {
        Self {
            offset: block.start,
            size: block.size,
            requested: block.requested,
            in_use: block.in_use,
            id: block.id,
            kind: block.kind,
            location: block.location,
        }
    }

    /// Offset one past the last byte.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// A live allocation found by a leak audit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeakRecord {
    /// Allocation id.
    pub id: u64,
    /// Bytes requested by the caller.
    pub size: usize,
    /// Allocation kind.
    pub kind: AllocKind,
    /// Call site.
    pub location: SourceLocation,
}
