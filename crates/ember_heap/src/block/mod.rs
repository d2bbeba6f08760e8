//! # Blocks
//!
//! A block describes one contiguous byte range of a heap arena, free or in
//! use. Every byte of the arena belongs to exactly one block.
//!
//! Block records do not live inside the arena. They sit in a [`BlockArena`]
//! and are addressed by [`BlockId`]; the arena bytes only carry a small
//! header (so `free` can find the record) and the end-of-block canary:
//!
//! ```text
//! start                                                          end
//! +-------------+----------------------------+--------+----------+
//! |   header    |        user region         | canary |  slack   |
//! | (id, magic) |    (requested bytes)       | (u32)  |          |
//! +-------------+----------------------------+--------+----------+
//!               ^
//!               pointer handed to the caller
//! ```
//!
//! Each record carries two independent link sets:
//! - **status links** put it on the free list or the live list
//! - **adjacency links** chain it to its physical neighbours in address
//!   order, which makes coalescing O(1)

mod arena;
mod list;

pub(crate) use arena::BlockArena;

use std::fmt;
use std::panic::Location;

/// Every block starts and ends on this boundary.
pub const BLOCK_ALIGN: usize = 32;

/// Bytes reserved in front of each user region.
pub const BLOCK_HEADER_SIZE: usize = 32;

/// Bytes reserved after each user region for the canary.
pub const BLOCK_FOOTER_SIZE: usize = std::mem::size_of::<u32>();

/// Smallest block that can hold a one-byte allocation.
pub const MIN_BLOCK_SIZE: usize = align_up(BLOCK_HEADER_SIZE + BLOCK_FOOTER_SIZE + 1, BLOCK_ALIGN);

/// Longest source file name kept in diagnostics. Longer names keep their tail.
pub const MAX_SOURCE_NAME: usize = 64;

/// Rounds `size` up to a multiple of `align`, which must be a power of two.
#[inline]
#[must_use]
pub const fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// Bytes a block needs to serve a request of `requested` bytes, or `None`
/// if the computation overflows.
#[inline]
#[must_use]
pub fn required_size(requested: usize) -> Option<usize> {
    requested
        .checked_add(BLOCK_HEADER_SIZE + BLOCK_FOOTER_SIZE + BLOCK_ALIGN - 1)
        .map(|padded| padded & !(BLOCK_ALIGN - 1))
}

/// Index of a block record inside its heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    #[inline]
    pub(crate) const fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    /// Position of the record in the block table.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Which allocation entry point produced a block.
///
/// Freeing with a different kind than the one used to allocate is reported
/// but still performed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocKind {
    /// Backing buffer of a nested heap.
    Heap,
    /// Lives for the whole program.
    Static,
    /// `malloc`-style raw bytes.
    Malloc,
    /// Single object.
    New,
    /// Array of objects.
    NewArray,
}

impl fmt::Display for AllocKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Heap => "heap",
            Self::Static => "static",
            Self::Malloc => "malloc",
            Self::New => "new",
            Self::NewArray => "new[]",
        };
        f.write_str(name)
    }
}

/// Call site that requested an allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceLocation {
    file: &'static str,
    line: u32,
}

impl SourceLocation {
    /// Creates a location from a file name and line.
    #[must_use]
    pub const fn new(file: &'static str, line: u32) -> Self {
        Self { file, line }
    }

    /// Placeholder for allocations with no known call site.
    #[must_use]
    pub const fn unknown() -> Self {
        Self { file: "<unknown>", line: 0 }
    }

    /// Location of the caller of the function this is used in.
    #[track_caller]
    #[must_use]
    pub fn caller() -> Self {
        Location::caller().into()
    }

    /// Full file name.
    #[inline]
    #[must_use]
    pub const fn file(&self) -> &'static str {
        self.file
    }

    /// Line number.
    #[inline]
    #[must_use]
    pub const fn line(&self) -> u32 {
        self.line
    }

    /// File name bounded to the last [`MAX_SOURCE_NAME`] bytes.
    #[must_use]
    pub fn short_file(&self) -> &'static str {
        let file = self.file;
        if file.len() <= MAX_SOURCE_NAME {
            return file;
        }
        let mut cut = file.len() - MAX_SOURCE_NAME;
        while !file.is_char_boundary(cut) {
            cut += 1;
        }
        &file[cut..]
    }
}

impl From<&'static Location<'static>> for SourceLocation {
    fn from(location: &'static Location<'static>) -> Self {
        Self::new(location.file(), location.line())
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.short_file(), self.line)
    }
}

/// Previous/next pair of one intrusive list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Links {
    pub prev: Option<BlockId>,
    pub next: Option<BlockId>,
}

/// Block record.
#[derive(Clone, Debug)]
pub(crate) struct Block {
    /// Arena offset of the first byte (the header).
    pub start: usize,
    /// Arena offset one past the last byte.
    pub end: usize,
    /// `end - start`.
    pub size: usize,
    /// Bytes the caller asked for. Zero while free.
    pub requested: usize,
    /// Set while the block is on the live list.
    pub in_use: bool,
    /// Call site of the allocation.
    pub location: SourceLocation,
    /// Entry point of the allocation.
    pub kind: AllocKind,
    /// Allocation id, monotonically increasing per heap. Zero while free.
    pub id: u64,
    /// Free list or live list membership.
    pub status: Links,
    /// Physical neighbours.
    pub adjacent: Links,
}

impl Block {
    pub(crate) fn free(start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            size: end - start,
            requested: 0,
            in_use: false,
            location: SourceLocation::unknown(),
            kind: AllocKind::Malloc,
            id: 0,
            status: Links::default(),
            adjacent: Links::default(),
        }
    }

    /// Arena offset of the user region.
    #[inline]
    pub(crate) const fn user_offset(&self) -> usize {
        self.start + BLOCK_HEADER_SIZE
    }

    /// Arena offset of the canary.
    #[inline]
    pub(crate) const fn canary_offset(&self) -> usize {
        self.user_offset() + self.requested
    }
}
