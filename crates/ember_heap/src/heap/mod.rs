//! # Arena Heap
//!
//! A fixed-capacity heap carved out of one preallocated buffer.
//!
//! ## Safety Note
//!
//! The arena is raw memory shared with callers: they read and write their
//! user regions through the pointers we hand out while we stamp headers,
//! canaries and fill patterns around them. All arena access goes through
//! raw pointers at offsets derived from block records, never through
//! references to the buffer.

#![allow(unsafe_code)]

mod diagnostics;
pub(crate) mod registry;
mod stats;

pub use stats::{BlockInfo, HeapStats, LeakRecord};

use std::alloc::{handle_alloc_error, GlobalAlloc, Layout, System};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::block::{
    required_size, AllocKind, Block, BlockArena, BlockId, SourceLocation, BLOCK_ALIGN,
    BLOCK_HEADER_SIZE, MIN_BLOCK_SIZE,
};
use crate::config::{CoalesceMode, HeapConfig};
use crate::context;
use crate::error::{HeapError, HeapResult};
use crate::routing::{self, ReentryGuard};

/// Second word of every live block header.
const HEADER_MAGIC: u32 = 0x4845_4150;

/// Where the arena bytes came from, and where they go back on drop.
enum Backing {
    /// Straight from the system allocator.
    System(Layout),
    /// A block of the heap that was current when this one was created.
    Parent(Arc<Heap>),
}

/// Mutable bookkeeping, guarded by the heap lock.
struct HeapInner {
    arena: BlockArena,
    /// Bytes held by live blocks, headers and padding included.
    used: usize,
    /// Bytes callers asked for.
    requested: usize,
    /// High-water mark of `used`.
    peak: usize,
    /// Id handed to the next allocation. Ids start at 1.
    next_id: u64,
    /// Allocations with an id above this are leaks at audit time.
    leak_mark: u64,
}

/// A locked heap. The re-entrancy guard outlives the mutex guard, so
/// anything the bookkeeping allocates while locked bypasses the heaps.
struct Locked<'a> {
    inner: MutexGuard<'a, HeapInner>,
    _reentry: Option<ReentryGuard>,
}

impl Deref for Locked<'_> {
    type Target = HeapInner;

    fn deref(&self) -> &HeapInner {
        &self.inner
    }
}

impl DerefMut for Locked<'_> {
    fn deref_mut(&mut self) -> &mut HeapInner {
        &mut self.inner
    }
}

/// Fixed-capacity arena heap.
///
/// Serves `malloc`/`new`/`new[]`-style requests from one buffer using a
/// first-fit free list, splits blocks on allocation and coalesces them on
/// free. Every allocation records its call site, kind and a monotonically
/// increasing id for leak audits.
///
/// Freed blocks merge with both free neighbours by default. The legacy
/// merge order (next neighbour, then stop) is opt-in through
/// [`crate::CoalesceMode::NextThenStop`].
///
/// # Thread Safety
///
/// `alloc` and `free` hold the heap lock for their whole duration, so any
/// number of threads may share one heap through an `Arc`.
///
/// # Fatal Conditions
///
/// Out-of-memory, an overwritten end-of-block canary and leaks found by
/// [`Heap::check_for_leaks`] log their diagnostics and panic. With the
/// workspace `panic = "abort"` profile this ends the process.
///
/// # Example
///
/// ```rust,ignore
/// let level = Heap::new("level", 16 * 1024 * 1024);
/// level.set_mark_for_leak_testing();
///
/// let ptr = level.alloc(256, AllocKind::New);
/// // ...
/// level.free(ptr, AllocKind::New)?;
///
/// level.check_for_leaks();
/// ```
pub struct Heap {
    name: String,
    base: NonNull<u8>,
    capacity: usize,
    config: HeapConfig,
    backing: Backing,
    inner: Mutex<HeapInner>,
}

// SAFETY: `base` is owned by the heap for its whole life. Bookkeeping bytes
// are only touched under `inner`'s lock; user regions belong to whoever holds
// the pointer.
unsafe impl Send for Heap {}
// SAFETY: see above.
unsafe impl Sync for Heap {}

impl Heap {
    /// Creates a heap with the default (debug) configuration.
    ///
    /// See [`Heap::with_config`].
    ///
    /// # Panics
    ///
    /// Panics if `capacity` cannot hold a single minimal block.
    #[track_caller]
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> Arc<Self> {
        Self::with_config(name, capacity, HeapConfig::default())
    }

    /// Creates a heap of `capacity` bytes, rounded down to [`BLOCK_ALIGN`].
    ///
    /// If a heap context is active on this thread the buffer is carved out of
    /// that heap (tagged [`AllocKind::Heap`]); otherwise it comes from the
    /// system allocator. Failing to get the buffer is fatal.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` cannot hold a single minimal block, or if the
    /// buffer cannot be obtained.
    #[track_caller]
    #[must_use]
    pub fn with_config(name: impl Into<String>, capacity: usize, config: HeapConfig) -> Arc<Self> {
        let name = name.into();
        let capacity = capacity & !(BLOCK_ALIGN - 1);
        assert!(
            capacity >= MIN_BLOCK_SIZE,
            "heap '{name}' needs at least {MIN_BLOCK_SIZE} bytes"
        );
        assert!(
            capacity / BLOCK_ALIGN <= u32::MAX as usize,
            "heap '{name}' is too large to index"
        );

        let location = SourceLocation::caller();
        let (base, backing) = match context::current_heap() {
            Some(parent) => {
                let base = parent.alloc_at(capacity, location, AllocKind::Heap);
                (base, Backing::Parent(parent))
            }
            None => {
                let Ok(layout) = Layout::from_size_align(capacity, BLOCK_ALIGN) else {
                    panic!("heap '{name}': {capacity} bytes is not a valid layout");
                };
                // SAFETY: layout has a non-zero size.
                let raw = unsafe { System.alloc(layout) };
                let base = NonNull::new(raw).unwrap_or_else(|| handle_alloc_error(layout));
                (base, Backing::System(layout))
            }
        };

        // Headers are read back on free, so no byte of the arena may stay
        // uninitialised.
        // SAFETY: `base` points to `capacity` writable bytes.
        unsafe { ptr::write_bytes(base.as_ptr(), 0, capacity) };

        // Log buffers and registry bookkeeping stay out of the heaps.
        let _reentry = routing::enter_router();
        tracing::debug!(
            heap = %name,
            capacity,
            nested = matches!(backing, Backing::Parent(_)),
            "heap created"
        );

        let heap = Arc::new(Self {
            name,
            base,
            capacity,
            config,
            backing,
            inner: Mutex::new(HeapInner {
                arena: BlockArena::new(capacity),
                used: 0,
                requested: 0,
                peak: 0,
                next_id: 1,
                leak_mark: 0,
            }),
        });
        registry::register(&heap);
        heap
    }

    /// Human-readable name given at construction.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total arena size in bytes.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Active configuration.
    #[inline]
    #[must_use]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Returns true if `ptr` lies inside this heap's arena.
    #[inline]
    #[must_use]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        addr >= self.base_addr() && addr < self.base_addr() + self.capacity
    }

    /// Allocates `size` bytes tagged with the caller's location.
    ///
    /// The returned pointer is aligned to [`BLOCK_ALIGN`]. See
    /// [`Heap::alloc_at`].
    ///
    /// # Panics
    ///
    /// Panics (fatal) if no free block is large enough.
    #[track_caller]
    #[must_use]
    pub fn alloc(&self, size: usize, kind: AllocKind) -> NonNull<u8> {
        self.alloc_at(size, SourceLocation::caller(), kind)
    }

    /// Allocates `size` bytes on behalf of `location`.
    ///
    /// First-fit over the free list, split when the leftover is worth
    /// keeping, stamp header and canary, then fill the user region with the
    /// uninitialised pattern unless this is a nested heap's buffer.
    /// Zero-byte requests are served as one-byte requests.
    ///
    /// # Panics
    ///
    /// Panics (fatal) if no free block is large enough, after logging the
    /// current usage and the largest free block.
    #[must_use]
    pub fn alloc_at(&self, size: usize, location: SourceLocation, kind: AllocKind) -> NonNull<u8> {
        let requested = size.max(1);
        let mut inner = self.lock();

        let Some(required) = required_size(requested) else {
            self.out_of_memory(&inner, requested, location);
        };
        let Some(id) = inner.arena.first_fit(required) else {
            self.out_of_memory(&inner, requested, location);
        };

        let _ = inner.arena.split(id, required);
        inner.arena.mark_live(id);

        let alloc_id = inner.next_id;
        inner.next_id += 1;

        let block = inner.arena.get_mut(id);
        block.requested = requested;
        block.location = location;
        block.kind = kind;
        block.id = alloc_id;
        let (start, block_size, user, canary_at) =
            (block.start, block.size, block.user_offset(), block.canary_offset());

        inner.used += block_size;
        inner.requested += requested;
        inner.peak = inner.peak.max(inner.used);

        self.write_header(start, id);
        self.write_u32(canary_at, self.config.canary);
        if self.config.fill_patterns && kind != AllocKind::Heap {
            self.fill(user, requested, self.config.uninit_pattern);
        }

        drop(inner);
        self.ptr_at(user)
    }

    /// Releases a pointer returned by [`Heap::alloc`].
    ///
    /// The end-of-block canary is checked first. The user region is then
    /// overwritten with the freed pattern, and the block is coalesced with
    /// free neighbours and pushed to the head of the free list.
    ///
    /// # Errors
    ///
    /// - [`HeapError::KindMismatch`] if `kind` differs from the allocation's
    ///   kind. The block has been freed anyway.
    /// - [`HeapError::ForeignPointer`] / [`HeapError::UnknownBlock`] if the
    ///   pointer does not name a live block of this heap. Nothing is changed.
    ///
    /// # Panics
    ///
    /// Panics (fatal) if the canary was overwritten.
    pub fn free(&self, ptr: NonNull<u8>, kind: AllocKind) -> HeapResult<()> {
        let addr = ptr.as_ptr() as usize;
        if !self.contains(ptr) {
            return Err(HeapError::ForeignPointer {
                heap: self.name.clone(),
                addr,
            });
        }

        let user = addr - self.base_addr();
        if user < BLOCK_HEADER_SIZE || user % BLOCK_ALIGN != 0 {
            return Err(HeapError::UnknownBlock { addr });
        }
        let start = user - BLOCK_HEADER_SIZE;

        let mut inner = self.lock();
        let id = self
            .block_at(&inner.arena, start)
            .ok_or(HeapError::UnknownBlock { addr })?;

        let block = inner.arena.get(id);
        let found = self.read_u32(block.canary_offset());
        if found != self.config.canary {
            self.buffer_overflow(block, found);
        }

        let mismatch = (block.kind != kind).then(|| HeapError::KindMismatch {
            id: block.id,
            allocated: block.kind,
            freed: kind,
        });
        if mismatch.is_some() {
            tracing::warn!(
                heap = %self.name,
                id = block.id,
                size = block.requested,
                allocated = %block.kind,
                freed = %kind,
                file = block.location.short_file(),
                line = block.location.line(),
                "allocation freed with the wrong kind"
            );
        }

        let (requested, block_size, fill) = (
            block.requested,
            block.size,
            self.config.fill_patterns && block.kind != AllocKind::Heap,
        );
        if fill {
            self.fill(user, requested, self.config.freed_pattern);
        }
        self.clear_header(start);

        inner.used -= block_size;
        inner.requested -= requested;

        inner.arena.mark_free(id);
        let merged_next = inner.arena.try_merge_with_next(id);
        let survivor = if merged_next && self.config.coalesce == CoalesceMode::NextThenStop {
            id
        } else {
            inner.arena.try_merge_with_prev(id).unwrap_or(id)
        };
        inner.arena.release(survivor);

        drop(inner);
        mismatch.map_or(Ok(()), Err)
    }

    /// Usage counters and free-list shape.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let inner = self.lock();
        HeapStats {
            capacity: self.capacity,
            used: inner.used,
            requested: inner.requested,
            peak: inner.peak,
            live_blocks: inner.arena.live_count(),
            free_blocks: inner.arena.free_count(),
            total_free: inner.arena.total_free(),
            largest_free: inner.arena.largest_free(),
            allocations: inner.next_id - 1,
        }
    }

    /// Snapshot of every block in address order.
    #[must_use]
    pub fn blocks(&self) -> Vec<BlockInfo> {
        let inner = self.lock();
        inner
            .arena
            .physical()
            .map(|id| BlockInfo::from_block(inner.arena.get(id)))
            .collect()
    }

    #[inline]
    pub(crate) fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    fn lock(&self) -> Locked<'_> {
        let reentry = routing::enter_router();
        Locked {
            inner: self.inner.lock(),
            _reentry: reentry,
        }
    }

    /// Live block whose header sits at arena offset `start`.
    fn block_at(&self, arena: &BlockArena, start: usize) -> Option<BlockId> {
        let index = self.read_u32(start) as usize;
        if self.read_u32(start + 4) != HEADER_MAGIC {
            return None;
        }
        let (id, block) = arena.lookup(index)?;
        (block.in_use && block.start == start).then_some(id)
    }

    fn write_header(&self, start: usize, id: BlockId) {
        self.write_u32(start, id.index() as u32);
        self.write_u32(start + 4, HEADER_MAGIC);
    }

    fn clear_header(&self, start: usize) {
        self.write_u32(start + 4, 0);
    }

    #[inline]
    fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset < self.capacity);
        // SAFETY: offset is inside the arena, so the result is non-null and
        // in bounds of the same allocation.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    fn read_u32(&self, offset: usize) -> u32 {
        debug_assert!(offset + 4 <= self.capacity);
        // SAFETY: four in-bounds, initialised arena bytes.
        unsafe { ptr::read_unaligned(self.ptr_at(offset).as_ptr().cast::<u32>()) }
    }

    fn write_u32(&self, offset: usize, value: u32) {
        debug_assert!(offset + 4 <= self.capacity);
        // SAFETY: four in-bounds arena bytes owned by block bookkeeping.
        unsafe { ptr::write_unaligned(self.ptr_at(offset).as_ptr().cast::<u32>(), value) }
    }

    fn fill(&self, offset: usize, len: usize, byte: u8) {
        debug_assert!(offset + len <= self.capacity);
        // SAFETY: the range lies inside one block's user region.
        unsafe { ptr::write_bytes(self.ptr_at(offset).as_ptr(), byte, len) }
    }

    #[cold]
    fn out_of_memory(&self, inner: &HeapInner, requested: usize, location: SourceLocation) -> ! {
        let largest_free = inner.arena.largest_free();
        tracing::error!(
            heap = %self.name,
            requested,
            used = inner.used,
            capacity = self.capacity,
            largest_free,
            file = location.short_file(),
            line = location.line(),
            "out of memory"
        );
        panic!(
            "heap '{}' out of memory: {requested} bytes requested at {location}, \
             {} of {} bytes used, largest free block {largest_free} bytes",
            self.name, inner.used, self.capacity
        );
    }

    #[cold]
    fn buffer_overflow(&self, block: &Block, found: u32) -> ! {
        tracing::error!(
            heap = %self.name,
            id = block.id,
            size = block.requested,
            kind = %block.kind,
            file = block.location.short_file(),
            line = block.location.line(),
            expected = self.config.canary,
            found,
            "buffer overflow: end-of-block canary overwritten"
        );
        panic!(
            "heap '{}': buffer overflow in allocation {} ({} bytes from {}): \
             canary {:#010x} overwritten with {found:#010x}",
            self.name, block.id, block.requested, block.location, self.config.canary
        );
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let _reentry = routing::enter_router();
        registry::unregister(self);

        let inner = self.inner.get_mut();
        if inner.arena.live_count() > 0 {
            tracing::debug!(
                heap = %self.name,
                live_blocks = inner.arena.live_count(),
                used = inner.used,
                "heap dropped with live allocations"
            );
        }

        match &self.backing {
            // SAFETY: `base` came from `System.alloc` with this layout.
            Backing::System(layout) => unsafe { System.dealloc(self.base.as_ptr(), *layout) },
            Backing::Parent(parent) => {
                if let Err(err) = parent.free(self.base, AllocKind::Heap) {
                    tracing::error!(heap = %self.name, parent = %parent.name, %err, "failed to return arena");
                }
            }
        }
    }
}
