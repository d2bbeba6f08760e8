//! # EMBER Heap
//!
//! Arena heap allocator for long-running engine processes:
//! - Fixed-capacity heaps carved from one preallocated buffer each
//! - First-fit free list with block splitting and coalescing
//! - Per-allocation call site, kind and id for leak audits
//! - A per-thread context stack that redirects allocations into a heap
//!
//! ## Architecture Rules
//!
//! 1. **Bounded memory** - A heap never grows; running out is fatal
//! 2. **Loud corruption** - Overwritten canaries are caught on free
//! 3. **Scoped ownership** - A level, a subsystem or a phase gets its own
//!    heap and is audited for leaks when it ends
//!
//! ## Example
//!
//! ```rust,ignore
//! use ember_heap::{allocate, deallocate, AllocKind, Heap, HeapScope};
//!
//! let level = Heap::new("level", 16 * 1024 * 1024);
//! level.set_mark_for_leak_testing();
//! {
//!     let _scope = HeapScope::enter(&level);
//!     let ptr = allocate(256, AllocKind::New);
//!     unsafe { deallocate(ptr, AllocKind::New)? };
//! }
//! level.check_for_leaks();
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod block;
pub mod config;
pub mod context;
pub mod error;
pub mod heap;
pub mod routing;

pub use block::{
    AllocKind, BlockId, SourceLocation, BLOCK_ALIGN, BLOCK_FOOTER_SIZE, BLOCK_HEADER_SIZE,
    MIN_BLOCK_SIZE,
};
pub use config::{CoalesceMode, HeapConfig};
pub use context::{
    context_depth, current_heap, pop_heap, push_heap, HeapContextStack, HeapScope,
    MAX_HEAP_CONTEXT_DEPTH,
};
pub use error::{HeapError, HeapResult};
pub use heap::{BlockInfo, Heap, HeapStats, LeakRecord};
pub use routing::{allocate, allocate_at, deallocate, RoutedAllocator};
