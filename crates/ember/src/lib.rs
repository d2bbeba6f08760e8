//! # EMBER Engine
//!
//! Facade over the engine crates. Game code depends on `ember` and reaches
//! subsystems through their module here.
//!
//! ## Example
//!
//! ```rust,ignore
//! use ember::heap::{AllocKind, Heap, HeapScope};
//!
//! let level = Heap::new("level", 16 * 1024 * 1024);
//! let _scope = HeapScope::enter(&level);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

/// Arena heaps, the heap context stack and allocation routing.
pub use ember_heap as heap;
