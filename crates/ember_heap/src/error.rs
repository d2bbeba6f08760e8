//! # Heap Error Types
//!
//! Recoverable conditions only. Out-of-memory, canary overwrites, leaks at a
//! checkpoint and context stack misuse are not errors: they are fatal and
//! panic after logging (see `Heap::alloc`).

use thiserror::Error;

use crate::block::AllocKind;

/// Errors that can be returned by heap operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    /// Block was released with a different kind than it was allocated with.
    ///
    /// The free has already been performed when this is returned.
    #[error("allocation {id} was made as {allocated} but freed as {freed}")]
    KindMismatch {
        /// Allocation id of the block.
        id: u64,
        /// Kind used at allocation time.
        allocated: AllocKind,
        /// Kind passed to free.
        freed: AllocKind,
    },

    /// Pointer does not lie inside this heap's arena.
    #[error("pointer {addr:#x} does not belong to heap '{heap}'")]
    ForeignPointer {
        /// Name of the heap asked to free the pointer.
        heap: String,
        /// Address that was passed in.
        addr: usize,
    },

    /// The header in front of the pointer does not describe a live block.
    ///
    /// Double frees and interior pointers end up here.
    #[error("no live block starts at {addr:#x}")]
    UnknownBlock {
        /// Address that was passed in.
        addr: usize,
    },

    /// Invalid configuration file.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for heap operations.
pub type HeapResult<T> = Result<T, HeapError>;
