//! # Heap Context Stack
//!
//! A small, fixed-depth stack of "current heap" entries. Pushing a heap
//! redirects every routed allocation on this thread into it, including
//! allocations made by code that never heard of heaps; popping restores the
//! previous target.
//!
//! ## Thread Safety
//!
//! The process-facing stack is per thread. Two threads can never race a
//! push against a pop, and a context switch around a phase (level load,
//! video-mode change) only affects the thread that makes it. A
//! [`HeapContextStack`] value can also be owned and passed around directly.
//!
//! ## Example
//!
//! ```rust,ignore
//! let level = Heap::new("level", 64 * 1024 * 1024);
//! {
//!     let _scope = HeapScope::enter(&level);
//!     load_level(); // every routed allocation lands in `level`
//! }
//! ```

use std::cell::RefCell;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::heap::Heap;

/// Maximum nesting of heap contexts.
pub const MAX_HEAP_CONTEXT_DEPTH: usize = 4;

/// Ordered heap references, most recent first.
#[derive(Debug, Default)]
pub struct HeapContextStack {
    entries: [Option<Arc<Heap>>; MAX_HEAP_CONTEXT_DEPTH],
    len: usize,
}

impl HeapContextStack {
    /// Creates an empty stack.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [None, None, None, None],
            len: 0,
        }
    }

    /// Number of heaps on the stack.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no heap is active.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Makes `heap` the current heap.
    ///
    /// # Panics
    ///
    /// Panics (fatal) if the stack is already [`MAX_HEAP_CONTEXT_DEPTH`]
    /// deep.
    pub fn push(&mut self, heap: Arc<Heap>) {
        if self.len == MAX_HEAP_CONTEXT_DEPTH {
            tracing::error!(
                heap = %heap.name(),
                depth = self.len,
                current = %self.names(),
                "heap context stack overflow"
            );
            panic!(
                "heap context stack overflow pushing '{}': already {MAX_HEAP_CONTEXT_DEPTH} deep",
                heap.name()
            );
        }

        self.entries[..=self.len].rotate_right(1);
        self.entries[0] = Some(heap);
        self.len += 1;
    }

    /// Removes the current heap and returns it. The previous entry becomes
    /// current.
    ///
    /// If `expected` is given it must be the current heap; this catches
    /// unbalanced push/pop pairs.
    ///
    /// # Panics
    ///
    /// Panics (fatal) if the stack is empty or `expected` is not the current
    /// heap.
    pub fn pop(&mut self, expected: Option<&Arc<Heap>>) -> Arc<Heap> {
        let Some(current) = self.entries[0].take() else {
            tracing::error!("heap context stack underflow");
            panic!("heap context stack underflow: pop with no active heap");
        };

        if let Some(expected) = expected {
            if !Arc::ptr_eq(expected, &current) {
                tracing::error!(
                    expected = %expected.name(),
                    current = %current.name(),
                    "heap context pop mismatch"
                );
                let (expected, found) = (expected.name().to_owned(), current.name().to_owned());
                self.entries[0] = Some(current);
                panic!("heap context pop mismatch: expected '{expected}', current is '{found}'");
            }
        }

        self.entries[..self.len].rotate_left(1);
        self.len -= 1;
        current
    }

    /// The current heap, or `None` when allocations go to the system.
    #[inline]
    #[must_use]
    pub fn current(&self) -> Option<&Arc<Heap>> {
        self.entries[0].as_ref()
    }

    /// Heaps on the stack, most recent first.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Heap>> {
        self.entries[..self.len].iter().flatten()
    }

    /// The innermost heap on the stack that contains `ptr`.
    ///
    /// A heap created under another one lives inside its parent's arena, so
    /// the smallest containing arena wins, not the most recent entry.
    #[must_use]
    pub fn find_owner(&self, ptr: NonNull<u8>) -> Option<&Arc<Heap>> {
        self.iter()
            .filter(|heap| heap.contains(ptr))
            .min_by_key(|heap| heap.capacity())
    }

    fn names(&self) -> String {
        self.iter().map(|heap| heap.name()).collect::<Vec<_>>().join(" > ")
    }
}

thread_local! {
    static CONTEXT: RefCell<HeapContextStack> = const { RefCell::new(HeapContextStack::new()) };
}

/// Makes `heap` the current heap of this thread.
///
/// # Panics
///
/// Panics (fatal) if this thread already has [`MAX_HEAP_CONTEXT_DEPTH`]
/// heaps pushed.
pub fn push_heap(heap: Arc<Heap>) {
    CONTEXT.with(|stack| stack.borrow_mut().push(heap));
}

/// Pops this thread's current heap. See [`HeapContextStack::pop`].
///
/// # Panics
///
/// Panics (fatal) if no heap is pushed or `expected` is not current.
pub fn pop_heap(expected: Option<&Arc<Heap>>) -> Arc<Heap> {
    CONTEXT.with(|stack| stack.borrow_mut().pop(expected))
}

/// This thread's current heap.
#[must_use]
pub fn current_heap() -> Option<Arc<Heap>> {
    with_context(|stack| stack.current().cloned()).flatten()
}

/// Number of heaps pushed on this thread.
#[must_use]
pub fn context_depth() -> usize {
    with_context(HeapContextStack::len).unwrap_or(0)
}

/// Runs `f` on this thread's stack.
///
/// Returns `None` instead of panicking when the stack is unavailable (thread
/// teardown, or already mutably borrowed), which the allocator paths rely
/// on.
pub(crate) fn with_context<R>(f: impl FnOnce(&HeapContextStack) -> R) -> Option<R> {
    CONTEXT
        .try_with(|stack| stack.try_borrow().ok().map(|stack| f(&stack)))
        .ok()
        .flatten()
}

/// Pushes a heap for the lifetime of the guard.
///
/// Dropping the guard pops the heap and checks that it is still current.
#[must_use = "the heap is popped as soon as the scope guard is dropped"]
pub struct HeapScope {
    heap: Arc<Heap>,
    // The context stack is per thread; the guard must drop where it was made.
    _not_send: PhantomData<*const ()>,
}

impl HeapScope {
    /// Pushes `heap` onto this thread's context stack.
    ///
    /// # Panics
    ///
    /// Panics (fatal) if the stack is full.
    pub fn enter(heap: &Arc<Heap>) -> Self {
        push_heap(Arc::clone(heap));
        Self {
            heap: Arc::clone(heap),
            _not_send: PhantomData,
        }
    }

    /// The heap this scope pushed.
    #[must_use]
    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }
}

impl Drop for HeapScope {
    fn drop(&mut self) {
        // Already unwinding: a second panic would abort before the first
        // one's diagnostics are out.
        let expected = (!std::thread::panicking()).then_some(&self.heap);
        drop(pop_heap(expected));
    }
}
