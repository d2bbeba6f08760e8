//! # Allocation Routing
//!
//! The two call shapes the rest of the engine sees:
//!
//! - [`allocate`]: "give me N bytes, tagged with my call site and kind"
//! - [`deallocate`]: "take this pointer back, I believe it was this kind"
//!
//! Requests go to the current heap of the thread's context stack, or to the
//! system allocator when no heap is pushed. [`RoutedAllocator`] puts the
//! same routing behind `#[global_allocator]` so `Box`, `Vec` and `String`
//! follow the context stack too.
//!
//! ## Safety Note
//!
//! Untracked allocations carry a size prefix so [`deallocate`] can rebuild
//! their layout; reading it requires trusting the caller's pointer.

#![allow(unsafe_code)]

use std::alloc::{handle_alloc_error, GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::ptr::NonNull;

use crate::block::{AllocKind, SourceLocation, BLOCK_ALIGN};
use crate::context;
use crate::error::{HeapError, HeapResult};
use crate::heap::registry;

/// Size prefix in front of untracked allocations. One alignment unit keeps
/// the user pointer aligned like heap pointers are.
const SYSTEM_HEADER_SIZE: usize = BLOCK_ALIGN;

thread_local! {
    static IN_ROUTER: Cell<bool> = const { Cell::new(false) };
}

/// Marks this thread as inside the allocator. While it lives, routed
/// allocations bypass the heaps.
pub(crate) struct ReentryGuard(());

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        let _ = IN_ROUTER.try_with(|flag| flag.set(false));
    }
}

/// Enters the allocator. Returns `None` if this thread is already inside it
/// (or is tearing down its thread locals).
pub(crate) fn enter_router() -> Option<ReentryGuard> {
    IN_ROUTER
        .try_with(|flag| {
            if flag.get() {
                None
            } else {
                flag.set(true);
                Some(ReentryGuard(()))
            }
        })
        .ok()
        .flatten()
}

fn in_router() -> bool {
    IN_ROUTER.try_with(Cell::get).unwrap_or(true)
}

/// Allocates `size` bytes from the current heap, tagged with the caller's
/// location.
///
/// # Panics
///
/// Panics (fatal) if the current heap is out of memory.
#[track_caller]
#[must_use]
pub fn allocate(size: usize, kind: AllocKind) -> NonNull<u8> {
    allocate_at(size, SourceLocation::caller(), kind)
}

/// Allocates `size` bytes on behalf of `location`.
///
/// With no heap pushed on this thread the request goes to the system
/// allocator untracked. The pointer is aligned to [`BLOCK_ALIGN`] either way.
///
/// # Panics
///
/// Panics (fatal) if the current heap is out of memory.
#[must_use]
pub fn allocate_at(size: usize, location: SourceLocation, kind: AllocKind) -> NonNull<u8> {
    if !in_router() {
        let routed =
            context::with_context(|stack| stack.current().map(|heap| heap.alloc_at(size, location, kind)))
                .flatten();
        if let Some(ptr) = routed {
            return ptr;
        }
    }
    system_allocate(size)
}

/// Returns `ptr` to whoever handed it out.
///
/// The owner is the innermost heap whose arena contains the pointer: this
/// thread's context entries and every other live heap are considered.
/// Anything no heap contains goes back to the system allocator.
///
/// # Errors
///
/// Whatever the owning heap's [`crate::Heap::free`] reports. A kind mismatch
/// still frees the block.
///
/// # Safety
///
/// `ptr` must come from [`allocate`] or [`allocate_at`] and must not have
/// been deallocated already.
pub unsafe fn deallocate(ptr: NonNull<u8>, kind: AllocKind) -> HeapResult<()> {
    if let Some(result) = free_in_heaps(ptr, kind) {
        return result;
    }
    // SAFETY: no heap owns the pointer, so it came from `system_allocate`.
    unsafe { system_deallocate(ptr) };
    Ok(())
}

/// Frees `ptr` in the heap that owns it, if any does.
///
/// A nested heap's arena lies inside its parent's, so the owner is the
/// innermost heap containing `ptr`, whether or not it is still pushed.
fn free_in_heaps(ptr: NonNull<u8>, kind: AllocKind) -> Option<HeapResult<()>> {
    let from_stack = context::with_context(|stack| stack.find_owner(ptr).cloned()).flatten();
    let owner = match (from_stack, registry::find_owner(ptr)) {
        (Some(pushed), Some(registered)) if registered.capacity() < pushed.capacity() => Some(registered),
        (pushed, registered) => pushed.or(registered),
    };
    owner.map(|heap| heap.free(ptr, kind))
}

fn system_allocate(size: usize) -> NonNull<u8> {
    let layout = system_layout(size);
    // SAFETY: the layout is at least one header long.
    let raw = unsafe { System.alloc(layout) };
    let Some(raw) = NonNull::new(raw) else {
        handle_alloc_error(layout);
    };

    // SAFETY: the allocation is `SYSTEM_HEADER_SIZE + size` bytes, aligned
    // for `usize`.
    unsafe {
        raw.as_ptr().cast::<usize>().write(size);
        NonNull::new_unchecked(raw.as_ptr().add(SYSTEM_HEADER_SIZE))
    }
}

/// # Safety
///
/// `ptr` must come from `system_allocate` and not be freed yet.
unsafe fn system_deallocate(ptr: NonNull<u8>) {
    // SAFETY: the caller guarantees a size prefix sits right before `ptr`.
    unsafe {
        let raw = ptr.as_ptr().sub(SYSTEM_HEADER_SIZE);
        let size = raw.cast::<usize>().read();
        System.dealloc(raw, system_layout(size));
    }
}

fn system_layout(size: usize) -> Layout {
    size.checked_add(SYSTEM_HEADER_SIZE)
        .and_then(|total| Layout::from_size_align(total, BLOCK_ALIGN).ok())
        .unwrap_or_else(|| panic!("allocation of {size} bytes overflows"))
}

/// `GlobalAlloc` that follows the heap context stack.
///
/// Install it with `#[global_allocator]` to send every `Box`/`Vec`/`String`
/// made inside a [`crate::HeapScope`] to that scope's heap. Call sites are
/// not known here, so blocks are tagged [`AllocKind::New`] at an unknown
/// location. Alignments above [`BLOCK_ALIGN`] and anything the heaps
/// allocate for their own bookkeeping go straight to the system allocator.
///
/// ```rust,ignore
/// #[global_allocator]
/// static ALLOCATOR: RoutedAllocator = RoutedAllocator;
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct RoutedAllocator;

unsafe impl GlobalAlloc for RoutedAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= BLOCK_ALIGN {
            if let Some(_reentry) = enter_router() {
                let routed = context::with_context(|stack| {
                    stack
                        .current()
                        .map(|heap| heap.alloc_at(layout.size(), SourceLocation::unknown(), AllocKind::New))
                })
                .flatten();
                if let Some(ptr) = routed {
                    return ptr.as_ptr();
                }
            }
        }
        // SAFETY: forwarded unchanged.
        unsafe { System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            // Frees must find their heap even from inside the allocator: a
            // heap's bookkeeping may have been allocated in its parent.
            let _reentry = enter_router();
            if let Some(result) = free_in_heaps(ptr, AllocKind::New) {
                if let Err(err) = result {
                    if !matches!(err, HeapError::KindMismatch { .. }) {
                        tracing::error!(%err, "routed dealloc failed");
                    }
                }
                return;
            }
        }
        // SAFETY: no heap owns the pointer, so `System` handed it out.
        unsafe { System.dealloc(ptr, layout) }
    }
}
