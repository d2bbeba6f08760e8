//! Status dumps, leak audits and integrity checks.
//!
//! Everything here reports through `tracing`. Only the leak audit and the
//! integrity check have consequences: both are fatal when they find
//! something.

use crate::block::Block;
use crate::config::CoalesceMode;
use crate::routing;

use super::{Heap, LeakRecord};

impl Heap {
    /// Logs usage, peak and fragmentation at `info` level.
    pub fn print_status(&self) {
        let stats = self.stats();
        let _reentry = routing::enter_router();
        tracing::info!(
            heap = %self.name,
            capacity = stats.capacity,
            used = stats.used,
            usage_percent = stats.usage_percent(),
            peak = stats.peak,
            live_blocks = stats.live_blocks,
            free_blocks = stats.free_blocks,
            largest_free = stats.largest_free,
            fragmentation = stats.fragmentation(),
            "heap status"
        );
    }

    /// Logs every live block, oldest first, then a summary line.
    pub fn trace_memory_blocks(&self) {
        let inner = self.lock();
        let mut bytes = 0;
        for id in inner.arena.live_ids() {
            let block = inner.arena.get(id);
            bytes += block.requested;
            tracing::info!(
                heap = %self.name,
                id = block.id,
                size = block.requested,
                kind = %block.kind,
                file = block.location.short_file(),
                line = block.location.line(),
                "live block"
            );
        }
        tracing::info!(
            heap = %self.name,
            live_blocks = inner.arena.live_count(),
            bytes,
            "end of live blocks"
        );
    }

    /// Starts a new leak audit window: allocations made before this call
    /// are not reported by [`Heap::check_for_leaks`].
    pub fn set_mark_for_leak_testing(&self) {
        let mut inner = self.lock();
        inner.leak_mark = inner.next_id - 1;
    }

    /// Live allocations made since the last leak mark, oldest first.
    #[must_use]
    pub fn find_leaks(&self) -> Vec<LeakRecord> {
        let inner = self.lock();
        inner
            .arena
            .live_ids()
            .map(|id| inner.arena.get(id))
            .filter(|block| block.id > inner.leak_mark)
            .map(|block| LeakRecord {
                id: block.id,
                size: block.requested,
                kind: block.kind,
                location: block.location,
            })
            .collect()
    }

    /// Fatal leak audit.
    ///
    /// # Panics
    ///
    /// Panics after logging every allocation made since the last leak mark
    /// that is still live.
    pub fn check_for_leaks(&self) {
        let leaks = self.find_leaks();
        let _reentry = routing::enter_router();
        if leaks.is_empty() {
            tracing::info!(heap = %self.name, "no leaks");
            return;
        }

        let mut bytes = 0;
        for leak in &leaks {
            bytes += leak.size;
            tracing::error!(
                heap = %self.name,
                id = leak.id,
                size = leak.size,
                kind = %leak.kind,
                file = leak.location.short_file(),
                line = leak.location.line(),
                "leak"
            );
        }
        panic!(
            "heap '{}': {} leaked allocations ({bytes} bytes)",
            self.name,
            leaks.len()
        );
    }

    /// Walks the adjacency chain and checks every block invariant: the chain
    /// covers the arena without gaps, sizes match ranges, list membership
    /// agrees with the in-use flag and live canaries are intact.
    ///
    /// # Panics
    ///
    /// Panics on the first violation.
    pub fn verify_integrity(&self) {
        let inner = self.lock();
        let arena = &inner.arena;

        let mut on_free = vec![false; arena.record_count()];
        let mut on_live = vec![false; arena.record_count()];
        for id in arena.free_ids() {
            on_free[id.index()] = true;
        }
        for id in arena.live_ids() {
            on_live[id.index()] = true;
        }

        let mut expected_start = 0;
        let mut prev = None;
        let mut prev_free = false;
        let mut count = 0;

        for id in arena.physical() {
            let block = arena.get(id);
            if block.start != expected_start {
                self.corrupted(block, "gap or overlap in the adjacency chain");
            }
            if block.end - block.start != block.size {
                self.corrupted(block, "size does not match range");
            }
            if block.adjacent.prev != prev {
                self.corrupted(block, "broken adjacency back-link");
            }
            if block.in_use != on_live[id.index()] || block.in_use == on_free[id.index()] {
                self.corrupted(block, "status list disagrees with in-use flag");
            }
            if block.in_use {
                let found = self.read_u32(block.canary_offset());
                if found != self.config.canary {
                    self.buffer_overflow(block, found);
                }
            } else if prev_free && self.config.coalesce == CoalesceMode::Both {
                self.corrupted(block, "adjacent free blocks were not coalesced");
            }

            expected_start = block.end;
            prev = Some(id);
            prev_free = !block.in_use;
            count += 1;
        }

        if expected_start != self.capacity {
            let last = arena.get(prev.unwrap_or(arena.first()));
            self.corrupted(last, "adjacency chain does not cover the arena");
        }
        if count != arena.free_count() + arena.live_count() {
            let first = arena.get(arena.first());
            self.corrupted(first, "status lists hold blocks outside the chain");
        }
    }

    #[cold]
    fn corrupted(&self, block: &Block, what: &str) -> ! {
        tracing::error!(
            heap = %self.name,
            offset = block.start,
            size = block.size,
            in_use = block.in_use,
            "heap corrupted: {what}"
        );
        panic!(
            "heap '{}' corrupted: {what} (block at offset {}, {} bytes)",
            self.name, block.start, block.size
        );
    }
}
