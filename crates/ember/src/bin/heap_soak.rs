//! # Heap Soak Test
//!
//! Runs worker threads against nested heaps with [`RoutedAllocator`]
//! installed as the global allocator, then audits every heap for leaks and
//! corruption.
//!
//! ```text
//! heap_soak [heap.toml]
//! ```
//!
//! `RUST_LOG` sets the log level (default: info).

#![allow(unsafe_code)]

use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::unbounded;
use ember::heap::{
    allocate, deallocate, AllocKind, Heap, HeapConfig, HeapError, HeapScope, RoutedAllocator,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[global_allocator]
static ALLOCATOR: RoutedAllocator = RoutedAllocator;

const WORKERS: usize = 4;
const ROUNDS: usize = 20_000;
const MAX_LIVE: usize = 256;
const MAX_REQUEST: usize = 2048;
const ROOT_HEAP_SIZE: usize = 64 * 1024 * 1024;
const WORKER_HEAP_SIZE: usize = 8 * 1024 * 1024;

const KINDS: [AllocKind; 3] = [AllocKind::Malloc, AllocKind::New, AllocKind::NewArray];

/// What one worker did to its heap.
#[derive(Debug)]
struct WorkerReport {
    worker: usize,
    allocations: u64,
    peak: usize,
    kind_mismatches: u32,
    elapsed_us: u64,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_names(true)
                .compact(),
        )
        .init();
}

/// Heap config from the TOML file named on the command line, if any.
fn load_config() -> HeapConfig {
    let Some(path) = std::env::args().nth(1) else {
        return HeapConfig::default();
    };

    let loaded = std::fs::read_to_string(&path)
        .map_err(|err| err.to_string())
        .and_then(|source| HeapConfig::from_toml_str(&source).map_err(|err| err.to_string()));
    match loaded {
        Ok(config) => {
            tracing::info!(%path, ?config, "heap config loaded");
            config
        }
        Err(err) => {
            tracing::warn!(%path, %err, "using default heap config");
            HeapConfig::default()
        }
    }
}

/// Churns `heap` with raw allocations and routed `String`s.
///
/// Nothing in here logs or prints while the scope is active: lazily
/// allocated thread-local buffers would land in the heap and show up as
/// leaks.
fn run_worker(worker: usize, heap: &Arc<Heap>) -> WorkerReport {
    let mut rng = StdRng::seed_from_u64(0x5EED_0000 + worker as u64);
    let mut kind_mismatches = 0;
    let start = Instant::now();

    heap.set_mark_for_leak_testing();
    {
        let _scope = HeapScope::enter(heap);
        let mut raw: Vec<(NonNull<u8>, AllocKind)> = Vec::with_capacity(MAX_LIVE);
        let mut names: Vec<String> = Vec::new();

        for round in 0..ROUNDS {
            match rng.gen_range(0..4) {
                0 | 1 if raw.len() < MAX_LIVE => {
                    let size = rng.gen_range(0..MAX_REQUEST);
                    let kind = KINDS[rng.gen_range(0..KINDS.len())];
                    raw.push((allocate(size, kind), kind));
                }
                2 if !raw.is_empty() => {
                    let (ptr, kind) = raw.swap_remove(rng.gen_range(0..raw.len()));
                    // Now and then free with the wrong kind: reported, not fatal.
                    let claimed = if rng.gen_ratio(1, 500) { AllocKind::Static } else { kind };
                    // SAFETY: `ptr` came from `allocate` and left `raw` just now.
                    if let Err(HeapError::KindMismatch { .. }) = unsafe { deallocate(ptr, claimed) } {
                        kind_mismatches += 1;
                    }
                }
                _ => {
                    names.push(format!("entity-{worker}-{round}"));
                    if names.len() > MAX_LIVE {
                        names.clear();
                    }
                }
            }
        }

        for (ptr, kind) in raw.drain(..) {
            // SAFETY: every pointer left in `raw` is live.
            let _ = unsafe { deallocate(ptr, kind) };
        }
    }

    let stats = heap.stats();
    WorkerReport {
        worker,
        allocations: stats.allocations,
        peak: stats.peak,
        kind_mismatches,
        elapsed_us: start.elapsed().as_micros() as u64,
    }
}

fn main() {
    init_tracing();

    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║           EMBER HEAP SOAK TEST                                   ║");
    println!("║           Nested heaps + routed global allocator                 ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!();

    let config = load_config();
    let root = Heap::with_config("root", ROOT_HEAP_SIZE, config.clone());
    root.set_mark_for_leak_testing();

    // Worker arenas, their names and this list are carved out of `root`.
    let worker_heaps: Vec<Arc<Heap>> = {
        let _scope = HeapScope::enter(&root);
        (0..WORKERS)
            .map(|i| Heap::with_config(format!("worker-{i}"), WORKER_HEAP_SIZE, config.clone()))
            .collect()
    };
    root.print_status();

    println!("Running {WORKERS} workers x {ROUNDS} rounds...");
    let test_start = Instant::now();

    let (tx, rx) = unbounded();
    let handles: Vec<_> = worker_heaps
        .iter()
        .enumerate()
        .map(|(worker, heap)| {
            let heap = Arc::clone(heap);
            let tx = tx.clone();
            std::thread::Builder::new()
                .name(format!("soak-{worker}"))
                .spawn(move || {
                    tracing::debug!(worker, "started");
                    let report = run_worker(worker, &heap);
                    let _ = tx.send(report);
                })
        })
        .collect();
    drop(tx);

    let mut reports: Vec<WorkerReport> = rx.iter().collect();
    for handle in handles {
        match handle.map(std::thread::JoinHandle::join) {
            Ok(Ok(())) => {}
            Ok(Err(_)) => tracing::error!("worker panicked"),
            Err(err) => tracing::error!(%err, "failed to spawn worker"),
        }
    }
    let total_ms = test_start.elapsed().as_millis();
    reports.sort_by_key(|report| report.worker);

    println!();
    println!("═══════════════════════════════════════════════════════════════════");
    println!("                           RESULTS");
    println!("═══════════════════════════════════════════════════════════════════");
    for report in &reports {
        println!(
            "  worker-{}: {:>7} allocations, peak {:>8} bytes, {:>3} kind mismatches, {:>8} µs",
            report.worker, report.allocations, report.peak, report.kind_mismatches, report.elapsed_us
        );
    }
    println!("  total:    {total_ms} ms");
    println!();

    for heap in &worker_heaps {
        heap.print_status();
        heap.verify_integrity();
        heap.check_for_leaks();
    }

    drop(worker_heaps);
    root.verify_integrity();
    root.check_for_leaks();
    root.print_status();

    println!("✅ All heaps verified, no leaks");
}
