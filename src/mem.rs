//! Block memory: buddy pools, per-thread heaps, and the parallel-phase flag.
//!
//! Responsibilities:
//! - Allocate 32-byte-aligned blocks from per-thread buddy heaps
//! - Route cross-thread frees through lock-free per-heap return queues
//! - Map oversized blocks directly (one mapping per block)
//! - Track allocation statistics for [`mem_stats`]
//!
//! The allocator never takes a lock on the hot path: a thread allocates and
//! frees only from its own heap, and frees arriving from other threads are
//! parked on a Treiber stack the owner drains on its next allocation.

pub(crate) mod heap;
pub(crate) mod pool;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub(crate) use heap::{alloc, free};

/// True while a worker-pool dispatch is in flight. Release/retain pick
/// their atomic ordering off this flag: relaxed in the sequential phase,
/// acquire/release while workers may touch shared blocks.
static PARALLEL: AtomicBool = AtomicBool::new(false);

#[inline]
pub(crate) fn parallel_begin() {
    PARALLEL.store(true, Ordering::Release);
}

#[inline]
pub(crate) fn parallel_end() {
    PARALLEL.store(false, Ordering::Release);
}

#[inline]
pub(crate) fn in_parallel_phase() -> bool {
    PARALLEL.load(Ordering::Relaxed)
}

// Process-wide counters. Heaps update these with relaxed ordering; the
// numbers are advisory and a snapshot may be mid-update.
pub(crate) static ALLOC_COUNT: AtomicUsize = AtomicUsize::new(0);
pub(crate) static FREE_COUNT: AtomicUsize = AtomicUsize::new(0);
pub(crate) static BYTES_ALLOCATED: AtomicUsize = AtomicUsize::new(0);
pub(crate) static PEAK_BYTES: AtomicUsize = AtomicUsize::new(0);
pub(crate) static DIRECT_COUNT: AtomicUsize = AtomicUsize::new(0);
pub(crate) static DIRECT_BYTES: AtomicUsize = AtomicUsize::new(0);
pub(crate) static POOL_COUNT: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn note_alloc(bytes: usize) {
    ALLOC_COUNT.fetch_add(1, Ordering::Relaxed);
    let cur = BYTES_ALLOCATED.fetch_add(bytes, Ordering::Relaxed) + bytes;
    PEAK_BYTES.fetch_max(cur, Ordering::Relaxed);
}

pub(crate) fn note_free(bytes: usize) {
    FREE_COUNT.fetch_add(1, Ordering::Relaxed);
    BYTES_ALLOCATED.fetch_sub(bytes, Ordering::Relaxed);
}

/// Point-in-time allocator statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemStats {
    /// Blocks handed out since process start.
    pub alloc_count: usize,
    /// Blocks returned since process start.
    pub free_count: usize,
    /// Bytes currently held by live blocks (block sizes, not payloads).
    pub bytes_allocated: usize,
    /// High-water mark of `bytes_allocated`.
    pub peak_bytes: usize,
    /// Oversized blocks with a dedicated mapping.
    pub direct_count: usize,
    /// Bytes in dedicated mappings.
    pub direct_bytes: usize,
    /// Buddy pools mapped across all heaps.
    pub pool_count: usize,
}

/// Snapshot the process-wide allocation counters.
pub fn mem_stats() -> MemStats {
    MemStats {
        alloc_count: ALLOC_COUNT.load(Ordering::Relaxed),
        free_count: FREE_COUNT.load(Ordering::Relaxed),
        bytes_allocated: BYTES_ALLOCATED.load(Ordering::Relaxed),
        peak_bytes: PEAK_BYTES.load(Ordering::Relaxed),
        direct_count: DIRECT_COUNT.load(Ordering::Relaxed),
        direct_bytes: DIRECT_BYTES.load(Ordering::Relaxed),
        pool_count: POOL_COUNT.load(Ordering::Relaxed),
    }
}

