//! Event counters for the chunk and thread-cache layers (feature `stats`).
//!
//! All counters use `Relaxed` ordering. They are observational only and are
//! never used for synchronization; the spinlocks provide the ordering.
//!
//! Accounting that correctness depends on (live chunk counts, per-bin request
//! counts) is not here: it lives in [`ChunkRegistry`](crate::registry::ChunkRegistry)
//! and [`BinStats`](crate::arena::BinStats) and is always on.
//!
//! # Usage
//!
//! ```ignore
//! let snap = chunkcache::stats::snapshot();
//! println!("recycled: {}", snap.chunk_recycles);
//! ```

use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Stats {
    // ---- Chunk layer ----
    /// Successful non-base chunk allocations.
    pub chunk_allocs: AtomicU64,
    /// Chunk deallocations.
    pub chunk_deallocs: AtomicU64,
    /// Allocations served from an extent tree.
    pub chunk_recycles: AtomicU64,
    /// Recycles that left a leading or trailing remainder.
    pub extent_splits: AtomicU64,
    /// Forward or backward merges on record.
    pub extent_coalesces: AtomicU64,
    /// Successful dss growths.
    pub dss_grows: AtomicU64,
    /// Fresh anonymous mappings.
    pub mmap_maps: AtomicU64,
    /// Bytes handed to `purge`.
    pub purged_bytes: AtomicU64,
    /// Ranges dropped because no extent node was available.
    pub node_leaks: AtomicU64,

    // ---- Thread caches ----
    /// Batch refills from an arena bin.
    pub tcache_fills: AtomicU64,
    /// Flush calls that returned at least one object.
    pub tcache_flushes: AtomicU64,
    /// GC ticks.
    pub tcache_gc_ticks: AtomicU64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            chunk_allocs: AtomicU64::new(0),
            chunk_deallocs: AtomicU64::new(0),
            chunk_recycles: AtomicU64::new(0),
            extent_splits: AtomicU64::new(0),
            extent_coalesces: AtomicU64::new(0),
            dss_grows: AtomicU64::new(0),
            mmap_maps: AtomicU64::new(0),
            purged_bytes: AtomicU64::new(0),
            node_leaks: AtomicU64::new(0),
            tcache_fills: AtomicU64::new(0),
            tcache_flushes: AtomicU64::new(0),
            tcache_gc_ticks: AtomicU64::new(0),
        }
    }
}

#[cfg_attr(not(feature = "stats"), allow(dead_code))]
pub(crate) static STATS: Stats = Stats::new();

/// A point-in-time snapshot of all event counters.
///
/// Individual fields are each atomically read, but the snapshot as a whole
/// is not globally consistent. Counters are process-wide: every
/// [`ChunkManager`](crate::ChunkManager) instance adds to the same totals.
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    pub chunk_allocs: u64,
    pub chunk_deallocs: u64,
    pub chunk_recycles: u64,
    pub extent_splits: u64,
    pub extent_coalesces: u64,
    pub dss_grows: u64,
    pub mmap_maps: u64,
    pub purged_bytes: u64,
    pub node_leaks: u64,
    pub tcache_fills: u64,
    pub tcache_flushes: u64,
    pub tcache_gc_ticks: u64,
}

/// Load all counters with `Relaxed` ordering and return a [`Snapshot`].
/// Without the `stats` feature every field reads zero.
pub fn snapshot() -> Snapshot {
    let s = &STATS;
    Snapshot {
        chunk_allocs: s.chunk_allocs.load(Ordering::Relaxed),
        chunk_deallocs: s.chunk_deallocs.load(Ordering::Relaxed),
        chunk_recycles: s.chunk_recycles.load(Ordering::Relaxed),
        extent_splits: s.extent_splits.load(Ordering::Relaxed),
        extent_coalesces: s.extent_coalesces.load(Ordering::Relaxed),
        dss_grows: s.dss_grows.load(Ordering::Relaxed),
        mmap_maps: s.mmap_maps.load(Ordering::Relaxed),
        purged_bytes: s.purged_bytes.load(Ordering::Relaxed),
        node_leaks: s.node_leaks.load(Ordering::Relaxed),
        tcache_fills: s.tcache_fills.load(Ordering::Relaxed),
        tcache_flushes: s.tcache_flushes.load(Ordering::Relaxed),
        tcache_gc_ticks: s.tcache_gc_ticks.load(Ordering::Relaxed),
    }
}
