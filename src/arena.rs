//! The arena side of the thread-cache contract.
//!
//! Arenas (and their bin/run allocators) live outside this crate. A thread
//! cache only needs three things from one: a lock per size-class bin with
//! request statistics in it, a way to carve and return objects while that
//! lock is held, and a roster of the caches currently bound to it. [`Arena`]
//! is that surface; [`ArenaMap`] finds the arena owning a pointer.

use crate::size_class::NUM_SIZE_CLASSES;
use crate::sync::SpinMutex;
use core::cell::UnsafeCell;
use core::marker::PhantomPinned;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

/// Per-bin counters, kept under the bin lock.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct BinStats {
    /// Allocation requests, including those served by thread caches once
    /// merged.
    pub nrequests: u64,
    /// Thread cache refills.
    pub nfills: u64,
    /// Thread cache flushes.
    pub nflushes: u64,
    /// Objects handed out by the bin.
    pub nmalloc: u64,
    /// Objects returned to the bin.
    pub ndalloc: u64,
}

/// What a bin lock protects: statistics plus the implementor's run state.
#[derive(Default, Debug)]
pub struct ArenaBin<R> {
    pub stats: BinStats,
    pub runs: R,
}

impl<R> ArenaBin<R> {
    pub const fn new(runs: R) -> Self {
        Self {
            stats: BinStats {
                nrequests: 0,
                nfills: 0,
                nflushes: 0,
                nmalloc: 0,
                ndalloc: 0,
            },
            runs,
        }
    }
}

pub trait Arena: Sync {
    /// Run/region state guarded by each bin lock.
    type Runs;

    /// Arena index, for logs.
    fn ind(&self) -> usize;

    /// The lock of size class `class`.
    fn bin(&self, class: usize) -> &SpinMutex<ArenaBin<Self::Runs>>;

    /// The arena lock, guarding the list of bound thread caches. Taken
    /// before any bin lock.
    fn roster(&self) -> &SpinMutex<TcacheRoster>;

    /// Carve up to `out.len()` objects of `class` into `out`, front to back,
    /// returning how many were produced. Called with the bin lock held; may
    /// allocate chunks.
    fn fill_locked(&self, runs: &mut Self::Runs, class: usize, out: &mut [NonNull<u8>]) -> usize;

    /// Return one object of `class`. Called with the bin lock held.
    fn dalloc_locked(&self, runs: &mut Self::Runs, class: usize, ptr: NonNull<u8>);

    /// Account `bytes` of cached allocation toward the next profiling
    /// sample.
    fn prof_accum(&self, bytes: u64) {
        let _ = bytes;
    }
}

/// Maps an object back to the arena that owns its chunk.
pub trait ArenaMap {
    type Arena: Arena;

    fn owner(&self, ptr: NonNull<u8>) -> &Self::Arena;
}

/// Request counters of one thread cache, reachable from the roster of the
/// arena it is bound to. The owner thread only ever adds; merges swap the
/// counters back to zero.
pub struct TcacheStats {
    nrequests: [AtomicU64; NUM_SIZE_CLASSES],
    link: UnsafeCell<RosterLink>,
    _pin: PhantomPinned,
}

#[derive(Clone, Copy, Default)]
struct RosterLink {
    prev: Option<NonNull<TcacheStats>>,
    next: Option<NonNull<TcacheStats>>,
}

// SAFETY: counters are atomic; `link` is only touched under the roster lock.
unsafe impl Sync for TcacheStats {}
unsafe impl Send for TcacheStats {}

impl Default for TcacheStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TcacheStats {
    pub const fn new() -> Self {
        Self {
            nrequests: [const { AtomicU64::new(0) }; NUM_SIZE_CLASSES],
            link: UnsafeCell::new(RosterLink { prev: None, next: None }),
            _pin: PhantomPinned,
        }
    }

    #[inline]
    pub fn nrequests(&self, class: usize) -> u64 {
        self.nrequests[class].load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn add_request(&self, class: usize) {
        self.nrequests[class].fetch_add(1, Ordering::Relaxed);
    }

    /// Reset `class`'s counter, returning what it held.
    #[inline]
    pub fn take_nrequests(&self, class: usize) -> u64 {
        self.nrequests[class].swap(0, Ordering::Relaxed)
    }
}

/// Intrusive list of the thread caches bound to one arena.
pub struct TcacheRoster {
    head: Option<NonNull<TcacheStats>>,
    len: usize,
}

// SAFETY: the roster only lives inside a SpinMutex, and linked blocks are
// Sync.
unsafe impl Send for TcacheRoster {}

impl Default for TcacheRoster {
    fn default() -> Self {
        Self::new()
    }
}

impl TcacheRoster {
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// # Safety
    ///
    /// `stats` must be on no roster and must stay valid, at the same address,
    /// until it is unlinked.
    pub unsafe fn link(&mut self, stats: NonNull<TcacheStats>) {
        unsafe {
            *stats.as_ref().link.get() = RosterLink { prev: None, next: self.head };
            if let Some(head) = self.head {
                (*head.as_ref().link.get()).prev = Some(stats);
            }
        }
        self.head = Some(stats);
        self.len += 1;
    }

    /// # Safety
    ///
    /// `stats` must be linked on this roster.
    pub unsafe fn unlink(&mut self, stats: NonNull<TcacheStats>) {
        unsafe {
            let link = *stats.as_ref().link.get();
            match link.prev {
                Some(prev) => (*prev.as_ref().link.get()).next = link.next,
                None => self.head = link.next,
            }
            if let Some(next) = link.next {
                (*next.as_ref().link.get()).prev = link.prev;
            }
            *stats.as_ref().link.get() = RosterLink::default();
        }
        self.len -= 1;
    }

    pub fn for_each(&self, mut f: impl FnMut(&TcacheStats)) {
        let mut cur = self.head;
        while let Some(s) = cur {
            // SAFETY: linked blocks stay valid until unlinked, which needs
            // the lock we are under.
            let s = unsafe { s.as_ref() };
            f(s);
            cur = unsafe { (*s.link.get()).next };
        }
    }

    /// Take every bound cache's outstanding `class` requests.
    pub fn merge_nrequests(&self, class: usize) -> u64 {
        let mut total = 0;
        self.for_each(|s| total += s.take_nrequests(class));
        total
    }
}

/// Fold the request counters of every thread cache bound to `arena` into
/// its bins, as a statistics dump does.
pub fn merge_tcache_stats<A: Arena>(arena: &A) {
    let roster = arena.roster().lock();
    for class in 1..NUM_SIZE_CLASSES {
        let n = roster.merge_nrequests(class);
        if n != 0 {
            arena.bin(class).lock().stats.nrequests += n;
        }
    }
}
