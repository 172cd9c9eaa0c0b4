//! Thread cache: per-size-class LIFO stacks of free objects owned by one
//! thread.
//!
//! Allocation pops from the class's stack and only on a miss refills a batch
//! from the bound arena's bin. Deallocation pushes, flushing half the stack
//! back to the owning arenas when it is full. Every allocation and free is an
//! event; each `gc_incr` events one bin is examined round robin:
//!
//! - objects never dipped into since the last look (`low_water > 0`) are
//!   mostly flushed and future refills halve;
//! - a bin that ran dry (`low_water == -1`) gets refills twice as large,
//!   down to `lg_fill_div == 1`.
//!
//! A cache holds its request counters in a [`TcacheStats`] block linked on
//! the bound arena's roster, so [`Tcache`] is `!Unpin`: pin it, then
//! [`associate`](Tcache::associate).

use crate::arena::{Arena, ArenaMap, TcacheStats};
use crate::config::TcacheConfig;
use crate::size_class::{NUM_SIZE_CLASSES, TCACHE_TOTAL_SLOTS, avail_offset, ncached_max};
use core::marker::PhantomPinned;
use core::pin::Pin;
use core::ptr::{self, NonNull};

/// One size class's stack. The objects themselves live in the cache's
/// shared slot array.
#[derive(Clone, Copy, Debug)]
pub struct TcacheBin {
    ncached: usize,
    /// Minimum `ncached` since the last GC look, -1 once the bin ran dry.
    low_water: isize,
    /// Refills fetch `ncached_max >> lg_fill_div` objects.
    lg_fill_div: u32,
}

impl TcacheBin {
    const fn new() -> Self {
        Self {
            ncached: 0,
            low_water: 0,
            lg_fill_div: 1,
        }
    }

    #[inline]
    pub fn ncached(&self) -> usize {
        self.ncached
    }

    #[inline]
    pub fn low_water(&self) -> isize {
        self.low_water
    }

    #[inline]
    pub fn lg_fill_div(&self) -> u32 {
        self.lg_fill_div
    }
}

pub struct Tcache<'a, M: ArenaMap> {
    map: &'a M,
    /// Arena this cache allocates from and reports statistics to.
    arena: &'a M::Arena,
    config: TcacheConfig,
    bins: [TcacheBin; NUM_SIZE_CLASSES],
    /// Stack storage of every bin, laid out by `avail_offset`.
    avail: [NonNull<u8>; TCACHE_TOTAL_SLOTS],
    stats: TcacheStats,
    associated: bool,
    ev_cnt: u32,
    next_gc_bin: usize,
    #[cfg(feature = "prof")]
    prof_accumbytes: u64,
    _pin: PhantomPinned,
}

impl<'a, M: ArenaMap> Tcache<'a, M> {
    /// An empty cache bound to `arena` but not yet on its roster.
    pub fn new(map: &'a M, arena: &'a M::Arena, config: TcacheConfig) -> Self {
        Self {
            map,
            arena,
            config,
            bins: [const { TcacheBin::new() }; NUM_SIZE_CLASSES],
            avail: [NonNull::dangling(); TCACHE_TOTAL_SLOTS],
            stats: TcacheStats::new(),
            associated: false,
            ev_cnt: 0,
            next_gc_bin: 1,
            #[cfg(feature = "prof")]
            prof_accumbytes: 0,
            _pin: PhantomPinned,
        }
    }

    #[inline]
    fn inner(self: Pin<&mut Self>) -> &mut Self {
        // SAFETY: nothing below moves the cache; only fields are mutated.
        unsafe { self.get_unchecked_mut() }
    }

    #[inline]
    pub fn arena(&self) -> &'a M::Arena {
        self.arena
    }

    #[inline]
    pub fn is_associated(&self) -> bool {
        self.associated
    }

    #[inline]
    pub fn bin(&self, class: usize) -> &TcacheBin {
        &self.bins[class]
    }

    /// Requests served since the counters were last merged into an arena.
    #[inline]
    pub fn nrequests(&self, class: usize) -> u64 {
        self.stats.nrequests(class)
    }

    /// The cached objects of `class`, bottom of the stack first.
    pub fn cached(&self, class: usize) -> &[NonNull<u8>] {
        let off = avail_offset(class);
        &self.avail[off..off + self.bins[class].ncached]
    }

    #[cfg(feature = "prof")]
    #[inline]
    pub fn prof_accumbytes(&self) -> u64 {
        self.prof_accumbytes
    }

    /// Put the cache on the bound arena's roster.
    pub fn associate(self: Pin<&mut Self>) {
        let this = self.inner();
        debug_assert!(!this.associated);
        let mut roster = this.arena.roster().lock();
        // SAFETY: the cache is pinned and unlinks itself before it is
        // dropped.
        unsafe { roster.link(NonNull::from(&this.stats)) };
        this.associated = true;
        log::trace!("tcache associated with arena {}", this.arena.ind());
    }

    /// Take the cache off its arena's roster, folding its request counters
    /// into the arena's bins.
    pub fn dissociate(self: Pin<&mut Self>) {
        self.inner().dissociate_inner();
    }

    fn dissociate_inner(&mut self) {
        if !self.associated {
            return;
        }
        let arena = self.arena;
        let mut roster = arena.roster().lock();
        // SAFETY: linked by `associate`.
        unsafe { roster.unlink(NonNull::from(&self.stats)) };
        for class in 1..NUM_SIZE_CLASSES {
            let n = self.stats.take_nrequests(class);
            if n != 0 {
                arena.bin(class).lock().stats.nrequests += n;
            }
        }
        drop(roster);
        self.associated = false;
        log::trace!("tcache dissociated from arena {}", arena.ind());
    }

    /// Move the cache to `arena`. Counters gathered so far stay with the old
    /// arena.
    pub fn reassociate(mut self: Pin<&mut Self>, arena: &'a M::Arena) {
        self.as_mut().dissociate();
        self.as_mut().inner().arena = arena;
        self.associate();
    }

    /// Pop an object of `class`, refilling from the bound arena on a miss.
    /// `None` if the arena has nothing to give.
    pub fn allocate(self: Pin<&mut Self>, class: usize) -> Option<NonNull<u8>> {
        debug_assert!(class != 0 && class < NUM_SIZE_CLASSES);
        let this = self.inner();

        let ptr = match this.pop(class) {
            Some(ptr) => ptr,
            None => {
                this.fill(class);
                this.pop(class)?
            }
        };

        this.stats.add_request(class);
        #[cfg(feature = "prof")]
        {
            this.prof_accumbytes += crate::size_class::class_to_size(class) as u64;
        }
        this.tick();
        Some(ptr)
    }

    /// Push `ptr` onto `class`'s stack, first flushing half of it if full.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live object of `class` from an arena of the map this
    /// cache was built with, and must not be used afterwards.
    pub unsafe fn deallocate(self: Pin<&mut Self>, class: usize, ptr: NonNull<u8>) {
        debug_assert!(class != 0 && class < NUM_SIZE_CLASSES);
        let this = self.inner();

        let max = ncached_max(class);
        if this.bins[class].ncached == max {
            this.flush(class, max >> 1);
        }
        let n = this.bins[class].ncached;
        this.avail[avail_offset(class) + n] = ptr;
        this.bins[class].ncached = n + 1;

        this.tick();
    }

    /// Return all but `rem` objects of `class` to their arenas. Keeps
    /// `min(rem, ncached)`.
    pub fn flush_bin(self: Pin<&mut Self>, class: usize, rem: usize) {
        let this = self.inner();
        let rem = rem.min(this.bins[class].ncached);
        this.flush(class, rem);
    }

    /// Empty every bin.
    pub fn flush_all(self: Pin<&mut Self>) {
        let this = self.inner();
        for class in 1..NUM_SIZE_CLASSES {
            this.flush(class, 0);
        }
    }

    /// Count one allocation event, running a GC step every `gc_incr`.
    pub fn event(self: Pin<&mut Self>) {
        self.inner().tick();
    }

    /// Examine the next bin in round-robin order.
    pub fn gc_tick(self: Pin<&mut Self>) {
        self.inner().gc();
    }

    fn pop(&mut self, class: usize) -> Option<NonNull<u8>> {
        let bin = &mut self.bins[class];
        if bin.ncached == 0 {
            bin.low_water = -1;
            return None;
        }
        bin.ncached -= 1;
        if (bin.ncached as isize) < bin.low_water {
            bin.low_water = bin.ncached as isize;
        }
        Some(self.avail[avail_offset(class) + bin.ncached])
    }

    /// Refill an empty bin from the bound arena.
    fn fill(&mut self, class: usize) {
        debug_assert_eq!(self.bins[class].ncached, 0);
        let nfill = (ncached_max(class) >> self.bins[class].lg_fill_div).max(1);
        let off = avail_offset(class);
        let arena = self.arena;

        #[cfg(feature = "prof")]
        arena.prof_accum(core::mem::take(&mut self.prof_accumbytes));

        let slots = &mut self.avail[off..off + nfill];
        let mut bin = arena.bin(class).lock();
        let n = arena.fill_locked(&mut bin.runs, class, slots);
        bin.stats.nmalloc += n as u64;
        bin.stats.nrequests += self.stats.take_nrequests(class);
        bin.stats.nfills += 1;
        drop(bin);

        // The first object carved is the first handed out.
        slots[..n].reverse();
        self.bins[class].ncached = n;
        stat_inc!(tcache_fills);
    }

    fn flush(&mut self, class: usize, rem: usize) {
        let ncached = self.bins[class].ncached;
        debug_assert!(rem <= ncached);
        let off = avail_offset(class);
        let map = self.map;
        let mut merged_stats = false;

        let mut nflush = ncached - rem;
        while nflush > 0 {
            // Lock the arena owning the first object; objects of other
            // arenas are deferred to later passes.
            let owner = map.owner(self.avail[off]);
            let current = ptr::eq(owner, self.arena);

            #[cfg(feature = "prof")]
            if current {
                owner.prof_accum(core::mem::take(&mut self.prof_accumbytes));
            }

            let mut bin = owner.bin(class).lock();
            if current {
                debug_assert!(!merged_stats);
                merged_stats = true;
                bin.stats.nflushes += 1;
                bin.stats.nrequests += self.stats.take_nrequests(class);
            }

            let mut ndeferred = 0;
            for i in 0..nflush {
                let ptr = self.avail[off + i];
                if ptr::eq(map.owner(ptr), owner) {
                    owner.dalloc_locked(&mut bin.runs, class, ptr);
                    bin.stats.ndalloc += 1;
                } else {
                    self.avail[off + ndeferred] = ptr;
                    ndeferred += 1;
                }
            }
            drop(bin);

            if ndeferred != 0 {
                log::trace!("tcache flush deferred {} objects of class {}", ndeferred, class);
            }
            nflush = ndeferred;
        }

        if !merged_stats {
            // No object belonged to the bound arena; merge under its lock
            // anyway.
            let mut bin = self.arena.bin(class).lock();
            bin.stats.nflushes += 1;
            bin.stats.nrequests += self.stats.take_nrequests(class);
        }

        self.avail.copy_within(off + ncached - rem..off + ncached, off);
        let bin = &mut self.bins[class];
        bin.ncached = rem;
        if (rem as isize) < bin.low_water {
            bin.low_water = rem as isize;
        }
        if ncached != rem {
            stat_inc!(tcache_flushes);
        }
    }

    fn tick(&mut self) {
        if self.config.gc_incr == 0 {
            return;
        }
        self.ev_cnt += 1;
        if self.ev_cnt >= self.config.gc_incr {
            self.gc();
        }
    }

    fn gc(&mut self) {
        let class = self.next_gc_bin;
        let bin = self.bins[class];

        if bin.low_water > 0 {
            // Flush objects below the low-water mark, keeping a fraction of
            // the cushion.
            let low = bin.low_water as usize;
            let keep = low.checked_shr(self.config.retain_shift).unwrap_or(0);
            self.flush(class, bin.ncached - low + keep);
            if ncached_max(class) >> (bin.lg_fill_div + 1) >= 1 {
                self.bins[class].lg_fill_div += 1;
            }
            log::trace!(
                "tcache gc: class {} shrank to {}, lg_fill_div {}",
                class,
                self.bins[class].ncached,
                self.bins[class].lg_fill_div
            );
        } else if bin.low_water < 0 && bin.lg_fill_div > 1 {
            self.bins[class].lg_fill_div -= 1;
            log::trace!("tcache gc: class {} lg_fill_div {}", class, bin.lg_fill_div - 1);
        }

        let bin = &mut self.bins[class];
        bin.low_water = bin.ncached as isize;
        self.next_gc_bin = if class + 1 == NUM_SIZE_CLASSES { 1 } else { class + 1 };
        self.ev_cnt = 0;
        stat_inc!(tcache_gc_ticks);
    }
}

impl<M: ArenaMap> Drop for Tcache<'_, M> {
    fn drop(&mut self) {
        self.dissociate_inner();
        for class in 1..NUM_SIZE_CLASSES {
            self.flush(class, 0);
            let n = self.stats.take_nrequests(class);
            if n != 0 {
                self.arena.bin(class).lock().stats.nrequests += n;
            }
        }
        #[cfg(feature = "prof")]
        if self.prof_accumbytes > 0 {
            self.arena.prof_accum(self.prof_accumbytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{ArenaBin, TcacheRoster};
    use crate::size_class::class_to_size;
    use crate::sync::SpinMutex;
    use alloc::boxed::Box;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicU64, Ordering};

    const REGION: usize = 1 << 20;

    /// An arena handing out slices of one private region, never reusing
    /// them.
    struct BumpArena {
        ind: usize,
        region: Box<[u64]>,
        bins: Vec<SpinMutex<ArenaBin<BumpRuns>>>,
        roster: SpinMutex<TcacheRoster>,
        /// Bytes handed over for profiling.
        prof: AtomicU64,
    }

    #[derive(Default)]
    struct BumpRuns {
        next: usize,
        freed: Vec<usize>,
        /// Objects left before the bin reports exhaustion.
        budget: usize,
    }

    impl BumpArena {
        fn new(ind: usize) -> Self {
            let bins = (0..NUM_SIZE_CLASSES)
                .map(|_| SpinMutex::new(ArenaBin::new(BumpRuns { budget: usize::MAX, ..Default::default() })))
                .collect();
            Self {
                ind,
                region: alloc::vec![0u64; REGION / 8].into_boxed_slice(),
                bins,
                roster: SpinMutex::new(TcacheRoster::new()),
                prof: AtomicU64::new(0),
            }
        }

        fn base(&self) -> usize {
            self.region.as_ptr() as usize
        }

        fn owns(&self, ptr: NonNull<u8>) -> bool {
            let p = ptr.as_ptr() as usize;
            p >= self.base() && p < self.base() + REGION
        }
    }

    impl Arena for BumpArena {
        type Runs = BumpRuns;

        fn ind(&self) -> usize {
            self.ind
        }

        fn bin(&self, class: usize) -> &SpinMutex<ArenaBin<BumpRuns>> {
            &self.bins[class]
        }

        fn roster(&self) -> &SpinMutex<TcacheRoster> {
            &self.roster
        }

        fn fill_locked(&self, runs: &mut BumpRuns, class: usize, out: &mut [NonNull<u8>]) -> usize {
            // Each class gets its own stripe of the region.
            let stripe = REGION / NUM_SIZE_CLASSES;
            let size = class_to_size(class);
            let mut n = 0;
            while n < out.len() && runs.budget > 0 && (runs.next + 1) * size <= stripe {
                let p = self.base() + class * stripe + runs.next * size;
                out[n] = NonNull::new(p as *mut u8).unwrap();
                runs.next += 1;
                runs.budget -= 1;
                n += 1;
            }
            n
        }

        fn dalloc_locked(&self, runs: &mut BumpRuns, _class: usize, ptr: NonNull<u8>) {
            assert!(self.owns(ptr), "object returned to the wrong arena");
            runs.freed.push(ptr.as_ptr() as usize);
        }

        fn prof_accum(&self, bytes: u64) {
            self.prof.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    struct Pair {
        arenas: [BumpArena; 2],
    }

    impl ArenaMap for Pair {
        type Arena = BumpArena;

        fn owner(&self, ptr: NonNull<u8>) -> &BumpArena {
            if self.arenas[0].owns(ptr) { &self.arenas[0] } else { &self.arenas[1] }
        }
    }

    fn pair() -> Box<Pair> {
        Box::new(Pair { arenas: [BumpArena::new(0), BumpArena::new(1)] })
    }

    /// One GC look at every bin.
    fn sweep<M: ArenaMap>(tc: &mut Pin<Box<Tcache<'_, M>>>) {
        for _ in 1..NUM_SIZE_CLASSES {
            tc.as_mut().gc_tick();
        }
    }

    fn no_gc() -> TcacheConfig {
        TcacheConfig { gc_incr: 0, ..TcacheConfig::default() }
    }

    /// Class with the largest cache, so halving still leaves room.
    fn roomy_class() -> usize {
        (1..NUM_SIZE_CLASSES).max_by_key(|&c| ncached_max(c)).unwrap()
    }

    #[test]
    fn test_allocate_then_free_is_lifo() {
        let map = pair();
        let a = &map.arenas[0];
        let mut tc = Box::pin(Tcache::new(&*map, a, no_gc()));
        tc.as_mut().associate();
        let class = roomy_class();

        let p = tc.as_mut().allocate(class).unwrap();
        let fill = (ncached_max(class) >> 1).max(1);
        assert_eq!(tc.bin(class).ncached(), fill - 1);
        assert_eq!(tc.bin(class).low_water(), -1);
        assert_eq!(a.bin(class).lock().stats.nfills, 1);
        // Lowest address first.
        assert_eq!(p.as_ptr() as usize, a.base() + class * (REGION / NUM_SIZE_CLASSES));

        unsafe { tc.as_mut().deallocate(class, p) };
        assert_eq!(tc.as_mut().allocate(class), Some(p));
        assert_eq!(tc.nrequests(class), 2);
    }

    #[test]
    fn test_exhausted_arena_returns_none() {
        let map = pair();
        let a = &map.arenas[0];
        let class = roomy_class();
        a.bin(class).lock().runs.budget = 1;

        let mut tc = Box::pin(Tcache::new(&*map, a, no_gc()));
        tc.as_mut().associate();
        assert!(tc.as_mut().allocate(class).is_some());
        assert!(tc.as_mut().allocate(class).is_none());
        // The failed refill already moved the pending count into the bin.
        assert_eq!(tc.nrequests(class), 0);
        assert_eq!(a.bin(class).lock().stats.nrequests, 1);
    }

    #[cfg(feature = "prof")]
    #[test]
    fn test_prof_bytes_reach_the_arena() {
        let map = pair();
        let a = &map.arenas[0];
        let class = roomy_class();
        let size = class_to_size(class) as u64;
        let fill = (ncached_max(class) >> 1).max(1);
        let mut tc = Box::pin(Tcache::new(&*map, a, no_gc()));
        tc.as_mut().associate();

        tc.as_mut().allocate(class).unwrap();
        assert_eq!(a.prof.load(Ordering::Relaxed), 0);
        assert_eq!(tc.prof_accumbytes(), size);

        tc.as_mut().flush_bin(class, 0);
        assert_eq!(a.prof.load(Ordering::Relaxed), size);
        assert_eq!(tc.prof_accumbytes(), 0);

        // Drain one full refill, then miss once more.
        for _ in 0..fill {
            tc.as_mut().allocate(class).unwrap();
        }
        assert_eq!(tc.prof_accumbytes(), fill as u64 * size);
        tc.as_mut().allocate(class).unwrap();
        assert_eq!(a.prof.load(Ordering::Relaxed), size + fill as u64 * size);
        assert_eq!(tc.prof_accumbytes(), size);

        drop(tc);
        assert_eq!(a.prof.load(Ordering::Relaxed), 2 * size + fill as u64 * size);
    }

    #[test]
    fn test_full_bin_flushes_half() {
        let map = pair();
        let a = &map.arenas[0];
        let class = roomy_class();
        let max = ncached_max(class);
        let mut tc = Box::pin(Tcache::new(&*map, a, no_gc()));
        tc.as_mut().associate();

        let held: Vec<_> = (0..max + 1).map(|_| tc.as_mut().allocate(class).unwrap()).collect();
        tc.as_mut().flush_bin(class, 0);
        for &p in &held[..max] {
            unsafe { tc.as_mut().deallocate(class, p) };
        }
        assert_eq!(tc.bin(class).ncached(), max);

        let freed_before = a.bin(class).lock().runs.freed.len();
        unsafe { tc.as_mut().deallocate(class, held[max]) };
        assert_eq!(tc.bin(class).ncached(), (max >> 1) + 1);
        assert_eq!(a.bin(class).lock().runs.freed.len() - freed_before, max - (max >> 1));
        // The oldest entries left; the newest stayed.
        let kept = tc.cached(class);
        assert_eq!(&kept[..max >> 1], &held[max - (max >> 1)..max]);
        assert_eq!(kept[max >> 1], held[max]);
    }

    #[test]
    fn test_flush_bin_keeps_min_of_rem_and_ncached() {
        let map = pair();
        let a = &map.arenas[0];
        let class = roomy_class();
        let mut tc = Box::pin(Tcache::new(&*map, a, no_gc()));
        tc.as_mut().associate();

        let ptrs: Vec<_> = (0..6).map(|_| tc.as_mut().allocate(class).unwrap()).collect();
        tc.as_mut().flush_bin(class, 0);
        for &p in &ptrs {
            unsafe { tc.as_mut().deallocate(class, p) };
        }
        tc.as_mut().flush_bin(class, 10);
        assert_eq!(tc.bin(class).ncached(), 6);
        tc.as_mut().flush_bin(class, 2);
        assert_eq!(tc.bin(class).ncached(), 2);
        assert_eq!(tc.cached(class), &ptrs[4..]);
        tc.as_mut().flush_bin(class, 0);
        assert_eq!(tc.bin(class).ncached(), 0);
    }

    #[test]
    fn test_flush_routes_to_owner() {
        let map = pair();
        let (a, b) = (&map.arenas[0], &map.arenas[1]);
        let class = roomy_class();
        let mut tc = Box::pin(Tcache::new(&*map, a, no_gc()));
        tc.as_mut().associate();

        let from_a = tc.as_mut().allocate(class).unwrap();
        tc.as_mut().flush_bin(class, 0);
        tc.as_mut().reassociate(b);
        let from_b = tc.as_mut().allocate(class).unwrap();
        tc.as_mut().flush_bin(class, 0);

        unsafe {
            tc.as_mut().deallocate(class, from_a);
            tc.as_mut().deallocate(class, from_b);
        }
        let a_before = a.bin(class).lock().runs.freed.len();
        let b_before = b.bin(class).lock().runs.freed.len();
        tc.as_mut().flush_bin(class, 0);
        assert_eq!(a.bin(class).lock().runs.freed.len(), a_before + 1);
        assert_eq!(b.bin(class).lock().runs.freed.len(), b_before + 1);
        assert!(a.bin(class).lock().runs.freed.contains(&(from_a.as_ptr() as usize)));
        // Only the bound arena counted the flush.
        assert_eq!(b.bin(class).lock().stats.nflushes, 2);
    }

    #[test]
    fn test_gc_shrinks_idle_bin() {
        let map = pair();
        let a = &map.arenas[0];
        let class = roomy_class();
        let mut tc = Box::pin(Tcache::new(&*map, a, no_gc()));
        tc.as_mut().associate();

        let ptrs: Vec<_> = (0..8).map(|_| tc.as_mut().allocate(class).unwrap()).collect();
        tc.as_mut().flush_bin(class, 0);
        for &p in &ptrs {
            unsafe { tc.as_mut().deallocate(class, p) };
        }

        let lg = tc.bin(class).lg_fill_div();
        // The bin ran dry before it was refilled, so no shrinking yet.
        sweep(&mut tc);
        assert_eq!(tc.bin(class).ncached(), 8);
        assert_eq!(tc.bin(class).low_water(), 8);

        sweep(&mut tc);
        assert_eq!(tc.bin(class).ncached(), 2);
        assert_eq!(tc.bin(class).lg_fill_div(), lg + 1);
        assert_eq!(tc.bin(class).low_water(), 2);
    }

    #[test]
    fn test_gc_grows_busy_bin() {
        let map = pair();
        let a = &map.arenas[0];
        let class = roomy_class();
        let mut tc = Box::pin(Tcache::new(&*map, a, no_gc()));
        tc.as_mut().associate();
        tc.as_mut().inner().bins[class].lg_fill_div = 3;

        for expect in [2, 1, 1] {
            // Run the bin dry so it reads as busy.
            tc.as_mut().flush_bin(class, 0);
            assert!(tc.as_mut().allocate(class).is_some());
            assert_eq!(tc.bin(class).low_water(), -1);
            sweep(&mut tc);
            assert_eq!(tc.bin(class).lg_fill_div(), expect);
        }
    }

    #[test]
    fn test_events_drive_gc() {
        let map = pair();
        let a = &map.arenas[0];
        let class = roomy_class();
        let config = TcacheConfig { gc_incr: 4, ..TcacheConfig::default() };
        let mut tc = Box::pin(Tcache::new(&*map, a, config));
        tc.as_mut().associate();

        for _ in 0..3 {
            tc.as_mut().event();
        }
        assert_eq!(tc.next_gc_bin, 1);
        tc.as_mut().allocate(class).unwrap();
        assert_eq!(tc.next_gc_bin, 2);
        assert_eq!(tc.ev_cnt, 0);
    }

    #[test]
    fn test_drop_returns_everything_and_merges() {
        let map = pair();
        let a = &map.arenas[0];
        let class = roomy_class();
        {
            let mut tc = Box::pin(Tcache::new(&*map, a, no_gc()));
            tc.as_mut().associate();
            assert_eq!(a.roster().lock().len(), 1);
            for _ in 0..5 {
                tc.as_mut().allocate(class).unwrap();
            }
        }
        assert!(a.roster().lock().is_empty());
        let bin = a.bin(class).lock();
        assert_eq!(bin.stats.nrequests, 5);
        assert_eq!(bin.runs.freed.len() as u64, bin.stats.nmalloc - 5);
    }
}
