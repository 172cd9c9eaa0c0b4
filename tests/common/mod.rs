//! Shared fixtures: an OS stand-in carved out of one real reservation, and a
//! minimal arena layer on top of `ChunkManager` for thread-cache tests.

#![allow(dead_code)]

use chunkcache::arena::{Arena, ArenaBin, ArenaMap, TcacheRoster};
use chunkcache::size_class::{NUM_SIZE_CLASSES, class_to_size};
use chunkcache::sync::SpinMutex;
use chunkcache::{ChunkConfig, ChunkManager, ChunkSource, DssPrec, HeapGrowth, System};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const LG_CHUNK: u32 = chunkcache::config::LG_CHUNK_MIN;
pub const CHUNK: usize = 1 << LG_CHUNK;

/// One reserved region split in two: the low half grows like a data segment,
/// the high half serves "anonymous mappings" bump-style. Failures can be
/// switched on per source.
pub struct FakeOs {
    lo: usize,
    mid: usize,
    hi: usize,
    dss_supported: bool,
    brk: Mutex<usize>,
    map_next: Mutex<usize>,
    pub fail_dss: AtomicBool,
    pub fail_mmap: AtomicBool,
    /// Mappings left before `map_anonymous` starts failing.
    pub map_budget: AtomicUsize,
    /// `purge` leaves contents alone and reports them dirty.
    pub dirty_purge: AtomicBool,
    pub grows: AtomicUsize,
    pub maps: AtomicUsize,
    pub unmapped: AtomicUsize,
    pub preforks: AtomicUsize,
}

impl FakeOs {
    pub fn new(nchunks: usize) -> Self {
        Self::with_dss(nchunks, true)
    }

    pub fn with_dss(nchunks: usize, dss_supported: bool) -> Self {
        let size = nchunks * CHUNK;
        let lo = System::new()
            .map_anonymous(size, CHUNK)
            .expect("reserve fake address space")
            .as_ptr() as usize;
        let mid = lo + size / 2;
        Self {
            lo,
            mid,
            hi: lo + size,
            dss_supported,
            brk: Mutex::new(lo),
            map_next: Mutex::new(mid),
            fail_dss: AtomicBool::new(false),
            fail_mmap: AtomicBool::new(false),
            map_budget: AtomicUsize::new(usize::MAX),
            dirty_purge: AtomicBool::new(false),
            grows: AtomicUsize::new(0),
            maps: AtomicUsize::new(0),
            unmapped: AtomicUsize::new(0),
            preforks: AtomicUsize::new(0),
        }
    }

    /// Current top of the fake data segment.
    pub fn brk(&self) -> usize {
        *self.brk.lock().unwrap()
    }

    pub fn in_mmap(&self, addr: usize) -> bool {
        addr >= self.mid && addr < self.hi
    }
}

impl Drop for FakeOs {
    fn drop(&mut self) {
        let lo = NonNull::new(self.lo as *mut u8).unwrap();
        unsafe { System::new().unmap(lo, self.hi - self.lo) };
    }
}

impl ChunkSource for FakeOs {
    fn grow_heap(&self, size: usize, align: usize) -> Option<HeapGrowth> {
        if !self.dss_supported || self.fail_dss.load(Ordering::Relaxed) {
            return None;
        }
        let mut brk = self.brk.lock().unwrap();
        let start = brk.next_multiple_of(align);
        if start + size > self.mid {
            return None;
        }
        let pad = start - *brk;
        *brk = start + size;
        self.grows.fetch_add(1, Ordering::Relaxed);
        Some(HeapGrowth { addr: NonNull::new(start as *mut u8)?, pad })
    }

    fn map_anonymous(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if self.fail_mmap.load(Ordering::Relaxed) {
            return None;
        }
        if self
            .map_budget
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |b| b.checked_sub(1))
            .is_err()
        {
            return None;
        }
        let mut next = self.map_next.lock().unwrap();
        let start = next.next_multiple_of(align);
        if start + size > self.hi {
            return None;
        }
        *next = start + size;
        self.maps.fetch_add(1, Ordering::Relaxed);
        NonNull::new(start as *mut u8)
    }

    unsafe fn purge(&self, addr: NonNull<u8>, size: usize) -> bool {
        if self.dirty_purge.load(Ordering::Relaxed) {
            return false;
        }
        unsafe { addr.as_ptr().write_bytes(0, size) };
        true
    }

    unsafe fn unmap(&self, _addr: NonNull<u8>, size: usize) {
        // Bump space is never handed out twice, so this is bookkeeping only.
        self.unmapped.fetch_add(size, Ordering::Relaxed);
    }

    fn dss_supported(&self) -> bool {
        self.dss_supported
    }

    fn in_dss(&self, addr: usize) -> bool {
        addr >= self.lo && addr < self.mid
    }

    fn prefork(&self) {
        self.preforks.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn config(dss: DssPrec) -> ChunkConfig {
    ChunkConfig {
        lg_chunk: LG_CHUNK,
        dss,
        ..ChunkConfig::default()
    }
}

pub fn manager(dss: DssPrec, nchunks: usize) -> Box<ChunkManager<FakeOs>> {
    Box::new(ChunkManager::boot(config(dss), FakeOs::new(nchunks)).unwrap())
}

/// Address-ordered free extents of one space, as `(addr, size)`.
pub fn extents<S: ChunkSource>(m: &ChunkManager<S>, space: chunkcache::Space) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    m.for_each_extent(space, |e| out.push((e.addr, e.size)));
    out
}

/// Panics if any two extents overlap or touch (touching ones should have
/// been merged).
pub fn assert_disjoint(list: &[(usize, usize)]) {
    for w in list.windows(2) {
        let (a, asize) = w[0];
        let (b, _) = w[1];
        assert!(a + asize < b, "extents {:#x}+{:#x} and {:#x} overlap or touch", a, asize, b);
    }
}

/// Fill a buffer with a deterministic pattern derived from its address and size.
pub fn fill_pattern(ptr: *mut u8, size: usize) {
    let seed = ptr as usize ^ size;
    for i in 0..size {
        unsafe {
            *ptr.add(i) = ((seed.wrapping_add(i).wrapping_mul(0x9E37_79B9)) & 0xFF) as u8;
        }
    }
}

/// Verify the fill pattern. Returns true if intact.
pub fn check_pattern(ptr: *mut u8, size: usize) -> bool {
    let seed = ptr as usize ^ size;
    (0..size).all(|i| {
        let expected = ((seed.wrapping_add(i).wrapping_mul(0x9E37_79B9)) & 0xFF) as u8;
        unsafe { *ptr.add(i) == expected }
    })
}

// ---- Arena layer ----

/// State shared by every test arena: the chunk layer and the chunk → arena
/// table.
pub struct Heap {
    pub chunks: Box<ChunkManager<FakeOs>>,
    owners: Mutex<HashMap<usize, usize>>,
}

/// Objects of one class: a free list plus the unused tail of the newest
/// chunk.
#[derive(Default)]
pub struct Runs {
    pub free: Vec<NonNull<u8>>,
    next: usize,
    end: usize,
    pub live: usize,
}

pub struct TestArena {
    ind: usize,
    heap: Arc<Heap>,
    bins: Vec<SpinMutex<ArenaBin<Runs>>>,
    roster: SpinMutex<TcacheRoster>,
}

// SAFETY: `Runs` holds raw object pointers that are only touched under the
// bin lock.
unsafe impl Send for Runs {}

impl TestArena {
    fn new(ind: usize, heap: Arc<Heap>) -> Self {
        Self {
            ind,
            heap,
            bins: (0..NUM_SIZE_CLASSES)
                .map(|_| SpinMutex::new(ArenaBin::new(Runs::default())))
                .collect(),
            roster: SpinMutex::new(TcacheRoster::new()),
        }
    }

    /// Direct allocation, bypassing any cache.
    pub fn alloc_direct(&self, class: usize) -> Option<NonNull<u8>> {
        let mut bin = self.bins[class].lock();
        let mut out = [NonNull::dangling()];
        let n = self.fill_locked(&mut bin.runs, class, &mut out);
        bin.stats.nrequests += 1;
        bin.stats.nmalloc += n as u64;
        (n == 1).then_some(out[0])
    }

    pub fn nrequests(&self, class: usize) -> u64 {
        self.bins[class].lock().stats.nrequests
    }
}

impl Arena for TestArena {
    type Runs = Runs;

    fn ind(&self) -> usize {
        self.ind
    }

    fn bin(&self, class: usize) -> &SpinMutex<ArenaBin<Runs>> {
        &self.bins[class]
    }

    fn roster(&self) -> &SpinMutex<TcacheRoster> {
        &self.roster
    }

    fn fill_locked(&self, runs: &mut Runs, class: usize, out: &mut [NonNull<u8>]) -> usize {
        let size = class_to_size(class);
        let mut n = 0;
        while n < out.len() {
            if let Some(p) = runs.free.pop() {
                out[n] = p;
            } else {
                if runs.next + size > runs.end {
                    let chunks = &self.heap.chunks;
                    let Some(c) = chunks.alloc(None, CHUNK, CHUNK, false) else {
                        break;
                    };
                    let addr = c.addr.as_ptr() as usize;
                    self.heap.owners.lock().unwrap().insert(addr, self.ind);
                    runs.next = addr;
                    runs.end = addr + CHUNK;
                }
                out[n] = NonNull::new(runs.next as *mut u8).unwrap();
                runs.next += size;
            }
            n += 1;
        }
        runs.live += n;
        n
    }

    fn dalloc_locked(&self, runs: &mut Runs, _class: usize, ptr: NonNull<u8>) {
        let chunk = ptr.as_ptr() as usize & !(CHUNK - 1);
        assert_eq!(
            self.heap.owners.lock().unwrap().get(&chunk),
            Some(&self.ind),
            "object {:p} returned to arena {}",
            ptr,
            self.ind
        );
        runs.live -= 1;
        runs.free.push(ptr);
    }
}

pub struct Arenas {
    pub heap: Arc<Heap>,
    pub arenas: Vec<TestArena>,
}

impl Arenas {
    pub fn new(narenas: usize) -> Self {
        let heap = Arc::new(Heap {
            chunks: manager(DssPrec::Disabled, 1024),
            owners: Mutex::new(HashMap::new()),
        });
        let arenas = (0..narenas).map(|i| TestArena::new(i, heap.clone())).collect();
        Self { heap, arenas }
    }

    /// Requests recorded by every arena bin of `class`.
    pub fn bin_nrequests(&self, class: usize) -> u64 {
        self.arenas.iter().map(|a| a.nrequests(class)).sum()
    }
}

impl ArenaMap for Arenas {
    type Arena = TestArena;

    fn owner(&self, ptr: NonNull<u8>) -> &TestArena {
        let chunk = ptr.as_ptr() as usize & !(CHUNK - 1);
        let ind = *self
            .owners()
            .get(&chunk)
            .unwrap_or_else(|| panic!("{:p} is not an arena object", ptr));
        &self.arenas[ind]
    }
}

impl Arenas {
    fn owners(&self) -> std::sync::MutexGuard<'_, HashMap<usize, usize>> {
        self.heap.owners.lock().unwrap()
    }
}
