//! Chunk registry: a 3-level radix tree marking which chunk-aligned
//! addresses belong to live chunks, plus the live/high-water/total chunk
//! counters.
//!
//! Keys are chunk indices (`addr >> lg_chunk`). With 12 bits per level the
//! tree covers 36 bits of chunk index, i.e. every 48-bit address for any
//! supported chunk size. The root is inline (32 KiB); mid and leaf nodes are
//! allocated lazily from base memory and never freed. Reads are lock-free
//! (Acquire loads); writes happen under the registry lock, which also guards
//! the counters.

use crate::error::RegistryError;
use crate::sync::SpinMutex;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

const ROOT_BITS: usize = 12;
const MID_BITS: usize = 12;
const LEAF_BITS: usize = 12;

const ROOT_LEN: usize = 1 << ROOT_BITS;
const MID_LEN: usize = 1 << MID_BITS;
const LEAF_LEN: usize = 1 << LEAF_BITS;

const MID_SHIFT: usize = LEAF_BITS;
const ROOT_SHIFT: usize = LEAF_BITS + MID_BITS;

const MID_MASK: usize = (1 << MID_BITS) - 1;
const LEAF_MASK: usize = (1 << LEAF_BITS) - 1;

#[repr(C)]
struct MidNode {
    children: [AtomicPtr<LeafNode>; MID_LEN],
}

#[repr(C)]
struct LeafNode {
    live: [AtomicBool; LEAF_LEN],
}

/// Live chunk accounting, in chunks.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct ChunkStats {
    /// Chunks currently registered.
    pub current: usize,
    /// Highest `current` ever observed.
    pub high: usize,
    /// Chunks ever registered.
    pub total: u64,
}

/// Helper to create a const-initialized array of null AtomicPtrs.
/// We use a macro since const generics with AtomicPtr arrays require this.
macro_rules! null_atomic_array {
    ($len:expr, $T:ty) => {{
        // SAFETY: AtomicPtr<T>::new(null_mut()) is just a null pointer,
        // which has the same bit pattern as zeroed memory.
        unsafe { core::mem::transmute::<[usize; $len], [AtomicPtr<$T>; $len]>([0usize; $len]) }
    }};
}

pub struct ChunkRegistry {
    root: [AtomicPtr<MidNode>; ROOT_LEN],
    lg_chunk: u32,
    stats: SpinMutex<ChunkStats>,
}

// AtomicPtr is Send+Sync; nodes are only written under `stats`' lock.
unsafe impl Send for ChunkRegistry {}
unsafe impl Sync for ChunkRegistry {}

impl ChunkRegistry {
    pub const fn new(lg_chunk: u32) -> Self {
        Self {
            root: null_atomic_array!(ROOT_LEN, MidNode),
            lg_chunk,
            stats: SpinMutex::new(ChunkStats {
                current: 0,
                high: 0,
                total: 0,
            }),
        }
    }

    #[inline]
    fn split(key: usize) -> (usize, usize, usize) {
        (key >> ROOT_SHIFT, (key >> MID_SHIFT) & MID_MASK, key & LEAF_MASK)
    }

    /// Whether `addr` lies in a registered chunk. Lock-free.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let (root_idx, mid_idx, leaf_idx) = Self::split(addr >> self.lg_chunk);
        if root_idx >= ROOT_LEN {
            return false;
        }

        let mid = self.root[root_idx].load(Ordering::Acquire);
        if mid.is_null() {
            return false;
        }

        let leaf = unsafe { (*mid).children[mid_idx].load(Ordering::Acquire) };
        if leaf.is_null() {
            return false;
        }

        unsafe { (*leaf).live[leaf_idx].load(Ordering::Acquire) }
    }

    /// Mark every chunk of `[addr, addr + size)` live. On failure nothing is
    /// left marked. Returns `true` if the high-water mark rose.
    ///
    /// `alloc_node(bytes)` must return zeroed memory.
    pub fn register(
        &self,
        addr: usize,
        size: usize,
        mut alloc_node: impl FnMut(usize) -> Option<NonNull<u8>>,
    ) -> Result<bool, RegistryError> {
        let first = addr >> self.lg_chunk;
        let n = size >> self.lg_chunk;
        debug_assert!(n > 0 && addr & ((1 << self.lg_chunk) - 1) == 0);

        let mut stats = self.stats.lock();
        for i in 0..n {
            if let Err(e) = self.set(first + i, true, &mut alloc_node) {
                for j in 0..i {
                    // Nodes exist for every key already set.
                    let _ = self.set(first + j, false, &mut alloc_node);
                }
                return Err(e);
            }
        }

        stats.current += n;
        stats.total += n as u64;
        if stats.current > stats.high {
            stats.high = stats.current;
            return Ok(true);
        }
        Ok(false)
    }

    /// Clear every chunk of `[addr, addr + size)`.
    pub fn deregister(&self, addr: usize, size: usize) {
        let first = addr >> self.lg_chunk;
        let n = size >> self.lg_chunk;

        let mut stats = self.stats.lock();
        for i in 0..n {
            // Clearing never allocates: the leaf exists if the key was set,
            // and a missing leaf is already "not live".
            let _ = self.set(first + i, false, &mut |_| None);
        }
        debug_assert!(stats.current >= n);
        stats.current -= n;
    }

    pub fn stats(&self) -> ChunkStats {
        *self.stats.lock()
    }

    fn set(
        &self,
        key: usize,
        live: bool,
        alloc_node: &mut impl FnMut(usize) -> Option<NonNull<u8>>,
    ) -> Result<(), RegistryError> {
        let (root_idx, mid_idx, leaf_idx) = Self::split(key);
        if root_idx >= ROOT_LEN {
            return Err(RegistryError::OutOfRange(key << self.lg_chunk));
        }

        // Ensure mid node exists
        let mut mid = self.root[root_idx].load(Ordering::Acquire);
        if mid.is_null() {
            if !live {
                return Ok(());
            }
            mid = alloc_node(core::mem::size_of::<MidNode>())
                .ok_or(RegistryError::NodeExhausted)?
                .as_ptr()
                .cast::<MidNode>();
            // Store with Release so readers see the initialized node
            self.root[root_idx].store(mid, Ordering::Release);
        }

        // Ensure leaf node exists
        let mut leaf = unsafe { (*mid).children[mid_idx].load(Ordering::Acquire) };
        if leaf.is_null() {
            if !live {
                return Ok(());
            }
            leaf = alloc_node(core::mem::size_of::<LeafNode>())
                .ok_or(RegistryError::NodeExhausted)?
                .as_ptr()
                .cast::<LeafNode>();
            unsafe { (*mid).children[mid_idx].store(leaf, Ordering::Release) };
        }

        unsafe { (*leaf).live[leaf_idx].store(live, Ordering::Release) };
        Ok(())
    }

    pub(crate) fn prefork(&self) {
        self.stats.force_lock();
    }

    pub(crate) fn postfork(&self) {
        unsafe { self.stats.force_unlock() };
    }
}
