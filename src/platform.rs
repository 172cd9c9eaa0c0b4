//! OS memory sources for the chunk layer.
//!
//! [`ChunkSource`] is the collaborator the chunk allocator draws raw memory
//! from: dss growth (`sbrk`), anonymous mappings, page purging and
//! unmapping. [`System`] implements it on top of the platform primitives
//! (mmap/madvise/sbrk on Unix). Under Miri, uses std::alloc as a backing
//! store instead.

use crate::sync::SpinMutex;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

cfg_if::cfg_if! {
    if #[cfg(miri)] {
        mod miri;
        use miri as sys;
    } else if #[cfg(unix)] {
        mod unix;
        use unix as sys;
    } else {
        compile_error!("chunkcache supports Unix targets and Miri only");
    }
}

/// Memory added to the dss by one [`ChunkSource::grow_heap`] call.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HeapGrowth {
    /// Start of the requested, aligned range.
    pub addr: NonNull<u8>,
    /// Bytes of new heap just below `addr`, skipped to reach alignment.
    pub pad: usize,
}

/// Raw memory provider for the chunk layer.
///
/// Every size and alignment passed in is a multiple of the chunk size and
/// alignments are powers of two.
pub trait ChunkSource: Sync {
    /// Grow the dss by `size` bytes at an `align`-aligned address. `None`
    /// when the heap cannot grow (unsupported, exhausted or out of range).
    /// The alignment gap, if any, belongs to the caller too.
    fn grow_heap(&self, size: usize, align: usize) -> Option<HeapGrowth>;

    /// Map fresh, zeroed anonymous memory aligned to `align`. Never overlaps
    /// a live chunk.
    fn map_anonymous(&self, size: usize, align: usize) -> Option<NonNull<u8>>;

    /// Release the physical pages behind a range while keeping the address
    /// space. Returns `true` if the range now reads as zero.
    ///
    /// # Safety
    ///
    /// The range must be owned by the caller and not in use.
    unsafe fn purge(&self, addr: NonNull<u8>, size: usize) -> bool;

    /// Return an anonymous mapping (or part of one) to the OS.
    ///
    /// # Safety
    ///
    /// The range must have come from `map_anonymous` and not be in use.
    unsafe fn unmap(&self, addr: NonNull<u8>, size: usize);

    /// Whether `grow_heap` can ever succeed.
    fn dss_supported(&self) -> bool;

    /// Whether `addr` lies in memory obtained through `grow_heap`.
    fn in_dss(&self, addr: usize) -> bool;

    fn prefork(&self) {}
    fn postfork_parent(&self) {}
    fn postfork_child(&self) {}
}

/// The host operating system.
pub struct System {
    /// Serializes break movement.
    dss_lock: SpinMutex<()>,
    /// First break observed, 0 until the first growth.
    dss_base: AtomicUsize,
    /// Current break as last observed by this source.
    dss_max: AtomicUsize,
}

impl Default for System {
    fn default() -> Self {
        Self::new()
    }
}

impl System {
    pub const fn new() -> Self {
        Self {
            dss_lock: SpinMutex::new(()),
            dss_base: AtomicUsize::new(0),
            dss_max: AtomicUsize::new(0),
        }
    }
}

impl ChunkSource for System {
    fn grow_heap(&self, size: usize, align: usize) -> Option<HeapGrowth> {
        if !sys::DSS_SUPPORTED {
            return None;
        }
        let _guard = self.dss_lock.lock();
        loop {
            // Someone else may have moved the break since we last looked.
            let cur = sys::dss_current()?;
            if self.dss_base.load(Ordering::Relaxed) == 0 {
                self.dss_base.store(cur, Ordering::Relaxed);
            }
            self.dss_max.store(cur, Ordering::Release);

            let start = cur.checked_next_multiple_of(align)?;
            let incr = (start - cur).checked_add(size)?;
            // Refuse to wrap the address space.
            cur.checked_add(incr)?;

            let prev = sys::dss_extend(incr)?;
            if prev == cur {
                self.dss_max.store(cur + incr, Ordering::Release);
                log::trace!("dss grew by {:#x} at {:#x}", incr, start);
                let addr = NonNull::new(start as *mut u8)?;
                return Some(HeapGrowth { addr, pad: start - cur });
            }
            // Lost a race with a foreign sbrk caller; the break moved
            // underneath us, so retry from the new value.
            log::debug!("dss raced: expected break {:#x}, found {:#x}", cur, prev);
        }
    }

    fn map_anonymous(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        NonNull::new(unsafe { sys::chunk_map(size, align) })
    }

    unsafe fn purge(&self, addr: NonNull<u8>, size: usize) -> bool {
        unsafe { sys::pages_purge(addr.as_ptr(), size) }
    }

    unsafe fn unmap(&self, addr: NonNull<u8>, size: usize) {
        unsafe { sys::pages_unmap(addr.as_ptr(), size) };
    }

    fn dss_supported(&self) -> bool {
        sys::DSS_SUPPORTED
    }

    fn in_dss(&self, addr: usize) -> bool {
        let base = self.dss_base.load(Ordering::Relaxed);
        base != 0 && addr >= base && addr < self.dss_max.load(Ordering::Acquire)
    }

    fn prefork(&self) {
        self.dss_lock.force_lock();
    }

    fn postfork_parent(&self) {
        unsafe { self.dss_lock.force_unlock() };
    }

    fn postfork_child(&self) {
        unsafe { self.dss_lock.force_unlock() };
    }
}
