//! Metadata allocator: bump allocation over chunks that bypass recycling
//! and registration.
//!
//! Radix-tree nodes and extent-node slabs come from here so the chunk layer
//! never depends on the allocator it implements. Memory handed out is
//! zeroed and never returned.

use crate::chunk::Chunk;
use crate::sync::SpinMutex;
use core::ptr::{self, NonNull};

/// Allocations are rounded to a cache line.
const QUANTUM: usize = 64;

struct BaseInner {
    /// Current bump pointer within the active chunk.
    next: usize,
    /// End of the active chunk.
    end: usize,
    /// Bytes of chunk memory obtained so far.
    mapped: usize,
}

pub struct Base {
    inner: SpinMutex<BaseInner>,
}

impl Default for Base {
    fn default() -> Self {
        Self::new()
    }
}

impl Base {
    pub const fn new() -> Self {
        Self {
            inner: SpinMutex::new(BaseInner {
                next: 0,
                end: 0,
                mapped: 0,
            }),
        }
    }

    /// Allocate `size` zeroed bytes, calling `grow(csize)` for a fresh
    /// chunk-multiple region when the active one is used up. Whatever is
    /// left of the previous region is abandoned.
    pub fn alloc(
        &self,
        size: usize,
        chunk_size: usize,
        grow: impl FnOnce(usize) -> Option<Chunk>,
    ) -> Option<NonNull<u8>> {
        let size = size.checked_next_multiple_of(QUANTUM)?;
        let mut inner = self.inner.lock();

        if inner.end - inner.next < size {
            let csize = size.checked_next_multiple_of(chunk_size)?;
            let chunk = grow(csize)?;
            let base = chunk.addr.as_ptr();
            if !chunk.zeroed {
                unsafe { ptr::write_bytes(base, 0, csize) };
            }
            inner.next = base as usize;
            inner.end = base as usize + csize;
            inner.mapped += csize;
        }

        let ret = inner.next;
        inner.next += size;
        NonNull::new(ret as *mut u8)
    }

    /// Chunk bytes consumed by metadata.
    pub fn mapped(&self) -> usize {
        self.inner.lock().mapped
    }

    pub(crate) fn prefork(&self) {
        self.inner.force_lock();
    }

    pub(crate) fn postfork(&self) {
        unsafe { self.inner.force_unlock() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::platform::{ChunkSource, System};

    fn grow_from(sys: &System) -> impl FnOnce(usize) -> Option<Chunk> + '_ {
        move |csize| {
            sys.map_anonymous(csize, PAGE_SIZE).map(|addr| Chunk { addr, zeroed: true })
        }
    }

    #[test]
    fn test_bump_within_one_chunk() {
        let sys = System::new();
        let base = Base::new();
        let a = base.alloc(10, PAGE_SIZE, grow_from(&sys)).unwrap();
        let b = base.alloc(100, PAGE_SIZE, |_| panic!("should not grow")).unwrap();
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, QUANTUM);
        assert_eq!(base.mapped(), PAGE_SIZE);
        unsafe { assert_eq!(*b.as_ptr().add(99), 0) };
    }

    #[test]
    fn test_grows_when_full() {
        let sys = System::new();
        let base = Base::new();
        base.alloc(PAGE_SIZE - QUANTUM, PAGE_SIZE, grow_from(&sys)).unwrap();
        base.alloc(QUANTUM * 2, PAGE_SIZE, grow_from(&sys)).unwrap();
        assert_eq!(base.mapped(), 2 * PAGE_SIZE);
    }

    #[test]
    fn test_zeroes_dirty_chunks() {
        let sys = System::new();
        let base = Base::new();
        let p = base
            .alloc(64, PAGE_SIZE, |csize| {
                let addr = sys.map_anonymous(csize, PAGE_SIZE)?;
                unsafe { addr.as_ptr().write_bytes(0xEE, csize) };
                Some(Chunk { addr, zeroed: false })
            })
            .unwrap();
        unsafe { assert_eq!(*p.as_ptr(), 0) };
    }

    #[test]
    fn test_grow_failure_is_none() {
        let base = Base::new();
        assert!(base.alloc(64, PAGE_SIZE, |_| None).is_none());
        assert_eq!(base.mapped(), 0);
    }
}
