//! Chunk allocation and deallocation.
//!
//! [`ChunkManager`] owns everything the chunk layer shares between threads:
//! one [`ExtentTrees`] pair per address space, the [`ChunkRegistry`], the
//! metadata [`Base`] and the OS [`ChunkSource`]. It is an ordinary value;
//! several independent managers can coexist.
//!
//! Allocation order, with `dss = primary`:
//!   1. recycle from the dss trees, then grow the dss
//!   2. recycle from the mmap trees, then map fresh memory
//!
//! With `dss = secondary` step 1 runs after step 2 instead. OS calls (growth,
//! mapping, purging) happen outside the tree locks; only tree mutation runs
//! under them.
//!
//! Lock order: registry, dss trees, mmap trees, base, source.

use crate::base::Base;
use crate::config::{ChunkConfig, DssPrec};
use crate::error::BootError;
use crate::extent::{Extent, ExtentPool, ExtentTrees};
use crate::platform::{ChunkSource, HeapGrowth};
use crate::registry::{ChunkRegistry, ChunkStats};
use crate::sync::{SpinMutex, SpinMutexGuard};
use core::ptr::{self, NonNull};

/// A chunk-aligned region handed out by [`ChunkManager::alloc`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Chunk {
    pub addr: NonNull<u8>,
    /// The region reads as zero.
    pub zeroed: bool,
}

/// The two address spaces free extents are kept apart by.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Space {
    /// Memory from growing the data segment.
    Dss,
    /// Anonymous mappings.
    Mmap,
}

pub struct ChunkManager<S: ChunkSource> {
    config: ChunkConfig,
    source: S,
    registry: ChunkRegistry,
    dss: SpinMutex<ExtentTrees>,
    mmap: SpinMutex<ExtentTrees>,
    base: Base,
}

impl<S: ChunkSource> ChunkManager<S> {
    pub fn boot(config: ChunkConfig, source: S) -> Result<Self, BootError> {
        config.validate()?;
        if config.dss == DssPrec::Primary && !source.dss_supported() {
            return Err(BootError::DssUnsupported);
        }
        log::debug!(
            "chunk layer boot: chunk size {:#x}, dss {}, munmap {}",
            config.chunk_size(),
            config.dss,
            config.munmap
        );
        Ok(Self {
            config,
            source,
            registry: ChunkRegistry::new(config.lg_chunk),
            dss: SpinMutex::new(ExtentTrees::new(config.extent_slabs)),
            mmap: SpinMutex::new(ExtentTrees::new(config.extent_slabs)),
            base: Base::new(),
        })
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.config.chunk_size()
    }

    #[inline]
    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    #[inline]
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Allocate `size` bytes aligned to `align`, both chunk multiples. With
    /// `new_addr` only the free extent starting exactly there can satisfy the
    /// request. With `zero` the returned memory reads as zero.
    ///
    /// The chunk is registered before it is returned; `None` means every
    /// source is exhausted or registration ran out of nodes.
    pub fn alloc(
        &self,
        new_addr: Option<NonNull<u8>>,
        size: usize,
        align: usize,
        zero: bool,
    ) -> Option<Chunk> {
        debug_assert!(size != 0 && size % self.chunk_size() == 0);
        debug_assert!(align.is_power_of_two() && align % self.chunk_size() == 0);

        let mut chunk = self.alloc_core(new_addr.map(|p| p.as_ptr() as usize), size, align, false)?;

        match self.registry.register(chunk.addr.as_ptr() as usize, size, |bytes| self.base_alloc(bytes)) {
            Ok(new_high) => {
                if new_high {
                    if let Some(hook) = self.config.on_high_water {
                        hook(self.registry.stats());
                    }
                }
            }
            Err(e) => {
                log::warn!("chunk {:p} not registered: {}", chunk.addr, e);
                unsafe { self.release(chunk.addr, size) };
                return None;
            }
        }

        if zero {
            if !chunk.zeroed {
                unsafe { ptr::write_bytes(chunk.addr.as_ptr(), 0, size) };
                chunk.zeroed = true;
            } else {
                #[cfg(debug_assertions)]
                assert_zeroed(chunk.addr, size);
            }
        }

        stat_inc!(chunk_allocs);
        Some(chunk)
    }

    /// Raw chunk memory for metadata: never recycled, never registered.
    pub fn alloc_base(&self, size: usize) -> Option<Chunk> {
        self.alloc_core(None, size, self.chunk_size(), true)
    }

    fn alloc_core(&self, new_addr: Option<usize>, size: usize, align: usize, base: bool) -> Option<Chunk> {
        if self.config.dss == DssPrec::Primary {
            if let Some(chunk) = self.alloc_from(Space::Dss, new_addr, size, align, base) {
                return Some(chunk);
            }
        }
        if let Some(chunk) = self.alloc_from(Space::Mmap, new_addr, size, align, base) {
            return Some(chunk);
        }
        if self.config.dss == DssPrec::Secondary && self.source.dss_supported() {
            if let Some(chunk) = self.alloc_from(Space::Dss, new_addr, size, align, base) {
                return Some(chunk);
            }
        }
        log::debug!("out of chunk memory for {:#x} bytes", size);
        None
    }

    /// Recycle from `space`'s trees, falling back to fresh memory from the
    /// same source. Fresh memory cannot honor `new_addr`.
    fn alloc_from(
        &self,
        space: Space,
        new_addr: Option<usize>,
        size: usize,
        align: usize,
        base: bool,
    ) -> Option<Chunk> {
        // Base allocations feed the extent pools; recycling from here
        // could recurse into them.
        if !base {
            let recycled = self.lock_trees(space).recycle(
                new_addr,
                size,
                align,
                self.chunk_size(),
                |_| None,
            );
            if let Some(r) = recycled {
                let addr = NonNull::new(r.addr as *mut u8)?;
                return Some(Chunk { addr, zeroed: r.zeroed });
            }
        }
        if new_addr.is_some() {
            return None;
        }

        match space {
            Space::Dss => {
                let HeapGrowth { addr, pad } = self.source.grow_heap(size, align)?;
                stat_inc!(dss_grows);
                if !base {
                    self.reclaim_pad(addr, pad);
                }
                // The break may move back over memory that was written to
                // before, so nothing is assumed about its contents.
                Some(Chunk { addr, zeroed: false })
            }
            Space::Mmap => {
                let addr = self.source.map_anonymous(size, align)?;
                stat_inc!(mmap_maps);
                Some(Chunk { addr, zeroed: true })
            }
        }
    }

    /// Keep the chunk-aligned part of the gap a dss growth skipped to reach
    /// `addr`. Base growths are chunk aligned and never leave one.
    fn reclaim_pad(&self, addr: NonNull<u8>, pad: usize) {
        let end = addr.as_ptr() as usize;
        let start = (end - pad).next_multiple_of(self.chunk_size());
        if start < end {
            log::trace!("dss pad {:#x} (+{:#x}) kept for reuse", start, end - start);
            if let Some(p) = NonNull::new(start as *mut u8) {
                unsafe { self.record(Space::Dss, p, end - start) };
            }
        }
    }

    /// Lock `space`'s trees with a node on hand for one insertion. A new
    /// node slab comes from [`Base`] before the lock is taken, so tree
    /// operations never wait on the OS.
    fn lock_trees(&self, space: Space) -> SpinMutexGuard<'_, ExtentTrees> {
        let trees = self.trees(space).lock();
        if !trees.needs_slab() {
            return trees;
        }
        drop(trees);

        let slab = self.base_alloc(ExtentPool::SLAB_BYTES);
        let mut trees = self.trees(space).lock();
        if let Some(slab) = slab {
            if !trees.add_slab(slab) {
                log::trace!("{:?} extent slab raced; left unused", space);
            }
        }
        trees
    }

    /// Metadata memory from [`Base`].
    fn base_alloc(&self, bytes: usize) -> Option<NonNull<u8>> {
        self.base.alloc(bytes, self.chunk_size(), |csize| self.alloc_base(csize))
    }

    /// Deregister a chunk returned by [`alloc`](Self::alloc). With `unmap`
    /// its memory is also released: purged and kept for reuse, or given back
    /// to the OS if it is an mmap chunk and `munmap` is configured. Without
    /// `unmap` the caller keeps the (now unregistered) memory.
    ///
    /// # Safety
    ///
    /// `[addr, addr + size)` must be a live chunk from this manager and no
    /// longer in use.
    pub unsafe fn dealloc(&self, addr: NonNull<u8>, size: usize, unmap: bool) {
        debug_assert!(size != 0 && size % self.chunk_size() == 0);
        debug_assert!(self.is_chunk(addr.as_ptr() as usize));

        self.registry.deregister(addr.as_ptr() as usize, size);
        stat_inc!(chunk_deallocs);
        if unmap {
            unsafe { self.release(addr, size) };
        }
    }

    /// Give an unregistered range back to its address space.
    unsafe fn release(&self, addr: NonNull<u8>, size: usize) {
        let space = self.space_of(addr.as_ptr() as usize);
        if space == Space::Mmap && self.config.munmap {
            unsafe { self.source.unmap(addr, size) };
            return;
        }
        unsafe { self.record(space, addr, size) };
    }

    unsafe fn record(&self, space: Space, addr: NonNull<u8>, size: usize) {
        let zeroed = unsafe { self.source.purge(addr, size) };
        stat_add!(purged_bytes, size);

        let recorded = self.lock_trees(space).record(addr.as_ptr() as usize, size, zeroed, |_| None);
        if !recorded {
            log::warn!("{:?} chunk {:p} (+{:#x}) leaked", space, addr, size);
        }
    }

    #[inline]
    fn trees(&self, space: Space) -> &SpinMutex<ExtentTrees> {
        match space {
            Space::Dss => &self.dss,
            Space::Mmap => &self.mmap,
        }
    }

    /// Which address space `addr` belongs to.
    #[inline]
    pub fn space_of(&self, addr: usize) -> Space {
        if self.source.in_dss(addr) {
            Space::Dss
        } else {
            Space::Mmap
        }
    }

    /// Whether `addr` lies in a live chunk.
    #[inline]
    pub fn is_chunk(&self, addr: usize) -> bool {
        self.registry.contains(addr)
    }

    pub fn stats(&self) -> ChunkStats {
        self.registry.stats()
    }

    /// Chunk bytes held by metadata.
    pub fn base_mapped(&self) -> usize {
        self.base.mapped()
    }

    /// Visit the free extents of `space` in address order. The tree lock is
    /// held during the walk, so `f` must not call back into the manager.
    pub fn for_each_extent(&self, space: Space, f: impl FnMut(&Extent)) {
        self.trees(space).lock().for_each(f);
    }

    /// Free bytes kept for reuse in `space`.
    pub fn free_bytes(&self, space: Space) -> usize {
        self.trees(space).lock().free_bytes()
    }

    /// Number of free extents in `space`.
    pub fn extent_count(&self, space: Space) -> usize {
        self.trees(space).lock().len()
    }

    /// Take every chunk-layer lock ahead of `fork`.
    pub fn prefork(&self) {
        log::debug!("chunk layer prefork");
        self.registry.prefork();
        self.dss.force_lock();
        self.mmap.force_lock();
        self.base.prefork();
        self.source.prefork();
    }

    /// Release the locks taken by [`prefork`](Self::prefork) in the parent.
    ///
    /// # Safety
    ///
    /// Must pair with a preceding `prefork` on this thread.
    pub unsafe fn postfork_parent(&self) {
        self.source.postfork_parent();
        self.unlock_all();
        log::debug!("chunk layer postfork (parent)");
    }

    /// Release the locks taken by [`prefork`](Self::prefork) in the child.
    /// The child is single threaded, so every lock is reset.
    ///
    /// # Safety
    ///
    /// Must pair with a preceding `prefork` in the parent.
    pub unsafe fn postfork_child(&self) {
        self.source.postfork_child();
        self.unlock_all();
        log::debug!("chunk layer postfork (child)");
    }

    fn unlock_all(&self) {
        self.base.postfork();
        unsafe {
            self.mmap.force_unlock();
            self.dss.force_unlock();
        }
        self.registry.postfork();
    }
}

/// Panics unless `[addr, addr + size)` reads as zero.
#[cfg(debug_assertions)]
fn assert_zeroed(addr: NonNull<u8>, size: usize) {
    let words = addr.as_ptr().cast::<usize>();
    for i in 0..size / core::mem::size_of::<usize>() {
        let w = unsafe { words.add(i).read() };
        assert!(w == 0, "chunk {:p} not zeroed at word {}", addr, i);
    }
}
