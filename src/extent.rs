//! Free extents and the two trees that index them.
//!
//! An [`Extent`] describes one free, chunk-aligned address range. Every
//! extent of an address space sits in two intrusive trees at once: `szad`,
//! ordered by (size, address) for best-fit lookups, and `ad`, ordered by
//! address for finding neighbours to coalesce with. Both trees are treaps
//! whose priorities are derived from the node handle, so shapes are
//! deterministic.
//!
//! Nodes live in an [`ExtentPool`]: slabs of `Extent` structs carved from
//! base memory and addressed by [`ExtentId`] handles, with a free list of
//! spare ids. Handles stay valid across rotations.

use crate::config::{EXTENT_SLAB_NODES, EXTENT_SLABS_MAX};
use core::cmp::Ordering;
use core::mem;
use core::ptr::{self, NonNull};

/// Stable handle of a node in an [`ExtentPool`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ExtentId(u32);

impl ExtentId {
    /// Treap priority: a murmur3 finalizer over the handle.
    fn priority(self) -> u32 {
        let mut x = self.0.wrapping_add(0x9E37_79B9);
        x = (x ^ (x >> 16)).wrapping_mul(0x85EB_CA6B);
        x = (x ^ (x >> 13)).wrapping_mul(0xC2B2_AE35);
        x ^ (x >> 16)
    }
}

#[derive(Clone, Copy, Default, Debug)]
struct Link {
    left: Option<ExtentId>,
    right: Option<ExtentId>,
}

/// One free address range.
#[derive(Clone, Copy, Debug)]
pub struct Extent {
    pub addr: usize,
    pub size: usize,
    /// Known to read as zero.
    pub zeroed: bool,
    links: [Link; 2],
}

impl Extent {
    #[inline]
    pub fn end(&self) -> usize {
        self.addr + self.size
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Order {
    /// (size, address)
    Szad = 0,
    /// address
    Ad = 1,
}

impl Order {
    #[inline]
    fn key(self, e: &Extent) -> (usize, usize) {
        match self {
            Order::Szad => (e.size, e.addr),
            Order::Ad => (e.addr, 0),
        }
    }
}

/// Slab-backed storage for extent nodes.
pub struct ExtentPool {
    slabs: [*mut Extent; EXTENT_SLABS_MAX],
    nslabs: usize,
    /// Maximum number of slabs this pool may grow to.
    limit: usize,
    /// Ids below this have been handed out at least once.
    bump: u32,
    /// Recycled ids, chained through `links[0].left`.
    free: Option<ExtentId>,
    live: usize,
}

// SAFETY: ExtentPool is only accessed through a SpinMutex. The slab pointers
// refer to base memory that is never freed.
unsafe impl Send for ExtentPool {}

impl ExtentPool {
    pub const SLAB_BYTES: usize = EXTENT_SLAB_NODES * mem::size_of::<Extent>();

    pub const fn new(limit: usize) -> Self {
        Self {
            slabs: [ptr::null_mut(); EXTENT_SLABS_MAX],
            nslabs: 0,
            limit: if limit < EXTENT_SLABS_MAX { limit } else { EXTENT_SLABS_MAX },
            bump: 0,
            free: None,
            live: 0,
        }
    }

    /// Take a node, calling `grow(SLAB_BYTES)` for a new zeroed slab if both
    /// the free list and the current slab are exhausted.
    pub fn alloc(&mut self, grow: impl FnOnce(usize) -> Option<NonNull<u8>>) -> Option<ExtentId> {
        let id = if let Some(id) = self.free {
            self.free = self.get(id).links[0].left;
            id
        } else {
            if self.bump as usize == self.nslabs * EXTENT_SLAB_NODES {
                if self.nslabs == self.limit {
                    return None;
                }
                let slab = grow(Self::SLAB_BYTES)?;
                self.add_slab(slab);
            }
            let id = ExtentId(self.bump);
            self.bump += 1;
            id
        };
        *self.get_mut(id) = Extent {
            addr: 0,
            size: 0,
            zeroed: false,
            links: [Link::default(); 2],
        };
        self.live += 1;
        Some(id)
    }

    /// The next `alloc` needs a new slab, and the pool may still grow.
    #[inline]
    pub fn needs_slab(&self) -> bool {
        self.free.is_none()
            && self.bump as usize == self.nslabs * EXTENT_SLAB_NODES
            && self.nslabs < self.limit
    }

    /// Hand the pool a zeroed slab of `SLAB_BYTES`. Returns `false`, leaving
    /// the memory unused, if the pool does not need one.
    pub fn add_slab(&mut self, slab: NonNull<u8>) -> bool {
        if !self.needs_slab() {
            return false;
        }
        self.slabs[self.nslabs] = slab.as_ptr().cast::<Extent>();
        self.nslabs += 1;
        true
    }

    /// Return a node that is in neither tree.
    pub fn dealloc(&mut self, id: ExtentId) {
        self.get_mut(id).links[0].left = self.free;
        self.free = Some(id);
        self.live -= 1;
    }

    /// Nodes currently handed out.
    #[inline]
    pub fn live(&self) -> usize {
        self.live
    }

    #[inline]
    fn slot(&self, id: ExtentId) -> *mut Extent {
        let idx = id.0 as usize;
        debug_assert!(idx < self.bump as usize);
        unsafe { self.slabs[idx / EXTENT_SLAB_NODES].add(idx % EXTENT_SLAB_NODES) }
    }

    #[inline]
    pub fn get(&self, id: ExtentId) -> &Extent {
        // SAFETY: ids below `bump` point into a live slab.
        unsafe { &*self.slot(id) }
    }

    #[inline]
    pub fn get_mut(&mut self, id: ExtentId) -> &mut Extent {
        unsafe { &mut *self.slot(id) }
    }
}

/// Result of a successful [`ExtentTrees::recycle`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Recycled {
    pub addr: usize,
    pub zeroed: bool,
}

/// The szad/ad tree pair of one address space, with its node pool.
pub struct ExtentTrees {
    pool: ExtentPool,
    roots: [Option<ExtentId>; 2],
}

impl ExtentTrees {
    pub const fn new(slab_limit: usize) -> Self {
        Self {
            pool: ExtentPool::new(slab_limit),
            roots: [None, None],
        }
    }

    /// Number of free extents.
    #[inline]
    pub fn len(&self) -> usize {
        self.pool.live()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.roots[Order::Ad as usize].is_none()
    }

    /// Whether the next node has to come from a new slab.
    #[inline]
    pub fn needs_slab(&self) -> bool {
        self.pool.needs_slab()
    }

    /// See [`ExtentPool::add_slab`].
    #[inline]
    pub fn add_slab(&mut self, slab: NonNull<u8>) -> bool {
        self.pool.add_slab(slab)
    }

    /// Total free bytes.
    pub fn free_bytes(&self) -> usize {
        let mut total = 0;
        self.for_each(|e| total += e.size);
        total
    }

    /// Visit extents in address order.
    pub fn for_each(&self, mut f: impl FnMut(&Extent)) {
        self.walk(self.roots[Order::Ad as usize], &mut f);
    }

    fn walk(&self, node: Option<ExtentId>, f: &mut impl FnMut(&Extent)) {
        if let Some(n) = node {
            let link = self.link(Order::Ad, n);
            self.walk(link.left, f);
            f(self.pool.get(n));
            self.walk(link.right, f);
        }
    }

    /// Carve `size` bytes aligned to `align` out of the smallest fitting
    /// extent, or out of the extent starting exactly at `new_addr`. Leading
    /// and trailing remainders stay in the trees.
    ///
    /// `grow` supplies a fresh node slab if the trailing remainder needs a
    /// node and none is spare; if that fails too the remainder is leaked.
    pub fn recycle(
        &mut self,
        new_addr: Option<usize>,
        size: usize,
        align: usize,
        chunk_size: usize,
        grow: impl FnOnce(usize) -> Option<NonNull<u8>>,
    ) -> Option<Recycled> {
        debug_assert!(align.is_power_of_two() && align >= chunk_size);
        debug_assert!(size != 0 && size % chunk_size == 0);

        // Reject wrap-around.
        let alloc_size = size.checked_add(align - chunk_size)?;
        let node = match new_addr {
            Some(addr) => {
                debug_assert!(addr % align == 0);
                self.search(Order::Ad, (addr, 0))
                    .filter(|&n| self.pool.get(n).size >= size)?
            }
            None => self
                .nsearch(Order::Szad, (alloc_size, 0))
                .or_else(|| self.aligned_fit(size, align))?,
        };

        let Extent { addr, size: node_size, zeroed, .. } = *self.pool.get(node);
        let lead = addr.next_multiple_of(align) - addr;
        assert!(node_size >= lead + size);
        let trail = node_size - lead - size;
        let ret = addr + lead;

        self.remove_both(node);
        let mut spare = Some(node);
        if lead != 0 {
            // The node keeps describing the leading part.
            self.pool.get_mut(node).size = lead;
            self.insert_both(node);
            spare = None;
        }
        if trail != 0 {
            let tnode = match spare.take() {
                Some(n) => Some(n),
                None => self.pool.alloc(grow),
            };
            match tnode {
                Some(t) => {
                    let e = self.pool.get_mut(t);
                    e.addr = ret + size;
                    e.size = trail;
                    e.zeroed = zeroed;
                    self.insert_both(t);
                }
                None => {
                    log::warn!(
                        "no extent node for trailing {:#x} bytes at {:#x}; leaking",
                        trail,
                        ret + size
                    );
                    stat_inc!(node_leaks);
                }
            }
        }
        if let Some(n) = spare {
            self.pool.dealloc(n);
        }

        stat_inc!(chunk_recycles);
        if lead != 0 || trail != 0 {
            stat_inc!(extent_splits);
        }
        Some(Recycled { addr: ret, zeroed })
    }

    /// Smallest extent that holds an `align`-aligned range of `size` bytes.
    /// Only reached when no extent is large enough to fit at any alignment,
    /// so the walk covers sizes in `size..size + align - chunk`.
    fn aligned_fit(&self, size: usize, align: usize) -> Option<ExtentId> {
        let mut cur = self.nsearch(Order::Szad, (size, 0));
        while let Some(n) = cur {
            let e = self.pool.get(n);
            if e.addr.next_multiple_of(align) - e.addr + size <= e.size {
                return Some(n);
            }
            cur = self.next(Order::Szad, n);
        }
        None
    }

    /// Insert the free range `[addr, addr + size)`, merging it with the
    /// extents that end at `addr` and start at `addr + size`. Returns `false`
    /// if no node was available and the range was dropped.
    pub fn record(
        &mut self,
        addr: usize,
        size: usize,
        zeroed: bool,
        grow: impl FnOnce(usize) -> Option<NonNull<u8>>,
    ) -> bool {
        let end = addr + size;
        #[cfg(debug_assertions)]
        self.assert_free(addr, end);

        let node = match self.search(Order::Ad, (end, 0)) {
            Some(next) => {
                // Coalesce forward. The ad position is unchanged: nothing
                // lies between `addr` and the old start.
                self.remove(Order::Szad, next);
                let e = self.pool.get_mut(next);
                e.addr = addr;
                e.size += size;
                e.zeroed = e.zeroed && zeroed;
                self.insert(Order::Szad, next);
                stat_inc!(extent_coalesces);
                next
            }
            None => {
                let Some(n) = self.pool.alloc(grow) else {
                    log::warn!("no extent node for {:#x} bytes at {:#x}; leaking", size, addr);
                    stat_inc!(node_leaks);
                    return false;
                };
                let e = self.pool.get_mut(n);
                e.addr = addr;
                e.size = size;
                e.zeroed = zeroed;
                self.insert_both(n);
                n
            }
        };

        if let Some(prev) = self.prev(Order::Ad, node) {
            let p = *self.pool.get(prev);
            if p.end() == addr {
                // Coalesce backward.
                self.remove_both(prev);
                self.remove(Order::Szad, node);
                let e = self.pool.get_mut(node);
                e.addr = p.addr;
                e.size += p.size;
                e.zeroed = e.zeroed && p.zeroed;
                self.insert(Order::Szad, node);
                self.pool.dealloc(prev);
                stat_inc!(extent_coalesces);
            }
        }
        true
    }

    #[cfg(debug_assertions)]
    fn assert_free(&self, addr: usize, end: usize) {
        if let Some(n) = self.nsearch(Order::Ad, (addr, 0)) {
            assert!(
                self.pool.get(n).addr >= end,
                "freed range {addr:#x}..{end:#x} overlaps a free extent"
            );
        }
        let mut cur = self.roots[Order::Ad as usize];
        let mut pred = None;
        while let Some(n) = cur {
            if self.pool.get(n).addr < addr {
                pred = Some(n);
                cur = self.link(Order::Ad, n).right;
            } else {
                cur = self.link(Order::Ad, n).left;
            }
        }
        if let Some(p) = pred {
            assert!(
                self.pool.get(p).end() <= addr,
                "freed range {addr:#x}..{end:#x} overlaps a free extent"
            );
        }
    }

    // ---- Treap plumbing ----

    #[inline]
    fn link(&self, order: Order, id: ExtentId) -> Link {
        self.pool.get(id).links[order as usize]
    }

    #[inline]
    fn link_mut(&mut self, order: Order, id: ExtentId) -> &mut Link {
        &mut self.pool.get_mut(id).links[order as usize]
    }

    #[inline]
    fn key(&self, order: Order, id: ExtentId) -> (usize, usize) {
        order.key(self.pool.get(id))
    }

    fn insert_both(&mut self, id: ExtentId) {
        self.insert(Order::Szad, id);
        self.insert(Order::Ad, id);
    }

    fn remove_both(&mut self, id: ExtentId) {
        self.remove(Order::Szad, id);
        self.remove(Order::Ad, id);
    }

    fn insert(&mut self, order: Order, id: ExtentId) {
        *self.link_mut(order, id) = Link::default();
        let root = self.roots[order as usize];
        self.roots[order as usize] = Some(self.insert_at(order, root, id));
    }

    fn insert_at(&mut self, order: Order, node: Option<ExtentId>, id: ExtentId) -> ExtentId {
        let Some(n) = node else {
            return id;
        };
        let key = self.key(order, id);
        match key.cmp(&self.key(order, n)) {
            Ordering::Less => {
                let l = self.insert_at(order, self.link(order, n).left, id);
                self.link_mut(order, n).left = Some(l);
                if l.priority() > n.priority() {
                    return self.rotate_right(order, n, l);
                }
            }
            Ordering::Greater => {
                let r = self.insert_at(order, self.link(order, n).right, id);
                self.link_mut(order, n).right = Some(r);
                if r.priority() > n.priority() {
                    return self.rotate_left(order, n, r);
                }
            }
            Ordering::Equal => unreachable!("duplicate extent key {:?}", key),
        }
        n
    }

    fn remove(&mut self, order: Order, id: ExtentId) {
        let key = self.key(order, id);
        let root = self.roots[order as usize];
        self.roots[order as usize] = self.remove_at(order, root, key, id);
    }

    fn remove_at(
        &mut self,
        order: Order,
        node: Option<ExtentId>,
        key: (usize, usize),
        id: ExtentId,
    ) -> Option<ExtentId> {
        let Some(n) = node else {
            debug_assert!(false, "extent {:?} missing from tree", id);
            return None;
        };
        if n == id {
            let link = self.link(order, n);
            return self.join(order, link.left, link.right);
        }
        if key < self.key(order, n) {
            let l = self.remove_at(order, self.link(order, n).left, key, id);
            self.link_mut(order, n).left = l;
        } else {
            let r = self.remove_at(order, self.link(order, n).right, key, id);
            self.link_mut(order, n).right = r;
        }
        Some(n)
    }

    /// Join two treaps where every key of `a` precedes every key of `b`.
    fn join(&mut self, order: Order, a: Option<ExtentId>, b: Option<ExtentId>) -> Option<ExtentId> {
        match (a, b) {
            (None, b) => b,
            (a, None) => a,
            (Some(x), Some(y)) => {
                if x.priority() > y.priority() {
                    let r = self.join(order, self.link(order, x).right, b);
                    self.link_mut(order, x).right = r;
                    Some(x)
                } else {
                    let l = self.join(order, a, self.link(order, y).left);
                    self.link_mut(order, y).left = l;
                    Some(y)
                }
            }
        }
    }

    /// Lift `l`, the left child of `n`, above it.
    fn rotate_right(&mut self, order: Order, n: ExtentId, l: ExtentId) -> ExtentId {
        self.link_mut(order, n).left = self.link(order, l).right;
        self.link_mut(order, l).right = Some(n);
        l
    }

    fn rotate_left(&mut self, order: Order, n: ExtentId, r: ExtentId) -> ExtentId {
        self.link_mut(order, n).right = self.link(order, r).left;
        self.link_mut(order, r).left = Some(n);
        r
    }

    /// Exact match.
    fn search(&self, order: Order, key: (usize, usize)) -> Option<ExtentId> {
        let mut cur = self.roots[order as usize];
        while let Some(n) = cur {
            match key.cmp(&self.key(order, n)) {
                Ordering::Equal => return Some(n),
                Ordering::Less => cur = self.link(order, n).left,
                Ordering::Greater => cur = self.link(order, n).right,
            }
        }
        None
    }

    /// Smallest node whose key is >= `key`.
    fn nsearch(&self, order: Order, key: (usize, usize)) -> Option<ExtentId> {
        let mut cur = self.roots[order as usize];
        let mut best = None;
        while let Some(n) = cur {
            match key.cmp(&self.key(order, n)) {
                Ordering::Equal => return Some(n),
                Ordering::Less => {
                    best = Some(n);
                    cur = self.link(order, n).left;
                }
                Ordering::Greater => cur = self.link(order, n).right,
            }
        }
        best
    }

    /// Smallest node whose key is > that of `id`.
    fn next(&self, order: Order, id: ExtentId) -> Option<ExtentId> {
        let key = self.key(order, id);
        let mut cur = self.roots[order as usize];
        let mut best = None;
        while let Some(n) = cur {
            if self.key(order, n) > key {
                best = Some(n);
                cur = self.link(order, n).left;
            } else {
                cur = self.link(order, n).right;
            }
        }
        best
    }

    /// Largest node whose key is < that of `id`.
    fn prev(&self, order: Order, id: ExtentId) -> Option<ExtentId> {
        let key = self.key(order, id);
        let mut cur = self.roots[order as usize];
        let mut best = None;
        while let Some(n) = cur {
            if self.key(order, n) < key {
                best = Some(n);
                cur = self.link(order, n).right;
            } else {
                cur = self.link(order, n).left;
            }
        }
        best
    }
}
