//! Small size classes served through thread caches.
//!
//! The table is generated by `build.rs` from `chunkcache.toml`. Class 0 is a
//! sentinel; classes `1..NUM_SIZE_CLASSES` are strictly increasing, 8-byte
//! aligned sizes.

/// Information about a single size class.
#[derive(Clone, Copy, Debug)]
pub struct SizeClassInfo {
    /// Allocation size for this class (bytes).
    pub size: usize,
    /// Pages per run the arena carves for this class.
    pub pages: usize,
    /// Capacity of a thread cache bin for this class.
    pub ncached_max: usize,
}

impl SizeClassInfo {
    pub const fn regions_per_run(&self) -> usize {
        (self.pages * PAGE_SIZE) / self.size
    }
}

use crate::config::PAGE_SIZE;

include!(concat!(env!("OUT_DIR"), "/size_class_gen.rs"));

/// Map a request size to its class, 0 if it is too large (or zero).
#[inline]
pub fn size_to_class(size: usize) -> usize {
    if size == 0 || size > MAX_SMALL_SIZE {
        return 0;
    }
    // Smallest class whose size fits the request.
    SIZE_CLASSES[1..].partition_point(|c| c.size < size) + 1
}

#[inline]
pub fn class_to_size(class: usize) -> usize {
    SIZE_CLASSES[class].size
}

#[inline]
pub fn class_info(class: usize) -> &'static SizeClassInfo {
    &SIZE_CLASSES[class]
}

#[inline]
pub fn ncached_max(class: usize) -> usize {
    SIZE_CLASSES[class].ncached_max
}

/// Offset of a class's slots in a thread cache's shared avail array.
#[inline]
pub fn avail_offset(class: usize) -> usize {
    AVAIL_OFFSETS[class]
}
