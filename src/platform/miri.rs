//! Miri-compatible platform shim using std::alloc as backing store.
//!
//! Miri can't execute real OS syscalls (mmap/sbrk), so we use the system
//! allocator to provide aligned memory. There is no dss, purge never
//! zeroes, and unmap leaks: freed ranges may have been split or coalesced
//! since they were mapped, so no matching `Layout` exists.

extern crate alloc;

use core::alloc::Layout;
use core::ptr;

pub unsafe fn chunk_map(size: usize, align: usize) -> *mut u8 {
    match Layout::from_size_align(size, align) {
        Ok(layout) => unsafe { alloc::alloc::alloc_zeroed(layout) },
        Err(_) => ptr::null_mut(),
    }
}

pub unsafe fn pages_unmap(_ptr: *mut u8, _size: usize) {}

pub unsafe fn pages_purge(_ptr: *mut u8, _size: usize) -> bool {
    false
}

pub const DSS_SUPPORTED: bool = false;

pub fn dss_current() -> Option<usize> {
    None
}

pub fn dss_extend(_incr: usize) -> Option<usize> {
    None
}
