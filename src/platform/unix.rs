//! Unix virtual memory implementation using mmap/munmap/madvise and sbrk.

use crate::config::PAGE_SIZE;
use core::ffi::c_void;
use core::ptr;

const PROT_READ: i32 = 0x1;
const PROT_WRITE: i32 = 0x2;
const MAP_PRIVATE: i32 = 0x02;
#[cfg(any(target_os = "macos", target_os = "ios"))]
const MAP_ANONYMOUS: i32 = 0x1000;
#[cfg(not(any(target_os = "macos", target_os = "ios")))]
const MAP_ANONYMOUS: i32 = 0x20;
const MAP_FAILED: *mut c_void = !0usize as *mut c_void;
#[cfg(target_os = "linux")]
const MADV_PURGE: i32 = 4; // MADV_DONTNEED
#[cfg(not(target_os = "linux"))]
const MADV_PURGE: i32 = 5; // MADV_FREE
const SBRK_FAILED: *mut c_void = !0usize as *mut c_void;

unsafe extern "C" {
    fn mmap(
        addr: *mut c_void,
        length: usize,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: i64,
    ) -> *mut c_void;

    fn munmap(addr: *mut c_void, length: usize) -> i32;

    fn madvise(addr: *mut c_void, length: usize, advice: i32) -> i32;

    fn sbrk(increment: isize) -> *mut c_void;
}

unsafe fn pages_map(size: usize) -> *mut u8 {
    let ptr = unsafe {
        mmap(
            ptr::null_mut(),
            size,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == MAP_FAILED {
        ptr::null_mut()
    } else {
        ptr as *mut u8
    }
}

pub unsafe fn pages_unmap(ptr: *mut u8, size: usize) {
    if unsafe { munmap(ptr as *mut c_void, size) } != 0 {
        log::error!("munmap({:p}, {:#x}) failed", ptr, size);
    }
}

/// Map `size` bytes aligned to `align`. Tries a plain mapping first and only
/// over-allocates and trims when the kernel hands back a misaligned range.
pub unsafe fn chunk_map(size: usize, align: usize) -> *mut u8 {
    let ret = unsafe { pages_map(size) };
    if ret.is_null() || (ret as usize) & (align - 1) == 0 {
        return ret;
    }
    unsafe { pages_unmap(ret, size) };

    let alloc_size = match size.checked_add(align - PAGE_SIZE) {
        Some(s) => s,
        None => return ptr::null_mut(),
    };
    let pages = unsafe { pages_map(alloc_size) };
    if pages.is_null() {
        return ptr::null_mut();
    }
    let lead = (pages as usize).next_multiple_of(align) - pages as usize;
    let trail = alloc_size - lead - size;
    unsafe {
        if lead != 0 {
            pages_unmap(pages, lead);
        }
        if trail != 0 {
            pages_unmap(pages.add(lead + size), trail);
        }
        pages.add(lead)
    }
}

/// Returns whether the range now reads as zero.
pub unsafe fn pages_purge(ptr: *mut u8, size: usize) -> bool {
    let err = unsafe { madvise(ptr as *mut c_void, size, MADV_PURGE) };
    cfg!(target_os = "linux") && err == 0
}

pub const DSS_SUPPORTED: bool = cfg!(target_os = "linux");

/// Current program break, or `None` if sbrk is unusable.
pub fn dss_current() -> Option<usize> {
    let cur = unsafe { sbrk(0) };
    if cur == SBRK_FAILED {
        None
    } else {
        Some(cur as usize)
    }
}

/// Move the break by `incr` bytes. Returns the previous break.
pub fn dss_extend(incr: usize) -> Option<usize> {
    let incr = isize::try_from(incr).ok()?;
    let prev = unsafe { sbrk(incr) };
    if prev == SBRK_FAILED {
        None
    } else {
        Some(prev as usize)
    }
}
