use std::{ffi::c_void, ptr};

use crate::util::hint::cold;

/// The allocator underneath the tracker. It only ever sees whole system
/// blocks (guard bands included), never the addresses handed to the host.
///
/// # Safety
///
/// Implementations must behave like C `malloc`/`calloc`/`realloc`/`free`:
/// returned blocks are at least [`SYSTEM_ALIGN`](crate::config::SYSTEM_ALIGN)
/// aligned, do not overlap any other live block, and a null return means
/// failure with no side effects.
pub unsafe trait RawHeap {
    fn malloc(&self, size: usize) -> *mut u8;

    /// Zero-filled `size` bytes.
    fn calloc(&self, size: usize) -> *mut u8;

    /// Resize `block`, currently `old_size` bytes, to `size` bytes.
    ///
    /// # Safety
    ///
    /// `block` must be a live block from this heap of exactly `old_size`
    /// bytes. On success it is no longer valid, unless the same address is
    /// returned.
    unsafe fn realloc(&self, block: *mut u8, old_size: usize, size: usize) -> *mut u8;

    /// # Safety
    ///
    /// `block` must be a live block from this heap.
    unsafe fn free(&self, block: *mut u8);
}

/// The C library heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHeap;

// SAFETY: straight libc calls
unsafe impl RawHeap for SystemHeap {
    fn malloc(&self, size: usize) -> *mut u8 {
        // SAFETY: malloc has no preconditions
        unsafe { libc::malloc(size) as *mut u8 }
    }

    fn calloc(&self, size: usize) -> *mut u8 {
        // SAFETY: calloc has no preconditions
        unsafe { libc::calloc(1, size) as *mut u8 }
    }

    unsafe fn realloc(&self, block: *mut u8, _old_size: usize, size: usize) -> *mut u8 {
        // SAFETY: contract passed to caller
        unsafe { libc::realloc(block as *mut c_void, size) as *mut u8 }
    }

    unsafe fn free(&self, block: *mut u8) {
        // SAFETY: contract passed to caller
        unsafe { libc::free(block as *mut c_void) }
    }
}

/// A heap whose `realloc` never resizes in place: it always allocates a new
/// block, copies and frees the old one. Growing a block therefore always
/// moves it, which shakes out stale pointers to the old address.
#[derive(Debug, Default, Clone, Copy)]
pub struct RelocatingHeap<H> {
    inner: H,
}

impl<H> RelocatingHeap<H> {
    pub const fn new(inner: H) -> Self {
        Self { inner }
    }
}

// SAFETY: delegates everything but `realloc`, which only ever hands back
// fresh blocks from `inner`
unsafe impl<H> RawHeap for RelocatingHeap<H>
where
    H: RawHeap,
{
    fn malloc(&self, size: usize) -> *mut u8 {
        self.inner.malloc(size)
    }

    fn calloc(&self, size: usize) -> *mut u8 {
        self.inner.calloc(size)
    }

    unsafe fn realloc(&self, block: *mut u8, old_size: usize, size: usize) -> *mut u8 {
        let new = self.inner.malloc(size);
        if new.is_null() {
            return cold(ptr::null_mut);
        }
        // SAFETY: distinct live blocks, both at least `min(old_size, size)` bytes
        unsafe {
            ptr::copy_nonoverlapping(block, new, old_size.min(size));
            self.inner.free(block);
        }
        new
    }

    unsafe fn free(&self, block: *mut u8) {
        unsafe { self.inner.free(block) }
    }
}
