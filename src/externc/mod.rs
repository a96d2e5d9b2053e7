//! C entry points. `include/memtrack.h` maps `malloc`, `calloc`, `realloc`,
//! `free` and `exit` onto these with `__FILE__` and `__LINE__` attached.

use std::ffi::{c_char, c_int, CStr};

use libc::{c_void, size_t};

use crate::{alloc::global, report::Location};

/// # Safety
///
/// `file` must be null or a NUL-terminated string that lives for the rest of
/// the process, which `__FILE__` does.
unsafe fn location(file: *const c_char, line: c_int) -> Location {
    if file.is_null() {
        return Location::unknown();
    }
    let file: &'static CStr = unsafe { CStr::from_ptr(file) };
    Location::new(
        file.to_str().unwrap_or("<non-utf8 file>"),
        u32::try_from(line).unwrap_or(0),
    )
}

/// # Safety
///
/// See [`location`] for `file`.
#[no_mangle]
pub unsafe extern "C" fn memtrack_malloc(
    size: size_t,
    file: *const c_char,
    line: c_int,
) -> *mut c_void {
    global::malloc_at(size, unsafe { location(file, line) }) as _
}

/// # Safety
///
/// See [`location`] for `file`.
#[no_mangle]
pub unsafe extern "C" fn memtrack_calloc(
    count: size_t,
    size: size_t,
    file: *const c_char,
    line: c_int,
) -> *mut c_void {
    global::calloc_at(count, size, unsafe { location(file, line) }) as _
}

/// # Safety
///
/// `ptr` must be null or come from one of the `memtrack_*` allocators. See
/// [`location`] for `file`.
#[no_mangle]
pub unsafe extern "C" fn memtrack_realloc(
    ptr: *mut c_void,
    size: size_t,
    file: *const c_char,
    line: c_int,
) -> *mut c_void {
    unsafe { global::realloc_at(ptr as _, size, location(file, line)) as _ }
}

/// # Safety
///
/// As for [`memtrack_realloc`].
#[no_mangle]
pub unsafe extern "C" fn memtrack_free(ptr: *mut c_void, file: *const c_char, line: c_int) {
    unsafe { global::free_at(ptr as _, location(file, line)) }
}

#[no_mangle]
pub extern "C" fn memtrack_exit(status: c_int) -> ! {
    global::exit(status)
}

#[no_mangle]
pub extern "C" fn memtrack_report_allocations() {
    global::report_allocations()
}
