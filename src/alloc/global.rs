//! The process-wide tracker and the surfaces that feed it.
//!
//! In debug builds every call here goes through one [`Tracker`] over the C
//! heap, created on first use from [`TrackerConfig::from_env`]. In release
//! builds the same functions are thin wrappers over libc and `System`, and
//! nothing is tracked.
//!
//! The tracker allocates its own bookkeeping through the global allocator,
//! which may well be [`AuditedAlloc`]. A thread-local flag marks "inside the
//! tracker"; allocations made while it is set go straight to the system
//! heap, and so do their frees, since those happen inside the tracker too.

use std::{
    alloc::{GlobalAlloc, Layout, System},
    cell::Cell,
    io::{self, Write},
    sync::{Mutex, PoisonError},
};

use once_cell::sync::Lazy;

use super::{audit::AuditSummary, heap::RawHeap, heap::SystemHeap, tracker::Tracker};
use crate::{
    config::TrackerConfig,
    error::TrackError,
    report::{Location, Op},
};

static TRACKER: Lazy<Mutex<Tracker>> = Lazy::new(|| {
    let config = TrackerConfig::from_env().unwrap_or_else(|e| {
        log::warn!("memtrack: {e}, using the default configuration");
        TrackerConfig::default()
    });
    Mutex::new(Tracker::new(config))
});

thread_local! {
    // const-initialised with no destructor, so it stays readable during
    // thread teardown
    static BUSY: Cell<bool> = const { Cell::new(false) };
}

struct BusyGuard;

impl BusyGuard {
    /// `None` if this thread is already inside the tracker.
    fn enter() -> Option<Self> {
        if BUSY.with(|busy| busy.replace(true)) {
            None
        } else {
            Some(BusyGuard)
        }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        BUSY.with(|busy| busy.set(false));
    }
}

/// Run `f` against the process-wide tracker. Returns `None` when called
/// re-entrantly from inside the tracker itself.
pub fn with_tracker<F, T>(f: F) -> Option<T>
where
    F: FnOnce(&mut Tracker) -> T,
{
    let _busy = BusyGuard::enter()?;
    let mut tracker = TRACKER.lock().unwrap_or_else(PoisonError::into_inner);
    Some(f(&mut tracker))
}

/// Give up: the registry no longer describes the heap.
#[cold]
pub fn fatal(op: Op, error: TrackError, location: Location) -> ! {
    log::error!("{op}: {error}: {location}");
    let _ = writeln!(io::stderr(), "*** FATAL: {op}: {error}: {location}");
    std::process::abort()
}

/// [`with_tracker`], escalating invariant breaches to [`fatal`].
#[cfg_attr(not(debug_assertions), allow(dead_code))]
fn tracked<F, T>(op: Op, location: Location, f: F) -> Option<T>
where
    F: FnOnce(&mut Tracker) -> Result<T, TrackError>,
{
    with_tracker(f).map(|result| result.unwrap_or_else(|e| fatal(op, e, location)))
}

/// Tracked `malloc`, tagged with the caller's file and line.
#[track_caller]
pub fn malloc(size: usize) -> *mut u8 {
    malloc_at(size, Location::caller())
}

/// Tracked `calloc`, tagged with the caller's file and line.
#[track_caller]
pub fn calloc(count: usize, size: usize) -> *mut u8 {
    calloc_at(count, size, Location::caller())
}

/// Tracked `realloc`, tagged with the caller's file and line.
///
/// # Safety
///
/// `ptr` must be null or a pointer returned by this module's allocation
/// functions.
#[track_caller]
pub unsafe fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    unsafe { realloc_at(ptr, size, Location::caller()) }
}

/// Tracked `free`, tagged with the caller's file and line.
///
/// # Safety
///
/// `ptr` must be null or a pointer returned by this module's allocation
/// functions.
#[track_caller]
pub unsafe fn free(ptr: *mut u8) {
    unsafe { free_at(ptr, Location::caller()) }
}

#[cfg(debug_assertions)]
pub fn malloc_at(size: usize, location: Location) -> *mut u8 {
    tracked(Op::Malloc, location, |t| t.malloc(size, location))
        .unwrap_or_else(|| SystemHeap.malloc(size))
}

#[cfg(not(debug_assertions))]
pub fn malloc_at(size: usize, _location: Location) -> *mut u8 {
    SystemHeap.malloc(size)
}

#[cfg(debug_assertions)]
pub fn calloc_at(count: usize, size: usize, location: Location) -> *mut u8 {
    tracked(Op::Calloc, location, |t| t.calloc(count, size, location))
        .unwrap_or_else(|| unsafe { libc::calloc(count, size) as *mut u8 })
}

#[cfg(not(debug_assertions))]
pub fn calloc_at(count: usize, size: usize, _location: Location) -> *mut u8 {
    // SAFETY: calloc has no preconditions
    unsafe { libc::calloc(count, size) as *mut u8 }
}

/// # Safety
///
/// See [`realloc`].
#[cfg(debug_assertions)]
pub unsafe fn realloc_at(ptr: *mut u8, size: usize, location: Location) -> *mut u8 {
    tracked(Op::Realloc, location, |t| t.realloc(ptr, size, location))
        .unwrap_or_else(|| unsafe { libc::realloc(ptr as _, size) as *mut u8 })
}

/// # Safety
///
/// See [`realloc`].
#[cfg(not(debug_assertions))]
pub unsafe fn realloc_at(ptr: *mut u8, size: usize, _location: Location) -> *mut u8 {
    unsafe { libc::realloc(ptr as _, size) as *mut u8 }
}

/// # Safety
///
/// See [`free`].
#[cfg(debug_assertions)]
pub unsafe fn free_at(ptr: *mut u8, location: Location) {
    if tracked(Op::Free, location, |t| t.free(ptr, location)).is_none() {
        unsafe { SystemHeap.free(ptr) }
    }
}

/// # Safety
///
/// See [`free`].
#[cfg(not(debug_assertions))]
pub unsafe fn free_at(ptr: *mut u8, _location: Location) {
    unsafe { SystemHeap.free(ptr) }
}

/// Audit the process-wide tracker, then exit with `code`.
///
/// The tracker is unlocked before exiting: process teardown still drops
/// values whose blocks it tracks.
#[cfg(debug_assertions)]
pub fn exit(code: i32) -> ! {
    with_tracker(|t| t.shutdown());
    std::process::exit(code)
}

#[cfg(not(debug_assertions))]
pub fn exit(code: i32) -> ! {
    std::process::exit(code)
}

/// Audit the process-wide tracker without exiting. Released blocks go back
/// to the system heap; blocks still in use are reported as leaks and stay
/// valid.
pub fn audit() -> Option<AuditSummary> {
    with_tracker(|t| t.audit())
}

/// Live bytes according to the process-wide tracker.
pub fn tally() -> usize {
    with_tracker(|t| t.tally()).unwrap_or(0)
}

pub fn report_allocations() {
    with_tracker(|t| t.report_allocations());
}

/// A `#[global_allocator]` that runs every Rust heap allocation through the
/// process-wide tracker.
///
/// ```no_run
/// #[global_allocator]
/// static GLOBAL: memtrack::AuditedAlloc = memtrack::AuditedAlloc;
/// ```
///
/// Layouts aligned beyond [`TrackerConfig::max_align`] are passed to
/// `System` untracked.
#[derive(Debug, Default, Clone, Copy)]
pub struct AuditedAlloc;

const GLOBAL_ALLOC: Location = Location::new("<global allocator>", 0);

impl AuditedAlloc {
    /// `Some(result)` if `layout` is tracked, `None` to use `System`.
    ///
    /// Memory the tracker allocated for itself can leave it (an
    /// [`AuditSummary`], say) and come back here to be freed. The tracker
    /// has never seen it, so `NotFound` sends it to `System` as well.
    #[cfg(debug_assertions)]
    fn route<F>(op: Op, layout: Layout, f: F) -> Option<*mut u8>
    where
        F: FnOnce(&mut Tracker) -> Result<*mut u8, TrackError>,
    {
        tracked(op, GLOBAL_ALLOC, |t| {
            if layout.align() > t.config().max_align() {
                return Ok(None);
            }
            match f(t) {
                Err(TrackError::NotFound { .. }) => Ok(None),
                result => result.map(Some),
            }
        })
        .flatten()
    }

    #[cfg(not(debug_assertions))]
    fn route<F>(_op: Op, _layout: Layout, _f: F) -> Option<*mut u8>
    where
        F: FnOnce(&mut Tracker) -> Result<*mut u8, TrackError>,
    {
        None
    }
}

// SAFETY: tracked blocks come from the C heap with guard bands around them
// and are at most `max_align()` aligned, which `route` checks; everything
// else is `System`'s
unsafe impl GlobalAlloc for AuditedAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        Self::route(Op::Malloc, layout, |t| t.malloc(layout.size(), GLOBAL_ALLOC))
            .unwrap_or_else(|| unsafe { System.alloc(layout) })
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        Self::route(Op::Calloc, layout, |t| {
            t.calloc(1, layout.size(), GLOBAL_ALLOC)
        })
        .unwrap_or_else(|| unsafe { System.alloc_zeroed(layout) })
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        Self::route(Op::Realloc, layout, |t| {
            t.realloc(ptr, new_size, GLOBAL_ALLOC)
        })
        .unwrap_or_else(|| unsafe { System.realloc(ptr, layout, new_size) })
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let tracked = Self::route(Op::Free, layout, |t| {
            t.free(ptr, GLOBAL_ALLOC).map(|()| ptr)
        });
        if tracked.is_none() {
            unsafe { System.dealloc(ptr, layout) }
        }
    }
}
