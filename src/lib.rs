//! A debug-build heap auditor.
//!
//! Every block handed out through this crate is wrapped in painted guard
//! bands and recorded. Frees are held back and painted over, so that on exit
//! the auditor can point at under-runs, over-runs, writes to freed memory,
//! double frees and leaks.
//!
//! There are three ways in:
//!
//! - an explicit [`Tracker`], owned by the caller
//! - the process-wide functions ([`malloc`], [`free`], ...) and the matching
//!   macros, which tag each call with its file and line
//! - [`AuditedAlloc`] as the `#[global_allocator]`
//!
//! plus the `memtrack_*` C functions in [`externc`].
//!
//! Only the explicit [`Tracker`] tracks in release builds. The other
//! surfaces pass straight through to the system heap unless
//! `debug_assertions` are on.

pub mod alloc;
pub mod config;
pub mod error;
pub mod externc;
pub mod logging;
pub mod report;
pub mod util;

pub use crate::{
    alloc::{
        audit::AuditSummary,
        global::{
            audit, calloc, exit, free, malloc, realloc, report_allocations, tally, with_tracker,
            AuditedAlloc,
        },
        heap::{RawHeap, RelocatingHeap, SystemHeap},
        tracker::{ResizeOutcome, ResizeResult, Tracker},
    },
    config::TrackerConfig,
    error::{ConfigError, TrackError},
    report::{Addr, CollectingReporter, Diagnostic, Location, LogReporter, Reporter, StderrReporter},
};

/// `malloc!(size)`: tracked allocation tagged with this file and line.
#[macro_export]
macro_rules! malloc {
    ($size:expr) => {
        $crate::alloc::global::malloc_at($size, $crate::Location::new(file!(), line!()))
    };
}

/// `calloc!(count, size)`: tracked zeroed allocation.
#[macro_export]
macro_rules! calloc {
    ($count:expr, $size:expr) => {
        $crate::alloc::global::calloc_at($count, $size, $crate::Location::new(file!(), line!()))
    };
}

/// `realloc!(ptr, size)`. Expands to an `unsafe fn` call.
#[macro_export]
macro_rules! realloc {
    ($ptr:expr, $size:expr) => {
        $crate::alloc::global::realloc_at($ptr, $size, $crate::Location::new(file!(), line!()))
    };
}

/// `free!(ptr)`. Expands to an `unsafe fn` call.
#[macro_export]
macro_rules! free {
    ($ptr:expr) => {
        $crate::alloc::global::free_at($ptr, $crate::Location::new(file!(), line!()))
    };
}

/// `exit!(code)`: audit, then exit.
#[macro_export]
macro_rules! exit {
    ($code:expr) => {
        $crate::alloc::global::exit($code)
    };
}
