//! The process-wide tracker behind `memtrack::malloc` and friends. Only
//! tracks with debug assertions on.
#![cfg(debug_assertions)]

use memtrack::{alloc::registry::Region, Addr, TrackError};
use serial_test::serial;

/// Start from an empty tracker.
fn reset() {
    memtrack::audit();
}

#[test]
#[serial]
fn malloc_then_free_audits_clean() {
    reset();
    let p = memtrack::malloc(32);
    assert!(!p.is_null());
    assert_eq!(memtrack::tally(), 32);
    assert_eq!(memtrack::with_tracker(|t| t.size_of_block(p)), Some(Ok(32)));

    unsafe { memtrack::free(p) };
    assert_eq!(memtrack::tally(), 0);

    let summary = memtrack::audit().unwrap();
    assert!(summary.is_clean());
    assert_eq!(summary.inspected, 1);
}

#[test]
#[serial]
fn macros_track_resizes() {
    reset();
    let p = memtrack::malloc!(8);
    unsafe { p.copy_from_nonoverlapping(b"12345678".as_ptr(), 8) };
    let q = unsafe { memtrack::realloc!(p, 64) };
    assert_eq!(memtrack::with_tracker(|t| t.size_of_block(q)), Some(Ok(64)));
    assert_eq!(unsafe { std::slice::from_raw_parts(q, 8) }, b"12345678");
    assert_eq!(memtrack::tally(), 64);

    unsafe { memtrack::free!(q) };
    assert!(memtrack::audit().unwrap().is_clean());
}

#[test]
#[serial]
fn unreleased_calloc_is_a_leak() {
    reset();
    let p = memtrack::calloc(4, 4);
    let body = unsafe { std::slice::from_raw_parts(p, 16) };
    assert!(body.iter().all(|&b| b == 0));

    let summary = memtrack::audit().unwrap();
    assert_eq!(summary.leaks, vec![Region::new(Addr::of(p), 16)]);
    assert_eq!(summary.final_tally, 16);
    assert!(summary.tally_consistent);
    assert_eq!(memtrack::tally(), 0);
}

#[test]
#[serial]
fn write_after_free_shows_up_in_the_audit() {
    reset();
    let p = memtrack::malloc(64);
    unsafe {
        memtrack::free(p);
        *p.add(10) = 0;
    }
    let summary = memtrack::audit().unwrap();
    assert_eq!(summary.used_after_release, vec![Addr::of(p)]);
    assert!(summary.leaks.is_empty());
}

#[test]
#[serial]
fn interior_pointer_is_refused_by_the_registry() {
    reset();
    let p = memtrack::malloc(16);
    let inner = unsafe { p.add(4) };
    assert_eq!(
        memtrack::with_tracker(|t| t.size_of_block(inner)),
        Some(Err(TrackError::NotBlockStart {
            addr: Addr::of(inner),
            start: Addr::of(p),
        }))
    );
    unsafe { memtrack::free(p) };
    reset();
}

#[test]
#[serial]
fn nested_access_is_refused() {
    let nested = memtrack::with_tracker(|_| memtrack::with_tracker(|_| ()));
    assert_eq!(nested, Some(None));
    assert_eq!(memtrack::with_tracker(|_| 1), Some(1));
}
