//! `memtrack_exit` from a C-style caller: the audit runs, its report lands on
//! stderr and the process exits with the requested status.
#![cfg(debug_assertions)]

mod common;

use std::ffi::c_void;

use memtrack::externc::{memtrack_calloc, memtrack_exit, memtrack_free, memtrack_malloc};
use pretty_assertions::assert_eq;

use common::{is_child, lines_with, run_child};

const BUGGY: &str = "buggy_c_program";

/// Under-run, write after free and a leak, then `exit(3)`.
#[test]
fn buggy_c_program() {
    if !is_child() {
        return;
    }
    let file = c"bug.c".as_ptr();
    unsafe {
        let c = memtrack_malloc(1, file, 10) as *mut u8;
        *c.sub(1) = b'X';
        memtrack_free(c as *mut c_void, file, 11);

        let ints = memtrack_malloc(64, file, 12) as *mut u32;
        memtrack_free(ints as *mut c_void, file, 13);
        ints.write(0x12345678);

        let _leak = memtrack_calloc(1, 1, file, 14);
    }
    memtrack_exit(3)
}

#[test]
fn exit_reports_and_keeps_the_status() {
    if is_child() {
        return;
    }
    let out = run_child(BUGGY, &[]);
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert_eq!(out.status.code(), Some(3), "{stderr}");

    assert_eq!(
        lines_with(&stderr, &["free: memory under-run detected", "bug.c, line #11"]).len(),
        1,
        "{stderr}"
    );
    assert_eq!(
        lines_with(&stderr, &["free'd memory access detected", "allocated at bug.c, line #12"])
            .len(),
        1,
        "{stderr}"
    );
    let leaks = lines_with(&stderr, &["memory not free'd"]);
    assert_eq!(leaks.len(), 1, "{stderr}");
    assert!(leaks[0].ends_with("(size: 1, from calloc): bug.c, line #14"), "{stderr}");
    assert!(!stderr.contains("Press Control-D"), "{stderr}");
    assert!(!stderr.contains("FATAL"), "{stderr}");
}

#[test]
fn exit_pauses_until_stdin_closes() {
    if is_child() {
        return;
    }
    let out = run_child(BUGGY, &[("MEMTRACK_PAUSE", "1")]);
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert_eq!(out.status.code(), Some(3), "{stderr}");
    assert!(stderr.contains("Press Control-D"), "{stderr}");
    // the prompt follows the audit
    let leak = stderr.find("memory not free'd").expect("leak line");
    assert!(leak < stderr.find("Press Control-D").unwrap(), "{stderr}");
}
