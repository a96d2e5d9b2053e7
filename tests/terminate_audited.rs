//! `memtrack::exit` with `AuditedAlloc` installed. Blocks the audit reports
//! as leaked are still freed by process teardown, and must not trip the
//! tracker on the way out.
#![cfg(debug_assertions)]

mod common;

use memtrack::AuditedAlloc;
use pretty_assertions::assert_eq;

use common::{is_child, lines_with, run_child};

#[global_allocator]
static GLOBAL: AuditedAlloc = AuditedAlloc;

#[test]
fn buggy_rust_program() {
    if !is_child() {
        return;
    }
    let names: Vec<String> = (0..4).map(|i| format!("block {i}")).collect();
    println!("{}", names.join(", "));

    unsafe {
        let c = memtrack::malloc!(1);
        *c.sub(1) = b'X';
        memtrack::free!(c);

        let ints = memtrack::malloc!(64) as *mut u32;
        memtrack::free!(ints as *mut u8);
        ints.write(0x12345678);
    }
    let _leak = memtrack::calloc!(1, 1);
    memtrack::exit(3)
}

#[test]
fn exit_survives_teardown_after_the_audit() {
    if is_child() {
        return;
    }
    let out = run_child("buggy_rust_program", &[]);
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert_eq!(out.status.code(), Some(3), "{stderr}");
    assert!(
        String::from_utf8_lossy(&out.stdout).contains("block 0, block 1, block 2, block 3"),
        "{stderr}"
    );

    let file = file!();
    assert_eq!(
        lines_with(&stderr, &["free: memory under-run detected", file]).len(),
        1,
        "{stderr}"
    );
    assert_eq!(
        lines_with(&stderr, &["free'd memory access detected", file]).len(),
        1,
        "{stderr}"
    );
    // the test harness leaks too, but only one leak comes from here
    assert_eq!(
        lines_with(&stderr, &["memory not free'd", "(size: 1, from calloc)", file]).len(),
        1,
        "{stderr}"
    );
    assert!(!stderr.contains("FATAL"), "{stderr}");
    assert!(!stderr.contains("*** ERROR"), "{stderr}");
}
