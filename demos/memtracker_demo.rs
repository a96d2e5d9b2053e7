//! Walks through every kind of mistake the tracker catches.
//!
//! ```sh
//! RUST_LOG=memtrack=debug cargo run --example memtracker_demo
//! ```
//!
//! Expected on stderr: one under-run, one over-run, one double free, a write
//! after free found at exit, and one leaked byte.

use std::mem::size_of;

use memtrack::{calloc, exit, free, malloc, realloc};

#[allow(dead_code)]
#[repr(C)]
struct Test {
    c: u8,
    i: i32,
    d: f64,
}

fn main() {
    memtrack::logging::init();

    let chars = [malloc!(1), malloc!(1), calloc!(1, 1), calloc!(1, 1)];
    let ints = malloc!(size_of::<i32>() * 1024) as *mut i32;
    let test = malloc!(size_of::<Test>()) as *mut Test;

    unsafe {
        *chars[0] = b'A';
        // one byte before the block: under-run
        *chars[1].sub(1) = b'X';
        // one byte past the block: over-run
        *chars[2].add(1) = b'X';

        test.write(Test {
            c: b'c',
            i: 1,
            d: 2.0,
        });
    }

    let p = malloc!(size_of::<u32>()) as *mut u32;
    unsafe { p.write(0x12345678) };
    let np = unsafe { realloc!(p as *mut u8, 2 * size_of::<u32>()) };

    memtrack::report_allocations();

    unsafe {
        free!(ints as *mut u8);
        // write after free, reported at exit
        ints.write(0x12345678);
        free!(test as *mut u8);
        free!(chars[0]);
        free!(chars[0]);
        free!(chars[1]);
        free!(chars[2]);
        // chars[3] is leaked
        free!(np);
    }

    exit!(0);
}
