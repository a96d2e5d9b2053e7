//! The classic walkthrough, on an explicit tracker so every diagnostic can be
//! inspected.

use memtrack::{
    alloc::registry::{BlockStatus, Origin},
    Addr, CollectingReporter, Diagnostic, Location, SystemHeap, Tracker,
    TrackerConfig,
};
use pretty_assertions::assert_eq;

#[test]
fn one_report_per_bug() {
    let at = |line| Location::new("scenario.c", line);
    let mut t = Tracker::with_parts(
        SystemHeap,
        CollectingReporter::new(),
        TrackerConfig::default().with_verbose(false),
    );

    let c = [
        t.malloc(1, at(1)).unwrap(),
        t.malloc(1, at(2)).unwrap(),
        t.calloc(1, 1, at(3)).unwrap(),
        t.calloc(1, 1, at(4)).unwrap(),
    ];
    let ints = t.malloc(4 * 1024, at(5)).unwrap() as *mut u32;
    unsafe {
        *c[0] = b'A';
        *c[1].sub(1) = b'X';
    }

    let p = t.malloc(4, at(6)).unwrap();
    unsafe { (p as *mut u32).write_unaligned(0x12345678) };
    let before = t.tally();
    let np = t.realloc(p, 8, at(7)).unwrap();
    assert_eq!(t.tally(), before + 4);
    assert_eq!(t.size_of_block(np), Ok(8));
    assert_eq!(unsafe { (np as *const u32).read_unaligned() }, 0x12345678);

    t.free(ints as *mut u8, at(8)).unwrap();
    unsafe { ints.write(0x12345678) };
    for &p in &c[..3] {
        t.free(p, at(9)).unwrap();
    }
    t.free(np, at(10)).unwrap();
    assert_eq!(t.tally(), 1);

    let summary = t.audit();
    assert_eq!(summary.leaked_bytes(), 1);
    assert!(summary.tally_consistent);

    let d = t.reporter().diagnostics();
    assert_eq!(d.len(), 3, "{d:#?}");
    assert!(matches!(
        d[0],
        Diagnostic::Underrun { block, offset: 1, location, .. }
            if block == Addr::of(c[1]) && location == at(9)
    ));
    assert!(matches!(
        d[1..],
        [
            Diagnostic::UseAfterRelease { bytes: 4, .. } | Diagnostic::Leak { .. },
            Diagnostic::UseAfterRelease { bytes: 4, .. } | Diagnostic::Leak { .. },
        ]
    ));
    assert_eq!(
        t.reporter().count(|d| matches!(
            d,
            Diagnostic::Leak { block, size: 1, origin: Origin::Calloc, location } if *block == Addr::of(c[3]) && *location == at(4)
        )),
        1
    );
    assert_eq!(
        t.reporter()
            .count(|d| matches!(d, Diagnostic::UseAfterRelease { block, .. } if *block == Addr::of(ints))),
        1
    );
    // only the leak is left, and it is no longer counted
    let left: Vec<_> = t.registry().iter().map(|r| (r.start(), r.status)).collect();
    assert_eq!(left, vec![(Addr::of(c[3]), BlockStatus::Leaked)]);
    assert_eq!(t.tally(), 0);
    t.free(c[3], at(11)).unwrap();
    assert!(t.registry().is_empty());
}
