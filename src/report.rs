//! Diagnostics produced by the tracker and the sinks that receive them.
//!
//! Every policy violation (bad guard band, double free, leak, ...) becomes a
//! [`Diagnostic`]. None of them stop the program; they are handed to a
//! [`Reporter`] and execution carries on, so that one run can surface several
//! independent bugs.

use std::{
    fmt,
    io::{self, Write},
};

use serde::Serialize;

use crate::alloc::registry::{BlockStatus, Origin};

/// An address handed out by (or passed back to) the tracker. Displayed as
/// `0x...` so reports stay greppable across runs.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Addr(pub usize);

impl Addr {
    pub fn of<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    pub const fn get(self) -> usize {
        self.0
    }

    pub const fn as_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#014x}", self.0)
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Where a lifecycle call came from. Purely informational.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Location {
    pub file: &'static str,
    pub line: u32,
}

impl Location {
    pub const fn new(file: &'static str, line: u32) -> Self {
        Self { file, line }
    }

    /// Location of whoever called the `#[track_caller]` function this is
    /// invoked from.
    #[track_caller]
    pub fn caller() -> Self {
        let loc = std::panic::Location::caller();
        Self {
            file: loc.file(),
            line: loc.line(),
        }
    }

    /// Used when the caller could not tell us (C callers passing `NULL`).
    pub const fn unknown() -> Self {
        Self {
            file: "<unknown>",
            line: 0,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, line #{}", self.file, self.line)
    }
}

/// Which lifecycle operation a diagnostic is attributed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Malloc,
    Calloc,
    Realloc,
    Free,
    Exit,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Op::Malloc => "malloc",
            Op::Calloc => "calloc",
            Op::Realloc => "realloc",
            Op::Free => "free",
            Op::Exit => "exit",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// The leading guard band was overwritten. `at` is the corrupted byte
    /// closest to the block, `offset` its distance below the block start and
    /// `bytes` how many guard bytes were hit in total.
    Underrun {
        op: Op,
        block: Addr,
        size: usize,
        at: Addr,
        offset: usize,
        bytes: usize,
        found: u8,
        location: Location,
    },
    /// The trailing guard band was overwritten. `offset` is the distance
    /// past the last usable byte (0 = first byte after the block).
    Overrun {
        op: Op,
        block: Addr,
        size: usize,
        at: Addr,
        offset: usize,
        bytes: usize,
        found: u8,
        location: Location,
    },
    /// A released block was written to before the exit audit. `at` is the
    /// first byte that lost its retired fill, `location` where the block was
    /// allocated.
    UseAfterRelease {
        block: Addr,
        size: usize,
        at: Addr,
        offset: usize,
        bytes: usize,
        found: u8,
        location: Location,
    },
    DoubleRelease {
        block: Addr,
        size: usize,
        location: Location,
    },
    NullRelease {
        location: Location,
    },
    ResizeAfterRelease {
        block: Addr,
        size: usize,
        requested: usize,
        location: Location,
    },
    AllocationFailure {
        op: Op,
        size: usize,
        location: Location,
    },
    Leak {
        block: Addr,
        size: usize,
        origin: Origin,
        location: Location,
    },
    /// Guard corruption found on a leaked block during the exit audit.
    GuardCorruptAtExit {
        block: Addr,
        size: usize,
        at: Addr,
        before_start: bool,
        bytes: usize,
        found: u8,
    },
    Unreferenced {
        block: Addr,
        size: usize,
    },
    /// After the audit the live byte tally does not equal the bytes found
    /// leaked. That is a tracker bug, not a program leak.
    TallyMismatch {
        tally: usize,
        leaked: usize,
    },
    AllDeallocated,
    /// One line of an allocation dump.
    Allocation {
        block: Addr,
        size: usize,
        origin: Origin,
        status: BlockStatus,
        location: Location,
    },
    /// Closing line of an allocation dump.
    AllocationTotal {
        tally: usize,
    },
}

impl Diagnostic {
    /// Whether this diagnostic describes a bug in the host program (as
    /// opposed to the closing "all clear" line).
    pub fn is_problem(&self) -> bool {
        !matches!(
            self,
            Diagnostic::AllDeallocated
                | Diagnostic::Allocation { .. }
                | Diagnostic::AllocationTotal { .. }
        )
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::Underrun {
                op,
                block,
                size,
                at,
                offset,
                bytes,
                found,
                location,
            } => write!(
                f,
                "*** WARNING: {op}: memory under-run detected at {at} \
                 ({offset} bytes before {block}, size: {size}, {bytes} guard bytes hit, \
                 found {found:#04x}): {location}"
            ),
            Diagnostic::Overrun {
                op,
                block,
                size,
                at,
                offset,
                bytes,
                found,
                location,
            } => write!(
                f,
                "*** WARNING: {op}: memory over-run detected at {at} \
                 ({offset} bytes past the end of {block}, size: {size}, {bytes} guard bytes hit, \
                 found {found:#04x}): {location}"
            ),
            Diagnostic::UseAfterRelease {
                block,
                size,
                at,
                offset,
                bytes,
                found,
                location,
            } => write!(
                f,
                "*** WARNING: exit: free'd memory access detected at {at} \
                 (offset {offset} of {block}, size: {size}, {bytes} bytes changed, \
                 found {found:#04x}), allocated at {location}"
            ),
            Diagnostic::DoubleRelease {
                block,
                size,
                location,
            } => write!(
                f,
                "*** WARNING: free: {block} (size: {size}) memory previously free'd: {location}"
            ),
            Diagnostic::NullRelease { location } => {
                write!(f, "*** WARNING: free: received a NULL pointer: {location}")
            }
            Diagnostic::ResizeAfterRelease {
                block,
                size,
                requested,
                location,
            } => write!(
                f,
                "*** WARNING: realloc: {block} (size: {size}) was already free'd, \
                 resize to {requested} ignored: {location}"
            ),
            Diagnostic::AllocationFailure { op, size, location } => write!(
                f,
                "*** WARNING: {op}: failure allocating {size} bytes: {location}"
            ),
            Diagnostic::Leak {
                block,
                size,
                origin,
                location,
            } => write!(
                f,
                "*** WARNING: exit: memory not free'd at {block} (size: {size}, from {origin}): \
                 {location}"
            ),
            Diagnostic::GuardCorruptAtExit {
                block,
                size,
                at,
                before_start,
                bytes,
                found,
            } => write!(
                f,
                "*** WARNING: exit: memory {} detected at {at} on leaked {block} \
                 (size: {size}, {bytes} guard bytes hit, found {found:#04x})",
                if *before_start { "under-run" } else { "over-run" }
            ),
            Diagnostic::Unreferenced { block, size } => write!(
                f,
                "*** WARNING: refs: {block} (size: {size}) is not referenced"
            ),
            Diagnostic::TallyMismatch { tally, leaked } => write!(
                f,
                "*** ERROR: exit: {tally} bytes counted live but {leaked} bytes found leaked \
                 (tracker accounting bug)"
            ),
            Diagnostic::AllDeallocated => f.write_str("All memory de-allocated."),
            Diagnostic::Allocation {
                block,
                size,
                origin,
                status,
                location,
            } => write!(
                f,
                "{block} size: {size} [ {origin} {status:?} ] {location}"
            ),
            Diagnostic::AllocationTotal { tally } => write!(f, "total: {tally}"),
        }
    }
}

/// A sink for diagnostics.
pub trait Reporter {
    fn report(&mut self, diagnostic: &Diagnostic);
}

impl<R> Reporter for &mut R
where
    R: Reporter + ?Sized,
{
    fn report(&mut self, diagnostic: &Diagnostic) {
        (**self).report(diagnostic)
    }
}

/// Writes one line per diagnostic straight to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrReporter;

impl Reporter for StderrReporter {
    fn report(&mut self, diagnostic: &Diagnostic) {
        // Nowhere left to report a failing stderr to.
        let _ = writeln!(io::stderr().lock(), "{diagnostic}");
    }
}

/// Routes diagnostics through the `log` facade at `warn` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&mut self, diagnostic: &Diagnostic) {
        match diagnostic {
            Diagnostic::AllDeallocated
            | Diagnostic::Allocation { .. }
            | Diagnostic::AllocationTotal { .. } => log::info!("{diagnostic}"),
            Diagnostic::TallyMismatch { .. } => log::error!("{diagnostic}"),
            _ => log::warn!("{diagnostic}"),
        }
    }
}

/// Keeps every diagnostic in memory.
#[derive(Debug, Default, Clone)]
pub struct CollectingReporter {
    diagnostics: Vec<Diagnostic>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn take(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    /// Count diagnostics matching `pred`.
    pub fn count<F>(&self, pred: F) -> usize
    where
        F: Fn(&Diagnostic) -> bool,
    {
        self.diagnostics.iter().filter(|d| pred(d)).count()
    }
}

impl Reporter for CollectingReporter {
    fn report(&mut self, diagnostic: &Diagnostic) {
        self.diagnostics.push(diagnostic.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_carry_kind_address_size_and_origin() {
        let line = Diagnostic::Overrun {
            op: Op::Free,
            block: Addr(0x1000),
            size: 4,
            at: Addr(0x1004),
            offset: 0,
            bytes: 1,
            found: b'X',
            location: Location::new("main.rs", 42),
        }
        .to_string();
        assert!(line.contains("over-run"));
        assert!(line.contains("0x000000001004"));
        assert!(line.contains("size: 4"));
        assert!(line.contains("main.rs, line #42"));
    }

    #[test]
    fn caller_location_points_at_call_site() {
        #[track_caller]
        fn here() -> Location {
            Location::caller()
        }
        let loc = here();
        assert!(loc.file.ends_with("report.rs"));
        assert_eq!(loc.line, line!() - 2);
    }

    #[test]
    fn leak_line_names_the_allocation_site() {
        let line = Diagnostic::Leak {
            block: Addr(0x2000),
            size: 3,
            origin: Origin::Calloc,
            location: Location::new("host.c", 17),
        }
        .to_string();
        assert!(line.contains("memory not free'd"));
        assert!(line.contains("from calloc"));
        assert!(line.ends_with("host.c, line #17"));
    }

    #[test]
    fn dump_lines_are_not_problems() {
        assert!(!Diagnostic::AllocationTotal { tally: 4 }.is_problem());
        assert!(Diagnostic::NullRelease {
            location: Location::unknown()
        }
        .is_problem());
    }

    #[test]
    fn diagnostics_serialize_with_kind_tag() {
        let json = serde_json::to_value(Diagnostic::NullRelease {
            location: Location::new("a.rs", 1),
        })
        .unwrap();
        assert_eq!(json["kind"], "null_release");
        assert_eq!(json["location"]["line"], 1);
    }
}
