//! Byte painting around and inside tracked blocks.
//!
//! Every block is allocated `padding` bytes larger than requested, and the
//! usable region sits in the middle of it:
//!
//! ```plaintext
//! +--------------------+  <- base returned by the system heap
//! | padding / 2 bytes  |  painted `fresh`; anything else is an under-run
//! +--------------------+  <- address handed to the host
//! | usable region      |  `fresh` after malloc, `retired` after free
//! +--------------------+
//! | padding / 2 bytes  |  painted `fresh`; anything else is an over-run
//! +--------------------+
//! ```
//!
//! All checks only read, and report every mismatching byte rather than
//! stopping at the first.

use std::{ptr, slice};

use crate::{config::TrackerConfig, report::Addr};

/// Fill for memory that is allocated but not yet written by the host.
pub const FRESH_FILL: u8 = 0xCC;
/// Fill for memory the host has released.
pub const RETIRED_FILL: u8 = 0xDD;
/// Default total guard width, split evenly before and after the block.
pub const DEFAULT_PADDING: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Band {
    /// Guard band below the block start.
    Before,
    /// Guard band past the block end.
    After,
    /// The usable region of a released block.
    Body,
}

/// A single byte that does not hold the fill it should.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Violation {
    pub band: Band,
    pub at: Addr,
    /// For [`Band::Before`], distance below the block start (1 = the byte
    /// just before). For [`Band::After`], distance past the end (0 = the
    /// byte just after). For [`Band::Body`], offset from the block start.
    pub offset: usize,
    pub found: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ViolationReport {
    violations: Vec<Violation>,
}

impl ViolationReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.violations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter()
    }

    pub fn in_band(&self, band: Band) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(move |v| v.band == band)
    }

    /// The violation in `band` closest to the block, with the number of
    /// violations in that band.
    pub fn nearest(&self, band: Band) -> Option<(Violation, usize)> {
        let nearest = self.in_band(band).min_by_key(|v| v.offset)?;
        Some((*nearest, self.in_band(band).count()))
    }
}

impl IntoIterator for ViolationReport {
    type Item = Violation;
    type IntoIter = std::vec::IntoIter<Violation>;

    fn into_iter(self) -> Self::IntoIter {
        self.violations.into_iter()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuardPainter {
    fresh: u8,
    retired: u8,
    half: usize,
}

impl Default for GuardPainter {
    fn default() -> Self {
        Self::new(FRESH_FILL, RETIRED_FILL, DEFAULT_PADDING)
    }
}

impl GuardPainter {
    /// `padding` is the total guard width; callers validate it is even.
    pub const fn new(fresh: u8, retired: u8, padding: usize) -> Self {
        Self {
            fresh,
            retired,
            half: padding / 2,
        }
    }

    pub fn from_config(config: &TrackerConfig) -> Self {
        Self::new(config.fresh_fill, config.retired_fill, config.padding)
    }

    pub const fn fresh(&self) -> u8 {
        self.fresh
    }

    pub const fn retired(&self) -> u8 {
        self.retired
    }

    /// Total guard width added to every block.
    pub const fn padding(&self) -> usize {
        self.half * 2
    }

    /// Offset of the usable region from the base of the system block.
    pub const fn offset(&self) -> usize {
        self.half
    }

    /// # Safety
    ///
    /// `[start, start + len)` must be writable.
    pub unsafe fn paint_fresh(&self, start: *mut u8, len: usize) {
        unsafe { ptr::write_bytes(start, self.fresh, len) }
    }

    /// # Safety
    ///
    /// `[start, start + len)` must be writable.
    pub unsafe fn paint_retired(&self, start: *mut u8, len: usize) {
        unsafe { ptr::write_bytes(start, self.retired, len) }
    }

    /// Paint both guard bands of the block at `start`.
    ///
    /// # Safety
    ///
    /// `start` must be `offset()` bytes into a writable system block of at
    /// least `size + padding()` bytes.
    pub unsafe fn paint_padding(&self, start: *mut u8, size: usize) {
        unsafe {
            self.paint_fresh(start.sub(self.half), self.half);
            self.paint_fresh(start.add(size), self.half);
        }
    }

    /// Re-read both guard bands of the block at `start`.
    ///
    /// # Safety
    ///
    /// Same layout requirement as [`paint_padding`](Self::paint_padding), and
    /// the bands must be readable.
    pub unsafe fn check_padding(&self, start: *const u8, size: usize) -> ViolationReport {
        let mut report = ViolationReport::default();
        // SAFETY: caller guarantees `half` readable bytes on each side
        let before = unsafe { slice::from_raw_parts(start.sub(self.half), self.half) };
        let after = unsafe { slice::from_raw_parts(start.add(size), self.half) };

        for (i, &found) in before.iter().enumerate() {
            if found != self.fresh {
                report.violations.push(Violation {
                    band: Band::Before,
                    at: Addr::of(before.as_ptr().wrapping_add(i)),
                    offset: self.half - i,
                    found,
                });
            }
        }
        for (i, &found) in after.iter().enumerate() {
            if found != self.fresh {
                report.violations.push(Violation {
                    band: Band::After,
                    at: Addr::of(after.as_ptr().wrapping_add(i)),
                    offset: i,
                    found,
                });
            }
        }
        report
    }

    /// Re-read a released block's usable region.
    ///
    /// # Safety
    ///
    /// `[start, start + size)` must be readable.
    pub unsafe fn check_retired(&self, start: *const u8, size: usize) -> ViolationReport {
        let body = unsafe { slice::from_raw_parts(start, size) };
        let violations = body
            .iter()
            .enumerate()
            .filter(|(_, &found)| found != self.retired)
            .map(|(i, &found)| Violation {
                band: Band::Body,
                at: Addr::of(start.wrapping_add(i)),
                offset: i,
                found,
            })
            .collect();
        ViolationReport { violations }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A block laid out the way the tracker lays it out, backed by a `Vec`.
    struct Guarded {
        buf: Vec<u8>,
        size: usize,
        painter: GuardPainter,
    }

    impl Guarded {
        fn new(size: usize) -> Self {
            let painter = GuardPainter::default();
            let mut buf = vec![0u8; size + painter.padding()];
            let p = Self::start_in(&mut buf, &painter);
            unsafe {
                painter.paint_padding(p, size);
                painter.paint_fresh(p, size);
            }
            Self { buf, size, painter }
        }

        fn start_in(buf: &mut [u8], painter: &GuardPainter) -> *mut u8 {
            unsafe { buf.as_mut_ptr().add(painter.offset()) }
        }

        fn start(&mut self) -> *mut u8 {
            Self::start_in(&mut self.buf, &self.painter)
        }

        fn check(&mut self) -> ViolationReport {
            let (p, size) = (self.start(), self.size);
            unsafe { self.painter.check_padding(p, size) }
        }
    }

    #[test]
    fn untouched_block_is_clean() {
        let mut g = Guarded::new(12);
        assert!(g.check().is_clean());
        assert!(g.buf.iter().all(|&b| b == FRESH_FILL));
    }

    #[test]
    fn byte_before_start_is_an_underrun() {
        let mut g = Guarded::new(1);
        unsafe { *g.start().sub(1) = b'X' };
        let report = g.check();
        let v: Vec<_> = report.iter().copied().collect();
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].band, Band::Before);
        assert_eq!(v[0].offset, 1);
        assert_eq!(v[0].found, b'X');
        assert_eq!(v[0].at, Addr::of(unsafe { g.start().sub(1) }));
    }

    #[test]
    fn byte_past_end_is_an_overrun() {
        let mut g = Guarded::new(4);
        unsafe { *g.start().add(4) = 0 };
        let report = g.check();
        assert_eq!(report.in_band(Band::After).count(), 1);
        assert_eq!(report.in_band(Band::Before).count(), 0);
        assert_eq!(report.iter().next().unwrap().offset, 0);
    }

    #[test]
    fn every_corrupted_byte_is_reported() {
        let mut g = Guarded::new(4);
        unsafe {
            ptr::write_bytes(g.start().sub(3), 0, 3);
            ptr::write_bytes(g.start().add(4), 0, 2);
        }
        let report = g.check();
        assert_eq!(report.in_band(Band::Before).count(), 3);
        assert_eq!(report.in_band(Band::After).count(), 2);
    }

    #[test]
    fn writes_inside_the_block_are_not_guard_violations() {
        let mut g = Guarded::new(8);
        unsafe { ptr::write_bytes(g.start(), 0x11, 8) };
        assert!(g.check().is_clean());
    }

    #[test]
    fn retired_body_check() {
        let mut g = Guarded::new(8);
        let p = g.start();
        unsafe {
            g.painter.paint_retired(p, 8);
            assert!(g.painter.check_retired(p, 8).is_clean());
            *p.add(2) = 0x78;
            *p.add(5) = 0x56;
            let report = g.painter.check_retired(p, 8);
            let offsets: Vec<_> = report.iter().map(|v| v.offset).collect();
            assert_eq!(offsets, vec![2, 5]);
        }
    }
}
