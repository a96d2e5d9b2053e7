//! The allocation interceptor.
//!
//! [`Tracker`] sits between the host and a [`RawHeap`]. Each host block is
//! carved out of a larger system block so it can be surrounded by guard
//! bands (see [`guard`](super::guard)), recorded in a [`BlockRegistry`] and
//! counted in a running tally of live bytes.
//!
//! Frees do not reach the system heap. The block is painted retired and kept
//! until [`Tracker::audit`] so later writes to it can still be seen.

use std::ptr;

use log::debug;

use super::{
    guard::{Band, GuardPainter, ViolationReport},
    heap::{RawHeap, SystemHeap},
    registry::{BlockRecord, BlockRegistry, BlockStatus, Origin, Region},
};
use crate::{
    config::TrackerConfig,
    error::TrackError,
    report::{Addr, Diagnostic, Location, Op, Reporter, StderrReporter},
};

/// What a resize did to the underlying system block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResizeOutcome {
    /// Same base address; the record was updated in place.
    KeptInPlace,
    /// The system heap moved the block. The record for `from` is gone.
    Relocated { from: Addr },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResizeResult {
    /// Resize of a null pointer, which is a plain allocation.
    Allocated(*mut u8),
    /// Resize to zero bytes, which is a release.
    Released,
    Resized {
        ptr: *mut u8,
        outcome: ResizeOutcome,
    },
    /// Nothing changed and the host gets null back; the reason has already
    /// been reported.
    Failed,
}

impl ResizeResult {
    /// The pointer the host should continue with (null when released or
    /// failed, like C `realloc`).
    pub fn ptr(&self) -> *mut u8 {
        match *self {
            ResizeResult::Allocated(ptr) | ResizeResult::Resized { ptr, .. } => ptr,
            ResizeResult::Released | ResizeResult::Failed => ptr::null_mut(),
        }
    }

    pub fn outcome(&self) -> Option<ResizeOutcome> {
        match *self {
            ResizeResult::Resized { outcome, .. } => Some(outcome),
            _ => None,
        }
    }
}

pub struct Tracker<H = SystemHeap, R = StderrReporter> {
    heap: H,
    reporter: R,
    pub(crate) registry: BlockRegistry,
    pub(crate) painter: GuardPainter,
    pub(crate) tally: usize,
    pub(crate) config: TrackerConfig,
}

impl Tracker {
    /// A tracker over the C heap, reporting to stderr.
    pub fn new(config: TrackerConfig) -> Self {
        Self::with_parts(SystemHeap, StderrReporter, config)
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl<H, R> Tracker<H, R>
where
    H: RawHeap,
    R: Reporter,
{
    /// `config` is assumed to be valid (see [`TrackerConfig::validate`]).
    pub fn with_parts(heap: H, reporter: R, config: TrackerConfig) -> Self {
        Self {
            heap,
            reporter,
            registry: BlockRegistry::new(),
            painter: GuardPainter::from_config(&config),
            tally: 0,
            config,
        }
    }

    pub fn registry(&self) -> &BlockRegistry {
        &self.registry
    }

    pub fn painter(&self) -> &GuardPainter {
        &self.painter
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Bytes currently allocated and not yet released by the host.
    pub fn tally(&self) -> usize {
        self.tally
    }

    pub fn reporter(&self) -> &R {
        &self.reporter
    }

    pub fn reporter_mut(&mut self) -> &mut R {
        &mut self.reporter
    }

    pub(crate) fn heap(&self) -> &H {
        &self.heap
    }

    pub(crate) fn report(&mut self, diagnostic: Diagnostic) {
        self.reporter.report(&diagnostic);
    }

    fn trace(&self, op: Op, location: Location, addr: Addr, size: usize) {
        if self.config.verbose {
            debug!(
                "{op}: {location}: {addr}, size: {size}, total: {}",
                self.tally
            );
        }
    }

    #[cold]
    fn allocation_failure(&mut self, op: Op, size: usize, location: Location) -> *mut u8 {
        self.report(Diagnostic::AllocationFailure { op, size, location });
        ptr::null_mut()
    }

    /// Host pointer for the system block at `base`.
    fn usable(&self, base: *mut u8) -> *mut u8 {
        base.wrapping_add(self.painter.offset())
    }

    /// System block behind the host pointer `ptr`.
    fn base(&self, ptr: *mut u8) -> *mut u8 {
        ptr.wrapping_sub(self.painter.offset())
    }

    fn allocate(
        &mut self,
        op: Op,
        origin: Origin,
        size: usize,
        location: Location,
    ) -> Result<*mut u8, TrackError> {
        let Some(total) = size.checked_add(self.painter.padding()) else {
            return Ok(self.allocation_failure(op, size, location));
        };
        let base = match origin {
            Origin::Calloc => self.heap.calloc(total),
            Origin::Malloc | Origin::Realloc => self.heap.malloc(total),
        };
        if base.is_null() {
            return Ok(self.allocation_failure(op, size, location));
        }

        let ptr = self.usable(base);
        if let Err(e) = self
            .registry
            .register(Region::new(Addr::of(ptr), size), origin, location)
        {
            // SAFETY: `base` came from `self.heap` just above
            unsafe { self.heap.free(base) };
            return Err(e);
        }
        // SAFETY: `base` is a fresh system block of `size + padding` bytes
        // and `ptr` sits `offset()` bytes into it
        unsafe {
            self.painter.paint_padding(ptr, size);
            // a cleared block keeps its zeroes
            if origin != Origin::Calloc {
                self.painter.paint_fresh(ptr, size);
            }
        }
        self.tally += size;
        self.trace(op, location, Addr::of(ptr), size);
        Ok(ptr)
    }

    /// `malloc(size)`. Returns null (after reporting) if the system heap
    /// is out of memory.
    pub fn malloc(&mut self, size: usize, location: Location) -> Result<*mut u8, TrackError> {
        self.allocate(Op::Malloc, Origin::Malloc, size, location)
    }

    /// `calloc(count, size)`: a zeroed block of `count * size` bytes.
    pub fn calloc(
        &mut self,
        count: usize,
        size: usize,
        location: Location,
    ) -> Result<*mut u8, TrackError> {
        match count.checked_mul(size) {
            Some(total) => self.allocate(Op::Calloc, Origin::Calloc, total, location),
            None => Ok(self.allocation_failure(Op::Calloc, usize::MAX, location)),
        }
    }

    /// Report guard band damage on the live block at `ptr`, attributed to
    /// `op`.
    fn check_guards(&mut self, op: Op, record: &BlockRecord, location: Location) {
        let (block, size) = (record.start(), record.size());
        // SAFETY: live blocks keep their full system block
        let report: ViolationReport =
            unsafe { self.painter.check_padding(block.as_ptr(), size) };
        if let Some((v, bytes)) = report.nearest(Band::Before) {
            self.report(Diagnostic::Underrun {
                op,
                block,
                size,
                at: v.at,
                offset: v.offset,
                bytes,
                found: v.found,
                location,
            });
        }
        if let Some((v, bytes)) = report.nearest(Band::After) {
            self.report(Diagnostic::Overrun {
                op,
                block,
                size,
                at: v.at,
                offset: v.offset,
                bytes,
                found: v.found,
                location,
            });
        }
    }

    /// `realloc(ptr, size)`.
    ///
    /// - null `ptr` is `malloc(size)`
    /// - `size == 0` is `free(ptr)`
    /// - otherwise the block is resized and its guards repainted; grown
    ///   bytes are painted fresh, cut-off bytes retired
    pub fn resize(
        &mut self,
        ptr: *mut u8,
        size: usize,
        location: Location,
    ) -> Result<ResizeResult, TrackError> {
        if size == 0 {
            if self.config.verbose {
                debug!("realloc() called with 0 size: {location}");
            }
            self.release(Op::Realloc, ptr, location)?;
            return Ok(ResizeResult::Released);
        }
        if ptr.is_null() {
            if self.config.verbose {
                debug!("realloc() called with NULL pointer: {location}");
            }
            let ptr = self.allocate(Op::Realloc, Origin::Realloc, size, location)?;
            return Ok(if ptr.is_null() {
                ResizeResult::Failed
            } else {
                ResizeResult::Allocated(ptr)
            });
        }

        let addr = Addr::of(ptr);
        let record = *self.registry.find_exact(addr)?;
        let old = record.size();
        match record.status {
            BlockStatus::Released => {
                self.report(Diagnostic::ResizeAfterRelease {
                    block: addr,
                    size: old,
                    requested: size,
                    location,
                });
                return Ok(ResizeResult::Failed);
            }
            BlockStatus::Leaked => {
                let result = self.resize_block(ptr, old, size, location)?;
                if let ResizeResult::Resized { ptr: new, .. } = result {
                    self.registry.set_status(Addr::of(new), BlockStatus::Leaked)?;
                }
                return Ok(result);
            }
            BlockStatus::Allocated | BlockStatus::Resized => {}
        }
        let tally = (self.tally.checked_sub(old)).ok_or(TrackError::TallyUnderflow {
            tally: self.tally,
            size: old,
        })? + size;

        // the repaint below would hide anything already there
        self.check_guards(Op::Realloc, &record, location);

        if size < old {
            // SAFETY: `[size, old)` is inside the live block
            unsafe { self.painter.paint_retired(ptr.add(size), old - size) };
        }

        let result = self.resize_block(ptr, old, size, location)?;
        if let ResizeResult::Resized { ptr: new, outcome } = result {
            self.tally = tally;
            self.trace(Op::Realloc, location, Addr::of(new), size);
            if let ResizeOutcome::Relocated { from } = outcome {
                if self.config.verbose {
                    debug!("realloc: {from} moved to {}", Addr::of(new));
                }
            }
        }
        Ok(result)
    }

    /// Resize the system block behind `ptr` and repaint around it. The
    /// record follows the block; the tally is the caller's business.
    fn resize_block(
        &mut self,
        ptr: *mut u8,
        old: usize,
        size: usize,
        location: Location,
    ) -> Result<ResizeResult, TrackError> {
        let Some(total) = size.checked_add(self.painter.padding()) else {
            self.allocation_failure(Op::Realloc, size, location);
            return Ok(ResizeResult::Failed);
        };
        let base = self.base(ptr);
        // SAFETY: `base` is the system block behind `ptr`, which is
        // `old + padding` bytes long and not yet returned to the heap
        let new_base = unsafe { self.heap.realloc(base, old + self.painter.padding(), total) };
        if new_base.is_null() {
            self.allocation_failure(Op::Realloc, size, location);
            return Ok(ResizeResult::Failed);
        }

        let new = self.usable(new_base);
        let outcome = if new_base == base {
            ResizeOutcome::KeptInPlace
        } else {
            ResizeOutcome::Relocated { from: Addr::of(ptr) }
        };
        self.registry
            .update(Addr::of(ptr), Region::new(Addr::of(new), size), location)?;
        // SAFETY: `new_base` is a live system block of `size + padding` bytes
        unsafe {
            self.painter.paint_padding(new, size);
            if size > old {
                self.painter.paint_fresh(new.add(old), size - old);
            }
        }
        Ok(ResizeResult::Resized { ptr: new, outcome })
    }

    /// `realloc(ptr, size)` returning only the new pointer.
    pub fn realloc(
        &mut self,
        ptr: *mut u8,
        size: usize,
        location: Location,
    ) -> Result<*mut u8, TrackError> {
        self.resize(ptr, size, location).map(|r| r.ptr())
    }

    /// `free(ptr)`.
    pub fn free(&mut self, ptr: *mut u8, location: Location) -> Result<(), TrackError> {
        self.release(Op::Free, ptr, location)
    }

    fn release(&mut self, op: Op, ptr: *mut u8, location: Location) -> Result<(), TrackError> {
        if ptr.is_null() {
            self.report(Diagnostic::NullRelease { location });
            return Ok(());
        }
        let addr = Addr::of(ptr);
        let record = *self.registry.find_exact(addr)?;
        let size = record.size();
        match record.status {
            BlockStatus::Released => {
                self.report(Diagnostic::DoubleRelease {
                    block: addr,
                    size,
                    location,
                });
                return Ok(());
            }
            BlockStatus::Leaked => {
                // already reported and uncounted; nothing left to watch
                self.registry.remove(addr)?;
                // SAFETY: a leaked block still owns its whole system block
                unsafe { self.heap.free(self.base(ptr)) };
                self.trace(op, location, addr, size);
                return Ok(());
            }
            BlockStatus::Allocated | BlockStatus::Resized => {}
        }
        let tally = self
            .tally
            .checked_sub(size)
            .ok_or(TrackError::TallyUnderflow {
                tally: self.tally,
                size,
            })?;

        self.check_guards(op, &record, location);
        self.tally = tally;
        // SAFETY: the block is live, so its memory is still ours
        unsafe { self.painter.paint_retired(ptr, size) };
        self.registry.mark_released(addr)?;
        self.trace(op, location, addr, size);
        Ok(())
    }

    /// Size the host asked for when it got `ptr`.
    pub fn size_of_block(&self, ptr: *const u8) -> Result<usize, TrackError> {
        Ok(self.registry.find_exact(Addr::of(ptr))?.size())
    }

    /// `true` iff `[ptr, ptr + len)` lies inside one live block.
    pub fn is_valid(&self, ptr: *const u8, len: usize) -> bool {
        self.registry.is_valid(Addr::of(ptr), len)
    }

    pub fn clear_refs(&mut self) {
        self.registry.clear_refs();
    }

    /// Note that something still points into the block containing `ptr`.
    pub fn note_ref(&mut self, ptr: *const u8) -> Result<(), TrackError> {
        self.registry.note_ref(Addr::of(ptr))
    }

    /// Report every live block not noted since the last
    /// [`clear_refs`](Self::clear_refs). Returns how many there were.
    pub fn check_refs(&mut self) -> usize {
        let missing: Vec<_> = self
            .registry
            .unreferenced()
            .map(|r| Diagnostic::Unreferenced {
                block: r.start(),
                size: r.size(),
            })
            .collect();
        let count = missing.len();
        for diagnostic in missing {
            self.report(diagnostic);
        }
        count
    }

    pub fn allocations(&self) -> Vec<BlockRecord> {
        self.registry.for_each()
    }

    /// Send one [`Diagnostic::Allocation`] per tracked block, then the
    /// tally, to the reporter.
    pub fn report_allocations(&mut self) {
        let lines: Vec<_> = self
            .registry
            .iter()
            .map(|record| Diagnostic::Allocation {
                block: record.start(),
                size: record.size(),
                origin: record.origin,
                status: record.status,
                location: record.location,
            })
            .collect();
        for line in lines {
            self.report(line);
        }
        self.report(Diagnostic::AllocationTotal { tally: self.tally });
    }
}
