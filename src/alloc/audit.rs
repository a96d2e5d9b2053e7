//! The exit audit: the last look at every block before the process ends.

use std::{
    fs::File,
    io::{self, Write},
    path::Path,
};

use log::{debug, info};
use serde::Serialize;

use super::{
    guard::Band,
    heap::RawHeap,
    registry::{BlockRecord, BlockStatus, Region},
    tracker::Tracker,
};
use crate::report::{Addr, Diagnostic, Reporter};

/// What [`Tracker::audit`] found.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct AuditSummary {
    /// Records examined by this audit.
    pub inspected: usize,
    /// Blocks the host never released. They are left allocated.
    pub leaks: Vec<Region>,
    /// Released blocks that were written to afterwards.
    pub used_after_release: Vec<Addr>,
    /// Leaked blocks whose guard bands were damaged.
    pub guard_corrupted: Vec<Addr>,
    /// Live byte tally when the audit finished walking the records.
    pub final_tally: usize,
    /// `false` if the tally disagreed with the leaked bytes.
    pub tally_consistent: bool,
}

impl AuditSummary {
    pub fn leaked_bytes(&self) -> usize {
        self.leaks.iter().map(|r| r.size).sum()
    }

    /// No leaks, no corruption and a consistent tally.
    pub fn is_clean(&self) -> bool {
        self.leaks.is_empty()
            && self.used_after_release.is_empty()
            && self.guard_corrupted.is_empty()
            && self.tally_consistent
    }

    /// Dump the summary as JSON.
    pub fn write_to_file<P>(&self, path: P) -> io::Result<()>
    where
        P: AsRef<Path>,
    {
        let mut file = File::create(path)?;
        serde_json::to_writer_pretty(&mut file, self)?;
        file.write_all(b"\n")?;
        Ok(())
    }
}

impl<H, R> Tracker<H, R>
where
    H: RawHeap,
    R: Reporter,
{
    fn audit_live(&mut self, record: &BlockRecord, summary: &mut AuditSummary) {
        let (block, size) = (record.start(), record.size());
        self.report(Diagnostic::Leak {
            block,
            size,
            origin: record.origin,
            location: record.location,
        });
        summary.leaks.push(record.region);

        // SAFETY: a live block still owns its whole system block
        let guards = unsafe { self.painter.check_padding(block.as_ptr(), size) };
        let mut corrupt = false;
        for (band, before_start) in [(Band::Before, true), (Band::After, false)] {
            if let Some((v, bytes)) = guards.nearest(band) {
                corrupt = true;
                self.report(Diagnostic::GuardCorruptAtExit {
                    block,
                    size,
                    at: v.at,
                    before_start,
                    bytes,
                    found: v.found,
                });
            }
        }
        if corrupt {
            summary.guard_corrupted.push(block);
        }
    }

    fn audit_released(&mut self, record: &BlockRecord, summary: &mut AuditSummary) {
        let (block, size) = (record.start(), record.size());
        // SAFETY: released blocks are not handed back to the system heap
        // before this point
        let body = unsafe { self.painter.check_retired(block.as_ptr(), size) };
        if let Some((v, bytes)) = body.nearest(Band::Body) {
            self.report(Diagnostic::UseAfterRelease {
                block,
                size,
                at: v.at,
                offset: v.offset,
                bytes,
                found: v.found,
                location: record.location,
            });
            summary.used_after_release.push(block);
        }
    }

    /// Walk every remaining record and report leaks and posthumous writes.
    ///
    /// Released blocks go back to the system heap and are forgotten. Blocks
    /// still allocated are reported once and marked
    /// [`Leaked`](BlockStatus::Leaked): their memory stays with the host,
    /// which may still free or resize it, and later audits skip them.
    ///
    /// Leaked bytes stay in the tally, so after the walk the tally must
    /// equal the leaked total; anything else is reported as
    /// [`Diagnostic::TallyMismatch`]. The tally is zero afterwards.
    pub fn audit(&mut self) -> AuditSummary {
        let mut summary = AuditSummary::default();

        for record in self.registry.for_each() {
            match record.status {
                BlockStatus::Leaked => continue,
                BlockStatus::Allocated | BlockStatus::Resized => {
                    summary.inspected += 1;
                    self.audit_live(&record, &mut summary);
                    if self
                        .registry
                        .set_status(record.start(), BlockStatus::Leaked)
                        .is_err()
                    {
                        debug!("audit: {} vanished mid-walk", record.start());
                    }
                }
                BlockStatus::Released => {
                    summary.inspected += 1;
                    self.audit_released(&record, &mut summary);
                    let base = record.start().as_ptr().wrapping_sub(self.painter.offset());
                    // SAFETY: every record owns exactly one system block,
                    // starting `offset()` bytes before the host pointer, and a
                    // released one is freed once here before it goes away
                    unsafe { self.heap().free(base) };
                    if self.registry.remove(record.start()).is_err() {
                        debug!("audit: {} vanished mid-walk", record.start());
                    }
                }
            }
        }

        let leaked = summary.leaked_bytes();
        summary.final_tally = self.tally;
        summary.tally_consistent = self.tally == leaked;
        if !summary.tally_consistent {
            self.report(Diagnostic::TallyMismatch {
                tally: self.tally,
                leaked,
            });
        } else if summary.leaks.is_empty() {
            self.report(Diagnostic::AllDeallocated);
        }
        self.tally = 0;

        info!(
            "audit: {} blocks inspected, {} leaked ({} bytes), {} used after free",
            summary.inspected,
            summary.leaks.len(),
            leaked,
            summary.used_after_release.len()
        );
        summary
    }

    /// Audit, then wait for the user if the configuration asks for it.
    pub fn shutdown(&mut self) -> AuditSummary {
        let summary = self.audit();
        if self.config.pause_on_exit {
            pause();
        }
        summary
    }

    /// [`shutdown`](Self::shutdown), then exit the process with `code`.
    pub fn terminate(&mut self, code: i32) -> ! {
        self.shutdown();
        std::process::exit(code)
    }
}

/// Hold the process open until stdin closes.
fn pause() {
    let _ = writeln!(io::stderr(), "\nPress Control-D (Control-Z on Windows) to exit.");
    // Errors just mean there is nothing to wait on.
    let _ = io::copy(&mut io::stdin().lock(), &mut io::sink());
}
