//! Address -> block metadata map.
//!
//! Records are keyed by the start of their usable region in a `BTreeMap`, so
//! finding the block an address belongs to is a `range(..=addr).next_back()`
//! followed by a bounds test, rather than a walk over every record.
//!
//! Records stay in the map after the host frees them (status
//! [`BlockStatus::Released`]) because the memory itself is kept until the exit
//! audit, which is also the only thing that physically removes them. The one
//! other way a record leaves is a resize that moves the block.
//!
//! Blocks the audit finds still allocated stay behind as
//! [`BlockStatus::Leaked`]: the host may yet free or resize them (Rust values
//! dropped during process exit do), so their memory is left alone.

use std::{cmp::Ordering, collections::BTreeMap, fmt};

use serde::Serialize;

use crate::{
    error::TrackError,
    report::{Addr, Location},
};

/// The usable bytes `[start, start + size)` handed to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Region {
    pub start: Addr,
    pub size: usize,
}

impl Region {
    pub const fn new(start: Addr, size: usize) -> Self {
        Self { start, size }
    }

    pub const fn end(&self) -> usize {
        self.start.0 + self.size
    }

    /// Where `addr` lies relative to this region. A zero-sized region only
    /// contains its own start address.
    pub fn test_interior(&self, addr: usize) -> Ordering {
        if addr < self.start.0 {
            Ordering::Less
        } else if addr == self.start.0 || addr < self.end() {
            Ordering::Equal
        } else {
            Ordering::Greater
        }
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        if self.size == 0 || other.size == 0 {
            return self.start == other.start;
        }
        self.start.0 < other.end() && other.start.0 < self.end()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    Allocated,
    Resized,
    Released,
    /// Reported as a leak by an audit and no longer counted in the tally.
    /// The host still owns the memory.
    Leaked,
}

impl BlockStatus {
    /// Allocated or resized: owned by the host and counted in the tally.
    pub fn is_live(self) -> bool {
        matches!(self, BlockStatus::Allocated | BlockStatus::Resized)
    }
}

/// How a block came to exist. Only used when reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Malloc,
    Calloc,
    Realloc,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Origin::Malloc => "malloc",
            Origin::Calloc => "calloc",
            Origin::Realloc => "realloc",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BlockRecord {
    pub region: Region,
    pub status: BlockStatus,
    pub origin: Origin,
    /// Call site of the allocation or of the last resize.
    pub location: Location,
    /// Set by [`BlockRegistry::note_ref`], cleared by
    /// [`BlockRegistry::clear_refs`].
    #[serde(skip)]
    pub referenced: bool,
}

impl BlockRecord {
    pub const fn start(&self) -> Addr {
        self.region.start
    }

    pub const fn size(&self) -> usize {
        self.region.size
    }

    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }
}

#[derive(Debug, Default)]
pub struct BlockRegistry {
    blocks: BTreeMap<usize, BlockRecord>,
}

impl BlockRegistry {
    pub const fn new() -> Self {
        Self {
            blocks: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// The tracked region closest below-or-at `addr`, and the first one
    /// strictly above it. Only these two can overlap a region starting at
    /// `addr`, since stored regions are pairwise disjoint.
    fn neighbours(&self, addr: usize) -> [Option<&BlockRecord>; 2] {
        [
            self.blocks.range(..=addr).next_back().map(|(_, r)| r),
            self.blocks
                .range(addr.saturating_add(1)..)
                .next()
                .map(|(_, r)| r),
        ]
    }

    fn check_disjoint(&self, region: Region) -> Result<(), TrackError> {
        for existing in self.neighbours(region.start.0).into_iter().flatten() {
            if existing.region.overlaps(&region) {
                return Err(TrackError::Overlap {
                    start: region.start,
                    size: region.size,
                    existing_start: existing.start(),
                    existing_size: existing.size(),
                });
            }
        }
        Ok(())
    }

    /// Start tracking `region` as freshly allocated.
    pub fn register(
        &mut self,
        region: Region,
        origin: Origin,
        location: Location,
    ) -> Result<&BlockRecord, TrackError> {
        self.check_disjoint(region)?;
        let record = BlockRecord {
            region,
            status: BlockStatus::Allocated,
            origin,
            location,
            referenced: false,
        };
        Ok(&*self.blocks.entry(region.start.0).or_insert(record))
    }

    /// The record (live or released) whose region contains `addr`.
    pub fn find(&self, addr: Addr) -> Result<&BlockRecord, TrackError> {
        match self.blocks.range(..=addr.0).next_back() {
            Some((_, record)) if record.region.test_interior(addr.0) == Ordering::Equal => {
                Ok(record)
            }
            _ => Err(TrackError::NotFound { addr }),
        }
    }

    /// Like [`find`](Self::find), but `addr` must be the start of the block.
    pub fn find_exact(&self, addr: Addr) -> Result<&BlockRecord, TrackError> {
        let record = self.find(addr)?;
        if record.start() != addr {
            return Err(TrackError::NotBlockStart {
                addr,
                start: record.start(),
            });
        }
        Ok(record)
    }

    fn find_exact_mut(&mut self, addr: Addr) -> Result<&mut BlockRecord, TrackError> {
        self.find_exact(addr)?;
        self.blocks
            .get_mut(&addr.0)
            .ok_or(TrackError::NotFound { addr })
    }

    /// Point the record at `old` to `new`. When the block moved this is a
    /// remove + insert, so the new region is checked against every other
    /// block first. The status becomes [`BlockStatus::Resized`], the
    /// location becomes `location` and the origin is kept.
    pub fn update(
        &mut self,
        old: Addr,
        new: Region,
        location: Location,
    ) -> Result<&BlockRecord, TrackError> {
        if old == new.start {
            if let Some(next) = self.neighbours(old.0)[1].filter(|n| n.region.overlaps(&new)) {
                return Err(TrackError::Overlap {
                    start: new.start,
                    size: new.size,
                    existing_start: next.start(),
                    existing_size: next.size(),
                });
            }
            let record = self.find_exact_mut(old)?;
            record.region = new;
            record.status = BlockStatus::Resized;
            record.location = location;
            return self.find_exact(old);
        }
        let previous = self.remove(old)?;
        if let Err(e) = self.check_disjoint(new) {
            self.blocks.insert(old.0, previous);
            return Err(e);
        }
        let record = BlockRecord {
            region: new,
            status: BlockStatus::Resized,
            location,
            ..previous
        };
        Ok(&*self.blocks.entry(new.start.0).or_insert(record))
    }

    /// Flag the block as freed by the host. Returns the previous status.
    pub fn mark_released(&mut self, addr: Addr) -> Result<BlockStatus, TrackError> {
        self.set_status(addr, BlockStatus::Released)
    }

    /// Returns the previous status.
    pub fn set_status(&mut self, addr: Addr, status: BlockStatus) -> Result<BlockStatus, TrackError> {
        let record = self.find_exact_mut(addr)?;
        Ok(std::mem::replace(&mut record.status, status))
    }

    pub fn remove(&mut self, addr: Addr) -> Result<BlockRecord, TrackError> {
        self.find_exact(addr)?;
        self.blocks
            .remove(&addr.0)
            .ok_or(TrackError::NotFound { addr })
    }

    /// A copy of every record in address order. Taking a snapshot lets the
    /// audit remove records while it walks them.
    pub fn for_each(&self) -> Vec<BlockRecord> {
        self.blocks.values().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockRecord> {
        self.blocks.values()
    }

    pub fn clear_refs(&mut self) {
        for record in self.blocks.values_mut() {
            record.referenced = false;
        }
    }

    /// Mark the block containing `addr` as reachable. Interior pointers
    /// count.
    pub fn note_ref(&mut self, addr: Addr) -> Result<(), TrackError> {
        let start = self.find(addr)?.start();
        if let Some(record) = self.blocks.get_mut(&start.0) {
            record.referenced = true;
        }
        Ok(())
    }

    /// Live blocks nobody called [`note_ref`](Self::note_ref) on since the
    /// last [`clear_refs`](Self::clear_refs).
    pub fn unreferenced(&self) -> impl Iterator<Item = &BlockRecord> {
        self.blocks
            .values()
            .filter(|r| r.is_live() && !r.referenced)
    }

    /// `true` iff `[addr, addr + len)` lies entirely inside one live block.
    pub fn is_valid(&self, addr: Addr, len: usize) -> bool {
        match self.find(addr) {
            Ok(record) => {
                record.is_live()
                    && addr
                        .0
                        .checked_add(len)
                        .is_some_and(|end| end <= record.region.end())
            }
            Err(_) => false,
        }
    }
}
