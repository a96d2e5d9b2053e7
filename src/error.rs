use thiserror::Error;

use crate::report::Addr;

/// A breach of the tracker's own bookkeeping. Once one of these is seen the
/// registry can no longer be trusted, so the process-wide surface aborts on
/// them (see [`crate::alloc::global::fatal`]).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TrackError {
    #[error("region {start} ({size} bytes) overlaps tracked block {existing_start} ({existing_size} bytes)")]
    Overlap {
        start: Addr,
        size: usize,
        existing_start: Addr,
        existing_size: usize,
    },

    #[error("{addr} was never returned by this tracker")]
    NotFound { addr: Addr },

    #[error("{addr} points inside the block starting at {start}, not at its start")]
    NotBlockStart { addr: Addr, start: Addr },

    #[error("live byte tally {tally} would go negative removing {size} bytes")]
    TallyUnderflow { tally: usize, size: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("guard padding must be non-zero")]
    ZeroPadding,

    #[error("guard padding must be even, got {0}")]
    OddPadding(usize),

    #[error("fresh and retired fills must differ (both {0:#04x})")]
    SameFill(u8),

    #[error("could not parse {var}={value:?}")]
    Parse { var: &'static str, value: String },
}
