//! Logger setup for binaries that want the allocation trace.

use std::sync::Once;

use env_logger::{Builder, Env};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "memtrack=warn";

static INIT: Once = Once::new();

/// Install `env_logger` as the `log` backend. Safe to call more than once;
/// only the first call does anything, and a logger installed by someone else
/// is left alone.
pub fn init() {
    INIT.call_once(|| {
        let _ = Builder::from_env(Env::default().default_filter_or(DEFAULT_FILTER))
            .format_timestamp(None)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_is_fine() {
        init();
        init();
        log::debug!("still alive");
    }
}
