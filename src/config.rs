use std::env;

use crate::{
    alloc::guard::{DEFAULT_PADDING, FRESH_FILL, RETIRED_FILL},
    error::ConfigError,
};

/// Alignment the system `malloc` guarantees on this target.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub const SYSTEM_ALIGN: usize = 16;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub const SYSTEM_ALIGN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Total guard width per block, split evenly before and after it.
    pub padding: usize,
    pub fresh_fill: u8,
    pub retired_fill: u8,
    /// Wait for EOF on stdin before [`exit`](crate::alloc::global::exit) really exits.
    pub pause_on_exit: bool,
    /// Emit the per-call `debug!` trace.
    pub verbose: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            padding: DEFAULT_PADDING,
            fresh_fill: FRESH_FILL,
            retired_fill: RETIRED_FILL,
            pause_on_exit: false,
            verbose: true,
        }
    }
}

impl TrackerConfig {
    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_fills(mut self, fresh: u8, retired: u8) -> Self {
        self.fresh_fill = fresh;
        self.retired_fill = retired;
        self
    }

    pub fn with_pause_on_exit(mut self, pause: bool) -> Self {
        self.pause_on_exit = pause;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.padding == 0 {
            return Err(ConfigError::ZeroPadding);
        }
        if self.padding % 2 != 0 {
            return Err(ConfigError::OddPadding(self.padding));
        }
        if self.fresh_fill == self.retired_fill {
            return Err(ConfigError::SameFill(self.fresh_fill));
        }
        Ok(self)
    }

    /// Defaults overridden by `MEMTRACK_PADDING`, `MEMTRACK_FRESH`,
    /// `MEMTRACK_RETIRED`, `MEMTRACK_PAUSE` and `MEMTRACK_VERBOSE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(value) = lookup("MEMTRACK_PADDING") {
            config.padding = parse_number("MEMTRACK_PADDING", &value)?;
        }
        if let Some(value) = lookup("MEMTRACK_FRESH") {
            config.fresh_fill = parse_number("MEMTRACK_FRESH", &value)?;
        }
        if let Some(value) = lookup("MEMTRACK_RETIRED") {
            config.retired_fill = parse_number("MEMTRACK_RETIRED", &value)?;
        }
        if let Some(value) = lookup("MEMTRACK_PAUSE") {
            config.pause_on_exit = parse_flag("MEMTRACK_PAUSE", &value)?;
        }
        if let Some(value) = lookup("MEMTRACK_VERBOSE") {
            config.verbose = parse_flag("MEMTRACK_VERBOSE", &value)?;
        }
        config.validate()
    }

    /// Largest alignment a guarded block can honour: the usable region sits
    /// `padding / 2` bytes past a `SYSTEM_ALIGN`-aligned base.
    pub fn max_align(&self) -> usize {
        let half = self.padding / 2;
        if half == 0 {
            return SYSTEM_ALIGN;
        }
        SYSTEM_ALIGN.min(1 << half.trailing_zeros())
    }
}

fn parse_number<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: TryFrom<u64>,
{
    let value = value.trim();
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse::<u64>().ok(),
    };
    parsed
        .and_then(|n| T::try_from(n).ok())
        .ok_or_else(|| ConfigError::Parse {
            var,
            value: value.to_owned(),
        })
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Parse {
            var,
            value: value.to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&'static str, &str)]) -> Result<TrackerConfig, ConfigError> {
        let map: HashMap<_, _> = pairs.iter().map(|&(k, v)| (k, v.to_owned())).collect();
        TrackerConfig::from_lookup(|var| map.get(var).cloned())
    }

    #[test]
    fn defaults_match_the_classic_fills() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config, TrackerConfig::default());
        assert_eq!(config.padding, 16);
        assert_eq!(config.fresh_fill, 0xCC);
        assert_eq!(config.retired_fill, 0xDD);
    }

    #[test]
    fn env_overrides() {
        let config = from_pairs(&[
            ("MEMTRACK_PADDING", "32"),
            ("MEMTRACK_FRESH", "0xAB"),
            ("MEMTRACK_PAUSE", "yes"),
            ("MEMTRACK_VERBOSE", "0"),
        ])
        .unwrap();
        assert_eq!(config.padding, 32);
        assert_eq!(config.fresh_fill, 0xAB);
        assert!(config.pause_on_exit);
        assert!(!config.verbose);
    }

    #[test]
    fn rejects_bad_values() {
        assert_eq!(
            from_pairs(&[("MEMTRACK_PADDING", "7")]),
            Err(ConfigError::OddPadding(7))
        );
        assert_eq!(
            from_pairs(&[("MEMTRACK_PADDING", "0")]),
            Err(ConfigError::ZeroPadding)
        );
        assert_eq!(
            from_pairs(&[("MEMTRACK_RETIRED", "0xcc")]),
            Err(ConfigError::SameFill(0xCC))
        );
        assert!(matches!(
            from_pairs(&[("MEMTRACK_FRESH", "300")]),
            Err(ConfigError::Parse { var: "MEMTRACK_FRESH", .. })
        ));
    }

    #[test]
    fn max_align_follows_the_front_band() {
        assert_eq!(TrackerConfig::default().max_align(), 8);
        assert_eq!(TrackerConfig::default().with_padding(64).max_align(), SYSTEM_ALIGN);
        assert_eq!(TrackerConfig::default().with_padding(12).max_align(), 2);
    }
}
