//! Engine configuration.
//!
//! Sizing knobs are read from the environment once, when an [`Engine`] is
//! built, or loaded by the embedder from its own configuration files:
//! - `FRANKENSTREAM_BUFSIZE`: default stream buffer size (BUFSIZ, 8192).
//! - `FRANKENSTREAM_GRAIN`: rounding unit for reserve buffers (1024).
//! - `FRANKENSTREAM_MAP_UNITS`: mapped-window unit count; held-back byte
//!   restores beyond `4 * map_units` disable mapping for the stream (4).
//!
//! [`Engine`]: crate::Engine

use serde::{Deserialize, Serialize};

/// Default buffer size (POSIX BUFSIZ).
pub const BUFSIZ: usize = 8192;

/// Default reserve-buffer grain.
pub const GRAIN: usize = 1024;

/// Default number of map units per mapped window.
pub const MAP_UNITS: u32 = 4;

/// Size of the inline fallback buffer used by unbuffered streams in read mode.
pub const TINY_SIZE: usize = 1;

/// Sizing configuration shared by every stream of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Buffer size handed to streams by the default sizing policy.
    pub buffer_size: usize,
    /// Reserve-buffer rounding unit; always at least 1.
    pub grain: usize,
    /// Map units per mapped window.
    pub map_units: u32,
    /// Inline fallback buffer size.
    pub tiny_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_size: BUFSIZ,
            grain: GRAIN,
            map_units: MAP_UNITS,
            tiny_size: TINY_SIZE,
        }
    }
}

impl EngineConfig {
    /// Read overrides from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through `lookup`; missing, zero, or malformed values
    /// keep their defaults.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(v) = parse_positive(lookup("FRANKENSTREAM_BUFSIZE")) {
            config.buffer_size = v;
        }
        if let Some(v) = parse_positive(lookup("FRANKENSTREAM_GRAIN")) {
            config.grain = v;
        }
        if let Some(v) = parse_positive(lookup("FRANKENSTREAM_MAP_UNITS")) {
            config.map_units = u32::try_from(v).unwrap_or(MAP_UNITS);
        }
        config
    }

    /// Number of held-back byte restores a mapped stream tolerates.
    #[must_use]
    pub const fn getr_threshold(&self) -> u32 {
        self.map_units.saturating_mul(4)
    }

    /// Round `size` up to a multiple of the grain.
    #[must_use]
    pub const fn round_to_grain(&self, size: usize) -> usize {
        let grain = if self.grain == 0 { 1 } else { self.grain };
        size.div_ceil(grain).saturating_mul(grain)
    }
}

fn parse_positive(raw: Option<String>) -> Option<usize> {
    raw?.trim().parse::<usize>().ok().filter(|v| *v > 0)
}
