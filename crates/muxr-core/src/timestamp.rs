//! Wall-clock timestamp with microsecond resolution.
//!
//! Poll completion times are stamped with this and handed to read
//! callbacks, so receive-time accounting costs one clock read per cycle.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub const MICROS_PER_SECOND: u64 = 1_000_000;

/// Microseconds since the Unix epoch. `0` means "invalid / not yet set".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        Self(micros)
    }

    pub const fn invalid() -> Self {
        Self(0)
    }

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub const fn micros(&self) -> u64 {
        self.0
    }

    pub const fn is_valid(&self) -> bool {
        self.0 > 0
    }

    /// Microseconds elapsed from `earlier` to `self` (saturating).
    pub fn micros_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:06}",
            self.0 / MICROS_PER_SECOND,
            self.0 % MICROS_PER_SECOND
        )
    }
}
