//! Random port allocation.
//!
//! Candidates are drawn uniformly from the pool rather than scanned in order,
//! so concurrent allocators rarely collide and port numbers are not
//! predictable. The attempt budget bounds the work: a crowded pool fails
//! with [`AllocError::NoPortAvailable`] instead of looping.

use std::collections::HashSet;
use std::ops::RangeInclusive;

use rand::RngExt;
use thiserror::Error;

/// Default lowest port handed out to new relays.
pub const DEFAULT_MIN_PORT: u16 = 10_000;
/// Default highest port handed out to new relays.
pub const DEFAULT_MAX_PORT: u16 = 65_535;
/// Default number of random draws before giving up.
pub const DEFAULT_ATTEMPTS: u32 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("no free port found in {min}-{max} after {attempts} attempts")]
    NoPortAvailable { min: u16, max: u16, attempts: u32 },

    #[error("invalid port pool {min}-{max}")]
    InvalidPool { min: u16, max: u16 },
}

impl AllocError {
    /// Short machine-classifiable reason.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NoPortAvailable { .. } => "no_port_available",
            Self::InvalidPool { .. } => "invalid_pool",
        }
    }
}

/// Picks unused ports from an inclusive range.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    min: u16,
    max: u16,
    attempts: u32,
}

impl PortAllocator {
    pub fn new(min: u16, max: u16, attempts: u32) -> Result<Self, AllocError> {
        if min == 0 || min > max {
            return Err(AllocError::InvalidPool { min, max });
        }
        Ok(Self {
            min,
            max,
            attempts: attempts.max(1),
        })
    }

    pub const fn pool(&self) -> RangeInclusive<u16> {
        self.min..=self.max
    }

    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Allocate a port not present in `existing`.
    pub fn allocate(&self, existing: &HashSet<u16>) -> Result<u16, AllocError> {
        self.allocate_with(existing, |_| false)
    }

    /// Allocate a port not present in `existing` and for which `is_taken`
    /// returns `false` (e.g. no directory for it exists yet).
    ///
    /// The result is only a candidate: callers must re-check right before
    /// committing the new record.
    pub fn allocate_with(
        &self,
        existing: &HashSet<u16>,
        is_taken: impl Fn(u16) -> bool,
    ) -> Result<u16, AllocError> {
        let mut rng = rand::rng();
        for attempt in 1..=self.attempts {
            let candidate = rng.random_range(self.min..=self.max);
            if existing.contains(&candidate) || is_taken(candidate) {
                tracing::trace!(candidate, attempt, "port candidate taken");
                continue;
            }
            return Ok(candidate);
        }
        Err(AllocError::NoPortAvailable {
            min: self.min,
            max: self.max,
            attempts: self.attempts,
        })
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self {
            min: DEFAULT_MIN_PORT,
            max: DEFAULT_MAX_PORT,
            attempts: DEFAULT_ATTEMPTS,
        }
    }
}
