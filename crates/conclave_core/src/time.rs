//! Event time for CONCLAVE pools.
//!
//! Every event in a pool carries an [`EventTime`]: a dense counter assigned
//! under the pool's lock, starting at zero. Wall clock time never orders
//! events; it is only used for liveness bookkeeping inside the registry.

use serde::{Deserialize, Serialize};

/// Position of an event in its pool's total order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventTime(u64);

impl EventTime {
    /// The first time a pool hands out
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Create from raw value
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Get raw value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Increment in place
    pub fn increment(&mut self) {
        self.0 += 1;
    }

    /// The time right after this one
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// This time advanced by `n` events
    #[must_use]
    pub const fn advanced_by(&self, n: u64) -> Self {
        Self(self.0.saturating_add(n))
    }

    /// The time right before this one, if any
    #[must_use]
    pub const fn prev(&self) -> Option<Self> {
        match self.0.checked_sub(1) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Number of events in `[self, end)`
    #[must_use]
    pub const fn distance_to(&self, end: EventTime) -> u64 {
        end.0.saturating_sub(self.0)
    }
}

impl Default for EventTime {
    fn default() -> Self {
        Self::zero()
    }
}

impl std::fmt::Display for EventTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "T{}", self.0)
    }
}

impl From<u64> for EventTime {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
