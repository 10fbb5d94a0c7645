//! Per-pool statistics.
//!
//! Counters are owned by each pool and only read here; they exist for
//! operational visibility and play no part in correctness.

use conclave_core::EventTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Counters and flags of one pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Pool name
    pub name: String,
    /// Current number of members
    pub size: usize,
    /// JOIN events so far
    pub joins: u64,
    /// LEAVE events so far
    pub leaves: u64,
    /// DIED events so far
    pub deaths: u64,
    /// ELECTION events so far
    pub elections: u64,
    /// SIGNAL events so far
    pub signals: u64,
    /// Target size of a closed-world pool
    pub fixed_size: Option<usize>,
    /// No further joins accepted
    pub closed: bool,
    /// Explicitly terminated
    pub terminated: bool,
    /// Ended
    pub ended: bool,
    /// Next event time to be assigned
    pub event_time: EventTime,
    /// Compaction floor
    pub floor: EventTime,
}

/// Printable table of pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsTable(pub Vec<PoolStats>);

impl StatsTable {
    /// Rows of the table
    #[must_use]
    pub fn rows(&self) -> &[PoolStats] {
        &self.0
    }

    /// Sum of all pool sizes
    #[must_use]
    pub fn total_members(&self) -> usize {
        self.0.iter().map(|s| s.size).sum()
    }
}

impl fmt::Display for StatsTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "list of pools:")?;
        writeln!(
            f,
            "     CURRENT_SIZE JOINS LEAVES DIEDS ELECTIONS SIGNALS FIXED_SIZE CLOSED TERMINATED ENDED"
        )?;
        for row in &self.0 {
            let fixed = row
                .fixed_size
                .map_or_else(|| "N.A.".to_string(), |size| size.to_string());
            writeln!(f, "{}", row.name)?;
            writeln!(
                f,
                "     {:>12} {:>5} {:>6} {:>5} {:>9} {:>7} {:>10} {:>6} {:>10} {:>5}",
                row.size,
                row.joins,
                row.leaves,
                row.deaths,
                row.elections,
                row.signals,
                fixed,
                row.closed,
                row.terminated,
                row.ended
            )?;
        }
        Ok(())
    }
}
