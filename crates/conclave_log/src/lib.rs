//! CONCLAVE Event Log
//!
//! Immutable membership, election, and signal events, and the per-pool log
//! that orders them. A pool's log is totally ordered by [`EventTime`] and
//! only ever hands out contiguous runs of events.
//!
//! [`EventTime`]: conclave_core::EventTime

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod event;
pub mod log;

pub use event::{Event, EventKind};
pub use log::{EventLog, LogError};
