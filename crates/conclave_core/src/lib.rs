//! CONCLAVE Core Types
//!
//! Pure types shared by the event log, the registry, and the server.
//! Nothing in this crate performs I/O.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod id;
pub mod time;

// Re-exports
pub use error::{CoreError, CoreResult};
pub use id::MemberId;
pub use time::EventTime;
