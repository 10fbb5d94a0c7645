//! CONCLAVE Registry
//!
//! Tracks which members belong to which named pool and hands out each pool's
//! membership history with strict per-pool ordering. A connection layer
//! decodes client requests into calls on [`RegistryService`] and [`Pool`];
//! the registry pushes event batches back to members through a
//! [`PushTransport`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod dissemination;
pub mod error;
pub mod member;
pub mod membership;
pub mod pool;
pub mod service;
pub mod stats;
pub mod transport;

pub use config::{PoolPolicy, RegistryConfig, Topology};
pub use dissemination::{Disseminate, DisseminationQueue, DisseminationWorker};
pub use error::{RegistryError, RegistryResult};
pub use member::{Member, MemberInfo, MemberSummary};
pub use membership::MembershipSet;
pub use pool::{CompactionReport, JoinOutcome, Pool, PoolPhase, PoolSnapshot, PullResult};
pub use service::{ReapReport, RegistryService};
pub use stats::{PoolStats, StatsTable};
pub use transport::{EventBatch, PushTransport, TcpPushTransport, TransportError};
