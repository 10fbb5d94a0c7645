//! Registry errors.

use conclave_core::{CoreError, EventTime, MemberId};

/// Registry result type
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors returned synchronously to the connection layer
///
/// None of these are retried by the registry itself. Push failures never
/// show up here; they are recovered internally by re-dissemination.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No pool with this name
    #[error("pool not found: {0}")]
    PoolNotFound(String),

    /// The member is not (or no longer) part of the pool
    #[error("member {member} not found in pool {pool}")]
    MemberNotFound {
        /// Pool name
        pool: String,
        /// Member that was looked up
        member: MemberId,
    },

    /// The pool has ended and accepts no further changes
    #[error("pool {0} is closed")]
    PoolClosed(String),

    /// A closed-world pool already reached its target size
    #[error("pool {0} is complete")]
    PoolComplete(String),

    /// The requested history is gone; the member must rejoin and rebuild
    /// its state from a snapshot
    #[error("pool {pool}: history before {floor} purged (requested {requested}), resynchronize")]
    Resynchronize {
        /// Pool name
        pool: String,
        /// First time the member asked for
        requested: EventTime,
        /// Oldest time still held
        floor: EventTime,
    },

    /// The registry no longer accepts new pools
    #[error("registry is shutting down")]
    ShuttingDown,

    /// Invalid argument
    #[error(transparent)]
    Invalid(#[from] CoreError),
}

impl RegistryError {
    /// Whether the error means "no such pool or member"
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::PoolNotFound(_) | Self::MemberNotFound { .. })
    }
}
