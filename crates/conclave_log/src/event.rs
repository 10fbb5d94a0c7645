//! Event types for the pool event log.
//!
//! Events are immutable once appended; every observer of a pool sees the
//! same event at the same time.

use conclave_core::{EventTime, MemberId};
use serde::{Deserialize, Serialize};

/// Event kind - type of event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A member joined
    Join,
    /// A member left voluntarily
    Leave,
    /// A member was declared dead
    Died,
    /// An election was decided
    Election,
    /// An application-level signal
    Signal,
    /// A closed-world pool reached its target size
    PoolClosed,
    /// The pool was explicitly terminated
    PoolTerminated,
}

impl EventKind {
    /// Number of event kinds, for per-kind counters
    pub const COUNT: usize = 7;

    /// All kinds, in declaration order
    pub const ALL: [EventKind; Self::COUNT] = [
        Self::Join,
        Self::Leave,
        Self::Died,
        Self::Election,
        Self::Signal,
        Self::PoolClosed,
        Self::PoolTerminated,
    ];

    /// Dense index of this kind
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Whether this kind changes the member set
    #[must_use]
    pub const fn is_membership_change(self) -> bool {
        matches!(self, Self::Join | Self::Leave | Self::Died)
    }

    /// Whether this kind removes a member
    #[must_use]
    pub const fn is_departure(self) -> bool {
        matches!(self, Self::Leave | Self::Died)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Join => "JOIN",
            Self::Leave => "LEAVE",
            Self::Died => "DIED",
            Self::Election => "ELECTION",
            Self::Signal => "SIGNAL",
            Self::PoolClosed => "POOL_CLOSED",
            Self::PoolTerminated => "POOL_TERMINATED",
        };
        f.write_str(name)
    }
}

/// A pool event
///
/// `label` carries the member name for joins, the election name for
/// elections, and the tag for signals. `payload` is opaque to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Position in the pool's total order
    pub time: EventTime,
    /// What happened
    pub kind: EventKind,
    /// Member the event is about, if any
    pub subject: Option<MemberId>,
    /// Name, election name, or signal tag
    #[serde(default)]
    pub label: String,
    /// Signal recipients; `None` means everyone, an empty list nobody
    #[serde(default)]
    pub targets: Option<Vec<MemberId>>,
    /// Opaque application data
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl Event {
    /// Bare event of `kind` at `time`
    pub fn new(time: EventTime, kind: EventKind) -> Self {
        Self {
            time,
            kind,
            subject: None,
            label: String::new(),
            targets: None,
            payload: Vec::new(),
        }
    }

    pub fn with_subject(mut self, subject: MemberId) -> Self {
        self.subject = Some(subject);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_targets(mut self, targets: Vec<MemberId>) -> Self {
        self.targets = Some(targets);
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Untargeted signals go to everyone
    pub fn is_addressed_to(&self, member: &MemberId) -> bool {
        match &self.targets {
            None => true,
            Some(targets) => targets.contains(member),
        }
    }

    pub fn is_signal(&self) -> bool {
        self.kind == EventKind::Signal
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.kind, self.time)?;
        if let Some(subject) = &self.subject {
            write!(f, " {}", subject)?;
        }
        if !self.label.is_empty() {
            write!(f, " \"{}\"", self.label)?;
        }
        Ok(())
    }
}
