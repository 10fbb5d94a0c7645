//! Pool members.

use conclave_core::{EventTime, MemberId};
use conclave_log::{Event, EventKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// What a process tells the registry about itself when joining
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    /// Member ID
    pub id: MemberId,
    /// Human-readable name, unique by convention only
    pub name: String,
    /// Address events are pushed to; pull-only members have none
    #[serde(default)]
    pub address: Option<String>,
    /// Opaque application data, replayed in the member's JOIN event
    #[serde(default)]
    pub data: Vec<u8>,
}

impl MemberInfo {
    /// Create member info without push address or data
    #[must_use]
    pub fn new(id: MemberId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            address: None,
            data: Vec::new(),
        }
    }

    /// Set push address
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Set opaque data
    #[must_use]
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }
}

/// A joined member and its liveness/acknowledgment state
#[derive(Debug, Clone)]
pub struct Member {
    info: MemberInfo,
    join_time: EventTime,
    current_time: EventTime,
    last_contact: Option<Instant>,
}

impl Member {
    /// Create a member that joined at `join_time`
    #[must_use]
    pub fn new(info: MemberInfo, join_time: EventTime, now: Instant) -> Self {
        Self {
            info,
            join_time,
            current_time: join_time,
            last_contact: Some(now),
        }
    }

    /// Member ID
    #[must_use]
    pub fn id(&self) -> MemberId {
        self.info.id
    }

    /// Member name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Push address, if any
    #[must_use]
    pub fn address(&self) -> Option<&str> {
        self.info.address.as_deref()
    }

    /// What the member told us when joining
    #[must_use]
    pub fn info(&self) -> &MemberInfo {
        &self.info
    }

    /// Time of the member's JOIN event
    #[must_use]
    pub fn join_time(&self) -> EventTime {
        self.join_time
    }

    /// Highest event time the member is known to have observed
    #[must_use]
    pub fn current_time(&self) -> EventTime {
        self.current_time
    }

    /// Last heartbeat or request; `None` once suspected dead
    #[must_use]
    pub fn last_contact(&self) -> Option<Instant> {
        self.last_contact
    }

    /// Whether events can be pushed to this member
    #[must_use]
    pub fn is_reachable(&self) -> bool {
        self.info.address.is_some()
    }

    /// Record contact
    pub fn touch(&mut self, now: Instant) {
        self.last_contact = Some(now);
    }

    /// Forget the last contact so the next liveness check evicts the member
    pub fn clear_contact(&mut self) {
        self.last_contact = None;
    }

    /// Record that the member has seen everything up to `time`
    ///
    /// Never moves backwards.
    pub fn observe(&mut self, time: EventTime) {
        if time > self.current_time {
            self.current_time = time;
        }
    }

    /// Whether the member missed events before `next_time`
    #[must_use]
    pub fn is_behind(&self, next_time: EventTime) -> bool {
        self.current_time.next() < next_time
    }

    /// Whether the member has been silent for longer than `timeout`
    #[must_use]
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        match self.last_contact {
            Some(seen) => now.saturating_duration_since(seen) > timeout,
            None => true,
        }
    }

    /// Seen within `window` of `now`
    #[must_use]
    pub fn seen_within(&self, now: Instant, window: Duration) -> bool {
        self.last_contact
            .is_some_and(|seen| now.saturating_duration_since(seen) <= window)
    }

    /// Rebuild this member's JOIN event
    #[must_use]
    pub fn join_event(&self) -> Event {
        Event::new(self.join_time, EventKind::Join)
            .with_subject(self.info.id)
            .with_label(self.info.name.clone())
            .with_payload(self.info.data.clone())
    }

    /// Read-only view for monitoring
    #[must_use]
    pub fn summary(&self) -> MemberSummary {
        MemberSummary {
            id: self.info.id,
            name: self.info.name.clone(),
            join_time: self.join_time,
            current_time: self.current_time,
        }
    }
}

/// Monitoring view of a member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSummary {
    /// Member ID
    pub id: MemberId,
    /// Member name
    pub name: String,
    /// Time of the JOIN event
    pub join_time: EventTime,
    /// Highest observed event time
    pub current_time: EventTime,
}
