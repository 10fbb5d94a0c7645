//! Ordered per-pool event log.
//!
//! The log is append-only and keyed by [`EventTime`]. It tolerates events
//! arriving out of order and hands out only hole-free runs, so a reader that
//! advances its own position by the length of a run never skips an event.
//!
//! The log has no internal locking; the owning pool serializes access.

use crate::event::{Event, EventKind};
use conclave_core::EventTime;
use std::collections::BTreeMap;

/// Log errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    /// The requested history was compacted away
    #[error("history before {floor} has been purged (requested {requested})")]
    Purged {
        /// First time the caller asked for
        requested: EventTime,
        /// Oldest time the log still holds
        floor: EventTime,
    },
}

/// Per-pool event log
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: BTreeMap<EventTime, Event>,
    floor: EventTime,
}

impl EventLog {
    /// Create an empty log with its floor at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event
    ///
    /// Returns `false` if an event with the same time is already present or
    /// the time lies below the floor; the log is left unchanged in both cases.
    pub fn append(&mut self, event: Event) -> bool {
        if event.time < self.floor || self.events.contains_key(&event.time) {
            return false;
        }
        self.events.insert(event.time, event);
        true
    }

    /// Event at `time`, if present and not purged
    #[must_use]
    pub fn get(&self, time: EventTime) -> Option<&Event> {
        self.events.get(&time)
    }

    /// Contiguous run of events starting exactly at `from`
    ///
    /// Empty if `from` itself is missing. Never contains a hole.
    #[must_use]
    pub fn get_run(&self, from: EventTime) -> Vec<Event> {
        let mut expected = from;
        let mut run = Vec::new();
        for (time, event) in self.events.range(from..) {
            if *time != expected {
                break;
            }
            run.push(event.clone());
            expected.increment();
        }
        run
    }

    /// Like [`get_run`](Self::get_run), but fails if `from` is below the floor
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Purged`] if the history at `from` is gone
    pub fn read_from(&self, from: EventTime) -> Result<Vec<Event>, LogError> {
        self.check_available(from)?;
        Ok(self.get_run(from))
    }

    /// Check that history starting at `from` has not been purged
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Purged`] if `from` is below the floor
    pub fn check_available(&self, from: EventTime) -> Result<(), LogError> {
        if from < self.floor {
            return Err(LogError::Purged {
                requested: from,
                floor: self.floor,
            });
        }
        Ok(())
    }

    /// SIGNAL events in `[from, to)`, regardless of membership churn
    #[must_use]
    pub fn get_signals(&self, from: EventTime, to: EventTime) -> Vec<Event> {
        if to <= from {
            return Vec::new();
        }
        self.events
            .range(from..to)
            .map(|(_, event)| event)
            .filter(|event| event.kind == EventKind::Signal)
            .cloned()
            .collect()
    }

    /// Purge every event before `time`
    ///
    /// No-op if `time` does not move the floor forward. Returns the number of
    /// events removed.
    pub fn set_floor(&mut self, time: EventTime) -> usize {
        if time <= self.floor {
            return 0;
        }
        let kept = self.events.split_off(&time);
        let purged = self.events.len();
        self.events = kept;
        self.floor = time;
        purged
    }

    /// Oldest time the log can still serve
    #[must_use]
    pub const fn floor(&self) -> EventTime {
        self.floor
    }

    /// Floor plus the length of the contiguous run starting there
    ///
    /// Everything before this time is present and hole-free.
    #[must_use]
    pub fn next_ready_time(&self) -> EventTime {
        let mut ready = self.floor;
        for time in self.events.range(self.floor..).map(|(time, _)| *time) {
            if time != ready {
                break;
            }
            ready.increment();
        }
        ready
    }

    /// Highest time present, if any
    #[must_use]
    pub fn latest(&self) -> Option<EventTime> {
        self.events.keys().next_back().copied()
    }

    /// Number of retained events
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether no events are retained
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
