//! Pool membership set.
//!
//! Members are kept in join order behind a hash index, so lookups are O(1)
//! while sampling and the dissemination tree stay stable between changes.

use crate::config::Topology;
use crate::member::Member;
use bitvec::prelude::*;
use conclave_core::{EventTime, MemberId};
use conclave_log::Event;
use indexmap::IndexMap;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::time::Instant;

/// Members of one pool plus the derived views the pool needs
pub struct MembershipSet {
    members: IndexMap<MemberId, Member>,
    topology: Topology,
    rng: SmallRng,
}

impl MembershipSet {
    /// Create an empty set
    #[must_use]
    pub fn new(topology: Topology) -> Self {
        Self {
            members: IndexMap::new(),
            topology,
            rng: SmallRng::from_entropy(),
        }
    }

    /// Create an empty set with a fixed sampling seed
    #[must_use]
    pub fn with_seed(topology: Topology, seed: u64) -> Self {
        Self {
            members: IndexMap::new(),
            topology,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Add a member; returns `false` if its ID is already present
    pub fn add(&mut self, member: Member) -> bool {
        if self.members.contains_key(&member.id()) {
            return false;
        }
        self.members.insert(member.id(), member);
        true
    }

    /// Remove a member, keeping the join order of the rest
    pub fn remove(&mut self, id: &MemberId) -> Option<Member> {
        self.members.shift_remove(id)
    }

    /// Check membership
    #[must_use]
    pub fn contains(&self, id: &MemberId) -> bool {
        self.members.contains_key(id)
    }

    /// Get a member by ID
    #[must_use]
    pub fn get(&self, id: &MemberId) -> Option<&Member> {
        self.members.get(id)
    }

    /// Get a mutable member by ID
    pub fn get_mut(&mut self, id: &MemberId) -> Option<&mut Member> {
        self.members.get_mut(id)
    }

    /// Get the first member with this name
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<&Member> {
        self.members.values().find(|m| m.name() == name)
    }

    /// Number of members
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the set is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members in join order
    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// Lowest current time over all members; `None` if empty
    #[must_use]
    pub fn min_current_time(&self) -> Option<EventTime> {
        self.members.values().map(Member::current_time).min()
    }

    /// The member with the least acknowledged progress
    ///
    /// Lowest current time wins; ties go to the member heard from longest
    /// ago, with cleared contact counting as oldest.
    #[must_use]
    pub fn least_recently_seen(&self) -> Option<&Member> {
        self.members.values().min_by_key(|m| progress_key(m))
    }

    /// Reachable members missing events before `next_time`, furthest
    /// behind first
    #[must_use]
    pub fn laggards(&self, next_time: EventTime) -> Vec<MemberId> {
        let mut behind: Vec<&Member> = self
            .members
            .values()
            .filter(|m| m.is_reachable() && m.is_behind(next_time))
            .collect();
        behind.sort_by_key(|m| progress_key(m));
        behind.into_iter().map(Member::id).collect()
    }

    /// Up to `k` distinct members chosen uniformly at random
    ///
    /// Rejection sampling over a presence bitmap, so no position in the join
    /// order is favored. Asking for at least `len()` returns everyone.
    pub fn sample(&mut self, k: usize) -> Vec<MemberId> {
        let len = self.members.len();
        if k >= len {
            return self.members.keys().copied().collect();
        }
        let mut picked = bitvec![0; len];
        let mut result = Vec::with_capacity(k);
        while result.len() < k {
            let index = self.rng.gen_range(0..len);
            if picked[index] {
                continue;
            }
            picked.set(index, true);
            if let Some((id, _)) = self.members.get_index(index) {
                result.push(*id);
            }
        }
        result
    }

    /// Copy of every member, in join order
    #[must_use]
    pub fn snapshot(&self) -> Vec<Member> {
        self.members.values().cloned().collect()
    }

    /// JOIN events of all live members, ordered by time
    #[must_use]
    pub fn join_events(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self.members.values().map(Member::join_event).collect();
        events.sort_by_key(|e| e.time);
        events
    }

    /// Members silent for longer than `timeout`
    #[must_use]
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<MemberId> {
        self.members
            .values()
            .filter(|m| m.is_expired(now, timeout))
            .map(Member::id)
            .collect()
    }

    /// Members the registry pushes to directly
    #[must_use]
    pub fn root_children(&self) -> Vec<MemberId> {
        match self.topology {
            Topology::Flat => self.members.keys().copied().collect(),
            Topology::Tree { fanout } => self.ids_in(0, fanout),
        }
    }

    /// Members that receive events via `id`
    ///
    /// Always empty for a flat topology or an unknown ID.
    #[must_use]
    pub fn children(&self, id: &MemberId) -> Vec<MemberId> {
        let Topology::Tree { fanout } = self.topology else {
            return Vec::new();
        };
        match self.members.get_index_of(id) {
            Some(index) => self.ids_in(fanout * (index + 1), fanout),
            None => Vec::new(),
        }
    }

    fn ids_in(&self, start: usize, count: usize) -> Vec<MemberId> {
        let end = start.saturating_add(count).min(self.members.len());
        (start..end)
            .filter_map(|i| self.members.get_index(i).map(|(id, _)| *id))
            .collect()
    }
}

fn progress_key(member: &Member) -> (EventTime, Option<Instant>) {
    (member.current_time(), member.last_contact())
}

impl std::fmt::Debug for MembershipSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipSet")
            .field("members", &self.members.keys().collect::<Vec<_>>())
            .field("topology", &self.topology)
            .finish()
    }
}

impl Default for MembershipSet {
    fn default() -> Self {
        Self::new(Topology::Flat)
    }
}
