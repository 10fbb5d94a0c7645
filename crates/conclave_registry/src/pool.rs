//! Pool state machine.
//!
//! A pool is a named group of members with its own totally ordered event
//! history. Every mutating operation runs under the pool's lock, which
//! serializes event time allocation: the log never has holes at the
//! moment an event is handed out. Network pushes run on the pool's
//! dissemination worker and release the lock while sending.
//!
//! ```text
//! OPEN --(closed-world target reached)--> COMPLETE --+
//!   |                                                |
//!   +--(terminate / closed-world pool empties)--> ENDED
//! ```

use crate::config::PoolPolicy;
use crate::dissemination::{Disseminate, DisseminationQueue, DisseminationWorker};
use crate::error::{RegistryError, RegistryResult};
use crate::member::{Member, MemberInfo, MemberSummary};
use crate::membership::MembershipSet;
use crate::stats::PoolStats;
use crate::transport::{EventBatch, PushTransport};
use async_trait::async_trait;
use conclave_core::{EventTime, MemberId};
use conclave_log::{Event, EventKind, EventLog, LogError};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Suspicion reports about a member heard from this recently are ignored
const RECENTLY_SEEN: Duration = Duration::from_secs(1);

/// Default number of peers handed to a bootstrapping member
pub const BOOTSTRAP_LIST_SIZE: usize = 25;

/// Lifecycle phase of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolPhase {
    /// Accepting joins
    Open,
    /// Closed-world target reached; no further joins
    Complete,
    /// Terminal
    Ended,
}

/// Result of a join request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinOutcome {
    /// Time of the member's JOIN event
    pub time: EventTime,
    /// The member was already part of the pool; no event was added
    pub already_joined: bool,
}

/// Result of a pull
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullResult {
    /// Contiguous run starting at the requested time, possibly empty
    pub events: Vec<Event>,
    /// Highest time the caller has now observed, if any
    pub current_time: Option<EventTime>,
}

/// Everything a member needs to rebuild its view of the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    /// Pool name
    pub pool: String,
    /// Next event time; the snapshot reflects everything before it
    pub event_time: EventTime,
    /// Compaction floor
    pub floor: EventTime,
    /// Reconstructed JOIN events of all live members
    pub members: Vec<Event>,
    /// Election results
    pub elections: IndexMap<String, MemberId>,
    /// Signals addressed to the member since it joined
    pub signals: Vec<Event>,
    /// No further joins accepted
    pub closed: bool,
    /// Explicitly terminated
    pub terminated: bool,
}

/// Outcome of one compaction pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Members declared dead for missing heartbeats
    pub died: Vec<MemberId>,
    /// Floor after the pass
    pub floor: EventTime,
    /// Events removed from the log
    pub purged: usize,
    /// Lagging members queued for a push
    pub requeued: usize,
}

#[derive(Debug, Clone, Copy)]
struct Clock {
    next_time: EventTime,
    ended: bool,
}

struct PoolState {
    log: EventLog,
    members: MembershipSet,
    elections: IndexMap<String, MemberId>,
    sequencers: HashMap<String, u64>,
    next_time: EventTime,
    phase: PoolPhase,
    terminated: bool,
    counters: [u64; EventKind::COUNT],
}

impl PoolState {
    fn new(policy: &PoolPolicy) -> Self {
        Self {
            log: EventLog::new(),
            members: MembershipSet::new(policy.topology),
            elections: IndexMap::new(),
            sequencers: HashMap::new(),
            next_time: EventTime::zero(),
            phase: PoolPhase::Open,
            terminated: false,
            counters: [0; EventKind::COUNT],
        }
    }

    /// Allocate the next time and append the event built for it
    fn append(&mut self, kind: EventKind, build: impl FnOnce(Event) -> Event) -> Event {
        let event = build(Event::new(self.next_time, kind));
        self.log.append(event.clone());
        self.counters[kind.index()] += 1;
        self.next_time.increment();
        event
    }

    fn count(&self, kind: EventKind) -> u64 {
        self.counters[kind.index()]
    }
}

/// A named pool
pub struct Pool {
    name: String,
    policy: PoolPolicy,
    print_events: bool,
    state: Mutex<PoolState>,
    ended: AtomicBool,
    queue: Arc<DisseminationQueue>,
    transport: Arc<dyn PushTransport>,
    clock: watch::Sender<Clock>,
    shutdown: CancellationToken,
    worker: StdMutex<Option<DisseminationWorker>>,
}

impl Pool {
    /// Create a pool and start its dissemination worker
    ///
    /// Must be called from within a tokio runtime. Cancelling `shutdown`
    /// stops the worker and any pending push retries.
    pub fn spawn(
        name: impl Into<String>,
        policy: PoolPolicy,
        transport: Arc<dyn PushTransport>,
        print_events: bool,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let name = name.into();
        let (clock, _) = watch::channel(Clock {
            next_time: EventTime::zero(),
            ended: false,
        });
        let pool = Arc::new(Self {
            name: name.clone(),
            state: Mutex::new(PoolState::new(&policy)),
            policy,
            print_events,
            ended: AtomicBool::new(false),
            queue: Arc::new(DisseminationQueue::new()),
            transport,
            clock,
            shutdown,
            worker: StdMutex::new(None),
        });

        let worker = DisseminationWorker::spawn(
            name.clone(),
            pool.queue.clone(),
            Arc::downgrade(&pool),
            pool.shutdown.clone(),
        );
        if let Ok(mut slot) = pool.worker.lock() {
            *slot = Some(worker);
        }

        info!(
            pool = %name,
            closed_world = pool.policy.closed_world,
            target_size = pool.policy.target_size,
            "created pool"
        );
        pool
    }

    /// Pool name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Policy the pool was created with
    #[must_use]
    pub fn policy(&self) -> &PoolPolicy {
        &self.policy
    }

    /// Whether the pool has ended; never takes the pool lock
    #[must_use]
    pub fn has_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Next event time to be assigned; never takes the pool lock
    #[must_use]
    pub fn event_time(&self) -> EventTime {
        self.clock.borrow().next_time
    }

    /// Current lifecycle phase
    pub async fn phase(&self) -> PoolPhase {
        self.state.lock().await.phase
    }

    /// Current number of members
    pub async fn size(&self) -> usize {
        self.state.lock().await.members.len()
    }

    /// Compaction floor
    pub async fn floor(&self) -> EventTime {
        self.state.lock().await.log.floor()
    }

    /// Event at `time`, if still held
    pub async fn event(&self, time: EventTime) -> Option<Event> {
        self.state.lock().await.log.get(time).cloned()
    }

    /// Add a member
    ///
    /// Joining twice is not an error: the second call reports
    /// `already_joined` with the original join time and adds no event.
    ///
    /// # Errors
    ///
    /// [`RegistryError::PoolClosed`] if the pool has ended,
    /// [`RegistryError::PoolComplete`] if a closed-world pool is full
    pub async fn join(&self, info: MemberInfo) -> RegistryResult<JoinOutcome> {
        let mut state = self.state.lock().await;
        self.ensure_live(&state)?;

        if let Some(existing) = state.members.get(&info.id) {
            debug!(pool = %self.name, member = %info.id, "member already joined");
            return Ok(JoinOutcome {
                time: existing.join_time(),
                already_joined: true,
            });
        }
        if state.phase == PoolPhase::Complete {
            return Err(RegistryError::PoolComplete(self.name.clone()));
        }

        let id = info.id;
        let event = state.append(EventKind::Join, |e| {
            e.with_subject(id)
                .with_label(info.name.clone())
                .with_payload(info.data.clone())
        });
        state.members.add(Member::new(info, event.time, Instant::now()));
        self.note(&event, state.members.len());

        let target = u64::try_from(self.policy.target_size).unwrap_or(u64::MAX);
        if self.policy.closed_world && state.count(EventKind::Join) >= target {
            self.close_locked(&mut state);
        }

        self.after_change(&state);
        Ok(JoinOutcome {
            time: event.time,
            already_joined: false,
        })
    }

    /// Remove a member that leaves voluntarily
    ///
    /// # Errors
    ///
    /// [`RegistryError::MemberNotFound`] or [`RegistryError::PoolClosed`]
    pub async fn leave(&self, id: MemberId) -> RegistryResult<EventTime> {
        self.depart(id, EventKind::Leave).await
    }

    /// Remove a member that crashed
    ///
    /// # Errors
    ///
    /// [`RegistryError::MemberNotFound`] or [`RegistryError::PoolClosed`]
    pub async fn die(&self, id: MemberId) -> RegistryResult<EventTime> {
        self.depart(id, EventKind::Died).await
    }

    async fn depart(&self, id: MemberId, kind: EventKind) -> RegistryResult<EventTime> {
        let mut state = self.state.lock().await;
        self.ensure_live(&state)?;
        let time = self.depart_locked(&mut state, id, kind)?;
        self.after_change(&state);
        Ok(time)
    }

    fn depart_locked(
        &self,
        state: &mut PoolState,
        id: MemberId,
        kind: EventKind,
    ) -> RegistryResult<EventTime> {
        if state.members.remove(&id).is_none() {
            return Err(self.member_not_found(id));
        }
        let event = state.append(kind, |e| e.with_subject(id));
        self.note(&event, state.members.len());

        if self.policy.closed_world && state.members.is_empty() {
            self.end_locked(state);
        }
        Ok(event.time)
    }

    /// Decide election `name`; the first candidate to get here wins
    ///
    /// Returns the winner, which differs from `candidate` if the election
    /// was already decided. The result never changes afterwards.
    ///
    /// # Errors
    ///
    /// [`RegistryError::MemberNotFound`] if an undecided election names a
    /// non-member, [`RegistryError::PoolClosed`] if the pool has ended
    pub async fn elect(&self, name: &str, candidate: MemberId) -> RegistryResult<MemberId> {
        let mut state = self.state.lock().await;
        self.ensure_live(&state)?;

        if let Some(winner) = state.elections.get(name) {
            return Ok(*winner);
        }
        if !state.members.contains(&candidate) {
            return Err(self.member_not_found(candidate));
        }

        let event = state.append(EventKind::Election, |e| {
            e.with_subject(candidate).with_label(name)
        });
        state.elections.insert(name.to_string(), candidate);
        self.note(&event, state.members.len());

        self.after_change(&state);
        Ok(candidate)
    }

    /// Winner of election `name`, if decided
    pub async fn election(&self, name: &str) -> Option<MemberId> {
        self.state.lock().await.elections.get(name).copied()
    }

    /// Append an application signal in the pool's total order
    ///
    /// `None` addresses everyone. Listed targets that are not members are
    /// dropped, so a signal whose targets have all left reaches nobody.
    ///
    /// # Errors
    ///
    /// [`RegistryError::MemberNotFound`] if `source` is not a member,
    /// [`RegistryError::PoolClosed`] if the pool has ended
    pub async fn signal(
        &self,
        source: MemberId,
        tag: &str,
        targets: Option<&[MemberId]>,
    ) -> RegistryResult<EventTime> {
        let mut state = self.state.lock().await;
        self.ensure_live(&state)?;
        if !state.members.contains(&source) {
            return Err(self.member_not_found(source));
        }

        let recipients: Option<Vec<MemberId>> = targets.map(|targets| {
            targets
                .iter()
                .filter(|t| state.members.contains(t))
                .copied()
                .collect()
        });
        let event = state.append(EventKind::Signal, |e| {
            let e = e.with_subject(source).with_label(tag);
            match recipients {
                Some(recipients) => e.with_targets(recipients),
                None => e,
            }
        });
        debug!(pool = %self.name, event = %event, "signal");

        self.after_change(&state);
        Ok(event.time)
    }

    /// Record that a member is alive
    ///
    /// # Errors
    ///
    /// [`RegistryError::MemberNotFound`] or [`RegistryError::PoolClosed`]
    pub async fn heartbeat(&self, id: MemberId) -> RegistryResult<()> {
        let mut state = self.state.lock().await;
        self.ensure_live(&state)?;
        let member = state
            .members
            .get_mut(&id)
            .ok_or_else(|| self.member_not_found(id))?;
        member.touch(Instant::now());
        Ok(())
    }

    /// Report a member as possibly dead
    ///
    /// Returns `false` if the member was heard from within the last second.
    /// Otherwise its last contact is cleared and the next compaction pass
    /// declares it dead.
    ///
    /// # Errors
    ///
    /// [`RegistryError::MemberNotFound`] or [`RegistryError::PoolClosed`]
    pub async fn maybe_dead(&self, id: MemberId) -> RegistryResult<bool> {
        let mut state = self.state.lock().await;
        self.ensure_live(&state)?;
        let member = state
            .members
            .get_mut(&id)
            .ok_or_else(|| self.member_not_found(id))?;
        if member.seen_within(Instant::now(), RECENTLY_SEEN) {
            debug!(pool = %self.name, member = %id, "suspect seen recently, ignoring report");
            return Ok(false);
        }
        member.clear_contact();
        debug!(pool = %self.name, member = %id, "member now suspect");
        Ok(true)
    }

    /// Contiguous run of events starting at `from`
    ///
    /// For a member this counts as contact. Its current time advances past
    /// the returned run only when the run continues from what it has
    /// already seen; reading ahead of a gap records nothing. Anyone may
    /// pull; non-members just read.
    /// Never blocks on missing events. Allowed after the pool ended so
    /// members can still learn the final events.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Resynchronize`] if `from` has been compacted away
    pub async fn pull(&self, id: MemberId, from: EventTime) -> RegistryResult<PullResult> {
        let mut state = self.state.lock().await;
        state
            .log
            .check_available(from)
            .map_err(|err| self.resynchronize(err))?;

        let events = state.log.get_run(from);
        let last = events.last().map(|e| e.time);
        let current_time = match state.members.get_mut(&id) {
            Some(member) => {
                member.touch(Instant::now());
                let contiguous = from <= member.current_time().next();
                if let (true, Some(last)) = (contiguous, last) {
                    member.observe(last);
                }
                Some(member.current_time())
            }
            None => last.or_else(|| from.prev()),
        };

        Ok(PullResult {
            events,
            current_time,
        })
    }

    /// State needed by a member rebuilding after a resynchronize error
    ///
    /// The member is considered caught up to the snapshot's event time.
    ///
    /// # Errors
    ///
    /// [`RegistryError::MemberNotFound`] if `id` has not joined
    pub async fn snapshot(&self, id: MemberId) -> RegistryResult<PoolSnapshot> {
        let mut state = self.state.lock().await;
        let join_time = state
            .members
            .get(&id)
            .map(Member::join_time)
            .ok_or_else(|| self.member_not_found(id))?;

        let next_time = state.next_time;
        let signals = state
            .log
            .get_signals(join_time, next_time)
            .into_iter()
            .filter(|e| e.is_addressed_to(&id))
            .collect();
        let snapshot = PoolSnapshot {
            pool: self.name.clone(),
            event_time: next_time,
            floor: state.log.floor(),
            members: state.members.join_events(),
            elections: state.elections.clone(),
            signals,
            closed: state.phase != PoolPhase::Open,
            terminated: state.terminated,
        };

        if let (Some(member), Some(last)) = (state.members.get_mut(&id), next_time.prev()) {
            member.observe(last);
            member.touch(Instant::now());
        }
        Ok(snapshot)
    }

    /// Up to `count` randomly chosen members for peer bootstrapping
    pub async fn bootstrap_peers(&self, count: usize) -> Vec<MemberId> {
        self.state.lock().await.members.sample(count)
    }

    /// Next value of sequencer `name`, starting at zero
    ///
    /// # Errors
    ///
    /// [`RegistryError::PoolClosed`] if the pool has ended
    pub async fn sequence_number(&self, name: &str) -> RegistryResult<u64> {
        let mut state = self.state.lock().await;
        self.ensure_live(&state)?;
        let counter = state.sequencers.entry(name.to_string()).or_insert(0);
        let value = *counter;
        *counter += 1;
        Ok(value)
    }

    /// End the pool explicitly
    ///
    /// Closes the pool to joins if still open, then appends
    /// `POOL_TERMINATED`. Members are pushed the final events before the
    /// worker stops.
    ///
    /// # Errors
    ///
    /// [`RegistryError::MemberNotFound`] if `source` is given but not a
    /// member, [`RegistryError::PoolClosed`] if already ended
    pub async fn terminate(&self, source: Option<MemberId>) -> RegistryResult<EventTime> {
        let mut state = self.state.lock().await;
        self.ensure_live(&state)?;
        if let Some(source) = source {
            if !state.members.contains(&source) {
                return Err(self.member_not_found(source));
            }
        }

        self.close_locked(&mut state);
        state.terminated = true;
        let event = state.append(EventKind::PoolTerminated, |e| match source {
            Some(source) => e.with_subject(source),
            None => e,
        });
        info!(pool = %self.name, "pool terminated");
        self.end_locked(&mut state);

        self.after_change(&state);
        Ok(event.time)
    }

    /// Wait until event time `time` has been assigned
    ///
    /// Returns `false` if the pool ended or `timeout` elapsed first.
    /// Does not hold the pool lock while waiting.
    pub async fn wait_for_event_time(&self, time: EventTime, timeout: Duration) -> bool {
        let mut clock = self.clock.subscribe();
        let waited =
            tokio::time::timeout(timeout, clock.wait_for(|c| c.next_time > time || c.ended)).await;
        match waited {
            Ok(Ok(clock)) => clock.next_time > time,
            _ => false,
        }
    }

    /// Read-only view of the members, in join order
    pub async fn members(&self) -> Vec<MemberSummary> {
        self.state
            .lock()
            .await
            .members
            .iter()
            .map(Member::summary)
            .collect()
    }

    /// Whether `id` is currently a member
    pub async fn is_member(&self, id: MemberId) -> bool {
        self.state.lock().await.members.contains(&id)
    }

    /// Counters and flags
    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            name: self.name.clone(),
            size: state.members.len(),
            joins: state.count(EventKind::Join),
            leaves: state.count(EventKind::Leave),
            deaths: state.count(EventKind::Died),
            elections: state.count(EventKind::Election),
            signals: state.count(EventKind::Signal),
            fixed_size: self.policy.closed_world.then_some(self.policy.target_size),
            closed: state.phase != PoolPhase::Open,
            terminated: state.terminated,
            ended: state.phase == PoolPhase::Ended,
            event_time: state.next_time,
            floor: state.log.floor(),
        }
    }

    /// Reaper pass: evict silent members, compact the log, requeue laggards
    ///
    /// The floor only ever moves to the lowest current time among live
    /// members, so no live member is asked to skip an event.
    pub async fn compact(&self, now: Instant) -> CompactionReport {
        let mut state = self.state.lock().await;
        let mut report = CompactionReport::default();
        if state.phase == PoolPhase::Ended {
            report.floor = state.log.floor();
            return report;
        }

        let expired = state.members.expired(now, self.policy.heartbeat_timeout());
        for id in expired {
            warn!(pool = %self.name, member = %id, "heartbeat timeout, declaring member dead");
            if self.depart_locked(&mut state, id, EventKind::Died).is_ok() {
                report.died.push(id);
            }
            if state.phase == PoolPhase::Ended {
                break;
            }
        }

        if self.policy.purge_history {
            let floor = state.members.min_current_time().unwrap_or(state.next_time);
            report.purged = state.log.set_floor(floor);
        }
        report.floor = state.log.floor();

        // Furthest behind first
        let laggards = state.members.laggards(state.next_time);
        report.requeued = laggards
            .into_iter()
            .filter(|id| self.queue.enqueue(*id))
            .count();

        if !report.died.is_empty() {
            self.after_change(&state);
        }
        if report.purged > 0 {
            debug!(pool = %self.name, floor = %report.floor, purged = report.purged, "compacted log");
        }
        report
    }

    /// Stop the dissemination worker and pending retries
    pub fn shutdown(&self) {
        self.queue.close();
        self.shutdown.cancel();
    }

    /// Wait for the dissemination worker to exit
    pub async fn join_worker(&self) {
        let worker = match self.worker.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(worker) = worker {
            worker.join().await;
        }
    }

    fn ensure_live(&self, state: &PoolState) -> RegistryResult<()> {
        if state.phase == PoolPhase::Ended {
            return Err(RegistryError::PoolClosed(self.name.clone()));
        }
        Ok(())
    }

    fn member_not_found(&self, member: MemberId) -> RegistryError {
        RegistryError::MemberNotFound {
            pool: self.name.clone(),
            member,
        }
    }

    fn resynchronize(&self, err: LogError) -> RegistryError {
        match err {
            LogError::Purged { requested, floor } => RegistryError::Resynchronize {
                pool: self.name.clone(),
                requested,
                floor,
            },
        }
    }

    fn close_locked(&self, state: &mut PoolState) {
        if state.phase != PoolPhase::Open {
            return;
        }
        state.phase = PoolPhase::Complete;
        state.append(EventKind::PoolClosed, |e| e);
        info!(pool = %self.name, size = state.members.len(), "pool closed");
    }

    fn end_locked(&self, state: &mut PoolState) {
        if state.phase == PoolPhase::Ended {
            return;
        }
        state.phase = PoolPhase::Ended;
        self.ended.store(true, Ordering::SeqCst);

        // Final push of the terminal events, then let the worker drain
        let next_time = state.next_time;
        for member in state.members.iter() {
            if member.is_reachable() && member.is_behind(next_time) {
                self.queue.enqueue(member.id());
            }
        }
        self.queue.close();
        info!(pool = %self.name, "pool ended");
    }

    /// Publish the new time and queue the members the registry feeds directly
    fn after_change(&self, state: &PoolState) {
        self.clock.send_replace(Clock {
            next_time: state.next_time,
            ended: state.phase == PoolPhase::Ended,
        });
        let roots = state.members.root_children();
        self.enqueue_behind(state, &roots);
    }

    fn enqueue_behind(&self, state: &PoolState, ids: &[MemberId]) {
        for id in ids {
            if let Some(member) = state.members.get(id) {
                if member.is_reachable() && member.is_behind(state.next_time) {
                    self.queue.enqueue(*id);
                }
            }
        }
    }

    fn note(&self, event: &Event, size: usize) {
        if self.print_events {
            info!(pool = %self.name, event = %event, size, "membership changed");
        } else {
            debug!(pool = %self.name, event = %event, size, "membership changed");
        }
    }

    fn retry_later(&self, id: MemberId) {
        let queue = self.queue.clone();
        let shutdown = self.shutdown.clone();
        let delay = self.policy.push_retry();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    queue.enqueue(id);
                }
            }
        });
    }

    /// Batch for `id` computed under the lock; `None` if nothing to send
    async fn prepare_push(&self, id: MemberId) -> Option<(String, EventBatch)> {
        let state = self.state.lock().await;
        let member = state.members.get(&id)?;
        let address = member.address()?.to_string();
        let events = state.log.get_run(member.current_time().next());
        if events.is_empty() {
            // Up to date, but the subtree below it may not be
            let children = state.members.children(&id);
            self.enqueue_behind(&state, &children);
            return None;
        }
        Some((
            address,
            EventBatch::new(self.name.clone(), events, state.log.floor()),
        ))
    }
}

#[async_trait]
impl Disseminate for Pool {
    async fn push_to(&self, id: MemberId) {
        let Some((address, batch)) = self.prepare_push(id).await else {
            return;
        };

        // The lock is not held across the send
        let result = self.transport.push(&address, &batch).await;

        let mut state = self.state.lock().await;
        match result {
            Ok(()) => {
                let delivered = match state.members.get_mut(&id) {
                    Some(member) => {
                        if let Some(last) = batch.last_time() {
                            member.observe(last);
                        }
                        member.touch(Instant::now());
                        true
                    }
                    None => false,
                };
                if delivered {
                    let children = state.members.children(&id);
                    self.enqueue_behind(&state, &children);
                }
                debug!(pool = %self.name, member = %id, events = batch.len(), "pushed events");
            }
            Err(err) => {
                if !state.members.contains(&id) {
                    return;
                }
                warn!(pool = %self.name, member = %id, error = %err, "cannot reach member to push events");
                drop(state);
                self.retry_later(id);
            }
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("event_time", &self.event_time())
            .field("ended", &self.has_ended())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Topology;
    use crate::transport::testing::RecordingTransport;
    use std::future::Future;

    fn id(name: &str) -> MemberId {
        MemberId::from_name(name)
    }

    fn info(name: &str) -> MemberInfo {
        MemberInfo::new(id(name), name)
    }

    fn reachable(name: &str) -> MemberInfo {
        info(name).with_address(name)
    }

    fn pool_with(policy: PoolPolicy) -> (Arc<Pool>, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let pool = Pool::spawn("t1", policy, transport.clone(), false, CancellationToken::new());
        (pool, transport)
    }

    fn open_pool() -> Arc<Pool> {
        pool_with(PoolPolicy::open()).0
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn current_time_of(pool: &Pool, name: &str) -> Option<EventTime> {
        pool.members()
            .await
            .into_iter()
            .find(|m| m.id == id(name))
            .map(|m| m.current_time)
    }

    #[tokio::test]
    async fn test_join_assigns_consecutive_times() {
        let pool = open_pool();
        let a = pool.join(info("a")).await.unwrap();
        let b = pool.join(info("b")).await.unwrap();
        assert_eq!(a.time, EventTime::zero());
        assert_eq!(b.time, EventTime::from_raw(1));
        assert!(!a.already_joined);

        // Anyone may read the history
        let pulled = pool.pull(id("observer"), EventTime::zero()).await.unwrap();
        let subjects: Vec<_> = pulled.events.iter().map(|e| (e.kind, e.subject)).collect();
        assert_eq!(
            subjects,
            vec![
                (EventKind::Join, Some(id("a"))),
                (EventKind::Join, Some(id("b")))
            ]
        );
        assert_eq!(pulled.current_time, Some(EventTime::from_raw(1)));
        assert_eq!(pool.event_time(), EventTime::from_raw(2));
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let pool = open_pool();
        let first = pool.join(info("x")).await.unwrap();
        pool.join(info("y")).await.unwrap();
        let second = pool.join(info("x")).await.unwrap();

        assert!(second.already_joined);
        assert_eq!(second.time, first.time);
        assert_eq!(pool.stats().await.joins, 2);
        assert_eq!(pool.event_time(), EventTime::from_raw(2));
    }

    #[tokio::test]
    async fn test_closed_world_pool_completes() {
        let (pool, _) = pool_with(PoolPolicy::closed(2));
        pool.join(info("a")).await.unwrap();
        assert_eq!(pool.phase().await, PoolPhase::Open);
        pool.join(info("b")).await.unwrap();
        assert_eq!(pool.phase().await, PoolPhase::Complete);

        let err = pool.join(info("c")).await.unwrap_err();
        assert_eq!(err, RegistryError::PoolComplete("t1".to_string()));

        // A member already inside is still told it joined
        assert!(pool.join(info("a")).await.unwrap().already_joined);

        let closed = pool.event(EventTime::from_raw(2)).await.unwrap();
        assert_eq!(closed.kind, EventKind::PoolClosed);
        assert!(pool.stats().await.closed);
    }

    #[tokio::test]
    async fn test_closed_world_pool_ends_when_empty() {
        let (pool, _) = pool_with(PoolPolicy::closed(2));
        pool.join(info("a")).await.unwrap();
        pool.join(info("b")).await.unwrap();
        pool.leave(id("a")).await.unwrap();
        assert!(!pool.has_ended());
        pool.die(id("b")).await.unwrap();
        assert!(pool.has_ended());
        assert_eq!(pool.phase().await, PoolPhase::Ended);

        let err = pool.heartbeat(id("a")).await.unwrap_err();
        assert_eq!(err, RegistryError::PoolClosed("t1".to_string()));
        assert!(matches!(
            pool.join(info("c")).await,
            Err(RegistryError::PoolClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_open_pool_survives_empty() {
        let pool = open_pool();
        pool.join(info("a")).await.unwrap();
        pool.leave(id("a")).await.unwrap();
        assert!(!pool.has_ended());
        assert!(pool.join(info("b")).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_member_errors() {
        let pool = open_pool();
        pool.join(info("a")).await.unwrap();

        assert!(pool.leave(id("ghost")).await.unwrap_err().is_not_found());
        assert!(pool.die(id("ghost")).await.unwrap_err().is_not_found());
        assert!(pool.heartbeat(id("ghost")).await.unwrap_err().is_not_found());
        assert!(pool
            .elect("master", id("ghost"))
            .await
            .unwrap_err()
            .is_not_found());
        assert!(pool
            .signal(id("ghost"), "go", None)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(pool.snapshot(id("ghost")).await.unwrap_err().is_not_found());

        // Leave does not reuse the departed member's slot
        pool.leave(id("a")).await.unwrap();
        assert!(pool.leave(id("a")).await.unwrap_err().is_not_found());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_election_has_single_winner() {
        let pool = open_pool();
        let candidates: Vec<MemberId> = (0..8).map(|i| id(&format!("m{}", i))).collect();
        for (i, c) in candidates.iter().enumerate() {
            pool.join(MemberInfo::new(*c, format!("m{}", i))).await.unwrap();
        }

        let mut handles = Vec::new();
        for c in candidates.clone() {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move { pool.elect("master", c).await }));
        }
        let mut winners = Vec::new();
        for handle in handles {
            winners.push(handle.await.unwrap().unwrap());
        }

        let winner = winners[0];
        assert!(candidates.contains(&winner));
        assert!(winners.iter().all(|w| *w == winner));
        assert_eq!(pool.elect("master", candidates[7]).await.unwrap(), winner);
        assert_eq!(pool.election("master").await, Some(winner));
        assert_eq!(pool.stats().await.elections, 1);
    }

    #[tokio::test]
    async fn test_election_survives_winner_departure() {
        let pool = open_pool();
        pool.join(info("a")).await.unwrap();
        pool.join(info("b")).await.unwrap();
        assert_eq!(pool.elect("master", id("a")).await.unwrap(), id("a"));
        pool.leave(id("a")).await.unwrap();
        assert_eq!(pool.elect("master", id("b")).await.unwrap(), id("a"));
    }

    #[tokio::test]
    async fn test_signal_order_and_targets() {
        let pool = open_pool();
        pool.join(info("a")).await.unwrap();
        pool.join(info("b")).await.unwrap();
        let t = pool
            .signal(id("a"), "barrier", Some(&[id("b"), id("ghost")]))
            .await
            .unwrap();
        assert_eq!(t, EventTime::from_raw(2));

        let event = pool.event(t).await.unwrap();
        assert_eq!(event.kind, EventKind::Signal);
        assert_eq!(event.label, "barrier");
        assert_eq!(event.targets, Some(vec![id("b")]));
        assert_eq!(pool.stats().await.signals, 1);
    }

    #[tokio::test]
    async fn test_pull_advances_member_time() {
        let pool = open_pool();
        pool.join(info("a")).await.unwrap();
        pool.join(info("b")).await.unwrap();
        pool.join(info("c")).await.unwrap();

        let result = pool.pull(id("a"), EventTime::from_raw(1)).await.unwrap();
        assert_eq!(result.events.len(), 2);
        assert_eq!(result.current_time, Some(EventTime::from_raw(2)));
        assert_eq!(current_time_of(&pool, "a").await, Some(EventTime::from_raw(2)));

        // Nothing new: empty run, time unchanged
        let result = pool.pull(id("a"), EventTime::from_raw(3)).await.unwrap();
        assert!(result.events.is_empty());
        assert_eq!(result.current_time, Some(EventTime::from_raw(2)));

        // Re-reading older events never moves time backwards
        pool.pull(id("a"), EventTime::zero()).await.unwrap();
        assert_eq!(current_time_of(&pool, "a").await, Some(EventTime::from_raw(2)));
    }

    #[tokio::test]
    async fn test_pull_past_gap_records_nothing() {
        let pool = open_pool();
        pool.join(info("a")).await.unwrap(); // 0
        pool.join(info("b")).await.unwrap(); // 1
        pool.join(info("c")).await.unwrap(); // 2

        // Time 1 is skipped, so a has not seen it
        let result = pool.pull(id("a"), EventTime::from_raw(2)).await.unwrap();
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.current_time, Some(EventTime::zero()));
        assert_eq!(current_time_of(&pool, "a").await, Some(EventTime::zero()));

        let report = pool.compact(Instant::now()).await;
        assert_eq!(report.floor, EventTime::zero());
        assert!(pool.event(EventTime::from_raw(1)).await.is_some());
    }

    #[tokio::test]
    async fn test_compaction_respects_slowest_member() {
        let pool = open_pool();
        pool.join(info("a")).await.unwrap(); // 0
        pool.join(info("b")).await.unwrap(); // 1
        pool.leave(id("a")).await.unwrap(); // 2

        let report = pool.compact(Instant::now()).await;
        assert!(report.died.is_empty());
        assert_eq!(report.floor, EventTime::from_raw(1));
        assert_eq!(report.purged, 1);
        assert!(pool.event(EventTime::zero()).await.is_none());

        let err = pool.pull(id("b"), EventTime::zero()).await.unwrap_err();
        assert!(matches!(err, RegistryError::Resynchronize { .. }));

        // B still gets everything it has not seen
        let result = pool.pull(id("b"), EventTime::from_raw(2)).await.unwrap();
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].kind, EventKind::Leave);

        let report = pool.compact(Instant::now()).await;
        assert_eq!(report.floor, EventTime::from_raw(2));
    }

    #[tokio::test]
    async fn test_compaction_disabled() {
        let pool = pool_with(PoolPolicy::open().with_purge_history(false)).0;
        pool.join(info("a")).await.unwrap();
        pool.join(info("b")).await.unwrap();
        pool.pull(id("a"), EventTime::from_raw(1)).await.unwrap();
        pool.pull(id("b"), EventTime::from_raw(2)).await.unwrap();
        let report = pool.compact(Instant::now()).await;
        assert_eq!(report.purged, 0);
        assert_eq!(pool.floor().await, EventTime::zero());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_declares_death() {
        let policy = PoolPolicy::open()
            .with_heartbeat_interval(100)
            .with_missed_heartbeats(1);
        let pool = pool_with(policy).0;
        pool.join(info("a")).await.unwrap();
        pool.join(info("b")).await.unwrap();

        tokio::time::advance(Duration::from_millis(50)).await;
        pool.heartbeat(id("a")).await.unwrap();
        tokio::time::advance(Duration::from_millis(80)).await;

        let report = pool.compact(Instant::now()).await;
        assert_eq!(report.died, vec![id("b")]);
        assert!(!pool.is_member(id("b")).await);
        assert!(pool.is_member(id("a")).await);

        let died = pool.event(EventTime::from_raw(2)).await.unwrap();
        assert_eq!(died.kind, EventKind::Died);
        assert_eq!(died.subject, Some(id("b")));
        assert_eq!(pool.stats().await.deaths, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_maybe_dead() {
        let pool = open_pool();
        pool.join(info("a")).await.unwrap();
        assert!(!pool.maybe_dead(id("a")).await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(pool.maybe_dead(id("a")).await.unwrap());

        let report = pool.compact(Instant::now()).await;
        assert_eq!(report.died, vec![id("a")]);
    }

    #[tokio::test]
    async fn test_terminate() {
        let pool = open_pool();
        pool.join(info("a")).await.unwrap();
        pool.join(info("b")).await.unwrap();

        let t = pool.terminate(Some(id("a"))).await.unwrap();
        assert_eq!(t, EventTime::from_raw(3));
        assert!(pool.has_ended());
        assert_eq!(
            pool.event(EventTime::from_raw(2)).await.unwrap().kind,
            EventKind::PoolClosed
        );
        assert_eq!(pool.event(t).await.unwrap().kind, EventKind::PoolTerminated);

        assert!(matches!(
            pool.signal(id("a"), "late", None).await,
            Err(RegistryError::PoolClosed(_))
        ));
        assert!(matches!(
            pool.terminate(None).await,
            Err(RegistryError::PoolClosed(_))
        ));

        // Members can still catch up on the final events
        let result = pool.pull(id("b"), EventTime::from_raw(2)).await.unwrap();
        assert_eq!(result.events.len(), 2);

        let stats = pool.stats().await;
        assert!(stats.terminated && stats.ended && stats.closed);
    }

    #[tokio::test]
    async fn test_sequence_numbers() {
        let pool = open_pool();
        assert_eq!(pool.sequence_number("jobs").await.unwrap(), 0);
        assert_eq!(pool.sequence_number("jobs").await.unwrap(), 1);
        assert_eq!(pool.sequence_number("other").await.unwrap(), 0);
        assert_eq!(pool.sequence_number("jobs").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_for_resynchronizing_member() {
        let pool = open_pool();
        pool.join(info("a").with_data(vec![9])).await.unwrap();
        pool.join(info("b")).await.unwrap();
        pool.elect("master", id("b")).await.unwrap();
        pool.signal(id("a"), "to-b", Some(&[id("b")])).await.unwrap();
        pool.signal(id("a"), "to-all", None).await.unwrap();
        pool.leave(id("a")).await.unwrap();

        let snapshot = pool.snapshot(id("b")).await.unwrap();
        assert_eq!(snapshot.event_time, EventTime::from_raw(6));
        assert_eq!(snapshot.members.len(), 1);
        assert_eq!(snapshot.members[0].subject, Some(id("b")));
        assert_eq!(snapshot.elections.get("master"), Some(&id("b")));
        let tags: Vec<_> = snapshot.signals.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(tags, vec!["to-b", "to-all"]);
        assert!(!snapshot.closed);

        assert_eq!(current_time_of(&pool, "b").await, Some(EventTime::from_raw(5)));
    }

    #[tokio::test]
    async fn test_snapshot_filters_signals_by_target() {
        let pool = open_pool();
        pool.join(info("a")).await.unwrap();
        pool.join(info("b")).await.unwrap();
        pool.signal(id("b"), "to-b", Some(&[id("b")])).await.unwrap();

        let snapshot = pool.snapshot(id("a")).await.unwrap();
        assert!(snapshot.signals.is_empty());
        assert_eq!(snapshot.members.len(), 2);
        assert_eq!(snapshot.members[0].subject, Some(id("a")));
    }

    #[tokio::test]
    async fn test_signal_to_departed_members_reaches_nobody() {
        let pool = open_pool();
        pool.join(info("a")).await.unwrap();
        pool.join(info("b")).await.unwrap();
        pool.join(info("c")).await.unwrap();
        pool.leave(id("c")).await.unwrap();

        let t = pool.signal(id("a"), "only-c", Some(&[id("c")])).await.unwrap();
        let event = pool.event(t).await.unwrap();
        assert_eq!(event.targets, Some(Vec::new()));
        assert!(!event.is_addressed_to(&id("b")));

        let snapshot = pool.snapshot(id("b")).await.unwrap();
        assert!(snapshot.signals.is_empty());

        // Absent targets still broadcast
        pool.signal(id("a"), "all", None).await.unwrap();
        let snapshot = pool.snapshot(id("b")).await.unwrap();
        assert_eq!(snapshot.signals.len(), 1);
        assert_eq!(snapshot.signals[0].label, "all");
    }

    #[tokio::test]
    async fn test_bootstrap_peers() {
        let pool = open_pool();
        for i in 0..5 {
            pool.join(info(&format!("m{}", i))).await.unwrap();
        }
        assert_eq!(pool.bootstrap_peers(3).await.len(), 3);
        assert_eq!(pool.bootstrap_peers(BOOTSTRAP_LIST_SIZE).await.len(), 5);
    }

    #[tokio::test]
    async fn test_wait_for_event_time() {
        let pool = open_pool();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.wait_for_event_time(EventTime::from_raw(1), Duration::from_secs(5))
                    .await
            })
        };
        pool.join(info("a")).await.unwrap();
        pool.join(info("b")).await.unwrap();
        assert!(waiter.await.unwrap());

        assert!(
            !pool
                .wait_for_event_time(EventTime::from_raw(10), Duration::from_millis(20))
                .await
        );
    }

    #[tokio::test]
    async fn test_wait_for_event_time_returns_on_end() {
        let (pool, _) = pool_with(PoolPolicy::closed(1));
        pool.join(info("a")).await.unwrap();
        pool.leave(id("a")).await.unwrap();
        assert!(
            !pool
                .wait_for_event_time(EventTime::from_raw(100), Duration::from_secs(5))
                .await
        );
    }

    #[tokio::test]
    async fn test_push_brings_members_up_to_date() {
        let (pool, transport) = pool_with(PoolPolicy::open());
        pool.join(reachable("a")).await.unwrap();
        pool.join(reachable("b")).await.unwrap();

        eventually(|| async { current_time_of(&pool, "a").await == Some(EventTime::from_raw(1)) })
            .await;

        let batches = transport.pushes_to("a");
        let times: Vec<u64> = batches
            .iter()
            .flat_map(|b| b.events.iter().map(|e| e.time.as_u64()))
            .collect();
        assert_eq!(times, vec![1]);
        // B joined at the latest time; nothing to send yet
        assert!(transport.pushes_to("b").is_empty());
    }

    #[tokio::test]
    async fn test_pull_only_members_are_not_pushed() {
        let (pool, transport) = pool_with(PoolPolicy::open());
        pool.join(info("a")).await.unwrap();
        pool.join(info("b")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(transport.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_failed_push_is_retried() {
        let (pool, transport) = pool_with(PoolPolicy::open().with_push_retry(10));
        transport.set_failing(true);
        pool.join(reachable("a")).await.unwrap();
        pool.join(reachable("b")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(current_time_of(&pool, "a").await, Some(EventTime::zero()));

        transport.set_failing(false);
        eventually(|| async { current_time_of(&pool, "a").await == Some(EventTime::from_raw(1)) })
            .await;
    }

    #[tokio::test]
    async fn test_tree_dissemination_reaches_every_member() {
        let policy = PoolPolicy::open().with_topology(Topology::Tree { fanout: 1 });
        let (pool, _) = pool_with(policy);
        for name in ["a", "b", "c", "d"] {
            pool.join(reachable(name)).await.unwrap();
        }
        pool.signal(id("a"), "go", None).await.unwrap();

        for name in ["a", "b", "c", "d"] {
            eventually(|| async {
                current_time_of(&pool, name).await == Some(EventTime::from_raw(4))
            })
            .await;
        }
    }

    #[tokio::test]
    async fn test_compaction_requeues_laggards() {
        let (pool, transport) = pool_with(PoolPolicy::open());
        transport.set_failing(true);
        pool.join(reachable("a")).await.unwrap();
        pool.join(info("b")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        transport.set_failing(false);
        pool.compact(Instant::now()).await;
        eventually(|| async { current_time_of(&pool, "a").await == Some(EventTime::from_raw(1)) })
            .await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let pool = open_pool();
        pool.shutdown();
        tokio::time::timeout(Duration::from_secs(1), pool.join_worker())
            .await
            .unwrap();
    }
}
