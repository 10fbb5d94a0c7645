//! Registry service.
//!
//! Owns the name→pool directory and a background reaper task. The reaper
//! wakes on an interval or on [`RegistryService::notify`], compacts every
//! pool, prints statistics when asked to, and drops pools that have ended.
//! The directory lock is never held while a pool does its own work.

use crate::config::{PoolPolicy, RegistryConfig};
use crate::error::{RegistryError, RegistryResult};
use crate::member::{MemberInfo, MemberSummary};
use crate::pool::{JoinOutcome, Pool, PullResult};
use crate::stats::StatsTable;
use crate::transport::PushTransport;
use conclave_core::{EventTime, MemberId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one reaper pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Pools compacted
    pub pools: usize,
    /// Members declared dead across all pools
    pub died: usize,
    /// Events purged across all pools
    pub purged: usize,
    /// Ended pools removed from the directory
    pub removed: Vec<String>,
}

/// Directory of pools
pub struct RegistryService {
    config: RegistryConfig,
    transport: Arc<dyn PushTransport>,
    pools: RwLock<BTreeMap<String, Arc<Pool>>>,
    stopped: AtomicBool,
    wakeup: Arc<Notify>,
    emptied: Notify,
    shutdown: CancellationToken,
    reaper: StdMutex<Option<JoinHandle<()>>>,
    last_stats: StdMutex<Option<Instant>>,
}

impl RegistryService {
    /// Create the service and start its reaper
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: RegistryConfig, transport: Arc<dyn PushTransport>) -> Arc<Self> {
        let interval = config.reaper_interval();
        let service = Arc::new(Self {
            config,
            transport,
            pools: RwLock::new(BTreeMap::new()),
            stopped: AtomicBool::new(false),
            wakeup: Arc::new(Notify::new()),
            emptied: Notify::new(),
            shutdown: CancellationToken::new(),
            reaper: StdMutex::new(None),
            last_stats: StdMutex::new(None),
        });

        let handle = tokio::spawn(reap_loop(
            Arc::downgrade(&service),
            service.wakeup.clone(),
            service.shutdown.clone(),
            interval,
        ));
        if let Ok(mut slot) = service.reaper.lock() {
            *slot = Some(handle);
        }

        info!(
            reaper_interval_ms = service.config.reaper_interval_ms,
            print_stats = service.config.print_stats,
            print_events = service.config.print_events,
            "registry started"
        );
        service
    }

    /// Service configuration
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Whether `end` has been called
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Pool `name`, creating it with `policy` (or the default policy) if
    /// absent
    ///
    /// Exactly one live pool exists per name; concurrent first callers all
    /// get the same one. The policy of an existing pool is never changed.
    /// An ended pool still awaiting the reaper is replaced by a fresh one.
    ///
    /// # Errors
    ///
    /// [`RegistryError::ShuttingDown`] once `end` has been called,
    /// [`RegistryError::Invalid`] for an invalid policy
    pub async fn get_or_create(
        &self,
        name: &str,
        policy: Option<PoolPolicy>,
    ) -> RegistryResult<Arc<Pool>> {
        if self.is_stopped() {
            return Err(RegistryError::ShuttingDown);
        }
        if let Some(pool) = self.pools.read().await.get(name) {
            if !pool.has_ended() {
                return Ok(pool.clone());
            }
        }

        let policy = policy.unwrap_or_else(|| self.config.default_policy.clone());
        policy.validate()?;

        let mut pools = self.pools.write().await;
        if self.is_stopped() {
            return Err(RegistryError::ShuttingDown);
        }
        if let Some(existing) = pools.get(name) {
            if !existing.has_ended() {
                return Ok(existing.clone());
            }
            debug!(pool = %name, "replacing ended pool");
        }
        let pool = Pool::spawn(
            name,
            policy,
            self.transport.clone(),
            self.config.print_events,
            self.shutdown.child_token(),
        );
        pools.insert(name.to_string(), pool.clone());
        Ok(pool)
    }

    /// Existing pool `name`
    ///
    /// # Errors
    ///
    /// [`RegistryError::PoolNotFound`] if no such pool exists
    pub async fn pool(&self, name: &str) -> RegistryResult<Arc<Pool>> {
        self.pools
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::PoolNotFound(name.to_string()))
    }

    /// Join pool `name`, creating the pool if needed
    ///
    /// # Errors
    ///
    /// See [`RegistryService::get_or_create`] and [`Pool::join`]
    pub async fn join(
        &self,
        name: &str,
        policy: Option<PoolPolicy>,
        info: MemberInfo,
    ) -> RegistryResult<JoinOutcome> {
        let pool = self.get_or_create(name, policy).await?;
        pool.join(info).await
    }

    /// Member leaves pool `name`
    ///
    /// # Errors
    ///
    /// Unknown pool or member, or the pool has ended
    pub async fn leave(&self, name: &str, member: MemberId) -> RegistryResult<EventTime> {
        let time = self.pool(name).await?.leave(member).await?;
        self.notify_if_ended(name).await;
        Ok(time)
    }

    /// Member of pool `name` crashed
    ///
    /// # Errors
    ///
    /// Unknown pool or member, or the pool has ended
    pub async fn die(&self, name: &str, member: MemberId) -> RegistryResult<EventTime> {
        let time = self.pool(name).await?.die(member).await?;
        self.notify_if_ended(name).await;
        Ok(time)
    }

    /// Decide an election in pool `name`
    ///
    /// # Errors
    ///
    /// Unknown pool or candidate, or the pool has ended
    pub async fn elect(
        &self,
        name: &str,
        election: &str,
        candidate: MemberId,
    ) -> RegistryResult<MemberId> {
        self.pool(name).await?.elect(election, candidate).await
    }

    /// Append a signal to pool `name`
    ///
    /// # Errors
    ///
    /// Unknown pool or source, or the pool has ended
    pub async fn signal(
        &self,
        name: &str,
        source: MemberId,
        tag: &str,
        targets: Option<&[MemberId]>,
    ) -> RegistryResult<EventTime> {
        self.pool(name).await?.signal(source, tag, targets).await
    }

    /// Liveness report for a member of pool `name`
    ///
    /// # Errors
    ///
    /// Unknown pool or member, or the pool has ended
    pub async fn heartbeat(&self, name: &str, member: MemberId) -> RegistryResult<()> {
        self.pool(name).await?.heartbeat(member).await
    }

    /// Events of pool `name` starting at `from`
    ///
    /// # Errors
    ///
    /// Unknown pool, or history before `from` was purged
    pub async fn pull(
        &self,
        name: &str,
        member: MemberId,
        from: EventTime,
    ) -> RegistryResult<PullResult> {
        self.pool(name).await?.pull(member, from).await
    }

    /// End pool `name` explicitly
    ///
    /// # Errors
    ///
    /// Unknown pool or source, or the pool has ended
    pub async fn terminate(
        &self,
        name: &str,
        source: Option<MemberId>,
    ) -> RegistryResult<EventTime> {
        let time = self.pool(name).await?.terminate(source).await?;
        self.notify();
        Ok(time)
    }

    /// Members of pool `name`; empty for an unknown pool
    pub async fn members(&self, name: &str) -> Vec<MemberSummary> {
        match self.pool(name).await {
            Ok(pool) => pool.members().await,
            Err(_) => Vec::new(),
        }
    }

    /// Names of all pools in the directory
    pub async fn pool_names(&self) -> Vec<String> {
        self.pools.read().await.keys().cloned().collect()
    }

    /// Current size of every pool
    pub async fn pool_sizes(&self) -> BTreeMap<String, usize> {
        let mut sizes = BTreeMap::new();
        for pool in self.snapshot_pools().await {
            sizes.insert(pool.name().to_string(), pool.size().await);
        }
        sizes
    }

    /// Per-pool counters
    pub async fn stats(&self) -> StatsTable {
        let mut rows = Vec::new();
        for pool in self.snapshot_pools().await {
            rows.push(pool.stats().await);
        }
        StatsTable(rows)
    }

    /// Wake the reaper early
    pub fn notify(&self) {
        self.wakeup.notify_one();
    }

    /// One reaper pass
    ///
    /// Compacts every pool, prints statistics if due, then removes ended
    /// pools. Public so it can be driven directly in tests.
    pub async fn reap_once(&self, now: Instant) -> ReapReport {
        let mut report = ReapReport::default();
        for pool in self.snapshot_pools().await {
            let compaction = pool.compact(now).await;
            report.pools += 1;
            report.died += compaction.died.len();
            report.purged += compaction.purged;
        }

        if self.config.print_stats && self.stats_due(now) {
            let table = self.stats().await;
            info!("\n{}", table);
        }

        let mut pools = self.pools.write().await;
        pools.retain(|name, pool| {
            if pool.has_ended() {
                report.removed.push(name.clone());
                false
            } else {
                true
            }
        });
        let empty = pools.is_empty();
        drop(pools);

        for name in &report.removed {
            info!(pool = %name, "removed ended pool");
        }
        if empty {
            self.emptied.notify_waiters();
        }
        report
    }

    /// Stop accepting pools and wait until every pool has ended
    ///
    /// Returns `true` if the directory emptied before `timeout`. Either
    /// way the reaper and all dissemination workers are stopped on return.
    pub async fn end(&self, timeout: Duration) -> bool {
        self.stopped.store(true, Ordering::SeqCst);
        info!(timeout_ms = timeout.as_millis() as u64, "registry ending");

        let deadline = Instant::now() + timeout;
        let slice = self.config.reaper_interval().min(Duration::from_millis(100));
        let mut clean = false;
        loop {
            if self.pools.read().await.is_empty() {
                clean = true;
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let emptied = self.emptied.notified();
            self.notify();
            let wait = slice.min(deadline - now);
            let _ = tokio::time::timeout(wait, emptied).await;
        }

        let remaining: Vec<Arc<Pool>> = {
            let mut pools = self.pools.write().await;
            std::mem::take(&mut *pools).into_values().collect()
        };
        if !remaining.is_empty() {
            warn!(pools = remaining.len(), "pools still active at shutdown");
        }
        self.shutdown.cancel();
        for pool in &remaining {
            pool.shutdown();
        }
        for pool in &remaining {
            pool.join_worker().await;
        }

        let reaper = match self.reaper.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(reaper) = reaper {
            if let Err(err) = reaper.await {
                debug!(error = %err, "reaper aborted");
            }
        }
        info!(clean, "registry ended");
        clean
    }

    async fn snapshot_pools(&self) -> Vec<Arc<Pool>> {
        self.pools.read().await.values().cloned().collect()
    }

    async fn notify_if_ended(&self, name: &str) {
        if let Ok(pool) = self.pool(name).await {
            if pool.has_ended() {
                self.notify();
            }
        }
    }

    fn stats_due(&self, now: Instant) -> bool {
        let mut last = match self.last_stats.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let due = match *last {
            Some(at) => now.saturating_duration_since(at) >= self.config.stats_interval(),
            None => true,
        };
        if due {
            *last = Some(now);
        }
        due
    }
}

impl std::fmt::Debug for RegistryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryService")
            .field("config", &self.config)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

async fn reap_loop(
    service: Weak<RegistryService>,
    wakeup: Arc<Notify>,
    shutdown: CancellationToken,
    interval: Duration,
) {
    debug!("reaper started");
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = wakeup.notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }
        let Some(service) = service.upgrade() else {
            break;
        };
        let report = service.reap_once(Instant::now()).await;
        if report.died > 0 || !report.removed.is_empty() {
            debug!(
                died = report.died,
                purged = report.purged,
                removed = report.removed.len(),
                "reaper pass"
            );
        }
    }
    debug!("reaper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolPhase;
    use crate::transport::testing::RecordingTransport;
    use conclave_log::EventKind;

    fn id(name: &str) -> MemberId {
        MemberId::from_name(name)
    }

    fn info(name: &str) -> MemberInfo {
        MemberInfo::new(id(name), name)
    }

    fn service() -> Arc<RegistryService> {
        service_with(RegistryConfig::default())
    }

    fn service_with(config: RegistryConfig) -> Arc<RegistryService> {
        RegistryService::start(config, Arc::new(RecordingTransport::default()))
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_pool() {
        let registry = service();
        let a = registry.get_or_create("t1", None).await.unwrap();
        let b = registry
            .get_or_create("t1", Some(PoolPolicy::closed(3)))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        // First creator's policy sticks
        assert!(!b.policy().closed_world);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_joins_share_one_pool() {
        let registry = service();
        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .join("t1", None, info(&format!("m{}", i)))
                    .await
                    .unwrap()
                    .time
            }));
        }
        let mut times = Vec::new();
        for handle in handles {
            times.push(handle.await.unwrap().as_u64());
        }
        times.sort_unstable();
        assert_eq!(times, (0..16).collect::<Vec<u64>>());
        assert_eq!(registry.pool_names().await, vec!["t1".to_string()]);
        assert_eq!(registry.members("t1").await.len(), 16);
    }

    #[tokio::test]
    async fn test_join_then_pull_by_name() {
        let registry = service();
        assert_eq!(
            registry.join("t1", None, info("a")).await.unwrap().time,
            EventTime::zero()
        );
        assert_eq!(
            registry.join("t1", None, info("b")).await.unwrap().time,
            EventTime::from_raw(1)
        );
        let pulled = registry
            .pull("t1", id("reader"), EventTime::zero())
            .await
            .unwrap();
        assert_eq!(pulled.events.len(), 2);
        assert!(pulled.events.iter().all(|e| e.kind == EventKind::Join));
    }

    #[tokio::test]
    async fn test_unknown_pool() {
        let registry = service();
        let err = registry.leave("nope", id("a")).await.unwrap_err();
        assert_eq!(err, RegistryError::PoolNotFound("nope".to_string()));
        assert!(registry.heartbeat("nope", id("a")).await.is_err());
        assert!(registry.elect("nope", "master", id("a")).await.is_err());
        assert!(registry.members("nope").await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_policy_rejected() {
        let registry = service();
        let err = registry
            .get_or_create("bad", Some(PoolPolicy::closed(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Invalid(_)));
        assert!(registry.pool_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_elect_through_service() {
        let registry = service();
        registry.join("t1", None, info("a")).await.unwrap();
        registry.join("t1", None, info("b")).await.unwrap();
        let (first, second) = tokio::join!(
            registry.elect("t1", "master", id("a")),
            registry.elect("t1", "master", id("b"))
        );
        assert_eq!(first.unwrap(), second.unwrap());
    }

    #[tokio::test]
    async fn test_reaper_removes_ended_pools() {
        let registry = service();
        registry
            .join("fixed", Some(PoolPolicy::closed(1)), info("a"))
            .await
            .unwrap();
        registry.join("open", None, info("b")).await.unwrap();
        // Straight to the pool so the reaper is not woken early
        registry
            .pool("fixed")
            .await
            .unwrap()
            .leave(id("a"))
            .await
            .unwrap();

        let report = registry.reap_once(Instant::now()).await;
        assert_eq!(report.removed, vec!["fixed".to_string()]);
        assert_eq!(registry.pool_names().await, vec!["open".to_string()]);
    }

    #[tokio::test]
    async fn test_ended_pool_is_replaced() {
        let registry = service();
        let old = registry.get_or_create("t1", None).await.unwrap();
        registry.join("t1", None, info("a")).await.unwrap();
        registry.terminate("t1", None).await.unwrap();
        assert!(old.has_ended());

        let fresh = registry.get_or_create("t1", None).await.unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert_eq!(fresh.phase().await, PoolPhase::Open);
        assert_eq!(
            registry.join("t1", None, info("a")).await.unwrap().time,
            EventTime::zero()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_declares_silent_members_dead() {
        let policy = PoolPolicy::open()
            .with_heartbeat_interval(100)
            .with_missed_heartbeats(2);
        let config = RegistryConfig::default()
            .with_reaper_interval(50)
            .with_default_policy(policy);
        let registry = service_with(config);
        registry.join("t1", None, info("a")).await.unwrap();
        registry.join("t1", None, info("b")).await.unwrap();

        for _ in 0..6 {
            tokio::time::advance(Duration::from_millis(50)).await;
            registry.heartbeat("t1", id("a")).await.unwrap();
        }
        // Let the reaper run its pass
        tokio::time::sleep(Duration::from_millis(60)).await;

        let members: Vec<MemberId> = registry
            .members("t1")
            .await
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(members, vec![id("a")]);
        let stats = registry.stats().await;
        assert_eq!(stats.rows()[0].deaths, 1);
    }

    #[tokio::test]
    async fn test_stats_and_sizes() {
        let registry = service();
        registry.join("a", None, info("x")).await.unwrap();
        registry.join("a", None, info("y")).await.unwrap();
        registry
            .join("b", Some(PoolPolicy::closed(4)), info("z"))
            .await
            .unwrap();

        let sizes = registry.pool_sizes().await;
        assert_eq!(sizes.get("a"), Some(&2));
        assert_eq!(sizes.get("b"), Some(&1));

        let table = registry.stats().await;
        assert_eq!(table.total_members(), 3);
        assert_eq!(table.rows()[1].fixed_size, Some(4));
    }

    #[tokio::test]
    async fn test_end_waits_for_pools() {
        let registry = service_with(RegistryConfig::default().with_reaper_interval(10));
        registry
            .join("t1", Some(PoolPolicy::closed(1)), info("a"))
            .await
            .unwrap();

        let ender = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.end(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.is_stopped());
        assert!(matches!(
            registry.join("t2", None, info("b")).await,
            Err(RegistryError::ShuttingDown)
        ));

        registry.leave("t1", id("a")).await.unwrap();
        assert!(ender.await.unwrap());
        assert!(registry.pool_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_end_times_out_with_live_pools() {
        let registry = service();
        registry.join("t1", None, info("a")).await.unwrap();
        assert!(!registry.end(Duration::from_millis(50)).await);
        assert!(registry.pool_names().await.is_empty());
    }
}
