//! Pool policies and registry configuration.

use conclave_core::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shape of the dissemination topology
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Topology {
    /// Every member is a direct child of the registry (plain broadcast)
    #[default]
    Flat,
    /// Members form a k-ary tree in join order
    Tree {
        /// Children per node
        fanout: usize,
    },
}

/// Per-pool policy, fixed when the pool is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolPolicy {
    /// Fixed-size pool that stops accepting joins once full
    pub closed_world: bool,
    /// Number of joins after which a closed-world pool is complete
    pub target_size: usize,
    /// Interval at which members are expected to heartbeat
    pub heartbeat_interval_ms: u64,
    /// Heartbeats a member may miss before it is declared dead
    pub missed_heartbeats: u32,
    /// Whether the reaper compacts the event log
    pub purge_history: bool,
    /// Dissemination topology
    pub topology: Topology,
    /// Delay before a failed push is retried
    pub push_retry_ms: u64,
}

impl PoolPolicy {
    /// Open-world policy with default timings
    #[must_use]
    pub fn open() -> Self {
        Self::default()
    }

    /// Closed-world policy for a pool of `target_size` members
    #[must_use]
    pub fn closed(target_size: usize) -> Self {
        Self {
            closed_world: true,
            target_size,
            ..Self::default()
        }
    }

    /// Set heartbeat interval
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    /// Set tolerated missed heartbeats
    #[must_use]
    pub fn with_missed_heartbeats(mut self, missed: u32) -> Self {
        self.missed_heartbeats = missed;
        self
    }

    /// Enable or disable log compaction
    #[must_use]
    pub fn with_purge_history(mut self, purge: bool) -> Self {
        self.purge_history = purge;
        self
    }

    /// Set dissemination topology
    #[must_use]
    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Set push retry delay
    #[must_use]
    pub fn with_push_retry(mut self, retry_ms: u64) -> Self {
        self.push_retry_ms = retry_ms;
        self
    }

    /// Time without contact after which a member is declared dead
    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(
            self.heartbeat_interval_ms
                .saturating_mul(u64::from(self.missed_heartbeats.max(1))),
        )
    }

    /// Delay before a failed push is retried
    #[must_use]
    pub fn push_retry(&self) -> Duration {
        Duration::from_millis(self.push_retry_ms)
    }

    /// Reject policies the pool cannot honor
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] naming the offending field
    pub fn validate(&self) -> CoreResult<()> {
        if self.closed_world && self.target_size == 0 {
            return Err(CoreError::Validation {
                field: "target_size".to_string(),
                reason: "closed-world pools need a positive target size".to_string(),
            });
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(CoreError::Validation {
                field: "heartbeat_interval_ms".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if let Topology::Tree { fanout: 0 } = self.topology {
            return Err(CoreError::Validation {
                field: "topology.fanout".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            closed_world: false,
            target_size: 0,
            heartbeat_interval_ms: 60_000,
            missed_heartbeats: 3,
            purge_history: true,
            topology: Topology::Flat,
            push_retry_ms: 1_000,
        }
    }
}

/// Registry service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Period of the reaper pass
    pub reaper_interval_ms: u64,
    /// Log a statistics table periodically
    pub print_stats: bool,
    /// Minimum time between two statistics tables
    pub stats_interval_ms: u64,
    /// Log every join, leave, and death at info level
    pub print_events: bool,
    /// Connect timeout for pushes to members
    pub connect_timeout_ms: u64,
    /// Policy used when a client does not supply one
    pub default_policy: PoolPolicy,
}

impl RegistryConfig {
    /// Create a config with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set reaper interval
    #[must_use]
    pub fn with_reaper_interval(mut self, interval_ms: u64) -> Self {
        self.reaper_interval_ms = interval_ms;
        self
    }

    /// Enable statistics output
    #[must_use]
    pub fn with_print_stats(mut self, print: bool) -> Self {
        self.print_stats = print;
        self
    }

    /// Enable membership event output
    #[must_use]
    pub fn with_print_events(mut self, print: bool) -> Self {
        self.print_events = print;
        self
    }

    /// Set push connect timeout
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }

    /// Set the default pool policy
    #[must_use]
    pub fn with_default_policy(mut self, policy: PoolPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Period of the reaper pass
    #[must_use]
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms.max(1))
    }

    /// Minimum time between two statistics tables
    #[must_use]
    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    /// Push connect timeout
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            reaper_interval_ms: 1_000,
            print_stats: false,
            stats_interval_ms: 60_000,
            print_events: false,
            connect_timeout_ms: 5_000,
            default_policy: PoolPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_defaults() {
        let policy = PoolPolicy::open();
        assert!(!policy.closed_world);
        assert!(policy.purge_history);
        assert_eq!(policy.topology, Topology::Flat);
        assert_eq!(policy.heartbeat_timeout(), Duration::from_secs(180));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_closed_policy_validation() {
        assert!(PoolPolicy::closed(4).validate().is_ok());

        let err = PoolPolicy::closed(0).validate().unwrap_err();
        assert!(matches!(err, CoreError::Validation { ref field, .. } if field == "target_size"));
    }

    #[test]
    fn test_tree_fanout_validation() {
        let policy = PoolPolicy::open().with_topology(Topology::Tree { fanout: 0 });
        assert!(policy.validate().is_err());

        let policy = PoolPolicy::open().with_topology(Topology::Tree { fanout: 2 });
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_heartbeat_timeout_uses_missed_count() {
        let policy = PoolPolicy::open()
            .with_heartbeat_interval(100)
            .with_missed_heartbeats(5);
        assert_eq!(policy.heartbeat_timeout(), Duration::from_millis(500));

        // Zero missed heartbeats still allows one interval
        let policy = policy.with_missed_heartbeats(0);
        assert_eq!(policy.heartbeat_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn test_policy_partial_json() {
        let policy: PoolPolicy =
            serde_json::from_str(r#"{"closed_world": true, "target_size": 2}"#).unwrap();
        assert_eq!(policy, PoolPolicy::closed(2));

        let policy: PoolPolicy =
            serde_json::from_str(r#"{"topology": {"kind": "tree", "fanout": 3}}"#).unwrap();
        assert_eq!(policy.topology, Topology::Tree { fanout: 3 });
    }

    #[test]
    fn test_registry_config_builder() {
        let config = RegistryConfig::new()
            .with_reaper_interval(250)
            .with_print_stats(true)
            .with_print_events(true)
            .with_default_policy(PoolPolicy::closed(8));
        assert_eq!(config.reaper_interval(), Duration::from_millis(250));
        assert!(config.print_stats);
        assert!(config.print_events);
        assert_eq!(config.default_policy.target_size, 8);
    }
}
