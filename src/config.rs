//! Configuration
//!
//! YAML-backed settings for the cache manager and its caches. Names of
//! eviction policies and timeout behaviors are kept as strings so that
//! [`CacheManagerConfig::validate`] can reject unknown ones with a precise
//! error before any cache is built.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::Consistency;
use crate::error::{Error, Result};
use crate::nonstop::TimeoutBehavior;
use crate::store::{EvictionMode, EvictionPolicyKind, LifespanDefaults, TierCapacity};

// =============================================================================
// Manager
// =============================================================================

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheManagerConfig {
    pub name: String,

    /// Interval of the background expiry sweep, seconds; 0 disables it
    pub expiry_interval_secs: u64,

    /// Default transaction timeout, seconds
    pub transaction_timeout_secs: u64,

    /// Cluster membership; required by clustered caches
    pub cluster: Option<ClusterConfig>,

    pub caches: Vec<CacheConfig>,
}

impl Default for CacheManagerConfig {
    fn default() -> Self {
        Self {
            name: "stratacache".to_string(),
            expiry_interval_secs: 30,
            transaction_timeout_secs: 15,
            cluster: None,
            caches: Vec::new(),
        }
    }
}

impl CacheManagerConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    pub fn expiry_interval(&self) -> Option<Duration> {
        (self.expiry_interval_secs > 0).then(|| Duration::from_secs(self.expiry_interval_secs))
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.transaction_timeout_secs == 0 {
            return Err(Error::Config(
                "transaction_timeout_secs must be positive".to_string(),
            ));
        }
        if let Some(cluster) = &self.cluster {
            cluster.validate()?;
        }

        let mut names = HashSet::new();
        for cache in &self.caches {
            cache.validate()?;
            if !names.insert(cache.name.as_str()) {
                return Err(Error::CacheAlreadyExists(cache.name.clone()));
            }
            if cache.clustered && self.cluster.is_none() {
                return Err(Error::Config(format!(
                    "cache {} is clustered but no cluster is configured",
                    cache.name
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Cluster
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// This node's identity
    pub node_id: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(Error::Config("cluster.node_id must not be empty".to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// Cache
// =============================================================================

/// Settings of one named cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub name: String,
    pub tiers: TierConfig,

    /// LRU, LFU, FIFO or CLOCK
    pub eviction_policy: String,
    pub eviction_mode: EvictionMode,

    /// Defaults for elements that set no lifespan; 0 means none
    pub time_to_live_secs: u32,
    pub time_to_idle_secs: u32,
    pub eternal: bool,

    /// Never evict elements of this cache
    pub pinned: bool,

    /// Writes require a transaction context
    pub transactional: bool,

    pub clustered: bool,
    pub consistency: Consistency,

    /// Start in bulk-load mode
    pub bulk_load: bool,

    pub nonstop: NonstopConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            tiers: TierConfig::default(),
            eviction_policy: EvictionPolicyKind::default().as_str().to_string(),
            eviction_mode: EvictionMode::default(),
            time_to_live_secs: 0,
            time_to_idle_secs: 0,
            eternal: false,
            pinned: false,
            transactional: false,
            clustered: false,
            consistency: Consistency::default(),
            bulk_load: false,
            nonstop: NonstopConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn eviction_policy_kind(&self) -> Result<EvictionPolicyKind> {
        self.eviction_policy.parse()
    }

    pub fn lifespan(&self) -> LifespanDefaults {
        LifespanDefaults {
            time_to_live: self.time_to_live_secs,
            time_to_idle: self.time_to_idle_secs,
            eternal: self.eternal,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("cache name must not be empty".to_string()));
        }
        self.eviction_policy_kind()?;
        self.nonstop.validate()?;

        if self.transactional && self.clustered {
            return Err(Error::Config(format!(
                "cache {}: transactional caches cannot be clustered",
                self.name
            )));
        }
        if self.bulk_load && !self.clustered {
            return Err(Error::Config(format!(
                "cache {}: bulk_load requires a clustered cache",
                self.name
            )));
        }
        if let Some(disk) = &self.tiers.disk {
            if disk.directory.as_os_str().is_empty() {
                return Err(Error::Config(format!(
                    "cache {}: disk tier directory must be set",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Tier layout of a cache; the heap tier always exists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    pub heap: TierCapacity,
    pub offheap: Option<TierCapacity>,
    pub disk: Option<DiskTierConfig>,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            heap: TierCapacity::entries(10_000),
            offheap: None,
            disk: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskTierConfig {
    /// Directory holding `<cache>.data`
    pub directory: PathBuf,
    #[serde(flatten)]
    pub capacity: TierCapacity,
}

impl DiskTierConfig {
    pub fn data_file(&self, cache: &str) -> PathBuf {
        self.directory.join(format!("{}.data", cache))
    }
}

// =============================================================================
// Nonstop
// =============================================================================

/// Deadline and fallback for clustered operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NonstopConfig {
    pub enabled: bool,

    /// Per-operation deadline, milliseconds
    pub timeout_millis: u64,

    /// exception, no_op or local_reads
    pub timeout_behavior: String,

    /// Time out at once while the cluster is unreachable
    pub immediate_timeout: bool,

    /// Overrides keyed by operation name (`get`, `put`, `acquire_write_lock`, ...)
    pub operation_timeouts_millis: HashMap<String, u64>,
}

impl Default for NonstopConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_millis: 30_000,
            timeout_behavior: TimeoutBehavior::default().as_str().to_string(),
            immediate_timeout: false,
            operation_timeouts_millis: HashMap::new(),
        }
    }
}

impl NonstopConfig {
    pub fn validate(&self) -> Result<()> {
        self.settings().map(|_| ())
    }

    /// Resolve into the form used on the data path
    pub fn settings(&self) -> Result<NonstopSettings> {
        if self.timeout_millis == 0 {
            return Err(Error::Config(
                "nonstop.timeout_millis must be positive".to_string(),
            ));
        }
        if let Some((op, _)) = self.operation_timeouts_millis.iter().find(|(_, ms)| **ms == 0) {
            return Err(Error::Config(format!(
                "nonstop timeout for {} must be positive",
                op
            )));
        }

        Ok(NonstopSettings {
            enabled: self.enabled,
            timeout: Duration::from_millis(self.timeout_millis),
            behavior: self.timeout_behavior.parse()?,
            immediate_timeout: self.immediate_timeout,
            operation_timeouts: self
                .operation_timeouts_millis
                .iter()
                .map(|(op, ms)| (op.clone(), Duration::from_millis(*ms)))
                .collect(),
        })
    }
}

/// Validated nonstop settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonstopSettings {
    pub enabled: bool,
    pub timeout: Duration,
    pub behavior: TimeoutBehavior,
    pub immediate_timeout: bool,
    pub operation_timeouts: HashMap<String, Duration>,
}

impl NonstopSettings {
    pub fn timeout_for(&self, operation: &str) -> Duration {
        self.operation_timeouts
            .get(operation)
            .copied()
            .unwrap_or(self.timeout)
    }
}

impl Default for NonstopSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_secs(30),
            behavior: TimeoutBehavior::default(),
            immediate_timeout: false,
            operation_timeouts: HashMap::new(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const SAMPLE: &str = r#"
name: demo
expiry_interval_secs: 5
cluster:
  node_id: node-a
caches:
  - name: sessions
    eviction_policy: lfu
    time_to_idle_secs: 10
    tiers:
      heap:
        max_entries: 4
      offheap:
        max_bytes: 1048576
  - name: catalog
    clustered: true
    consistency: eventual
    nonstop:
      timeout_millis: 250
      timeout_behavior: local_reads
      operation_timeouts_millis:
        get: 100
"#;

    #[test]
    fn test_parse_sample() {
        let config = CacheManagerConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.name, "demo");
        assert_eq!(config.expiry_interval(), Some(Duration::from_secs(5)));
        assert_eq!(config.transaction_timeout(), Duration::from_secs(15));

        let sessions = &config.caches[0];
        assert_eq!(sessions.eviction_policy_kind().unwrap(), EvictionPolicyKind::Lfu);
        assert_eq!(sessions.tiers.heap.max_entries, 4);
        assert_eq!(sessions.tiers.offheap.unwrap().max_bytes, 1_048_576);
        assert_eq!(sessions.lifespan().time_to_idle, 10);

        let catalog = &config.caches[1];
        assert_eq!(catalog.consistency, Consistency::Eventual);
        let settings = catalog.nonstop.settings().unwrap();
        assert_eq!(settings.behavior, TimeoutBehavior::LocalReads);
        assert_eq!(settings.timeout_for("get"), Duration::from_millis(100));
        assert_eq!(settings.timeout_for("put"), Duration::from_millis(250));
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let yaml = "caches:\n  - name: a\n    eviction_policy: random\n";
        assert_matches!(
            CacheManagerConfig::from_yaml_str(yaml),
            Err(Error::UnknownEvictionPolicy(name)) if name == "random"
        );
    }

    #[test]
    fn test_unknown_behavior_rejected() {
        let mut cache = CacheConfig::named("a");
        cache.nonstop.timeout_behavior = "retry".to_string();
        assert_matches!(cache.validate(), Err(Error::UnknownTimeoutBehavior(_)));
    }

    #[test]
    fn test_duplicate_cache_names_rejected() {
        let config = CacheManagerConfig {
            caches: vec![CacheConfig::named("a"), CacheConfig::named("a")],
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::CacheAlreadyExists(_)));
    }

    #[test]
    fn test_clustered_cache_needs_cluster() {
        let mut cache = CacheConfig::named("a");
        cache.clustered = true;
        let config = CacheManagerConfig {
            caches: vec![cache],
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_transactional_clustered_rejected() {
        let mut cache = CacheConfig::named("a");
        cache.clustered = true;
        cache.transactional = true;
        assert_matches!(cache.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut nonstop = NonstopConfig::default();
        nonstop.timeout_millis = 0;
        assert!(nonstop.validate().is_err());

        let mut nonstop = NonstopConfig::default();
        nonstop.operation_timeouts_millis.insert("get".into(), 0);
        assert!(nonstop.validate().is_err());
    }

    #[test]
    fn test_disk_data_file() {
        let disk = DiskTierConfig {
            directory: PathBuf::from("/var/cache/strata"),
            capacity: TierCapacity::entries(100),
        };
        assert_eq!(
            disk.data_file("sessions"),
            PathBuf::from("/var/cache/strata/sessions.data")
        );
    }
}
