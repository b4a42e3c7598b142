//! Cache Manager
//!
//! Owns every cache of a process together with the collaborators they
//! share: the nonstop executor, the transaction controller, the cluster
//! connection and the shutdown token. Nothing here is global; handles are
//! passed down explicitly when caches are built.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{build_store, Cache, ClusteredCache};
use crate::cluster::coherent::BULK_LOAD_FLUSH_INTERVAL;
use crate::cluster::{ClusterBackend, CoherentClusteredStore};
use crate::config::{CacheConfig, CacheManagerConfig};
use crate::error::{Error, Result};
use crate::nonstop::{NonstopExecutor, NonstopStore};
use crate::statistics::{PrometheusExporter, StatisticsSnapshot};
use crate::store::{Clock, SystemClock};
use crate::transaction::TransactionController;

// =============================================================================
// Builder
// =============================================================================

pub struct CacheManagerBuilder {
    config: CacheManagerConfig,
    cluster: Option<Arc<dyn ClusterBackend>>,
    clock: Arc<dyn Clock>,
}

impl CacheManagerBuilder {
    /// Connection used by clustered caches
    pub fn cluster(mut self, backend: Arc<dyn ClusterBackend>) -> Self {
        self.cluster = Some(backend);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the configuration, create its caches and start the
    /// background maintenance task
    pub async fn build(self) -> Result<Arc<CacheManager>> {
        self.config.validate()?;

        let manager = Arc::new(CacheManager {
            controller: Arc::new(TransactionController::new(self.config.transaction_timeout())),
            executor: Arc::new(NonstopExecutor::new()),
            caches: DashMap::new(),
            clustered: DashMap::new(),
            cluster: self.cluster,
            clock: self.clock,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            config: self.config,
        });

        for cache in manager.config.caches.clone() {
            manager.add_cache(cache).await?;
        }

        if let Some(interval) = manager.config.expiry_interval() {
            let handle = tokio::spawn(maintenance_loop(
                Arc::downgrade(&manager),
                interval,
                manager.shutdown.clone(),
            ));
            manager.tasks.lock().push(handle);
        }

        info!(
            manager = %manager.config.name,
            caches = manager.cache_names().len(),
            clustered = manager.cluster.is_some(),
            "Cache manager started"
        );
        Ok(manager)
    }
}

// =============================================================================
// Manager
// =============================================================================

pub struct CacheManager {
    config: CacheManagerConfig,
    caches: DashMap<String, Arc<Cache>>,
    clustered: DashMap<String, Arc<ClusteredCache>>,
    cluster: Option<Arc<dyn ClusterBackend>>,
    controller: Arc<TransactionController>,
    executor: Arc<NonstopExecutor>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheManager {
    pub fn builder(config: CacheManagerConfig) -> CacheManagerBuilder {
        CacheManagerBuilder {
            config,
            cluster: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn controller(&self) -> &Arc<TransactionController> {
        &self.controller
    }

    pub fn executor(&self) -> &Arc<NonstopExecutor> {
        &self.executor
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    /// Create a cache at runtime
    #[instrument(skip(self, config), fields(cache = %config.name))]
    pub async fn add_cache(&self, config: CacheConfig) -> Result<()> {
        self.ensure_running()?;
        config.validate()?;
        if self.caches.contains_key(&config.name) || self.clustered.contains_key(&config.name) {
            return Err(Error::CacheAlreadyExists(config.name));
        }

        if !config.clustered {
            let cache = Cache::new(config, Arc::clone(&self.clock), &self.controller)?;
            self.caches.insert(cache.name().to_string(), Arc::new(cache));
            return Ok(());
        }

        let backend = self
            .cluster
            .as_ref()
            .ok_or_else(|| Error::NotClustered(config.name.clone()))?;
        let local = build_store(&config, Arc::clone(&self.clock))?;
        let coherent = Arc::new(CoherentClusteredStore::new(
            local,
            Arc::clone(backend),
            config.consistency,
            self.shutdown.clone(),
        ));
        self.tasks
            .lock()
            .push(coherent.spawn_bulk_load_flusher(BULK_LOAD_FLUSH_INTERVAL));
        let nonstop = NonstopStore::new(
            coherent,
            Arc::clone(&self.executor),
            config.nonstop.settings()?,
        );
        let cache = ClusteredCache::new(config, nonstop);
        if cache.config().bulk_load {
            cache.set_node_coherent(false).await?;
        }
        self.clustered.insert(cache.name().to_string(), Arc::new(cache));
        Ok(())
    }

    pub fn cache(&self, name: &str) -> Result<Arc<Cache>> {
        self.ensure_running()?;
        self.caches
            .get(name)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| Error::CacheNotFound(name.to_string()))
    }

    pub fn clustered_cache(&self, name: &str) -> Result<Arc<ClusteredCache>> {
        self.ensure_running()?;
        match self.clustered.get(name) {
            Some(cache) => Ok(Arc::clone(cache.value())),
            None if self.caches.contains_key(name) => Err(Error::NotClustered(name.to_string())),
            None => Err(Error::CacheNotFound(name.to_string())),
        }
    }

    /// Names of all caches, sorted
    pub fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .caches
            .iter()
            .map(|c| c.key().clone())
            .chain(self.clustered.iter().map(|c| c.key().clone()))
            .collect();
        names.sort();
        names
    }

    /// Drop a local cache and its contents
    pub fn remove_cache(&self, name: &str) -> Result<()> {
        let (_, cache) = self
            .caches
            .remove(name)
            .ok_or_else(|| Error::CacheNotFound(name.to_string()))?;
        cache.store().remove_all()?;
        debug!(cache = name, "Removed cache");
        Ok(())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Expire elements in every cache and roll back abandoned transactions
    pub fn run_maintenance(&self) -> Result<usize> {
        let mut expired = 0;
        for cache in self.caches.iter() {
            expired += cache.expire_elements()?;
        }
        for cache in self.clustered.iter() {
            expired += cache.expire_elements()?;
        }

        let recovered = self.controller.recover()?;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "Recovered abandoned transactions");
        }
        Ok(expired)
    }

    /// Statistics of every cache keyed by name
    pub fn statistics(&self) -> BTreeMap<String, StatisticsSnapshot> {
        let mut all = BTreeMap::new();
        for cache in self.caches.iter() {
            all.insert(cache.key().clone(), cache.statistics());
        }
        for cache in self.clustered.iter() {
            all.insert(cache.key().clone(), cache.statistics());
        }
        all
    }

    /// Write the current statistics into `exporter`
    pub fn export(&self, exporter: &PrometheusExporter) {
        for (name, snapshot) in self.statistics() {
            exporter.record(&name, &snapshot);
        }
    }

    /// Stop background work; waits on coherence barriers are released with
    /// `Error::Shutdown`
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Maintenance task ended abnormally");
            }
        }
        info!(manager = %self.config.name, "Cache manager shut down");
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("name", &self.config.name)
            .field("caches", &self.cache_names())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

async fn maintenance_loop(
    manager: std::sync::Weak<CacheManager>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if let Err(e) = manager.run_maintenance() {
                    error!(error = %e, "Cache maintenance failed");
                }
            }
        }
    }
    debug!("Maintenance loop stopped");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{InMemoryCluster, LockContext};
    use crate::config::ClusterConfig;
    use crate::store::element::Element;
    use crate::store::ManualClock;
    use assert_matches::assert_matches;

    fn config(caches: Vec<CacheConfig>) -> CacheManagerConfig {
        CacheManagerConfig {
            expiry_interval_secs: 0,
            caches,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_caches_from_config() {
        let manager = CacheManager::builder(config(vec![
            CacheConfig::named("b"),
            CacheConfig::named("a"),
        ]))
        .build()
        .await
        .unwrap();

        assert_eq!(manager.cache_names(), vec!["a".to_string(), "b".to_string()]);
        manager.cache("a").unwrap().put(Element::new("k", "v")).unwrap();
        assert_eq!(manager.statistics()["a"].size, 1);
        assert_matches!(manager.cache("zzz"), Err(Error::CacheNotFound(_)));
        assert_matches!(manager.clustered_cache("a"), Err(Error::NotClustered(_)));

        assert_matches!(
            manager.add_cache(CacheConfig::named("a")).await,
            Err(Error::CacheAlreadyExists(_))
        );
        manager.remove_cache("a").unwrap();
        assert_matches!(manager.cache("a"), Err(Error::CacheNotFound(_)));
    }

    #[tokio::test]
    async fn test_clustered_cache_requires_backend() {
        let mut cache = CacheConfig::named("shared");
        cache.clustered = true;
        let mut cfg = config(vec![cache]);
        cfg.cluster = Some(ClusterConfig::default());

        let result = CacheManager::builder(cfg).build().await;
        assert_matches!(result, Err(Error::NotClustered(_)));
    }

    #[tokio::test]
    async fn test_clustered_cache_with_bulk_load() {
        let cluster = InMemoryCluster::new();
        let mut cache = CacheConfig::named("shared");
        cache.clustered = true;
        cache.bulk_load = true;
        let mut cfg = config(vec![cache]);
        cfg.cluster = Some(ClusterConfig::default());

        let manager = CacheManager::builder(cfg)
            .cluster(cluster.join("node-1"))
            .build()
            .await
            .unwrap();
        let shared = manager.clustered_cache("shared").unwrap();
        assert!(!shared.is_node_coherent());

        let ctx = LockContext::new();
        shared.put(&ctx, Element::new("k", "v")).await.unwrap();
        assert!(shared.get(&ctx, &"k".into()).await.unwrap().is_some());

        // Buffered writes reach the cluster before the node resyncs
        tokio::time::timeout(Duration::from_secs(1), async {
            while cluster.entries("shared") == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!shared.is_node_coherent());

        shared.set_node_coherent(true).await.unwrap();
        assert_eq!(cluster.entries("shared"), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_maintenance_expires_elements() {
        let mut cache = CacheConfig::named("ttl");
        cache.time_to_live_secs = 1;
        let clock = Arc::new(ManualClock::default());
        let manager = CacheManager::builder(config(vec![cache]))
            .clock(clock.clone())
            .build()
            .await
            .unwrap();

        let ttl = manager.cache("ttl").unwrap();
        ttl.put(Element::new("a", "1")).unwrap();
        ttl.put(Element::new("b", "2")).unwrap();
        clock.advance(Duration::from_secs(2));

        assert_eq!(manager.run_maintenance().unwrap(), 2);
        assert_eq!(ttl.get_size().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_lookups_and_releases_barrier() {
        let cluster = InMemoryCluster::new();
        let mut cache = CacheConfig::named("shared");
        cache.clustered = true;
        cache.bulk_load = true;
        let mut cfg = config(vec![cache]);
        cfg.cluster = Some(ClusterConfig::default());
        cfg.expiry_interval_secs = 1;

        let manager = CacheManager::builder(cfg)
            .cluster(cluster.join("node-1"))
            .build()
            .await
            .unwrap();
        let shared = manager.clustered_cache("shared").unwrap();
        let waiter = tokio::spawn(async move { shared.wait_until_cluster_coherent().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.shutdown().await;
        assert!(manager.is_shutdown());
        assert_matches!(waiter.await.unwrap(), Err(Error::Shutdown));
        assert_matches!(manager.cache("shared"), Err(Error::Shutdown));
    }
}
