//! Stratacache Integration Tests
//!
//! End-to-end checks through the public API:
//! - Tiered storage: capacity, promotion, eviction fairness, expiry
//! - Local transactions over soft locks
//! - Nonstop fallbacks and lock-stack cleanup
//! - Cluster coherence

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use stratacache::cluster::{CoherentClusteredStore, Consistency, InMemoryCluster, NodeId};
use stratacache::config::NonstopSettings;
use stratacache::nonstop::{NonstopExecutor, NonstopStore};
use stratacache::store::ManualClock;
use stratacache::{
    CacheConfig, CacheKey, CacheManager, CacheManagerConfig, Element, Error, EvictionPolicyKind,
    LockContext, TierCapacity, TierKind, TieredStore, TimeoutBehavior,
};
use tokio_util::sync::CancellationToken;

fn key(k: impl Into<CacheKey>) -> CacheKey {
    k.into()
}

fn resident(store: &TieredStore) -> Vec<String> {
    let mut keys: Vec<String> = store.keys().into_iter().map(String::from).collect();
    keys.sort();
    keys
}

// =============================================================================
// Tiered Storage
// =============================================================================

mod tiered_tests {
    use super::*;
    use proptest::prelude::*;

    fn bounded_store(heap: u64, offheap: u64, policy: EvictionPolicyKind) -> Arc<TieredStore> {
        TieredStore::builder("bounded")
            .heap(TierCapacity::entries(heap))
            .offheap(TierCapacity::entries(offheap))
            .eviction_policy(policy)
            .build()
            .unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_bounded_tiers_never_exceed_capacity(
            ops in prop::collection::vec((0u64..64, any::<bool>()), 1..200),
            policy in prop_oneof![
                Just(EvictionPolicyKind::Lru),
                Just(EvictionPolicyKind::Lfu),
                Just(EvictionPolicyKind::Fifo),
                Just(EvictionPolicyKind::Clock),
            ],
        ) {
            let store = bounded_store(8, 16, policy);
            for (k, read) in ops {
                if read {
                    store.get(&key(k)).unwrap();
                } else {
                    store.put(Element::new(k, "v")).unwrap();
                }
                prop_assert!(store.in_memory_size() <= 8);
                prop_assert!(store.off_heap_size() <= 16);
            }
        }
    }

    #[test]
    fn test_get_promotes_from_slower_tier() {
        let store = bounded_store(1, 10, EvictionPolicyKind::Lru);
        store.put(Element::new("a", "va")).unwrap();
        store.put(Element::new("b", "vb")).unwrap();
        assert_eq!(store.tier_of(&key("a")), Some(TierKind::OffHeap));

        let element = store.get(&key("a")).unwrap().unwrap();
        assert_eq!(element.value().unwrap().as_ref(), b"va");
        assert_eq!(store.tier_of(&key("a")), Some(TierKind::OnHeap));
        assert_eq!(store.tier_of(&key("b")), Some(TierKind::OffHeap));
        assert_eq!(store.size(), 2);
    }

    #[test]
    fn test_lru_evicts_first_inserted_of_n_plus_one() {
        let store = TieredStore::builder("lru")
            .heap(TierCapacity::entries(5))
            .build()
            .unwrap();
        for i in 0..6u64 {
            store.put(Element::new(i, "v")).unwrap();
        }
        assert!(!store.contains_key(&key(0u64)));
        assert_eq!(store.size(), 5);
    }

    #[test]
    fn test_lfu_frequently_used_entry_survives() {
        let store = TieredStore::builder("lfu")
            .heap(TierCapacity::entries(5))
            .eviction_policy(EvictionPolicyKind::Lfu)
            .build()
            .unwrap();
        for i in 0..5u64 {
            store.put(Element::new(i, "v")).unwrap();
        }
        for _ in 0..4 {
            store.get(&key(0u64)).unwrap();
        }
        store.put(Element::new(99u64, "v")).unwrap();
        assert!(store.contains_key(&key(0u64)));
    }

    #[test]
    fn test_lfu_capacity_four_scenario() {
        let store = TieredStore::builder("scenario")
            .heap(TierCapacity::entries(4))
            .eviction_policy(EvictionPolicyKind::Lfu)
            .build()
            .unwrap();
        for i in 1..=4u64 {
            store.put(Element::new(i, "v")).unwrap();
        }
        for _ in 0..2 {
            store.get(&key(1u64)).unwrap();
        }
        for _ in 0..3 {
            store.get(&key(3u64)).unwrap();
        }
        store.put(Element::new(5u64, "v")).unwrap();

        assert_eq!(resident(&store), vec!["1", "3", "4", "5"]);
    }

    #[tokio::test]
    async fn test_cache_level_tti_with_manual_clock() {
        let clock = Arc::new(ManualClock::default());
        let mut cache = CacheConfig::named("sessions");
        cache.time_to_idle_secs = 10;
        let manager = CacheManager::builder(CacheManagerConfig {
            expiry_interval_secs: 0,
            caches: vec![cache],
            ..Default::default()
        })
        .clock(clock.clone())
        .build()
        .await
        .unwrap();
        let sessions = manager.cache("sessions").unwrap();

        sessions.put(Element::new("key1", "value")).unwrap();
        clock.advance(Duration::from_secs(6));
        assert!(sessions.get(&key("key1")).unwrap().is_some());
        clock.advance(Duration::from_secs(11));
        assert!(sessions.get(&key("key1")).unwrap().is_none());
        assert_eq!(sessions.statistics().expired_misses, 1);

        manager.shutdown().await;
    }
}

// =============================================================================
// Transactions
// =============================================================================

mod transaction_tests {
    use super::*;
    use stratacache::transaction::SoftLockId;

    async fn transactional_manager() -> Arc<CacheManager> {
        let mut cache = CacheConfig::named("accounts");
        cache.transactional = true;
        CacheManager::builder(CacheManagerConfig {
            expiry_interval_secs: 0,
            caches: vec![cache],
            ..Default::default()
        })
        .build()
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_uncommitted_write_invisible_to_others() {
        let manager = transactional_manager().await;
        let cache = manager.cache("accounts").unwrap();
        let store = cache.transactional().unwrap();
        let controller = manager.controller();

        let setup = controller.begin();
        store.put(&setup, Element::new("k", "old")).unwrap();
        controller.commit(&setup).unwrap();

        let writer = controller.begin();
        let reader = controller.begin();
        store.put(&writer, Element::new("k", "new")).unwrap();

        let own = store.get(&writer, &key("k")).unwrap().unwrap();
        assert_eq!(own.value().unwrap().as_ref(), b"new");
        let other = store.get(&reader, &key("k")).unwrap().unwrap();
        assert_eq!(other.value().unwrap().as_ref(), b"old");
        let outside = cache.get(&key("k")).unwrap().unwrap();
        assert_eq!(outside.value().unwrap().as_ref(), b"old");

        controller.commit(&writer).unwrap();
        let after = store.get(&reader, &key("k")).unwrap().unwrap();
        assert_eq!(after.value().unwrap().as_ref(), b"new");
        controller.commit(&reader).unwrap();
    }

    #[tokio::test]
    async fn test_soft_locks_cleared_after_commit_and_rollback() {
        let manager = transactional_manager().await;
        let cache = manager.cache("accounts").unwrap();
        let store = cache.transactional().unwrap();
        let controller = manager.controller();

        let committed = controller.begin();
        store.put(&committed, Element::new("a", "1")).unwrap();
        let probe = SoftLockId::new(*committed.id(), key("a"), None, None);
        assert!(store.soft_locks().find_soft_lock_by_id(&probe).is_some());
        controller.commit(&committed).unwrap();
        assert!(store.soft_locks().find_soft_lock_by_id(&probe).is_none());

        let rolled_back = controller.begin();
        store.put(&rolled_back, Element::new("b", "1")).unwrap();
        controller.rollback(&rolled_back).unwrap();
        assert!(store
            .soft_locks()
            .collect_all_soft_locks_for_transaction_id(rolled_back.id())
            .is_empty());
        assert!(store.soft_locks().is_empty());

        assert!(cache.get(&key("a")).unwrap().is_some());
        assert!(cache.get(&key("b")).unwrap().is_none());
        assert!(cache
            .store()
            .get_quiet(&key("a"))
            .unwrap()
            .is_some_and(|e| !e.is_soft_locked()));
    }
}

// =============================================================================
// Nonstop
// =============================================================================

mod nonstop_tests {
    use super::*;

    fn nonstop_store(
        cluster: &InMemoryCluster,
        node: &str,
        behavior: TimeoutBehavior,
    ) -> NonstopStore {
        let local = TieredStore::builder("shared").build().unwrap();
        let inner = Arc::new(CoherentClusteredStore::new(
            local,
            cluster.join(node),
            Consistency::Strong,
            CancellationToken::new(),
        ));
        let settings = NonstopSettings {
            timeout: Duration::from_millis(50),
            behavior,
            ..Default::default()
        };
        NonstopStore::new(inner, Arc::new(NonstopExecutor::new()), settings)
    }

    async fn slow_get(behavior: TimeoutBehavior) -> stratacache::Result<Option<Element>> {
        let cluster = InMemoryCluster::new();
        let store = nonstop_store(&cluster, "a", behavior);
        let ctx = LockContext::new();
        store.put(&ctx, Element::new("k", "last-known")).await.unwrap();

        cluster.set_latency(&NodeId::from("a"), Duration::from_millis(500));
        store.get(&ctx, &key("k")).await
    }

    #[tokio::test]
    async fn test_exception_behavior_raises() {
        let result = slow_get(TimeoutBehavior::Exception).await;
        assert_matches!(result, Err(Error::ClusterTimeout { .. }));
    }

    #[tokio::test]
    async fn test_no_op_behavior_returns_none() {
        let result = slow_get(TimeoutBehavior::NoOp).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_local_reads_behavior_returns_last_known_value() {
        let result = slow_get(TimeoutBehavior::LocalReads).await.unwrap().unwrap();
        assert_eq!(result.value().unwrap().as_ref(), b"last-known");
    }

    #[tokio::test]
    async fn test_unlock_timeout_cleans_lock_stack() {
        let cluster = InMemoryCluster::new();
        let store = nonstop_store(&cluster, "a", TimeoutBehavior::LocalReads);
        let ctx = LockContext::new();
        let k = key("k");

        store.acquire_write_lock(&ctx, &k).await.unwrap();
        cluster.set_latency(&NodeId::from("a"), Duration::from_millis(150));
        let result = store.release_write_lock(&ctx, &k).await;
        assert_matches!(result, Err(Error::ClusterTimeout { .. }));
        assert_eq!(ctx.total_holds(), 0);

        // Abandoned unlock lands; the same context can lock again
        tokio::time::sleep(Duration::from_millis(250)).await;
        cluster.set_latency(&NodeId::from("a"), Duration::ZERO);
        store.acquire_write_lock(&ctx, &k).await.unwrap();
        assert!(store.is_write_lock_held(&ctx, &k).await.unwrap());
        store.release_write_lock(&ctx, &k).await.unwrap();
        assert_eq!(ctx.total_holds(), 0);
    }
}

// =============================================================================
// Cluster Coherence
// =============================================================================

mod coherence_tests {
    use super::*;

    fn node(cluster: &InMemoryCluster, id: &str) -> Arc<CoherentClusteredStore> {
        let local = TieredStore::builder("shared").build().unwrap();
        Arc::new(CoherentClusteredStore::new(
            local,
            cluster.join(id),
            Consistency::Strong,
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn test_three_node_coherence_barrier() {
        let cluster = InMemoryCluster::new();
        let nodes: Vec<_> = ["n1", "n2", "n3"].iter().map(|id| node(&cluster, id)).collect();
        for node in &nodes {
            node.set_node_coherent(false).await.unwrap();
        }

        let waiters: Vec<_> = nodes
            .iter()
            .map(|node| {
                let node = Arc::clone(node);
                let all = nodes.clone();
                tokio::spawn(async move {
                    node.wait_until_cluster_coherent().await.unwrap();
                    all.iter().all(|n| n.is_cluster_coherent())
                })
            })
            .collect();

        for node in &nodes {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(waiters.iter().all(|w| !w.is_finished()));
            node.set_node_coherent(true).await.unwrap();
        }

        for waiter in waiters {
            let all_coherent = tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
            assert!(all_coherent);
        }
        assert!(nodes.iter().all(|n| n.is_cluster_coherent()));
    }

    #[tokio::test]
    async fn test_bulk_load_then_resync_visible_everywhere() {
        let cluster = InMemoryCluster::new();
        let loader = node(&cluster, "loader");
        let reader = node(&cluster, "reader");
        let ctx = LockContext::new();

        loader.set_node_coherent(false).await.unwrap();
        for i in 0..50u64 {
            loader.put(&ctx, Element::new(i, "v")).await.unwrap();
        }
        assert_eq!(reader.size().await.unwrap(), 0);

        loader.set_node_coherent(true).await.unwrap();
        assert_eq!(reader.size().await.unwrap(), 50);
        assert!(reader.get(&ctx, &key(7u64)).await.unwrap().is_some());
    }
}
