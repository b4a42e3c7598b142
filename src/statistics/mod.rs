//! Cache Statistics
//!
//! Lock-free counters updated on the data path, a serializable snapshot, and
//! a Prometheus exporter.

mod exporter;

pub use exporter::PrometheusExporter;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::TierKind;

/// Per-cache statistics collector
#[derive(Debug, Default)]
pub struct CacheStatistics {
    heap_hits: AtomicU64,
    offheap_hits: AtomicU64,
    disk_hits: AtomicU64,
    cluster_hits: AtomicU64,
    misses: AtomicU64,
    expired_misses: AtomicU64,

    puts: AtomicU64,
    updates: AtomicU64,
    removes: AtomicU64,

    evictions: AtomicU64,
    expirations: AtomicU64,
    promotions: AtomicU64,
    demotions: AtomicU64,

    cluster_timeouts: AtomicU64,

    // Exponential moving average, microseconds
    get_latency_us: AtomicU64,
}

impl CacheStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, tier: TierKind) {
        let counter = match tier {
            TierKind::OnHeap => &self.heap_hits,
            TierKind::OffHeap => &self.offheap_hits,
            TierKind::OnDisk => &self.disk_hits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Hit served by the cluster rather than a local tier
    pub fn record_cluster_hit(&self) {
        self.cluster_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// A read found the key but it had expired
    pub fn record_expired_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.expired_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remove(&self) {
        self.removes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_demotion(&self) {
        self.demotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cluster_timeout(&self) {
        self.cluster_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_get_latency(&self, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1;

        loop {
            let current = self.get_latency_us.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if self
                .get_latency_us
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn hits(&self) -> u64 {
        self.heap_hits.load(Ordering::Relaxed)
            + self.offheap_hits.load(Ordering::Relaxed)
            + self.disk_hits.load(Ordering::Relaxed)
            + self.cluster_hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Zero every counter
    pub fn clear(&self) {
        for counter in [
            &self.heap_hits,
            &self.offheap_hits,
            &self.disk_hits,
            &self.cluster_hits,
            &self.misses,
            &self.expired_misses,
            &self.puts,
            &self.updates,
            &self.removes,
            &self.evictions,
            &self.expirations,
            &self.promotions,
            &self.demotions,
            &self.cluster_timeouts,
            &self.get_latency_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            heap_hits: self.heap_hits.load(Ordering::Relaxed),
            offheap_hits: self.offheap_hits.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            cluster_hits: self.cluster_hits.load(Ordering::Relaxed),
            misses: self.misses(),
            expired_misses: self.expired_misses.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
            puts: self.puts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            evictions: self.evictions(),
            expirations: self.expirations(),
            promotions: self.promotions.load(Ordering::Relaxed),
            demotions: self.demotions.load(Ordering::Relaxed),
            cluster_timeouts: self.cluster_timeouts.load(Ordering::Relaxed),
            get_latency_us: self.get_latency_us.load(Ordering::Relaxed),
            ..Default::default()
        }
    }
}

/// Point-in-time view of a cache's statistics and sizes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub heap_hits: u64,
    pub offheap_hits: u64,
    pub disk_hits: u64,
    pub cluster_hits: u64,
    pub misses: u64,
    pub expired_misses: u64,
    pub hit_ratio: f64,
    pub puts: u64,
    pub updates: u64,
    pub removes: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub promotions: u64,
    pub demotions: u64,
    pub cluster_timeouts: u64,
    pub get_latency_us: u64,

    pub size: usize,
    pub in_memory_size: usize,
    pub off_heap_size: usize,
    pub on_disk_size: usize,
    pub in_memory_size_bytes: u64,
    pub off_heap_size_bytes: u64,
    pub on_disk_size_bytes: u64,
}

impl StatisticsSnapshot {
    pub fn hits(&self) -> u64 {
        self.heap_hits + self.offheap_hits + self.disk_hits + self.cluster_hits
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio() {
        let stats = CacheStatistics::new();
        assert_eq!(stats.hit_ratio(), 0.0);

        stats.record_hit(TierKind::OnHeap);
        stats.record_hit(TierKind::OnDisk);
        stats.record_miss();
        stats.record_expired_miss();

        assert_eq!(stats.hits(), 2);
        assert_eq!(stats.misses(), 2);
        assert!((stats.hit_ratio() - 0.5).abs() < f64::EPSILON);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.disk_hits, 1);
        assert_eq!(snapshot.expired_misses, 1);
    }

    #[test]
    fn test_latency_ema_smooths() {
        let stats = CacheStatistics::new();
        stats.record_get_latency(Duration::from_micros(100));
        assert_eq!(stats.snapshot().get_latency_us, 100);

        stats.record_get_latency(Duration::from_micros(200));
        let smoothed = stats.snapshot().get_latency_us;
        assert!(smoothed > 100 && smoothed < 200);
    }

    #[test]
    fn test_clear_resets_counters() {
        let stats = CacheStatistics::new();
        stats.record_put();
        stats.record_eviction();
        stats.clear();
        assert_eq!(stats.snapshot(), StatisticsSnapshot::default());
    }
}
