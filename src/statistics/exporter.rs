//! Prometheus Exporter
//!
//! Mirrors statistics snapshots into gauges labelled by cache name. The
//! registry is supplied by the caller; nothing is registered globally.

use prometheus::{Encoder, GaugeVec, IntGaugeVec, Opts, Registry, TextEncoder};

use super::StatisticsSnapshot;
use crate::error::{Error, Result};

const NAMESPACE: &str = "stratacache";

/// Publishes cache statistics into a Prometheus registry
#[derive(Clone)]
pub struct PrometheusExporter {
    registry: Registry,
    operations: IntGaugeVec,
    entries: IntGaugeVec,
    bytes: IntGaugeVec,
    hit_ratio: GaugeVec,
    get_latency: GaugeVec,
}

fn metric_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("prometheus: {}", e))
}

impl PrometheusExporter {
    /// Register the cache gauges in `registry`
    pub fn new(registry: Registry) -> Result<Self> {
        let operations = IntGaugeVec::new(
            Opts::new("operations", "Cumulative cache operations by kind").namespace(NAMESPACE),
            &["cache", "operation"],
        )
        .map_err(metric_error)?;
        let entries = IntGaugeVec::new(
            Opts::new("entries", "Resident entries by tier").namespace(NAMESPACE),
            &["cache", "tier"],
        )
        .map_err(metric_error)?;
        let bytes = IntGaugeVec::new(
            Opts::new("size_bytes", "Resident bytes by tier").namespace(NAMESPACE),
            &["cache", "tier"],
        )
        .map_err(metric_error)?;
        let hit_ratio = GaugeVec::new(
            Opts::new("hit_ratio", "Hits over total reads").namespace(NAMESPACE),
            &["cache"],
        )
        .map_err(metric_error)?;
        let get_latency = GaugeVec::new(
            Opts::new("get_latency_microseconds", "Smoothed get latency").namespace(NAMESPACE),
            &["cache"],
        )
        .map_err(metric_error)?;

        registry
            .register(Box::new(operations.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(entries.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(bytes.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(hit_ratio.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(get_latency.clone()))
            .map_err(metric_error)?;

        Ok(Self {
            registry,
            operations,
            entries,
            bytes,
            hit_ratio,
            get_latency,
        })
    }

    /// Exporter over a fresh private registry
    pub fn with_new_registry() -> Result<Self> {
        Self::new(Registry::new())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Overwrite the gauges of `cache` with `snapshot`
    pub fn record(&self, cache: &str, snapshot: &StatisticsSnapshot) {
        let operations = [
            ("heap_hit", snapshot.heap_hits),
            ("offheap_hit", snapshot.offheap_hits),
            ("disk_hit", snapshot.disk_hits),
            ("cluster_hit", snapshot.cluster_hits),
            ("miss", snapshot.misses),
            ("expired_miss", snapshot.expired_misses),
            ("put", snapshot.puts),
            ("update", snapshot.updates),
            ("remove", snapshot.removes),
            ("eviction", snapshot.evictions),
            ("expiration", snapshot.expirations),
            ("promotion", snapshot.promotions),
            ("demotion", snapshot.demotions),
            ("cluster_timeout", snapshot.cluster_timeouts),
        ];
        for (operation, value) in operations {
            self.operations
                .with_label_values(&[cache, operation])
                .set(value as i64);
        }

        let tiers = [
            ("heap", snapshot.in_memory_size, snapshot.in_memory_size_bytes),
            ("offheap", snapshot.off_heap_size, snapshot.off_heap_size_bytes),
            ("disk", snapshot.on_disk_size, snapshot.on_disk_size_bytes),
        ];
        for (tier, entries, bytes) in tiers {
            self.entries
                .with_label_values(&[cache, tier])
                .set(entries as i64);
            self.bytes.with_label_values(&[cache, tier]).set(bytes as i64);
        }

        self.hit_ratio
            .with_label_values(&[cache])
            .set(snapshot.hit_ratio);
        self.get_latency
            .with_label_values(&[cache])
            .set(snapshot.get_latency_us as f64);
    }

    /// Text exposition of the registry
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metric_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

impl std::fmt::Debug for PrometheusExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusExporter").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_labelled_gauges() {
        let exporter = PrometheusExporter::with_new_registry().unwrap();
        let snapshot = StatisticsSnapshot {
            heap_hits: 7,
            in_memory_size: 3,
            hit_ratio: 0.75,
            ..Default::default()
        };

        exporter.record("users", &snapshot);
        let text = exporter.render().unwrap();

        assert!(text.contains("stratacache_operations{cache=\"users\",operation=\"heap_hit\"} 7"));
        assert!(text.contains("stratacache_entries{cache=\"users\",tier=\"heap\"} 3"));
        assert!(text.contains("stratacache_hit_ratio{cache=\"users\"} 0.75"));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        PrometheusExporter::new(registry.clone()).unwrap();
        assert!(PrometheusExporter::new(registry).is_err());
    }
}
