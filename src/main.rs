//! Stratacache workload runner
//!
//! Loads a cache manager configuration, drives a synthetic read/write
//! workload against every configured cache and prints the resulting
//! statistics as JSON followed by the Prometheus text exposition.
//!
//! Clustered caches are served by an in-process cluster, so a single
//! binary can exercise the coherent store and the nonstop layer.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use rand::{Rng, SeedableRng};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stratacache::{
    Cache, CacheConfig, CacheManager, CacheManagerConfig, ClusteredCache, Element,
    EvictionPolicyKind, InMemoryCluster, LockContext, PrometheusExporter, TierCapacity,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Stratacache - run a synthetic workload and report cache statistics
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file; a single heap cache is used when absent
    #[arg(long, env = "STRATACACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Operations per cache
    #[arg(long, env = "STRATACACHE_OPERATIONS", default_value = "10000")]
    operations: usize,

    /// Distinct keys touched by the workload
    #[arg(long, env = "STRATACACHE_KEYS", default_value = "2000")]
    keys: usize,

    /// Fraction of operations that are writes
    #[arg(long, env = "STRATACACHE_WRITE_RATIO", default_value = "0.2")]
    write_ratio: f64,

    /// Override the eviction policy of every cache (LRU, LFU, FIFO, CLOCK)
    #[arg(long, env = "STRATACACHE_EVICTION_POLICY")]
    eviction_policy: Option<EvictionPolicyKind>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = Args::parse();
    init_logging(&args);
    args.keys = args.keys.max(1);
    args.write_ratio = args.write_ratio.clamp(0.0, 1.0);

    let mut config = match &args.config {
        Some(path) => CacheManagerConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => default_config(),
    };
    if let Some(policy) = args.eviction_policy {
        for cache in &mut config.caches {
            cache.eviction_policy = policy.as_str().to_string();
        }
    }

    info!("Starting stratacache workload");
    info!("  Caches: {}", config.caches.len());
    info!("  Operations per cache: {}", args.operations);
    info!("  Keys: {}", args.keys);

    let mut builder = CacheManager::builder(config.clone());
    if let Some(cluster) = &config.cluster {
        let fabric = InMemoryCluster::new();
        builder = builder.cluster(fabric.join(cluster.node_id.as_str()));
    }
    let manager = builder.build().await.context("starting cache manager")?;

    for name in manager.cache_names() {
        if let Ok(cache) = manager.cache(&name) {
            run_local(&manager, &cache, &args)
                .with_context(|| format!("workload on {}", name))?;
        } else {
            let cache = manager.clustered_cache(&name)?;
            run_clustered(&cache, &args)
                .await
                .with_context(|| format!("workload on {}", name))?;
        }
    }

    manager.run_maintenance()?;
    let statistics = manager.statistics();
    println!("{}", serde_json::to_string_pretty(&statistics)?);

    let exporter = PrometheusExporter::with_new_registry()?;
    manager.export(&exporter);
    println!("{}", exporter.render()?);

    manager.shutdown().await;
    Ok(())
}

fn default_config() -> CacheManagerConfig {
    let mut cache = CacheConfig::named("default");
    cache.tiers.heap = TierCapacity::entries(1_000);
    CacheManagerConfig {
        caches: vec![cache],
        ..Default::default()
    }
}

// =============================================================================
// Workloads
// =============================================================================

fn run_local(manager: &CacheManager, cache: &Cache, args: &Args) -> stratacache::Result<()> {
    let mut rng = rand::thread_rng();

    if cache.is_transactional() {
        let store = cache.transactional()?;
        for batch in 0..args.operations.div_ceil(100) {
            let tx = manager.controller().begin();
            for _ in 0..100 {
                let key = format!("key-{}", rng.gen_range(0..args.keys));
                if rng.gen_bool(args.write_ratio) {
                    store.put(&tx, Element::new(key, format!("tx-{}", batch)))?;
                } else {
                    store.get(&tx, &key.into())?;
                }
            }
            manager.controller().commit(&tx)?;
        }
        return Ok(());
    }

    for i in 0..args.operations {
        let key = format!("key-{}", rng.gen_range(0..args.keys));
        if rng.gen_bool(args.write_ratio) {
            cache.put(Element::new(key, format!("value-{}", i)))?;
        } else if cache.get(&key.into())?.is_none() {
            cache.put(Element::new(format!("key-{}", i % args.keys), "loaded"))?;
        }
    }
    Ok(())
}

async fn run_clustered(cache: &ClusteredCache, args: &Args) -> stratacache::Result<()> {
    if !cache.is_node_coherent() {
        warn!(cache = cache.name(), "Cache starts in bulk-load mode");
    }

    let ctx = LockContext::new();
    let mut rng = rand::rngs::StdRng::from_entropy();
    for i in 0..args.operations {
        let key = format!("key-{}", rng.gen_range(0..args.keys));
        if rng.gen_bool(args.write_ratio) {
            cache.put(&ctx, Element::new(key, format!("value-{}", i))).await?;
        } else {
            cache.get(&ctx, &key.into()).await?;
        }
    }

    if !cache.is_node_coherent() {
        cache.set_node_coherent(true).await?;
    }
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr; stdout carries the report
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
