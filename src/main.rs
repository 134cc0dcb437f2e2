use std::sync::Arc;

use tracing::info;

use seatd::cache::{MemoryCache, ViewCache};
use seatd::config::Config;
use seatd::engine::Engine;
use seatd::reaper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    seatd::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let cache: Arc<dyn ViewCache> = Arc::new(MemoryCache::new());
    let wal_path = config.wal_path();
    let engine = Arc::new(Engine::open(&wal_path, cache.clone(), config.ttl)?);

    info!("seatd ready");
    info!("  wal: {}", wal_path.display());
    info!("  resources: {}", engine.store().resource_count());
    info!("  requesters: {}", engine.store().requester_count());
    info!("  compact_threshold: {}", config.compact_threshold);
    info!("  cache: {}", engine.cache_status().backend);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let compactor = tokio::spawn(reaper::run_compactor(engine.clone(), config.compact_threshold));
    let sweeper = tokio::spawn(reaper::run_cache_reaper(cache, config.cache_sweep_interval));

    // Run until SIGTERM/ctrl-c
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    info!("shutdown signal received");
    compactor.abort();
    sweeper.abort();

    // Leave a short log behind for the next start.
    if let Err(e) = engine.compact().await {
        tracing::warn!("final compaction failed: {e}");
    }
    info!("seatd stopped");
    Ok(())
}
