use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::ViewCache;
use crate::engine::Engine;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Background task that compacts the journal once enough commits have piled
/// up since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// One compactor pass. Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let pending = engine.commits_since_compact().await;
    if pending < threshold {
        return false;
    }
    match engine.compact().await {
        Ok(()) => {
            info!("compacted journal after {pending} commits");
            true
        }
        Err(e) => {
            // Retried on the next tick.
            warn!("compaction failed: {e}");
            false
        }
    }
}

/// Background task that drops expired cache entries held in process memory.
pub async fn run_cache_reaper(cache: Arc<dyn ViewCache>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let purged = cache.purge_expired();
        if purged > 0 {
            debug!("purged {purged} expired cache entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::CacheTtl;
    use crate::wal::Wal;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("seatd_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compactor_waits_for_threshold() {
        let path = test_wal_path("reaper_compact.wal");
        let engine = Engine::open(&path, Arc::new(MemoryCache::new()), CacheTtl::default()).unwrap();

        let rid = Ulid::new();
        engine
            .create_resource(rid, "Gala".into(), "Hall".into(), 0, 2)
            .await
            .unwrap();
        let uid = Ulid::new();
        engine
            .register_requester(uid, "Ada".into(), "ada@example.com".into())
            .await
            .unwrap();
        let a = engine.book(rid, uid).await.unwrap();
        engine.cancel(a.id).await.unwrap();

        assert!(!compact_if_due(&engine, 10).await);
        assert_eq!(engine.commits_since_compact().await, 4);

        assert!(compact_if_due(&engine, 4).await);
        assert_eq!(engine.commits_since_compact().await, 0);
        // requester + resource + grant + release
        assert_eq!(Wal::replay(&path).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn cache_reaper_purges_on_tick() {
        let cache = Arc::new(MemoryCache::new());
        cache
            .set("stale", serde_json::json!(1), Duration::ZERO)
            .await
            .unwrap();
        cache
            .set("fresh", serde_json::json!(2), Duration::from_secs(3600))
            .await
            .unwrap();

        let task = tokio::spawn(run_cache_reaper(cache.clone(), Duration::from_secs(30)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        task.abort();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("fresh").await.unwrap(), Some(serde_json::json!(2)));
    }
}
