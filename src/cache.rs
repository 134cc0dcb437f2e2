//! Read-cache for derived views.
//!
//! The cache is never the coherence authority: the engine deletes affected
//! keys after every committed state change, and TTLs only bound the damage of
//! a missed invalidation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;

use crate::model::{RequesterId, ResourceId};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStatus {
    pub backend: &'static str,
    pub degraded: bool,
    pub entries: Option<usize>,
}

/// Key → JSON store with per-key expiry.
#[async_trait]
pub trait ViewCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Delete every key matching a `*` glob. Returns how many were removed.
    async fn delete_pattern(&self, pattern: &str) -> Result<usize, CacheError>;

    /// Drop expired entries held in process memory.
    fn purge_expired(&self) -> usize {
        0
    }

    fn status(&self) -> CacheStatus;
}

// ── Key scheme ───────────────────────────────────────────

pub fn listing_key() -> String {
    "events:all".to_string()
}

pub fn resource_key(id: &ResourceId) -> String {
    format!("event:{id}")
}

pub fn history_key(id: &RequesterId) -> String {
    format!("user:{id}:bookings")
}

pub fn analytics_key() -> String {
    "analytics:data".to_string()
}

/// Glob match where `*` matches any run of characters (including none).
pub fn glob_match(pattern: &str, key: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return key.is_empty();
    };
    let Some(mut rest) = key.strip_prefix(first) else {
        return false;
    };
    let tail: Vec<&str> = parts.collect();
    let Some((last, middle)) = tail.split_last() else {
        // no `*` at all
        return rest.is_empty();
    };
    for part in middle {
        match rest.find(part) {
            Some(i) => rest = &rest[i + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

// ── In-process store ─────────────────────────────────────

/// Process-scoped cache. Starts empty; expired entries are dropped lazily on
/// `get` and in bulk by `purge_expired`.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, (Value, Instant)>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn get_now(&self, key: &str, now: Instant) -> Option<Value> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.1 > now => return Some(entry.0.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, (_, expires)| *expires <= now);
        }
        None
    }

    fn purge_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, (_, expires)| *expires > now);
        before.saturating_sub(self.entries.len())
    }
}

#[async_trait]
impl ViewCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        Ok(self.get_now(key, Instant::now()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError> {
        self.entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let before = self.entries.len();
        self.entries.retain(|k, _| !glob_match(pattern, k));
        Ok(before.saturating_sub(self.entries.len()))
    }

    fn purge_expired(&self) -> usize {
        self.purge_at(Instant::now())
    }

    fn status(&self) -> CacheStatus {
        CacheStatus {
            backend: "memory",
            degraded: false,
            entries: Some(self.entries.len()),
        }
    }
}

// ── Fallback combinator ──────────────────────────────────

/// Serves from `primary` while it works and from an in-process store when it
/// errors. Deletes go to both so neither can serve an invalidated view.
///
/// A delete the primary could not apply leaves it holding views that may be
/// stale. The primary is then bypassed until a full flush of it succeeds.
pub struct FallbackCache<P> {
    primary: P,
    fallback: MemoryCache,
    degraded: AtomicBool,
    /// Primary deletes that failed since the last successful flush.
    missed_deletes: AtomicU64,
}

impl<P: ViewCache> FallbackCache<P> {
    pub fn new(primary: P) -> Self {
        Self {
            primary,
            fallback: MemoryCache::new(),
            degraded: AtomicBool::new(false),
            missed_deletes: AtomicU64::new(0),
        }
    }

    /// Whether the primary can be read. If deletes were missed, flush it
    /// first; a delete missed during the flush keeps it bypassed.
    async fn primary_trusted(&self) -> bool {
        let missed = self.missed_deletes.load(Ordering::Acquire);
        if missed == 0 {
            return true;
        }
        let flushed = self.primary.delete_pattern("*").await;
        self.mark(&flushed);
        match flushed {
            Ok(n) => {
                let settled = self
                    .missed_deletes
                    .compare_exchange(missed, 0, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                if settled {
                    tracing::info!("flushed {n} entries from cache primary after {missed} missed deletes");
                }
                settled
            }
            Err(_) => false,
        }
    }

    fn record_delete(&self, result: &Result<impl Sized, CacheError>) {
        self.mark(result);
        if result.is_err() {
            self.missed_deletes.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn mark(&self, result: &Result<impl Sized, CacheError>) {
        match result {
            Ok(_) => {
                if self.degraded.swap(false, Ordering::Relaxed) {
                    tracing::info!("cache primary recovered");
                }
            }
            Err(e) => {
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    tracing::warn!("cache primary failed, using in-process fallback: {e}");
                }
            }
        }
    }
}

#[async_trait]
impl<P: ViewCache> ViewCache for FallbackCache<P> {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        if !self.primary_trusted().await {
            return self.fallback.get(key).await;
        }
        let result = self.primary.get(key).await;
        self.mark(&result);
        match result {
            Ok(v) => Ok(v),
            Err(_) => self.fallback.get(key).await,
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError> {
        if !self.primary_trusted().await {
            return self.fallback.set(key, value, ttl).await;
        }
        let result = self.primary.set(key, value.clone(), ttl).await;
        self.mark(&result);
        match result {
            Ok(()) => Ok(()),
            Err(_) => self.fallback.set(key, value, ttl).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.fallback.delete(key).await?;
        let result = self.primary.delete(key).await;
        self.record_delete(&result);
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let local = self.fallback.delete_pattern(pattern).await?;
        let result = self.primary.delete_pattern(pattern).await;
        self.record_delete(&result);
        Ok(result.unwrap_or(0) + local)
    }

    fn purge_expired(&self) -> usize {
        self.primary.purge_expired() + self.fallback.purge_expired()
    }

    fn status(&self) -> CacheStatus {
        let degraded = self.degraded.load(Ordering::Relaxed);
        if degraded {
            CacheStatus {
                backend: "memory-fallback",
                degraded,
                entries: Some(self.fallback.len()),
            }
        } else {
            self.primary.status()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Down;

    #[async_trait]
    impl ViewCache for Down {
        async fn get(&self, _: &str) -> Result<Option<Value>, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn set(&self, _: &str, _: Value, _: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn delete(&self, _: &str) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn delete_pattern(&self, _: &str) -> Result<usize, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        fn status(&self) -> CacheStatus {
            CacheStatus { backend: "down", degraded: true, entries: None }
        }
    }

    #[test]
    fn glob_patterns() {
        assert!(glob_match("*", "events:all"));
        assert!(glob_match("event:*", "event:01ABC"));
        assert!(!glob_match("event:*", "events:all"));
        assert!(glob_match("user:*:bookings", "user:42:bookings"));
        assert!(!glob_match("user:*:bookings", "user:42:history"));
        assert!(glob_match("analytics:data", "analytics:data"));
        assert!(!glob_match("analytics:data", "analytics:data2"));
        assert!(glob_match("*:all", "events:all"));
        assert!(glob_match("a*a", "aa"));
        assert!(!glob_match("a*a", "a"));
    }

    #[tokio::test]
    async fn memory_set_get_delete() {
        let cache = MemoryCache::new();
        cache.set("k", json!({"n": 1}), Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(json!({"n": 1})));
        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_entries_expire() {
        let cache = MemoryCache::new();
        cache.set("k", json!(1), Duration::from_secs(60)).await.unwrap();
        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(cache.get_now("k", later), None);
        assert!(cache.is_empty());

        cache.set("a", json!(1), Duration::ZERO).await.unwrap();
        cache.set("b", json!(2), Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn memory_delete_pattern() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(60);
        cache.set(&listing_key(), json!([]), ttl).await.unwrap();
        cache.set("event:1", json!({}), ttl).await.unwrap();
        cache.set("event:2", json!({}), ttl).await.unwrap();
        cache.set("user:1:bookings", json!([]), ttl).await.unwrap();
        assert_eq!(cache.delete_pattern("event:*").await.unwrap(), 2);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.delete_pattern("*").await.unwrap(), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn fallback_serves_when_primary_down() {
        let cache = FallbackCache::new(Down);
        cache.set("k", json!("v"), Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(json!("v")));
        let status = cache.status();
        assert!(status.degraded);
        assert_eq!(status.backend, "memory-fallback");

        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn fallback_uses_primary_when_healthy() {
        let cache = FallbackCache::new(MemoryCache::new());
        cache.set("k", json!(7), Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(json!(7)));
        assert!(cache.fallback.is_empty());
        assert_eq!(cache.status().backend, "memory");
    }

    /// Memory store that can be switched unreachable.
    #[derive(Default)]
    struct Flaky {
        inner: MemoryCache,
        down: AtomicBool,
    }

    impl Flaky {
        fn check(&self) -> Result<(), CacheError> {
            if self.down.load(Ordering::SeqCst) {
                Err(CacheError::Unavailable("connection reset".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl ViewCache for Flaky {
        async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
            self.check()?;
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError> {
            self.check()?;
            self.inner.set(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<(), CacheError> {
            self.check()?;
            self.inner.delete(key).await
        }
        async fn delete_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
            self.check()?;
            self.inner.delete_pattern(pattern).await
        }
        fn status(&self) -> CacheStatus {
            self.inner.status()
        }
    }

    #[tokio::test]
    async fn delete_missed_by_primary_is_not_served_after_recovery() {
        let cache = FallbackCache::new(Flaky::default());
        let ttl = Duration::from_secs(60);
        cache.set("events:all", json!("before"), ttl).await.unwrap();
        cache.set("event:1", json!("unrelated"), ttl).await.unwrap();

        cache.primary.down.store(true, Ordering::SeqCst);
        cache.delete("events:all").await.unwrap();
        cache.primary.down.store(false, Ordering::SeqCst);

        assert_eq!(cache.get("events:all").await.unwrap(), None);
        // The recovery flush drops everything the primary held.
        assert!(cache.primary.inner.is_empty());
        assert!(!cache.status().degraded);

        cache.set("events:all", json!("after"), ttl).await.unwrap();
        assert_eq!(cache.get("events:all").await.unwrap(), Some(json!("after")));
        assert_eq!(cache.primary.inner.len(), 1);
    }

    #[tokio::test]
    async fn primary_stays_bypassed_while_flush_fails() {
        let cache = FallbackCache::new(Flaky::default());
        let ttl = Duration::from_secs(60);
        cache.set("k", json!("stale"), ttl).await.unwrap();

        cache.primary.down.store(true, Ordering::SeqCst);
        cache.delete_pattern("*").await.unwrap();
        cache.set("k", json!("fresh"), ttl).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(json!("fresh")));
        assert_eq!(cache.primary.inner.get("k").await.unwrap(), Some(json!("stale")));

        cache.primary.down.store(false, Ordering::SeqCst);
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.primary.inner.is_empty());
    }

    #[test]
    fn key_scheme() {
        let id = ulid::Ulid::nil();
        assert_eq!(resource_key(&id), format!("event:{id}"));
        assert_eq!(history_key(&id), format!("user:{id}:bookings"));
    }
}
