use std::future::Future;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::OwnedRwLockReadGuard;
use tracing::{debug, warn};

use crate::cache::{self, CacheStatus};
use crate::model::*;
use crate::observability;

use super::validate::now_ms;
use super::{Engine, EngineError, Missing};

/// Number of resources reported as most popular by `analytics`.
const POPULAR_LIMIT: usize = 5;

impl Engine {
    // ── Cached views ─────────────────────────────────────────

    /// Serve `key` from the cache, or rebuild it and write it back.
    ///
    /// The rebuilt value is only written back if no invalidation ran while it
    /// was being built; otherwise it may describe pre-change state. Resource
    /// locks taken by `build` are released before the write-back gate.
    pub(super) async fn cached_view<T, F, Fut>(
        &self,
        view: &'static str,
        key: String,
        ttl: Duration,
        build: F,
    ) -> Result<T, EngineError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        match self.views.cache.get(&key).await {
            Ok(Some(value)) => match serde_json::from_value::<T>(value) {
                Ok(hit) => {
                    metrics::counter!(observability::CACHE_REQUESTS_TOTAL, "view" => view, "result" => "hit")
                        .increment(1);
                    debug!("cache hit for {key}");
                    return Ok(hit);
                }
                Err(e) => warn!("discarding undecodable cache entry {key}: {e}"),
            },
            Ok(None) => {
                metrics::counter!(observability::CACHE_REQUESTS_TOTAL, "view" => view, "result" => "miss")
                    .increment(1);
                debug!("cache miss for {key}");
            }
            Err(e) => {
                metrics::counter!(observability::CACHE_REQUESTS_TOTAL, "view" => view, "result" => "error")
                    .increment(1);
                warn!("cache read of {key} failed, rebuilding: {e}");
            }
        }

        let epoch = self.views.epoch.load(Ordering::Acquire);
        let fresh = build().await?;
        let value = match serde_json::to_value(&fresh) {
            Ok(value) => value,
            Err(e) => {
                warn!("view {key} could not be encoded for caching: {e}");
                return Ok(fresh);
            }
        };

        let _gate = self.views.gate.read().await;
        if self.views.epoch.load(Ordering::Acquire) != epoch {
            debug!("not repopulating {key}: invalidated during rebuild");
            return Ok(fresh);
        }
        if let Err(e) = self.views.cache.set(&key, value, ttl).await {
            warn!("cache write of {key} failed: {e}");
        }
        Ok(fresh)
    }

    /// Every resource with live occupancy and queue length, ordered by start time.
    pub async fn list_resources(&self) -> Result<Vec<ResourceSummary>, EngineError> {
        self.cached_view("listing", cache::listing_key(), self.ttl.listing, || async move {
            Ok(self.summaries().await)
        })
        .await
    }

    pub async fn resource_detail(&self, id: ResourceId) -> Result<ResourceDetail, EngineError> {
        self.cached_view("detail", cache::resource_key(&id), self.ttl.detail, || async move {
            let guard = self.read_live(&id).await?;
            Ok(ResourceDetail {
                resource: guard.summary(),
                holders: guard.ledger.holders().cloned().collect(),
                waitlist: guard.queue.entries().cloned().collect(),
            })
        })
        .await
    }

    /// Every allocation the requester has ever had, newest first.
    pub async fn requester_history(&self, id: RequesterId) -> Result<Vec<HistoryRow>, EngineError> {
        self.require_requester(&id)?;
        self.cached_view("history", cache::history_key(&id), self.ttl.history, || async move {
            let mut rows = Vec::new();
            for resource_id in self.store.resources_of(&id) {
                let Some(rs) = self.store.get_resource(&resource_id) else {
                    continue;
                };
                let guard = rs.read().await;
                rows.extend(guard.ledger.history_of(&id).map(|a| HistoryRow {
                    allocation_id: a.id,
                    resource_id: guard.id,
                    resource_name: guard.name.clone(),
                    venue: guard.venue.clone(),
                    starts_at: guard.starts_at,
                    state: a.state,
                    created_at: a.created_at,
                    released_at: a.released_at,
                }));
            }
            rows.sort_by(|a, b| {
                b.created_at
                    .cmp(&a.created_at)
                    .then(b.allocation_id.cmp(&a.allocation_id))
            });
            Ok(rows)
        })
        .await
    }

    /// Allocation totals, the most occupied resources, and per-resource utilization.
    pub async fn analytics(&self) -> Result<Analytics, EngineError> {
        self.cached_view("analytics", cache::analytics_key(), self.ttl.analytics, || async move {
            let mut total_allocations = 0u64;
            let mut utilization = Vec::new();
            for resource_id in self.store.resource_ids() {
                let Some(rs) = self.store.get_resource(&resource_id) else {
                    continue;
                };
                let guard = rs.read().await;
                if guard.deleted {
                    continue;
                }
                total_allocations += guard.ledger.allocations().len() as u64;
                utilization.push(utilization_row(&guard));
            }
            let mut popular = utilization.clone();
            popular.sort_by(|a, b| b.occupancy.cmp(&a.occupancy).then(a.resource_id.cmp(&b.resource_id)));
            popular.truncate(POPULAR_LIMIT);
            Ok(Analytics {
                total_allocations,
                popular,
                utilization,
                generated_at: now_ms(),
            })
        })
        .await
    }

    async fn summaries(&self) -> Vec<ResourceSummary> {
        let mut rows = Vec::with_capacity(self.store.resource_count());
        for resource_id in self.store.resource_ids() {
            let Some(rs) = self.store.get_resource(&resource_id) else {
                continue;
            };
            let guard = rs.read().await;
            if !guard.deleted {
                rows.push(guard.summary());
            }
        }
        rows.sort_by(|a, b| a.starts_at.cmp(&b.starts_at).then(a.id.cmp(&b.id)));
        rows
    }

    // ── Uncached reads ───────────────────────────────────────

    /// Entries in position order.
    pub async fn waitlist(&self, resource_id: ResourceId) -> Result<Vec<WaitlistEntry>, EngineError> {
        let guard = self.read_live(&resource_id).await?;
        Ok(guard.queue.entries().cloned().collect())
    }

    pub async fn waitlist_position(
        &self,
        resource_id: ResourceId,
        requester_id: RequesterId,
    ) -> Result<QueuePosition, EngineError> {
        let guard = self.read_live(&resource_id).await?;
        let position = guard
            .queue
            .position_of(&requester_id)
            .ok_or(EngineError::NotFound(Missing::WaitlistEntry {
                resource_id,
                requester_id,
            }))?;
        Ok(QueuePosition {
            position,
            total: guard.queue.len() as u32,
        })
    }

    /// Every queue the requester is in, oldest join first.
    pub async fn requester_waitlists(&self, requester_id: RequesterId) -> Result<Vec<WaitlistEntry>, EngineError> {
        self.require_requester(&requester_id)?;
        let mut entries = Vec::new();
        for resource_id in self.store.resource_ids() {
            let Some(rs) = self.store.get_resource(&resource_id) else {
                continue;
            };
            let guard = rs.read().await;
            if !guard.deleted {
                entries.extend(guard.queue.get(&requester_id).cloned());
            }
        }
        entries.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.id.cmp(&b.id)));
        Ok(entries)
    }

    /// Where a requester currently stands on one resource.
    pub async fn participation(
        &self,
        resource_id: ResourceId,
        requester_id: RequesterId,
    ) -> Result<Participation, EngineError> {
        let guard = self.read_live(&resource_id).await?;
        Ok(guard.participation(&requester_id))
    }

    /// Read lock on a resource that has not been deleted.
    async fn read_live(
        &self,
        id: &ResourceId,
    ) -> Result<OwnedRwLockReadGuard<ResourceState>, EngineError> {
        let rs = self
            .store
            .get_resource(id)
            .ok_or(EngineError::NotFound(Missing::Resource(*id)))?;
        let guard = rs.read_owned().await;
        if guard.deleted {
            return Err(EngineError::NotFound(Missing::Resource(*id)));
        }
        Ok(guard)
    }

    pub fn get_requester(&self, id: &RequesterId) -> Result<Requester, EngineError> {
        self.store
            .get_requester(id)
            .ok_or(EngineError::NotFound(Missing::Requester(*id)))
    }

    // ── Cache administration ─────────────────────────────────

    /// Drop every cached view. Returns how many keys were removed.
    pub async fn clear_cache(&self) -> usize {
        self.views.clear_matching(&["*"]).await
    }

    /// Drop the listing, analytics, and per-resource detail views.
    pub async fn clear_resource_caches(&self) -> usize {
        let listing = cache::listing_key();
        let analytics = cache::analytics_key();
        self.views
            .clear_matching(&[listing.as_str(), analytics.as_str(), "event:*"])
            .await
    }

    pub fn cache_status(&self) -> CacheStatus {
        self.views.cache.status()
    }
}

fn utilization_row(rs: &ResourceState) -> UtilizationRow {
    let capacity = rs.ledger.capacity();
    let occupancy = rs.ledger.occupancy();
    let percent = if capacity == 0 {
        0.0
    } else {
        (f64::from(occupancy) / f64::from(capacity) * 10_000.0).round() / 100.0
    };
    UtilizationRow {
        resource_id: rs.id,
        name: rs.name.clone(),
        venue: rs.venue.clone(),
        occupancy,
        capacity,
        utilization_percent: percent,
    }
}
