use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::warn;

use crate::cache::{self, ViewCache};
use crate::model::{RequesterId, ResourceId};

/// Cached views a committed change made stale. The listing and analytics
/// views are always included.
#[derive(Debug, Clone, Default)]
pub(super) struct Stale {
    pub resources: Vec<ResourceId>,
    pub requesters: Vec<RequesterId>,
}

impl Stale {
    pub fn resource(id: ResourceId, requesters: impl IntoIterator<Item = RequesterId>) -> Self {
        Self {
            resources: vec![id],
            requesters: requesters.into_iter().collect(),
        }
    }

    fn keys(&self) -> Vec<String> {
        let mut keys = vec![cache::listing_key(), cache::analytics_key()];
        keys.extend(self.resources.iter().map(cache::resource_key));
        keys.extend(self.requesters.iter().map(cache::history_key));
        keys
    }
}

/// The view cache plus the epoch that guards read-repopulation.
pub(super) struct Views {
    pub cache: Arc<dyn ViewCache>,
    /// Bumped by every invalidation. A reader only writes a rebuilt view back
    /// if the epoch it started from is still current.
    pub epoch: AtomicU64,
    pub gate: RwLock<()>,
}

impl Views {
    pub fn new(cache: Arc<dyn ViewCache>) -> Self {
        Self {
            cache,
            epoch: AtomicU64::new(0),
            gate: RwLock::new(()),
        }
    }

    /// Drop every key in `stale`. Called while the change's resource locks
    /// are still held, so no reader can observe the new state before its
    /// views are gone.
    pub async fn invalidate(&self, stale: &Stale) {
        let _gate = self.gate.write().await;
        self.epoch.fetch_add(1, Ordering::AcqRel);
        for key in stale.keys() {
            if let Err(e) = self.cache.delete(&key).await {
                warn!("cache invalidation of {key} failed: {e}");
            }
        }
    }

    /// Delete every key matching one of `patterns`. Returns how many were removed.
    pub async fn clear_matching(&self, patterns: &[&str]) -> usize {
        let _gate = self.gate.write().await;
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let mut removed = 0;
        for pattern in patterns {
            match self.cache.delete_pattern(pattern).await {
                Ok(n) => removed += n,
                Err(e) => warn!("cache clear of {pattern} failed: {e}"),
            }
        }
        removed
    }
}
