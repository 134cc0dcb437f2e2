mod error;
mod mutations;
mod queries;
mod store;
mod validate;
mod views;

pub use error::{ConflictKind, EngineError, Missing};
pub use store::InMemoryStore;

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::{info, warn};

use crate::cache::ViewCache;
use crate::config::CacheTtl;
use crate::journal::{Journal, WalJournal};
use crate::model::*;
use crate::wal::Wal;

use validate::ensure_consistent;
use views::{Stale, Views};

pub type SharedResourceState = Arc<RwLock<ResourceState>>;
pub(super) type ResourceGuard = OwnedRwLockWriteGuard<ResourceState>;

/// Allocation engine: per-resource serialization, the booking / waitlist
/// state machine, promotion, and cache invalidation.
///
/// Every mutation validates under the resource's write lock, commits its
/// events to the journal, and only then applies them to memory. A failed
/// commit leaves memory exactly as it was. The commit, the apply and the
/// cache invalidation run in a spawned task that owns the locks, so a caller
/// that stops waiting cannot separate them.
pub struct Engine {
    pub(super) store: Arc<InMemoryStore>,
    pub(super) journal: Arc<dyn Journal>,
    pub(super) views: Arc<Views>,
    pub(super) ttl: CacheTtl,
    /// Serializes resource creation/deletion, requester registry changes,
    /// and the multi-resource sections of requester removal and compaction.
    pub(super) catalog: Arc<Mutex<()>>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its group-commit writer.
    /// Must run inside a tokio runtime.
    pub fn open(wal_path: &Path, cache: Arc<dyn ViewCache>, ttl: CacheTtl) -> io::Result<Self> {
        let events = Wal::replay(wal_path)?;
        let journal = Arc::new(WalJournal::open(wal_path)?);
        let engine = Self::from_parts(journal, &events, cache, ttl);
        info!(
            resources = engine.store.resource_count(),
            requesters = engine.store.requester_count(),
            "recovered {} events from {}",
            events.len(),
            wal_path.display()
        );
        Ok(engine)
    }

    /// Build an engine over an arbitrary journal, rebuilding state from
    /// `history` (the journal's committed events, oldest first).
    pub fn from_parts(
        journal: Arc<dyn Journal>,
        history: &[Event],
        cache: Arc<dyn ViewCache>,
        ttl: CacheTtl,
    ) -> Self {
        let engine = Self {
            store: Arc::new(InMemoryStore::new()),
            journal,
            views: Arc::new(Views::new(cache)),
            ttl,
            catalog: Arc::new(Mutex::new(())),
        };
        engine.replay(history);
        engine
    }

    /// Rebuild in-memory state. Resources are assembled as plain values and
    /// only wrapped in their locks once the whole log has been applied.
    fn replay(&self, events: &[Event]) {
        let mut resources: HashMap<ResourceId, ResourceState> = HashMap::new();
        for event in events {
            match event {
                Event::RequesterRegistered { id, name, email } => {
                    self.store.insert_requester(Requester {
                        id: *id,
                        name: name.clone(),
                        email: email.clone(),
                    });
                }
                Event::RequesterRemoved { id } => {
                    self.store.remove_requester(id);
                }
                Event::ResourceCreated {
                    id,
                    name,
                    venue,
                    starts_at,
                    capacity,
                } => {
                    let rs = ResourceState::new(*id, name.clone(), venue.clone(), *starts_at, *capacity);
                    resources.insert(*id, rs);
                }
                Event::ResourceDeleted { id } => {
                    if let Some(rs) = resources.remove(id) {
                        self.store.remove_resource(&rs);
                    }
                }
                other => {
                    let Some(id) = other.resource_id() else { continue };
                    if let Some(rs) = resources.get_mut(&id) {
                        self.store.apply_event(rs, other);
                    }
                }
            }
        }
        for (id, rs) in resources {
            if let Err(detail) = rs.verify() {
                // Served anyway; every mutation on it will fail the pre-check.
                warn!(resource = %id, "replayed state is inconsistent: {detail}");
            }
            self.store.insert_resource(id, Arc::new(RwLock::new(rs)));
        }
    }

    pub fn store(&self) -> &InMemoryStore {
        &self.store
    }

    /// Commit `events` as one transaction, then run `apply` and drop the
    /// `stale` views. All three happen in a spawned task: once the commit is
    /// sent, dropping the returned future no longer stops the apply. Locks
    /// moved into `apply` are released when its output is dropped.
    pub(super) async fn commit_detached<T, F>(
        &self,
        events: Vec<Event>,
        stale: Stale,
        apply: F,
    ) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&[Event]) -> T + Send + 'static,
    {
        let journal = self.journal.clone();
        let views = self.views.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = journal.commit(&events).await {
                warn!("journal commit of {} events failed: {e}", events.len());
                return Err(EngineError::Storage(e.to_string()));
            }
            let out = apply(&events);
            views.invalidate(&stale).await;
            Ok(out)
        });
        match task.await {
            Ok(result) => result,
            Err(e) => Err(EngineError::Storage(format!("commit task failed: {e}"))),
        }
    }

    /// Commit `events` against one locked resource and apply them to it.
    /// The guard comes back once the stale views are gone; on a failed
    /// commit it is released untouched.
    pub(super) async fn persist_and_apply(
        &self,
        mut guard: ResourceGuard,
        events: Vec<Event>,
        stale: Stale,
    ) -> Result<ResourceGuard, EngineError> {
        let store = self.store.clone();
        self.commit_detached(events, stale, move |events| {
            for event in events {
                store.apply_event(&mut guard, event);
            }
            guard
        })
        .await
    }

    /// Acquire a resource's write lock and run the consistency pre-check.
    /// Fails with `NotFound` if the resource was deleted while we waited.
    pub(super) async fn lock_resource(
        &self,
        id: &ResourceId,
    ) -> Result<ResourceGuard, EngineError> {
        let rs = self
            .store
            .get_resource(id)
            .ok_or(EngineError::NotFound(Missing::Resource(*id)))?;
        let guard = rs.write_owned().await;
        if guard.deleted {
            return Err(EngineError::NotFound(Missing::Resource(*id)));
        }
        ensure_consistent(&guard)?;
        Ok(guard)
    }

    /// Allocation id → owning resource → write lock.
    pub(super) async fn lock_allocation(
        &self,
        allocation_id: &AllocationId,
    ) -> Result<ResourceGuard, EngineError> {
        let resource_id = self
            .store
            .resource_for_allocation(allocation_id)
            .ok_or(EngineError::NotFound(Missing::Allocation(*allocation_id)))?;
        match self.lock_resource(&resource_id).await {
            Err(EngineError::NotFound(Missing::Resource(_))) => {
                Err(EngineError::NotFound(Missing::Allocation(*allocation_id)))
            }
            other => other,
        }
    }

    pub(super) fn require_requester(&self, id: &RequesterId) -> Result<(), EngineError> {
        if self.store.contains_requester(id) {
            Ok(())
        } else {
            Err(EngineError::NotFound(Missing::Requester(*id)))
        }
    }
}
