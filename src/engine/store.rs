use std::collections::HashSet;

use dashmap::DashMap;

use crate::model::*;

use super::SharedResourceState;

/// Concurrent indexes over all resources and requesters. Per-resource state
/// lives behind its own lock; the maps here only locate it.
pub struct InMemoryStore {
    resources: DashMap<ResourceId, SharedResourceState>,
    /// allocation id → owning resource
    allocation_to_resource: DashMap<AllocationId, ResourceId>,
    requesters: DashMap<RequesterId, Requester>,
    emails: DashMap<String, RequesterId>,
    /// Resources on which a requester has ever been allocated.
    requester_resources: DashMap<RequesterId, HashSet<ResourceId>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            allocation_to_resource: DashMap::new(),
            requesters: DashMap::new(),
            emails: DashMap::new(),
            requester_resources: DashMap::new(),
        }
    }

    // ── Resources ────────────────────────────────────────────

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn contains_resource(&self, id: &ResourceId) -> bool {
        self.resources.contains_key(id)
    }

    pub fn get_resource(&self, id: &ResourceId) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn insert_resource(&self, id: ResourceId, state: SharedResourceState) {
        self.resources.insert(id, state);
    }

    /// Drop a resource and every index entry pointing into it.
    pub fn remove_resource(&self, rs: &ResourceState) {
        self.resources.remove(&rs.id);
        for allocation in rs.ledger.allocations() {
            self.allocation_to_resource.remove(&allocation.id);
            if let Some(mut set) = self.requester_resources.get_mut(&allocation.requester_id) {
                set.remove(&rs.id);
            }
        }
    }

    /// Resource ids in ascending order, which is also lock-acquisition order.
    pub fn resource_ids(&self) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = self.resources.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    // ── Allocation index ─────────────────────────────────────

    pub fn resource_for_allocation(&self, id: &AllocationId) -> Option<ResourceId> {
        self.allocation_to_resource.get(id).map(|e| *e.value())
    }

    pub fn index_allocation(&self, allocation: &Allocation) {
        self.allocation_to_resource
            .insert(allocation.id, allocation.resource_id);
        self.requester_resources
            .entry(allocation.requester_id)
            .or_default()
            .insert(allocation.resource_id);
    }

    pub fn resources_of(&self, requester_id: &RequesterId) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = self
            .requester_resources
            .get(requester_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    // ── Requesters ───────────────────────────────────────────

    pub fn requester_count(&self) -> usize {
        self.requesters.len()
    }

    pub fn get_requester(&self, id: &RequesterId) -> Option<Requester> {
        self.requesters.get(id).map(|e| e.value().clone())
    }

    pub fn contains_requester(&self, id: &RequesterId) -> bool {
        self.requesters.contains_key(id)
    }

    pub fn email_owner(&self, email: &str) -> Option<RequesterId> {
        self.emails.get(email).map(|e| *e.value())
    }

    pub fn insert_requester(&self, requester: Requester) {
        self.emails.insert(requester.email.clone(), requester.id);
        self.requesters.insert(requester.id, requester);
    }

    /// The allocation history index is kept: history rows are never deleted.
    pub fn remove_requester(&self, id: &RequesterId) -> Option<Requester> {
        let (_, requester) = self.requesters.remove(id)?;
        self.emails.remove(&requester.email);
        Some(requester)
    }

    pub fn requesters(&self) -> Vec<Requester> {
        let mut all: Vec<Requester> = self.requesters.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|r| r.id);
        all
    }

    // ── Event application ────────────────────────────────────

    /// Apply a per-resource event. The caller holds the resource's write lock
    /// and has already validated the event against `rs`.
    pub fn apply_event(&self, rs: &mut ResourceState, event: &Event) {
        match event {
            Event::AllocationGranted {
                id,
                resource_id,
                requester_id,
                at,
            } => {
                let allocation = Allocation::held(*id, *resource_id, *requester_id, *at);
                self.index_allocation(&allocation);
                rs.ledger.grant(allocation);
            }
            Event::AllocationReleased { id, at, .. } => {
                rs.ledger.release(id, *at);
            }
            Event::WaitlistJoined {
                id,
                resource_id,
                requester_id,
                position,
                at,
            } => {
                rs.queue.push(WaitlistEntry {
                    id: *id,
                    resource_id: *resource_id,
                    requester_id: *requester_id,
                    position: *position,
                    joined_at: *at,
                });
            }
            Event::WaitlistLeft { requester_id, .. } => {
                rs.queue.remove(requester_id);
            }
            Event::Promoted {
                entry_id,
                resource_id,
                requester_id,
                allocation_id,
                at,
            } => {
                let popped = rs.queue.pop_front();
                debug_assert_eq!(popped.map(|e| e.id), Some(*entry_id));
                let allocation = Allocation::held(*allocation_id, *resource_id, *requester_id, *at);
                self.index_allocation(&allocation);
                rs.ledger.grant(allocation);
            }
            Event::ResourceUpdated {
                name,
                venue,
                starts_at,
                ..
            } => {
                rs.name = name.clone();
                rs.venue = venue.clone();
                rs.starts_at = *starts_at;
            }
            Event::ResourceResized { capacity, .. } => {
                rs.ledger.resize(*capacity);
            }
            // Handled at the map level, not per resource
            Event::RequesterRegistered { .. }
            | Event::RequesterRemoved { .. }
            | Event::ResourceCreated { .. }
            | Event::ResourceDeleted { .. } => {}
        }
    }
}
