use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::ledger::Ledger;
use crate::waitlist::WaitlistQueue;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub type ResourceId = Ulid;
pub type RequesterId = Ulid;
pub type AllocationId = Ulid;
pub type EntryId = Ulid;

/// Closed lifecycle of an allocation row. `Released` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocationState {
    Held,
    Released,
}

/// A granted slot. Rows are never deleted; a re-booking creates a new row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocationId,
    pub resource_id: ResourceId,
    pub requester_id: RequesterId,
    pub state: AllocationState,
    pub created_at: Ms,
    pub released_at: Option<Ms>,
}

impl Allocation {
    pub fn held(id: AllocationId, resource_id: ResourceId, requester_id: RequesterId, at: Ms) -> Self {
        Self {
            id,
            resource_id,
            requester_id,
            state: AllocationState::Held,
            created_at: at,
            released_at: None,
        }
    }

    pub fn is_held(&self) -> bool {
        self.state == AllocationState::Held
    }
}

/// A queued request for a slot. `position` is dense and 1-based within a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: EntryId,
    pub resource_id: ResourceId,
    pub requester_id: RequesterId,
    pub position: u32,
    pub joined_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub id: RequesterId,
    pub name: String,
    pub email: String,
}

/// Where a requester stands on one resource. The variants are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Participation {
    None,
    Held { allocation_id: AllocationId },
    Waiting { position: u32 },
}

/// A waitlist entry converted into a new `Held` allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promotion {
    pub entry: WaitlistEntry,
    pub allocation: Allocation,
}

impl Promotion {
    pub fn event(&self) -> Event {
        Event::Promoted {
            entry_id: self.entry.id,
            resource_id: self.allocation.resource_id,
            requester_id: self.allocation.requester_id,
            allocation_id: self.allocation.id,
            at: self.allocation.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub released: Allocation,
    pub promoted: Option<Promotion>,
}

/// Everything the engine knows about one resource. Guarded by the resource's
/// `RwLock`; the write lock is the serialization point.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: ResourceId,
    pub name: String,
    pub venue: String,
    pub starts_at: Ms,
    pub ledger: Ledger,
    pub queue: WaitlistQueue,
    /// Set once the resource has been removed from the store. Writers that
    /// were parked on the lock must observe this and bail out.
    pub deleted: bool,
}

impl ResourceState {
    pub fn new(id: ResourceId, name: String, venue: String, starts_at: Ms, capacity: u32) -> Self {
        Self {
            id,
            name,
            venue,
            starts_at,
            ledger: Ledger::new(capacity),
            queue: WaitlistQueue::new(),
            deleted: false,
        }
    }

    pub fn participation(&self, requester_id: &RequesterId) -> Participation {
        if let Some(allocation_id) = self.ledger.held_by(requester_id) {
            return Participation::Held { allocation_id };
        }
        match self.queue.position_of(requester_id) {
            Some(position) => Participation::Waiting { position },
            None => Participation::None,
        }
    }

    /// Consistency check run inside the serialization point before any
    /// mutation. Cost is bounded by the queue length, not the history length.
    pub fn check(&self) -> Result<(), String> {
        self.ledger.check()?;
        self.check_queue()
    }

    /// Full consistency check, including a recount of the allocation history.
    pub fn verify(&self) -> Result<(), String> {
        self.ledger.verify()?;
        self.check_queue()
    }

    fn check_queue(&self) -> Result<(), String> {
        self.queue.verify()?;
        for entry in self.queue.entries() {
            if self.ledger.held_by(&entry.requester_id).is_some() {
                return Err(format!(
                    "requester {} both holds a slot and waits on resource {}",
                    entry.requester_id, self.id
                ));
            }
        }
        Ok(())
    }

    pub fn summary(&self) -> ResourceSummary {
        ResourceSummary {
            id: self.id,
            name: self.name.clone(),
            venue: self.venue.clone(),
            starts_at: self.starts_at,
            capacity: self.ledger.capacity(),
            occupancy: self.ledger.occupancy(),
            available: self.ledger.available(),
            waitlist_len: self.queue.len() as u32,
        }
    }
}

/// The WAL record format. One commit is a `Vec<Event>` applied all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RequesterRegistered {
        id: RequesterId,
        name: String,
        email: String,
    },
    RequesterRemoved {
        id: RequesterId,
    },
    ResourceCreated {
        id: ResourceId,
        name: String,
        venue: String,
        starts_at: Ms,
        capacity: u32,
    },
    ResourceUpdated {
        id: ResourceId,
        name: String,
        venue: String,
        starts_at: Ms,
    },
    ResourceResized {
        id: ResourceId,
        capacity: u32,
    },
    ResourceDeleted {
        id: ResourceId,
    },
    AllocationGranted {
        id: AllocationId,
        resource_id: ResourceId,
        requester_id: RequesterId,
        at: Ms,
    },
    AllocationReleased {
        id: AllocationId,
        resource_id: ResourceId,
        at: Ms,
    },
    WaitlistJoined {
        id: EntryId,
        resource_id: ResourceId,
        requester_id: RequesterId,
        position: u32,
        at: Ms,
    },
    WaitlistLeft {
        resource_id: ResourceId,
        requester_id: RequesterId,
    },
    /// Pop of the front entry and creation of its allocation, as one record.
    Promoted {
        entry_id: EntryId,
        resource_id: ResourceId,
        requester_id: RequesterId,
        allocation_id: AllocationId,
        at: Ms,
    },
}

impl Event {
    /// The resource a per-resource event applies to.
    pub fn resource_id(&self) -> Option<ResourceId> {
        match self {
            Event::ResourceUpdated { id, .. } | Event::ResourceResized { id, .. } => Some(*id),
            Event::AllocationGranted { resource_id, .. }
            | Event::AllocationReleased { resource_id, .. }
            | Event::WaitlistJoined { resource_id, .. }
            | Event::WaitlistLeft { resource_id, .. }
            | Event::Promoted { resource_id, .. } => Some(*resource_id),
            Event::RequesterRegistered { .. }
            | Event::RequesterRemoved { .. }
            | Event::ResourceCreated { .. }
            | Event::ResourceDeleted { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSummary {
    pub id: ResourceId,
    pub name: String,
    pub venue: String,
    pub starts_at: Ms,
    pub capacity: u32,
    pub occupancy: u32,
    pub available: u32,
    pub waitlist_len: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDetail {
    pub resource: ResourceSummary,
    pub holders: Vec<Allocation>,
    pub waitlist: Vec<WaitlistEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub allocation_id: AllocationId,
    pub resource_id: ResourceId,
    pub resource_name: String,
    pub venue: String,
    pub starts_at: Ms,
    pub state: AllocationState,
    pub created_at: Ms,
    pub released_at: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilizationRow {
    pub resource_id: ResourceId,
    pub name: String,
    pub venue: String,
    pub occupancy: u32,
    pub capacity: u32,
    pub utilization_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analytics {
    pub total_allocations: u64,
    pub popular: Vec<UtilizationRow>,
    pub utilization: Vec<UtilizationRow>,
    pub generated_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePosition {
    pub position: u32,
    pub total: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(capacity: u32) -> ResourceState {
        ResourceState::new(Ulid::new(), "Gala".into(), "Hall A".into(), 0, capacity)
    }

    #[test]
    fn participation_tracks_ledger_and_queue() {
        let mut rs = resource(1);
        let holder = Ulid::new();
        let waiter = Ulid::new();
        let alloc_id = Ulid::new();
        rs.ledger.grant(Allocation::held(alloc_id, rs.id, holder, 10));
        rs.queue.push(WaitlistEntry {
            id: Ulid::new(),
            resource_id: rs.id,
            requester_id: waiter,
            position: 1,
            joined_at: 11,
        });

        assert_eq!(rs.participation(&holder), Participation::Held { allocation_id: alloc_id });
        assert_eq!(rs.participation(&waiter), Participation::Waiting { position: 1 });
        assert_eq!(rs.participation(&Ulid::new()), Participation::None);
        assert!(rs.verify().is_ok());
    }

    #[test]
    fn verify_rejects_holder_who_also_waits() {
        let mut rs = resource(2);
        let who = Ulid::new();
        rs.ledger.grant(Allocation::held(Ulid::new(), rs.id, who, 10));
        rs.queue.push(WaitlistEntry {
            id: Ulid::new(),
            resource_id: rs.id,
            requester_id: who,
            position: 1,
            joined_at: 11,
        });
        let err = rs.check().unwrap_err();
        assert!(err.contains("both holds a slot and waits"));
        assert!(rs.verify().is_err());
    }

    #[test]
    fn summary_reports_availability() {
        let mut rs = resource(3);
        rs.ledger.grant(Allocation::held(Ulid::new(), rs.id, Ulid::new(), 10));
        let s = rs.summary();
        assert_eq!(s.capacity, 3);
        assert_eq!(s.occupancy, 1);
        assert_eq!(s.available, 2);
        assert_eq!(s.waitlist_len, 0);
    }

    #[test]
    fn promotion_event_carries_entry_and_allocation() {
        let rid = Ulid::new();
        let who = Ulid::new();
        let entry = WaitlistEntry {
            id: Ulid::new(),
            resource_id: rid,
            requester_id: who,
            position: 1,
            joined_at: 5,
        };
        let allocation = Allocation::held(Ulid::new(), rid, who, 9);
        let p = Promotion { entry: entry.clone(), allocation: allocation.clone() };
        assert_eq!(
            p.event(),
            Event::Promoted {
                entry_id: entry.id,
                resource_id: rid,
                requester_id: who,
                allocation_id: allocation.id,
                at: 9,
            }
        );
        assert_eq!(p.event().resource_id(), Some(rid));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ResourceCreated {
            id: Ulid::new(),
            name: "Test".into(),
            venue: "Main".into(),
            starts_at: 1_700_000_000_000,
            capacity: 2,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
