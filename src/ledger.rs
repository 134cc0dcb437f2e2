use std::collections::HashMap;

use crate::engine::{ConflictKind, EngineError, Missing};
use crate::model::*;

/// Per-resource allocation record: capacity, occupancy, and the full
/// append-only history of allocation rows.
///
/// The ledger performs no locking. Callers must hold the owning resource's
/// write lock for every mutating call.
#[derive(Debug, Clone)]
pub struct Ledger {
    capacity: u32,
    occupancy: u32,
    /// Creation order. Rows only ever move `Held` → `Released`.
    allocations: Vec<Allocation>,
    index: HashMap<AllocationId, usize>,
    /// At most one `Held` allocation per requester.
    held: HashMap<RequesterId, AllocationId>,
}

impl Ledger {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            occupancy: 0,
            allocations: Vec::new(),
            index: HashMap::new(),
            held: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn occupancy(&self) -> u32 {
        self.occupancy
    }

    pub fn available(&self) -> u32 {
        self.capacity.saturating_sub(self.occupancy)
    }

    pub fn is_full(&self) -> bool {
        self.occupancy >= self.capacity
    }

    pub fn held_by(&self, requester_id: &RequesterId) -> Option<AllocationId> {
        self.held.get(requester_id).copied()
    }

    pub fn get(&self, id: &AllocationId) -> Option<&Allocation> {
        self.index.get(id).map(|&i| &self.allocations[i])
    }

    pub fn allocations(&self) -> &[Allocation] {
        &self.allocations
    }

    pub fn holders(&self) -> impl Iterator<Item = &Allocation> {
        self.allocations.iter().filter(|a| a.is_held())
    }

    pub fn history_of<'a>(&'a self, requester_id: &'a RequesterId) -> impl Iterator<Item = &'a Allocation> {
        self.allocations
            .iter()
            .filter(move |a| &a.requester_id == requester_id)
    }

    /// Admission check for a direct booking. Duplicate conditions are
    /// reported ahead of exhaustion so a holder is never told to go queue.
    pub fn admit(&self, requester_id: &RequesterId, queued_at: Option<u32>) -> Result<(), EngineError> {
        if let Some(existing) = self.held_by(requester_id) {
            return Err(EngineError::Conflict(ConflictKind::AlreadyHeld(existing)));
        }
        if let Some(position) = queued_at {
            return Err(EngineError::Conflict(ConflictKind::AlreadyWaiting(position)));
        }
        if self.is_full() {
            return Err(EngineError::ResourceExhausted {
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Release check: the allocation must exist on this ledger and still be held.
    pub fn check_release(&self, id: &AllocationId) -> Result<&Allocation, EngineError> {
        let allocation = self
            .get(id)
            .ok_or(EngineError::NotFound(Missing::Allocation(*id)))?;
        if !allocation.is_held() {
            return Err(EngineError::Conflict(ConflictKind::AlreadyReleased(*id)));
        }
        Ok(allocation)
    }

    /// Internal write path. No admission checks; used for validated bookings,
    /// promotions, and WAL replay.
    pub fn grant(&mut self, allocation: Allocation) {
        debug_assert!(allocation.is_held());
        self.held.insert(allocation.requester_id, allocation.id);
        self.index.insert(allocation.id, self.allocations.len());
        self.allocations.push(allocation);
        self.occupancy += 1;
    }

    /// Transition a held allocation to `Released`. Returns `None` (and changes
    /// nothing) if the id is unknown or already released.
    pub fn release(&mut self, id: &AllocationId, at: Ms) -> Option<Allocation> {
        let &i = self.index.get(id)?;
        let row = &mut self.allocations[i];
        if !row.is_held() {
            return None;
        }
        row.state = AllocationState::Released;
        row.released_at = Some(at);
        self.held.remove(&row.requester_id);
        self.occupancy -= 1;
        Some(row.clone())
    }

    pub fn resize(&mut self, capacity: u32) {
        self.capacity = capacity;
    }

    /// Constant-time consistency check, run before every mutation.
    pub fn check(&self) -> Result<(), String> {
        if self.held.len() as u32 != self.occupancy {
            return Err(format!(
                "occupancy counter {} disagrees with {} indexed holders",
                self.occupancy,
                self.held.len()
            ));
        }
        if self.occupancy > self.capacity {
            return Err(format!(
                "occupancy {} exceeds capacity {}",
                self.occupancy, self.capacity
            ));
        }
        Ok(())
    }

    /// Recount held rows and compare against the counter and index.
    pub fn verify(&self) -> Result<(), String> {
        self.check()?;
        let counted = self.allocations.iter().filter(|a| a.is_held()).count() as u32;
        if counted != self.occupancy {
            return Err(format!(
                "occupancy counter {} disagrees with {} held rows",
                self.occupancy, counted
            ));
        }
        for (requester, id) in &self.held {
            match self.get(id) {
                Some(a) if a.is_held() && &a.requester_id == requester => {}
                _ => return Err(format!("held index entry {id} for {requester} is stale")),
            }
        }
        Ok(())
    }
}
