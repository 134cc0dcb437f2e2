use std::collections::{HashSet, VecDeque};

use crate::engine::{ConflictKind, EngineError};
use crate::limits::MAX_WAITLIST_LEN;
use crate::model::*;

/// Per-resource FIFO of requesters waiting for a freed slot.
///
/// Entries are kept in position order and positions are always exactly
/// `1..=len`. Every removal shifts later entries down by one, so removal is
/// O(queue length). Not internally synchronized: mutate only under the
/// resource's write lock.
#[derive(Debug, Clone, Default)]
pub struct WaitlistQueue {
    entries: VecDeque<WaitlistEntry>,
}

impl WaitlistQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &WaitlistEntry> {
        self.entries.iter()
    }

    pub fn get(&self, requester_id: &RequesterId) -> Option<&WaitlistEntry> {
        self.entries.iter().find(|e| &e.requester_id == requester_id)
    }

    pub fn position_of(&self, requester_id: &RequesterId) -> Option<u32> {
        self.get(requester_id).map(|e| e.position)
    }

    /// Position the next joiner would receive (max + 1, or 1 when empty).
    pub fn next_position(&self) -> u32 {
        self.entries.back().map_or(1, |e| e.position + 1)
    }

    /// Admission check for a join. `held` is the requester's current
    /// allocation on this resource, if any.
    pub fn admit(
        &self,
        requester_id: &RequesterId,
        held: Option<AllocationId>,
        available: u32,
    ) -> Result<u32, EngineError> {
        if let Some(allocation_id) = held {
            return Err(EngineError::Conflict(ConflictKind::AlreadyHeld(allocation_id)));
        }
        if let Some(position) = self.position_of(requester_id) {
            return Err(EngineError::Conflict(ConflictKind::AlreadyWaiting(position)));
        }
        if available > 0 {
            return Err(EngineError::Conflict(ConflictKind::NotFull { available }));
        }
        if self.entries.len() >= MAX_WAITLIST_LEN {
            return Err(EngineError::LimitExceeded("waitlist too long"));
        }
        Ok(self.next_position())
    }

    /// Append an entry whose position was handed out by `next_position`.
    pub fn push(&mut self, entry: WaitlistEntry) {
        debug_assert_eq!(entry.position, self.next_position());
        self.entries.push_back(entry);
    }

    /// Remove the requester's entry and shift every later entry down by one.
    pub fn remove(&mut self, requester_id: &RequesterId) -> Option<WaitlistEntry> {
        let idx = self
            .entries
            .iter()
            .position(|e| &e.requester_id == requester_id)?;
        self.remove_at(idx)
    }

    /// Remove and return the entry at position 1.
    pub fn pop_front(&mut self) -> Option<WaitlistEntry> {
        self.remove_at(0)
    }

    fn remove_at(&mut self, idx: usize) -> Option<WaitlistEntry> {
        let removed = self.entries.remove(idx)?;
        for entry in self.entries.iter_mut().skip(idx) {
            entry.position -= 1;
        }
        Some(removed)
    }

    /// Positions must be exactly `1..=len` in storage order, with no requester
    /// appearing twice.
    pub fn verify(&self) -> Result<(), String> {
        let mut seen = HashSet::with_capacity(self.entries.len());
        for (i, entry) in self.entries.iter().enumerate() {
            let expected = i as u32 + 1;
            if entry.position != expected {
                return Err(format!(
                    "waitlist position {} found where {} expected",
                    entry.position, expected
                ));
            }
            if !seen.insert(entry.requester_id) {
                return Err(format!("requester {} queued twice", entry.requester_id));
            }
        }
        Ok(())
    }
}
