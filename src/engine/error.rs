use thiserror::Error;

use crate::model::{AllocationId, RequesterId, ResourceId};

/// What a `NotFound` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Missing {
    #[error("resource {0}")]
    Resource(ResourceId),
    #[error("requester {0}")]
    Requester(RequesterId),
    #[error("allocation {0}")]
    Allocation(AllocationId),
    #[error("waitlist entry for requester {requester_id} on resource {resource_id}")]
    WaitlistEntry {
        resource_id: ResourceId,
        requester_id: RequesterId,
    },
}

/// Expected rejections that callers branch on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictKind {
    #[error("requester already holds allocation {0} on this resource")]
    AlreadyHeld(AllocationId),
    #[error("requester is already waitlisted at position {0}")]
    AlreadyWaiting(u32),
    #[error("allocation {0} was already released")]
    AlreadyReleased(AllocationId),
    #[error("resource still has {available} free slot(s); book directly")]
    NotFull { available: u32 },
    #[error("resource {0} already exists")]
    ResourceExists(ResourceId),
    #[error("requester {0} already exists")]
    RequesterExists(RequesterId),
    #[error("email {0} is already registered")]
    EmailTaken(String),
    #[error("capacity {capacity} is below current occupancy {occupancy}")]
    CapacityBelowOccupancy { capacity: u32, occupancy: u32 },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Missing),
    #[error("conflict: {0}")]
    Conflict(ConflictKind),
    #[error("all {capacity} slots are held; join the waitlist")]
    ResourceExhausted { capacity: u32 },
    /// Internal state found inconsistent. Fatal to the operation; never corrected in place.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    /// The journal commit failed. Nothing was applied; the caller may retry.
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Storage(_))
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::Conflict(kind) => match kind {
                ConflictKind::AlreadyHeld(_) => "already_held",
                ConflictKind::AlreadyWaiting(_) => "already_waiting",
                ConflictKind::AlreadyReleased(_) => "already_released",
                ConflictKind::NotFull { .. } => "not_full",
                ConflictKind::ResourceExists(_)
                | ConflictKind::RequesterExists(_)
                | ConflictKind::EmailTaken(_) => "exists",
                ConflictKind::CapacityBelowOccupancy { .. } => "below_occupancy",
            },
            EngineError::ResourceExhausted { .. } => "exhausted",
            EngineError::InvariantViolation(_) => "invariant_violation",
            EngineError::Storage(_) => "storage",
            EngineError::LimitExceeded(_) => "limit",
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}
