use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Ms)
}

/// Run the cheap consistency check on a locked resource. A breach aborts the
/// operation; nothing is repaired in place.
pub(crate) fn ensure_consistent(rs: &ResourceState) -> Result<(), EngineError> {
    rs.check().map_err(|detail| {
        metrics::counter!(crate::observability::INVARIANT_VIOLATIONS_TOTAL).increment(1);
        tracing::error!(resource = %rs.id, "invariant violation: {detail}");
        EngineError::InvariantViolation(detail)
    })
}

pub(crate) fn validate_text(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.trim().is_empty() || value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

pub(crate) fn validate_capacity(capacity: u32) -> Result<(), EngineError> {
    if capacity == 0 || capacity > MAX_CAPACITY {
        return Err(EngineError::LimitExceeded("capacity out of range"));
    }
    Ok(())
}

pub(crate) fn validate_email(email: &str) -> Result<(), EngineError> {
    validate_text(email, MAX_EMAIL_LEN, "email length")?;
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(EngineError::LimitExceeded("malformed email")),
    }
}

/// Plan up to `limit` promotions against `rs` as it would look after the
/// caller's own pending events. `freed` counts slots those events release and
/// `skip` names a requester whose queue entry they withdraw.
///
/// Each returned promotion pops the then-front entry, so every planned entry
/// carries position 1.
pub(crate) fn plan_promotions(
    rs: &ResourceState,
    freed: u32,
    skip: Option<&RequesterId>,
    limit: usize,
    at: Ms,
) -> Result<Vec<Promotion>, EngineError> {
    let occupancy = rs.ledger.occupancy().saturating_sub(freed);
    let open = rs.ledger.capacity().saturating_sub(occupancy) as usize;
    let mut planned = Vec::new();
    for entry in rs
        .queue
        .entries()
        .filter(|e| Some(&e.requester_id) != skip)
        .take(open.min(limit))
    {
        // The queue never holds a current holder; finding one here means the
        // state is already corrupt.
        if rs.ledger.held_by(&entry.requester_id).is_some() {
            return Err(EngineError::InvariantViolation(format!(
                "queued requester {} already holds a slot on {}",
                entry.requester_id, rs.id
            )));
        }
        planned.push(Promotion {
            entry: WaitlistEntry {
                position: 1,
                ..entry.clone()
            },
            allocation: Allocation::held(ulid::Ulid::new(), rs.id, entry.requester_id, at),
        });
    }
    Ok(planned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn full_with_queue(capacity: u32, queued: usize) -> (ResourceState, Vec<RequesterId>) {
        let mut rs = ResourceState::new(Ulid::new(), "Gala".into(), "Hall".into(), 0, capacity);
        for _ in 0..capacity {
            rs.ledger
                .grant(Allocation::held(Ulid::new(), rs.id, Ulid::new(), 0));
        }
        let mut waiting = Vec::new();
        for _ in 0..queued {
            let requester = Ulid::new();
            let position = rs.queue.next_position();
            rs.queue.push(WaitlistEntry {
                id: Ulid::new(),
                resource_id: rs.id,
                requester_id: requester,
                position,
                joined_at: 0,
            });
            waiting.push(requester);
        }
        (rs, waiting)
    }

    #[test]
    fn nothing_planned_while_full() {
        let (rs, _) = full_with_queue(2, 3);
        assert!(plan_promotions(&rs, 0, None, usize::MAX, 1).unwrap().is_empty());
    }

    #[test]
    fn one_freed_slot_promotes_the_front() {
        let (rs, waiting) = full_with_queue(2, 3);
        let planned = plan_promotions(&rs, 1, None, 1, 5).unwrap();
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].allocation.requester_id, waiting[0]);
        assert_eq!(planned[0].allocation.created_at, 5);
        assert_eq!(planned[0].entry.position, 1);
    }

    #[test]
    fn skipped_requester_is_passed_over() {
        let (rs, waiting) = full_with_queue(1, 2);
        let planned = plan_promotions(&rs, 1, Some(&waiting[0]), usize::MAX, 0).unwrap();
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].allocation.requester_id, waiting[1]);
    }

    #[test]
    fn plan_is_bounded_by_open_slots_and_queue() {
        let (mut rs, waiting) = full_with_queue(2, 3);
        rs.ledger.resize(4);
        let planned = plan_promotions(&rs, 0, None, usize::MAX, 0).unwrap();
        let promoted: Vec<_> = planned.iter().map(|p| p.allocation.requester_id).collect();
        assert_eq!(promoted, waiting[..2].to_vec());

        rs.ledger.resize(10);
        assert_eq!(plan_promotions(&rs, 0, None, usize::MAX, 0).unwrap().len(), 3);
    }

    #[test]
    fn email_shape() {
        assert!(validate_email("a@b.c").is_ok());
        assert!(validate_email("nobody").is_err());
        assert!(validate_email("@b").is_err());
        assert!(validate_email("").is_err());
    }

    #[test]
    fn capacity_bounds() {
        assert!(validate_capacity(0).is_err());
        assert!(validate_capacity(1).is_ok());
        assert!(validate_capacity(MAX_CAPACITY + 1).is_err());
    }
}
