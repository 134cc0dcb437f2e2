use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{self, outcome};

use super::validate::{
    ensure_consistent, now_ms, plan_promotions, validate_capacity, validate_email, validate_text,
};
use super::views::Stale;
use super::{ConflictKind, Engine, EngineError, Missing, ResourceGuard};

impl Engine {
    // ── Booking and cancellation ─────────────────────────────

    /// Grant a slot if one is free. A full resource is reported as
    /// `ResourceExhausted`; the caller decides whether to join the waitlist.
    pub async fn book(
        &self,
        resource_id: ResourceId,
        requester_id: RequesterId,
    ) -> Result<Allocation, EngineError> {
        let result = self.book_inner(resource_id, requester_id).await;
        metrics::counter!(observability::BOOKINGS_TOTAL, "outcome" => outcome(&result)).increment(1);
        if let Err(e) = &result {
            debug!(resource = %resource_id, requester = %requester_id, "booking rejected: {e}");
        }
        result
    }

    async fn book_inner(
        &self,
        resource_id: ResourceId,
        requester_id: RequesterId,
    ) -> Result<Allocation, EngineError> {
        let guard = self.lock_resource(&resource_id).await?;
        self.require_requester(&requester_id)?;
        guard
            .ledger
            .admit(&requester_id, guard.queue.position_of(&requester_id))?;

        let allocation = Allocation::held(Ulid::new(), resource_id, requester_id, now_ms());
        let event = Event::AllocationGranted {
            id: allocation.id,
            resource_id,
            requester_id,
            at: allocation.created_at,
        };
        let stale = Stale::resource(resource_id, [requester_id]);
        self.persist_and_apply(guard, vec![event], stale).await?;
        Ok(allocation)
    }

    /// Release a held allocation and, in the same transaction, promote the
    /// front of the waitlist into the freed slot.
    pub async fn cancel(&self, allocation_id: AllocationId) -> Result<CancelOutcome, EngineError> {
        let result = self.cancel_inner(allocation_id).await;
        metrics::counter!(observability::CANCELLATIONS_TOTAL, "outcome" => outcome(&result))
            .increment(1);
        match &result {
            Ok(CancelOutcome {
                promoted: Some(p), ..
            }) => {
                metrics::counter!(observability::PROMOTIONS_TOTAL).increment(1);
                info!(
                    resource = %p.allocation.resource_id,
                    requester = %p.allocation.requester_id,
                    "promoted from waitlist after cancellation of {allocation_id}"
                );
            }
            Ok(_) => {}
            Err(e) => debug!("cancellation of {allocation_id} rejected: {e}"),
        }
        result
    }

    async fn cancel_inner(&self, allocation_id: AllocationId) -> Result<CancelOutcome, EngineError> {
        let guard = self.lock_allocation(&allocation_id).await?;
        let mut released = guard.ledger.check_release(&allocation_id)?.clone();
        let resource_id = guard.id;
        let at = now_ms();
        let promoted = plan_promotions(&guard, 1, None, 1, at)?.pop();

        let mut events = vec![Event::AllocationReleased {
            id: allocation_id,
            resource_id,
            at,
        }];
        events.extend(promoted.as_ref().map(Promotion::event));
        let mut touched = vec![released.requester_id];
        touched.extend(promoted.as_ref().map(|p| p.allocation.requester_id));
        self.persist_and_apply(guard, events, Stale::resource(resource_id, touched))
            .await?;

        released.state = AllocationState::Released;
        released.released_at = Some(at);
        Ok(CancelOutcome { released, promoted })
    }

    // ── Promotion ────────────────────────────────────────────

    /// One promotion cycle: if a slot is free and someone is waiting, the
    /// requester at position 1 gets it. `None` when there was nothing to do.
    pub async fn promote(&self, resource_id: ResourceId) -> Result<Option<Promotion>, EngineError> {
        let guard = self.lock_resource(&resource_id).await?;
        let Some(promotion) = plan_promotions(&guard, 0, None, 1, now_ms())?.pop() else {
            return Ok(None);
        };
        let stale = Stale::resource(resource_id, [promotion.allocation.requester_id]);
        self.persist_and_apply(guard, vec![promotion.event()], stale)
            .await?;
        metrics::counter!(observability::PROMOTIONS_TOTAL).increment(1);
        info!(resource = %resource_id, requester = %promotion.allocation.requester_id, "promoted from waitlist");
        Ok(Some(promotion))
    }

    /// Promote until no slot is free or nobody is waiting.
    pub async fn drain_promotions(&self, resource_id: ResourceId) -> Result<Vec<Promotion>, EngineError> {
        let guard = self.lock_resource(&resource_id).await?;
        self.drain_locked(guard).await
    }

    /// Drain under an already-held write lock, one transaction per promotion.
    /// If a commit fails the promotions before it stand; the error is still
    /// returned.
    async fn drain_locked(&self, mut guard: ResourceGuard) -> Result<Vec<Promotion>, EngineError> {
        let resource_id = guard.id;
        let mut done: Vec<Promotion> = Vec::new();
        let mut failure = None;
        loop {
            let next = match plan_promotions(&guard, 0, None, 1, now_ms()) {
                Ok(mut planned) => planned.pop(),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            let Some(promotion) = next else { break };
            let stale = Stale::resource(resource_id, [promotion.allocation.requester_id]);
            match self.persist_and_apply(guard, vec![promotion.event()], stale).await {
                Ok(next_guard) => guard = next_guard,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
            done.push(promotion);
        }

        if !done.is_empty() {
            metrics::counter!(observability::PROMOTIONS_TOTAL).increment(done.len() as u64);
            info!(resource = %resource_id, "drained {} promotions", done.len());
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(done),
        }
    }

    // ── Waitlist ─────────────────────────────────────────────

    /// Queue for a full resource. The position is the current maximum plus one.
    pub async fn join(
        &self,
        resource_id: ResourceId,
        requester_id: RequesterId,
    ) -> Result<WaitlistEntry, EngineError> {
        let result = self.join_inner(resource_id, requester_id).await;
        metrics::counter!(observability::WAITLIST_OPS_TOTAL, "op" => "join", "outcome" => outcome(&result))
            .increment(1);
        if let Err(e) = &result {
            debug!(resource = %resource_id, requester = %requester_id, "waitlist join rejected: {e}");
        }
        result
    }

    async fn join_inner(
        &self,
        resource_id: ResourceId,
        requester_id: RequesterId,
    ) -> Result<WaitlistEntry, EngineError> {
        let guard = self.lock_resource(&resource_id).await?;
        self.require_requester(&requester_id)?;
        let position = guard.queue.admit(
            &requester_id,
            guard.ledger.held_by(&requester_id),
            guard.ledger.available(),
        )?;

        let entry = WaitlistEntry {
            id: Ulid::new(),
            resource_id,
            requester_id,
            position,
            joined_at: now_ms(),
        };
        let event = Event::WaitlistJoined {
            id: entry.id,
            resource_id,
            requester_id,
            position,
            at: entry.joined_at,
        };
        let stale = Stale::resource(resource_id, [requester_id]);
        self.persist_and_apply(guard, vec![event], stale).await?;
        Ok(entry)
    }

    /// Withdraw from the waitlist. Everyone behind moves up one position.
    pub async fn leave(&self, resource_id: ResourceId, requester_id: RequesterId) -> Result<(), EngineError> {
        let result = self.leave_inner(resource_id, requester_id).await;
        metrics::counter!(observability::WAITLIST_OPS_TOTAL, "op" => "leave", "outcome" => outcome(&result))
            .increment(1);
        result
    }

    async fn leave_inner(&self, resource_id: ResourceId, requester_id: RequesterId) -> Result<(), EngineError> {
        let guard = self.lock_resource(&resource_id).await?;
        if guard.queue.get(&requester_id).is_none() {
            return Err(EngineError::NotFound(Missing::WaitlistEntry {
                resource_id,
                requester_id,
            }));
        }
        let event = Event::WaitlistLeft {
            resource_id,
            requester_id,
        };
        let stale = Stale::resource(resource_id, [requester_id]);
        self.persist_and_apply(guard, vec![event], stale).await?;
        Ok(())
    }

    // ── Resource lifecycle ───────────────────────────────────

    pub async fn create_resource(
        &self,
        id: ResourceId,
        name: String,
        venue: String,
        starts_at: Ms,
        capacity: u32,
    ) -> Result<ResourceSummary, EngineError> {
        validate_text(&name, MAX_NAME_LEN, "resource name length")?;
        validate_text(&venue, MAX_NAME_LEN, "venue length")?;
        validate_capacity(capacity)?;

        let catalog = self.catalog.clone().lock_owned().await;
        if self.store.contains_resource(&id) {
            return Err(EngineError::Conflict(ConflictKind::ResourceExists(id)));
        }
        if self.store.resource_count() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }

        let event = Event::ResourceCreated {
            id,
            name: name.clone(),
            venue: venue.clone(),
            starts_at,
            capacity,
        };
        let rs = ResourceState::new(id, name, venue, starts_at, capacity);
        let summary = rs.summary();
        let store = self.store.clone();
        self.commit_detached(vec![event], Stale::resource(id, []), move |_| {
            store.insert_resource(id, Arc::new(RwLock::new(rs)));
            catalog
        })
        .await?;
        info!(resource = %id, capacity, "resource created");
        Ok(summary)
    }

    /// Change descriptive fields. Capacity is only changed by `resize_resource`.
    pub async fn update_resource(
        &self,
        id: ResourceId,
        name: Option<String>,
        venue: Option<String>,
        starts_at: Option<Ms>,
    ) -> Result<ResourceSummary, EngineError> {
        if let Some(n) = &name {
            validate_text(n, MAX_NAME_LEN, "resource name length")?;
        }
        if let Some(v) = &venue {
            validate_text(v, MAX_NAME_LEN, "venue length")?;
        }
        let guard = self.lock_resource(&id).await?;
        let event = Event::ResourceUpdated {
            id,
            name: name.unwrap_or_else(|| guard.name.clone()),
            venue: venue.unwrap_or_else(|| guard.venue.clone()),
            starts_at: starts_at.unwrap_or(guard.starts_at),
        };

        // Names and venues appear in every holder's history rows.
        let mut touched: Vec<RequesterId> = guard
            .ledger
            .allocations()
            .iter()
            .map(|a| a.requester_id)
            .collect();
        touched.sort();
        touched.dedup();
        let guard = self
            .persist_and_apply(guard, vec![event], Stale::resource(id, touched))
            .await?;
        Ok(guard.summary())
    }

    /// Administrative capacity change. Growing the resource promotes waiting
    /// requesters into the new slots; shrinking below occupancy is refused.
    pub async fn resize_resource(&self, id: ResourceId, capacity: u32) -> Result<Vec<Promotion>, EngineError> {
        validate_capacity(capacity)?;
        let guard = self.lock_resource(&id).await?;
        let occupancy = guard.ledger.occupancy();
        if capacity < occupancy {
            return Err(EngineError::Conflict(ConflictKind::CapacityBelowOccupancy {
                capacity,
                occupancy,
            }));
        }
        let events = vec![Event::ResourceResized { id, capacity }];
        let guard = self
            .persist_and_apply(guard, events, Stale::resource(id, []))
            .await?;
        info!(resource = %id, capacity, "resource resized");
        self.drain_locked(guard).await
    }

    /// Remove a resource together with its allocation history and waitlist.
    pub async fn delete_resource(&self, id: ResourceId) -> Result<(), EngineError> {
        let catalog = self.catalog.clone().lock_owned().await;
        let rs = self
            .store
            .get_resource(&id)
            .ok_or(EngineError::NotFound(Missing::Resource(id)))?;
        // No consistency pre-check: a corrupt resource must still be removable.
        let mut guard = rs.write_owned().await;

        let mut touched: Vec<RequesterId> = guard
            .ledger
            .allocations()
            .iter()
            .map(|a| a.requester_id)
            .chain(guard.queue.entries().map(|e| e.requester_id))
            .collect();
        touched.sort();
        touched.dedup();

        let store = self.store.clone();
        let stale = Stale::resource(id, touched);
        self.commit_detached(vec![Event::ResourceDeleted { id }], stale, move |_| {
            guard.deleted = true;
            store.remove_resource(&guard);
            (guard, catalog)
        })
        .await?;
        info!(resource = %id, "resource deleted");
        Ok(())
    }

    // ── Requester registry ───────────────────────────────────

    pub async fn register_requester(
        &self,
        id: RequesterId,
        name: String,
        email: String,
    ) -> Result<Requester, EngineError> {
        validate_text(&name, MAX_NAME_LEN, "requester name length")?;
        validate_email(&email)?;

        let catalog = self.catalog.clone().lock_owned().await;
        if self.store.contains_requester(&id) {
            return Err(EngineError::Conflict(ConflictKind::RequesterExists(id)));
        }
        if self.store.email_owner(&email).is_some() {
            return Err(EngineError::Conflict(ConflictKind::EmailTaken(email)));
        }
        if self.store.requester_count() >= MAX_REQUESTERS {
            return Err(EngineError::LimitExceeded("too many requesters"));
        }

        let requester = Requester { id, name, email };
        let event = Event::RequesterRegistered {
            id,
            name: requester.name.clone(),
            email: requester.email.clone(),
        };
        let store = self.store.clone();
        let registered = requester.clone();
        let stale = Stale {
            resources: Vec::new(),
            requesters: vec![id],
        };
        self.commit_detached(vec![event], stale, move |_| {
            store.insert_requester(registered);
            catalog
        })
        .await?;
        Ok(requester)
    }

    /// Unregister a requester. Every slot they hold is released and every
    /// waitlist entry withdrawn; freed slots go to the next in line. The whole
    /// cascade is one transaction.
    pub async fn remove_requester(&self, id: RequesterId) -> Result<Vec<Promotion>, EngineError> {
        let catalog = self.catalog.clone().lock_owned().await;
        self.require_requester(&id)?;

        // Every resource, in id order. A concurrent book or join for this
        // requester either finished before we got its lock or will see the
        // requester gone.
        let mut guards = Vec::new();
        for resource_id in self.store.resource_ids() {
            let Some(rs) = self.store.get_resource(&resource_id) else {
                continue;
            };
            let guard = rs.write_owned().await;
            ensure_consistent(&guard)?;
            guards.push(guard);
        }

        let at = now_ms();
        let mut cascade: Vec<(usize, Vec<Event>)> = Vec::new();
        let mut promotions = Vec::new();
        for (idx, rs) in guards.iter().enumerate() {
            let held = rs.ledger.held_by(&id);
            let queued = rs.queue.get(&id).is_some();
            if held.is_none() && !queued {
                continue;
            }
            let mut events = Vec::new();
            if let Some(allocation_id) = held {
                events.push(Event::AllocationReleased {
                    id: allocation_id,
                    resource_id: rs.id,
                    at,
                });
            }
            if queued {
                events.push(Event::WaitlistLeft {
                    resource_id: rs.id,
                    requester_id: id,
                });
            }
            let planned = plan_promotions(rs, u32::from(held.is_some()), queued.then_some(&id), usize::MAX, at)?;
            events.extend(planned.iter().map(Promotion::event));
            promotions.extend(planned);
            cascade.push((idx, events));
        }

        let mut transaction: Vec<Event> = cascade.iter().flat_map(|(_, events)| events.clone()).collect();
        transaction.push(Event::RequesterRemoved { id });

        let mut stale = Stale {
            resources: cascade.iter().map(|(idx, _)| guards[*idx].id).collect(),
            requesters: vec![id],
        };
        stale
            .requesters
            .extend(promotions.iter().map(|p| p.allocation.requester_id));
        let affected = cascade.len();
        let store = self.store.clone();
        self.commit_detached(transaction, stale, move |_| {
            for (idx, events) in &cascade {
                let rs = &mut guards[*idx];
                for event in events {
                    store.apply_event(rs, event);
                }
            }
            store.remove_requester(&id);
            (guards, catalog)
        })
        .await?;

        if !promotions.is_empty() {
            metrics::counter!(observability::PROMOTIONS_TOTAL).increment(promotions.len() as u64);
        }
        info!(
            requester = %id,
            resources = affected,
            promotions = promotions.len(),
            "requester removed"
        );
        Ok(promotions)
    }

    // ── Compaction ───────────────────────────────────────────

    /// Rewrite the journal as the minimal event set that recreates current
    /// state: requesters, resources, full allocation history, and waitlists in
    /// position order. All resource read locks are held until the journal has
    /// swapped files, so no commit can fall between snapshot and swap.
    pub async fn compact(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;
        let mut events: Vec<Event> = self
            .store
            .requesters()
            .into_iter()
            .map(|r| Event::RequesterRegistered {
                id: r.id,
                name: r.name,
                email: r.email,
            })
            .collect();

        let mut guards = Vec::new();
        for resource_id in self.store.resource_ids() {
            let Some(rs) = self.store.get_resource(&resource_id) else {
                continue;
            };
            let guard = rs.read_owned().await;
            snapshot_resource(&guard, &mut events);
            guards.push(guard);
        }

        let count = events.len();
        let result = self.journal.compact(events).await;
        drop(guards);
        match result {
            Ok(()) => {
                metrics::counter!(observability::COMPACTIONS_TOTAL).increment(1);
                info!("journal compacted to {count} events");
                Ok(())
            }
            Err(e) => {
                warn!("journal compaction failed: {e}");
                Err(EngineError::Storage(e.to_string()))
            }
        }
    }

    pub async fn commits_since_compact(&self) -> u64 {
        self.journal.commits_since_compact().await
    }
}

fn snapshot_resource(rs: &ResourceState, events: &mut Vec<Event>) {
    events.push(Event::ResourceCreated {
        id: rs.id,
        name: rs.name.clone(),
        venue: rs.venue.clone(),
        starts_at: rs.starts_at,
        capacity: rs.ledger.capacity(),
    });
    // Creation order keeps a requester's released rows ahead of their
    // current hold, so the held index rebuilds correctly.
    for allocation in rs.ledger.allocations() {
        events.push(Event::AllocationGranted {
            id: allocation.id,
            resource_id: rs.id,
            requester_id: allocation.requester_id,
            at: allocation.created_at,
        });
        if let Some(at) = allocation.released_at {
            events.push(Event::AllocationReleased {
                id: allocation.id,
                resource_id: rs.id,
                at,
            });
        }
    }
    for entry in rs.queue.entries() {
        events.push(Event::WaitlistJoined {
            id: entry.id,
            resource_id: rs.id,
            requester_id: entry.requester_id,
            position: entry.position,
            at: entry.joined_at,
        });
    }
}
