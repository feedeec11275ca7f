use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tracing::info;
use ulid::Ulid;
use uuid::Uuid;

use crate::limits::*;
use crate::model::*;
use crate::policy::{Policy, RequestContext, ReservationPolicy, ResourcePolicy};

use super::collision::check_no_collision;
use super::validate::{now_ms, validate_reservation_fields, validate_resource_fields, validate_timespan};
use super::{denied, Engine, EngineError, WalCommand};

/// Fresh per-reservation secret; never regenerated afterwards.
fn new_credential() -> String {
    Uuid::new_v4().to_string()
}

impl Engine {
    /// The caller becomes the owner; anonymous callers are refused.
    pub async fn create_resource(
        &self,
        ctx: &RequestContext<'_>,
        name: String,
        remarks: String,
    ) -> Result<ResourceInfo, EngineError> {
        if !ResourcePolicy::can_create(ctx) {
            return Err(EngineError::Forbidden);
        }
        let owner = ctx.actor.account().ok_or(EngineError::Forbidden)?.to_string();
        validate_resource_fields(&name, &remarks)?;
        let _gate = self.write_gate.read().await;
        if self.state.len() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }

        let id = Ulid::new();
        let at = now_ms();
        let event = Event::ResourceCreated {
            id,
            name: name.clone(),
            remarks: remarks.clone(),
            owner: owner.clone(),
            at,
        };
        self.wal_append(&event).await?;
        let rs = ResourceState::new(id, name, remarks, owner, at);
        let info = ResourceInfo::from(&rs);
        self.state.insert(id, Arc::new(RwLock::new(rs)));
        info!("resource {id} created by {}", info.owner);
        Ok(info)
    }

    pub async fn update_resource(
        &self,
        ctx: &RequestContext<'_>,
        id: Ulid,
        patch: ResourcePatch,
    ) -> Result<ResourceInfo, EngineError> {
        if !ResourcePolicy::can_modify(ctx, None) {
            return Err(denied("update resource", id));
        }
        let _gate = self.write_gate.read().await;
        let mut guard = self.lock_resource(id).await?;
        if !ResourcePolicy::can_modify(ctx, Some(&*guard)) {
            return Err(denied("update resource", id));
        }

        let name = patch.name.unwrap_or_else(|| guard.name.clone());
        let remarks = patch.remarks.unwrap_or_else(|| guard.remarks.clone());
        validate_resource_fields(&name, &remarks)?;

        let event = Event::ResourceUpdated {
            id,
            name,
            remarks,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(ResourceInfo::from(&*guard))
    }

    /// Deletes the resource together with every reservation on it.
    pub async fn delete_resource(&self, ctx: &RequestContext<'_>, id: Ulid) -> Result<(), EngineError> {
        if !ResourcePolicy::can_modify(ctx, None) {
            return Err(denied("delete resource", id));
        }
        let _gate = self.write_gate.read().await;
        let guard = self.lock_resource(id).await?;
        if !ResourcePolicy::can_modify(ctx, Some(&*guard)) {
            return Err(denied("delete resource", id));
        }

        let event = Event::ResourceDeleted { id };
        self.wal_append(&event).await?;
        for r in &guard.reservations {
            self.reservation_to_resource.remove(&r.id);
        }
        let cascaded = guard.reservations.len();
        self.state.remove(&id);
        drop(guard);
        info!("resource {id} deleted ({cascaded} reservations cascaded)");
        Ok(())
    }

    /// Validates, checks collisions and persists under the resource write
    /// lock, so two overlapping bookings can never both commit.
    pub async fn create_reservation(
        &self,
        ctx: &RequestContext<'_>,
        resource_id: Ulid,
        fields: ReservationFields,
    ) -> Result<ReservationInfo, EngineError> {
        if !ReservationPolicy::can_create(ctx) {
            return Err(denied("create reservation", resource_id));
        }
        let _gate = self.write_gate.read().await;
        let mut guard = self.lock_resource(resource_id).await?;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many reservations on resource"));
        }

        let ReservationFields {
            name,
            contact,
            remarks,
            span,
        } = fields;
        validate_reservation_fields(&name, &contact, &remarks)?;
        validate_timespan(&span, self.max_span)?;
        check_no_collision(&guard, &span, None, self.prune_window)?;

        let id = Ulid::new();
        let event = Event::ReservationCreated {
            id,
            resource_id,
            name,
            contact,
            remarks,
            span,
            owner: ctx.actor.account().map(String::from),
            credential: new_credential(),
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("reservation {id} booked on {resource_id}: {}", span.display());

        let stored = guard
            .get_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        Ok(ReservationInfo::with_credential(stored))
    }

    /// Re-runs every invariant against the merged fields, ignoring the
    /// reservation's own current interval.
    pub async fn update_reservation(
        &self,
        ctx: &RequestContext<'_>,
        id: Ulid,
        patch: ReservationPatch,
    ) -> Result<ReservationInfo, EngineError> {
        if !ReservationPolicy::can_modify(ctx, None) {
            return Err(denied("update reservation", id));
        }
        let _gate = self.write_gate.read().await;
        let mut guard = self.resolve_reservation_write(&id).await?;
        let current = guard
            .get_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        if !ReservationPolicy::can_modify(ctx, Some(current)) {
            return Err(denied("update reservation", id));
        }

        let resource_id = current.resource_id;
        let name = patch.name.unwrap_or_else(|| current.name.clone());
        let contact = patch.contact.unwrap_or_else(|| current.contact.clone());
        let remarks = patch.remarks.unwrap_or_else(|| current.remarks.clone());
        let span = Span::new(
            patch.start.unwrap_or(current.span.start),
            patch.end.unwrap_or(current.span.end),
        );
        validate_reservation_fields(&name, &contact, &remarks)?;
        validate_timespan(&span, self.max_span)?;
        check_no_collision(&guard, &span, Some(id), self.prune_window)?;

        let event = Event::ReservationUpdated {
            id,
            resource_id,
            name,
            contact,
            remarks,
            span,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("reservation {id} updated: {}", span.display());

        let stored = guard
            .get_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        Ok(ReservationInfo::with_credential(stored))
    }

    /// Hard delete. Returns the resource the reservation belonged to.
    pub async fn delete_reservation(&self, ctx: &RequestContext<'_>, id: Ulid) -> Result<Ulid, EngineError> {
        if !ReservationPolicy::can_modify(ctx, None) {
            return Err(denied("delete reservation", id));
        }
        let _gate = self.write_gate.read().await;
        let mut guard = self.resolve_reservation_write(&id).await?;
        let current = guard
            .get_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        if !ReservationPolicy::can_modify(ctx, Some(current)) {
            return Err(denied("delete reservation", id));
        }

        let resource_id = current.resource_id;
        let event = Event::ReservationDeleted { id, resource_id };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("reservation {id} deleted from {resource_id}");
        Ok(resource_id)
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.write_gate.write().await;
        let mut events = Vec::new();
        let shared: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();

        for rs in shared {
            let guard = rs.read().await;
            events.push(Event::ResourceCreated {
                id: guard.id,
                name: guard.name.clone(),
                remarks: guard.remarks.clone(),
                owner: guard.owner.clone(),
                at: guard.created_at,
            });
            if guard.updated_at != guard.created_at {
                events.push(Event::ResourceUpdated {
                    id: guard.id,
                    name: guard.name.clone(),
                    remarks: guard.remarks.clone(),
                    at: guard.updated_at,
                });
            }
            for r in &guard.reservations {
                events.push(Event::ReservationCreated {
                    id: r.id,
                    resource_id: guard.id,
                    name: r.name.clone(),
                    contact: r.contact.clone(),
                    remarks: r.remarks.clone(),
                    span: r.span,
                    owner: r.owner.clone(),
                    credential: r.credential.clone(),
                    at: r.created_at,
                });
                if r.updated_at != r.created_at {
                    events.push(Event::ReservationUpdated {
                        id: r.id,
                        resource_id: guard.id,
                        name: r.name.clone(),
                        contact: r.contact.clone(),
                        remarks: r.remarks.clone(),
                        span: r.span,
                        at: r.updated_at,
                    });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
