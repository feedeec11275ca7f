use ulid::Ulid;

use crate::model::*;
use crate::policy::{Policy, RequestContext, ReservationPolicy};

use super::{Engine, EngineError};

/// Credentials go only to callers who could modify the reservation anyway.
fn visible(ctx: &RequestContext<'_>, r: &Reservation) -> ReservationInfo {
    if ReservationPolicy::can_modify(ctx, Some(r)) {
        ReservationInfo::with_credential(r)
    } else {
        ReservationInfo::redacted(r)
    }
}

impl Engine {
    /// All resources, oldest first.
    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let shared: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(shared.len());
        for rs in shared {
            out.push(ResourceInfo::from(&*rs.read().await));
        }
        out.sort_by_key(|r| r.id);
        out
    }

    pub async fn get_resource_info(&self, id: Ulid) -> Result<ResourceInfo, EngineError> {
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        Ok(ResourceInfo::from(&*guard))
    }

    /// Reservations on a resource in `(start, end, name)` order.
    ///
    /// `since` keeps reservations ending at or after it, `until` keeps those
    /// starting at or before it.
    pub async fn list_reservations(
        &self,
        ctx: &RequestContext<'_>,
        resource_id: Ulid,
        since: Option<Ms>,
        until: Option<Ms>,
    ) -> Result<Vec<ReservationInfo>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(guard
            .reservations
            .iter()
            .filter(|r| since.is_none_or(|s| r.span.end >= s))
            .filter(|r| until.is_none_or(|u| r.span.start <= u))
            .map(|r| visible(ctx, r))
            .collect())
    }

    pub async fn get_reservation(
        &self,
        ctx: &RequestContext<'_>,
        id: Ulid,
    ) -> Result<ReservationInfo, EngineError> {
        let resource_id = self
            .get_resource_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        guard
            .get_reservation(&id)
            .map(|r| visible(ctx, r))
            .ok_or(EngineError::NotFound(id))
    }
}
