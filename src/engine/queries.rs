use ulid::Ulid;

use crate::model::*;

use super::availability::free_windows;
use super::conflict::{find_conflict, validate_window};
use super::{Engine, EngineError};

impl Engine {
    /// Can `resource_id` be reserved for `[start, end)`?
    ///
    /// Pure read under the resource's shared lock: nothing is reserved, and the
    /// answer may be stale by the time a reservation is attempted.
    /// `create_reservation` re-checks under the exclusive lock.
    pub async fn check_availability(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<AvailabilityOutcome, EngineError> {
        let span = validate_window(start, end)?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;

        let outcome = match find_conflict(&guard, &span) {
            Some(id) => AvailabilityOutcome::blocked_by(id),
            None => AvailabilityOutcome::free(),
        };
        metrics::counter!(
            crate::observability::AVAILABILITY_CHECKS_TOTAL,
            "available" => if outcome.available { "true" } else { "false" }
        )
        .increment(1);
        Ok(outcome)
    }

    /// Free stretches of the window, optionally only those at least
    /// `min_duration_ms` long.
    pub async fn free_windows(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration_ms: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        let window = validate_window(start, end)?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;

        let mut free = free_windows(&guard, &window);
        if let Some(min_dur) = min_duration_ms {
            free.retain(|span| span.duration_ms() >= min_dur);
        }
        Ok(free)
    }

    /// Every resource (optionally of one category) that is free for the whole
    /// of `[start, end)`, ordered by id.
    pub async fn available_resources(
        &self,
        start: Ms,
        end: Ms,
        category: Option<&str>,
    ) -> Result<Vec<ResourceInfo>, EngineError> {
        let span = validate_window(start, end)?;
        let mut found = Vec::new();
        for rs in self.resource_handles() {
            let guard = rs.read().await;
            if let Some(wanted) = category
                && !guard
                    .category
                    .as_deref()
                    .is_some_and(|c| c.eq_ignore_ascii_case(wanted))
            {
                continue;
            }
            if find_conflict(&guard, &span).is_none() {
                found.push(guard.info());
            }
        }
        found.sort_by_key(|r| r.id);
        Ok(found)
    }

    /// Snapshot of how much of the fleet is out at `now`.
    pub async fn fleet_status(&self, now: Ms) -> FleetStatus {
        let handles = self.resource_handles();
        let total = handles.len();
        let mut reserved = 0;
        for rs in handles {
            let guard = rs.read().await;
            let out = guard
                .reservations
                .iter()
                .any(|r| r.is_active() && r.span.contains_instant(now));
            if out {
                reserved += 1;
            }
        }
        let status = FleetStatus {
            total,
            reserved,
            available: total - reserved,
        };
        metrics::gauge!(crate::observability::FLEET_RESOURCES).set(status.total as f64);
        metrics::gauge!(crate::observability::FLEET_RESERVED).set(status.reserved as f64);
        status
    }

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let mut out = Vec::new();
        for rs in self.resource_handles() {
            out.push(rs.read().await.info());
        }
        out.sort_by_key(|r| r.id);
        out
    }

    pub async fn resource_info(&self, id: Ulid) -> Result<ResourceInfo, EngineError> {
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        Ok(guard.info())
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let resource_id = self
            .get_resource_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        guard.reservation(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Reservations, optionally narrowed to one resource and/or one status,
    /// ordered by start time within each resource.
    pub async fn list_reservations(
        &self,
        resource_id: Option<Ulid>,
        status: Option<ReservationStatus>,
    ) -> Result<Vec<Reservation>, EngineError> {
        let handles = match resource_id {
            Some(id) => vec![self.get_resource(&id).ok_or(EngineError::NotFound(id))?],
            None => self.resource_handles(),
        };
        let mut out = Vec::new();
        for rs in handles {
            let guard = rs.read().await;
            out.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| status.is_none_or(|s| r.status == s))
                    .cloned(),
            );
        }
        if resource_id.is_none() {
            out.sort_by_key(|r| (r.span.start, r.id));
        }
        Ok(out)
    }
}
