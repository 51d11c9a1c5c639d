use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::clock::{format_instant, now_ms};
use crate::limits::*;
use crate::model::*;

use super::conflict::{find_conflict, validate_buffer, validate_span, validate_text};
use super::{Engine, EngineError, WalCommand};

/// Incoming booking request.
#[derive(Debug, Clone)]
pub struct NewReservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
}

/// Column changes for [`Engine::update_resource`]. `None` leaves a column
/// as it is, `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourcePatch {
    pub name: Option<Option<String>>,
    pub category: Option<Option<String>>,
    pub buffer_after: Option<Option<Ms>>,
}

impl Engine {
    pub async fn create_resource(
        &self,
        id: Ulid,
        name: Option<String>,
        category: Option<String>,
        buffer_after: Option<Ms>,
    ) -> Result<(), EngineError> {
        let _commit = self.commit_gate.read().await;
        if self.state.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        validate_text(&name, MAX_NAME_LEN, "resource name too long")?;
        validate_text(&category, MAX_CATEGORY_LEN, "category too long")?;
        validate_buffer(buffer_after)?;
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ResourceCreated {
            id,
            name: name.clone(),
            category: category.clone(),
            buffer_after,
        };
        self.wal_append(&event).await?;
        let rs = ResourceState::new(id, name, category, buffer_after);
        self.state.insert(id, Arc::new(RwLock::new(rs)));
        debug!(%id, "resource created");
        Ok(())
    }

    /// Rename, recategorise or change the turnaround of a resource.
    ///
    /// Columns the patch leaves out keep their current value, read under the
    /// same write lock that applies the change, so concurrent patches on
    /// different columns never undo each other. A new `buffer_after` applies
    /// to future conflict checks only.
    pub async fn update_resource(&self, id: Ulid, patch: ResourcePatch) -> Result<(), EngineError> {
        if let Some(name) = &patch.name {
            validate_text(name, MAX_NAME_LEN, "resource name too long")?;
        }
        if let Some(category) = &patch.category {
            validate_text(category, MAX_CATEGORY_LEN, "category too long")?;
        }
        if let Some(buffer_after) = patch.buffer_after {
            validate_buffer(buffer_after)?;
        }
        let _commit = self.commit_gate.read().await;
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        self.ensure_current(id, &rs)?;

        let event = Event::ResourceUpdated {
            id,
            name: patch.name.unwrap_or_else(|| guard.name.clone()),
            category: patch.category.unwrap_or_else(|| guard.category.clone()),
            buffer_after: patch.buffer_after.unwrap_or(guard.buffer_after),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!(%id, "resource updated");
        Ok(())
    }

    /// Remove a resource and its reservation history. Refused while any
    /// reservation on it is still pending or confirmed.
    pub async fn delete_resource(&self, id: Ulid) -> Result<(), EngineError> {
        let _commit = self.commit_gate.read().await;
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.write().await;
        self.ensure_current(id, &rs)?;
        if guard.active_count() > 0 {
            return Err(EngineError::HasActiveReservations(id));
        }

        let event = Event::ResourceDeleted { id };
        self.wal_append(&event).await?;
        for r in &guard.reservations {
            self.reservation_index.remove(&r.id);
        }
        self.state.remove(&id);
        debug!(%id, "resource deleted");
        Ok(())
    }

    /// Validate-and-insert a reservation in `pending` state.
    ///
    /// The overlap check and the WAL append happen under the resource's write
    /// lock, so concurrent requests for overlapping windows on the same
    /// resource are serialized: the first wins and the rest get
    /// [`EngineError::Conflict`].
    pub async fn create_reservation(&self, req: NewReservation) -> Result<Reservation, EngineError> {
        let span = validate_span(req.start, req.end)?;
        validate_text(&req.customer_name, MAX_CUSTOMER_FIELD_LEN, "customer name too long")?;
        validate_text(&req.customer_email, MAX_CUSTOMER_FIELD_LEN, "customer email too long")?;
        let _commit = self.commit_gate.read().await;
        let rs = self
            .get_resource(&req.resource_id)
            .ok_or(EngineError::NotFound(req.resource_id))?;
        let mut guard = rs.write().await;
        self.ensure_current(req.resource_id, &rs)?;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many reservations on resource"));
        }
        if self.reservation_index.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }

        if let Some(existing) = find_conflict(&guard, &span) {
            metrics::counter!(crate::observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
            debug!(resource = %req.resource_id, %existing, "reservation rejected: overlap");
            return Err(EngineError::Conflict(existing));
        }

        let event = Event::ReservationCreated {
            id: req.id,
            resource_id: req.resource_id,
            span,
            customer_name: req.customer_name,
            customer_email: req.customer_email,
            created_at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::RESERVATIONS_CREATED_TOTAL).increment(1);
        debug!(
            id = %req.id,
            resource = %req.resource_id,
            start = %format_instant(span.start),
            end = %format_instant(span.end),
            "reservation created"
        );

        guard
            .reservation(req.id)
            .cloned()
            .ok_or(EngineError::NotFound(req.id))
    }

    /// Move a reservation along its lifecycle.
    ///
    /// Setting the status it already has is a no-op (nothing is logged), so
    /// callers can retry safely. Anything else outside
    /// `pending → confirmed | cancelled` and `confirmed → cancelled | completed`
    /// fails with [`EngineError::InvalidTransition`].
    pub async fn set_reservation_status(
        &self,
        id: Ulid,
        status: ReservationStatus,
    ) -> Result<Reservation, EngineError> {
        let _commit = self.commit_gate.read().await;
        let (resource_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let current = guard.reservation(id).ok_or(EngineError::NotFound(id))?.status;

        if current == status {
            return guard.reservation(id).cloned().ok_or(EngineError::NotFound(id));
        }
        if !current.can_transition_to(status) {
            return Err(EngineError::InvalidTransition {
                id,
                from: current,
                to: status,
            });
        }

        let event = Event::ReservationStatusChanged {
            id,
            resource_id,
            status,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!(%id, from = %current, to = %status, "reservation status changed");
        guard.reservation(id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn confirm_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.set_reservation_status(id, ReservationStatus::Confirmed).await
    }

    pub async fn cancel_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.set_reservation_status(id, ReservationStatus::Cancelled).await
    }

    pub async fn complete_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.set_reservation_status(id, ReservationStatus::Completed).await
    }

    /// Confirmed reservations whose end is at or before `now`.
    pub fn collect_elapsed_reservations(&self, now: Ms) -> Vec<Ulid> {
        let mut elapsed = Vec::new();
        for entry in self.state.iter() {
            let rs = entry.value().clone();
            if let Ok(guard) = rs.try_read() {
                elapsed.extend(
                    guard
                        .reservations
                        .iter()
                        .filter(|r| r.status == ReservationStatus::Confirmed && r.span.end <= now)
                        .map(|r| r.id),
                );
            }
        }
        elapsed
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;
        let mut events = Vec::new();
        for rs in self.resource_handles() {
            let guard = rs.read().await;
            events.push(Event::ResourceCreated {
                id: guard.id,
                name: guard.name.clone(),
                category: guard.category.clone(),
                buffer_after: guard.buffer_after,
            });
            for r in &guard.reservations {
                events.push(Event::ReservationCreated {
                    id: r.id,
                    resource_id: guard.id,
                    span: r.span,
                    customer_name: r.customer_name.clone(),
                    customer_email: r.customer_email.clone(),
                    created_at: r.created_at,
                });
                if r.status != ReservationStatus::Pending {
                    events.push(Event::ReservationStatusChanged {
                        id: r.id,
                        resource_id: guard.id,
                        status: r.status,
                    });
                }
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        info!(events = count, "WAL compacted");
        Ok(())
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
