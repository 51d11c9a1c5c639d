use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Widen by a turnaround buffer on both sides.
    pub fn padded(&self, buffer: Ms) -> Span {
        Span::new(self.start - buffer, self.end + buffer)
    }
}

/// Lifecycle of a reservation.
///
/// `Pending` and `Confirmed` occupy the resource; `Cancelled` and `Completed`
/// are terminal and kept as history only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl ReservationStatus {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }

    pub fn can_transition_to(self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Cancelled) | (Confirmed, Completed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub span: Span,
    pub status: ReservationStatus,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub created_at: Ms,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: Option<String>,
    pub category: Option<String>,
    /// Turnaround time in ms after each reservation ends (cleaning, inspection).
    pub buffer_after: Option<Ms>,
    /// All reservations including history, sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl ResourceState {
    pub fn new(id: Ulid, name: Option<String>, category: Option<String>, buffer_after: Option<Ms>) -> Self {
        Self {
            id,
            name,
            category,
            buffer_after,
            reservations: Vec::new(),
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    pub fn active_count(&self) -> usize {
        self.reservations.iter().filter(|r| r.is_active()).count()
    }

    /// Return only reservations whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id,
            name: self.name.clone(),
            category: self.category.clone(),
            buffer_after: self.buffer_after,
        }
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        name: Option<String>,
        category: Option<String>,
        buffer_after: Option<Ms>,
    },
    ResourceUpdated {
        id: Ulid,
        name: Option<String>,
        category: Option<String>,
        buffer_after: Option<Ms>,
    },
    ResourceDeleted {
        id: Ulid,
    },
    ReservationCreated {
        id: Ulid,
        resource_id: Ulid,
        span: Span,
        customer_name: Option<String>,
        customer_email: Option<String>,
        created_at: Ms,
    },
    ReservationStatusChanged {
        id: Ulid,
        resource_id: Ulid,
        status: ReservationStatus,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub category: Option<String>,
    pub buffer_after: Option<Ms>,
}

/// Answer to "can this resource be booked for this window?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityOutcome {
    pub available: bool,
    pub conflicting_reservation_id: Option<Ulid>,
}

impl AvailabilityOutcome {
    pub fn free() -> Self {
        Self {
            available: true,
            conflicting_reservation_id: None,
        }
    }

    pub fn blocked_by(id: Ulid) -> Self {
        Self {
            available: false,
            conflicting_reservation_id: Some(id),
        }
    }

    pub fn message(&self) -> &'static str {
        if self.available {
            "available for the selected dates"
        } else {
            "already reserved for the selected dates"
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FleetStatus {
    pub total: usize,
    pub reserved: usize,
    pub available: usize,
}
