use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type inside the engine.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;

/// Login name of an account, as resolved by the wire layer.
pub type AccountId = String;

/// Half-open interval `[start, end)`.
///
/// A `Span` built from user input may be empty or inverted; the engine runs
/// it through `validate_timespan` before it is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    /// Saturates instead of overflowing for spans wider than `i64`.
    pub fn duration_ms(&self) -> Ms {
        self.end.saturating_sub(self.start)
    }

    /// Intervals that only touch at an endpoint do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        !(self.end <= other.start || other.end <= self.start)
    }

    /// `2014-02-04 10:10 to 12:10` on a single day, full timestamps otherwise.
    pub fn display(&self) -> String {
        match (to_datetime(self.start), to_datetime(self.end)) {
            (Some(s), Some(e)) if s.date_naive() == e.date_naive() => {
                format!("{} to {}", s.format("%Y-%m-%d %H:%M"), e.format("%H:%M"))
            }
            (Some(s), Some(e)) => {
                format!("{} to {}", s.format("%Y-%m-%d %H:%M"), e.format("%Y-%m-%d %H:%M"))
            }
            _ => format!("[{}, {})", self.start, self.end),
        }
    }
}

fn to_datetime(ms: Ms) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}

/// Parse an RFC 3339 timestamp (any offset) into Unix milliseconds.
pub fn parse_timestamp(s: &str) -> Option<Ms> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// Render Unix milliseconds as RFC 3339 in UTC.
pub fn format_timestamp(ms: Ms) -> String {
    match to_datetime(ms) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        None => ms.to_string(),
    }
}

/// Who is making a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    Authenticated(AccountId),
    Anonymous,
}

impl Actor {
    pub fn account(&self) -> Option<&str> {
        match self {
            Actor::Authenticated(id) => Some(id),
            Actor::Anonymous => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Actor::Authenticated(_))
    }
}

/// A booked time interval on a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub name: String,
    pub contact: String,
    pub remarks: String,
    pub span: Span,
    /// `None` for anonymous bookings; those are gated by `credential` instead.
    pub owner: Option<AccountId>,
    pub credential: String,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Reservation {
    fn sort_key(&self) -> (Ms, Ms, &str) {
        (self.span.start, self.span.end, self.name.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: String,
    pub remarks: String,
    pub owner: AccountId,
    pub created_at: Ms,
    pub updated_at: Ms,
    /// Sorted by `(span.start, span.end, name)`.
    pub reservations: Vec<Reservation>,
}

impl ResourceState {
    pub fn new(id: Ulid, name: String, remarks: String, owner: AccountId, at: Ms) -> Self {
        Self {
            id,
            name,
            remarks,
            owner,
            created_at: at,
            updated_at: at,
            reservations: Vec::new(),
        }
    }

    /// Insert reservation maintaining sort order.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.sort_key() < reservation.sort_key());
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn get_reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    /// Longest stored reservation, used to widen the collision pruning window
    /// when data predates a smaller configured max span.
    pub fn widest_span(&self) -> Ms {
        self.reservations
            .iter()
            .map(|r| r.span.duration_ms())
            .max()
            .unwrap_or(0)
    }
}

/// Fields supplied when booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationFields {
    pub name: String,
    pub contact: String,
    pub remarks: String,
    pub span: Span,
}

/// Partial update of a reservation; `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationPatch {
    pub name: Option<String>,
    pub contact: Option<String>,
    pub remarks: Option<String>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
}

impl ReservationPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.contact.is_none()
            && self.remarks.is_none()
            && self.start.is_none()
            && self.end.is_none()
    }
}

/// Partial update of a resource; the owner is never updatable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourcePatch {
    pub name: Option<String>,
    pub remarks: Option<String>,
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        name: String,
        remarks: String,
        owner: AccountId,
        at: Ms,
    },
    ResourceUpdated {
        id: Ulid,
        name: String,
        remarks: String,
        at: Ms,
    },
    /// Cascades to every reservation on the resource.
    ResourceDeleted {
        id: Ulid,
    },
    ReservationCreated {
        id: Ulid,
        resource_id: Ulid,
        name: String,
        contact: String,
        remarks: String,
        span: Span,
        owner: Option<AccountId>,
        credential: String,
        at: Ms,
    },
    ReservationUpdated {
        id: Ulid,
        resource_id: Ulid,
        name: String,
        contact: String,
        remarks: String,
        span: Span,
        at: Ms,
    },
    ReservationDeleted {
        id: Ulid,
        resource_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: String,
    pub remarks: String,
    pub owner: AccountId,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl From<&ResourceState> for ResourceInfo {
    fn from(rs: &ResourceState) -> Self {
        Self {
            id: rs.id,
            name: rs.name.clone(),
            remarks: rs.remarks.clone(),
            owner: rs.owner.clone(),
            created_at: rs.created_at,
            updated_at: rs.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationInfo {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub name: String,
    pub contact: String,
    pub remarks: String,
    pub start: Ms,
    pub end: Ms,
    /// Only populated for callers allowed to modify the reservation.
    pub credential: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl ReservationInfo {
    pub fn redacted(r: &Reservation) -> Self {
        Self {
            id: r.id,
            resource_id: r.resource_id,
            name: r.name.clone(),
            contact: r.contact.clone(),
            remarks: r.remarks.clone(),
            start: r.span.start,
            end: r.span.end,
            credential: None,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }

    pub fn with_credential(r: &Reservation) -> Self {
        Self {
            credential: Some(r.credential.clone()),
            ..Self::redacted(r)
        }
    }
}
