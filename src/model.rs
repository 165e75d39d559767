use chrono::{DateTime, NaiveDate};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only instant type.
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
}

// ── Actors ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Member,
    Staff,
    Admin,
    /// The sweeper. Never reachable from a login.
    System,
}

impl ActorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorRole::Member => "member",
            ActorRole::Staff => "staff",
            ActorRole::Admin => "admin",
            ActorRole::System => "system",
        }
    }

    pub fn is_staff(&self) -> bool {
        matches!(self, ActorRole::Staff | ActorRole::Admin)
    }
}

/// Who is asking for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Ulid,
    pub role: ActorRole,
}

impl Actor {
    pub fn new(user_id: Ulid, role: ActorRole) -> Self {
        Self { user_id, role }
    }

    pub fn system() -> Self {
        Self {
            user_id: Ulid::nil(),
            role: ActorRole::System,
        }
    }

    /// Parse a login of the form `role:ulid`, e.g. `staff:01ARZ3NDEKTSV4RRFFQ69G5FAV`.
    pub fn from_login(login: &str) -> Option<Self> {
        let (role, id) = login.split_once(':')?;
        let role = match role.trim().to_lowercase().as_str() {
            "member" | "user" | "student" => ActorRole::Member,
            "staff" => ActorRole::Staff,
            "admin" => ActorRole::Admin,
            _ => return None,
        };
        let user_id = Ulid::from_string(id.trim()).ok()?;
        Some(Self { user_id, role })
    }
}

// ── Rooms ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub floor: String,
    pub name: String,
    /// Bookable or not. Re-checked on approve and start.
    pub active: bool,
}

// ── Participants ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Student,
    Faculty,
    Staff,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id_number: String,
    pub name: String,
    pub course: Option<String>,
    pub year_level: Option<String>,
    pub department: Option<String>,
    pub role: ParticipantRole,
    pub is_main_reserver: bool,
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Approved,
    Rejected,
    Ongoing,
    Completed,
    Cancelled,
    Expired,
}

impl ReservationStatus {
    /// Pending, Approved and Ongoing reservations occupy their room.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            ReservationStatus::Pending | ReservationStatus::Approved | ReservationStatus::Ongoing
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_blocking()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Approved => "approved",
            ReservationStatus::Rejected => "rejected",
            ReservationStatus::Ongoing => "ongoing",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Some(ReservationStatus::Pending),
            "approved" => Some(ReservationStatus::Approved),
            "rejected" => Some(ReservationStatus::Rejected),
            "ongoing" => Some(ReservationStatus::Ongoing),
            "completed" => Some(ReservationStatus::Completed),
            "cancelled" | "canceled" => Some(ReservationStatus::Cancelled),
            "expired" => Some(ReservationStatus::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionStatus {
    None,
    Pending,
    Approved,
    Rejected,
}

impl ExtensionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtensionStatus::None => "none",
            ExtensionStatus::Pending => "pending",
            ExtensionStatus::Approved => "approved",
            ExtensionStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for ExtensionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub room_id: Ulid,
    /// Snapshotted from the room at creation.
    pub floor: String,
    /// Snapshotted from the room at creation.
    pub room_name: String,
    /// The main reserver.
    pub user_id: Ulid,
    /// `[start, original end)`.
    pub span: Span,
    pub extended_end: Option<Ms>,
    pub timezone: String,
    pub participants: Vec<Participant>,
    pub purpose: Option<String>,
    pub status: ReservationStatus,
    pub extension_requested: bool,
    pub extension_status: ExtensionStatus,
    pub extension_reason: Option<String>,
    pub max_extended_end: Option<Ms>,
    pub actual_start: Option<Ms>,
    pub actual_end: Option<Ms>,
    pub created_at: Ms,
    pub updated_at: Ms,
    /// Bumped on every committed change.
    pub version: u64,
    pub archived: bool,
}

impl Reservation {
    pub fn effective_end(&self) -> Ms {
        self.extended_end.unwrap_or(self.span.end)
    }

    /// `[start, effective end)`.
    pub fn occupied(&self) -> Span {
        Span::new(self.span.start, self.effective_end())
    }

    pub fn is_blocking(&self) -> bool {
        self.status.is_blocking()
    }

    pub fn is_main_reserver(&self, user_id: Ulid) -> bool {
        self.user_id == user_id
    }

    pub fn tz(&self) -> Tz {
        self.timezone.parse().unwrap_or(Tz::UTC)
    }

    /// Calendar date of the start instant in the reservation's own timezone.
    pub fn local_date(&self) -> Option<NaiveDate> {
        local_date(self.span.start, self.tz())
    }

    /// Every invariant a committed reservation must satisfy.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.span.start >= self.span.end {
            return Err("start must be before end".into());
        }
        if let Some(ext) = self.extended_end
            && ext <= self.span.end
        {
            return Err("extended end must be after the original end".into());
        }
        match self.participants.first() {
            Some(p) if p.is_main_reserver => {}
            _ => return Err("participant 0 must be the main reserver".into()),
        }
        if self.participants.iter().filter(|p| p.is_main_reserver).count() != 1 {
            return Err("exactly one participant must be the main reserver".into());
        }
        if self.extension_requested != (self.extension_status == ExtensionStatus::Pending) {
            return Err("extension flag out of sync with extension status".into());
        }
        Ok(())
    }
}

pub fn local_date(t: Ms, tz: Tz) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(t).map(|dt| dt.with_timezone(&tz).date_naive())
}

/// What the room state keeps per room.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    /// Sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    /// Replace a reservation in place. Spans never move, so the order holds.
    pub fn replace_reservation(&mut self, reservation: Reservation) {
        match self.position(&reservation.id) {
            Some(pos) => self.reservations[pos] = reservation,
            None => self.insert_reservation(reservation),
        }
    }

    pub fn position(&self, id: &Ulid) -> Option<usize> {
        self.reservations.iter().position(|r| r.id == *id)
    }

    pub fn get(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    /// Blocking reservations whose occupied span overlaps `query`.
    pub fn blocking_overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.is_blocking() && r.effective_end() > query.start)
    }
}

/// The WAL record format. Transitions carry the full post-change snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomUpserted { room: Room },
    ReservationCreated { reservation: Reservation },
    ReservationChanged { reservation: Reservation },
}

impl Event {
    pub fn room_id(&self) -> Ulid {
        match self {
            Event::RoomUpserted { room } => room.id,
            Event::ReservationCreated { reservation } | Event::ReservationChanged { reservation } => {
                reservation.room_id
            }
        }
    }
}

/// A reservation as requested, before validation. The creating actor becomes
/// the main reserver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub id: Ulid,
    pub room_id: Ulid,
    pub span: Span,
    /// IANA name. Falls back to the policy timezone.
    pub timezone: Option<String>,
    pub participants: Vec<Participant>,
    pub purpose: Option<String>,
}

// ── Query result types ───────────────────────────────────────────

/// One occupied interval of a room's day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OccupiedSlot {
    pub start: Ms,
    pub end: Ms,
    pub is_owned_by_viewer: bool,
    pub status: ReservationStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomAvailability {
    pub room_id: Ulid,
    pub floor: String,
    pub name: String,
    pub bookable: bool,
    pub occupied: Vec<OccupiedSlot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub room_id: Option<Ulid>,
    pub user_id: Option<Ulid>,
    pub status: Option<ReservationStatus>,
}

impl ReservationFilter {
    /// List semantics: archived reservations never match.
    pub fn matches(&self, r: &Reservation) -> bool {
        !r.archived && self.matches_fields(r)
    }

    /// Field comparison only. Lookups by id still see archived reservations.
    pub fn matches_fields(&self, r: &Reservation) -> bool {
        self.room_id.is_none_or(|id| r.room_id == id)
            && self.user_id.is_none_or(|id| r.user_id == id)
            && self.status.is_none_or(|s| r.status == s)
    }
}
