use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Minor currency units (cents).
pub type Price = u64;

pub const MINUTES_PER_DAY: u16 = 24 * 60;

/// Minutes since local midnight, `0..=1440`. Rendered as `"HH:MM"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub const MIDNIGHT: TimeOfDay = TimeOfDay(0);
    pub const END_OF_DAY: TimeOfDay = TimeOfDay(MINUTES_PER_DAY);

    pub const fn hm(hour: u16, minute: u16) -> Self {
        Self(hour * 60 + minute)
    }

    pub fn from_minutes(minutes: u16) -> Option<Self> {
        (minutes <= MINUTES_PER_DAY).then_some(Self(minutes))
    }

    pub fn minutes(self) -> u16 {
        self.0
    }

    /// Wall-clock instant on `date`. `24:00` maps to the next midnight.
    pub fn on(self, date: NaiveDate) -> NaiveDateTime {
        date.and_time(NaiveTime::MIN) + chrono::Duration::minutes(i64::from(self.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid time of day {0:?} (expected HH:MM between 00:00 and 24:00)")]
pub struct TimeOfDayError(String);

impl FromStr for TimeOfDay {
    type Err = TimeOfDayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || TimeOfDayError(s.to_string());
        let (h, m) = s.split_once(':').ok_or_else(err)?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return Err(err());
        }
        let hour: u16 = h.parse().map_err(|_| err())?;
        let minute: u16 = m.parse().map_err(|_| err())?;
        if minute >= 60 {
            return Err(err());
        }
        Self::from_minutes(hour * 60 + minute).ok_or_else(err)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = TimeOfDayError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> Self {
        t.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

/// Half-open interval `[start, end)` within one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawSpan")]
pub struct Span {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

#[derive(Deserialize)]
struct RawSpan {
    start: TimeOfDay,
    end: TimeOfDay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("interval start {start} must be before end {end}")]
pub struct SpanError {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl TryFrom<RawSpan> for Span {
    type Error = SpanError;

    fn try_from(raw: RawSpan) -> Result<Self, Self::Error> {
        Span::try_new(raw.start, raw.end)
    }
}

impl Span {
    pub fn new(start: TimeOfDay, end: TimeOfDay) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for untrusted input.
    pub fn try_new(start: TimeOfDay, end: TimeOfDay) -> Result<Self, SpanError> {
        if start < end {
            Ok(Self { start, end })
        } else {
            Err(SpanError { start, end })
        }
    }

    pub fn duration_minutes(&self) -> u16 {
        self.end.minutes() - self.start.minutes()
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && self.end > other.start
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Daily opening window plus the weekdays the court stays closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingHours {
    pub open: TimeOfDay,
    pub close: TimeOfDay,
    #[serde(default)]
    pub closed_on: Vec<Weekday>,
}

impl OperatingHours {
    pub fn daily(open: TimeOfDay, close: TimeOfDay) -> Self {
        Self {
            open,
            close,
            closed_on: Vec::new(),
        }
    }

    /// The bookable window on `date`, or `None` if closed that day.
    pub fn window_on(&self, date: NaiveDate) -> Option<Span> {
        if self.closed_on.contains(&date.weekday()) {
            return None;
        }
        Span::try_new(self.open, self.close).ok()
    }
}

/// A bookable court. Owned by the facility collaborator; read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Court {
    pub id: Ulid,
    pub facility_id: Ulid,
    pub owner_id: String,
    pub name: String,
    pub hours: OperatingHours,
    /// Price per hour in minor units.
    pub price_per_hour: Price,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Court {
    /// Price for `span`, prorated per minute and rounded half-up.
    pub fn quote(&self, span: &Span) -> Price {
        (self.price_per_hour * Price::from(span.duration_minutes()) + 30) / 60
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    /// Pending and confirmed bookings occupy their interval.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BookingStatus::Cancelled | BookingStatus::Completed)
    }

    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Cancelled) | (Confirmed, Completed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" => Ok(BookingStatus::Cancelled),
            "completed" => Ok(BookingStatus::Completed),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub court_id: Ulid,
    pub requester_id: String,
    pub date: NaiveDate,
    pub span: Span,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
    /// Set only while pending: the hold lapses at this instant.
    pub expires_at: Option<DateTime<Utc>>,
    pub price: Price,
}

impl Booking {
    pub fn key(&self) -> PartitionKey {
        PartitionKey::new(self.court_id, self.date)
    }

    /// Local wall-clock instant at which the booked interval ends.
    pub fn ends_at(&self) -> NaiveDateTime {
        self.span.end.on(self.date)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == BookingStatus::Pending && self.expires_at.is_some_and(|t| t <= now)
    }
}

/// Owner-declared interval removed from bookability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedWindow {
    pub id: Ulid,
    pub court_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub reason: String,
    pub created_by: String,
}

impl BlockedWindow {
    pub fn key(&self) -> PartitionKey {
        PartitionKey::new(self.court_id, self.date)
    }
}

/// The serialization unit: one court on one date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub court_id: Ulid,
    pub date: NaiveDate,
}

impl PartitionKey {
    pub fn new(court_id: Ulid, date: NaiveDate) -> Self {
        Self { court_id, date }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.court_id, self.date)
    }
}

/// What currently holds an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum OccupantRef {
    Booking(Ulid),
    Block(Ulid),
}

impl fmt::Display for OccupantRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OccupantRef::Booking(id) => write!(f, "booking {id}"),
            OccupantRef::Block(id) => write!(f, "blocked window {id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupant {
    pub span: Span,
    pub source: OccupantRef,
}

/// Untrusted reservation input as it arrives from a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReservation {
    pub court_id: Ulid,
    pub date: NaiveDate,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub requester_id: String,
}

/// Untrusted request to take an interval out of bookability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBlock {
    pub court_id: Ulid,
    pub date: NaiveDate,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    #[serde(default)]
    pub reason: String,
}

/// A reservation that passed input validation against its court.
/// Only the coordinator constructs these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub(crate) key: PartitionKey,
    pub(crate) span: Span,
    pub(crate) requester_id: String,
    pub(crate) price: Price,
}

impl ReservationRequest {
    pub fn key(&self) -> PartitionKey {
        self.key
    }

    pub fn span(&self) -> Span {
        self.span
    }

    pub fn requester_id(&self) -> &str {
        &self.requester_id
    }
}

/// A bookable cell from the availability grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub span: Span,
    pub price: Price,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    #[serde(rename = "slot.booked")]
    Booked,
    #[serde(rename = "slot.held")]
    Held,
    #[serde(rename = "slot.cancelled")]
    Cancelled,
    #[serde(rename = "slot.blocked")]
    Blocked,
    #[serde(rename = "slot.unblocked")]
    Unblocked,
}

/// Notification fanned out to subscribers after a ledger change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub court_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<Ulid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_id: Option<Ulid>,
    /// Partition commit sequence the change became visible at.
    pub seq: u64,
}

impl ChangeEvent {
    pub fn for_booking(kind: ChangeKind, booking: &Booking, seq: u64) -> Self {
        Self {
            kind,
            court_id: booking.court_id,
            date: booking.date,
            span: booking.span,
            booking_id: Some(booking.id),
            block_id: None,
            seq,
        }
    }

    pub fn for_block(kind: ChangeKind, block: &BlockedWindow, seq: u64) -> Self {
        Self {
            kind,
            court_id: block.court_id,
            date: block.date,
            span: block.span,
            booking_id: None,
            block_id: Some(block.id),
            seq,
        }
    }
}

/// Ledger record format. Flat, no nesting beyond the model types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    CourtRegistered {
        court: Court,
    },
    BlockAdded {
        block: BlockedWindow,
    },
    BlockRemoved {
        id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    StatusChanged {
        id: Ulid,
        status: BookingStatus,
    },
}
