use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only absolute time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 24 * 60 * MINUTE_MS;

/// Minutes in a day; `end_minute` may equal this (24:00).
pub const MINUTES_PER_DAY: u16 = 1440;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Span starting at `start` and lasting `minutes` whole minutes.
    pub fn from_minutes(start: Ms, minutes: u32) -> Self {
        Self::new(start, start + minutes as Ms * MINUTE_MS)
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

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Intersection of two spans, `None` when they do not overlap.
    pub fn clamp_to(&self, window: &Span) -> Option<Span> {
        let start = self.start.max(window.start);
        let end = self.end.min(window.end);
        (start < end).then(|| Span::new(start, end))
    }
}

// ── Availability rules ───────────────────────────────────────────

/// What an availability rule does to an artisan's open hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleKind {
    /// Weekly opening hours.
    Recurring,
    /// Date-scoped extra opening, may extend past recurring hours.
    OverrideOpen,
    /// Date-scoped closure; always wins.
    OverrideBlocked,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Recurring => "RECURRING",
            RuleKind::OverrideOpen => "OVERRIDE_OPEN",
            RuleKind::OverrideBlocked => "OVERRIDE_BLOCKED",
        }
    }

    pub fn is_override(&self) -> bool {
        !matches!(self, RuleKind::Recurring)
    }
}

impl FromStr for RuleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RECURRING" => Ok(RuleKind::Recurring),
            "OVERRIDE_OPEN" => Ok(RuleKind::OverrideOpen),
            "OVERRIDE_BLOCKED" => Ok(RuleKind::OverrideBlocked),
            other => Err(format!("unknown rule kind: {other}")),
        }
    }
}

/// A recurring weekly opening or a date-scoped override.
/// Times of day are provider-local minutes since midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRule {
    pub id: Ulid,
    pub artisan_id: Ulid,
    /// 0 = Sunday .. 6 = Saturday. Required for recurring rules.
    pub day_of_week: Option<u8>,
    pub start_minute: u16,
    pub end_minute: u16,
    /// Inclusive date bounds.
    pub valid_from: Option<NaiveDate>,
    pub valid_to: Option<NaiveDate>,
    pub kind: RuleKind,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl AvailabilityRule {
    /// Whether the rule contributes to the given provider-local date.
    pub fn applies_on(&self, date: NaiveDate) -> bool {
        if let Some(dow) = self.day_of_week
            && date.weekday().num_days_from_sunday() as u8 != dow
        {
            return false;
        }
        self.valid_from.is_none_or(|from| from <= date) && self.valid_to.is_none_or(|to| date <= to)
    }

    /// Whether the rule's validity window intersects `[from, to]` (inclusive dates).
    pub fn valid_within(&self, from: NaiveDate, to: NaiveDate) -> bool {
        self.valid_from.is_none_or(|vf| vf <= to) && self.valid_to.is_none_or(|vt| from <= vt)
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    pub const ACTIVE: [BookingStatus; 3] = [
        BookingStatus::Pending,
        BookingStatus::Confirmed,
        BookingStatus::InProgress,
    ];

    /// Active bookings occupy the artisan's time.
    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingStatus::Completed | BookingStatus::Cancelled | BookingStatus::NoShow
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::InProgress => "IN_PROGRESS",
            BookingStatus::Completed => "COMPLETED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::NoShow => "NO_SHOW",
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
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "PENDING" => Ok(BookingStatus::Pending),
            "CONFIRMED" => Ok(BookingStatus::Confirmed),
            "IN_PROGRESS" => Ok(BookingStatus::InProgress),
            "COMPLETED" => Ok(BookingStatus::Completed),
            "CANCELLED" | "CANCELED" => Ok(BookingStatus::Cancelled),
            "NO_SHOW" => Ok(BookingStatus::NoShow),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub tenant_id: Ulid,
    pub artisan_id: Ulid,
    pub customer_id: Ulid,
    pub service_id: Ulid,
    pub scheduled_at: Ms,
    pub duration_minutes: u32,
    pub status: BookingStatus,
    pub idempotency_key: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
    /// Optimistic-concurrency counter, bumped on every transition.
    pub version: u64,
    /// Reason or completion data attached to the last transition.
    pub note: Option<String>,
    pub rescheduled_from: Option<Ulid>,
}

impl Booking {
    pub fn span(&self) -> Span {
        Span::from_minutes(self.scheduled_at, self.duration_minutes)
    }
}

/// Completed idempotent create, keyed per tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub tenant_id: Ulid,
    pub request_fingerprint: String,
    pub result_booking_id: Ulid,
    pub created_at: Ms,
    pub expires_at: Ms,
}

/// Computed bookable interval; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSlot {
    pub start: Ms,
    pub end: Ms,
    pub available: bool,
}

impl TimeSlot {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }
}

// ── Per-artisan state ────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ArtisanState {
    pub id: Ulid,
    pub tenant_id: Ulid,
    pub name: Option<String>,
    /// Fixed offset of the artisan's local time from UTC.
    pub utc_offset_minutes: i32,
    pub rules: Vec<AvailabilityRule>,
    /// Every booking ever made for this artisan, sorted by `scheduled_at`.
    pub bookings: Vec<Booking>,
}

impl ArtisanState {
    pub fn new(id: Ulid, tenant_id: Ulid, name: Option<String>, utc_offset_minutes: i32) -> Self {
        Self {
            id,
            tenant_id,
            name,
            utc_offset_minutes,
            rules: Vec::new(),
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by `scheduled_at`.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.scheduled_at <= booking.scheduled_at);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// Bookings of any status whose span overlaps the query window.
    /// Binary search skips bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.scheduled_at < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span().end > query.start)
    }

    /// Active bookings overlapping the query window.
    pub fn active_overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        self.overlapping(query).filter(|b| b.status.is_active())
    }

    /// Replace a rule with the same id or append a new one.
    pub fn upsert_rule(&mut self, rule: AvailabilityRule) {
        match self.rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
    }

    pub fn remove_rule(&mut self, id: &Ulid) -> Option<AvailabilityRule> {
        let pos = self.rules.iter().position(|r| r.id == *id)?;
        Some(self.rules.remove(pos))
    }

    pub fn info(&self) -> ArtisanInfo {
        ArtisanInfo {
            id: self.id,
            tenant_id: self.tenant_id,
            name: self.name.clone(),
            utc_offset_minutes: self.utc_offset_minutes,
            rule_count: self.rules.len(),
            booking_count: self.bookings.len(),
        }
    }
}

/// Idempotency data carried alongside a created booking in the WAL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyStamp {
    pub key: String,
    pub fingerprint: String,
    pub expires_at: Ms,
}

/// The event types: flat, no nesting. This is the WAL record format and
/// the payload broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ArtisanRegistered {
        id: Ulid,
        tenant_id: Ulid,
        name: Option<String>,
        utc_offset_minutes: i32,
    },
    ArtisanUpdated {
        id: Ulid,
        name: Option<String>,
        utc_offset_minutes: i32,
    },
    CustomerRegistered {
        id: Ulid,
        tenant_id: Ulid,
    },
    RuleUpserted {
        rule: AvailabilityRule,
    },
    RulesUpserted {
        artisan_id: Ulid,
        rules: Vec<AvailabilityRule>,
    },
    RuleDeleted {
        id: Ulid,
        artisan_id: Ulid,
    },
    BookingCreated {
        booking: Booking,
        idempotency: Option<IdempotencyStamp>,
    },
    BookingStatusChanged {
        id: Ulid,
        artisan_id: Ulid,
        status: BookingStatus,
        version: u64,
        at: Ms,
        note: Option<String>,
    },
    /// Old booking cancelled and its replacement created as one unit.
    BookingRescheduled {
        id: Ulid,
        artisan_id: Ulid,
        version: u64,
        at: Ms,
        replacement: Booking,
    },
}

impl Event {
    /// The artisan an event belongs to, if any.
    pub fn artisan_id(&self) -> Option<Ulid> {
        match self {
            Event::ArtisanRegistered { id, .. } | Event::ArtisanUpdated { id, .. } => Some(*id),
            Event::RuleUpserted { rule } => Some(rule.artisan_id),
            Event::RulesUpserted { artisan_id, .. }
            | Event::RuleDeleted { artisan_id, .. }
            | Event::BookingStatusChanged { artisan_id, .. }
            | Event::BookingRescheduled { artisan_id, .. } => Some(*artisan_id),
            Event::BookingCreated { booking, .. } => Some(booking.artisan_id),
            Event::CustomerRegistered { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtisanInfo {
    pub id: Ulid,
    pub tenant_id: Ulid,
    pub name: Option<String>,
    pub utc_offset_minutes: i32,
    pub rule_count: usize,
    pub booking_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BookingSort {
    #[default]
    ScheduledAsc,
    ScheduledDesc,
    CreatedAsc,
    CreatedDesc,
}

impl FromStr for BookingSort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled_at" | "scheduled_at:asc" => Ok(BookingSort::ScheduledAsc),
            "-scheduled_at" | "scheduled_at:desc" => Ok(BookingSort::ScheduledDesc),
            "created_at" | "created_at:asc" => Ok(BookingSort::CreatedAsc),
            "-created_at" | "created_at:desc" => Ok(BookingSort::CreatedDesc),
            other => Err(format!("unknown sort: {other}")),
        }
    }
}

/// Already-validated listing filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingFilter {
    pub tenant_id: Ulid,
    pub artisan_id: Option<Ulid>,
    pub customer_id: Option<Ulid>,
    pub status: Option<BookingStatus>,
    pub sort: BookingSort,
    /// 1-based.
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking_at(artisan_id: Ulid, start: Ms, minutes: u32, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            tenant_id: Ulid::nil(),
            artisan_id,
            customer_id: Ulid::new(),
            service_id: Ulid::new(),
            scheduled_at: start,
            duration_minutes: minutes,
            status,
            idempotency_key: None,
            created_at: 0,
            updated_at: 0,
            version: 1,
            note: None,
            rescheduled_from: None,
        }
    }

    fn artisan() -> ArtisanState {
        ArtisanState::new(Ulid::new(), Ulid::new(), None, 0)
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
        assert_eq!(Span::from_minutes(0, 30).end, 30 * MINUTE_MS);
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(Span::new(100, 400).contains_span(&Span::new(150, 300)));
    }

    #[test]
    fn clamp_to_window() {
        let w = Span::new(100, 200);
        assert_eq!(Span::new(50, 150).clamp_to(&w), Some(Span::new(100, 150)));
        assert_eq!(Span::new(200, 300).clamp_to(&w), None);
    }

    #[test]
    fn bookings_kept_sorted() {
        let mut a = artisan();
        let id = a.id;
        a.insert_booking(booking_at(id, 300 * MINUTE_MS, 30, BookingStatus::Pending));
        a.insert_booking(booking_at(id, 100 * MINUTE_MS, 30, BookingStatus::Pending));
        a.insert_booking(booking_at(id, 200 * MINUTE_MS, 30, BookingStatus::Pending));
        let starts: Vec<Ms> = a.bookings.iter().map(|b| b.scheduled_at).collect();
        assert_eq!(starts, vec![100 * MINUTE_MS, 200 * MINUTE_MS, 300 * MINUTE_MS]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut a = artisan();
        let id = a.id;
        a.insert_booking(booking_at(id, 0, 60, BookingStatus::Confirmed));
        a.insert_booking(booking_at(id, 120 * MINUTE_MS, 60, BookingStatus::Confirmed));
        a.insert_booking(booking_at(id, 600 * MINUTE_MS, 60, BookingStatus::Confirmed));

        let query = Span::new(150 * MINUTE_MS, 300 * MINUTE_MS);
        let hits: Vec<_> = a.overlapping(&query).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].scheduled_at, 120 * MINUTE_MS);
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut a = artisan();
        let id = a.id;
        a.insert_booking(booking_at(id, 0, 60, BookingStatus::Confirmed));
        let query = Span::new(60 * MINUTE_MS, 120 * MINUTE_MS);
        assert_eq!(a.overlapping(&query).count(), 0);
    }

    #[test]
    fn active_overlapping_ignores_terminal_statuses() {
        let mut a = artisan();
        let id = a.id;
        a.insert_booking(booking_at(id, 0, 60, BookingStatus::Cancelled));
        a.insert_booking(booking_at(id, 0, 60, BookingStatus::NoShow));
        a.insert_booking(booking_at(id, 30 * MINUTE_MS, 60, BookingStatus::InProgress));
        let query = Span::new(0, 120 * MINUTE_MS);
        assert_eq!(a.overlapping(&query).count(), 3);
        let active: Vec<_> = a.active_overlapping(&query).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].status, BookingStatus::InProgress);
    }

    #[test]
    fn upsert_and_remove_rule() {
        let mut a = artisan();
        let mut rule = AvailabilityRule {
            id: Ulid::new(),
            artisan_id: a.id,
            day_of_week: Some(1),
            start_minute: 540,
            end_minute: 720,
            valid_from: None,
            valid_to: None,
            kind: RuleKind::Recurring,
            created_at: 0,
            updated_at: 0,
        };
        a.upsert_rule(rule.clone());
        rule.end_minute = 780;
        a.upsert_rule(rule.clone());
        assert_eq!(a.rules.len(), 1);
        assert_eq!(a.rules[0].end_minute, 780);
        assert!(a.remove_rule(&rule.id).is_some());
        assert!(a.remove_rule(&rule.id).is_none());
    }

    #[test]
    fn rule_applies_on_weekday_and_validity() {
        let monday = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let rule = AvailabilityRule {
            id: Ulid::new(),
            artisan_id: Ulid::new(),
            day_of_week: Some(1),
            start_minute: 540,
            end_minute: 720,
            valid_from: Some(monday),
            valid_to: Some(NaiveDate::from_ymd_opt(2024, 1, 31).unwrap()),
            kind: RuleKind::Recurring,
            created_at: 0,
            updated_at: 0,
        };
        assert!(rule.applies_on(monday));
        assert!(!rule.applies_on(monday.succ_opt().unwrap()));
        assert!(!rule.applies_on(NaiveDate::from_ymd_opt(2024, 2, 5).unwrap()));
    }

    #[test]
    fn status_parsing_and_activity() {
        assert_eq!("no-show".parse::<BookingStatus>(), Ok(BookingStatus::NoShow));
        assert_eq!("in_progress".parse::<BookingStatus>(), Ok(BookingStatus::InProgress));
        assert!("bogus".parse::<BookingStatus>().is_err());
        assert!(BookingStatus::Confirmed.is_active());
        assert!(BookingStatus::Cancelled.is_terminal());
        assert!(!BookingStatus::Pending.is_terminal());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ArtisanRegistered {
            id: Ulid::new(),
            tenant_id: Ulid::new(),
            name: Some("Mira".into()),
            utc_offset_minutes: 120,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
