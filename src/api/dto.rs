//! Wire formats. Instants are RFC 3339, times of day `HH:MM`, dates
//! `YYYY-MM-DD`; everything is converted to typed values here before it
//! reaches the service.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::{AvailabilityCheck, allowed_actions};
use crate::model::*;

use super::ApiError;

pub fn parse_id(raw: &str, what: &str) -> Result<Ulid, ApiError> {
    Ulid::from_string(raw.trim()).map_err(|_| ApiError::InvalidId(format!("{what} is not a valid id: {raw:?}")))
}

pub fn parse_opt_id(raw: Option<&str>, what: &str) -> Result<Option<Ulid>, ApiError> {
    raw.map(|r| parse_id(r, what)).transpose()
}

pub fn parse_instant(raw: &str, what: &str) -> Result<Ms, ApiError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|t| t.timestamp_millis())
        .map_err(|e| ApiError::BadRequest(format!("{what}: expected an RFC 3339 timestamp ({e})")))
}

pub fn format_instant(ms: Ms) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| ms.to_string())
}

/// `HH:MM` to minutes since midnight. `24:00` is accepted.
pub fn parse_time_of_day(raw: &str, what: &str) -> Result<u16, ApiError> {
    let bad = || ApiError::BadRequest(format!("{what}: expected HH:MM, got {raw:?}"));
    let (h, m) = raw.trim().split_once(':').ok_or_else(bad)?;
    if h.len() != 2 || m.len() != 2 {
        return Err(bad());
    }
    let h: u16 = h.parse().map_err(|_| bad())?;
    let m: u16 = m.parse().map_err(|_| bad())?;
    if m >= 60 || h > 24 || (h == 24 && m != 0) {
        return Err(bad());
    }
    Ok(h * 60 + m)
}

pub fn format_time_of_day(minute: u16) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

// ── Requests ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateBookingBody {
    pub artisan_id: String,
    pub customer_id: String,
    pub service_id: String,
    pub scheduled_at: String,
    #[serde(alias = "duration")]
    pub duration_minutes: u32,
}

#[derive(Debug, Deserialize)]
pub struct TransitionBody {
    pub version: u64,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RescheduleBody {
    pub version: u64,
    pub scheduled_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CheckAvailabilityBody {
    pub artisan_id: String,
    pub start: String,
    pub duration: u32,
}

#[derive(Debug, Deserialize)]
pub struct SlotsParams {
    pub artisan_id: String,
    pub date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub duration: u32,
    #[serde(default)]
    pub include_booked: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub page: Option<usize>,
    pub page_size: Option<usize>,
    pub artisan_id: Option<String>,
    pub customer_id: Option<String>,
    pub status: Option<String>,
    pub sort: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleParams {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

#[derive(Debug, Deserialize)]
pub struct EventsParams {
    pub artisan_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RulesParams {
    pub artisan_id: String,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

/// Fields shared by single and bulk rule writes.
#[derive(Debug, Deserialize)]
pub struct RuleFields {
    /// Present to update an existing rule in a bulk write.
    pub id: Option<String>,
    #[serde(default = "default_kind")]
    pub kind: String,
    pub day_of_week: Option<u8>,
    pub start_time: String,
    pub end_time: String,
    pub valid_from: Option<NaiveDate>,
    pub valid_to: Option<NaiveDate>,
}

fn default_kind() -> String {
    RuleKind::Recurring.as_str().to_string()
}

#[derive(Debug, Deserialize)]
pub struct RuleBody {
    pub artisan_id: String,
    #[serde(flatten)]
    pub rule: RuleFields,
}

#[derive(Debug, Deserialize)]
pub struct BulkRulesBody {
    pub artisan_id: String,
    pub rules: Vec<RuleFields>,
}

impl RuleFields {
    /// Build a rule; `id` wins over any id in the body.
    pub fn into_rule(self, artisan_id: Ulid, id: Option<Ulid>) -> Result<AvailabilityRule, ApiError> {
        let id = match id {
            Some(id) => id,
            None => parse_opt_id(self.id.as_deref(), "rule id")?.unwrap_or_else(Ulid::new),
        };
        let kind: RuleKind = self.kind.parse().map_err(ApiError::BadRequest)?;
        Ok(AvailabilityRule {
            id,
            artisan_id,
            day_of_week: self.day_of_week,
            start_minute: parse_time_of_day(&self.start_time, "start_time")?,
            end_minute: parse_time_of_day(&self.end_time, "end_time")?,
            valid_from: self.valid_from,
            valid_to: self.valid_to,
            kind,
            created_at: 0,
            updated_at: 0,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ArtisanBody {
    pub name: Option<String>,
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

// ── Responses ────────────────────────────────────────────────────

/// `{success: true, data, message?}`
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            message: None,
        }
    }

    pub fn with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BookingView {
    pub id: Ulid,
    pub tenant_id: Ulid,
    pub artisan_id: Ulid,
    pub customer_id: Ulid,
    pub service_id: Ulid,
    pub scheduled_at: String,
    pub ends_at: String,
    pub duration_minutes: u32,
    pub status: &'static str,
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rescheduled_from: Option<Ulid>,
    pub allowed_actions: Vec<&'static str>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&Booking> for BookingView {
    fn from(b: &Booking) -> Self {
        Self {
            id: b.id,
            tenant_id: b.tenant_id,
            artisan_id: b.artisan_id,
            customer_id: b.customer_id,
            service_id: b.service_id,
            scheduled_at: format_instant(b.scheduled_at),
            ends_at: format_instant(b.span().end),
            duration_minutes: b.duration_minutes,
            status: b.status.as_str(),
            version: b.version,
            idempotency_key: b.idempotency_key.clone(),
            note: b.note.clone(),
            rescheduled_from: b.rescheduled_from,
            allowed_actions: allowed_actions(b.status).iter().map(|a| a.as_str()).collect(),
            created_at: format_instant(b.created_at),
            updated_at: format_instant(b.updated_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RescheduleView {
    pub previous: BookingView,
    pub booking: BookingView,
}

#[derive(Debug, Serialize)]
pub struct PageView {
    pub items: Vec<BookingView>,
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
}

impl From<&Page<Booking>> for PageView {
    fn from(p: &Page<Booking>) -> Self {
        Self {
            items: p.items.iter().map(BookingView::from).collect(),
            page: p.page,
            page_size: p.page_size,
            total: p.total,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SlotView {
    pub start: String,
    pub end: String,
    pub available: bool,
}

impl From<&TimeSlot> for SlotView {
    fn from(s: &TimeSlot) -> Self {
        Self {
            start: format_instant(s.start),
            end: format_instant(s.end),
            available: s.available,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AvailabilityView {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicting_booking_id: Option<Ulid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

impl From<AvailabilityCheck> for AvailabilityView {
    fn from(c: AvailabilityCheck) -> Self {
        Self {
            available: c.available,
            conflicting_booking_id: c.conflicting_booking_id,
            reason: c.reason,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RuleView {
    pub id: Ulid,
    pub artisan_id: Ulid,
    pub kind: &'static str,
    pub day_of_week: Option<u8>,
    pub start_time: String,
    pub end_time: String,
    pub valid_from: Option<NaiveDate>,
    pub valid_to: Option<NaiveDate>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&AvailabilityRule> for RuleView {
    fn from(r: &AvailabilityRule) -> Self {
        Self {
            id: r.id,
            artisan_id: r.artisan_id,
            kind: r.kind.as_str(),
            day_of_week: r.day_of_week,
            start_time: format_time_of_day(r.start_minute),
            end_time: format_time_of_day(r.end_minute),
            valid_from: r.valid_from,
            valid_to: r.valid_to,
            created_at: format_instant(r.created_at),
            updated_at: format_instant(r.updated_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ArtisanView {
    pub id: Ulid,
    pub tenant_id: Ulid,
    pub name: Option<String>,
    pub utc_offset_minutes: i32,
    pub rule_count: usize,
    pub booking_count: usize,
}

impl From<ArtisanInfo> for ArtisanView {
    fn from(a: ArtisanInfo) -> Self {
        Self {
            id: a.id,
            tenant_id: a.tenant_id,
            name: a.name,
            utc_offset_minutes: a.utc_offset_minutes,
            rule_count: a.rule_count,
            booking_count: a.booking_count,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CustomerView {
    pub id: Ulid,
    pub tenant_id: Ulid,
}
