use serde::Serialize;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, now_ms, validate_candidate};
use super::lifecycle::{BookingAction, next_status};
use super::{Engine, SchedulingError, SharedArtisanState};

/// A validated create request. Serialized form is what idempotency
/// fingerprints are computed over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewBooking {
    pub tenant_id: Ulid,
    pub artisan_id: Ulid,
    pub customer_id: Ulid,
    pub service_id: Ulid,
    pub scheduled_at: Ms,
    pub duration_minutes: u32,
}

/// Copy of an artisan's rules and bookings in a window, taken under a
/// short read lock so slot computation runs without holding it.
#[derive(Debug, Clone)]
pub struct ScheduleSnapshot {
    pub artisan_id: Ulid,
    pub tenant_id: Ulid,
    pub utc_offset_minutes: i32,
    pub rules: Vec<AvailabilityRule>,
    /// Bookings of any status overlapping the window, by `scheduled_at`.
    pub bookings: Vec<Booking>,
}

impl ScheduleSnapshot {
    pub fn active_spans(&self) -> Vec<Span> {
        self.bookings
            .iter()
            .filter(|b| b.status.is_active())
            .map(Booking::span)
            .collect()
    }
}

/// Result of a reschedule: the cancelled original and its replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rescheduled {
    pub previous: Booking,
    pub booking: Booking,
}

/// Advisory answer for a candidate interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityCheck {
    pub available: bool,
    pub conflicting_booking_id: Option<Ulid>,
    pub reason: Option<&'static str>,
}

fn check_booking_tenant(booking: &Booking, tenant_id: Ulid) -> Result<(), SchedulingError> {
    if booking.tenant_id != tenant_id {
        return Err(SchedulingError::Forbidden(format!(
            "booking {} belongs to another tenant",
            booking.id
        )));
    }
    Ok(())
}

fn check_version(booking: &Booking, expected: u64) -> Result<(), SchedulingError> {
    if booking.version != expected {
        return Err(SchedulingError::VersionConflict {
            expected,
            current: booking.version,
        });
    }
    Ok(())
}

fn validate_note(note: Option<&str>) -> Result<(), SchedulingError> {
    if note.is_some_and(|n| n.len() > MAX_NOTE_LEN) {
        return Err(SchedulingError::LimitExceeded("note too long"));
    }
    Ok(())
}

fn sort_bookings(bookings: &mut [Booking], sort: BookingSort) {
    match sort {
        BookingSort::ScheduledAsc => bookings.sort_by_key(|b| (b.scheduled_at, b.id)),
        BookingSort::ScheduledDesc => {
            bookings.sort_by_key(|b| std::cmp::Reverse((b.scheduled_at, b.id)))
        }
        BookingSort::CreatedAsc => bookings.sort_by_key(|b| (b.created_at, b.id)),
        BookingSort::CreatedDesc => bookings.sort_by_key(|b| std::cmp::Reverse((b.created_at, b.id))),
    }
}

impl Engine {
    /// Check-and-insert under the artisan's write lock. The overlap check,
    /// WAL append and apply happen under one guard, so two creates for the
    /// same artisan are strictly ordered and the loser sees the winner.
    pub async fn create_booking(
        &self,
        req: &NewBooking,
        idempotency: Option<IdempotencyStamp>,
    ) -> Result<Booking, SchedulingError> {
        let span = validate_candidate(req.scheduled_at, req.duration_minutes)?;

        let _gate = self.compaction_gate.read().await;
        let artisan = self.artisan(&req.artisan_id)?;
        let mut guard = artisan.write().await;
        if guard.tenant_id != req.tenant_id {
            return Err(SchedulingError::Forbidden(format!(
                "artisan {} belongs to another tenant",
                req.artisan_id
            )));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_ARTISAN {
            return Err(SchedulingError::LimitExceeded("too many bookings for artisan"));
        }
        check_no_conflict(&guard, &span, None, self.config.require_open_hours)?;

        let now = now_ms();
        let booking = Booking {
            id: Ulid::new(),
            tenant_id: req.tenant_id,
            artisan_id: req.artisan_id,
            customer_id: req.customer_id,
            service_id: req.service_id,
            scheduled_at: span.start,
            duration_minutes: req.duration_minutes,
            status: BookingStatus::Pending,
            idempotency_key: idempotency.as_ref().map(|s| s.key.clone()),
            created_at: now,
            updated_at: now,
            version: 1,
            note: None,
            rescheduled_from: None,
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
            idempotency,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);
        tracing::info!(
            booking_id = %booking.id,
            artisan_id = %booking.artisan_id,
            scheduled_at = booking.scheduled_at,
            duration_minutes = booking.duration_minutes,
            "booking created"
        );
        Ok(booking)
    }

    /// Move a booking along the status graph. The version is checked
    /// before the graph, so a stale caller always sees `VersionConflict`.
    pub async fn transition(
        &self,
        tenant_id: Ulid,
        id: Ulid,
        action: BookingAction,
        expected_version: u64,
        note: Option<String>,
    ) -> Result<Booking, SchedulingError> {
        if action == BookingAction::Reschedule {
            return Err(SchedulingError::Validation(
                "reschedule needs a new start time".into(),
            ));
        }
        validate_note(note.as_deref())?;

        let _gate = self.compaction_gate.read().await;
        let artisan = self.artisan_for_booking(&id)?;
        let mut guard = artisan.write().await;
        let booking = guard.booking(&id).ok_or(SchedulingError::NotFound(id))?;
        check_booking_tenant(booking, tenant_id)?;
        check_version(booking, expected_version)?;
        let status = next_status(booking.status, action)?;
        let from = booking.status;

        let event = Event::BookingStatusChanged {
            id,
            artisan_id: guard.id,
            status,
            version: booking.version + 1,
            at: now_ms(),
            note,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "action" => action.as_str())
            .increment(1);
        tracing::info!(booking_id = %id, from = %from, to = %status, "booking transitioned");
        guard.booking(&id).cloned().ok_or(SchedulingError::NotFound(id))
    }

    /// Cancel a confirmed booking and create its PENDING replacement at
    /// `new_start` as one WAL event. The replaced booking's own interval
    /// does not count against the new time.
    pub async fn reschedule(
        &self,
        tenant_id: Ulid,
        id: Ulid,
        expected_version: u64,
        new_start: Ms,
    ) -> Result<Rescheduled, SchedulingError> {
        let _gate = self.compaction_gate.read().await;
        let artisan = self.artisan_for_booking(&id)?;
        let mut guard = artisan.write().await;
        let original = guard
            .booking(&id)
            .cloned()
            .ok_or(SchedulingError::NotFound(id))?;
        check_booking_tenant(&original, tenant_id)?;
        check_version(&original, expected_version)?;
        let status = next_status(original.status, BookingAction::Reschedule)?;
        let span = validate_candidate(new_start, original.duration_minutes)?;
        check_no_conflict(&guard, &span, Some(id), self.config.require_open_hours)?;

        let now = now_ms();
        let replacement = Booking {
            id: Ulid::new(),
            scheduled_at: span.start,
            status,
            idempotency_key: None,
            created_at: now,
            updated_at: now,
            version: 1,
            note: None,
            rescheduled_from: Some(id),
            ..original.clone()
        };
        let event = Event::BookingRescheduled {
            id,
            artisan_id: guard.id,
            version: original.version + 1,
            at: now,
            replacement: replacement.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "action" => BookingAction::Reschedule.as_str())
            .increment(1);
        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);
        tracing::info!(
            booking_id = %id,
            replacement_id = %replacement.id,
            scheduled_at = replacement.scheduled_at,
            "booking rescheduled"
        );

        let previous = guard.booking(&id).cloned().ok_or(SchedulingError::NotFound(id))?;
        Ok(Rescheduled {
            previous,
            booking: replacement,
        })
    }

    /// Run the conflict check without inserting. The answer may be stale
    /// by the time a create arrives; only `create_booking` is authoritative.
    pub async fn check_availability(
        &self,
        tenant_id: Ulid,
        artisan_id: Ulid,
        start: Ms,
        duration_minutes: u32,
    ) -> Result<AvailabilityCheck, SchedulingError> {
        let span = validate_candidate(start, duration_minutes)?;
        let artisan = self.artisan(&artisan_id)?;
        let guard = artisan.read().await;
        if guard.tenant_id != tenant_id {
            return Err(SchedulingError::Forbidden(format!(
                "artisan {artisan_id} belongs to another tenant"
            )));
        }
        match check_no_conflict(&guard, &span, None, self.config.require_open_hours) {
            Ok(()) => Ok(AvailabilityCheck {
                available: true,
                conflicting_booking_id: None,
                reason: None,
            }),
            Err(SchedulingError::SlotConflict { booking_id, reason }) => Ok(AvailabilityCheck {
                available: false,
                conflicting_booking_id: booking_id,
                reason: Some(reason),
            }),
            Err(e) => Err(e),
        }
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, SchedulingError> {
        let artisan = self.artisan_for_booking(&id)?;
        let guard = artisan.read().await;
        guard.booking(&id).cloned().ok_or(SchedulingError::NotFound(id))
    }

    /// Bookings with one of `statuses` overlapping `span`.
    pub async fn list_overlapping(
        &self,
        artisan_id: Ulid,
        span: Span,
        statuses: &[BookingStatus],
    ) -> Result<Vec<Booking>, SchedulingError> {
        let artisan = self.artisan(&artisan_id)?;
        let guard = artisan.read().await;
        Ok(guard
            .overlapping(&span)
            .filter(|b| statuses.contains(&b.status))
            .cloned()
            .collect())
    }

    pub async fn snapshot(&self, artisan_id: Ulid, window: Span) -> Result<ScheduleSnapshot, SchedulingError> {
        let artisan = self.artisan(&artisan_id)?;
        let guard = artisan.read().await;
        Ok(ScheduleSnapshot {
            artisan_id,
            tenant_id: guard.tenant_id,
            utc_offset_minutes: guard.utc_offset_minutes,
            rules: guard.rules.clone(),
            bookings: guard.overlapping(&window).cloned().collect(),
        })
    }

    /// Every booking of an artisan overlapping `span`, any status.
    pub async fn artisan_schedule(
        &self,
        tenant_id: Ulid,
        artisan_id: Ulid,
        span: Span,
    ) -> Result<Vec<Booking>, SchedulingError> {
        let snapshot = self.snapshot(artisan_id, span).await?;
        if snapshot.tenant_id != tenant_id {
            return Err(SchedulingError::Forbidden(format!(
                "artisan {artisan_id} belongs to another tenant"
            )));
        }
        Ok(snapshot.bookings)
    }

    pub async fn list_bookings(&self, filter: &BookingFilter) -> Page<Booking> {
        let targets: Vec<SharedArtisanState> = match filter.artisan_id {
            Some(id) => self.artisans.get(&id).map(|e| e.value().clone()).into_iter().collect(),
            None => self.artisans.iter().map(|e| e.value().clone()).collect(),
        };

        let mut matched = Vec::new();
        for artisan in targets {
            let guard = artisan.read().await;
            if guard.tenant_id != filter.tenant_id {
                continue;
            }
            matched.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| filter.customer_id.is_none_or(|c| b.customer_id == c))
                    .filter(|b| filter.status.is_none_or(|s| b.status == s))
                    .cloned(),
            );
        }
        sort_bookings(&mut matched, filter.sort);

        let total = matched.len();
        let page_size = filter.page_size.max(1);
        let items = matched
            .into_iter()
            .skip(filter.page.saturating_sub(1) * page_size)
            .take(page_size)
            .collect();
        Page {
            items,
            page: filter.page,
            page_size,
            total,
        }
    }
}
