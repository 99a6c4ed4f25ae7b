use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::SchedulingError;
use super::slots::{overlaps_blocked, within_open_hours};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Shape checks on a candidate booking interval.
pub(crate) fn validate_candidate(start: Ms, duration_minutes: u32) -> Result<Span, SchedulingError> {
    if duration_minutes == 0 {
        return Err(SchedulingError::Validation("duration must be positive".into()));
    }
    if duration_minutes > MAX_BOOKING_MINUTES {
        return Err(SchedulingError::LimitExceeded("booking too long"));
    }
    if start.rem_euclid(MINUTE_MS) != 0 {
        return Err(SchedulingError::Validation(
            "scheduled_at must fall on a whole minute".into(),
        ));
    }
    let span = Span::from_minutes(start, duration_minutes);
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(SchedulingError::LimitExceeded("timestamp out of range"));
    }
    Ok(span)
}

/// The double-booking check. Callers must hold the artisan's write lock
/// from this call through the insert so the pair is atomic.
///
/// `ignore` names a booking being replaced (reschedule) whose own
/// interval must not count against its successor.
pub(crate) fn check_no_conflict(
    artisan: &ArtisanState,
    span: &Span,
    ignore: Option<Ulid>,
    require_open_hours: bool,
) -> Result<(), SchedulingError> {
    if let Some(existing) = artisan
        .active_overlapping(span)
        .find(|b| Some(b.id) != ignore)
    {
        return Err(SchedulingError::SlotConflict {
            booking_id: Some(existing.id),
            reason: "overlaps an active booking",
        });
    }
    if overlaps_blocked(&artisan.rules, span, artisan.utc_offset_minutes) {
        return Err(SchedulingError::SlotConflict {
            booking_id: None,
            reason: "overlaps a blocked period",
        });
    }
    if require_open_hours && !within_open_hours(&artisan.rules, span, artisan.utc_offset_minutes) {
        return Err(SchedulingError::SlotConflict {
            booking_id: None,
            reason: "outside the artisan's open hours",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::slots::local_midnight;
    use chrono::NaiveDate;

    const H: Ms = 3_600_000;

    fn day() -> Ms {
        local_midnight(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), 0)
    }

    fn artisan_open_nine_to_five() -> ArtisanState {
        let mut a = ArtisanState::new(Ulid::new(), Ulid::new(), None, 0);
        a.upsert_rule(AvailabilityRule {
            id: Ulid::new(),
            artisan_id: a.id,
            day_of_week: Some(1),
            start_minute: 9 * 60,
            end_minute: 17 * 60,
            valid_from: None,
            valid_to: None,
            kind: RuleKind::Recurring,
            created_at: 0,
            updated_at: 0,
        });
        a
    }

    fn booking(artisan: &ArtisanState, start: Ms, minutes: u32, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            tenant_id: artisan.tenant_id,
            artisan_id: artisan.id,
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

    #[test]
    fn overlap_with_active_booking_names_it() {
        let mut a = artisan_open_nine_to_five();
        let existing = booking(&a, day() + 10 * H, 60, BookingStatus::Confirmed);
        let existing_id = existing.id;
        a.insert_booking(existing);

        let err = check_no_conflict(&a, &Span::from_minutes(day() + 10 * H + 30 * MINUTE_MS, 60), None, true)
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulingError::SlotConflict { booking_id: Some(id), .. } if id == existing_id
        ));
    }

    #[test]
    fn cancelled_bookings_free_their_time() {
        let mut a = artisan_open_nine_to_five();
        a.insert_booking(booking(&a, day() + 10 * H, 60, BookingStatus::Cancelled));
        assert!(check_no_conflict(&a, &Span::from_minutes(day() + 10 * H, 60), None, true).is_ok());
    }

    #[test]
    fn adjacent_bookings_do_not_conflict() {
        let mut a = artisan_open_nine_to_five();
        a.insert_booking(booking(&a, day() + 10 * H, 60, BookingStatus::Pending));
        assert!(check_no_conflict(&a, &Span::from_minutes(day() + 11 * H, 60), None, true).is_ok());
        assert!(check_no_conflict(&a, &Span::from_minutes(day() + 9 * H, 60), None, true).is_ok());
    }

    #[test]
    fn ignored_booking_does_not_block_its_replacement() {
        let mut a = artisan_open_nine_to_five();
        let old = booking(&a, day() + 10 * H, 60, BookingStatus::Confirmed);
        let old_id = old.id;
        a.insert_booking(old);
        let shifted = Span::from_minutes(day() + 10 * H + 30 * MINUTE_MS, 60);
        assert!(check_no_conflict(&a, &shifted, None, true).is_err());
        assert!(check_no_conflict(&a, &shifted, Some(old_id), true).is_ok());
    }

    #[test]
    fn outside_open_hours_only_when_required() {
        let a = artisan_open_nine_to_five();
        let evening = Span::from_minutes(day() + 18 * H, 60);
        assert!(matches!(
            check_no_conflict(&a, &evening, None, true),
            Err(SchedulingError::SlotConflict { booking_id: None, .. })
        ));
        assert!(check_no_conflict(&a, &evening, None, false).is_ok());
    }

    #[test]
    fn candidate_validation() {
        assert!(validate_candidate(day(), 0).is_err());
        assert!(validate_candidate(day() + 1_000, 30).is_err());
        assert!(matches!(
            validate_candidate(day(), MAX_BOOKING_MINUTES + 1),
            Err(SchedulingError::LimitExceeded(_))
        ));
        assert_eq!(validate_candidate(day(), 30).unwrap(), Span::from_minutes(day(), 30));
    }
}
