use chrono::{Datelike, NaiveDate};

use crate::model::*;

// ── Slot generation ──────────────────────────────────────────────
//
// Rules are provider-local (minute of day, local date); bookings are
// absolute. Conversion happens here and nowhere else.

/// Days from 0001-01-01 (CE day 1) to 1970-01-01.
const UNIX_EPOCH_CE_DAYS: i64 = 719_163;

/// Absolute instant of local midnight starting `date`.
pub fn local_midnight(date: NaiveDate, utc_offset_minutes: i32) -> Ms {
    (date.num_days_from_ce() as i64 - UNIX_EPOCH_CE_DAYS) * DAY_MS
        - utc_offset_minutes as Ms * MINUTE_MS
}

/// Provider-local calendar date containing the instant `t`.
pub fn local_date(t: Ms, utc_offset_minutes: i32) -> Option<NaiveDate> {
    let days = (t + utc_offset_minutes as Ms * MINUTE_MS).div_euclid(DAY_MS);
    i32::try_from(days + UNIX_EPOCH_CE_DAYS)
        .ok()
        .and_then(NaiveDate::from_num_days_from_ce_opt)
}

/// Absolute window `[local midnight, next local midnight)` of `date`.
pub fn local_day_window(date: NaiveDate, utc_offset_minutes: i32) -> Span {
    let start = local_midnight(date, utc_offset_minutes);
    Span::new(start, start + DAY_MS)
}

fn rule_span(rule: &AvailabilityRule, date: NaiveDate, utc_offset_minutes: i32) -> Option<Span> {
    let midnight = local_midnight(date, utc_offset_minutes);
    let start = midnight + rule.start_minute as Ms * MINUTE_MS;
    let end = midnight + rule.end_minute as Ms * MINUTE_MS;
    (start < end).then(|| Span::new(start, end))
}

fn spans_of_kind(
    rules: &[AvailabilityRule],
    kind: RuleKind,
    date: NaiveDate,
    utc_offset_minutes: i32,
) -> Vec<Span> {
    let mut spans: Vec<Span> = rules
        .iter()
        .filter(|r| r.kind == kind && r.applies_on(date))
        .filter_map(|r| rule_span(r, date, utc_offset_minutes))
        .collect();
    spans.sort_by_key(|s| s.start);
    merge_overlapping(&spans)
}

/// Blocked ranges for one local date, sorted and merged.
pub fn blocked_spans(rules: &[AvailabilityRule], date: NaiveDate, utc_offset_minutes: i32) -> Vec<Span> {
    spans_of_kind(rules, RuleKind::OverrideBlocked, date, utc_offset_minutes)
}

/// Open hours for one local date: (recurring ∪ override-open) − override-blocked.
/// Blocked always wins, whatever it overlaps.
pub fn open_spans(rules: &[AvailabilityRule], date: NaiveDate, utc_offset_minutes: i32) -> Vec<Span> {
    let mut open = spans_of_kind(rules, RuleKind::Recurring, date, utc_offset_minutes);
    open.extend(spans_of_kind(rules, RuleKind::OverrideOpen, date, utc_offset_minutes));
    open.sort_by_key(|s| s.start);
    let open = merge_overlapping(&open);

    let blocked = blocked_spans(rules, date, utc_offset_minutes);
    if blocked.is_empty() {
        open
    } else {
        subtract_intervals(&open, &blocked)
    }
}

/// Local dates touched by an absolute span.
fn dates_touched(span: &Span, utc_offset_minutes: i32) -> Vec<NaiveDate> {
    let (Some(first), Some(last)) = (
        local_date(span.start, utc_offset_minutes),
        local_date(span.end - 1, utc_offset_minutes),
    ) else {
        return Vec::new();
    };
    first.iter_days().take_while(|d| *d <= last).collect()
}

/// Whether `span` lies entirely inside the open hours. Adjacent days are
/// unioned first, so a booking may run across midnight only when both
/// days are open at the boundary.
pub fn within_open_hours(rules: &[AvailabilityRule], span: &Span, utc_offset_minutes: i32) -> bool {
    let mut open: Vec<Span> = dates_touched(span, utc_offset_minutes)
        .into_iter()
        .flat_map(|d| open_spans(rules, d, utc_offset_minutes))
        .collect();
    open.sort_by_key(|s| s.start);
    let open = merge_overlapping(&open);
    subtract_intervals(&[*span], &open).is_empty()
}

/// Whether any blocked override intersects `span`.
pub fn overlaps_blocked(rules: &[AvailabilityRule], span: &Span, utc_offset_minutes: i32) -> bool {
    dates_touched(span, utc_offset_minutes)
        .into_iter()
        .flat_map(|d| blocked_spans(rules, d, utc_offset_minutes))
        .any(|b| b.overlaps(span))
}

/// Cut free intervals into fixed-width slots, left-aligned at each
/// interval's start; a remainder shorter than `slot_ms` is dropped.
pub fn quantize(free: &[Span], slot_ms: Ms) -> Vec<Span> {
    let mut slots = Vec::new();
    if slot_ms <= 0 {
        return slots;
    }
    for span in free {
        let mut t = span.start;
        while t + slot_ms <= span.end {
            slots.push(Span::new(t, t + slot_ms));
            t += slot_ms;
        }
    }
    slots
}

/// Sorted, merged active-booking spans restricted to `window`.
fn bookings_in(merged_bookings: &[Span], window: &Span) -> Vec<Span> {
    let right = merged_bookings.partition_point(|b| b.start < window.end);
    let left = merged_bookings[..right].partition_point(|b| b.end <= window.start);
    merged_bookings[left..right].to_vec()
}

fn merged(bookings: &[Span]) -> Vec<Span> {
    let mut sorted = bookings.to_vec();
    sorted.sort_by_key(|s| s.start);
    merge_overlapping(&sorted)
}

/// Free, bookable slots for each local date in `[from, to]`.
///
/// Per day: open hours minus active bookings, then quantized. Days are
/// processed independently and never merged across midnight.
pub fn generate_slots(
    rules: &[AvailabilityRule],
    bookings: &[Span],
    from: NaiveDate,
    to: NaiveDate,
    slot_minutes: u32,
    utc_offset_minutes: i32,
) -> Vec<TimeSlot> {
    let slot_ms = slot_minutes as Ms * MINUTE_MS;
    let bookings = merged(bookings);
    let mut slots = Vec::new();

    for date in from.iter_days().take_while(|d| *d <= to) {
        let open = open_spans(rules, date, utc_offset_minutes);
        if open.is_empty() {
            continue;
        }
        let busy = bookings_in(&bookings, &local_day_window(date, utc_offset_minutes));
        let free = if busy.is_empty() {
            open
        } else {
            subtract_intervals(&open, &busy)
        };
        slots.extend(quantize(&free, slot_ms).into_iter().map(|s| TimeSlot {
            start: s.start,
            end: s.end,
            available: true,
        }));
    }
    slots
}

/// The fixed slot grid over open hours, with slots overlapping an active
/// booking marked unavailable.
pub fn slot_grid(
    rules: &[AvailabilityRule],
    bookings: &[Span],
    from: NaiveDate,
    to: NaiveDate,
    slot_minutes: u32,
    utc_offset_minutes: i32,
) -> Vec<TimeSlot> {
    let slot_ms = slot_minutes as Ms * MINUTE_MS;
    let bookings = merged(bookings);
    let mut slots = Vec::new();

    for date in from.iter_days().take_while(|d| *d <= to) {
        let open = open_spans(rules, date, utc_offset_minutes);
        for s in quantize(&open, slot_ms) {
            let available = bookings_in(&bookings, &s).is_empty();
            slots.push(TimeSlot {
                start: s.start,
                end: s.end,
                available,
            });
        }
    }
    slots
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base − to_remove`; both inputs sorted by start. Empty pieces vanish.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < b.end {
            result.push(Span::new(current_start, b.end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const H: Ms = 3_600_000;

    // 2024-01-01 is a Monday.
    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    fn rule(kind: RuleKind, dow: Option<u8>, start_h: u16, end_h: u16) -> AvailabilityRule {
        AvailabilityRule {
            id: Ulid::new(),
            artisan_id: Ulid::nil(),
            day_of_week: dow,
            start_minute: start_h * 60,
            end_minute: end_h * 60,
            valid_from: None,
            valid_to: None,
            kind,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn on(mut r: AvailabilityRule, date: NaiveDate) -> AvailabilityRule {
        r.valid_from = Some(date);
        r.valid_to = Some(date);
        r
    }

    fn starts(slots: &[TimeSlot], day_start: Ms) -> Vec<Ms> {
        slots.iter().map(|s| (s.start - day_start) / H).collect()
    }

    #[test]
    fn local_midnight_round_trips() {
        let d = monday();
        assert_eq!(local_midnight(d, 0), 1_704_067_200_000);
        // UTC+2: local midnight is 22:00 UTC the previous day.
        assert_eq!(local_midnight(d, 120), 1_704_067_200_000 - 2 * H);
        assert_eq!(local_date(local_midnight(d, 120), 120), Some(d));
        assert_eq!(local_date(local_midnight(d, -300) - 1, -300), d.pred_opt());
    }

    #[test]
    fn monday_morning_hourly_slots() {
        let rules = vec![rule(RuleKind::Recurring, Some(1), 9, 12)];
        let day = local_midnight(monday(), 0);

        let slots = generate_slots(&rules, &[], monday(), monday(), 60, 0);
        assert_eq!(starts(&slots, day), vec![9, 10, 11]);
        assert!(slots.iter().all(|s| s.available && s.end - s.start == H));

        let booked = [Span::new(day + 10 * H, day + 11 * H)];
        let slots = generate_slots(&rules, &booked, monday(), monday(), 60, 0);
        assert_eq!(starts(&slots, day), vec![9, 11]);
    }

    #[test]
    fn blocked_override_carves_lunch() {
        let rules = vec![
            rule(RuleKind::Recurring, Some(1), 9, 17),
            on(rule(RuleKind::OverrideBlocked, None, 12, 13), monday()),
        ];
        let day = local_midnight(monday(), 0);
        let slots = generate_slots(&rules, &[], monday(), monday(), 30, 0);
        assert_eq!(slots.len(), 14);
        let lunch = Span::new(day + 12 * H, day + 13 * H);
        assert!(slots.iter().all(|s| !lunch.contains_instant(s.start)));
    }

    #[test]
    fn blocked_beats_override_open() {
        let rules = vec![
            on(rule(RuleKind::OverrideOpen, None, 18, 20), monday()),
            on(rule(RuleKind::OverrideBlocked, None, 19, 21), monday()),
        ];
        let day = local_midnight(monday(), 0);
        let open = open_spans(&rules, monday(), 0);
        assert_eq!(open, vec![Span::new(day + 18 * H, day + 19 * H)]);
    }

    #[test]
    fn override_open_extends_recurring_hours() {
        let rules = vec![
            rule(RuleKind::Recurring, Some(1), 9, 12),
            on(rule(RuleKind::OverrideOpen, None, 11, 14), monday()),
        ];
        let day = local_midnight(monday(), 0);
        assert_eq!(open_spans(&rules, monday(), 0), vec![Span::new(day + 9 * H, day + 14 * H)]);
        // Not in scope the next week.
        let next = monday() + chrono::Days::new(7);
        let day = local_midnight(next, 0);
        assert_eq!(open_spans(&rules, next, 0), vec![Span::new(day + 9 * H, day + 12 * H)]);
    }

    #[test]
    fn remainder_shorter_than_slot_is_dropped() {
        let mut r = rule(RuleKind::Recurring, Some(1), 9, 10);
        r.end_minute = 10 * 60 + 50;
        let slots = generate_slots(&[r], &[], monday(), monday(), 60, 0);
        assert_eq!(slots.len(), 1);
    }

    #[test]
    fn booking_shifts_alignment_of_free_interval() {
        let rules = vec![rule(RuleKind::Recurring, Some(1), 9, 12)];
        let day = local_midnight(monday(), 0);
        let booked = [Span::new(day + 9 * H + 30 * MINUTE_MS, day + 10 * H + 30 * MINUTE_MS)];
        let slots = generate_slots(&rules, &booked, monday(), monday(), 60, 0);
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].start, day + 10 * H + 30 * MINUTE_MS);
    }

    #[test]
    fn grid_marks_booked_slots_unavailable() {
        let rules = vec![rule(RuleKind::Recurring, Some(1), 9, 12)];
        let day = local_midnight(monday(), 0);
        let booked = [Span::new(day + 10 * H, day + 10 * H + 15 * MINUTE_MS)];
        let grid = slot_grid(&rules, &booked, monday(), monday(), 60, 0);
        let flags: Vec<bool> = grid.iter().map(|s| s.available).collect();
        assert_eq!(flags, vec![true, false, true]);
    }

    #[test]
    fn offset_shifts_absolute_slots() {
        let rules = vec![rule(RuleKind::Recurring, Some(1), 9, 10)];
        let utc = generate_slots(&rules, &[], monday(), monday(), 60, 0);
        let plus_two = generate_slots(&rules, &[], monday(), monday(), 60, 120);
        assert_eq!(utc[0].start - plus_two[0].start, 2 * H);
    }

    #[test]
    fn days_are_not_merged_across_midnight() {
        let mut late = rule(RuleKind::Recurring, Some(1), 23, 24);
        late.end_minute = MINUTES_PER_DAY;
        let early = rule(RuleKind::Recurring, Some(2), 0, 1);
        let tuesday = monday().succ_opt().unwrap();
        let slots = generate_slots(&[late.clone(), early.clone()], &[], monday(), tuesday, 120, 0);
        assert!(slots.is_empty());

        // An explicit booking may still run across a boundary open on both sides.
        let midnight = local_midnight(tuesday, 0);
        let span = Span::new(midnight - H, midnight + H);
        assert!(within_open_hours(&[late, early], &span, 0));
    }

    #[test]
    fn multi_day_range_is_chronological() {
        let rules = vec![
            rule(RuleKind::Recurring, Some(1), 9, 10),
            rule(RuleKind::Recurring, Some(3), 9, 10),
        ];
        let end = monday() + chrono::Days::new(6);
        let slots = generate_slots(&rules, &[], monday(), end, 60, 0);
        assert_eq!(slots.len(), 2);
        assert!(slots[0].start < slots[1].start);
        assert_eq!(slots[1].start - slots[0].start, 2 * 24 * H);
    }

    #[test]
    fn within_open_hours_and_blocked_checks() {
        let rules = vec![
            rule(RuleKind::Recurring, Some(1), 9, 17),
            on(rule(RuleKind::OverrideBlocked, None, 12, 13), monday()),
        ];
        let day = local_midnight(monday(), 0);
        assert!(within_open_hours(&rules, &Span::new(day + 9 * H, day + 10 * H), 0));
        assert!(!within_open_hours(&rules, &Span::new(day + 8 * H, day + 10 * H), 0));
        assert!(!within_open_hours(&rules, &Span::new(day + 11 * H, day + 13 * H), 0));
        assert!(overlaps_blocked(&rules, &Span::new(day + 11 * H, day + 13 * H), 0));
        assert!(!overlaps_blocked(&rules, &Span::new(day + 13 * H, day + 14 * H), 0));
    }

    #[test]
    fn subtract_and_merge_basics() {
        assert_eq!(
            subtract_intervals(&[Span::new(0, 1000)], &[Span::new(100, 200), Span::new(400, 500)]),
            vec![Span::new(0, 100), Span::new(200, 400), Span::new(500, 1000)]
        );
        assert!(subtract_intervals(&[Span::new(100, 200)], &[Span::new(50, 250)]).is_empty());
        assert_eq!(
            merge_overlapping(&[Span::new(100, 200), Span::new(200, 300), Span::new(500, 600)]),
            vec![Span::new(100, 300), Span::new(500, 600)]
        );
    }
}
