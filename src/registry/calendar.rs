use std::collections::BTreeMap;

use chrono::{Datelike, Days, Duration, NaiveDate, NaiveDateTime, NaiveTime};

use crate::limits::*;
use crate::model::{CalendarSnapshot, ResourceCalendar, SlotState, Stamp, WeekTemplate};

use super::TransitionError;

/// All slot starts the template generates in `[from_day, from_day + days)`,
/// ascending. Steps whole datetimes so windows near midnight cannot wrap.
pub fn materialize_starts(template: &WeekTemplate, from_day: NaiveDate, days: u32) -> Vec<Stamp> {
    let mut starts = Vec::new();
    for offset in 0..days {
        let Some(day) = from_day.checked_add_days(Days::new(offset as u64)) else {
            break;
        };
        for w in &template.windows {
            if w.weekday != day.weekday() || w.slot_minutes == 0 {
                continue;
            }
            let step = Duration::minutes(w.slot_minutes as i64);
            let mut cursor: NaiveDateTime = day.and_time(w.start);
            let window_end: NaiveDateTime = day.and_time(w.end);
            while cursor + step <= window_end {
                starts.push(cursor.and_utc());
                cursor += step;
            }
        }
    }
    starts.sort_unstable();
    starts.dedup();
    starts
}

/// Merge a calendar's template and overrides into the client-facing
/// snapshot over `days` days starting at `now`'s date. Template slots
/// default to available; expired holds read as available; live overrides
/// are listed even when the current template no longer generates them.
pub fn build_snapshot(cal: &ResourceCalendar, now: Stamp, days: u32) -> CalendarSnapshot {
    let from_day = now.date_naive();
    let mut slots: BTreeMap<Stamp, SlotState> = BTreeMap::new();

    for start in materialize_starts(&cal.template, from_day, days) {
        slots.insert(start, SlotState::Available);
    }

    let window_start = from_day.and_time(NaiveTime::MIN).and_utc();
    let window_end = from_day
        .checked_add_days(Days::new(days as u64))
        .unwrap_or(NaiveDate::MAX)
        .and_time(NaiveTime::MIN)
        .and_utc();
    for (start, ov) in cal.overrides.range(window_start..window_end) {
        match ov.state_at(now) {
            SlotState::Available => {} // expired hold — the template decides
            state => {
                slots.insert(*start, state);
            }
        }
    }

    CalendarSnapshot {
        resource_id: cal.id,
        generated_at: now,
        slots,
    }
}

/// Reject templates the registry cannot serve before anything is persisted.
pub fn validate_template(template: &WeekTemplate) -> Result<(), TransitionError> {
    if template.windows.len() > MAX_TEMPLATE_WINDOWS {
        return Err(TransitionError::LimitExceeded("too many template windows"));
    }
    for w in &template.windows {
        if w.slot_minutes < MIN_SLOT_MINUTES || w.slot_minutes > MAX_SLOT_MINUTES {
            return Err(TransitionError::InvalidTemplate("slot_minutes out of range"));
        }
        if w.start >= w.end {
            return Err(TransitionError::InvalidTemplate(
                "window start must be before end",
            ));
        }
    }
    for (i, a) in template.windows.iter().enumerate() {
        for b in template.windows.iter().skip(i + 1) {
            if a.weekday == b.weekday && a.start < b.end && b.start < a.end {
                return Err(TransitionError::InvalidTemplate(
                    "overlapping windows on the same weekday",
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HolderToken, SlotOverride, TemplateWindow};
    use chrono::{TimeZone, Utc, Weekday};
    use ulid::Ulid;

    // 2025-01-06 is a Monday.
    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 6).unwrap()
    }

    fn hms(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn window(weekday: Weekday, start: (u32, u32), end: (u32, u32), mins: u32) -> TemplateWindow {
        TemplateWindow {
            weekday,
            start: hms(start.0, start.1),
            end: hms(end.0, end.1),
            slot_minutes: mins,
        }
    }

    fn monday_morning() -> WeekTemplate {
        WeekTemplate {
            windows: vec![window(Weekday::Mon, (9, 0), (12, 0), 30)],
        }
    }

    #[test]
    fn empty_template_materializes_nothing() {
        let starts = materialize_starts(&WeekTemplate::default(), monday(), 7);
        assert!(starts.is_empty());
    }

    #[test]
    fn slots_fill_the_window() {
        let starts = materialize_starts(&monday_morning(), monday(), 1);
        assert_eq!(starts.len(), 6);
        assert_eq!(starts[0], Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap());
        assert_eq!(
            *starts.last().unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 6, 11, 30, 0).unwrap()
        );
    }

    #[test]
    fn last_slot_must_fit_before_window_end() {
        let t = WeekTemplate {
            windows: vec![window(Weekday::Mon, (9, 0), (10, 15), 30)],
        };
        // 9:00 and 9:30 fit; 10:00 would end at 10:30, past the window.
        let starts = materialize_starts(&t, monday(), 1);
        assert_eq!(starts.len(), 2);
    }

    #[test]
    fn weekly_recurrence_repeats_across_the_horizon() {
        let starts = materialize_starts(&monday_morning(), monday(), 7);
        assert_eq!(starts.len(), 6); // only one Monday in [Mon, Mon+7)

        let starts = materialize_starts(&monday_morning(), monday(), 8);
        assert_eq!(starts.len(), 12); // the next Monday enters the window
        assert_eq!(
            starts[6],
            Utc.with_ymd_and_hms(2025, 1, 13, 9, 0, 0).unwrap()
        );
    }

    #[test]
    fn windows_on_one_day_come_out_sorted() {
        let t = WeekTemplate {
            windows: vec![
                window(Weekday::Mon, (14, 0), (15, 0), 30),
                window(Weekday::Mon, (9, 0), (10, 0), 30),
            ],
        };
        let starts = materialize_starts(&t, monday(), 1);
        assert_eq!(starts.len(), 4);
        assert!(starts.windows(2).all(|p| p[0] < p[1]));
    }

    #[test]
    fn snapshot_decorates_template_slots_with_overrides() {
        let now = Utc.with_ymd_and_hms(2025, 1, 6, 8, 0, 0).unwrap();
        let mut cal = ResourceCalendar::new(Ulid::new());
        cal.template = monday_morning();
        let nine = Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap();
        let ten = Utc.with_ymd_and_hms(2025, 1, 6, 10, 0, 0).unwrap();
        cal.overrides.insert(
            nine,
            SlotOverride::Held {
                holder: HolderToken::new("alice"),
                held_at: now,
                expires_at: now + Duration::minutes(3),
            },
        );
        cal.overrides
            .insert(ten, SlotOverride::Booked { booking_id: Ulid::new() });

        let snap = build_snapshot(&cal, now, 1);
        assert_eq!(snap.slots.len(), 6);
        assert_eq!(snap.slots[&nine], SlotState::Held);
        assert_eq!(snap.slots[&ten], SlotState::Booked);
        let nine_thirty = Utc.with_ymd_and_hms(2025, 1, 6, 9, 30, 0).unwrap();
        assert_eq!(snap.slots[&nine_thirty], SlotState::Available);
    }

    #[test]
    fn snapshot_reads_expired_holds_as_available() {
        let now = Utc.with_ymd_and_hms(2025, 1, 6, 8, 0, 0).unwrap();
        let mut cal = ResourceCalendar::new(Ulid::new());
        cal.template = monday_morning();
        let nine = Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap();
        cal.overrides.insert(
            nine,
            SlotOverride::Held {
                holder: HolderToken::new("alice"),
                held_at: now - Duration::minutes(10),
                expires_at: now - Duration::minutes(7),
            },
        );

        let snap = build_snapshot(&cal, now, 1);
        assert_eq!(snap.slots[&nine], SlotState::Available);
    }

    #[test]
    fn snapshot_lists_live_overrides_outside_the_template() {
        // Booked on a Tuesday while the template only covers Mondays.
        let now = Utc.with_ymd_and_hms(2025, 1, 6, 8, 0, 0).unwrap();
        let mut cal = ResourceCalendar::new(Ulid::new());
        cal.template = monday_morning();
        let tuesday = Utc.with_ymd_and_hms(2025, 1, 7, 9, 0, 0).unwrap();
        cal.overrides
            .insert(tuesday, SlotOverride::Booked { booking_id: Ulid::new() });

        let snap = build_snapshot(&cal, now, 7);
        assert_eq!(snap.slots[&tuesday], SlotState::Booked);
    }

    #[test]
    fn snapshot_ignores_overrides_past_the_horizon() {
        let now = Utc.with_ymd_and_hms(2025, 1, 6, 8, 0, 0).unwrap();
        let mut cal = ResourceCalendar::new(Ulid::new());
        let far = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        cal.overrides
            .insert(far, SlotOverride::Booked { booking_id: Ulid::new() });

        let snap = build_snapshot(&cal, now, 7);
        assert!(snap.slots.is_empty());
    }

    #[test]
    fn validate_accepts_a_sane_template() {
        assert!(validate_template(&monday_morning()).is_ok());
    }

    #[test]
    fn validate_rejects_bad_slot_minutes() {
        let t = WeekTemplate {
            windows: vec![window(Weekday::Mon, (9, 0), (12, 0), 3)],
        };
        assert!(matches!(
            validate_template(&t),
            Err(TransitionError::InvalidTemplate(_))
        ));
        let t = WeekTemplate {
            windows: vec![window(Weekday::Mon, (0, 0), (23, 59), 481)],
        };
        assert!(matches!(
            validate_template(&t),
            Err(TransitionError::InvalidTemplate(_))
        ));
    }

    #[test]
    fn validate_rejects_inverted_windows() {
        let t = WeekTemplate {
            windows: vec![window(Weekday::Mon, (12, 0), (9, 0), 30)],
        };
        assert!(matches!(
            validate_template(&t),
            Err(TransitionError::InvalidTemplate(_))
        ));
    }

    #[test]
    fn validate_rejects_overlapping_windows_on_a_weekday() {
        let t = WeekTemplate {
            windows: vec![
                window(Weekday::Mon, (9, 0), (12, 0), 30),
                window(Weekday::Mon, (11, 0), (14, 0), 30),
            ],
        };
        assert!(matches!(
            validate_template(&t),
            Err(TransitionError::InvalidTemplate(_))
        ));

        // Same hours on another weekday are fine
        let t = WeekTemplate {
            windows: vec![
                window(Weekday::Mon, (9, 0), (12, 0), 30),
                window(Weekday::Tue, (11, 0), (14, 0), 30),
            ],
        };
        assert!(validate_template(&t).is_ok());
    }

    #[test]
    fn validate_rejects_too_many_windows() {
        let t = WeekTemplate {
            windows: (0..=MAX_TEMPLATE_WINDOWS)
                .map(|i| window(Weekday::Mon, (9, 0), (12, 0), 30 + i as u32))
                .collect(),
        };
        assert!(matches!(
            validate_template(&t),
            Err(TransitionError::LimitExceeded(_))
        ));
    }
}
