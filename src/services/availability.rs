use std::collections::HashSet;

use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;
use rusqlite::Connection;

use crate::db::queries;
use crate::models::{BusinessProfile, CalendarSlot, TimePreference};

/// Open slots for a business, optionally narrowed by a caller preference.
///
/// Candidates are already filtered in SQL to available, unblocked, future
/// slots with no active-appointment overlap; this layer deduplicates by
/// start instant and applies the preference in the business's timezone.
/// An empty result is a normal value, never an error.
pub fn find_open_slots(
    conn: &Connection,
    business: &BusinessProfile,
    preference: Option<&TimePreference>,
    now: DateTime<Utc>,
    limit: usize,
) -> anyhow::Result<Vec<CalendarSlot>> {
    let tz = business.tz()?;
    let candidates = queries::open_slots(conn, &business.id, now)?;

    let mut seen_starts = HashSet::new();
    let mut matches = Vec::new();
    for slot in candidates {
        if !seen_starts.insert(slot.start_at) {
            continue;
        }
        if let Some(pref) = preference {
            if !matches_preference(&slot, pref, &tz) {
                continue;
            }
        }
        matches.push(slot);
        if matches.len() >= limit {
            break;
        }
    }
    Ok(matches)
}

fn matches_preference(slot: &CalendarSlot, pref: &TimePreference, tz: &Tz) -> bool {
    let local = slot.local_start(tz);

    if let Some(date) = pref.date {
        if local.date_naive() != date {
            return false;
        }
    }
    if let Some(weekday) = pref.weekday() {
        if local.weekday() != weekday {
            return false;
        }
    }
    if let Some(bucket) = &pref.bucket {
        if !bucket.contains(local.time()) {
            return false;
        }
    }
    if let Some(time) = pref.time {
        if local.time().hour() != time.hour() || local.time().minute() != time.minute() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::{
        Appointment, AppointmentStatus, DayWindow, Service, TimeBucket, WeeklyHours,
    };
    use chrono::NaiveDate;

    fn ts(s: &str) -> DateTime<Utc> {
        queries::parse_ts(s).unwrap()
    }

    fn business() -> BusinessProfile {
        BusinessProfile {
            id: "biz-1".to_string(),
            name: "Main Street Barbers".to_string(),
            phone_number: "+15550001111".to_string(),
            timezone: "America/New_York".to_string(),
            hours: WeeklyHours {
                days: ["mon", "tue", "wed", "thu", "fri"]
                    .iter()
                    .map(|d| DayWindow {
                        day: d.to_string(),
                        open: "08:00".to_string(),
                        close: "18:00".to_string(),
                    })
                    .collect(),
            },
            services: vec![Service {
                id: "cut".to_string(),
                name: "Haircut".to_string(),
                duration_minutes: 60,
                keywords: vec![],
            }],
            slot_minutes: 60,
            notify_phone: String::new(),
            transfer_phone: None,
        }
    }

    fn seed_day(conn: &Connection, business: &BusinessProfile, date: NaiveDate) {
        crate::services::generator::generate(conn, business, date, 1).unwrap();
    }

    fn appointment(start: &str, end: &str, status: AppointmentStatus) -> Appointment {
        let now = ts("2026-08-01T00:00:00Z");
        Appointment {
            id: uuid::Uuid::new_v4().to_string(),
            business_id: "biz-1".to_string(),
            customer_name: Some("Alice".to_string()),
            customer_phone: "+15551110000".to_string(),
            service_id: "cut".to_string(),
            start_at: ts(start),
            end_at: ts(end),
            status,
            source: "phone".to_string(),
            call_id: None,
            idempotency_key: None,
            created_at: now,
            updated_at: now,
        }
    }

    // 2026-08-03 is a Monday; EDT is UTC-4, so 08:00 local = 12:00Z.

    #[test]
    fn test_tomorrow_morning_scenario() {
        let conn = db::init_db(":memory:").unwrap();
        let biz = business();
        // caller is on the phone Monday; "tomorrow morning" is Tuesday
        seed_day(&conn, &biz, NaiveDate::from_ymd_opt(2026, 8, 4).unwrap());

        let pref = TimePreference {
            date: NaiveDate::from_ymd_opt(2026, 8, 4),
            bucket: Some(TimeBucket::Morning),
            ..Default::default()
        };
        let now = ts("2026-08-03T16:00:00Z");
        let slots = find_open_slots(&conn, &biz, Some(&pref), now, 10).unwrap();

        let tz: Tz = "America/New_York".parse().unwrap();
        let local_starts: Vec<String> = slots
            .iter()
            .map(|s| s.local_start(&tz).format("%H:%M").to_string())
            .collect();
        assert_eq!(local_starts, vec!["08:00", "09:00", "10:00", "11:00"]);
    }

    #[test]
    fn test_booked_slot_excluded() {
        let conn = db::init_db(":memory:").unwrap();
        let biz = business();
        seed_day(&conn, &biz, NaiveDate::from_ymd_opt(2026, 8, 4).unwrap());

        // 09:00-10:00 local Tuesday = 13:00-14:00Z
        queries::create_appointment(
            &conn,
            &appointment(
                "2026-08-04T13:00:00Z",
                "2026-08-04T14:00:00Z",
                AppointmentStatus::Confirmed,
            ),
        )
        .unwrap();

        let pref = TimePreference {
            date: NaiveDate::from_ymd_opt(2026, 8, 4),
            bucket: Some(TimeBucket::Morning),
            ..Default::default()
        };
        let now = ts("2026-08-03T16:00:00Z");
        let slots = find_open_slots(&conn, &biz, Some(&pref), now, 10).unwrap();

        let tz: Tz = "America/New_York".parse().unwrap();
        let local_starts: Vec<String> = slots
            .iter()
            .map(|s| s.local_start(&tz).format("%H:%M").to_string())
            .collect();
        assert_eq!(local_starts, vec!["08:00", "10:00", "11:00"]);
    }

    #[test]
    fn test_cancelled_appointment_does_not_block() {
        let conn = db::init_db(":memory:").unwrap();
        let biz = business();
        seed_day(&conn, &biz, NaiveDate::from_ymd_opt(2026, 8, 4).unwrap());

        queries::create_appointment(
            &conn,
            &appointment(
                "2026-08-04T13:00:00Z",
                "2026-08-04T14:00:00Z",
                AppointmentStatus::Cancelled,
            ),
        )
        .unwrap();

        let pref = TimePreference {
            date: NaiveDate::from_ymd_opt(2026, 8, 4),
            bucket: Some(TimeBucket::Morning),
            ..Default::default()
        };
        let slots =
            find_open_slots(&conn, &biz, Some(&pref), ts("2026-08-03T16:00:00Z"), 10).unwrap();
        assert_eq!(slots.len(), 4);
    }

    #[test]
    fn test_partial_overlap_excluded() {
        let conn = db::init_db(":memory:").unwrap();
        let biz = business();
        seed_day(&conn, &biz, NaiveDate::from_ymd_opt(2026, 8, 4).unwrap());

        // 90-minute appointment 09:30-11:00 local overlaps both the 09:00
        // and 10:00 slots on the half-open test
        queries::create_appointment(
            &conn,
            &appointment(
                "2026-08-04T13:30:00Z",
                "2026-08-04T15:00:00Z",
                AppointmentStatus::Scheduled,
            ),
        )
        .unwrap();

        let pref = TimePreference {
            date: NaiveDate::from_ymd_opt(2026, 8, 4),
            bucket: Some(TimeBucket::Morning),
            ..Default::default()
        };
        let slots =
            find_open_slots(&conn, &biz, Some(&pref), ts("2026-08-03T16:00:00Z"), 10).unwrap();

        let tz: Tz = "America/New_York".parse().unwrap();
        let local_starts: Vec<String> = slots
            .iter()
            .map(|s| s.local_start(&tz).format("%H:%M").to_string())
            .collect();
        assert_eq!(local_starts, vec!["08:00", "11:00"]);
    }

    #[test]
    fn test_past_slots_excluded() {
        let conn = db::init_db(":memory:").unwrap();
        let biz = business();
        seed_day(&conn, &biz, NaiveDate::from_ymd_opt(2026, 8, 4).unwrap());

        // mid-morning Tuesday: 09:30 local
        let now = ts("2026-08-04T13:30:00Z");
        let slots = find_open_slots(&conn, &biz, None, now, 50).unwrap();

        assert!(slots.iter().all(|s| s.start_at >= now));
        let tz: Tz = "America/New_York".parse().unwrap();
        assert_eq!(
            slots[0].local_start(&tz).format("%H:%M").to_string(),
            "10:00"
        );
    }

    #[test]
    fn test_weekday_filter() {
        let conn = db::init_db(":memory:").unwrap();
        let biz = business();
        // Tuesday and Wednesday
        seed_day(&conn, &biz, NaiveDate::from_ymd_opt(2026, 8, 4).unwrap());
        seed_day(&conn, &biz, NaiveDate::from_ymd_opt(2026, 8, 5).unwrap());

        let pref = TimePreference {
            weekday: Some("wed".to_string()),
            ..Default::default()
        };
        let slots =
            find_open_slots(&conn, &biz, Some(&pref), ts("2026-08-03T16:00:00Z"), 50).unwrap();

        let tz: Tz = "America/New_York".parse().unwrap();
        assert!(!slots.is_empty());
        assert!(slots
            .iter()
            .all(|s| s.local_start(&tz).weekday() == chrono::Weekday::Wed));
    }

    #[test]
    fn test_explicit_time_filter() {
        let conn = db::init_db(":memory:").unwrap();
        let biz = business();
        seed_day(&conn, &biz, NaiveDate::from_ymd_opt(2026, 8, 4).unwrap());
        seed_day(&conn, &biz, NaiveDate::from_ymd_opt(2026, 8, 5).unwrap());

        let pref = TimePreference {
            time: chrono::NaiveTime::from_hms_opt(14, 0, 0),
            ..Default::default()
        };
        let slots =
            find_open_slots(&conn, &biz, Some(&pref), ts("2026-08-03T16:00:00Z"), 50).unwrap();

        let tz: Tz = "America/New_York".parse().unwrap();
        assert_eq!(slots.len(), 2);
        assert!(slots
            .iter()
            .all(|s| s.local_start(&tz).format("%H:%M").to_string() == "14:00"));
    }

    #[test]
    fn test_no_match_returns_empty_not_error() {
        let conn = db::init_db(":memory:").unwrap();
        let biz = business();

        let slots = find_open_slots(&conn, &biz, None, ts("2026-08-03T16:00:00Z"), 10).unwrap();
        assert!(slots.is_empty());
    }

    #[test]
    fn test_chronological_ordering() {
        let conn = db::init_db(":memory:").unwrap();
        let biz = business();
        seed_day(&conn, &biz, NaiveDate::from_ymd_opt(2026, 8, 5).unwrap());
        seed_day(&conn, &biz, NaiveDate::from_ymd_opt(2026, 8, 4).unwrap());

        let slots = find_open_slots(&conn, &biz, None, ts("2026-08-03T16:00:00Z"), 100).unwrap();
        assert!(slots.windows(2).all(|w| w[0].start_at <= w[1].start_at));
    }
}
