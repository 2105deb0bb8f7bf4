use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use rusqlite::Connection;

use crate::db::queries;
use crate::models::{BusinessProfile, CalendarSlot};

#[derive(Debug, Default)]
pub struct GenerationOutcome {
    pub created: usize,
    pub removed: usize,
}

/// Populate slot inventory for `days` local calendar days starting at
/// `start` (a business-local date).
///
/// Boundaries go through the timezone table for each date, so offsets
/// track daylight-saving transitions. A local time swallowed by a
/// spring-forward gap yields no slot; a fall-back ambiguity resolves to
/// the earlier instant.
///
/// Reconciliation on re-run: still-open slots in the range are dropped
/// and rebuilt from the current hours; booked and blocked slots are
/// preserved, and the (business, start) uniqueness constraint keeps the
/// rebuild from duplicating their start instants.
pub fn generate(
    conn: &Connection,
    business: &BusinessProfile,
    start: NaiveDate,
    days: u32,
) -> anyhow::Result<GenerationOutcome> {
    let tz = business.tz()?;
    let step = Duration::minutes(business.slot_minutes);
    if business.slot_minutes <= 0 {
        anyhow::bail!("slot granularity must be positive");
    }

    let range_start = local_day_start_utc(&tz, start)?;
    let range_end = local_day_start_utc(&tz, next_date(start, days))?;

    // One scoped transaction per run; live bookings in other ranges are
    // never touched.
    let tx = conn.unchecked_transaction()?;

    let removed = queries::delete_open_slots_in_range(&tx, &business.id, range_start, range_end)?;

    let mut created = 0usize;
    for offset in 0..days {
        let date = next_date(start, offset);
        let Some((open, close)) = business.hours.window_for(date.weekday()) else {
            continue;
        };

        let mut cursor = open;
        loop {
            let (slot_end, wrapped) = cursor.overflowing_add_signed(step);
            if wrapped != 0 || slot_end > close {
                break;
            }

            if let (Some(start_at), Some(end_at)) = (
                resolve_local(&tz, date, cursor),
                resolve_local(&tz, date, slot_end),
            ) {
                if end_at > start_at {
                    let slot = CalendarSlot {
                        id: uuid::Uuid::new_v4().to_string(),
                        business_id: business.id.clone(),
                        start_at,
                        end_at,
                        available: true,
                        blocked: false,
                        blocked_reason: None,
                    };
                    if queries::insert_slot(&tx, &slot)? {
                        created += 1;
                    }
                }
            }

            cursor = slot_end;
            if cursor >= close {
                break;
            }
        }
    }

    tx.commit()?;

    tracing::info!(
        business_id = %business.id,
        start = %start,
        days,
        created,
        removed,
        "slot inventory generated"
    );

    Ok(GenerationOutcome { created, removed })
}

fn next_date(start: NaiveDate, offset: u32) -> NaiveDate {
    start
        .checked_add_days(chrono::Days::new(offset as u64))
        .unwrap_or(start)
}

/// Map a local wall-clock value to an instant through the timezone table.
/// Returns None for times erased by a spring-forward gap.
fn resolve_local(tz: &Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    use chrono::offset::LocalResult;
    use chrono::TimeZone;

    match tz.from_local_datetime(&date.and_time(time)) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

fn local_day_start_utc(tz: &Tz, date: NaiveDate) -> anyhow::Result<DateTime<Utc>> {
    // midnight itself can fall in a transition gap in some zones
    resolve_local(tz, date, NaiveTime::MIN)
        .or_else(|| resolve_local(tz, date, NaiveTime::from_hms_opt(1, 0, 0)?))
        .ok_or_else(|| anyhow::anyhow!("could not resolve local day start for {date}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::{DayWindow, WeeklyHours};
    use std::collections::HashSet;

    fn business_open_daily(open: &str, close: &str) -> BusinessProfile {
        BusinessProfile {
            id: "biz-1".to_string(),
            name: "Main Street Barbers".to_string(),
            phone_number: "+15550001111".to_string(),
            timezone: "America/New_York".to_string(),
            hours: WeeklyHours {
                days: ["mon", "tue", "wed", "thu", "fri", "sat", "sun"]
                    .iter()
                    .map(|d| DayWindow {
                        day: d.to_string(),
                        open: open.to_string(),
                        close: close.to_string(),
                    })
                    .collect(),
            },
            services: vec![],
            slot_minutes: 60,
            notify_phone: String::new(),
            transfer_phone: None,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn all_slots(conn: &Connection) -> Vec<CalendarSlot> {
        queries::slots_in_range(
            conn,
            "biz-1",
            queries::parse_ts("2020-01-01T00:00:00Z").unwrap(),
            queries::parse_ts("2040-01-01T00:00:00Z").unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_generates_slots_within_open_window() {
        let conn = db::init_db(":memory:").unwrap();
        let biz = business_open_daily("08:00", "18:00");

        let outcome = generate(&conn, &biz, date(2026, 8, 4), 1).unwrap();
        assert_eq!(outcome.created, 10);

        let tz: Tz = "America/New_York".parse().unwrap();
        for slot in all_slots(&conn) {
            let local_start = slot.local_start(&tz).time();
            let local_end = slot.local_end(&tz).time();
            assert!(local_start >= NaiveTime::from_hms_opt(8, 0, 0).unwrap());
            assert!(local_end <= NaiveTime::from_hms_opt(18, 0, 0).unwrap());
        }
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let conn = db::init_db(":memory:").unwrap();
        let biz = business_open_daily("08:00", "18:00");

        generate(&conn, &biz, date(2026, 8, 3), 7).unwrap();
        let first: HashSet<DateTime<Utc>> = all_slots(&conn).iter().map(|s| s.start_at).collect();

        generate(&conn, &biz, date(2026, 8, 3), 7).unwrap();
        let slots = all_slots(&conn);
        let second: HashSet<DateTime<Utc>> = slots.iter().map(|s| s.start_at).collect();

        assert_eq!(first, second);
        assert_eq!(slots.len(), second.len(), "no duplicate start instants");
    }

    #[test]
    fn test_local_window_holds_across_spring_forward() {
        let conn = db::init_db(":memory:").unwrap();
        let biz = business_open_daily("08:00", "18:00");

        // US DST starts Sunday 2026-03-08
        generate(&conn, &biz, date(2026, 3, 7), 3).unwrap();

        let tz: Tz = "America/New_York".parse().unwrap();
        let slots = all_slots(&conn);
        assert_eq!(slots.len(), 30);
        for slot in &slots {
            let local = slot.local_start(&tz).time();
            assert!(local >= NaiveTime::from_hms_opt(8, 0, 0).unwrap());
            assert!(local < NaiveTime::from_hms_opt(18, 0, 0).unwrap());
        }

        // EST on the 7th (UTC-5), EDT on the 9th (UTC-4): the same local
        // opening time maps to different instants
        let opening_7th = slots
            .iter()
            .find(|s| s.local_start(&tz).date_naive() == date(2026, 3, 7))
            .unwrap();
        let opening_9th = slots
            .iter()
            .find(|s| s.local_start(&tz).date_naive() == date(2026, 3, 9))
            .unwrap();
        assert_eq!(queries::fmt_ts(&opening_7th.start_at), "2026-03-07T13:00:00Z");
        assert_eq!(queries::fmt_ts(&opening_9th.start_at), "2026-03-09T12:00:00Z");
    }

    #[test]
    fn test_spring_forward_gap_yields_no_phantom_slot() {
        let conn = db::init_db(":memory:").unwrap();
        // a window crossing the 02:00-03:00 gap on 2026-03-08
        let biz = business_open_daily("01:00", "05:00");

        generate(&conn, &biz, date(2026, 3, 8), 1).unwrap();

        let slots = all_slots(&conn);
        // 01:00 and 02:00 starts touch the gap; 03:00 and 04:00 survive
        let starts: Vec<String> = slots.iter().map(|s| queries::fmt_ts(&s.start_at)).collect();
        assert!(starts.iter().all(|s| s.as_str() >= "2026-03-08T07:00:00Z"));
        assert_eq!(slots.len(), 2);

        let mut unique = HashSet::new();
        assert!(slots.iter().all(|s| unique.insert(s.start_at)));
    }

    #[test]
    fn test_fall_back_day_has_no_duplicate_starts() {
        let conn = db::init_db(":memory:").unwrap();
        // window spanning the repeated 01:00-02:00 hour on 2026-11-01
        let biz = business_open_daily("00:00", "04:00");

        generate(&conn, &biz, date(2026, 11, 1), 1).unwrap();

        let slots = all_slots(&conn);
        let mut unique = HashSet::new();
        assert!(slots.iter().all(|s| unique.insert(s.start_at)));
        assert_eq!(slots.len(), 4);
    }

    #[test]
    fn test_disabled_weekday_yields_zero_slots() {
        let conn = db::init_db(":memory:").unwrap();
        let mut biz = business_open_daily("08:00", "18:00");
        biz.hours.days.retain(|w| w.day != "sun");

        // 2026-08-09 is a Sunday
        let outcome = generate(&conn, &biz, date(2026, 8, 9), 1).unwrap();
        assert_eq!(outcome.created, 0);
        assert!(all_slots(&conn).is_empty());
    }

    #[test]
    fn test_hours_change_recreates_open_slots_only() {
        let conn = db::init_db(":memory:").unwrap();
        let biz = business_open_daily("08:00", "18:00");
        generate(&conn, &biz, date(2026, 8, 4), 1).unwrap();

        // book the 09:00 local slot (13:00Z)
        let booked_start = queries::parse_ts("2026-08-04T13:00:00Z").unwrap();
        let booked = all_slots(&conn)
            .into_iter()
            .find(|s| s.start_at == booked_start)
            .unwrap();
        assert!(queries::mark_slot_unavailable(&conn, &booked.id).unwrap());

        // hours shrink to 10:00-16:00 and inventory regenerates
        let narrowed = business_open_daily("10:00", "16:00");
        generate(&conn, &narrowed, date(2026, 8, 4), 1).unwrap();

        let slots = all_slots(&conn);
        // six slots from the new window plus the preserved booked slot
        assert_eq!(slots.len(), 7);

        let kept = slots.iter().find(|s| s.start_at == booked_start).unwrap();
        assert_eq!(kept.id, booked.id);
        assert!(!kept.available);

        let tz: Tz = "America/New_York".parse().unwrap();
        for slot in slots.iter().filter(|s| s.available) {
            let local = slot.local_start(&tz).time();
            assert!(local >= NaiveTime::from_hms_opt(10, 0, 0).unwrap());
        }
    }

    #[test]
    fn test_slot_duration_longer_than_window_remainder() {
        let conn = db::init_db(":memory:").unwrap();
        let mut biz = business_open_daily("08:00", "09:30");
        biz.slot_minutes = 60;

        let outcome = generate(&conn, &biz, date(2026, 8, 4), 1).unwrap();
        // only 08:00-09:00 fits; 09:00-10:00 would overrun the close
        assert_eq!(outcome.created, 1);
    }
}
