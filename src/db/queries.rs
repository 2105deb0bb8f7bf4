use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};

use crate::models::{Appointment, AppointmentStatus, BusinessProfile, CalendarSlot, WeeklyHours};

// Instants are stored as UTC RFC 3339 with whole seconds ("...Z"), so
// lexicographic comparison in SQL equals chronological comparison.
pub fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_ts(s: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .map_err(|e| anyhow::anyhow!("invalid stored timestamp {s}: {e}"))?
        .with_timezone(&Utc))
}

// ── Businesses ──

fn parse_business_row(row: &rusqlite::Row) -> anyhow::Result<BusinessProfile> {
    let hours_json: String = row.get(4)?;
    let services_json: String = row.get(5)?;

    Ok(BusinessProfile {
        id: row.get(0)?,
        name: row.get(1)?,
        phone_number: row.get(2)?,
        timezone: row.get(3)?,
        hours: WeeklyHours::from_json(&hours_json)?,
        services: serde_json::from_str(&services_json)?,
        slot_minutes: row.get(6)?,
        notify_phone: row.get(7)?,
        transfer_phone: row.get(8)?,
    })
}

const BUSINESS_COLUMNS: &str =
    "id, name, phone_number, timezone, hours, services, slot_minutes, notify_phone, transfer_phone";

pub fn get_business(conn: &Connection, id: &str) -> anyhow::Result<Option<BusinessProfile>> {
    let result = conn.query_row(
        &format!("SELECT {BUSINESS_COLUMNS} FROM businesses WHERE id = ?1"),
        params![id],
        |row| Ok(parse_business_row(row)),
    );

    match result {
        Ok(business) => Ok(Some(business?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn business_by_phone(conn: &Connection, phone: &str) -> anyhow::Result<Option<BusinessProfile>> {
    let result = conn.query_row(
        &format!("SELECT {BUSINESS_COLUMNS} FROM businesses WHERE phone_number = ?1"),
        params![phone],
        |row| Ok(parse_business_row(row)),
    );

    match result {
        Ok(business) => Ok(Some(business?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn list_businesses(conn: &Connection) -> anyhow::Result<Vec<BusinessProfile>> {
    let mut stmt =
        conn.prepare(&format!("SELECT {BUSINESS_COLUMNS} FROM businesses ORDER BY id"))?;
    let rows = stmt.query_map([], |row| Ok(parse_business_row(row)))?;

    let mut businesses = vec![];
    for row in rows {
        businesses.push(row??);
    }
    Ok(businesses)
}

pub fn save_business(conn: &Connection, business: &BusinessProfile) -> anyhow::Result<()> {
    let hours = serde_json::to_string(&business.hours)?;
    let services = serde_json::to_string(&business.services)?;

    conn.execute(
        "INSERT INTO businesses (id, name, phone_number, timezone, hours, services, slot_minutes, notify_phone, transfer_phone)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
           name = excluded.name,
           phone_number = excluded.phone_number,
           timezone = excluded.timezone,
           hours = excluded.hours,
           services = excluded.services,
           slot_minutes = excluded.slot_minutes,
           notify_phone = excluded.notify_phone,
           transfer_phone = excluded.transfer_phone,
           updated_at = datetime('now')",
        params![
            business.id,
            business.name,
            business.phone_number,
            business.timezone,
            hours,
            services,
            business.slot_minutes,
            business.notify_phone,
            business.transfer_phone,
        ],
    )?;
    Ok(())
}

// ── Calendar slots ──

fn parse_slot_row(row: &rusqlite::Row) -> anyhow::Result<CalendarSlot> {
    let start_str: String = row.get(2)?;
    let end_str: String = row.get(3)?;

    Ok(CalendarSlot {
        id: row.get(0)?,
        business_id: row.get(1)?,
        start_at: parse_ts(&start_str)?,
        end_at: parse_ts(&end_str)?,
        available: row.get::<_, i32>(4)? != 0,
        blocked: row.get::<_, i32>(5)? != 0,
        blocked_reason: row.get(6)?,
    })
}

const SLOT_COLUMNS: &str = "id, business_id, start_at, end_at, available, blocked, blocked_reason";

/// Insert a slot unless one with the same (business, start) already
/// exists. Returns whether a row was created.
pub fn insert_slot(conn: &Connection, slot: &CalendarSlot) -> anyhow::Result<bool> {
    let count = conn.execute(
        "INSERT OR IGNORE INTO calendar_slots (id, business_id, start_at, end_at, available, blocked, blocked_reason)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            slot.id,
            slot.business_id,
            fmt_ts(&slot.start_at),
            fmt_ts(&slot.end_at),
            slot.available as i32,
            slot.blocked as i32,
            slot.blocked_reason,
        ],
    )?;
    Ok(count > 0)
}

pub fn get_slot(conn: &Connection, id: &str) -> anyhow::Result<Option<CalendarSlot>> {
    let result = conn.query_row(
        &format!("SELECT {SLOT_COLUMNS} FROM calendar_slots WHERE id = ?1"),
        params![id],
        |row| Ok(parse_slot_row(row)),
    );

    match result {
        Ok(slot) => Ok(Some(slot?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Slots that are open for proposal: available, unblocked, starting at or
/// after `now`, and overlapping no active appointment (half-open test).
pub fn open_slots(
    conn: &Connection,
    business_id: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<CalendarSlot>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SLOT_COLUMNS} FROM calendar_slots s
         WHERE s.business_id = ?1 AND s.available = 1 AND s.blocked = 0 AND s.start_at >= ?2
           AND NOT EXISTS (
               SELECT 1 FROM appointments a
               WHERE a.business_id = s.business_id
                 AND a.status IN ('scheduled', 'confirmed')
                 AND a.start_at < s.end_at
                 AND a.end_at > s.start_at
           )
         ORDER BY s.start_at ASC, s.id ASC"
    ))?;

    let rows = stmt.query_map(params![business_id, fmt_ts(&now)], |row| {
        Ok(parse_slot_row(row))
    })?;

    let mut slots = vec![];
    for row in rows {
        slots.push(row??);
    }
    Ok(slots)
}

pub fn slots_in_range(
    conn: &Connection,
    business_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> anyhow::Result<Vec<CalendarSlot>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SLOT_COLUMNS} FROM calendar_slots
         WHERE business_id = ?1 AND start_at >= ?2 AND start_at < ?3
         ORDER BY start_at ASC, id ASC"
    ))?;

    let rows = stmt.query_map(params![business_id, fmt_ts(&start), fmt_ts(&end)], |row| {
        Ok(parse_slot_row(row))
    })?;

    let mut slots = vec![];
    for row in rows {
        slots.push(row??);
    }
    Ok(slots)
}

/// Remove still-open inventory in a range so it can be regenerated.
/// Booked (unavailable) and blocked slots are left untouched.
pub fn delete_open_slots_in_range(
    conn: &Connection,
    business_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let count = conn.execute(
        "DELETE FROM calendar_slots
         WHERE business_id = ?1 AND start_at >= ?2 AND start_at < ?3
           AND available = 1 AND blocked = 0",
        params![business_id, fmt_ts(&start), fmt_ts(&end)],
    )?;
    Ok(count)
}

/// Conditional flip used by the booking transaction. Zero rows changed
/// means another commit got there first.
pub fn mark_slot_unavailable(conn: &Connection, slot_id: &str) -> anyhow::Result<bool> {
    let count = conn.execute(
        "UPDATE calendar_slots SET available = 0 WHERE id = ?1 AND available = 1",
        params![slot_id],
    )?;
    Ok(count > 0)
}

pub fn reopen_slots_overlapping(
    conn: &Connection,
    business_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let count = conn.execute(
        "UPDATE calendar_slots SET available = 1
         WHERE business_id = ?1 AND blocked = 0
           AND start_at < ?3 AND end_at > ?2",
        params![business_id, fmt_ts(&start), fmt_ts(&end)],
    )?;
    Ok(count)
}

// ── Appointments ──

fn parse_appointment_row(row: &rusqlite::Row) -> anyhow::Result<Appointment> {
    let start_str: String = row.get(6)?;
    let end_str: String = row.get(7)?;
    let status_str: String = row.get(8)?;
    let created_str: String = row.get(11)?;
    let updated_str: String = row.get(12)?;

    Ok(Appointment {
        id: row.get(0)?,
        business_id: row.get(1)?,
        customer_name: row.get(2)?,
        customer_phone: row.get(3)?,
        service_id: row.get(4)?,
        call_id: row.get(5)?,
        start_at: parse_ts(&start_str)?,
        end_at: parse_ts(&end_str)?,
        status: AppointmentStatus::parse(&status_str),
        source: row.get(9)?,
        idempotency_key: row.get(10)?,
        created_at: parse_ts(&created_str)?,
        updated_at: parse_ts(&updated_str)?,
    })
}

const APPOINTMENT_COLUMNS: &str = "id, business_id, customer_name, customer_phone, service_id, call_id, start_at, end_at, status, source, idempotency_key, created_at, updated_at";

pub fn create_appointment(conn: &Connection, appt: &Appointment) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO appointments (id, business_id, customer_name, customer_phone, service_id, call_id, start_at, end_at, status, source, idempotency_key, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            appt.id,
            appt.business_id,
            appt.customer_name,
            appt.customer_phone,
            appt.service_id,
            appt.call_id,
            fmt_ts(&appt.start_at),
            fmt_ts(&appt.end_at),
            appt.status.as_str(),
            appt.source,
            appt.idempotency_key,
            fmt_ts(&appt.created_at),
            fmt_ts(&appt.updated_at),
        ],
    )?;
    Ok(())
}

pub fn appointment_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<Appointment>> {
    let result = conn.query_row(
        &format!("SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE id = ?1"),
        params![id],
        |row| Ok(parse_appointment_row(row)),
    );

    match result {
        Ok(appt) => Ok(Some(appt?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn appointment_by_key(conn: &Connection, key: &str) -> anyhow::Result<Option<Appointment>> {
    let result = conn.query_row(
        &format!("SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE idempotency_key = ?1"),
        params![key],
        |row| Ok(parse_appointment_row(row)),
    );

    match result {
        Ok(appt) => Ok(Some(appt?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn active_appointments(conn: &Connection, business_id: &str) -> anyhow::Result<Vec<Appointment>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {APPOINTMENT_COLUMNS} FROM appointments
         WHERE business_id = ?1 AND status IN ('scheduled', 'confirmed')
         ORDER BY start_at ASC"
    ))?;

    let rows = stmt.query_map(params![business_id], |row| Ok(parse_appointment_row(row)))?;

    let mut appts = vec![];
    for row in rows {
        appts.push(row??);
    }
    Ok(appts)
}

pub fn active_overlap_exists(
    conn: &Connection,
    business_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> anyhow::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM appointments
         WHERE business_id = ?1 AND status IN ('scheduled', 'confirmed')
           AND start_at < ?3 AND end_at > ?2",
        params![business_id, fmt_ts(&start), fmt_ts(&end)],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn update_appointment_status(
    conn: &Connection,
    id: &str,
    status: AppointmentStatus,
    now: DateTime<Utc>,
) -> anyhow::Result<bool> {
    let count = conn.execute(
        "UPDATE appointments SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), fmt_ts(&now), id],
    )?;
    Ok(count > 0)
}

// ── Slot holds ──

/// Atomically claim a slot for a call. The upsert only overwrites a hold
/// that has expired or already belongs to this call, so exactly one live
/// caller can hold a given slot.
pub fn acquire_hold(
    conn: &Connection,
    slot_id: &str,
    call_id: &str,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> anyhow::Result<bool> {
    let count = conn.execute(
        "INSERT INTO slot_holds (slot_id, call_id, expires_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(slot_id) DO UPDATE SET
           call_id = excluded.call_id,
           expires_at = excluded.expires_at
         WHERE slot_holds.expires_at <= ?4 OR slot_holds.call_id = excluded.call_id",
        params![slot_id, call_id, fmt_ts(&expires_at), fmt_ts(&now)],
    )?;
    Ok(count > 0)
}

pub fn hold_for_slot(
    conn: &Connection,
    slot_id: &str,
) -> anyhow::Result<Option<(String, DateTime<Utc>)>> {
    let result = conn.query_row(
        "SELECT call_id, expires_at FROM slot_holds WHERE slot_id = ?1",
        params![slot_id],
        |row| {
            let call_id: String = row.get(0)?;
            let expires_str: String = row.get(1)?;
            Ok((call_id, expires_str))
        },
    );

    match result {
        Ok((call_id, expires_str)) => Ok(Some((call_id, parse_ts(&expires_str)?))),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn release_hold(conn: &Connection, slot_id: &str) -> anyhow::Result<bool> {
    let count = conn.execute("DELETE FROM slot_holds WHERE slot_id = ?1", params![slot_id])?;
    Ok(count > 0)
}

pub fn release_holds_for_call(conn: &Connection, call_id: &str) -> anyhow::Result<usize> {
    let count = conn.execute("DELETE FROM slot_holds WHERE call_id = ?1", params![call_id])?;
    Ok(count)
}

pub fn expire_holds(conn: &Connection, now: DateTime<Utc>) -> anyhow::Result<usize> {
    let count = conn.execute(
        "DELETE FROM slot_holds WHERE expires_at <= ?1",
        params![fmt_ts(&now)],
    )?;
    Ok(count)
}
