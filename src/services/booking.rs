use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;

use crate::db::queries;
use crate::models::{Appointment, AppointmentStatus, BusinessProfile};

#[derive(Debug)]
pub struct BookingRequest<'a> {
    pub call_id: Option<&'a str>,
    pub business: &'a BusinessProfile,
    pub service_id: &'a str,
    pub customer_name: Option<&'a str>,
    pub customer_phone: &'a str,
    pub slot_id: &'a str,
    pub idempotency_key: &'a str,
}

/// Terminal state of one booking attempt. The conversation engine decides
/// what happens next; nothing here retries.
#[derive(Debug)]
pub enum BookingOutcome {
    Committed(Appointment),
    Conflict,
    Invalid(String),
}

/// Commit a chosen slot into an appointment.
///
/// Runs as one transaction: the slot is re-validated at commit time, the
/// appointment row and the slot flip land together, and any failed check
/// rolls both back. A replayed request with a known idempotency key
/// returns the original appointment instead of creating a second one.
pub fn book(
    conn: &Connection,
    req: &BookingRequest,
    now: DateTime<Utc>,
) -> anyhow::Result<BookingOutcome> {
    let tx = conn.unchecked_transaction()?;

    if let Some(existing) = queries::appointment_by_key(&tx, req.idempotency_key)? {
        tx.commit()?;
        tracing::info!(key = req.idempotency_key, appointment_id = %existing.id, "replayed booking commit");
        return Ok(BookingOutcome::Committed(existing));
    }

    let Some(service) = req.business.service(req.service_id) else {
        return Ok(BookingOutcome::Invalid(format!(
            "unknown service: {}",
            req.service_id
        )));
    };

    let Some(slot) = queries::get_slot(&tx, req.slot_id)? else {
        return Ok(BookingOutcome::Conflict);
    };
    if slot.business_id != req.business.id || !slot.available || slot.blocked {
        return Ok(BookingOutcome::Conflict);
    }

    // a live hold belonging to another call blocks the commit
    if let Some((holder, hold_expires)) = queries::hold_for_slot(&tx, req.slot_id)? {
        if hold_expires > now && req.call_id != Some(holder.as_str()) {
            return Ok(BookingOutcome::Conflict);
        }
    }

    let end_at = slot.start_at + Duration::minutes(service.duration_minutes);
    if queries::active_overlap_exists(&tx, &req.business.id, slot.start_at, end_at)? {
        return Ok(BookingOutcome::Conflict);
    }

    let appointment = Appointment {
        id: uuid::Uuid::new_v4().to_string(),
        business_id: req.business.id.clone(),
        customer_name: req.customer_name.map(str::to_string),
        customer_phone: req.customer_phone.to_string(),
        service_id: service.id.clone(),
        start_at: slot.start_at,
        end_at,
        status: AppointmentStatus::Confirmed,
        source: "phone".to_string(),
        call_id: req.call_id.map(str::to_string),
        idempotency_key: Some(req.idempotency_key.to_string()),
        created_at: now,
        updated_at: now,
    };
    queries::create_appointment(&tx, &appointment)?;

    if !queries::mark_slot_unavailable(&tx, req.slot_id)? {
        // dropping the transaction rolls the insert back
        return Ok(BookingOutcome::Conflict);
    }

    // the tentative hold is consumed by the commit
    queries::release_hold(&tx, req.slot_id)?;

    tx.commit()?;

    tracing::info!(
        appointment_id = %appointment.id,
        business_id = %req.business.id,
        slot_id = req.slot_id,
        "booking committed"
    );

    Ok(BookingOutcome::Committed(appointment))
}

/// Cancel an appointment and re-open the calendar time it occupied.
/// The record keeps its history; only the status changes.
pub fn cancel(conn: &Connection, appointment_id: &str, now: DateTime<Utc>) -> anyhow::Result<bool> {
    let tx = conn.unchecked_transaction()?;

    let Some(appt) = queries::appointment_by_id(&tx, appointment_id)? else {
        return Ok(false);
    };
    if !appt.status.is_active() {
        return Ok(false);
    }

    queries::update_appointment_status(&tx, appointment_id, AppointmentStatus::Cancelled, now)?;
    queries::reopen_slots_overlapping(&tx, &appt.business_id, appt.start_at, appt.end_at)?;

    tx.commit()?;

    tracing::info!(appointment_id, "appointment cancelled");
    Ok(true)
}
