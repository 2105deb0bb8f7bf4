use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::db::queries;
use crate::errors::DialogError;
use crate::models::{
    Appointment, BusinessProfile, CallSession, CallTurn, CallerIntent, ExtractedUtterance,
    SessionStage,
};
use crate::services::ai::intent::extract_utterance;
use crate::services::availability;
use crate::services::booking::{self, BookingOutcome, BookingRequest};
use crate::state::AppState;

const MAX_RETRIES: i32 = 3;
const MAX_SILENCES: i32 = 3;
const MIN_CONFIDENCE: f32 = 0.4;
const CANDIDATE_WINDOW: usize = 25;

const SAY_CALL_ENDED: &str =
    "This call is no longer active. Please call back to book an appointment. Goodbye.";
const SAY_UPSTREAM_TROUBLE: &str = "I'm sorry, I'm having trouble on my end right now. Please call back in a few minutes. Goodbye.";
const SAY_STORE_TROUBLE: &str = "I'm sorry, something went wrong while saving your booking. Someone will call you back shortly to finish up. Goodbye.";
const SAY_CONFUSED_HANDOFF: &str =
    "I'm sorry, I'm having trouble understanding. Let me get someone to help you.";
const SAY_SILENCE_HANDOFF: &str =
    "I still can't hear you. Let me get someone to call you back. Goodbye.";
const SAY_NO_AVAILABILITY: &str = "I'm sorry, we don't have any openings I can offer right now. Someone will call you back to find a time. Goodbye.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallAction {
    Continue,
    End,
    Transfer,
}

/// What the telephony adapter should do next: speak `say`, then keep
/// listening, hang up, or transfer to a human.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub say: String,
    pub action: CallAction,
}

impl TurnOutcome {
    fn ask(say: impl Into<String>) -> Self {
        Self {
            say: say.into(),
            action: CallAction::Continue,
        }
    }

    fn end(say: impl Into<String>) -> Self {
        Self {
            say: say.into(),
            action: CallAction::End,
        }
    }

    fn transfer(say: impl Into<String>) -> Self {
        Self {
            say: say.into(),
            action: CallAction::Transfer,
        }
    }
}

/// Idempotent session creation. A replayed call-start event re-prompts
/// for the current stage instead of resetting the dialogue.
pub async fn begin(
    state: &Arc<AppState>,
    call_id: &str,
    business_id: &str,
    caller_phone: &str,
) -> anyhow::Result<TurnOutcome> {
    let lock = state.call_locks.acquire(call_id);
    let _guard = lock.lock().await;

    let business = require_business(state, business_id)?;

    if let Some(session) = state.sessions.load(call_id)? {
        return Ok(TurnOutcome::ask(reprompt_for(&session, &business)));
    }

    let now = Utc::now();
    let mut session = CallSession::new(call_id, business_id, caller_phone, now);
    let say = format!(
        "Thank you for calling {}. What can I book for you today?",
        business.name
    );
    session.turns.push(CallTurn::assistant(&say));
    state.sessions.save(&session)?;

    tracing::info!(call_id, business_id, "call session started");
    Ok(TurnOutcome::ask(say))
}

/// Advance the dialogue by one caller utterance. Every failure mode is
/// converted to speech here; the telephony adapter never sees a raw
/// error for an established call.
pub async fn advance(
    state: &Arc<AppState>,
    call_id: &str,
    speech: &str,
) -> anyhow::Result<TurnOutcome> {
    let lock = state.call_locks.acquire(call_id);
    let _guard = lock.lock().await;

    let Some(mut session) = state.sessions.load(call_id)? else {
        tracing::info!(call_id, error = %DialogError::SessionExpired, "speech event for retired call");
        return Ok(TurnOutcome::end(SAY_CALL_ENDED));
    };

    let business = require_business(state, &session.business_id)?;
    let now = Utc::now();

    let outcome = match run_turn(state, &mut session, &business, speech, now).await {
        Ok(outcome) => outcome,
        Err(err) => spoken_fallback(state, &mut session, &business, err, now),
    };

    session.last_activity = now;
    session.turns.push(CallTurn::assistant(&outcome.say));

    if session.stage.is_terminal() {
        {
            let db = state.db.lock().unwrap();
            queries::release_holds_for_call(&db, &session.call_id)?;
        }
        state.sessions.remove(&session.call_id)?;
        state.call_locks.forget(&session.call_id);
        tracing::info!(call_id = %session.call_id, stage = session.stage.as_str(), "call session retired");
    } else {
        state.sessions.save(&session)?;
    }

    Ok(outcome)
}

/// Teardown without a closing message: the caller hung up or the carrier
/// dropped the call.
pub fn hangup(state: &Arc<AppState>, call_id: &str) -> anyhow::Result<()> {
    {
        let db = state.db.lock().unwrap();
        queries::release_holds_for_call(&db, call_id)?;
    }
    state.sessions.remove(call_id)?;
    state.call_locks.forget(call_id);
    tracing::info!(call_id, "call torn down");
    Ok(())
}

/// Periodic sweep: retire sessions idle past the timeout and release
/// anything they still held, then clear expired holds from dropped calls.
pub fn expire_sessions(state: &Arc<AppState>) -> anyhow::Result<usize> {
    let now = Utc::now();
    let cutoff = now - Duration::seconds(state.config.session_timeout_seconds);
    let stale = state.sessions.sweep_inactive(cutoff)?;

    let db = state.db.lock().unwrap();
    for session in &stale {
        queries::release_holds_for_call(&db, &session.call_id)?;
        state.call_locks.forget(&session.call_id);
    }
    let expired_holds = queries::expire_holds(&db, now)?;

    if !stale.is_empty() || expired_holds > 0 {
        tracing::info!(
            sessions = stale.len(),
            holds = expired_holds,
            "expired inactive call state"
        );
    }
    Ok(stale.len())
}

async fn run_turn(
    state: &Arc<AppState>,
    session: &mut CallSession,
    business: &BusinessProfile,
    speech: &str,
    now: DateTime<Utc>,
) -> Result<TurnOutcome, DialogError> {
    let speech = speech.trim();

    if session.stage.is_terminal() {
        return Err(DialogError::SessionExpired);
    }

    if speech.is_empty() {
        session.silences += 1;
        if session.silences >= MAX_SILENCES {
            return Ok(hand_off(session, SAY_SILENCE_HANDOFF));
        }
        return Ok(TurnOutcome::ask(format!(
            "Sorry, I didn't catch that. {}",
            reprompt_for(session, business)
        )));
    }
    session.silences = 0;
    session.turns.push(CallTurn::caller(speech));

    let utterance = extract(state, session, business, now).await?;

    tracing::info!(
        call_id = %session.call_id,
        intent = ?utterance.intent,
        confidence = utterance.confidence,
        stage = session.stage.as_str(),
        "utterance classified"
    );

    if utterance.confidence < MIN_CONFIDENCE {
        return Err(DialogError::InputAmbiguous);
    }

    // hours questions get a deterministic answer, no stage change
    if utterance.intent == CallerIntent::Question {
        let hours = business.hours.to_human_readable();
        let say = if hours.is_empty() {
            reprompt_for(session, business)
        } else {
            format!("We're open {hours}. {}", reprompt_for(session, business))
        };
        return Ok(TurnOutcome::ask(say));
    }

    merge_fields(session, business, &utterance, speech);

    match session.stage {
        SessionStage::Greeting | SessionStage::CollectingService => {
            collect_service(state, session, business, &utterance, now)
        }
        SessionStage::CollectingIdentity => collect_identity(state, session, business, now),
        SessionStage::CollectingTime | SessionStage::ProposingSlot => {
            collect_time(state, session, business, now)
        }
        SessionStage::AwaitingConfirmation | SessionStage::Booking => {
            resolve_confirmation(state, session, business, &utterance, now)
        }
        SessionStage::Completed | SessionStage::Failed | SessionStage::Handoff => {
            Err(DialogError::SessionExpired)
        }
    }
}

/// Fold newly extracted fields into the session. Later utterances may
/// correct earlier ones; merging never moves the stage by itself.
fn merge_fields(
    session: &mut CallSession,
    business: &BusinessProfile,
    utterance: &ExtractedUtterance,
    speech: &str,
) {
    let mentioned = utterance.service.as_deref().unwrap_or("");
    if let Some(service) = business
        .match_service(mentioned)
        .or_else(|| business.match_service(speech))
    {
        session.service_id = Some(service.id.clone());
    }
    if let Some(name) = &utterance.customer_name {
        session.customer_name = Some(name.clone());
    }
    if let Some(pref) = utterance.time_preference() {
        session.time_preference = Some(pref);
    }
}

fn collect_service(
    state: &Arc<AppState>,
    session: &mut CallSession,
    business: &BusinessProfile,
    utterance: &ExtractedUtterance,
    now: DateTime<Utc>,
) -> Result<TurnOutcome, DialogError> {
    if session.service_id.is_some() {
        return next_missing_field(state, session, business, now);
    }
    if let Some(requested) = &utterance.service {
        // named a service we could not map to the catalog
        return Err(DialogError::Validation(requested.clone()));
    }
    session.retries += 1;
    if session.retries >= MAX_RETRIES {
        return Ok(hand_off(session, SAY_CONFUSED_HANDOFF));
    }
    Ok(TurnOutcome::ask(format!(
        "What would you like to book? We offer {}.",
        business.service_names()
    )))
}

fn collect_identity(
    state: &Arc<AppState>,
    session: &mut CallSession,
    business: &BusinessProfile,
    now: DateTime<Utc>,
) -> Result<TurnOutcome, DialogError> {
    if session.customer_name.is_some() {
        return next_missing_field(state, session, business, now);
    }
    session.retries += 1;
    if session.retries >= MAX_RETRIES {
        return Ok(hand_off(session, SAY_CONFUSED_HANDOFF));
    }
    Ok(TurnOutcome::ask(
        "Sorry, I didn't catch your name. Could you repeat it?",
    ))
}

fn collect_time(
    state: &Arc<AppState>,
    session: &mut CallSession,
    business: &BusinessProfile,
    now: DateTime<Utc>,
) -> Result<TurnOutcome, DialogError> {
    if session.time_preference.is_some() {
        return propose_slot(state, session, business, now);
    }
    session.retries += 1;
    if session.retries >= MAX_RETRIES {
        return Ok(hand_off(session, SAY_CONFUSED_HANDOFF));
    }
    Ok(TurnOutcome::ask("What day and time should I look for?"))
}

/// Route to whichever field is still missing, in collection order.
fn next_missing_field(
    state: &Arc<AppState>,
    session: &mut CallSession,
    business: &BusinessProfile,
    now: DateTime<Utc>,
) -> Result<TurnOutcome, DialogError> {
    session.retries = 0;
    if session.customer_name.is_none() {
        session.stage = SessionStage::CollectingIdentity;
        return Ok(TurnOutcome::ask("Can I get your name, please?"));
    }
    if session.time_preference.is_none() {
        session.stage = SessionStage::CollectingTime;
        return Ok(TurnOutcome::ask("What day and time work best for you?"));
    }
    propose_slot(state, session, business, now)
}

/// Find the next acceptable open slot, take a tentative hold on it, and
/// ask the caller. Falls back to the unfiltered calendar when nothing
/// matches the stated preference; errs with NoAvailability only when the
/// calendar is truly dry.
fn propose_slot(
    state: &Arc<AppState>,
    session: &mut CallSession,
    business: &BusinessProfile,
    now: DateTime<Utc>,
) -> Result<TurnOutcome, DialogError> {
    session.stage = SessionStage::ProposingSlot;
    let tz = business.tz()?;

    let db = state.db.lock().unwrap();

    let pref = session.time_preference.clone();
    let mut candidates =
        availability::find_open_slots(&db, business, pref.as_ref(), now, CANDIDATE_WINDOW)?;
    candidates.retain(|s| !session.rejected_slot_ids.contains(&s.id));

    let mut widened = false;
    if candidates.is_empty() {
        widened = true;
        candidates = availability::find_open_slots(&db, business, None, now, CANDIDATE_WINDOW)?;
        candidates.retain(|s| !session.rejected_slot_ids.contains(&s.id));
    }

    let hold_until = now + Duration::seconds(state.config.hold_ttl_seconds);
    for slot in candidates {
        if queries::acquire_hold(&db, &slot.id, &session.call_id, hold_until, now)? {
            if let Some(previous) = session.proposed_slot_id.take() {
                if previous != slot.id {
                    queries::release_hold(&db, &previous)?;
                }
            }
            session.proposed_slot_id = Some(slot.id.clone());
            session.stage = SessionStage::AwaitingConfirmation;
            session.retries = 0;

            let when = slot.spoken_time(&tz);
            let say = if widened {
                let wanted = pref
                    .as_ref()
                    .map(|p| p.describe())
                    .unwrap_or_else(|| "then".to_string());
                format!("I don't have anything open {wanted}. The next opening is {when}. Does that work?")
            } else {
                format!("I can do {when}. Does that work?")
            };
            return Ok(TurnOutcome::ask(say));
        }
    }

    Err(DialogError::NoAvailability)
}

fn resolve_confirmation(
    state: &Arc<AppState>,
    session: &mut CallSession,
    business: &BusinessProfile,
    utterance: &ExtractedUtterance,
    now: DateTime<Utc>,
) -> Result<TurnOutcome, DialogError> {
    let confirmed =
        utterance.confirmation == Some(true) || utterance.intent == CallerIntent::Confirm;
    let declined =
        utterance.confirmation == Some(false) || utterance.intent == CallerIntent::Decline;

    let Some(slot_id) = session.proposed_slot_id.clone() else {
        // the hold expired or the process restarted mid-proposal
        return propose_slot(state, session, business, now);
    };

    if confirmed {
        return commit_booking(state, session, business, &slot_id, now);
    }

    if declined {
        session.retries = 0;
        session.rejected_slot_ids.push(slot_id.clone());
        session.proposed_slot_id = None;
        {
            let db = state.db.lock().unwrap();
            queries::release_hold(&db, &slot_id)?;
        }
        let next = propose_slot(state, session, business, now)?;
        return Ok(TurnOutcome {
            say: format!("No problem. {}", next.say),
            action: next.action,
        });
    }

    if utterance.time_preference().is_some() {
        // caller steered to a different time instead of answering
        session.proposed_slot_id = None;
        {
            let db = state.db.lock().unwrap();
            queries::release_hold(&db, &slot_id)?;
        }
        return propose_slot(state, session, business, now);
    }

    Err(DialogError::InputAmbiguous)
}

fn commit_booking(
    state: &Arc<AppState>,
    session: &mut CallSession,
    business: &BusinessProfile,
    slot_id: &str,
    now: DateTime<Utc>,
) -> Result<TurnOutcome, DialogError> {
    session.stage = SessionStage::Booking;

    let service_id = session
        .service_id
        .clone()
        .ok_or_else(|| DialogError::Store(anyhow::anyhow!("service missing at commit")))?;

    // replay-safe token: a duplicated confirm event for the same call and
    // slot lands on the original appointment
    let idempotency_key = format!("{}:{}", session.call_id, slot_id);

    let outcome = {
        let db = state.db.lock().unwrap();
        booking::book(
            &db,
            &BookingRequest {
                call_id: Some(&session.call_id),
                business,
                service_id: &service_id,
                customer_name: session.customer_name.as_deref(),
                customer_phone: &session.caller_phone,
                slot_id,
                idempotency_key: &idempotency_key,
            },
            now,
        )?
    };

    match outcome {
        BookingOutcome::Committed(appointment) => {
            session.stage = SessionStage::Completed;
            let tz = business.tz()?;
            let when = appointment
                .start_at
                .with_timezone(&tz)
                .format("%A, %B %-d at %-I:%M %p")
                .to_string();
            notify_booked(state, business, &appointment, &when);
            Ok(TurnOutcome::end(format!(
                "You're booked for {when}. We'll see you then. Goodbye!"
            )))
        }
        BookingOutcome::Conflict => {
            {
                let db = state.db.lock().unwrap();
                queries::release_hold(&db, slot_id)?;
            }
            session.rejected_slot_ids.push(slot_id.to_string());
            session.proposed_slot_id = None;
            Err(DialogError::SlotConflict)
        }
        BookingOutcome::Invalid(reason) => {
            {
                let db = state.db.lock().unwrap();
                queries::release_hold(&db, slot_id)?;
            }
            session.proposed_slot_id = None;
            session.service_id = None;
            // explicit re-ask transition back to service collection
            session.stage = SessionStage::CollectingService;
            Err(DialogError::Validation(reason))
        }
    }
}

/// Convert an engine failure into what the caller hears. This is the
/// boundary the error taxonomy exists for; nothing propagates raw.
fn spoken_fallback(
    state: &Arc<AppState>,
    session: &mut CallSession,
    business: &BusinessProfile,
    err: DialogError,
    now: DateTime<Utc>,
) -> TurnOutcome {
    match err {
        DialogError::InputAmbiguous => {
            session.retries += 1;
            if session.retries >= MAX_RETRIES {
                return hand_off(session, SAY_CONFUSED_HANDOFF);
            }
            TurnOutcome::ask(format!(
                "Sorry, I didn't quite get that. {}",
                reprompt_for(session, business)
            ))
        }
        DialogError::Validation(reason) => {
            tracing::info!(call_id = %session.call_id, %reason, "validation failed, clarifying");
            session.retries += 1;
            if session.retries >= MAX_RETRIES {
                return hand_off(session, SAY_CONFUSED_HANDOFF);
            }
            TurnOutcome::ask(format!(
                "I'm sorry, I don't think we offer that. We offer {}. Which would you like?",
                business.service_names()
            ))
        }
        DialogError::NoAvailability => hand_off(session, SAY_NO_AVAILABILITY),
        DialogError::SlotConflict => match propose_slot(state, session, business, now) {
            Ok(next) => TurnOutcome {
                say: format!("I'm sorry, that time was just taken. {}", next.say),
                action: next.action,
            },
            Err(_) => hand_off(session, SAY_NO_AVAILABILITY),
        },
        DialogError::SessionExpired => TurnOutcome::end(SAY_CALL_ENDED),
        DialogError::Upstream(reason) => {
            tracing::error!(call_id = %session.call_id, %reason, "language collaborator failed");
            session.stage = SessionStage::Failed;
            TurnOutcome::end(SAY_UPSTREAM_TROUBLE)
        }
        DialogError::Store(err) => {
            tracing::error!(call_id = %session.call_id, error = %err, "storage failure during call");
            notify_follow_up(state, business, session);
            session.stage = SessionStage::Failed;
            TurnOutcome::end(SAY_STORE_TROUBLE)
        }
    }
}

fn hand_off(session: &mut CallSession, say: &str) -> TurnOutcome {
    session.stage = SessionStage::Handoff;
    TurnOutcome::transfer(say)
}

fn reprompt_for(session: &CallSession, business: &BusinessProfile) -> String {
    match session.stage {
        SessionStage::Greeting | SessionStage::CollectingService => format!(
            "What would you like to book? We offer {}.",
            business.service_names()
        ),
        SessionStage::CollectingIdentity => "Can I get your name, please?".to_string(),
        SessionStage::CollectingTime | SessionStage::ProposingSlot => {
            "What day and time work best for you?".to_string()
        }
        SessionStage::AwaitingConfirmation | SessionStage::Booking => {
            "Does the time I offered work for you?".to_string()
        }
        SessionStage::Completed | SessionStage::Failed | SessionStage::Handoff => {
            "Is there anything else I can help you with?".to_string()
        }
    }
}

async fn extract(
    state: &Arc<AppState>,
    session: &CallSession,
    business: &BusinessProfile,
    now: DateTime<Utc>,
) -> Result<ExtractedUtterance, DialogError> {
    let tz = business.tz()?;
    let local_now = now.with_timezone(&tz);
    let context = format!(
        "Business: {}. Services offered: {}. Hours: {}. Today is {} ({}). Timezone: {}.",
        business.name,
        business.service_names(),
        business.hours.to_human_readable(),
        local_now.format("%Y-%m-%d"),
        local_now.format("%A"),
        business.timezone,
    );

    // the one suspension point in a turn; the store lock is never held here
    extract_utterance(state.understanding.as_ref(), &session.turns, &context)
        .await
        .map_err(|e| DialogError::Upstream(e.to_string()))
}

fn require_business(state: &Arc<AppState>, business_id: &str) -> anyhow::Result<BusinessProfile> {
    let db = state.db.lock().unwrap();
    queries::get_business(&db, business_id)?
        .ok_or_else(|| anyhow::anyhow!("unknown business: {business_id}"))
}

fn notify_booked(
    state: &Arc<AppState>,
    business: &BusinessProfile,
    appointment: &Appointment,
    when: &str,
) {
    let state = state.clone();
    let customer = appointment.customer_phone.clone();
    let customer_name = appointment
        .customer_name
        .clone()
        .unwrap_or_else(|| "A customer".to_string());
    let owner = business.notify_phone.clone();
    let business_name = business.name.clone();
    let when = when.to_string();

    tokio::spawn(async move {
        let msg = format!("Your {business_name} appointment is confirmed for {when}.");
        if let Err(e) = state.notifier.notify(&customer, &msg).await {
            tracing::warn!(error = %e, "customer booking notification failed");
        }
        if !owner.is_empty() {
            let msg = format!("New booking: {customer_name} on {when} ({customer}).");
            if let Err(e) = state.notifier.notify(&owner, &msg).await {
                tracing::warn!(error = %e, "owner booking notification failed");
            }
        }
    });
}

fn notify_follow_up(state: &Arc<AppState>, business: &BusinessProfile, session: &CallSession) {
    if business.notify_phone.is_empty() {
        return;
    }
    let state = state.clone();
    let owner = business.notify_phone.clone();
    let caller = session.caller_phone.clone();

    tokio::spawn(async move {
        let msg = format!("A booking attempt from {caller} failed mid-call. Please follow up.");
        if let Err(e) = state.notifier.notify(&owner, &msg).await {
            tracing::warn!(error = %e, "follow-up notification failed");
        }
    });
}
