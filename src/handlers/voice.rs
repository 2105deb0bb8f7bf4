use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::Form;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;

use crate::db::queries;
use crate::services::conversation::{self, CallAction, TurnOutcome};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct VoiceWebhookForm {
    #[serde(rename = "CallSid")]
    pub call_sid: String,
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "To")]
    pub to: String,
    #[serde(rename = "SpeechResult")]
    pub speech_result: Option<String>,
}

#[derive(Deserialize)]
pub struct VoiceStatusForm {
    #[serde(rename = "CallSid")]
    pub call_sid: String,
    #[serde(rename = "CallStatus")]
    pub call_status: String,
}

fn validate_twilio_signature(
    auth_token: &str,
    signature: &str,
    url: &str,
    params: &[(&str, &str)],
) -> bool {
    // Build the data to sign: URL + sorted params concatenated
    let mut data = url.to_string();
    let mut sorted_params = params.to_vec();
    sorted_params.sort_by(|a, b| a.0.cmp(b.0));
    for (key, value) in &sorted_params {
        data.push_str(key);
        data.push_str(value);
    }

    let mut mac = match Hmac::<Sha1>::new_from_slice(auth_token.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(data.as_bytes());
    let result = mac.finalize().into_bytes();
    let expected = base64::engine::general_purpose::STANDARD.encode(result);

    expected == signature
}

fn check_signature(state: &AppState, headers: &HeaderMap, path: &str, params: &[(&str, &str)]) -> bool {
    // empty auth token = dev mode, skip validation
    if state.config.twilio_auth_token.is_empty() {
        return true;
    }

    let signature = headers
        .get("x-twilio-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if signature.is_empty() {
        tracing::warn!("missing X-Twilio-Signature header");
        return false;
    }

    // reconstruct webhook URL, honoring proxy headers
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("https");
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get("host"))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let url = format!("{proto}://{host}{path}");

    if !validate_twilio_signature(&state.config.twilio_auth_token, signature, &url, params) {
        tracing::warn!("invalid Twilio signature");
        return false;
    }
    true
}

/// Telephony entry point. The first webhook for a call has no speech and
/// opens the session; every later one carries the recognized utterance.
/// A gather timeout posts with empty speech, which the engine treats as
/// silence.
pub async fn voice_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<VoiceWebhookForm>,
) -> Response {
    let speech = form.speech_result.as_deref().unwrap_or("").trim().to_string();

    tracing::info!(call_id = %form.call_sid, from = %form.from, speech = %speech, "incoming voice event");

    let params = [
        ("CallSid", form.call_sid.as_str()),
        ("From", form.from.as_str()),
        ("To", form.to.as_str()),
        ("SpeechResult", form.speech_result.as_deref().unwrap_or("")),
    ];
    if !check_signature(&state, &headers, "/webhook/voice", &params) {
        return (axum::http::StatusCode::FORBIDDEN, "Invalid signature").into_response();
    }

    let business = {
        let db = state.db.lock().unwrap();
        match queries::business_by_phone(&db, &form.to) {
            Ok(Some(b)) => b,
            Ok(None) => {
                tracing::warn!(to = %form.to, "call to unconfigured number");
                return twiml_say_and_hangup(
                    "This number is not set up for bookings. Please try again later. Goodbye.",
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to resolve business for call");
                return fallback_twiml();
            }
        }
    };

    let has_session = match state.sessions.load(&form.call_sid) {
        Ok(session) => session.is_some(),
        Err(e) => {
            tracing::error!(error = %e, "failed to load session");
            return fallback_twiml();
        }
    };

    let result = if has_session {
        conversation::advance(&state, &form.call_sid, &speech).await
    } else {
        conversation::begin(&state, &form.call_sid, &business.id, &form.from).await
    };

    match result {
        Ok(outcome) => outcome_twiml(&outcome, business.transfer_phone.as_deref()),
        Err(e) => {
            tracing::error!(error = %e, call_id = %form.call_sid, "conversation processing failed");
            fallback_twiml()
        }
    }
}

/// Call status callback: terminal statuses tear the session down and
/// release any held slot without needing a closing utterance.
pub async fn voice_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<VoiceStatusForm>,
) -> Response {
    let params = [
        ("CallSid", form.call_sid.as_str()),
        ("CallStatus", form.call_status.as_str()),
    ];
    if !check_signature(&state, &headers, "/webhook/voice/status", &params) {
        return (axum::http::StatusCode::FORBIDDEN, "Invalid signature").into_response();
    }

    if matches!(
        form.call_status.as_str(),
        "completed" | "busy" | "failed" | "no-answer" | "canceled"
    ) {
        if let Err(e) = conversation::hangup(&state, &form.call_sid) {
            tracing::error!(error = %e, call_id = %form.call_sid, "call teardown failed");
        }
    }

    empty_twiml()
}

fn outcome_twiml(outcome: &TurnOutcome, transfer_phone: Option<&str>) -> Response {
    let say = xml_escape(&outcome.say);
    let body = match outcome.action {
        CallAction::Continue => format!(
            "<Response><Say>{say}</Say><Gather input=\"speech\" action=\"/webhook/voice\" method=\"POST\" speechTimeout=\"auto\" actionOnEmptyResult=\"true\"/></Response>"
        ),
        CallAction::End => format!("<Response><Say>{say}</Say><Hangup/></Response>"),
        CallAction::Transfer => match transfer_phone {
            Some(number) => format!(
                "<Response><Say>{say}</Say><Dial>{}</Dial></Response>",
                xml_escape(number)
            ),
            // no human to dial; the handoff message already offers a callback
            None => format!("<Response><Say>{say}</Say><Hangup/></Response>"),
        },
    };
    xml_response(body)
}

fn twiml_say_and_hangup(say: &str) -> Response {
    xml_response(format!(
        "<Response><Say>{}</Say><Hangup/></Response>",
        xml_escape(say)
    ))
}

fn fallback_twiml() -> Response {
    twiml_say_and_hangup("Sorry, we're having trouble right now. Please call back in a few minutes. Goodbye.")
}

fn empty_twiml() -> Response {
    xml_response("<Response></Response>".to_string())
}

fn xml_response(body: String) -> Response {
    ([(header::CONTENT_TYPE, "application/xml")], body).into_response()
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xml_escape() {
        assert_eq!(xml_escape("a & b <c>"), "a &amp; b &lt;c&gt;");
    }

    #[test]
    fn test_signature_validation_round_trip() {
        let token = "secret";
        let url = "https://example.com/webhook/voice";
        let params = [("CallSid", "CA123"), ("From", "+15551110000")];

        // compute the expected signature the way Twilio does
        let mut data = url.to_string();
        let mut sorted = params.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        for (k, v) in &sorted {
            data.push_str(k);
            data.push_str(v);
        }
        let mut mac = Hmac::<Sha1>::new_from_slice(token.as_bytes()).unwrap();
        mac.update(data.as_bytes());
        let signature =
            base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        assert!(validate_twilio_signature(token, &signature, url, &params));
        assert!(!validate_twilio_signature(token, "bogus", url, &params));
    }
}
