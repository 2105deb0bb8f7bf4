use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::intent::TimePreference;

/// Dialogue stages. Sessions move forward only, except the explicit
/// re-ask transitions (decline or validation failure re-opening an
/// earlier collection stage).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStage {
    Greeting,
    CollectingService,
    CollectingIdentity,
    CollectingTime,
    ProposingSlot,
    AwaitingConfirmation,
    Booking,
    Completed,
    Failed,
    Handoff,
}

impl SessionStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStage::Greeting => "greeting",
            SessionStage::CollectingService => "collecting_service",
            SessionStage::CollectingIdentity => "collecting_identity",
            SessionStage::CollectingTime => "collecting_time",
            SessionStage::ProposingSlot => "proposing_slot",
            SessionStage::AwaitingConfirmation => "awaiting_confirmation",
            SessionStage::Booking => "booking",
            SessionStage::Completed => "completed",
            SessionStage::Failed => "failed",
            SessionStage::Handoff => "handoff",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "collecting_service" => SessionStage::CollectingService,
            "collecting_identity" => SessionStage::CollectingIdentity,
            "collecting_time" => SessionStage::CollectingTime,
            "proposing_slot" => SessionStage::ProposingSlot,
            "awaiting_confirmation" => SessionStage::AwaitingConfirmation,
            "booking" => SessionStage::Booking,
            "completed" => SessionStage::Completed,
            "failed" => SessionStage::Failed,
            "handoff" => SessionStage::Handoff,
            _ => SessionStage::Greeting,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStage::Completed | SessionStage::Failed | SessionStage::Handoff
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallTurn {
    pub role: String,
    pub text: String,
}

impl CallTurn {
    pub fn caller(text: &str) -> Self {
        Self {
            role: "user".to_string(),
            text: text.to_string(),
        }
    }

    pub fn assistant(text: &str) -> Self {
        Self {
            role: "assistant".to_string(),
            text: text.to_string(),
        }
    }
}

/// Per-call conversation state. Owned exclusively by the conversation
/// engine; reclaimed on a terminal stage or by the inactivity sweep.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: String,
    pub business_id: String,
    pub caller_phone: String,
    pub stage: SessionStage,
    pub service_id: Option<String>,
    pub customer_name: Option<String>,
    pub time_preference: Option<TimePreference>,
    pub proposed_slot_id: Option<String>,
    pub rejected_slot_ids: Vec<String>,
    pub turns: Vec<CallTurn>,
    pub retries: i32,
    pub silences: i32,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl CallSession {
    pub fn new(call_id: &str, business_id: &str, caller_phone: &str, now: DateTime<Utc>) -> Self {
        Self {
            call_id: call_id.to_string(),
            business_id: business_id.to_string(),
            caller_phone: caller_phone.to_string(),
            stage: SessionStage::Greeting,
            service_id: None,
            customer_name: None,
            time_preference: None,
            proposed_slot_id: None,
            rejected_slot_ids: vec![],
            turns: vec![],
            retries: 0,
            silences: 0,
            created_at: now,
            last_activity: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_round_trip() {
        for s in [
            SessionStage::Greeting,
            SessionStage::CollectingService,
            SessionStage::CollectingIdentity,
            SessionStage::CollectingTime,
            SessionStage::ProposingSlot,
            SessionStage::AwaitingConfirmation,
            SessionStage::Booking,
            SessionStage::Completed,
            SessionStage::Failed,
            SessionStage::Handoff,
        ] {
            assert_eq!(SessionStage::parse(s.as_str()), s);
        }
    }

    #[test]
    fn test_terminal_stages() {
        assert!(SessionStage::Completed.is_terminal());
        assert!(SessionStage::Failed.is_terminal());
        assert!(SessionStage::Handoff.is_terminal());
        assert!(!SessionStage::AwaitingConfirmation.is_terminal());
    }
}
