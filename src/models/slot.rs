use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// A precomputed fixed-duration bookable window. Instants are absolute;
/// local renderings are derived on demand from the business timezone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarSlot {
    pub id: String,
    pub business_id: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub available: bool,
    pub blocked: bool,
    pub blocked_reason: Option<String>,
}

impl CalendarSlot {
    pub fn local_start(&self, tz: &Tz) -> DateTime<Tz> {
        self.start_at.with_timezone(tz)
    }

    pub fn local_end(&self, tz: &Tz) -> DateTime<Tz> {
        self.end_at.with_timezone(tz)
    }

    /// Rendering used in spoken proposals, e.g. "Tuesday, August 4 at 9:00 AM".
    pub fn spoken_time(&self, tz: &Tz) -> String {
        self.local_start(tz)
            .format("%A, %B %-d at %-I:%M %p")
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spoken_time_in_business_zone() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let slot = CalendarSlot {
            id: "s1".to_string(),
            business_id: "b1".to_string(),
            start_at: "2026-08-04T13:00:00Z".parse().unwrap(),
            end_at: "2026-08-04T14:00:00Z".parse().unwrap(),
            available: true,
            blocked: false,
            blocked_reason: None,
        };
        // 13:00 UTC is 9:00 AM EDT
        assert_eq!(slot.spoken_time(&tz), "Tuesday, August 4 at 9:00 AM");
    }
}
