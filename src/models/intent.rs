use chrono::{NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use super::business::{parse_local_time, parse_weekday};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallerIntent {
    Schedule,
    ProvideInfo,
    Confirm,
    Decline,
    Question,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeBucket {
    Morning,
    Afternoon,
    Evening,
}

impl TimeBucket {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "morning" => Some(TimeBucket::Morning),
            "afternoon" => Some(TimeBucket::Afternoon),
            "evening" => Some(TimeBucket::Evening),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeBucket::Morning => "morning",
            TimeBucket::Afternoon => "afternoon",
            TimeBucket::Evening => "evening",
        }
    }

    /// Whether a business-local start time falls inside this bucket.
    pub fn contains(&self, t: NaiveTime) -> bool {
        let (from, until) = match self {
            TimeBucket::Morning => (6, 12),
            TimeBucket::Afternoon => (12, 17),
            TimeBucket::Evening => (17, 22),
        };
        let from = NaiveTime::from_hms_opt(from, 0, 0).unwrap_or(NaiveTime::MIN);
        let until = NaiveTime::from_hms_opt(until, 0, 0).unwrap_or(NaiveTime::MIN);
        t >= from && t < until
    }
}

/// A caller's time preference, resolved to concrete values.
/// All fields optional; filters compose (e.g. date + bucket).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TimePreference {
    pub date: Option<NaiveDate>,
    pub weekday: Option<String>,
    pub bucket: Option<TimeBucket>,
    pub time: Option<NaiveTime>,
}

impl TimePreference {
    pub fn is_empty(&self) -> bool {
        self.date.is_none() && self.weekday.is_none() && self.bucket.is_none() && self.time.is_none()
    }

    pub fn weekday(&self) -> Option<Weekday> {
        self.weekday.as_deref().and_then(parse_weekday)
    }

    /// Spoken rendering for "nothing open then" prompts.
    pub fn describe(&self) -> String {
        let mut parts: Vec<String> = vec![];
        if let Some(d) = self.date {
            parts.push(d.format("%B %-d").to_string());
        } else if let Some(w) = self.weekday() {
            parts.push(weekday_name(w).to_string());
        }
        if let Some(b) = &self.bucket {
            parts.push(format!("in the {}", b.as_str()));
        }
        if let Some(t) = self.time {
            parts.push(format!("at {}", t.format("%-I:%M %p")));
        }
        if parts.is_empty() {
            "then".to_string()
        } else {
            parts.join(" ")
        }
    }
}

fn weekday_name(w: Weekday) -> &'static str {
    match w {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// Structured understanding of one caller utterance, as returned by the
/// language collaborator. Every field tolerates absence; a malformed
/// response degrades to `Unknown` with zero confidence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedUtterance {
    #[serde(default)]
    pub intent: CallerIntent,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub weekday: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub confirmation: Option<bool>,
    #[serde(default)]
    pub confidence: f32,
}

impl ExtractedUtterance {
    /// Parse the string-typed time fields into a usable preference.
    /// Unparseable values are dropped rather than surfaced as errors.
    pub fn time_preference(&self) -> Option<TimePreference> {
        let pref = TimePreference {
            date: self
                .date
                .as_deref()
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()),
            weekday: self
                .weekday
                .as_deref()
                .filter(|w| parse_weekday(w).is_some())
                .map(|w| w.to_lowercase()),
            bucket: self.bucket.as_deref().and_then(TimeBucket::parse),
            time: self.time.as_deref().and_then(|t| parse_local_time(t).ok()),
        };
        if pref.is_empty() {
            None
        } else {
            Some(pref)
        }
    }
}
