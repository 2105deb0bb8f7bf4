use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

/// A bookable service from a business's catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub duration_minutes: i64,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayWindow {
    pub day: String,
    pub open: String,
    pub close: String,
}

/// Per-weekday open/close local times. Days absent from the list are closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeeklyHours {
    pub days: Vec<DayWindow>,
}

impl WeeklyHours {
    pub fn from_json(s: &str) -> anyhow::Result<Self> {
        let hours: WeeklyHours = serde_json::from_str(s)?;
        for window in &hours.days {
            parse_weekday(&window.day)
                .ok_or_else(|| anyhow::anyhow!("invalid weekday: {}", window.day))?;
            let open = parse_local_time(&window.open)?;
            let close = parse_local_time(&window.close)?;
            if open >= close {
                anyhow::bail!("open must precede close on {}", window.day);
            }
        }
        Ok(hours)
    }

    /// Local open/close window for a weekday, if the business opens that day.
    pub fn window_for(&self, weekday: Weekday) -> Option<(NaiveTime, NaiveTime)> {
        self.days
            .iter()
            .find(|w| parse_weekday(&w.day) == Some(weekday))
            .and_then(|w| {
                let open = parse_local_time(&w.open).ok()?;
                let close = parse_local_time(&w.close).ok()?;
                Some((open, close))
            })
    }

    pub fn to_human_readable(&self) -> String {
        if self.days.is_empty() {
            return String::new();
        }

        let day_order = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

        let mut sorted = self.days.clone();
        sorted.sort_by_key(|w| {
            day_order
                .iter()
                .position(|d| *d == w.day.to_lowercase())
                .unwrap_or(7)
        });

        sorted
            .iter()
            .map(|w| format!("{}: {}-{}", capitalize(&w.day), w.open, w.close))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Read-only business configuration loaded from the store.
#[derive(Debug, Clone)]
pub struct BusinessProfile {
    pub id: String,
    pub name: String,
    pub phone_number: String,
    pub timezone: String,
    pub hours: WeeklyHours,
    pub services: Vec<Service>,
    pub slot_minutes: i64,
    pub notify_phone: String,
    pub transfer_phone: Option<String>,
}

impl BusinessProfile {
    pub fn tz(&self) -> anyhow::Result<chrono_tz::Tz> {
        self.timezone
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid timezone {}: {e}", self.timezone))
    }

    pub fn service(&self, id: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.id == id)
    }

    /// Match free text against the catalog by service name or keyword.
    pub fn match_service(&self, text: &str) -> Option<&Service> {
        let text = text.to_lowercase();
        self.services.iter().find(|s| {
            text.contains(&s.name.to_lowercase())
                || s.keywords
                    .iter()
                    .any(|k| !k.is_empty() && text.contains(&k.to_lowercase()))
        })
    }

    pub fn service_names(&self) -> String {
        self.services
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub fn parse_weekday(s: &str) -> Option<Weekday> {
    match s.to_lowercase().as_str() {
        "mon" => Some(Weekday::Mon),
        "tue" => Some(Weekday::Tue),
        "wed" => Some(Weekday::Wed),
        "thu" => Some(Weekday::Thu),
        "fri" => Some(Weekday::Fri),
        "sat" => Some(Weekday::Sat),
        "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

pub fn parse_local_time(s: &str) -> anyhow::Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").map_err(|_| anyhow::anyhow!("invalid time format: {s}"))
}

fn capitalize(s: &str) -> String {
    let mut c = s.chars();
    match c.next() {
        None => String::new(),
        Some(f) => f.to_uppercase().to_string() + &c.as_str().to_lowercase(),
    }
}
