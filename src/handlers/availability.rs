use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{NaiveDate, Utc};
use serde::Deserialize;

use crate::db::queries;
use crate::errors::AppError;
use crate::models::{TimeBucket, TimePreference};
use crate::models::business::{parse_local_time, parse_weekday};
use crate::services::availability;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct AvailabilityQuery {
    pub date: Option<String>,
    pub weekday: Option<String>,
    pub bucket: Option<String>,
    pub time: Option<String>,
    pub limit: Option<usize>,
}

impl AvailabilityQuery {
    fn preference(&self) -> Result<Option<TimePreference>, AppError> {
        let date = match &self.date {
            Some(d) => Some(
                NaiveDate::parse_from_str(d, "%Y-%m-%d")
                    .map_err(|_| AppError::Invalid(format!("invalid date: {d}")))?,
            ),
            None => None,
        };
        let weekday = match &self.weekday {
            Some(w) => {
                parse_weekday(w).ok_or_else(|| AppError::Invalid(format!("invalid weekday: {w}")))?;
                Some(w.to_lowercase())
            }
            None => None,
        };
        let bucket = match &self.bucket {
            Some(b) => Some(
                TimeBucket::parse(b).ok_or_else(|| AppError::Invalid(format!("invalid bucket: {b}")))?,
            ),
            None => None,
        };
        let time = match &self.time {
            Some(t) => {
                Some(parse_local_time(t).map_err(|_| AppError::Invalid(format!("invalid time: {t}")))?)
            }
            None => None,
        };

        let pref = TimePreference {
            date,
            weekday,
            bucket,
            time,
        };
        Ok(if pref.is_empty() { None } else { Some(pref) })
    }
}

pub async fn get_availability(
    State(state): State<Arc<AppState>>,
    Path(business_id): Path<String>,
    Query(query): Query<AvailabilityQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let preference = query.preference()?;
    let limit = query.limit.unwrap_or(10).min(100);

    let db = state.db.lock().unwrap();
    let business = queries::get_business(&db, &business_id)?
        .ok_or_else(|| AppError::NotFound(format!("business {business_id}")))?;
    let tz = business
        .tz()
        .map_err(|e| AppError::Invalid(e.to_string()))?;

    let slots = availability::find_open_slots(&db, &business, preference.as_ref(), Utc::now(), limit)?;

    let items: Vec<serde_json::Value> = slots
        .iter()
        .map(|s| {
            serde_json::json!({
                "id": s.id,
                "start_at": queries::fmt_ts(&s.start_at),
                "end_at": queries::fmt_ts(&s.end_at),
                "local_start": s.local_start(&tz).to_rfc3339(),
                "local_end": s.local_end(&tz).to_rfc3339(),
            })
        })
        .collect();

    Ok(Json(serde_json::json!({ "slots": items })))
}
