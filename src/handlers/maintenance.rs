use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use crate::db::queries;
use crate::errors::AppError;
use crate::services::generator;
use crate::state::AppState;

#[derive(Deserialize, Default)]
pub struct GenerateRequest {
    pub days: Option<u32>,
}

/// Regenerate slot inventory for a business over a horizon starting at
/// its local today. Safe to re-run; booked slots are preserved.
pub async fn generate_slots(
    State(state): State<Arc<AppState>>,
    Path(business_id): Path<String>,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let days = request.days.unwrap_or(state.config.horizon_days).min(366);
    if days == 0 {
        return Err(AppError::Invalid("days must be at least 1".to_string()));
    }

    let db = state.db.lock().unwrap();
    let business = queries::get_business(&db, &business_id)?
        .ok_or_else(|| AppError::NotFound(format!("business {business_id}")))?;
    let tz = business
        .tz()
        .map_err(|e| AppError::Invalid(e.to_string()))?;

    let today = Utc::now().with_timezone(&tz).date_naive();
    let outcome = generator::generate(&db, &business, today, days)?;

    Ok(Json(serde_json::json!({
        "business_id": business.id,
        "from": today.to_string(),
        "days": days,
        "created": outcome.created,
        "removed": outcome.removed,
    })))
}
