//! Position endpoint handlers.

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::app::AppState;
use crate::error::ApiError;
use domain::models::Position;

/// Latest stored position per device.
///
/// GET /api/positions/latest
pub async fn latest(State(state): State<AppState>) -> Result<Json<Vec<Position>>, ApiError> {
    let mut positions = state.positions.latest_per_device().await?;
    positions.truncate(state.config.limits.position_batch_size);
    Ok(Json(positions))
}

/// Query parameters for position history.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub device_id: i64,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// Position history for one device, ascending by server time.
///
/// GET /api/positions/history?deviceId=..&from=..&to=..
pub async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Position>>, ApiError> {
    let to = query.to.unwrap_or_else(Utc::now);
    let from = query.from.unwrap_or(to - Duration::hours(24));
    if from > to {
        return Err(ApiError::Validation("from must precede to".to_string()));
    }
    let mut positions = state.positions.history(query.device_id, from, to).await?;
    positions.truncate(state.config.limits.position_batch_size);
    Ok(Json(positions))
}
