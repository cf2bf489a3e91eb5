//! Device endpoint handlers.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use validator::Validate;

use crate::app::AppState;
use crate::error::ApiError;
use domain::models::Device;

/// List known devices with their live status and accumulators.
///
/// GET /api/devices
pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<Device>>, ApiError> {
    Ok(Json(state.devices.list().await?))
}

/// Request payload for an explicit accumulator mutation.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAccumulatorsRequest {
    #[validate(range(min = 0.0, message = "Total distance must be non-negative"))]
    pub total_distance: Option<f64>,

    #[validate(range(min = 0, message = "Hours must be non-negative"))]
    pub hours: Option<i64>,
}

/// Admin mutation of a device's accumulators (the only path that may move
/// them backwards).
///
/// POST /api/devices/{id}/accumulators
pub async fn update_accumulators(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<UpdateAccumulatorsRequest>,
) -> Result<Json<Device>, ApiError> {
    request.validate()?;
    let mut device = state
        .devices
        .find_by_id(id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Device not found".to_string()))?;

    if let Some(total_distance) = request.total_distance {
        device.accumulators.total_distance = total_distance;
    }
    if let Some(hours) = request.hours {
        device.accumulators.hours = hours;
    }
    state
        .devices
        .update_accumulators(id, device.accumulators.clone())
        .await?;
    Ok(Json(device))
}
