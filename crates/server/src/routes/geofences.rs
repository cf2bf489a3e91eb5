//! Geofence endpoint handlers.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::app::AppState;
use crate::error::ApiError;

/// Response for a cache reload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadResponse {
    pub reloaded: usize,
}

/// Rebuild the spatial cache after geofence CRUD changes.
///
/// POST /api/geofences/reload
pub async fn reload(State(state): State<AppState>) -> Result<Json<ReloadResponse>, ApiError> {
    let reloaded = state.geofence_sync.reload().await?;
    Ok(Json(ReloadResponse { reloaded }))
}
