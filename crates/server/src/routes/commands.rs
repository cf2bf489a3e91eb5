//! Command endpoint handlers.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use validator::Validate;

use crate::app::AppState;
use crate::error::ApiError;
use domain::models::{Command, SubmitCommandRequest};

/// User identity injected by the outer authentication layer.
fn user_id_from(headers: &HeaderMap) -> i64 {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Submit a command for delivery.
///
/// POST /api/commands
pub async fn submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SubmitCommandRequest>,
) -> Result<Json<Command>, ApiError> {
    request.validate()?;
    if state.devices.find_by_id(request.device_id).await?.is_none() {
        return Err(ApiError::NotFound("Device not found".to_string()));
    }
    let command = state
        .engine
        .submit(request, user_id_from(&headers))
        .await?;
    Ok(Json(command))
}

/// Cancel a non-terminal command.
///
/// POST /api/commands/{id}/cancel
pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Command>, ApiError> {
    Ok(Json(state.engine.cancel(id).await?))
}

/// Re-queue a failed command.
///
/// POST /api/commands/{id}/retry
pub async fn retry(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Command>, ApiError> {
    Ok(Json(state.engine.retry(id).await?))
}

/// Query parameters for listing commands.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListCommandsQuery {
    pub device_id: Option<i64>,
}

/// List commands, optionally scoped to one device.
///
/// GET /api/commands?deviceId=..
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListCommandsQuery>,
) -> Result<Json<Vec<Command>>, ApiError> {
    Ok(Json(state.commands.list(query.device_id).await?))
}
