//! Event endpoint handlers.

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::app::AppState;
use crate::error::ApiError;
use domain::models::{Event, EventType};
use domain::services::EventQuery;

/// Query parameters for listing events.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEventsQuery {
    pub device_id: Option<i64>,
    /// Comma-separated event type names.
    #[serde(rename = "type")]
    pub types: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Historical events with filters.
///
/// GET /api/events?deviceId=..&type=geofenceEnter,geofenceExit&from=..&to=..
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListEventsQuery>,
) -> Result<Json<Vec<Event>>, ApiError> {
    let types = match &query.types {
        Some(names) => {
            let mut types = Vec::new();
            for name in names.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                match EventType::parse(name) {
                    Some(t) => types.push(t),
                    None => {
                        return Err(ApiError::Validation(format!("unknown event type: {}", name)))
                    }
                }
            }
            Some(types)
        }
        None => None,
    };

    let events = state
        .events
        .query(EventQuery {
            device_id: query.device_id,
            types,
            from: query.from,
            to: query.to,
            limit: query.limit,
        })
        .await?;
    Ok(Json(events))
}
