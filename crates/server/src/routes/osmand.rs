//! OsmAnd HTTP ingestion endpoint.
//!
//! Served on the protocol's own port, separate from the operator API.
//! Accepts GET with query parameters and POST with either a form-encoded
//! or nested-JSON body.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use std::collections::HashMap;

use crate::app::AppState;
use crate::pipeline::FrameSource;
use crate::protocol::osmand::{self, OsmandProtocol};
use crate::protocol::{DecodeError, Transport};

/// GET or POST `/` on the OsmAnd port.
pub async fn ingest(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    body: String,
) -> impl IntoResponse {
    let decoded = if params.contains_key("id") || params.contains_key("deviceid") {
        OsmandProtocol::decode_query(&params)
    } else if body.trim_start().starts_with('{') {
        serde_json::from_str::<osmand::JsonPayload>(&body)
            .map_err(|e| DecodeError::BadFrame(format!("bad json body: {}", e)))
            .and_then(|payload| OsmandProtocol::decode_json(&payload))
    } else {
        let form: HashMap<String, String> = body
            .split('&')
            .filter_map(|pair| {
                let (k, v) = pair.split_once('=')?;
                Some((k.to_string(), v.to_string()))
            })
            .collect();
        OsmandProtocol::decode_query(&form)
    };

    match decoded {
        Ok(position) => {
            let port = state
                .config
                .protocols
                .get(osmand::PROTOCOL_NAME)
                .map(|e| e.port)
                .unwrap_or(5055);
            state
                .pipeline
                .submit(
                    position,
                    FrameSource {
                        port,
                        transport: Transport::Http,
                    },
                )
                .await;
            (StatusCode::OK, "OK")
        }
        Err(e) => {
            tracing::warn!(error = %e, "Rejected OsmAnd request");
            (StatusCode::BAD_REQUEST, "invalid request")
        }
    }
}
