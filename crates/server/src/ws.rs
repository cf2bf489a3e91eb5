//! Operator WebSocket endpoint.
//!
//! Each connection is one hub subscriber. Clients send
//! `{"type":"heartbeat"}` and `{"type":"subscribe","data":{"type":...}}`
//! frames; the server pushes hub messages matching the subscription set and
//! the user's device visibility, plus periodic heartbeats. A subscriber
//! that lags past its queue bound receives a `stale` frame instead of the
//! dropped messages.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::app::AppState;
use crate::hub::{ServerFrame, Topic};

#[derive(Debug, Deserialize)]
struct ClientFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// `GET /ws/{user_id}`: upgrades to the live update channel.
pub async fn ws_handler(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_socket(socket, user_id, state))
}

async fn handle_socket(mut socket: WebSocket, user_id: i64, state: AppState) {
    let mut rx = state.hub.subscribe();
    let heartbeat_interval = state.hub.settings().heartbeat_interval;
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    let mut subscriptions: HashSet<Topic> = HashSet::new();
    let mut last_activity = Instant::now();

    metrics::gauge!("ws_subscribers_active").increment(1.0);
    debug!(user_id, "Operator connected");

    let hello = ServerFrame::Info {
        message: "connected".to_string(),
    };
    if send_frame(&mut socket, &hello).await.is_err() {
        metrics::gauge!("ws_subscribers_active").decrement(1.0);
        return;
    }

    loop {
        tokio::select! {
            client = socket.recv() => {
                match client {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        handle_client_frame(&text, &mut subscriptions, user_id);
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        last_activity = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(user_id, error = %e, "WebSocket receive failed");
                        break;
                    }
                }
            }
            published = rx.recv() => {
                match published {
                    Ok(message) => {
                        if !subscriptions.contains(&message.topic) {
                            continue;
                        }
                        if !message.recipients.contains(&user_id) {
                            continue;
                        }
                        if send_frame(&mut socket, &message.frame).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(dropped)) => {
                        // Oldest messages were dropped; tell the operator.
                        metrics::counter!("ws_messages_dropped_total").increment(dropped);
                        let stale = ServerFrame::Stale { dropped };
                        if send_frame(&mut socket, &stale).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            _ = heartbeat.tick() => {
                // Two silent intervals mean the peer is gone.
                if last_activity.elapsed() > heartbeat_interval * 2 {
                    debug!(user_id, "Operator missed heartbeats; releasing subscriber");
                    break;
                }
                let frame = ServerFrame::Heartbeat { timestamp: Utc::now() };
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    metrics::gauge!("ws_subscribers_active").decrement(1.0);
    debug!(user_id, "Operator disconnected");
}

fn handle_client_frame(text: &str, subscriptions: &mut HashSet<Topic>, user_id: i64) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(user_id, error = %e, "Malformed client frame");
            return;
        }
    };
    match frame.kind.as_str() {
        "heartbeat" => {}
        "subscribe" => {
            let topic = frame
                .data
                .get("type")
                .and_then(|v| v.as_str())
                .and_then(Topic::parse);
            match topic {
                Some(topic) => {
                    subscriptions.insert(topic);
                    debug!(user_id, ?topic, "Subscription added");
                }
                None => warn!(user_id, "Subscribe frame without a known topic"),
            }
        }
        other => warn!(user_id, kind = %other, "Unknown client frame type"),
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string());
    socket.send(Message::Text(text)).await
}
