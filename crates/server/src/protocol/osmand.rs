//! OsmAnd HTTP protocol.
//!
//! Accepts both the flat query-string shape (`id`, `lat`, `lon`,
//! `timestamp`, `speed`, ...) and the nested JSON shape (`device_id` plus a
//! `location` object). Runs over the HTTP listener; the framer treats a
//! request body as one frame so the handler contract stays uniform.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::HashMap;

use domain::models::{keys, Command, DecodedPosition, Device};

use super::{CommandEncodeError, Decoded, DecodeContext, DecodeError, FrameOutcome, Protocol};

pub const PROTOCOL_NAME: &str = "osmand";

/// OsmAnd protocol handler.
#[derive(Debug, Default)]
pub struct OsmandProtocol;

/// Nested JSON payload sent by OsmAnd-compatible mobile clients.
#[derive(Debug, Deserialize)]
pub struct JsonPayload {
    pub device_id: String,
    pub location: JsonLocation,
    pub battery: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct JsonLocation {
    pub timestamp: Option<DateTime<Utc>>,
    pub coords: JsonCoords,
    #[serde(default)]
    pub is_moving: Option<bool>,
    pub event: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct JsonCoords {
    pub latitude: f64,
    pub longitude: f64,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub altitude: Option<f64>,
    pub accuracy: Option<f64>,
}

impl OsmandProtocol {
    pub fn new() -> Self {
        Self
    }

    fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
        if let Ok(epoch) = value.parse::<i64>() {
            // Millisecond stamps are 13 digits; second stamps 10.
            let instant = if epoch > 10_000_000_000 {
                Utc.timestamp_millis_opt(epoch).single()
            } else {
                Utc.timestamp_opt(epoch, 0).single()
            };
            return instant;
        }
        value.parse::<DateTime<Utc>>().ok()
    }

    fn parse_bool(value: &str) -> Option<bool> {
        match value {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            _ => None,
        }
    }

    /// Decodes the flat query-parameter shape.
    pub fn decode_query(params: &HashMap<String, String>) -> Result<DecodedPosition, DecodeError> {
        let unique_id = params
            .get("id")
            .or_else(|| params.get("deviceid"))
            .ok_or_else(|| DecodeError::BadFrame("missing id".to_string()))?;
        let mut position = DecodedPosition::new(unique_id.clone(), PROTOCOL_NAME);

        let latitude = params
            .get("lat")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| DecodeError::BadFrame("missing or bad lat".to_string()))?;
        let longitude = params
            .get("lon")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| DecodeError::BadFrame("missing or bad lon".to_string()))?;
        position.latitude = latitude;
        position.longitude = longitude;

        position.fix_time = params
            .get("timestamp")
            .and_then(|v| Self::parse_timestamp(v));
        position.device_time = position.fix_time;
        position.speed = params.get("speed").and_then(|v| v.parse().ok());
        position.course = params
            .get("course")
            .or_else(|| params.get("bearing"))
            .or_else(|| params.get("heading"))
            .and_then(|v| v.parse().ok());
        position.altitude = params.get("altitude").and_then(|v| v.parse().ok());
        position.accuracy = params.get("accuracy").and_then(|v| v.parse().ok());
        // Reports without an explicit validity flag count as valid.
        position.valid = params
            .get("valid")
            .and_then(|v| Self::parse_bool(v))
            .unwrap_or(true);

        if let Some(battery) = params.get("battery").and_then(|v| v.parse::<f64>().ok()) {
            position.attributes.set(keys::BATTERY_LEVEL, battery);
        }
        if let Some(motion) = params.get("motion").and_then(|v| Self::parse_bool(v)) {
            position.attributes.set(keys::MOTION, motion);
        }
        if let Some(ignition) = params.get("ignition").and_then(|v| Self::parse_bool(v)) {
            position.attributes.set(keys::IGNITION, ignition);
        }
        if let Some(driver) = params.get("driverUniqueId") {
            position.attributes.set(keys::DRIVER_UNIQUE_ID, driver.as_str());
        }

        Ok(position)
    }

    /// Decodes the nested JSON shape.
    pub fn decode_json(payload: &JsonPayload) -> Result<DecodedPosition, DecodeError> {
        let mut position = DecodedPosition::new(payload.device_id.clone(), PROTOCOL_NAME);
        position.latitude = payload.location.coords.latitude;
        position.longitude = payload.location.coords.longitude;
        position.fix_time = payload.location.timestamp;
        position.device_time = payload.location.timestamp;
        position.speed = payload.location.coords.speed;
        position.course = payload.location.coords.heading;
        position.altitude = payload.location.coords.altitude;
        position.accuracy = payload.location.coords.accuracy;
        position.valid = true;

        if let Some(moving) = payload.location.is_moving {
            position.attributes.set(keys::MOTION, moving);
        }
        if let Some(battery) = payload.battery {
            position.attributes.set(keys::BATTERY_LEVEL, battery);
        }
        if let Some(event) = &payload.location.event {
            position.attributes.set(keys::EVENT, event.as_str());
        }
        Ok(position)
    }
}

impl Protocol for OsmandProtocol {
    fn name(&self) -> &'static str {
        PROTOCOL_NAME
    }

    fn frame(&self, buf: &[u8], _max_frame_len: usize) -> FrameOutcome {
        if buf.is_empty() {
            FrameOutcome::NeedMore
        } else {
            // A request body arrives whole.
            FrameOutcome::Frame { len: buf.len() }
        }
    }

    fn decode(&self, frame: &[u8], ctx: &mut DecodeContext) -> Result<Decoded, DecodeError> {
        let text = std::str::from_utf8(frame)
            .map_err(|_| DecodeError::BadFrame("body is not UTF-8".to_string()))?;

        let position = if text.trim_start().starts_with('{') {
            let payload: JsonPayload = serde_json::from_str(text)
                .map_err(|e| DecodeError::BadFrame(format!("bad json body: {}", e)))?;
            Self::decode_json(&payload)?
        } else {
            let params: HashMap<String, String> = text
                .split('&')
                .filter_map(|pair| {
                    let (k, v) = pair.split_once('=')?;
                    Some((k.to_string(), v.to_string()))
                })
                .collect();
            Self::decode_query(&params)?
        };

        ctx.unique_id = Some(position.unique_id.clone());
        Ok(Decoded::Positions(vec![position]))
    }

    fn encode_command(
        &self,
        command: &Command,
        _device: &Device,
    ) -> Result<Vec<u8>, CommandEncodeError> {
        // OsmAnd clients poll over HTTP; there is no push channel.
        Err(CommandEncodeError::Unsupported(command.command_type))
    }
}
