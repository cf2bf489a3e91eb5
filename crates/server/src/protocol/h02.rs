//! H02 protocol (ASCII, `*...#` framed).
//!
//! Report shape: `*HQ,<id>,V1,HHMMSS,<A|V>,DDMM.mmmm,<N|S>,DDDMM.mmmm,
//! <E|W>,<speed knots>,<course>,DDMMYY,<status hex>#`. The status word is
//! active-low: a cleared bit raises the matching flag.

use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};

use domain::models::{keys, Command, CommandType, DecodedPosition, Device};
use shared::geodesy::KNOTS_TO_KMH;

use super::{CommandEncodeError, Decoded, DecodeContext, DecodeError, FrameOutcome, Protocol};

pub const PROTOCOL_NAME: &str = "h02";

/// H02 protocol handler.
#[derive(Debug, Default)]
pub struct H02Protocol;

impl H02Protocol {
    pub fn new() -> Self {
        Self
    }

    /// Converts `DDMM.mmmm` (or `DDDMM.mmmm`) plus hemisphere into degrees.
    fn coordinate(value: &str, hemisphere: &str) -> Result<f64, DecodeError> {
        let dot = value
            .find('.')
            .ok_or_else(|| DecodeError::BadFrame(format!("bad coordinate {}", value)))?;
        if dot < 3 {
            return Err(DecodeError::BadFrame(format!("bad coordinate {}", value)));
        }
        let degrees: f64 = value[..dot - 2]
            .parse()
            .map_err(|_| DecodeError::BadFrame(format!("bad coordinate {}", value)))?;
        let minutes: f64 = value[dot - 2..]
            .parse()
            .map_err(|_| DecodeError::BadFrame(format!("bad coordinate {}", value)))?;
        let result = degrees + minutes / 60.0;
        match hemisphere {
            "N" | "E" => Ok(result),
            "S" | "W" => Ok(-result),
            other => Err(DecodeError::BadFrame(format!("bad hemisphere {}", other))),
        }
    }

    fn apply_status(position: &mut DecodedPosition, status: u32) {
        position
            .attributes
            .set(keys::IGNITION, status & (1 << 10) == 0);
        let alarm = if status & (1 << 1) == 0 {
            Some("sos")
        } else if status & 1 == 0 {
            Some("vibration")
        } else if status & (1 << 2) == 0 {
            Some("overspeed")
        } else if status & (1 << 3) == 0 {
            Some("powerCut")
        } else {
            None
        };
        if let Some(alarm) = alarm {
            position.attributes.set(keys::ALARM, alarm);
        }
    }
}

impl Protocol for H02Protocol {
    fn name(&self) -> &'static str {
        PROTOCOL_NAME
    }

    fn frame(&self, buf: &[u8], max_frame_len: usize) -> FrameOutcome {
        if buf.is_empty() {
            return FrameOutcome::NeedMore;
        }
        if buf[0] != b'*' {
            return FrameOutcome::Bad { discard: 1 };
        }
        match buf.iter().position(|&b| b == b'#') {
            Some(end) => FrameOutcome::Frame { len: end + 1 },
            None if buf.len() > max_frame_len => FrameOutcome::Bad { discard: buf.len() },
            None => FrameOutcome::NeedMore,
        }
    }

    fn decode(&self, frame: &[u8], ctx: &mut DecodeContext) -> Result<Decoded, DecodeError> {
        let text = std::str::from_utf8(frame)
            .map_err(|_| DecodeError::BadFrame("frame is not ASCII".to_string()))?
            .trim_start_matches('*')
            .trim_end_matches('#');
        let parts: Vec<&str> = text.split(',').collect();
        if parts.len() < 3 {
            return Err(DecodeError::BadFrame("too few fields".to_string()));
        }

        let unique_id = parts[1].to_string();
        ctx.unique_id = Some(unique_id.clone());

        match parts[2] {
            "V1" => {
                if parts.len() < 13 {
                    return Err(DecodeError::BadFrame(format!(
                        "V1 report has {} fields, expected 13",
                        parts.len()
                    )));
                }
                let mut position = DecodedPosition::new(unique_id, PROTOCOL_NAME);

                let time = NaiveTime::parse_from_str(parts[3], "%H%M%S")
                    .map_err(|e| DecodeError::BadFrame(format!("bad time {}: {}", parts[3], e)))?;
                let date = NaiveDate::parse_from_str(parts[11], "%d%m%y")
                    .map_err(|e| DecodeError::BadFrame(format!("bad date {}: {}", parts[11], e)))?;
                let fix_time = Utc.from_utc_datetime(&date.and_time(time));
                position.fix_time = Some(fix_time);
                position.device_time = Some(fix_time);

                position.valid = parts[4] == "A";
                position.latitude = Self::coordinate(parts[5], parts[6])?;
                position.longitude = Self::coordinate(parts[7], parts[8])?;
                let knots: f64 = parts[9]
                    .parse()
                    .map_err(|_| DecodeError::BadFrame(format!("bad speed {}", parts[9])))?;
                position.speed = Some(knots * KNOTS_TO_KMH);
                position.course = parts[10].parse().ok();

                if let Ok(status) = u32::from_str_radix(parts[12], 16) {
                    Self::apply_status(&mut position, status);
                }
                Ok(Decoded::Positions(vec![position]))
            }
            // Heartbeat subtype used by several firmware revisions.
            "XT" | "V0" => Ok(Decoded::Heartbeat { reply: None }),
            other => Err(DecodeError::UnsupportedKind(other.to_string())),
        }
    }

    fn encode_command(
        &self,
        command: &Command,
        device: &Device,
    ) -> Result<Vec<u8>, CommandEncodeError> {
        let body = match command.command_type {
            CommandType::PositionSingle => "D1".to_string(),
            CommandType::Custom => command
                .parameters
                .get("data")
                .and_then(domain::models::Value::as_str)
                .ok_or(CommandEncodeError::MissingParameter("data"))?,
            other => return Err(CommandEncodeError::Unsupported(other)),
        };
        Ok(format!("*HQ,{},{}#", device.unique_id, body).into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    const SAMPLE: &str =
        "*HQ,4209951296,V1,124433,A,2212.8745,N,11346.6574,E,14.28,028,220925,FFFFFBFF#";

    fn protocol() -> H02Protocol {
        H02Protocol::new()
    }

    fn decode_positions(text: &str) -> Vec<DecodedPosition> {
        let mut ctx = DecodeContext::default();
        match protocol().decode(text.as_bytes(), &mut ctx).unwrap() {
            Decoded::Positions(p) => p,
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_framer() {
        let p = protocol();
        assert_eq!(
            p.frame(SAMPLE.as_bytes(), 2048),
            FrameOutcome::Frame { len: SAMPLE.len() }
        );
        assert_eq!(p.frame(&SAMPLE.as_bytes()[..20], 2048), FrameOutcome::NeedMore);
        assert_eq!(p.frame(b"garbage*HQ", 2048), FrameOutcome::Bad { discard: 1 });
    }

    #[test]
    fn test_decode_v1_report() {
        let positions = decode_positions(SAMPLE);
        assert_eq!(positions.len(), 1);
        let p = &positions[0];
        assert_eq!(p.unique_id, "4209951296");
        assert!(p.valid);
        assert!((p.latitude - 22.214575).abs() < 0.0001);
        assert!((p.longitude - 113.777623).abs() < 0.0001);
        // 14.28 knots to km/h.
        assert!((p.speed.unwrap() - 26.446).abs() < 0.01);
        assert_eq!(p.course, Some(28.0));
        assert_eq!(p.fix_time.unwrap().hour(), 12);
    }

    #[test]
    fn test_decode_southern_western_hemispheres() {
        let frame =
            "*HQ,4209951296,V1,124433,A,0350.6288,S,03836.9285,W,0.00,000,220925,FFFFFBFF#";
        let p = &decode_positions(frame)[0];
        assert!(p.latitude < 0.0);
        assert!(p.longitude < 0.0);
        assert!((p.latitude + 3.843813).abs() < 0.0001);
        assert!((p.longitude + 38.615475).abs() < 0.0001);
    }

    #[test]
    fn test_status_word_ignition_active_low() {
        // Bit 10 cleared: ignition on.
        let frame = "*HQ,1,V1,124433,A,2212.8745,N,11346.6574,E,0.00,000,220925,FFFFFBFF#";
        let p = &decode_positions(frame)[0];
        assert!(p.attributes.bool_of(keys::IGNITION, false));

        // All bits set: ignition off, no alarms.
        let frame = "*HQ,1,V1,124433,A,2212.8745,N,11346.6574,E,0.00,000,220925,FFFFFFFF#";
        let p = &decode_positions(frame)[0];
        assert!(!p.attributes.bool_of(keys::IGNITION, true));
        assert!(!p.attributes.contains(keys::ALARM));
    }

    #[test]
    fn test_status_word_sos() {
        // Bit 1 cleared raises the SOS alarm.
        let frame = "*HQ,1,V1,124433,A,2212.8745,N,11346.6574,E,0.00,000,220925,FFFFFFFD#";
        let p = &decode_positions(frame)[0];
        assert_eq!(p.attributes.str_of(keys::ALARM, ""), "sos");
    }

    #[test]
    fn test_decode_invalid_fix_flag() {
        let frame = "*HQ,1,V1,124433,V,2212.8745,N,11346.6574,E,0.00,000,220925,FFFFFFFF#";
        let p = &decode_positions(frame)[0];
        assert!(!p.valid);
    }

    #[test]
    fn test_decode_heartbeat() {
        let mut ctx = DecodeContext::default();
        let decoded = protocol().decode(b"*HQ,4209951296,XT#", &mut ctx).unwrap();
        assert_eq!(decoded, Decoded::Heartbeat { reply: None });
        assert_eq!(ctx.unique_id.as_deref(), Some("4209951296"));
    }

    #[test]
    fn test_decode_unsupported_kind() {
        let mut ctx = DecodeContext::default();
        let result = protocol().decode(b"*HQ,4209951296,NBR,x#", &mut ctx);
        assert_eq!(result, Err(DecodeError::UnsupportedKind("NBR".to_string())));
    }

    #[test]
    fn test_decode_bad_coordinate() {
        let mut ctx = DecodeContext::default();
        let frame = "*HQ,1,V1,124433,A,garbage,N,11346.6574,E,0.00,000,220925,FFFFFFFF#";
        assert!(matches!(
            protocol().decode(frame.as_bytes(), &mut ctx),
            Err(DecodeError::BadFrame(_))
        ));
    }

    #[test]
    fn test_encode_command_round_trips_through_framer() {
        let now = Utc::now();
        let command = Command {
            id: 1,
            device_id: 7,
            user_id: 1,
            command_type: CommandType::PositionSingle,
            priority: domain::models::CommandPriority::Normal,
            status: domain::models::CommandStatus::Queued,
            parameters: domain::models::AttributeBag::new(),
            raw_command: None,
            text_channel: false,
            queued_at: None,
            sent_at: None,
            delivered_at: None,
            executed_at: None,
            failed_at: None,
            retry_count: 0,
            max_retries: 3,
            expires_at: None,
            response: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        let device = Device {
            id: 7,
            unique_id: "4209951296".to_string(),
            name: "t".to_string(),
            status: domain::models::DeviceStatus::Online,
            last_update: None,
            group_id: None,
            phone: None,
            calendar_id: None,
            expiration_time: None,
            disabled: false,
            accumulators: Default::default(),
            attributes: domain::models::AttributeBag::new(),
        };
        let bytes = protocol().encode_command(&command, &device).unwrap();
        assert_eq!(bytes, b"*HQ,4209951296,D1#");
        assert_eq!(
            protocol().frame(&bytes, 2048),
            FrameOutcome::Frame { len: bytes.len() }
        );
    }
}
