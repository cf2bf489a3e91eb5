//! Suntech ST-series protocol (ASCII, `;`-separated, CR-terminated).
//!
//! Report layout for STT frames, by field index:
//! 0 header (`ST300STT`), 1 device id, 2 firmware, 3 model code, 4 date
//! (`YYYYMMDD`), 5 time (`HH:MM:SS`), 6 cell info, 7 latitude, 8 longitude,
//! 9 speed (km/h), 10 course, 11 satellites, 12 fix flag, 13 odometer (m),
//! 14 backup power (V), 15 IO bit string (ignition first), remainder
//! model-specific.

use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};

use domain::models::{keys, Command, CommandType, DecodedPosition, Device};

use super::{CommandEncodeError, Decoded, DecodeContext, DecodeError, FrameOutcome, Protocol};

pub const PROTOCOL_NAME: &str = "suntech";

/// Suntech protocol handler.
#[derive(Debug, Default)]
pub struct SuntechProtocol;

impl SuntechProtocol {
    pub fn new() -> Self {
        Self
    }

    fn decode_position(parts: &[&str]) -> Result<DecodedPosition, DecodeError> {
        if parts.len() < 16 {
            return Err(DecodeError::BadFrame(format!(
                "report has {} fields, expected at least 16",
                parts.len()
            )));
        }

        let unique_id = parts[1].to_string();
        if unique_id.is_empty() {
            return Err(DecodeError::BadFrame("empty device id".to_string()));
        }

        let mut position = DecodedPosition::new(unique_id, PROTOCOL_NAME);

        let date = NaiveDate::parse_from_str(parts[4], "%Y%m%d")
            .map_err(|e| DecodeError::BadFrame(format!("bad date {}: {}", parts[4], e)))?;
        let time = NaiveTime::parse_from_str(parts[5], "%H:%M:%S")
            .map_err(|e| DecodeError::BadFrame(format!("bad time {}: {}", parts[5], e)))?;
        // Device clocks report UTC.
        let fix_time = Utc.from_utc_datetime(&date.and_time(time));
        position.fix_time = Some(fix_time);
        position.device_time = Some(fix_time);

        position.latitude = parts[7]
            .parse()
            .map_err(|_| DecodeError::BadFrame(format!("bad latitude {}", parts[7])))?;
        position.longitude = parts[8]
            .parse()
            .map_err(|_| DecodeError::BadFrame(format!("bad longitude {}", parts[8])))?;
        // Speed is already km/h on this protocol.
        position.speed = parts[9].parse().ok();
        position.course = parts[10].parse().ok();
        position.valid = parts[12] == "1";

        if let Ok(satellites) = parts[11].parse::<i64>() {
            position.attributes.set(keys::SATELLITES, satellites);
        }
        if let Ok(odometer) = parts[13].parse::<i64>() {
            position.attributes.set(keys::ODOMETER, odometer);
        }
        if let Ok(power) = parts[14].parse::<f64>() {
            position.attributes.set(keys::POWER, power);
        }
        if !parts[2].is_empty() {
            position.attributes.set(keys::FIRMWARE_VERSION, parts[2]);
        }

        let io = parts[15];
        if let Some(first) = io.chars().next() {
            position.attributes.set(keys::IGNITION, first == '1');
        }
        if let Some(second) = io.chars().nth(1) {
            position.attributes.set(keys::DOOR, second == '1');
        }

        Ok(position)
    }

    fn command_body(command: &Command) -> Result<String, CommandEncodeError> {
        let params = &command.parameters;
        match command.command_type {
            CommandType::Reboot => Ok("Reboot".to_string()),
            CommandType::PositionSingle => Ok("StatusReq".to_string()),
            CommandType::Setinterval => {
                let interval = params
                    .get("interval")
                    .and_then(domain::models::Value::as_int)
                    .ok_or(CommandEncodeError::MissingParameter("interval"))?;
                Ok(format!("SetInterval;{}", interval))
            }
            CommandType::Setoverspeed => {
                let limit = params
                    .get("speedLimit")
                    .and_then(domain::models::Value::as_double)
                    .ok_or(CommandEncodeError::MissingParameter("speedLimit"))?;
                Ok(format!("SetSpeedLimit;{}", limit))
            }
            CommandType::Setoutput => {
                let output = params
                    .get("outputId")
                    .and_then(domain::models::Value::as_int)
                    .ok_or(CommandEncodeError::MissingParameter("outputId"))?;
                let state = params
                    .get("outputState")
                    .and_then(domain::models::Value::as_bool)
                    .ok_or(CommandEncodeError::MissingParameter("outputState"))?;
                Ok(format!("SetOutput;{};{}", output, i32::from(state)))
            }
            CommandType::EngineStart => Ok("Enable".to_string()),
            CommandType::EngineStop => Ok("Disable".to_string()),
            CommandType::Custom => params
                .get("data")
                .and_then(domain::models::Value::as_str)
                .ok_or(CommandEncodeError::MissingParameter("data")),
            other => Err(CommandEncodeError::Unsupported(other)),
        }
    }
}

impl Protocol for SuntechProtocol {
    fn name(&self) -> &'static str {
        PROTOCOL_NAME
    }

    fn frame(&self, buf: &[u8], max_frame_len: usize) -> FrameOutcome {
        match buf.iter().position(|&b| b == b'\r' || b == b'\n') {
            Some(end) => FrameOutcome::Frame { len: end + 1 },
            None if buf.len() > max_frame_len => FrameOutcome::Bad { discard: buf.len() },
            None => FrameOutcome::NeedMore,
        }
    }

    fn decode(&self, frame: &[u8], ctx: &mut DecodeContext) -> Result<Decoded, DecodeError> {
        let text = std::str::from_utf8(frame)
            .map_err(|_| DecodeError::BadFrame("frame is not ASCII".to_string()))?
            .trim_end_matches(['\r', '\n'])
            .trim();
        if text.is_empty() {
            return Ok(Decoded::Ignored);
        }

        let parts: Vec<&str> = text.split(';').collect();
        let header = parts[0];

        if header.ends_with("ALV") {
            if parts.len() > 1 {
                ctx.unique_id = Some(parts[1].to_string());
            }
            return Ok(Decoded::Heartbeat { reply: None });
        }

        if header.ends_with("STT") || header.ends_with("EMG") || header.ends_with("EVT") {
            let mut position = Self::decode_position(&parts)?;
            if header.ends_with("EMG") {
                position.attributes.set(keys::ALARM, "sos");
            }
            ctx.unique_id = Some(position.unique_id.clone());
            return Ok(Decoded::Positions(vec![position]));
        }

        if header.ends_with("CMD") || header.ends_with("RES") {
            if parts.len() > 1 {
                ctx.unique_id = Some(parts[1].to_string());
            }
            return Ok(Decoded::CommandResponse {
                executed: true,
                response: text.to_string(),
            });
        }

        Err(DecodeError::UnsupportedKind(header.to_string()))
    }

    fn encode_command(
        &self,
        command: &Command,
        device: &Device,
    ) -> Result<Vec<u8>, CommandEncodeError> {
        let body = Self::command_body(command)?;
        Ok(format!("ST300CMD;{};02;{}\r", device.unique_id, body).into_bytes())
    }

    fn encode_sms_command(
        &self,
        command: &Command,
        _device: &Device,
    ) -> Result<String, CommandEncodeError> {
        Self::command_body(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;
    use domain::models::{AttributeBag, CommandPriority, CommandStatus};

    const SAMPLE: &str = "ST300STT;907126119;04;1097B;20250908;12:44:33;33e530;-03.843813;-038.615475;000.013;000.00;11;1;26663840;14.07;000000;1;0019;295746;0.0;0;0;00000000000000;0";

    fn protocol() -> SuntechProtocol {
        SuntechProtocol::new()
    }

    fn decode_one(text: &str) -> Decoded {
        let mut ctx = DecodeContext::default();
        protocol().decode(text.as_bytes(), &mut ctx).unwrap()
    }

    fn command(command_type: CommandType, parameters: AttributeBag) -> Command {
        let now = Utc::now();
        Command {
            id: 1,
            device_id: 7,
            user_id: 1,
            command_type,
            priority: CommandPriority::Normal,
            status: CommandStatus::Queued,
            parameters,
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
        }
    }

    fn device() -> Device {
        Device {
            id: 7,
            unique_id: "907126119".to_string(),
            name: "t".to_string(),
            status: domain::models::DeviceStatus::Online,
            last_update: None,
            group_id: None,
            phone: None,
            calendar_id: None,
            expiration_time: None,
            disabled: false,
            accumulators: Default::default(),
            attributes: AttributeBag::new(),
        }
    }

    #[test]
    fn test_framer_splits_on_cr() {
        let p = protocol();
        let mut buf = SAMPLE.as_bytes().to_vec();
        assert_eq!(p.frame(&buf, 2048), FrameOutcome::NeedMore);
        buf.push(b'\r');
        assert_eq!(p.frame(&buf, 2048), FrameOutcome::Frame { len: buf.len() });
    }

    #[test]
    fn test_framer_bounds_memory() {
        let p = protocol();
        let buf = vec![b'A'; 3000];
        assert_eq!(p.frame(&buf, 2048), FrameOutcome::Bad { discard: 3000 });
    }

    #[test]
    fn test_decode_sample_report() {
        let decoded = decode_one(SAMPLE);
        let positions = match decoded {
            Decoded::Positions(p) => p,
            other => panic!("unexpected decode: {:?}", other),
        };
        assert_eq!(positions.len(), 1);
        let p = &positions[0];
        assert_eq!(p.unique_id, "907126119");
        assert_eq!(p.latitude, -3.843813);
        assert_eq!(p.longitude, -38.615475);
        assert_eq!(p.speed, Some(0.013));
        assert_eq!(p.course, Some(0.0));
        assert!(p.valid);
        assert_eq!(p.attributes.int_of(keys::SATELLITES, 0), 11);
        assert_eq!(p.attributes.double_of(keys::POWER, 0.0), 14.07);
        assert!(!p.attributes.bool_of(keys::IGNITION, true));
        let fix = p.fix_time.unwrap();
        assert_eq!(fix.year(), 2025);
        assert_eq!(fix.month(), 9);
        assert_eq!(fix.day(), 8);
    }

    #[test]
    fn test_decode_binds_identity_in_context() {
        let mut ctx = DecodeContext::default();
        protocol().decode(SAMPLE.as_bytes(), &mut ctx).unwrap();
        assert_eq!(ctx.unique_id.as_deref(), Some("907126119"));
    }

    #[test]
    fn test_decode_keep_alive() {
        let decoded = decode_one("ST300ALV;907126119");
        assert_eq!(decoded, Decoded::Heartbeat { reply: None });
    }

    #[test]
    fn test_decode_emergency_sets_alarm() {
        let frame = SAMPLE.replacen("STT", "EMG", 1);
        match decode_one(&frame) {
            Decoded::Positions(positions) => {
                assert_eq!(positions[0].attributes.str_of(keys::ALARM, ""), "sos");
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_decode_truncated_report() {
        let mut ctx = DecodeContext::default();
        let result = protocol().decode(b"ST300STT;907126119;04", &mut ctx);
        assert!(matches!(result, Err(DecodeError::BadFrame(_))));
    }

    #[test]
    fn test_decode_unknown_kind() {
        let mut ctx = DecodeContext::default();
        let result = protocol().decode(b"ST300XYZ;907126119", &mut ctx);
        assert_eq!(
            result,
            Err(DecodeError::UnsupportedKind("ST300XYZ".to_string()))
        );
    }

    #[test]
    fn test_encode_reboot() {
        let bytes = protocol()
            .encode_command(&command(CommandType::Reboot, AttributeBag::new()), &device())
            .unwrap();
        assert_eq!(bytes, b"ST300CMD;907126119;02;Reboot\r");
    }

    #[test]
    fn test_encode_set_interval() {
        let mut params = AttributeBag::new();
        params.set("interval", 60_i64);
        let bytes = protocol()
            .encode_command(&command(CommandType::Setinterval, params), &device())
            .unwrap();
        assert_eq!(bytes, b"ST300CMD;907126119;02;SetInterval;60\r");
    }

    #[test]
    fn test_encode_missing_parameter() {
        let result = protocol().encode_command(
            &command(CommandType::Setinterval, AttributeBag::new()),
            &device(),
        );
        assert_eq!(result, Err(CommandEncodeError::MissingParameter("interval")));
    }

    #[test]
    fn test_encode_unsupported() {
        let result = protocol().encode_command(
            &command(CommandType::FactoryReset, AttributeBag::new()),
            &device(),
        );
        assert_eq!(
            result,
            Err(CommandEncodeError::Unsupported(CommandType::FactoryReset))
        );
    }

    #[test]
    fn test_encoded_command_round_trips_through_framer() {
        let p = protocol();
        let bytes = p
            .encode_command(&command(CommandType::Reboot, AttributeBag::new()), &device())
            .unwrap();
        assert_eq!(p.frame(&bytes, 2048), FrameOutcome::Frame { len: bytes.len() });
        // The device echoes command frames back; they decode as responses.
        let mut ctx = DecodeContext::default();
        let decoded = p.decode(&bytes, &mut ctx).unwrap();
        assert!(matches!(decoded, Decoded::CommandResponse { .. }));
    }

    #[test]
    fn test_sms_rendering_omits_wire_envelope() {
        let mut params = AttributeBag::new();
        params.set("interval", 120_i64);
        let body = protocol()
            .encode_sms_command(&command(CommandType::Setinterval, params), &device())
            .unwrap();
        assert_eq!(body, "SetInterval;120");
    }
}
