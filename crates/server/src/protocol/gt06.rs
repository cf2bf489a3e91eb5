//! GT06 binary protocol (length-prefixed, CRC-ITU checked).
//!
//! Frames are `0x78 0x78 | length | protocol | content | serial(2) | crc(2)
//! | 0x0D 0x0A` where `length` counts protocol through crc. Identity is
//! bound by the login frame (0x01); position frames carry no identifier of
//! their own. Login and status frames must be acknowledged or the tracker
//! disconnects and retries.

use chrono::{TimeZone, Utc};

use domain::models::{keys, Command, CommandType, DecodedPosition, Device};

use super::{CommandEncodeError, Decoded, DecodeContext, DecodeError, FrameOutcome, Protocol};

pub const PROTOCOL_NAME: &str = "gt06";

const MSG_LOGIN: u8 = 0x01;
const MSG_POSITION: u8 = 0x12;
const MSG_STATUS: u8 = 0x13;
const MSG_STRING_INFO: u8 = 0x15;
const MSG_ALARM: u8 = 0x16;
const MSG_POSITION_2: u8 = 0x22;
const MSG_COMMAND: u8 = 0x80;

/// GT06 protocol handler.
#[derive(Debug, Default)]
pub struct Gt06Protocol;

/// CRC-ITU (X.25) over the given bytes.
fn crc_itu(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0x8408;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// Assembles a complete frame around `protocol_no` and `content`.
pub(crate) fn build_frame(protocol_no: u8, content: &[u8], serial: u16) -> Vec<u8> {
    let length = 1 + content.len() + 2 + 2;
    let mut body = Vec::with_capacity(length + 1);
    body.push(length as u8);
    body.push(protocol_no);
    body.extend_from_slice(content);
    body.extend_from_slice(&serial.to_be_bytes());
    let crc = crc_itu(&body);

    let mut frame = Vec::with_capacity(length + 5);
    frame.extend_from_slice(&[0x78, 0x78]);
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame.extend_from_slice(&[0x0D, 0x0A]);
    frame
}

impl Gt06Protocol {
    pub fn new() -> Self {
        Self
    }

    fn decode_imei(content: &[u8]) -> Result<String, DecodeError> {
        if content.len() < 8 {
            return Err(DecodeError::BadFrame("short login content".to_string()));
        }
        let mut imei = String::with_capacity(16);
        for &byte in &content[..8] {
            imei.push(char::from_digit((byte >> 4) as u32, 16).unwrap_or('0'));
            imei.push(char::from_digit((byte & 0x0F) as u32, 16).unwrap_or('0'));
        }
        // 15-digit IMEIs are padded with one leading zero nibble.
        Ok(imei.trim_start_matches('0').to_string())
    }

    /// Decodes the common datetime + GPS block, returning the position and
    /// the number of content bytes consumed.
    fn decode_gps(
        content: &[u8],
        unique_id: &str,
    ) -> Result<(DecodedPosition, usize), DecodeError> {
        if content.len() < 18 {
            return Err(DecodeError::BadFrame(format!(
                "gps block is {} bytes, expected 18",
                content.len()
            )));
        }

        let mut position = DecodedPosition::new(unique_id, PROTOCOL_NAME);

        let fix_time = Utc
            .with_ymd_and_hms(
                2000 + content[0] as i32,
                content[1] as u32,
                content[2] as u32,
                content[3] as u32,
                content[4] as u32,
                content[5] as u32,
            )
            .single()
            .ok_or_else(|| DecodeError::BadFrame("bad datetime".to_string()))?;
        position.fix_time = Some(fix_time);
        position.device_time = Some(fix_time);

        let satellites = (content[6] & 0x0F) as i64;
        position.attributes.set(keys::SATELLITES, satellites);

        let raw_lat = u32::from_be_bytes([content[7], content[8], content[9], content[10]]);
        let raw_lon = u32::from_be_bytes([content[11], content[12], content[13], content[14]]);
        let mut latitude = raw_lat as f64 / 30_000.0 / 60.0;
        let mut longitude = raw_lon as f64 / 30_000.0 / 60.0;

        position.speed = Some(content[15] as f64);

        let flags = u16::from_be_bytes([content[16], content[17]]);
        position.course = Some((flags & 0x03FF) as f64);
        position.valid = flags & 0x1000 != 0;
        if flags & 0x0400 == 0 {
            latitude = -latitude;
        }
        if flags & 0x0800 != 0 {
            longitude = -longitude;
        }
        position.latitude = latitude;
        position.longitude = longitude;

        Ok((position, 18))
    }

    fn alarm_name(code: u8) -> Option<&'static str> {
        match code {
            0x01 => Some("sos"),
            0x02 => Some("powerCut"),
            0x03 => Some("vibration"),
            0x04 => Some("geofenceEnter"),
            0x05 => Some("geofenceExit"),
            0x06 => Some("overspeed"),
            _ => None,
        }
    }

    fn command_content(command: &Command) -> Result<String, CommandEncodeError> {
        let params = &command.parameters;
        match command.command_type {
            CommandType::Reboot => Ok("RESET#".to_string()),
            CommandType::EngineStop => Ok("DYD,000000#".to_string()),
            CommandType::EngineStart => Ok("HFYD,000000#".to_string()),
            CommandType::PositionSingle => Ok("DWXX#".to_string()),
            CommandType::Setinterval => {
                let interval = params
                    .get("interval")
                    .and_then(domain::models::Value::as_int)
                    .ok_or(CommandEncodeError::MissingParameter("interval"))?;
                Ok(format!("TIMER,{}#", interval))
            }
            CommandType::Custom => params
                .get("data")
                .and_then(domain::models::Value::as_str)
                .ok_or(CommandEncodeError::MissingParameter("data")),
            other => Err(CommandEncodeError::Unsupported(other)),
        }
    }
}

impl Protocol for Gt06Protocol {
    fn name(&self) -> &'static str {
        PROTOCOL_NAME
    }

    fn frame(&self, buf: &[u8], max_frame_len: usize) -> FrameOutcome {
        if buf.is_empty() {
            return FrameOutcome::NeedMore;
        }
        if buf[0] != 0x78 {
            return FrameOutcome::Bad { discard: 1 };
        }
        if buf.len() < 3 {
            return FrameOutcome::NeedMore;
        }
        if buf[1] != 0x78 {
            return FrameOutcome::Bad { discard: 1 };
        }
        let length = buf[2] as usize;
        let total = 2 + 1 + length + 2;
        if total > max_frame_len {
            return FrameOutcome::Bad { discard: 2 };
        }
        if buf.len() < total {
            return FrameOutcome::NeedMore;
        }
        if buf[total - 2] != 0x0D || buf[total - 1] != 0x0A {
            return FrameOutcome::Bad { discard: 2 };
        }
        FrameOutcome::Frame { len: total }
    }

    fn decode(&self, frame: &[u8], ctx: &mut DecodeContext) -> Result<Decoded, DecodeError> {
        if frame.len() < 10 {
            return Err(DecodeError::BadFrame("frame too short".to_string()));
        }
        let length = frame[2] as usize;
        let body = &frame[2..2 + 1 + length - 2];
        let expected_crc = u16::from_be_bytes([frame[frame.len() - 4], frame[frame.len() - 3]]);
        if crc_itu(body) != expected_crc {
            return Err(DecodeError::BadFrame("crc mismatch".to_string()));
        }

        let protocol_no = frame[3];
        let content = &frame[4..frame.len() - 6];
        let serial = u16::from_be_bytes([frame[frame.len() - 6], frame[frame.len() - 5]]);

        match protocol_no {
            MSG_LOGIN => {
                let unique_id = Self::decode_imei(content)?;
                ctx.unique_id = Some(unique_id.clone());
                Ok(Decoded::Login {
                    unique_id,
                    reply: Some(build_frame(MSG_LOGIN, &[], serial)),
                })
            }
            MSG_POSITION | MSG_POSITION_2 => {
                let unique_id = ctx
                    .unique_id
                    .clone()
                    .ok_or_else(|| DecodeError::BadFrame("position before login".to_string()))?;
                let (position, _) = Self::decode_gps(content, &unique_id)?;
                Ok(Decoded::Positions(vec![position]))
            }
            MSG_ALARM => {
                let unique_id = ctx
                    .unique_id
                    .clone()
                    .ok_or_else(|| DecodeError::BadFrame("alarm before login".to_string()))?;
                let (mut position, consumed) = Self::decode_gps(content, &unique_id)?;
                // GPS block, LBS length byte plus cell info, then status.
                let alarm_offset = consumed + 9 + 3;
                if let Some(&code) = content.get(alarm_offset) {
                    if let Some(name) = Self::alarm_name(code) {
                        position.attributes.set(keys::ALARM, name);
                    }
                }
                Ok(Decoded::Positions(vec![position]))
            }
            MSG_STATUS => {
                if let Some(&info) = content.first() {
                    // Terminal info carries the ACC line on bit 1; forwarded
                    // with the next position via session state is not worth
                    // the coupling, so status frames stay heartbeat-only.
                    let _ignition = info & 0x02 != 0;
                }
                Ok(Decoded::Heartbeat {
                    reply: Some(build_frame(MSG_STATUS, &[], serial)),
                })
            }
            MSG_STRING_INFO => {
                let response: String = content
                    .iter()
                    .filter(|&&b| (0x20..0x7F).contains(&b))
                    .map(|&b| b as char)
                    .collect();
                Ok(Decoded::CommandResponse {
                    executed: true,
                    response,
                })
            }
            other => Err(DecodeError::UnsupportedKind(format!("0x{:02X}", other))),
        }
    }

    fn encode_command(
        &self,
        command: &Command,
        _device: &Device,
    ) -> Result<Vec<u8>, CommandEncodeError> {
        let ascii = Self::command_content(command)?;
        // Server flag echoes the command id for reply correlation.
        let mut content = Vec::with_capacity(5 + ascii.len());
        content.push((4 + ascii.len()) as u8);
        content.extend_from_slice(&(command.id as u32).to_be_bytes());
        content.extend_from_slice(ascii.as_bytes());
        Ok(build_frame(MSG_COMMAND, &content, command.id as u16))
    }

    fn encode_sms_command(
        &self,
        command: &Command,
        _device: &Device,
    ) -> Result<String, CommandEncodeError> {
        Self::command_content(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::models::{AttributeBag, CommandPriority, CommandStatus};

    fn protocol() -> Gt06Protocol {
        Gt06Protocol::new()
    }

    fn login_frame() -> Vec<u8> {
        // IMEI 123456789012345 as BCD with a leading zero nibble.
        let imei = [0x01, 0x23, 0x45, 0x67, 0x89, 0x01, 0x23, 0x45];
        build_frame(MSG_LOGIN, &imei, 1)
    }

    fn position_frame(serial: u16) -> Vec<u8> {
        let mut content = Vec::new();
        // 2025-09-08 12:44:33 UTC.
        content.extend_from_slice(&[25, 9, 8, 12, 44, 33]);
        content.push(0xC9); // 9 satellites
        let lat = (3.843813_f64 * 30_000.0 * 60.0) as u32;
        let lon = (38.615475_f64 * 30_000.0 * 60.0) as u32;
        content.extend_from_slice(&lat.to_be_bytes());
        content.extend_from_slice(&lon.to_be_bytes());
        content.push(40); // speed km/h
        // valid fix, south (bit10=0), west (bit11=1), course 181.
        let flags: u16 = 0x1000 | 0x0800 | 181;
        content.extend_from_slice(&flags.to_be_bytes());
        build_frame(MSG_POSITION, &content, serial)
    }

    #[test]
    fn test_crc_known_vector() {
        // Login ack body 05 01 00 01 carries CRC 0xD9DC on the wire.
        assert_eq!(crc_itu(&[0x05, 0x01, 0x00, 0x01]), 0xD9DC);
    }

    #[test]
    fn test_framer_round_trip() {
        let p = protocol();
        let frame = login_frame();
        assert_eq!(p.frame(&frame, 2048), FrameOutcome::Frame { len: frame.len() });
    }

    #[test]
    fn test_framer_needs_more() {
        let p = protocol();
        let frame = login_frame();
        assert_eq!(p.frame(&frame[..5], 2048), FrameOutcome::NeedMore);
        assert_eq!(p.frame(&[0x78], 2048), FrameOutcome::NeedMore);
    }

    #[test]
    fn test_framer_resyncs_on_garbage() {
        let p = protocol();
        assert_eq!(p.frame(&[0x00, 0x78, 0x78], 2048), FrameOutcome::Bad { discard: 1 });
        assert_eq!(p.frame(&[0x78, 0x00, 0x05], 2048), FrameOutcome::Bad { discard: 1 });
    }

    #[test]
    fn test_decode_login_binds_identity_and_acks() {
        let mut ctx = DecodeContext::default();
        let decoded = protocol().decode(&login_frame(), &mut ctx).unwrap();
        match decoded {
            Decoded::Login { unique_id, reply } => {
                assert_eq!(unique_id, "123456789012345");
                let reply = reply.expect("login must be acked");
                assert_eq!(reply[3], MSG_LOGIN);
                assert_eq!(
                    protocol().frame(&reply, 2048),
                    FrameOutcome::Frame { len: reply.len() }
                );
            }
            other => panic!("unexpected decode: {:?}", other),
        }
        assert_eq!(ctx.unique_id.as_deref(), Some("123456789012345"));
    }

    #[test]
    fn test_decode_position_after_login() {
        let mut ctx = DecodeContext::default();
        protocol().decode(&login_frame(), &mut ctx).unwrap();
        let decoded = protocol().decode(&position_frame(2), &mut ctx).unwrap();
        let positions = match decoded {
            Decoded::Positions(p) => p,
            other => panic!("unexpected decode: {:?}", other),
        };
        let p = &positions[0];
        assert_eq!(p.unique_id, "123456789012345");
        assert!(p.valid);
        // Bit 10 clear in the flag word: southern hemisphere.
        assert!((p.latitude + 3.843813).abs() < 0.0001);
        assert!((p.longitude + 38.615475).abs() < 0.0001);
        assert_eq!(p.speed, Some(40.0));
        assert_eq!(p.course, Some(181.0));
        assert_eq!(p.attributes.int_of(keys::SATELLITES, 0), 9);
    }

    #[test]
    fn test_decode_position_before_login_rejected() {
        let mut ctx = DecodeContext::default();
        let result = protocol().decode(&position_frame(2), &mut ctx);
        assert!(matches!(result, Err(DecodeError::BadFrame(_))));
    }

    #[test]
    fn test_decode_corrupt_crc() {
        let mut frame = login_frame();
        let crc_index = frame.len() - 3;
        frame[crc_index] ^= 0xFF;
        let mut ctx = DecodeContext::default();
        let result = protocol().decode(&frame, &mut ctx);
        assert_eq!(result, Err(DecodeError::BadFrame("crc mismatch".to_string())));
    }

    #[test]
    fn test_decode_heartbeat_acks() {
        let content = [0x42, 0x04, 0x03, 0x00, 0x01];
        let frame = build_frame(MSG_STATUS, &content, 7);
        let mut ctx = DecodeContext::default();
        match protocol().decode(&frame, &mut ctx).unwrap() {
            Decoded::Heartbeat { reply } => {
                let reply = reply.expect("status must be acked");
                assert_eq!(reply[3], MSG_STATUS);
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_kind() {
        let frame = build_frame(0x6F, &[], 9);
        let mut ctx = DecodeContext::default();
        assert_eq!(
            protocol().decode(&frame, &mut ctx),
            Err(DecodeError::UnsupportedKind("0x6F".to_string()))
        );
    }

    #[test]
    fn test_encode_command_frames_and_correlates() {
        let now = Utc::now();
        let command = Command {
            id: 77,
            device_id: 7,
            user_id: 1,
            command_type: CommandType::Reboot,
            priority: CommandPriority::Normal,
            status: CommandStatus::Queued,
            parameters: AttributeBag::new(),
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
            unique_id: "123456789012345".to_string(),
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
        };

        let frame = protocol().encode_command(&command, &device).unwrap();
        assert_eq!(frame[3], MSG_COMMAND);
        assert_eq!(
            protocol().frame(&frame, 2048),
            FrameOutcome::Frame { len: frame.len() }
        );
        // Server flag carries the command id.
        assert_eq!(
            u32::from_be_bytes([frame[5], frame[6], frame[7], frame[8]]),
            77
        );
        let ascii: String = frame[9..frame.len() - 6].iter().map(|&b| b as char).collect();
        assert_eq!(ascii, "RESET#");
    }

    #[test]
    fn test_decode_command_response() {
        let mut content = vec![0x0B];
        content.extend_from_slice(&77u32.to_be_bytes());
        content.extend_from_slice(b"RESET OK");
        let frame = build_frame(MSG_STRING_INFO, &content, 3);
        let mut ctx = DecodeContext::default();
        match protocol().decode(&frame, &mut ctx).unwrap() {
            Decoded::CommandResponse { executed, response } => {
                assert!(executed);
                assert!(response.contains("RESET OK"));
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }
}
