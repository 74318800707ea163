//! GT06/Concox codec: frame layout, checksum, and record decoding per spec §4.2.1.

pub mod crc;

use chrono::{TimeZone, Utc};

use super::{CodecError, DecodedPacket, DeviceRecord, Location, PacketType, Payload, SensorValue, StatusFields};
use crate::listener::Protocol;
use crate::utils::bytes_to_hex;
use std::collections::HashMap;

const START_SHORT: [u8; 2] = [0x78, 0x78];
const START_LONG: [u8; 2] = [0x79, 0x79];
const TERMINATOR: [u8; 2] = [0x0d, 0x0a];

const PROTO_LOGIN: u8 = 0x01;
const PROTO_HEARTBEAT: u8 = 0x13;
const PROTO_LOCATION: u8 = 0x12;
const PROTO_LOCATION_EXT: u8 = 0x22;
const PROTO_ALARM: u8 = 0x16;
const PROTO_ALARM_EXT: u8 = 0x26;
const PROTO_STATUS: u8 = 0x1a;
const PROTO_COMMAND: u8 = 0x80;

/// GT06-specific decoded payload, keyed by `DecodedPacket::packet_type`.
#[derive(Debug, Clone)]
pub enum Gt06Payload {
    Login {
        imei: String,
    },
    Heartbeat {
        terminal_info: u8,
        voltage_level: u8,
        gsm_signal: u8,
        alarm_language: u16,
    },
    Location(Gt06Location),
    Status {
        raw: Vec<u8>,
    },
    Unknown {
        protocol_byte: u8,
    },
}

#[derive(Debug, Clone)]
pub struct Gt06Location {
    pub timestamp: chrono::DateTime<Utc>,
    pub satellites: u8,
    pub lat: f64,
    pub lon: f64,
    pub speed_kmh: u8,
    pub course_deg: u16,
    pub gps_fixed: bool,
    pub gps_realtime: bool,
    pub lbs: Option<(u16, u8, u16, u32)>,
    pub acc: Option<bool>,
    pub valid: bool,
}

/// Decodes a complete GT06 frame (as yielded by the reassembler) into a [`DecodedPacket`].
///
/// `crc_fallback` gates the additive-checksum fallback for clone devices (spec §9, open
/// question). Checksum failure (both CRC-ITU and, if enabled, the fallback) is the only
/// case that returns `Err` here; an unrecognised protocol byte or a content length too
/// short for its type decodes to `PacketType::Unknown` instead, per spec §7's
/// classification.
pub fn decode_frame(frame: &[u8], crc_fallback: bool) -> Result<DecodedPacket, CodecError> {
    if frame.len() < 2 {
        return Err(CodecError::Malformed);
    }
    let is_long = if frame[0..2] == START_SHORT {
        false
    } else if frame[0..2] == START_LONG {
        true
    } else {
        return Err(CodecError::Malformed);
    };

    let length_field_size = if is_long { 2 } else { 1 };
    let header_len = 2 + length_field_size;
    if frame.len() < header_len + 5 || frame[frame.len() - 2..] != TERMINATOR {
        return Err(CodecError::Malformed);
    }

    let payload_len = if is_long {
        u16::from_be_bytes([frame[2], frame[3]]) as usize
    } else {
        frame[2] as usize
    };
    let bracket_end = header_len + payload_len;
    if bracket_end > frame.len() - 2 || payload_len < 5 {
        return Err(CodecError::Malformed);
    }

    let checksum_range = &frame[2..bracket_end - 2];
    let declared_checksum = u16::from_be_bytes([frame[bracket_end - 2], frame[bracket_end - 1]]);
    let checksum_ok = crc::crc_itu(checksum_range) == declared_checksum
        || (crc_fallback && crc::additive_checksum(checksum_range) == declared_checksum);
    if !checksum_ok {
        return Err(CodecError::ChecksumMismatch);
    }

    let protocol_byte = frame[header_len];
    let serial = u16::from_be_bytes([frame[bracket_end - 4], frame[bracket_end - 3]]);
    let content = &frame[header_len + 1..bracket_end - 4];

    let (packet_type, imei, timestamp, payload) = match protocol_byte {
        PROTO_LOGIN => match decode_login(content) {
            Some(imei) => (PacketType::Login, Some(imei.clone()), Utc::now(), Payload::Gt06(Gt06Payload::Login { imei })),
            None => (PacketType::Unknown, None, Utc::now(), Payload::Gt06(Gt06Payload::Unknown { protocol_byte })),
        },
        PROTO_HEARTBEAT => match decode_heartbeat(content) {
            Some(payload) => (PacketType::Heartbeat, None, Utc::now(), Payload::Gt06(payload)),
            None => (PacketType::Unknown, None, Utc::now(), Payload::Gt06(Gt06Payload::Unknown { protocol_byte })),
        },
        PROTO_LOCATION | PROTO_LOCATION_EXT | PROTO_ALARM | PROTO_ALARM_EXT => match decode_location(content) {
            Some(location) => {
                let packet_type = if protocol_byte == PROTO_ALARM || protocol_byte == PROTO_ALARM_EXT {
                    PacketType::Alarm
                } else {
                    PacketType::Location
                };
                let timestamp = location.timestamp;
                (packet_type, None, timestamp, Payload::Gt06(Gt06Payload::Location(location)))
            }
            None => (PacketType::Unknown, None, Utc::now(), Payload::Gt06(Gt06Payload::Unknown { protocol_byte })),
        },
        PROTO_STATUS => (
            PacketType::Status,
            None,
            Utc::now(),
            Payload::Gt06(Gt06Payload::Status { raw: content.to_vec() }),
        ),
        _ => (PacketType::Unknown, None, Utc::now(), Payload::Gt06(Gt06Payload::Unknown { protocol_byte })),
    };

    let requires_ack = matches!(
        packet_type,
        PacketType::Login | PacketType::Heartbeat | PacketType::Location | PacketType::Alarm | PacketType::Status
    );

    Ok(DecodedPacket {
        packet_type,
        imei,
        timestamp,
        raw: frame.to_vec(),
        requires_ack,
        serial: Some(serial),
        payload,
    })
}

/// Decodes the 8-byte packed-hex IMEI content of a LOGIN frame.
fn decode_login(content: &[u8]) -> Option<String> {
    if content.len() != 8 {
        return None;
    }
    let hex: String = content.iter().map(|byte| format!("{:02x}", byte)).collect();
    let trimmed = hex.trim_start_matches('0');
    Some(if trimmed.is_empty() { "0".to_string() } else { trimmed.to_string() })
}

fn decode_heartbeat(content: &[u8]) -> Option<Gt06Payload> {
    if content.len() != 5 {
        return None;
    }
    Some(Gt06Payload::Heartbeat {
        terminal_info: content[0],
        voltage_level: content[1],
        gsm_signal: content[2],
        alarm_language: u16::from_be_bytes([content[3], content[4]]),
    })
}

fn decode_location(content: &[u8]) -> Option<Gt06Location> {
    if content.len() < 18 {
        return None;
    }

    let year = 2000 + content[0] as i32;
    let timestamp = Utc
        .with_ymd_and_hms(
            year,
            content[1] as u32,
            content[2] as u32,
            content[3] as u32,
            content[4] as u32,
            content[5] as u32,
        )
        .single()?;

    let satellites = content[6] & 0x0f;
    let lat_raw = u32::from_be_bytes([content[7], content[8], content[9], content[10]]);
    let lon_raw = u32::from_be_bytes([content[11], content[12], content[13], content[14]]);
    let speed_kmh = content[15];
    let status_word = u16::from_be_bytes([content[16], content[17]]);

    let course_deg = status_word & 0x03ff;
    let north = status_word & (1 << 10) != 0;
    let west = status_word & (1 << 11) != 0;
    let gps_fixed = status_word & (1 << 12) != 0;
    let gps_realtime = status_word & (1 << 13) != 0;

    let mut lat = lat_raw as f64 / 1_800_000.0;
    let mut lon = lon_raw as f64 / 1_800_000.0;
    if !north {
        lat = -lat;
    }
    if west {
        lon = -lon;
    }

    let mut offset = 18;
    let lbs = if content.len() >= offset + 8 {
        let mcc = u16::from_be_bytes([content[offset], content[offset + 1]]);
        let mnc = content[offset + 2];
        let lac = u16::from_be_bytes([content[offset + 3], content[offset + 4]]);
        let cell_id = u32::from_be_bytes([0, content[offset + 5], content[offset + 6], content[offset + 7]]);
        offset += 8;
        Some((mcc, mnc, lac, cell_id))
    } else {
        None
    };

    let acc = if content.len() > offset {
        Some(content[offset] & 0x01 != 0)
    } else {
        None
    };

    let valid = gps_fixed && (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon) && !(lat == 0.0 && lon == 0.0);

    Some(Gt06Location {
        timestamp,
        satellites,
        lat,
        lon,
        speed_kmh,
        course_deg,
        gps_fixed,
        gps_realtime,
        lbs,
        acc,
        valid,
    })
}

/// Builds the positive acknowledgement for a decoded frame, per spec §4.2.1. Required for
/// LOGIN, HEARTBEAT, LOCATION, ALARM, and STATUS; `None` otherwise.
pub fn encode_ack(packet: &DecodedPacket) -> Option<Vec<u8>> {
    if !packet.requires_ack {
        return None;
    }
    let protocol_byte = match &packet.payload {
        Payload::Gt06(Gt06Payload::Login { .. }) => PROTO_LOGIN,
        Payload::Gt06(Gt06Payload::Heartbeat { .. }) => PROTO_HEARTBEAT,
        Payload::Gt06(Gt06Payload::Location(_)) if packet.packet_type == PacketType::Alarm => PROTO_ALARM,
        Payload::Gt06(Gt06Payload::Location(_)) => PROTO_LOCATION,
        Payload::Gt06(Gt06Payload::Status { .. }) => PROTO_STATUS,
        _ => return None,
    };
    let serial = packet.serial?;
    Some(build_short_frame(protocol_byte, &[], serial))
}

/// Builds a downlink command frame (protocol `0x80`), per spec §4.2.1.
pub fn encode_command(command: &str, serial: u16) -> Vec<u8> {
    let mut content = Vec::with_capacity(2 + command.len());
    content.extend_from_slice(&(command.len() as u16).to_be_bytes());
    content.extend_from_slice(command.as_bytes());
    build_short_frame(PROTO_COMMAND, &content, serial)
}

/// Assembles `start | length | protocol | content | serial | crc | terminator`, picking the
/// short (`0x7878`, 1-byte length) or long (`0x7979`, 2-byte length) form depending on
/// whether the bracketed section fits in a byte.
fn build_short_frame(protocol_byte: u8, content: &[u8], serial: u16) -> Vec<u8> {
    let mut bracket = Vec::with_capacity(1 + content.len() + 2 + 2);
    bracket.push(protocol_byte);
    bracket.extend_from_slice(content);
    bracket.extend_from_slice(&serial.to_be_bytes());

    let use_long = bracket.len() + 2 > 255;
    let mut frame = Vec::new();
    if use_long {
        frame.extend_from_slice(&START_LONG);
        frame.extend_from_slice(&((bracket.len() + 2) as u16).to_be_bytes());
    } else {
        frame.extend_from_slice(&START_SHORT);
        frame.push((bracket.len() + 2) as u8);
    }

    let crc_range_start = frame.len();
    frame.extend_from_slice(&bracket);
    let crc = crc::crc_itu(&frame[crc_range_start - if use_long { 2 } else { 1 }..]);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame.extend_from_slice(&TERMINATOR);
    frame
}

/// Projects a decoded packet into the canonical [`DeviceRecord`] shape for the webhook.
pub fn to_device_record(packet: &DecodedPacket, imei: &str) -> Option<DeviceRecord> {
    let raw_hex = bytes_to_hex(&packet.raw);
    match &packet.payload {
        Payload::Gt06(Gt06Payload::Login { .. }) => Some(DeviceRecord {
            imei: imei.to_string(),
            protocol: Protocol::Gt06,
            packet_type: PacketType::Login,
            timestamp: packet.timestamp,
            location: None,
            sensors: None,
            status: None,
            raw_hex,
        }),
        Payload::Gt06(Gt06Payload::Heartbeat {
            terminal_info,
            voltage_level,
            gsm_signal,
            alarm_language,
        }) => Some(DeviceRecord {
            imei: imei.to_string(),
            protocol: Protocol::Gt06,
            packet_type: PacketType::Heartbeat,
            timestamp: packet.timestamp,
            location: None,
            sensors: None,
            status: Some(StatusFields {
                battery_level: Some(*voltage_level),
                gsm_signal: Some(*gsm_signal),
                alarm: Some(*alarm_language),
                terminal_info: Some(*terminal_info),
            }),
            raw_hex,
        }),
        Payload::Gt06(Gt06Payload::Location(location)) => {
            let mut sensors = HashMap::new();
            sensors.insert("gps_fixed".to_string(), SensorValue::Number(location.gps_fixed as u8 as f64));
            sensors.insert(
                "gps_realtime".to_string(),
                SensorValue::Number(location.gps_realtime as u8 as f64),
            );
            sensors.insert("satellites".to_string(), SensorValue::Number(location.satellites as f64));
            sensors.insert("serial".to_string(), SensorValue::Number(packet.serial.unwrap_or(0) as f64));
            if let Some((mcc, mnc, lac, cell_id)) = location.lbs {
                sensors.insert("mcc".to_string(), SensorValue::Number(mcc as f64));
                sensors.insert("mnc".to_string(), SensorValue::Number(mnc as f64));
                sensors.insert("lac".to_string(), SensorValue::Number(lac as f64));
                sensors.insert("cell_id".to_string(), SensorValue::Number(cell_id as f64));
            }
            if let Some(acc) = location.acc {
                sensors.insert("acc".to_string(), SensorValue::Number(acc as u8 as f64));
            }

            Some(DeviceRecord {
                imei: imei.to_string(),
                protocol: Protocol::Gt06,
                packet_type: packet.packet_type,
                timestamp: packet.timestamp,
                location: Some(Location {
                    lat: location.lat,
                    lon: location.lon,
                    altitude_meters: 0.0,
                    speed_kmh: location.speed_kmh as f64,
                    course_deg: location.course_deg as f64,
                    satellites: location.satellites,
                    timestamp: location.timestamp,
                    valid: location.valid,
                }),
                sensors: Some(sensors),
                status: None,
                raw_hex,
            })
        }
        Payload::Gt06(Gt06Payload::Status { raw }) => Some(DeviceRecord {
            imei: imei.to_string(),
            protocol: Protocol::Gt06,
            packet_type: PacketType::Status,
            timestamp: packet.timestamp,
            location: None,
            sensors: Some(HashMap::from([("status_raw".to_string(), SensorValue::Text(bytes_to_hex(raw)))])),
            status: None,
            raw_hex,
        }),
        Payload::Gt06(Gt06Payload::Unknown { .. }) | Payload::None | Payload::Teltonika(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::hex_to_bytes;

    fn build_login_frame(imei: &str, serial: u16) -> Vec<u8> {
        let mut content = vec![PROTO_LOGIN];
        let hex = format!("{:0>16}", imei);
        content.extend_from_slice(&hex_to_bytes(&hex));
        content.extend_from_slice(&serial.to_be_bytes());
        let mut frame = vec![0x78, 0x78, (content.len() + 2) as u8];
        frame.extend_from_slice(&content);
        let crc = crc::crc_itu(&frame[2..]);
        frame.extend_from_slice(&crc.to_be_bytes());
        frame.extend_from_slice(&TERMINATOR);
        frame
    }

    #[test]
    fn test_decode_login() {
        let frame = build_login_frame("3332210", 1);
        let packet = decode_frame(&frame, false).unwrap();
        assert_eq!(packet.packet_type, PacketType::Login);
        assert_eq!(packet.imei.as_deref(), Some("3332210"));
        assert_eq!(packet.serial, Some(1));
        assert!(packet.requires_ack);
    }

    #[test]
    fn test_checksum_mismatch_is_rejected() {
        let mut frame = build_login_frame("3332210", 1);
        let last_crc_byte = frame.len() - 3;
        frame[last_crc_byte] ^= 0xff;
        assert!(matches!(decode_frame(&frame, false), Err(CodecError::ChecksumMismatch)));
    }

    /// Property P2: an ACK built by `encode_ack` decodes back with the same serial and a
    /// passing CRC check.
    #[test]
    fn test_ack_round_trips() {
        let frame = build_login_frame("3332210", 42);
        let packet = decode_frame(&frame, false).unwrap();
        let ack = encode_ack(&packet).unwrap();
        let decoded_ack = decode_frame(&ack, false).unwrap();
        assert_eq!(decoded_ack.serial, Some(42));
    }

    #[test]
    fn test_s1_ack_matches_spec_example() {
        let login = decode_frame(&build_login_frame("3332210", 1), false).unwrap();
        let ack = encode_ack(&login).unwrap();
        assert_eq!(ack, hex_to_bytes("787805010001D9DC0D0A"));
    }

    /// Property P3: hemisphere bits determine the sign of lat/lon independent of magnitude.
    #[test]
    fn test_hemisphere_correctness() {
        let lat_mag_raw: u32 = 26_820_000; // 14.9 degrees
        let lon_mag_raw: u32 = 9_360_000; // 5.2 degrees
        for (north, west) in [(true, false), (true, true), (false, false), (false, true)] {
            let mut status_word: u16 = 1 << 12; // gps fixed
            if north {
                status_word |= 1 << 10;
            }
            if west {
                status_word |= 1 << 11;
            }
            let mut content = vec![24, 1, 1, 12, 0, 0, 0x01];
            content.extend_from_slice(&lat_mag_raw.to_be_bytes());
            content.extend_from_slice(&lon_mag_raw.to_be_bytes());
            content.push(0);
            content.extend_from_slice(&status_word.to_be_bytes());

            let location = decode_location(&content).unwrap();
            assert_eq!(location.lat > 0.0, north);
            assert_eq!(location.lon < 0.0, west);
        }
    }

    #[test]
    fn test_zero_zero_location_is_invalid() {
        let mut content = vec![24, 1, 1, 12, 0, 0, 0x01];
        content.extend_from_slice(&0u32.to_be_bytes());
        content.extend_from_slice(&0u32.to_be_bytes());
        content.push(0);
        content.extend_from_slice(&(1u16 << 12).to_be_bytes());
        let location = decode_location(&content).unwrap();
        assert!(!location.valid);
    }

    #[test]
    fn test_encode_command_ascii_payload() {
        let frame = encode_command("RESET#", 7);
        let packet = decode_frame(&frame, false).unwrap();
        assert_eq!(packet.serial, Some(7));
    }
}
