//! Protocol codecs: decode wire frames into [`DecodedPacket`]s, build acknowledgements and
//! downlink command frames, and project decoded packets into the canonical [`DeviceRecord`]
//! shape the webhook fan-out forwards.

pub mod gt06;
pub mod teltonika;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::listener::Protocol;

/// The kind of record a decoded frame represents, per spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketType {
    Login,
    Heartbeat,
    Location,
    Alarm,
    Status,
    Unknown,
}

/// Protocol-specific decoded payload. Kept as a closed sum type over the two supported
/// codecs rather than a trait object: the codec set is small and fixed (design note §9).
#[derive(Debug, Clone)]
pub enum Payload {
    Gt06(gt06::Gt06Payload),
    Teltonika(teltonika::TeltonikaPayload),
    None,
}

/// Result of successfully decoding one complete frame. Created inside the session
/// supervisor, consumed synchronously for ACK + command dispatch, then projected into a
/// [`DeviceRecord`]; never retained past that point.
#[derive(Debug, Clone)]
pub struct DecodedPacket {
    pub packet_type: PacketType,
    pub imei: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub raw: Vec<u8>,
    pub requires_ack: bool,
    /// Echoed back verbatim in the GT06 ACK; absent for Teltonika, which acks by count.
    pub serial: Option<u16>,
    pub payload: Payload,
}

/// Decoded GPS fix, hemisphere-corrected.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
    pub altitude_meters: f64,
    pub speed_kmh: f64,
    pub course_deg: f64,
    pub satellites: u8,
    pub timestamp: DateTime<Utc>,
    /// True only if coordinates are in range AND the protocol's GPS-fixed flag is set.
    pub valid: bool,
}

/// A scalar sensor/IO reading, loosely typed to match the wide variety of device fields.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SensorValue {
    Number(f64),
    Text(String),
}

/// Battery/GSM/alarm/terminal bitfield status, present on HEARTBEAT/STATUS records.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusFields {
    pub battery_level: Option<u8>,
    pub gsm_signal: Option<u8>,
    pub alarm: Option<u16>,
    pub terminal_info: Option<u8>,
}

/// The canonical outbound shape fed to the webhook (spec §3).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub imei: String,
    pub protocol: Protocol,
    pub packet_type: PacketType,
    pub timestamp: DateTime<Utc>,
    pub location: Option<Location>,
    pub sensors: Option<HashMap<String, SensorValue>>,
    pub status: Option<StatusFields>,
    pub raw_hex: String,
}

/// Errors a codec can report while decoding a single frame. All are absorbed by the
/// supervisor (dropped frame, possibly followed by a connection close); none propagate to
/// the device or the operator (spec §7).
#[derive(Debug, PartialEq, Eq)]
pub enum CodecError {
    ChecksumMismatch,
    Malformed,
}
