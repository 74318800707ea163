//! Frame and record builders shared by unit and integration tests.
//!
//! The IMEI helpers (`get_random_imei`, `build_valid_imei_packet`) are carried over from
//! the teacher's `utils::imei` almost verbatim; the GT06/Teltonika frame builders are new,
//! built from the same crate's own codec/CRC functions so a builder and its matching
//! decoder can never silently drift apart.

use rand::Rng;

use crate::protocol::gt06;
use crate::protocol::teltonika;

/// Builds a valid Teltonika IMEI handshake packet: 2-byte BE length, then the ASCII IMEI.
pub fn build_valid_imei_packet(imei: &str) -> Vec<u8> {
    let mut packet = (imei.len() as u16).to_be_bytes().to_vec();
    packet.extend_from_slice(imei.as_bytes());
    packet
}

/// Same IMEI payload but without the length prefix, for exercising the "not a valid
/// handshake" framing path.
pub fn build_invalid_imei_packet(imei: &str) -> Vec<u8> {
    imei.as_bytes().to_vec()
}

/// Generates a random 15-digit IMEI with a valid Luhn check digit.
pub fn get_random_imei() -> String {
    let mut rng = rand::thread_rng();
    let mut digits: Vec<u8> = (0..14).map(|_| rng.gen_range(0..=9)).collect();

    let mut checksum = 0u32;
    for (i, &digit) in digits.iter().rev().enumerate() {
        if i % 2 == 0 {
            let doubled = digit as u32 * 2;
            checksum += if doubled > 9 { doubled - 9 } else { doubled };
        } else {
            checksum += digit as u32;
        }
    }
    digits.push(((10 - (checksum % 10)) % 10) as u8);

    digits.iter().map(|digit| digit.to_string()).collect()
}

/// Builds a GT06 LOGIN frame with a correctly-computed CRC-ITU checksum, for tests that
/// need a wire-valid frame rather than hand-assembled bytes.
pub fn build_gt06_login_frame(imei: &str, serial: u16) -> Vec<u8> {
    const PROTO_LOGIN: u8 = 0x01;
    let mut content = vec![PROTO_LOGIN];
    content.extend_from_slice(&crate::utils::hex_to_bytes(&format!("{:0>16}", imei)));
    content.extend_from_slice(&serial.to_be_bytes());

    let mut frame = vec![0x78, 0x78, (content.len() + 2) as u8];
    frame.extend_from_slice(&content);
    let crc = gt06::crc::crc_itu(&frame[2..]);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame.extend_from_slice(&[0x0d, 0x0a]);
    frame
}

/// Builds a single-record Teltonika codec 8 AVL frame carrying one all-zero-location fix,
/// with a correctly-computed CRC-16/IBM trailer.
pub fn build_teltonika_avl_frame(timestamp_ms: u64) -> Vec<u8> {
    let mut record = Vec::new();
    record.extend_from_slice(&timestamp_ms.to_be_bytes());
    record.push(1); // priority
    record.extend_from_slice(&0i32.to_be_bytes()); // lon
    record.extend_from_slice(&0i32.to_be_bytes()); // lat
    record.extend_from_slice(&0i16.to_be_bytes()); // altitude
    record.extend_from_slice(&0u16.to_be_bytes()); // angle
    record.push(0); // satellites
    record.extend_from_slice(&0u16.to_be_bytes()); // speed
    record.push(1); // event io id
    record.push(1); // total io count
    record.push(1); // n1
    record.push(1); // io id
    record.push(42); // io value
    record.push(0); // n2
    record.push(0); // n4
    record.push(0); // n8

    let mut data = vec![teltonika::CODEC_8, 1];
    data.extend_from_slice(&record);
    data.push(1); // trailing record count

    let crc = nom_teltonika::crc16(&data) as u32;

    let mut frame = vec![0, 0, 0, 0];
    frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
    frame.extend_from_slice(&data);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_imei_has_valid_luhn_digit() {
        for _ in 0..20 {
            let imei = get_random_imei();
            assert_eq!(imei.len(), 15);
            assert!(imei.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_built_gt06_login_frame_decodes() {
        let frame = build_gt06_login_frame("3332210", 9);
        let packet = gt06::decode_frame(&frame, false).unwrap();
        assert_eq!(packet.imei.as_deref(), Some("3332210"));
    }

    #[test]
    fn test_built_teltonika_frame_decodes() {
        let frame = build_teltonika_avl_frame(1_560_160_000_000);
        let packet = teltonika::decode_frame(&frame, true).unwrap();
        assert!(matches!(
            packet.payload,
            crate::protocol::Payload::Teltonika(teltonika::TeltonikaPayload::AvlBatch { .. })
        ));
    }
}
