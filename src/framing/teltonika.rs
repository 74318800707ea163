use super::{FrameOutcome, Reassembler, TELTONIKA_MAX_AVL_DATA_LENGTH};

const IMEI_DIGIT_COUNT: usize = 15;
const PREAMBLE: [u8; 4] = [0x00, 0x00, 0x00, 0x00];
const AVL_HEADER_LEN: usize = 8; // preamble(4) + dataLength(4)
const AVL_CRC_LEN: usize = 4;

/// Reassembles Teltonika frames: the one-shot IMEI handshake and repeated AVL data frames,
/// per spec §4.1. The two framings are disambiguated by their first bytes, not by
/// connection state, since an IMEI frame (`0x00 0x0F ...`) and an AVL preamble
/// (`0x00 0x00 0x00 0x00 ...`) never collide.
pub struct TeltonikaReassembler {
    buffer: Vec<u8>,
}

impl TeltonikaReassembler {
    pub fn new() -> Self {
        TeltonikaReassembler { buffer: Vec::new() }
    }
}

impl Default for TeltonikaReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler for TeltonikaReassembler {
    fn append(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    fn try_take_frame(&mut self) -> FrameOutcome {
        if self.buffer.len() < 2 {
            return FrameOutcome::NeedMore;
        }

        let declared_len = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
        if declared_len == IMEI_DIGIT_COUNT {
            let frame_len = 2 + IMEI_DIGIT_COUNT;
            if self.buffer.len() < frame_len {
                return FrameOutcome::NeedMore;
            }
            let frame = self.buffer.drain(..frame_len).collect();
            return FrameOutcome::Frame(frame);
        }

        if self.buffer.len() < 4 {
            return FrameOutcome::NeedMore;
        }
        if self.buffer[0..4] != PREAMBLE {
            return FrameOutcome::Invalid;
        }
        if self.buffer.len() < AVL_HEADER_LEN {
            return FrameOutcome::NeedMore;
        }

        let data_length =
            u32::from_be_bytes([self.buffer[4], self.buffer[5], self.buffer[6], self.buffer[7]]) as usize;
        if data_length > TELTONIKA_MAX_AVL_DATA_LENGTH {
            return FrameOutcome::Invalid;
        }

        let frame_len = AVL_HEADER_LEN + data_length + AVL_CRC_LEN;
        if self.buffer.len() < frame_len {
            return FrameOutcome::NeedMore;
        }

        let frame = self.buffer.drain(..frame_len).collect();
        FrameOutcome::Frame(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::hex_to_bytes;

    #[test]
    fn test_takes_imei_frame() {
        let mut reassembler = TeltonikaReassembler::new();
        let imei = "333209084005012";
        assert_eq!(imei.len(), IMEI_DIGIT_COUNT);
        let mut frame = (IMEI_DIGIT_COUNT as u16).to_be_bytes().to_vec();
        frame.extend_from_slice(imei.as_bytes());
        reassembler.append(&frame);
        assert_eq!(reassembler.try_take_frame(), FrameOutcome::Frame(frame));
    }

    #[test]
    fn test_takes_avl_frame() {
        let mut reassembler = TeltonikaReassembler::new();
        let frame = hex_to_bytes(
            "000000000000003608010000016B40D8EA30010000000000000000000000000000000105021503010101425E0F01F10000601A014E0000000000000000010000C7CF",
        );
        reassembler.append(&frame);
        assert_eq!(reassembler.try_take_frame(), FrameOutcome::Frame(frame));
    }

    #[test]
    fn test_oversized_data_length_is_invalid() {
        let mut reassembler = TeltonikaReassembler::new();
        let mut frame = vec![0x00, 0x00, 0x00, 0x00];
        frame.extend_from_slice(&((TELTONIKA_MAX_AVL_DATA_LENGTH + 1) as u32).to_be_bytes());
        reassembler.append(&frame);
        assert_eq!(reassembler.try_take_frame(), FrameOutcome::Invalid);
    }

    #[test]
    fn test_unknown_prefix_is_invalid() {
        let mut reassembler = TeltonikaReassembler::new();
        reassembler.append(&hex_to_bytes("00010203"));
        assert_eq!(reassembler.try_take_frame(), FrameOutcome::Invalid);
    }

    #[test]
    fn test_partial_avl_frame_needs_more() {
        let mut reassembler = TeltonikaReassembler::new();
        reassembler.append(&hex_to_bytes("0000000000000036"));
        assert_eq!(reassembler.try_take_frame(), FrameOutcome::NeedMore);
    }
}
