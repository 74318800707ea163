//! Per-connection frame reassembly.
//!
//! A [`Reassembler`] is purely a byte-buffer state machine: it knows nothing about record
//! semantics, only where one complete protocol frame ends and the next begins. Framing is
//! selected by listening port (`Protocol`), never sniffed from the stream.

pub mod gt06;
pub mod teltonika;

use crate::listener::Protocol;

/// Teltonika AVL data frames declare their own length; an implementation-defined cap guards
/// against a corrupt or hostile `dataLength` growing the buffer without bound.
pub const TELTONIKA_MAX_AVL_DATA_LENGTH: usize = 64 * 1024;

/// Outcome of a single attempt to pull a frame out of the buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A complete frame, already removed from the buffer.
    Frame(Vec<u8>),
    /// Not enough bytes buffered yet; try again after the next read.
    NeedMore,
    /// The buffered bytes cannot be a valid frame prefix for this protocol. The connection
    /// must be closed; silent resync is forbidden (it would let a malformed device grow the
    /// buffer forever).
    Invalid,
}

/// Per-connection frame reassembler. One instance is owned exclusively by the task driving
/// the connection; the receive buffer is never shared.
pub trait Reassembler: Send {
    /// Appends freshly-read bytes to the internal buffer.
    fn append(&mut self, bytes: &[u8]);

    /// Attempts to take the next complete frame out of the buffer. Never blocks.
    fn try_take_frame(&mut self) -> FrameOutcome;
}

/// Constructs the reassembler appropriate for a listening port's protocol.
pub fn reassembler_for(protocol: Protocol) -> Box<dyn Reassembler> {
    match protocol {
        Protocol::Gt06 => Box::new(gt06::Gt06Reassembler::new()),
        Protocol::Teltonika => Box::new(teltonika::TeltonikaReassembler::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Property P1: splitting a byte stream into arbitrary chunks must not change the
    /// sequence of frames a reassembler yields, compared to delivering it as one chunk.
    fn assert_chunking_is_idempotent(protocol: Protocol, stream: &[u8], chunk_sizes: &[usize]) {
        let mut whole = reassembler_for(protocol);
        whole.append(stream);
        let whole_frames = drain_frames(whole.as_mut());

        let mut chunked = reassembler_for(protocol);
        let mut offset = 0;
        for size in chunk_sizes {
            let end = (offset + size).min(stream.len());
            chunked.append(&stream[offset..end]);
            offset = end;
            if offset >= stream.len() {
                break;
            }
        }
        let chunked_frames = drain_frames(chunked.as_mut());

        assert_eq!(whole_frames, chunked_frames);
    }

    fn drain_frames(reassembler: &mut dyn Reassembler) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        loop {
            match reassembler.try_take_frame() {
                FrameOutcome::Frame(frame) => frames.push(frame),
                FrameOutcome::NeedMore => break,
                FrameOutcome::Invalid => break,
            }
        }
        frames
    }

    #[test]
    fn test_gt06_framing_is_chunk_independent() {
        let login = crate::utils::hex_to_bytes("78780d010000000003332210000100770d0a");
        let heartbeat = crate::utils::hex_to_bytes("787805130001ffff0d0a");
        let mut stream = login.clone();
        stream.extend_from_slice(&heartbeat);

        assert_chunking_is_idempotent(Protocol::Gt06, &stream, &[1, 2, 3, 5, 1000]);
        assert_chunking_is_idempotent(Protocol::Gt06, &stream, &[stream.len()]);
    }
}
