//! Each frame is a 3-byte big-endian length prefix followed by the payload.
//! The first outbound frame is additionally preceded by the connection intro.

use crate::noise::{NoiseError, Result};
use bytes::{Buf, Bytes, BytesMut};
use log::trace;

pub const FRAME_LENGTH_SIZE: usize = 3;
pub const FRAME_MAX_SIZE: usize = 2 << 23;

/// Encodes a payload into a frame, optionally prepending `header`.
pub fn encode_frame(payload: &[u8], header: Option<&[u8]>) -> Result<Vec<u8>> {
    let payload_len = payload.len();

    if payload_len >= FRAME_MAX_SIZE {
        return Err(NoiseError::FrameTooLarge {
            max: FRAME_MAX_SIZE,
            got: payload_len,
        });
    }

    let header = header.unwrap_or_default();
    let mut data = Vec::with_capacity(header.len() + FRAME_LENGTH_SIZE + payload_len);
    data.extend_from_slice(header);
    data.extend_from_slice(&(payload_len as u32).to_be_bytes()[1..]);
    data.extend_from_slice(payload);

    Ok(data)
}

/// Buffers incoming data and extracts complete frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the next complete frame payload, if one is buffered.
    pub fn decode_frame(&mut self) -> Option<Bytes> {
        if self.buffer.len() < FRAME_LENGTH_SIZE {
            return None;
        }

        let frame_len = ((self.buffer[0] as usize) << 16)
            | ((self.buffer[1] as usize) << 8)
            | (self.buffer[2] as usize);

        if self.buffer.len() >= FRAME_LENGTH_SIZE + frame_len {
            self.buffer.advance(FRAME_LENGTH_SIZE);
            let frame_data = self.buffer.split_to(frame_len).freeze();
            trace!(target: "Noise/Framing", "<-- Decoded frame: {} bytes", frame_data.len());
            Some(frame_data)
        } else {
            None
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_precedes_length_prefix() {
        let encoded = encode_frame(&[1, 2, 3], Some(&[0xAA, 0xBB])).unwrap();
        assert_eq!(encoded, vec![0xAA, 0xBB, 0, 0, 3, 1, 2, 3]);
    }

    #[test]
    fn frames_split_across_reads() {
        let mut decoder = FrameDecoder::new();

        decoder.feed(&[0, 0, 5, 1, 2]);
        assert!(decoder.decode_frame().is_none());

        decoder.feed(&[3, 4, 5]);
        let frame = decoder.decode_frame().unwrap();
        assert_eq!(&frame[..], &[1, 2, 3, 4, 5]);
        assert!(decoder.decode_frame().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn frames_batched_in_one_read() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[0, 0, 2, 0xAA, 0xBB, 0, 0, 3, 0xCC, 0xDD, 0xEE, 0]);

        assert_eq!(&decoder.decode_frame().unwrap()[..], &[0xAA, 0xBB]);
        assert_eq!(&decoder.decode_frame().unwrap()[..], &[0xCC, 0xDD, 0xEE]);
        assert!(decoder.decode_frame().is_none());
        assert_eq!(decoder.buffered(), 1);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let large_payload = vec![0u8; FRAME_MAX_SIZE];
        assert!(matches!(
            encode_frame(&large_payload, None),
            Err(NoiseError::FrameTooLarge { .. })
        ));
    }
}
