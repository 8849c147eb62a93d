// Glues the frame layer to the compression layer: encodes a payload,
// compresses it if a codec is configured and the payload clears
// `min_compress_size`, and sets the compression flag accordingly. Decoding
// reverses the same steps.

use bytes::BytesMut;

use crate::compression::{self, CompressionAlgorithm, DEFAULT_MIN_COMPRESS_SIZE};
use crate::error::Result;
use crate::wire::frame::{Frame, FrameType};

#[derive(Debug, Clone)]
pub struct FrameCodec {
    pub algorithm: CompressionAlgorithm,
    pub min_compress_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::None,
            min_compress_size: DEFAULT_MIN_COMPRESS_SIZE,
        }
    }
}

impl FrameCodec {
    pub fn new(algorithm: CompressionAlgorithm) -> Self {
        Self { algorithm, ..Self::default() }
    }

    pub fn encode(&self, frame_type: FrameType, payload: &[u8]) -> Result<BytesMut> {
        let frame = if self.algorithm != CompressionAlgorithm::None && payload.len() >= self.min_compress_size {
            let compressed = compression::compress(self.algorithm, payload)?;
            if compressed.len() < payload.len() {
                Frame::compressed(frame_type, compressed)
            } else {
                Frame::new(frame_type, payload.to_vec())
            }
        } else {
            Frame::new(frame_type, payload.to_vec())
        };
        frame.encode()
    }

    /// Try to decode one frame from `buf`. Returns `None` if the buffer does
    /// not yet contain a complete frame.
    pub fn try_decode(&self, buf: &mut BytesMut) -> Result<Option<(FrameType, Vec<u8>)>> {
        let Some(frame) = Frame::try_decode(buf)? else {
            return Ok(None);
        };
        let payload = if frame.compressed {
            compression::decompress(self.algorithm, &frame.payload)?
        } else {
            frame.payload
        };
        Ok(Some((frame.frame_type, payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payload_bypasses_compression() {
        let codec = FrameCodec { algorithm: CompressionAlgorithm::Gzip, min_compress_size: 1024 };
        let mut encoded = codec.encode(FrameType::Ping, b"hi").unwrap();
        let (frame_type, payload) = codec.try_decode(&mut encoded).unwrap().unwrap();
        assert_eq!(frame_type, FrameType::Ping);
        assert_eq!(payload, b"hi");
    }

    #[test]
    fn large_payload_round_trips_through_compression() {
        let codec = FrameCodec { algorithm: CompressionAlgorithm::Gzip, min_compress_size: 16 };
        let payload = b"the quick brown fox jumps over the lazy dog".repeat(16);
        let mut encoded = codec.encode(FrameType::Query, &payload).unwrap();
        let (_, decoded) = codec.try_decode(&mut encoded).unwrap().unwrap();
        assert_eq!(decoded, payload);
    }
}
