//! Length-prefixed framing shared by both transports
//!
//! Every envelope travels as:
//! ```text
//! [ 4 bytes: length (u32, big-endian) ][ N bytes: protobuf Envelope ]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;

use crate::Envelope;

/// Maximum frame body (10 MB)
pub const MAX_FRAME_SIZE: u32 = 10 * 1024 * 1024;

const PREFIX_LEN: usize = 4;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge(usize),

    #[error("length prefix {0} exceeds the {MAX_FRAME_SIZE} byte limit")]
    InvalidLength(u32),

    #[error("malformed envelope: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("envelope encoding failed: {0}")]
    Encode(#[from] prost::EncodeError),
}

/// Encode an envelope into a single length-prefixed frame
pub fn encode(envelope: &Envelope) -> Result<Bytes, CodecError> {
    let body_len = envelope.encoded_len();
    let prefix = u32::try_from(body_len)
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or(CodecError::FrameTooLarge(body_len))?;

    let mut frame = BytesMut::with_capacity(PREFIX_LEN + body_len);
    frame.put_u32(prefix);
    envelope.encode(&mut frame)?;
    Ok(frame.freeze())
}

/// Incremental frame reader.
///
/// Bytes go straight into [`buffer_mut`](Self::buffer_mut), typically via
/// `read_buf`. The body length is remembered once its prefix has been read,
/// so a large frame arriving in many chunks is only measured once.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    /// Body length of the frame at the head of `buffer`, prefix consumed
    body_len: Option<usize>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            body_len: None,
        }
    }

    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Whether a frame has been started but not finished
    pub fn has_partial(&self) -> bool {
        self.body_len.is_some() || !self.buffer.is_empty()
    }

    /// Take the next whole envelope, if one has arrived.
    ///
    /// Call until it returns `Ok(None)` to drain every buffered frame.
    pub fn decode_next(&mut self) -> Result<Option<Envelope>, CodecError> {
        let body_len = match self.body_len {
            Some(len) => len,
            None if self.buffer.len() < PREFIX_LEN => return Ok(None),
            None => {
                let prefix = self.buffer.get_u32();
                if prefix > MAX_FRAME_SIZE {
                    return Err(CodecError::InvalidLength(prefix));
                }
                self.buffer.reserve(prefix as usize);
                *self.body_len.insert(prefix as usize)
            }
        };

        if self.buffer.len() < body_len {
            return Ok(None);
        }

        self.body_len = None;
        let body = self.buffer.split_to(body_len).freeze();
        Ok(Some(Envelope::decode(body)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{envelope::Payload, TransportKind};

    fn chat_event() -> Envelope {
        Envelope {
            sequence_id: 3,
            ..Envelope::event("chat", Bytes::from_static(b"hello"))
        }
    }

    #[test]
    fn test_length_prefix_matches_body() {
        let encoded = encode(&chat_event()).expect("encode failed");
        let prefix = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(prefix as usize, encoded.len() - PREFIX_LEN);

        let mut decoder = FrameDecoder::new();
        decoder.buffer_mut().extend_from_slice(&encoded);
        let decoded = decoder
            .decode_next()
            .expect("decode failed")
            .expect("no frame");
        assert_eq!(decoded.sequence_id, 3);
        match decoded.payload {
            Some(Payload::Event(ev)) => {
                assert_eq!(ev.name, "chat");
                assert_eq!(&ev.payload[..], b"hello");
            }
            other => panic!("unexpected payload: {:?}", other),
        }
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let encoded = encode(&chat_event()).expect("encode failed");

        let mut decoder = FrameDecoder::new();
        decoder.buffer_mut().extend_from_slice(&encoded[..6]);
        assert!(decoder
            .decode_next()
            .expect("partial data is not an error")
            .is_none());
        assert!(decoder.has_partial());

        decoder.buffer_mut().extend_from_slice(&encoded[6..]);
        assert!(decoder.decode_next().expect("decode error").is_some());
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_decoder_across_chunks_and_frames() {
        let first = encode(&Envelope::handshake(None, "/", TransportKind::Reliable, ""))
            .expect("encode failed");
        let second = encode(&chat_event()).expect("encode failed");

        let mut decoder = FrameDecoder::new();
        decoder.buffer_mut().extend_from_slice(&first[..3]);
        assert!(decoder.decode_next().expect("decode error").is_none());

        decoder.buffer_mut().extend_from_slice(&first[3..]);
        decoder.buffer_mut().extend_from_slice(&second);
        assert!(matches!(
            decoder.decode_next().expect("decode error").and_then(|e| e.payload),
            Some(Payload::Handshake(_))
        ));
        assert!(matches!(
            decoder.decode_next().expect("decode error").and_then(|e| e.payload),
            Some(Payload::Event(_))
        ));
        assert!(decoder.decode_next().expect("decode error").is_none());
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_oversized_prefix_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.buffer_mut().put_u32(MAX_FRAME_SIZE + 1);
        decoder.buffer_mut().put_bytes(0, 16);

        assert!(matches!(
            decoder.decode_next(),
            Err(CodecError::InvalidLength(_))
        ));
    }
}
