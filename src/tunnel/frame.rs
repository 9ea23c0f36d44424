//! Frame encoding/decoding for the tunnel protocol
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+--------+
//! |  Type  |        Stream ID (4B, BE)         |
//! +--------+--------+--------+--------+--------+
//! |        Payload Length (4B, BE)    |
//! +--------+--------+--------+--------+
//! |              Payload              |
//! +-----------------------------------+
//! ```
//!
//! Frames are self-delimiting, so the same encoding works one-frame-per-message
//! over WebSocket and back-to-back over a byte stream.

use super::TunnelError;
use crate::protocol::{ErrorReason, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 9;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Stream open request (client) or open acknowledgement (relay, empty payload)
    Open = 0x01,
    /// Data frame
    Data = 0x02,
    /// Half-close of the sender's direction
    Close = 0x03,
    /// Stream failure with reason code
    Error = 0x04,
    /// Ping (keepalive)
    Ping = 0x05,
    /// Pong (keepalive response)
    Pong = 0x06,
    /// Credit replenishment
    WindowUpdate = 0x07,
}

impl FrameType {
    /// Session-level frames travel on stream 0
    pub fn is_session_level(self) -> bool {
        matches!(self, FrameType::Ping | FrameType::Pong)
    }
}

impl TryFrom<u8> for FrameType {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, TunnelError> {
        match value {
            0x01 => Ok(FrameType::Open),
            0x02 => Ok(FrameType::Data),
            0x03 => Ok(FrameType::Close),
            0x04 => Ok(FrameType::Error),
            0x05 => Ok(FrameType::Ping),
            0x06 => Ok(FrameType::Pong),
            0x07 => Ok(FrameType::WindowUpdate),
            _ => Err(TunnelError::InvalidFrame(format!(
                "Unknown frame type: {}",
                value
            ))),
        }
    }
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Stream ID (0 for session-level frames)
    pub stream_id: u32,
    /// Payload data
    pub payload: Bytes,
}

impl Frame {
    /// Create a stream open frame carrying an encoded destination
    pub fn open(stream_id: u32, destination: Bytes) -> Self {
        Self {
            frame_type: FrameType::Open,
            stream_id,
            payload: destination,
        }
    }

    /// Create an open acknowledgement (relay side, dial succeeded)
    pub fn open_ack(stream_id: u32) -> Self {
        Self::open(stream_id, Bytes::new())
    }

    /// Create a new data frame
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Data,
            stream_id,
            payload,
        }
    }

    /// Create a stream close frame
    pub fn close(stream_id: u32) -> Self {
        Self {
            frame_type: FrameType::Close,
            stream_id,
            payload: Bytes::new(),
        }
    }

    /// Create a stream error frame
    pub fn error(stream_id: u32, reason: ErrorReason, detail: &str) -> Self {
        let mut payload = BytesMut::with_capacity(1 + detail.len());
        payload.put_u8(reason.code());
        payload.extend_from_slice(detail.as_bytes());
        Self {
            frame_type: FrameType::Error,
            stream_id,
            payload: payload.freeze(),
        }
    }

    /// Create a window update frame
    pub fn window_update(stream_id: u32, increment: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(increment);
        Self {
            frame_type: FrameType::WindowUpdate,
            stream_id,
            payload: payload.freeze(),
        }
    }

    /// Create a ping frame
    pub fn ping(nonce: u64) -> Self {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u64(nonce);
        Self {
            frame_type: FrameType::Ping,
            stream_id: 0,
            payload: payload.freeze(),
        }
    }

    /// Create a pong frame
    pub fn pong(nonce: u64) -> Self {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u64(nonce);
        Self {
            frame_type: FrameType::Pong,
            stream_id: 0,
            payload: payload.freeze(),
        }
    }

    /// Reason and detail of an ERROR frame
    pub fn error_reason(&self) -> (ErrorReason, String) {
        match self.payload.split_first() {
            Some((code, detail)) => (
                ErrorReason::from_code(*code),
                String::from_utf8_lossy(detail).into_owned(),
            ),
            None => (ErrorReason::GeneralFailure, String::new()),
        }
    }

    /// Credit increment of a WINDOW_UPDATE frame
    pub fn window_increment(&self) -> Result<u32, ProtocolError> {
        let bytes: [u8; 4] = self.payload[..]
            .try_into()
            .map_err(|_| ProtocolError::InvalidWindowUpdate(self.payload.len()))?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Nonce of a PING/PONG frame
    pub fn keepalive_nonce(&self) -> Result<u64, ProtocolError> {
        let bytes: [u8; 8] = self.payload[..]
            .try_into()
            .map_err(|_| ProtocolError::InvalidKeepalive(self.payload.len()))?;
        Ok(u64::from_be_bytes(bytes))
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode_into(&mut buf);
        buf
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_size());
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.stream_id);
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` while the buffer holds less than a whole frame; nothing
    /// is consumed in that case, so callers can keep appending and retry.
    pub fn decode(buf: &mut BytesMut, max_payload: usize) -> Result<Option<Self>, TunnelError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Peek at header to validate before waiting for the payload
        let frame_type = FrameType::try_from(buf[0])?;
        let stream_id = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let payload_len = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;

        if payload_len > max_payload {
            return Err(TunnelError::FrameTooLarge(payload_len, max_payload));
        }
        if frame_type.is_session_level() != (stream_id == 0) {
            return Err(TunnelError::InvalidFrame(format!(
                "{:?} frame on stream {}",
                frame_type, stream_id
            )));
        }

        if buf.len() < FRAME_HEADER_SIZE + payload_len {
            buf.reserve(FRAME_HEADER_SIZE + payload_len - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Self {
            frame_type,
            stream_id,
            payload,
        }))
    }

    /// Decode a frame that must occupy exactly one transport message
    pub fn decode_message(message: Bytes, max_payload: usize) -> Result<Self, TunnelError> {
        let total = message.len();
        let mut buf = BytesMut::from(&message[..]);
        match Self::decode(&mut buf, max_payload)? {
            Some(frame) if buf.is_empty() => Ok(frame),
            Some(_) => Err(TunnelError::InvalidFrame(format!(
                "{} trailing bytes in message",
                buf.len()
            ))),
            None => Err(TunnelError::InvalidFrame(format!(
                "Truncated frame in {} byte message",
                total
            ))),
        }
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

/// Codec for carrying frames over a byte-stream transport
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TunnelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TunnelError> {
        Frame::decode(src, self.max_payload)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = TunnelError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), TunnelError> {
        if frame.payload.len() > self.max_payload {
            return Err(TunnelError::FrameTooLarge(
                frame.payload.len(),
                self.max_payload,
            ));
        }
        frame.encode_into(dst);
        Ok(())
    }
}
