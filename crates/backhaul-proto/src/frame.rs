//! Framing for physical tunnel connections
//!
//! One physical connection carries a sequence of logical sessions. Session
//! bytes travel as DATA frames, a FIN frame closes the sender's half of the
//! current session, and PING/PONG keep the connection alive through idle
//! periods.
//!
//! Frame format:
//! - 1 byte: frame type
//! - 4 bytes: payload length (big-endian u32)
//! - Rest: payload

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::MAX_FRAME_SIZE;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0,
    Fin = 1,
    Ping = 2,
    Pong = 3,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Data),
            1 => Ok(FrameType::Fin),
            2 => Ok(FrameType::Ping),
            3 => Ok(FrameType::Pong),
            _ => Err(FrameError::InvalidFrameType(value)),
        }
    }
}

/// A single tunnel frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Bytes belonging to the current logical session
    Data(Bytes),
    /// The sender finished writing the current logical session
    Fin,
    /// Keepalive ping carrying a nonce
    Ping(u64),
    /// Answer to a ping, echoing its nonce
    Pong(u64),
}

impl Frame {
    /// Frame header size: frame_type (1) + length (4) = 5 bytes
    pub const HEADER_SIZE: usize = 5;

    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Data(_) => FrameType::Data,
            Frame::Fin => FrameType::Fin,
            Frame::Ping(_) => FrameType::Ping,
            Frame::Pong(_) => FrameType::Pong,
        }
    }

    /// Payload length on the wire
    pub fn payload_len(&self) -> usize {
        match self {
            Frame::Data(data) => data.len(),
            Frame::Fin => 0,
            Frame::Ping(_) | Frame::Pong(_) => 8,
        }
    }

    /// Append the encoded frame to `dst`
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
        let payload_len = self.payload_len();
        if payload_len > MAX_FRAME_SIZE as usize {
            return Err(FrameError::FrameTooLarge(payload_len));
        }

        dst.reserve(Self::HEADER_SIZE + payload_len);
        dst.put_u8(self.frame_type() as u8);
        dst.put_u32(payload_len as u32);

        match self {
            Frame::Data(data) => dst.put_slice(data),
            Frame::Fin => {}
            Frame::Ping(nonce) | Frame::Pong(nonce) => dst.put_u64(*nonce),
        }

        Ok(())
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + self.payload_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode exactly one frame from a complete message (WebSocket transport)
    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(FrameError::IncompleteFrame);
        }

        let frame_type = FrameType::try_from(buf.get_u8())?;
        let length = buf.get_u32();

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length as usize));
        }

        if buf.remaining() != length as usize {
            return Err(FrameError::IncompleteFrame);
        }

        Self::from_parts(frame_type, buf)
    }

    fn from_parts(frame_type: FrameType, mut payload: Bytes) -> Result<Self, FrameError> {
        match frame_type {
            FrameType::Data => Ok(Frame::Data(payload)),
            FrameType::Fin => {
                if !payload.is_empty() {
                    return Err(FrameError::InvalidPayload(frame_type));
                }
                Ok(Frame::Fin)
            }
            FrameType::Ping | FrameType::Pong => {
                if payload.len() != 8 {
                    return Err(FrameError::InvalidPayload(frame_type));
                }
                let nonce = payload.get_u64();
                if frame_type == FrameType::Ping {
                    Ok(Frame::Ping(nonce))
                } else {
                    Ok(Frame::Pong(nonce))
                }
            }
        }
    }
}

/// Frame errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Incomplete frame")]
    IncompleteFrame,

    #[error("Invalid payload for {0:?} frame")]
    InvalidPayload(FrameType),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Streaming codec for byte-oriented transports (HTTP/2 bodies)
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < Frame::HEADER_SIZE {
            return Ok(None);
        }

        let frame_type = FrameType::try_from(src[0])?;
        let length = u32::from_be_bytes([src[1], src[2], src[3], src[4]]);

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length as usize));
        }

        let total = Frame::HEADER_SIZE + length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(Frame::HEADER_SIZE);
        let payload = src.split_to(length as usize).freeze();
        Frame::from_parts(frame_type, payload).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_into(dst)
    }
}
