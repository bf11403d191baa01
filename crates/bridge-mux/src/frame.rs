//! Multiplexer frame format
//!
//! `[stream_id: u32][type: u8][length: u32][payload]`, big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Stream identifier
pub type StreamId = u32;

/// Largest payload carried by one frame
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Open = 0,
    Data = 1,
    Close = 2,
    Ping = 3,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Open),
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Close),
            3 => Ok(FrameType::Ping),
            _ => Err(MuxError::InvalidFrameType(value)),
        }
    }
}

/// Multiplexed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    /// stream_id (4) + frame_type (1) + length (4)
    pub const HEADER_SIZE: usize = 9;

    pub fn new(stream_id: StreamId, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            payload,
        }
    }

    pub fn open(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Open, Bytes::new())
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new())
    }

    pub fn ping() -> Self {
        Self::new(0, FrameType::Ping, Bytes::new())
    }
}

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Multiplexer closed")]
    Closed,

    #[error("Idle timeout")]
    IdleTimeout,
}

/// `tokio_util` codec for [`Frame`]
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = MuxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, MuxError> {
        if src.len() < Frame::HEADER_SIZE {
            return Ok(None);
        }

        let frame_type = FrameType::try_from(src[4])?;
        let length = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(MuxError::FrameTooLarge(length));
        }

        let total = Frame::HEADER_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let stream_id = src.get_u32();
        src.advance(5);
        let payload = src.split_to(length).freeze();

        Ok(Some(Frame {
            stream_id,
            frame_type,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = MuxError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), MuxError> {
        let payload_len = frame.payload.len();
        if payload_len > MAX_FRAME_SIZE {
            return Err(MuxError::FrameTooLarge(payload_len));
        }

        dst.reserve(Frame::HEADER_SIZE + payload_len);
        dst.put_u32(frame.stream_id);
        dst.put_u8(frame.frame_type as u8);
        dst.put_u32(payload_len as u32);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}
