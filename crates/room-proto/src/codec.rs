//! Codec for encoding/decoding RPC frames
//!
//! Format (big endian):
//! `[body_len: u32][request_id: u32][kind: u8][flags: u8][method_len: u16][method][payload]`

use crate::frame::{Frame, FrameFlags, FrameKind};
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Invalid frame kind: {0}")]
    InvalidFrameKind(u8),

    #[error("Invalid method field: {0}")]
    InvalidMethod(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Length-prefixed frame codec
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        // Need at least 4 bytes for length header
        if src.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_FRAME_SIZE as usize {
            return Err(CodecError::FrameTooLarge(length));
        }
        if length < Frame::HEADER_SIZE {
            return Err(CodecError::InvalidMethod(format!(
                "body of {} bytes is shorter than the frame header",
                length
            )));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let mut body = src.split_to(length).freeze();

        let request_id = body.get_u32();
        let raw_kind = body.get_u8();
        let kind = FrameKind::try_from(raw_kind).map_err(CodecError::InvalidFrameKind)?;
        let flags = FrameFlags::from_u8(body.get_u8());
        let method_len = body.get_u16() as usize;

        if body.remaining() < method_len {
            return Err(CodecError::InvalidMethod(format!(
                "method length {} exceeds frame body",
                method_len
            )));
        }
        let method_bytes = body.split_to(method_len);

        if kind.opens_call() == method_bytes.is_empty() {
            return Err(CodecError::InvalidMethod(format!(
                "{:?} frame with {} byte method",
                kind, method_len
            )));
        }

        let method = String::from_utf8(method_bytes.to_vec())
            .map_err(|_| CodecError::InvalidMethod("method is not UTF-8".to_string()))?;

        Ok(Some(Frame {
            request_id,
            kind,
            flags,
            method,
            payload: body,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let body_len = frame.body_len();
        if body_len > MAX_FRAME_SIZE as usize {
            return Err(CodecError::FrameTooLarge(body_len));
        }
        if frame.method.len() > u16::MAX as usize {
            return Err(CodecError::InvalidMethod(format!(
                "method of {} bytes",
                frame.method.len()
            )));
        }
        if frame.kind.opens_call() == frame.method.is_empty() {
            return Err(CodecError::InvalidMethod(format!(
                "{:?} frame with {} byte method",
                frame.kind,
                frame.method.len()
            )));
        }

        dst.reserve(4 + body_len);
        dst.put_u32(body_len as u32);
        dst.put_u32(frame.request_id);
        dst.put_u8(frame.kind as u8);
        dst.put_u8(frame.flags.as_u8());
        dst.put_u16(frame.method.len() as u16);
        dst.put_slice(frame.method.as_bytes());
        dst.put(frame.payload);

        Ok(())
    }
}

/// Serialize a message payload
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Bytes, CodecError> {
    Ok(Bytes::from(bincode::serialize(value)?))
}

/// Deserialize a message payload
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(bincode::deserialize(bytes)?)
}
