//! RPC frames exchanged over a room channel

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Request identifier, unique per channel and direction
pub type RequestId = u32;

/// Frame kinds
///
/// The first five kinds open a call and carry a method name. The remaining
/// kinds travel on an already open call and must not carry one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameKind {
    Async = 0,
    Source = 1,
    Sink = 2,
    Duplex = 3,
    Notify = 4,
    Data = 5,
    End = 6,
    Error = 7,
    Abort = 8,
}

impl FrameKind {
    pub fn opens_call(&self) -> bool {
        self.call_kind().is_some()
    }

    pub fn call_kind(&self) -> Option<CallKind> {
        match self {
            FrameKind::Async => Some(CallKind::Async),
            FrameKind::Source => Some(CallKind::Source),
            FrameKind::Sink => Some(CallKind::Sink),
            FrameKind::Duplex => Some(CallKind::Duplex),
            FrameKind::Notify => Some(CallKind::Notify),
            _ => None,
        }
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(FrameKind::Async),
            1 => Ok(FrameKind::Source),
            2 => Ok(FrameKind::Sink),
            3 => Ok(FrameKind::Duplex),
            4 => Ok(FrameKind::Notify),
            5 => Ok(FrameKind::Data),
            6 => Ok(FrameKind::End),
            7 => Ok(FrameKind::Error),
            8 => Ok(FrameKind::Abort),
            other => Err(other),
        }
    }
}

/// Shape of a call: how many values travel in each direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallKind {
    /// One request, one response
    Async,
    /// One request, a stream of responses
    Source,
    /// A stream of requests, one response
    Sink,
    /// Streams in both directions
    Duplex,
    /// One request, no response
    Notify,
}

impl CallKind {
    pub fn frame_kind(&self) -> FrameKind {
        match self {
            CallKind::Async => FrameKind::Async,
            CallKind::Source => FrameKind::Source,
            CallKind::Sink => FrameKind::Sink,
            CallKind::Duplex => FrameKind::Duplex,
            CallKind::Notify => FrameKind::Notify,
        }
    }

    /// Whether the caller keeps sending after the opening frame
    pub fn caller_streams(&self) -> bool {
        matches!(self, CallKind::Sink | CallKind::Duplex)
    }

    /// Whether the callee answers with a stream
    pub fn callee_streams(&self) -> bool {
        matches!(self, CallKind::Source | CallKind::Duplex)
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Set on every frame written by the callee of a request
    pub const REPLY: u8 = 0b0000_0001;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_reply(mut self) -> Self {
        self.0 |= Self::REPLY;
        self
    }

    pub fn is_reply(&self) -> bool {
        self.0 & Self::REPLY != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

/// A single RPC frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub request_id: RequestId,
    pub kind: FrameKind,
    pub flags: FrameFlags,
    /// Method name, only present on call-opening frames
    pub method: String,
    pub payload: Bytes,
}

impl Frame {
    /// Header size after the length prefix: request_id (4) + kind (1) + flags (1) + method_len (2)
    pub const HEADER_SIZE: usize = 8;

    pub fn new(request_id: RequestId, kind: FrameKind, payload: Bytes) -> Self {
        Self {
            request_id,
            kind,
            flags: FrameFlags::new(),
            method: String::new(),
            payload,
        }
    }

    pub fn call(
        request_id: RequestId,
        kind: CallKind,
        method: impl Into<String>,
        payload: Bytes,
    ) -> Self {
        Self {
            method: method.into(),
            ..Self::new(request_id, kind.frame_kind(), payload)
        }
    }

    pub fn data(request_id: RequestId, payload: Bytes) -> Self {
        Self::new(request_id, FrameKind::Data, payload)
    }

    pub fn end(request_id: RequestId) -> Self {
        Self::new(request_id, FrameKind::End, Bytes::new())
    }

    pub fn error(request_id: RequestId, payload: Bytes) -> Self {
        Self::new(request_id, FrameKind::Error, payload)
    }

    pub fn abort(request_id: RequestId) -> Self {
        Self::new(request_id, FrameKind::Abort, Bytes::new())
    }

    /// Mark the frame as written by the callee
    pub fn as_reply(mut self) -> Self {
        self.flags = self.flags.with_reply();
        self
    }

    pub fn is_reply(&self) -> bool {
        self.flags.is_reply()
    }

    /// Encoded body length, excluding the u32 length prefix
    pub fn body_len(&self) -> usize {
        Self::HEADER_SIZE + self.method.len() + self.payload.len()
    }
}
