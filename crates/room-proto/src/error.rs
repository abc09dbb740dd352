//! Error taxonomy shared by the room and its peers

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error kinds carried inside error frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Dial,
    Handshake,
    PermissionDenied,
    InvalidState,
    PeerUnreachable,
    AliasTaken,
    NotOwner,
    CapacityExceeded,
    ProtocolViolation,
    ConnectionClosed,
    BadRequest,
    Internal,
}

/// Payload of an error frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// Room errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoomError {
    #[error("Dial failed: {0}")]
    Dial(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("Alias taken: {0}")]
    AliasTaken(String),

    #[error("Not owner: {0}")]
    NotOwner(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RoomError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RoomError::Dial(_) => ErrorKind::Dial,
            RoomError::Handshake(_) => ErrorKind::Handshake,
            RoomError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            RoomError::InvalidState(_) => ErrorKind::InvalidState,
            RoomError::PeerUnreachable(_) => ErrorKind::PeerUnreachable,
            RoomError::AliasTaken(_) => ErrorKind::AliasTaken,
            RoomError::NotOwner(_) => ErrorKind::NotOwner,
            RoomError::CapacityExceeded(_) => ErrorKind::CapacityExceeded,
            RoomError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            RoomError::ConnectionClosed => ErrorKind::ConnectionClosed,
            RoomError::BadRequest(_) => ErrorKind::BadRequest,
            RoomError::Internal(_) => ErrorKind::Internal,
        }
    }

    fn detail(&self) -> String {
        match self {
            RoomError::ConnectionClosed => String::new(),
            RoomError::Dial(m)
            | RoomError::Handshake(m)
            | RoomError::PermissionDenied(m)
            | RoomError::InvalidState(m)
            | RoomError::PeerUnreachable(m)
            | RoomError::AliasTaken(m)
            | RoomError::NotOwner(m)
            | RoomError::CapacityExceeded(m)
            | RoomError::ProtocolViolation(m)
            | RoomError::BadRequest(m)
            | RoomError::Internal(m) => m.clone(),
        }
    }

    pub fn to_body(&self) -> RpcErrorBody {
        RpcErrorBody {
            kind: self.kind(),
            message: self.detail(),
        }
    }

    pub fn from_body(body: RpcErrorBody) -> Self {
        let m = body.message;
        match body.kind {
            ErrorKind::Dial => RoomError::Dial(m),
            ErrorKind::Handshake => RoomError::Handshake(m),
            ErrorKind::PermissionDenied => RoomError::PermissionDenied(m),
            ErrorKind::InvalidState => RoomError::InvalidState(m),
            ErrorKind::PeerUnreachable => RoomError::PeerUnreachable(m),
            ErrorKind::AliasTaken => RoomError::AliasTaken(m),
            ErrorKind::NotOwner => RoomError::NotOwner(m),
            ErrorKind::CapacityExceeded => RoomError::CapacityExceeded(m),
            ErrorKind::ProtocolViolation => RoomError::ProtocolViolation(m),
            ErrorKind::ConnectionClosed => RoomError::ConnectionClosed,
            ErrorKind::BadRequest => RoomError::BadRequest(m),
            ErrorKind::Internal => RoomError::Internal(m),
        }
    }
}

impl From<RpcErrorBody> for RoomError {
    fn from(body: RpcErrorBody) -> Self {
        Self::from_body(body)
    }
}
