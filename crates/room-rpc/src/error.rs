use room_proto::{CodecError, RoomError};
use thiserror::Error;

/// RPC channel errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Remote error: {0}")]
    Remote(RoomError),

    #[error("Request ids exhausted")]
    RequestIdsExhausted,

    #[error("Call aborted")]
    Aborted,

    #[error("Call already finished")]
    CallFinished,

    #[error("Codec error: {0}")]
    Codec(String),
}

impl From<CodecError> for RpcError {
    fn from(err: CodecError) -> Self {
        RpcError::Codec(err.to_string())
    }
}

impl From<RpcError> for RoomError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::ConnectionClosed | RpcError::Aborted => RoomError::ConnectionClosed,
            RpcError::ProtocolViolation(reason) => RoomError::ProtocolViolation(reason),
            RpcError::Remote(err) => err,
            RpcError::RequestIdsExhausted => {
                RoomError::CapacityExceeded("request ids exhausted".to_string())
            }
            RpcError::CallFinished => RoomError::InvalidState("call already finished".to_string()),
            RpcError::Codec(reason) => RoomError::BadRequest(reason),
        }
    }
}
