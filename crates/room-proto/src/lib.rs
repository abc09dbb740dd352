//! Room Protocol Definitions
//!
//! This crate defines the wire frames, peer identities, the RPC manifest and the
//! message payloads shared by the room server and the peers that connect to it.

pub mod codec;
pub mod confirm;
pub mod error;
pub mod frame;
pub mod identity;
pub mod manifest;
pub mod messages;

pub use codec::{decode_payload, encode_payload, CodecError, FrameCodec};
pub use error::{ErrorKind, RoomError, RpcErrorBody};
pub use frame::{CallKind, Frame, FrameFlags, FrameKind, RequestId};
pub use identity::{IdentityError, KeyPair, PeerIdentity};
pub use manifest::{Manifest, Method, PrivacyMode, TrustTier, UnknownMethod};
pub use messages::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame body size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;
