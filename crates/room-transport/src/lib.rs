//! Transport layer for room connections
//!
//! Peers reach the room over any reliable byte stream. Before any RPC traffic
//! flows, both ends run a [`Handshaker`] that proves possession of their
//! ed25519 keys and agreement on the network key. The result is a
//! [`SecureChannel`]: the authenticated remote identity plus the byte stream.
//!
//! ```text
//!   Dialer / listener ──► raw byte stream ──► Handshaker ──► SecureChannel
//! ```
//!
//! Stream encryption is a concern of the handshake implementation and is not
//! provided by [`KeyHandshake`].

pub mod handshake;
pub mod memory;
pub mod tcp;

use async_trait::async_trait;
use room_proto::PeerIdentity;
use std::fmt::{self, Debug};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use handshake::KeyHandshake;
pub use memory::{MemoryDialer, MemoryListener};
pub use tcp::{TcpDialer, TcpRoomListener};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Dial error: {0}")]
    Dial(String),

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout")]
    Timeout,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A bidirectional byte stream
pub trait AsyncDuplex: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncDuplex for T {}

/// Type-erased byte stream
pub type BoxedIo = Box<dyn AsyncDuplex>;

/// An authenticated byte stream to a known peer
pub struct SecureChannel {
    pub remote: PeerIdentity,
    pub remote_addr: Option<SocketAddr>,
    pub io: BoxedIo,
}

impl SecureChannel {
    pub fn new(remote: PeerIdentity, io: BoxedIo) -> Self {
        Self {
            remote,
            remote_addr: None,
            io,
        }
    }

    pub fn with_remote_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.remote_addr = addr;
        self
    }
}

impl Debug for SecureChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureChannel")
            .field("remote", &self.remote)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

/// Authenticates both ends of a fresh byte stream
#[async_trait]
pub trait Handshaker: Send + Sync + Debug {
    /// Identity this side proves
    fn local_identity(&self) -> PeerIdentity;

    /// Run the dialing side. Fails unless the remote proves `expected`.
    async fn client(&self, io: BoxedIo, expected: &PeerIdentity) -> TransportResult<SecureChannel>;

    /// Run the accepting side. Any identity that completes the exchange is accepted.
    async fn server(&self, io: BoxedIo) -> TransportResult<SecureChannel>;
}

/// Client-side: opens raw byte streams to an address
#[async_trait]
pub trait Dialer: Send + Sync + Debug {
    async fn dial(&self, address: &str) -> TransportResult<(BoxedIo, Option<SocketAddr>)>;
}
