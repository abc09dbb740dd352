//! ed25519 challenge handshake
//!
//! Both sides write `hello = sha256(network_key) ‖ public_key ‖ nonce` and read
//! the peer's hello. Each then signs
//! `"tunnelroom-handshake" ‖ net_hash ‖ peer_nonce ‖ own_nonce ‖ own_key` and
//! verifies the peer's signature over the mirrored message.

use crate::{BoxedIo, Handshaker, SecureChannel, TransportError, TransportResult};
use async_trait::async_trait;
use rand::RngCore;
use room_proto::{KeyPair, PeerIdentity};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

const CONTEXT: &[u8] = b"tunnelroom-handshake";
const HELLO_LEN: usize = 96;
const PROOF_LEN: usize = 64;

/// Handshake proving possession of an ed25519 key on a shared network key
#[derive(Debug, Clone)]
pub struct KeyHandshake {
    keys: KeyPair,
    net_hash: [u8; 32],
    timeout: Duration,
}

struct Hello {
    net_hash: [u8; 32],
    key: PeerIdentity,
    nonce: [u8; 32],
}

impl KeyHandshake {
    pub fn new(keys: KeyPair, network_key: &[u8]) -> Self {
        let net_hash: [u8; 32] = Sha256::digest(network_key).into();
        Self {
            keys,
            net_hash,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn proof_message(
        &self,
        peer_nonce: &[u8; 32],
        own_nonce: &[u8; 32],
        own_key: &PeerIdentity,
    ) -> Vec<u8> {
        let mut msg = Vec::with_capacity(CONTEXT.len() + 32 * 4);
        msg.extend_from_slice(CONTEXT);
        msg.extend_from_slice(&self.net_hash);
        msg.extend_from_slice(peer_nonce);
        msg.extend_from_slice(own_nonce);
        msg.extend_from_slice(own_key.as_bytes());
        msg
    }

    async fn exchange(
        &self,
        mut io: BoxedIo,
        expected: Option<&PeerIdentity>,
    ) -> TransportResult<SecureChannel> {
        let mut own_nonce = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut own_nonce);
        let own_key = self.keys.identity();

        let mut hello = [0u8; HELLO_LEN];
        hello[..32].copy_from_slice(&self.net_hash);
        hello[32..64].copy_from_slice(own_key.as_bytes());
        hello[64..].copy_from_slice(&own_nonce);
        io.write_all(&hello).await.map_err(handshake_io)?;
        io.flush().await.map_err(handshake_io)?;

        let mut peer_hello = [0u8; HELLO_LEN];
        io.read_exact(&mut peer_hello).await.map_err(handshake_io)?;
        let peer = parse_hello(&peer_hello)?;

        if peer.net_hash != self.net_hash {
            return Err(TransportError::Handshake("network key mismatch".to_string()));
        }
        if let Some(expected) = expected {
            if &peer.key != expected {
                return Err(TransportError::Handshake(format!(
                    "expected {} but remote is {}",
                    expected, peer.key
                )));
            }
        }
        if peer.key == own_key {
            return Err(TransportError::Handshake("remote uses our own key".to_string()));
        }

        let proof = self
            .keys
            .sign(&self.proof_message(&peer.nonce, &own_nonce, &own_key));
        io.write_all(&proof).await.map_err(handshake_io)?;
        io.flush().await.map_err(handshake_io)?;

        let mut peer_proof = [0u8; PROOF_LEN];
        io.read_exact(&mut peer_proof).await.map_err(handshake_io)?;

        let expected_msg = self.proof_message(&own_nonce, &peer.nonce, &peer.key);
        if !peer.key.verify(&expected_msg, &peer_proof) {
            return Err(TransportError::Handshake("invalid key proof".to_string()));
        }

        debug!(remote = %peer.key, "Handshake complete");
        Ok(SecureChannel::new(peer.key, io))
    }
}

fn parse_hello(buf: &[u8; HELLO_LEN]) -> TransportResult<Hello> {
    let mut net_hash = [0u8; 32];
    let mut nonce = [0u8; 32];
    net_hash.copy_from_slice(&buf[..32]);
    nonce.copy_from_slice(&buf[64..]);
    let key = PeerIdentity::from_slice(&buf[32..64])
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
    Ok(Hello {
        net_hash,
        key,
        nonce,
    })
}

fn handshake_io(err: std::io::Error) -> TransportError {
    match err.kind() {
        std::io::ErrorKind::UnexpectedEof => {
            TransportError::Handshake("remote closed during handshake".to_string())
        }
        _ => TransportError::Io(err),
    }
}

#[async_trait]
impl Handshaker for KeyHandshake {
    fn local_identity(&self) -> PeerIdentity {
        self.keys.identity()
    }

    async fn client(&self, io: BoxedIo, expected: &PeerIdentity) -> TransportResult<SecureChannel> {
        tokio::time::timeout(self.timeout, self.exchange(io, Some(expected)))
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    async fn server(&self, io: BoxedIo) -> TransportResult<SecureChannel> {
        tokio::time::timeout(self.timeout, self.exchange(io, None))
            .await
            .map_err(|_| TransportError::Timeout)?
    }
}
