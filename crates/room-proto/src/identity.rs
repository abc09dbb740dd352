//! Peer identities and signing keys
//!
//! A peer is identified by its ed25519 public key. The textual form is
//! `@<base64>.ed25519`, the same shape peers already use to refer to each other.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const SUFFIX: &str = ".ed25519";

/// Identity parsing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identity must start with '@' and end with '{SUFFIX}'")]
    MalformedRef,

    #[error("invalid base64 in identity: {0}")]
    InvalidEncoding(String),

    #[error("expected 32 key bytes, got {0}")]
    InvalidLength(usize),

    #[error("not a valid ed25519 public key")]
    InvalidKey,
}

/// Public-key derived identifier of a peer
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerIdentity([u8; 32]);

impl PeerIdentity {
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdentityError> {
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidLength(bytes.len()))?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short form used in log lines
    pub fn short(&self) -> String {
        let full = STANDARD.encode(self.0);
        format!("@{}", &full[..8])
    }

    /// Verify an ed25519 signature made by this identity over `message`
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(message, &signature).is_ok()
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}{}", STANDARD.encode(self.0), SUFFIX)
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerIdentity({})", self.short())
    }
}

impl FromStr for PeerIdentity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let encoded = s
            .strip_prefix('@')
            .and_then(|rest| rest.strip_suffix(SUFFIX))
            .ok_or(IdentityError::MalformedRef)?;

        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| IdentityError::InvalidEncoding(e.to_string()))?;

        let identity = Self::from_slice(&bytes)?;
        VerifyingKey::from_bytes(&identity.0).map_err(|_| IdentityError::InvalidKey)?;
        Ok(identity)
    }
}

// Text in config files, raw key bytes on the wire
impl Serialize for PeerIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for PeerIdentity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let text = String::deserialize(deserializer)?;
            text.parse().map_err(de::Error::custom)
        } else {
            <[u8; 32]>::deserialize(deserializer).map(Self)
        }
    }
}

/// An ed25519 key pair
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    /// Generate a fresh key pair from the OS random source
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Decode a key pair from its base64 encoded 32-byte seed
    pub fn from_base64_seed(encoded: &str) -> Result<Self, IdentityError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| IdentityError::InvalidEncoding(e.to_string()))?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::InvalidLength(bytes.len()))?;
        Ok(Self::from_seed(seed))
    }

    pub fn to_base64_seed(&self) -> String {
        STANDARD.encode(self.signing.to_bytes())
    }

    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity(self.signing.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("identity", &self.identity())
            .finish_non_exhaustive()
    }
}
