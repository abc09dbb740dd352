//! Argument and reply payloads of the room methods

use crate::frame::CallKind;
use crate::identity::PeerIdentity;
use crate::manifest::TrustTier;
use serde::{Deserialize, Serialize};

/// Arguments of `tunnel.connect` sent by the dialing peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectArgs {
    /// The room the caller believes it is talking to
    pub portal: PeerIdentity,
    /// Alias name or textual identity of the peer to reach
    pub target: String,
}

/// Arguments of `tunnel.connect` as forwarded by the room to the target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectWithOrigin {
    pub portal: PeerIdentity,
    pub target: PeerIdentity,
    pub origin: PeerIdentity,
}

/// Visibility of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointScope {
    Public,
    Private,
}

/// A peer that announced itself as reachable through the room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub peer: PeerIdentity,
    pub connection_id: u64,
    pub scope: EndpointScope,
    /// Remote socket address when known
    pub address_hint: Option<String>,
}

/// Item of the `tunnel.endpoints` feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointEvent {
    /// Full current set, sent first and after a resync
    Snapshot(Vec<EndpointRecord>),
    Added(EndpointRecord),
    Removed(PeerIdentity),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAliasArgs {
    pub alias: String,
    /// ed25519 signature over the alias registration message
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAliasReply {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeAliasArgs {
    pub alias: String,
}

/// Reply of `tunnel.isRoom`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    /// Whether the caller is a member of the room
    pub membership: bool,
    pub features: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhoamiReply {
    pub id: PeerIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub method: String,
    pub kind: CallKind,
    pub tier: TrustTier,
}

/// Arguments of `httpAuth.sendSolution`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendSolutionArgs {
    /// Server challenge
    pub sc: String,
    /// Client challenge
    pub cc: String,
    pub signature: Vec<u8>,
}
