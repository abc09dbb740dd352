//! RPC manifest: the closed set of room methods and who may call them

use crate::frame::CallKind;
use crate::messages::ManifestEntry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Method name outside the manifest
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown method: {0}")]
pub struct UnknownMethod(pub String);

/// Every method a room answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Manifest,
    Whoami,
    TunnelAnnounce,
    TunnelLeave,
    TunnelEndpoints,
    TunnelIsRoom,
    TunnelConnect,
    TunnelPing,
    RegisterAlias,
    RevokeAlias,
    ListAliases,
    SendSolution,
}

impl Method {
    pub const ALL: [Method; 12] = [
        Method::Manifest,
        Method::Whoami,
        Method::TunnelAnnounce,
        Method::TunnelLeave,
        Method::TunnelEndpoints,
        Method::TunnelIsRoom,
        Method::TunnelConnect,
        Method::TunnelPing,
        Method::RegisterAlias,
        Method::RevokeAlias,
        Method::ListAliases,
        Method::SendSolution,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Manifest => "manifest",
            Method::Whoami => "whoami",
            Method::TunnelAnnounce => "tunnel.announce",
            Method::TunnelLeave => "tunnel.leave",
            Method::TunnelEndpoints => "tunnel.endpoints",
            Method::TunnelIsRoom => "tunnel.isRoom",
            Method::TunnelConnect => "tunnel.connect",
            Method::TunnelPing => "tunnel.ping",
            Method::RegisterAlias => "room.registerAlias",
            Method::RevokeAlias => "room.revokeAlias",
            Method::ListAliases => "room.listAliases",
            Method::SendSolution => "httpAuth.sendSolution",
        }
    }

    pub fn call_kind(&self) -> CallKind {
        match self {
            Method::TunnelEndpoints => CallKind::Source,
            Method::TunnelConnect => CallKind::Duplex,
            _ => CallKind::Async,
        }
    }

    fn is_alias_method(&self) -> bool {
        matches!(
            self,
            Method::RegisterAlias | Method::RevokeAlias | Method::ListAliases
        )
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .iter()
            .find(|m| m.as_str() == s)
            .copied()
            .ok_or_else(|| UnknownMethod(s.to_string()))
    }
}

/// How much the room trusts a caller. Ordered from least to most trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TrustTier {
    Anonymous,
    Authenticated,
    Privileged,
}

/// Who may use the room
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyMode {
    /// Anyone may connect and tunnel
    #[default]
    Open,
    /// Anyone may connect, only members may tunnel
    Community,
    /// Only members may connect
    Restricted,
}

impl fmt::Display for PrivacyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PrivacyMode::Open => "open",
            PrivacyMode::Community => "community",
            PrivacyMode::Restricted => "restricted",
        })
    }
}

impl FromStr for PrivacyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(PrivacyMode::Open),
            "community" => Ok(PrivacyMode::Community),
            "restricted" => Ok(PrivacyMode::Restricted),
            other => Err(format!("unknown privacy mode: {}", other)),
        }
    }
}

/// Permission table of a room, built once from its privacy mode
#[derive(Debug, Clone)]
pub struct Manifest {
    mode: PrivacyMode,
    required: HashMap<Method, TrustTier>,
}

impl Manifest {
    pub fn for_mode(mode: PrivacyMode) -> Self {
        let required = Method::ALL
            .iter()
            .map(|method| (*method, Self::tier_for(mode, *method)))
            .collect();
        Self { mode, required }
    }

    fn tier_for(mode: PrivacyMode, method: Method) -> TrustTier {
        match (mode, method) {
            // Aliases are not offered by restricted rooms
            (PrivacyMode::Restricted, m) if m.is_alias_method() => TrustTier::Privileged,
            (_, m) if m.is_alias_method() => TrustTier::Authenticated,
            (_, Method::SendSolution) => TrustTier::Authenticated,
            (PrivacyMode::Open, _) => TrustTier::Anonymous,
            (_, Method::TunnelEndpoints | Method::TunnelConnect) => TrustTier::Authenticated,
            _ => TrustTier::Anonymous,
        }
    }

    pub fn mode(&self) -> PrivacyMode {
        self.mode
    }

    pub fn required_tier(&self, method: Method) -> TrustTier {
        self.required
            .get(&method)
            .copied()
            .unwrap_or(TrustTier::Privileged)
    }

    pub fn is_permitted(&self, tier: TrustTier, method: Method) -> bool {
        tier >= self.required_tier(method)
    }

    /// Listing of the methods, in manifest order
    pub fn describe(&self) -> Vec<ManifestEntry> {
        Method::ALL
            .iter()
            .map(|method| ManifestEntry {
                method: method.as_str().to_string(),
                kind: method.call_kind(),
                tier: self.required_tier(*method),
            })
            .collect()
    }
}
