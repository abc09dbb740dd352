//! Room configuration
//!
//! Loaded from a YAML file; every field has a default so an empty file (or no
//! file at all) yields a working open room on localhost.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use room_proto::{PeerIdentity, PrivacyMode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// What to do when a peer connects while it already has a live connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    /// Refuse the newcomer
    #[default]
    Reject,
    /// Close the existing connection and keep the newcomer
    ReplaceOldest,
}

impl fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DuplicatePolicy::Reject => "reject",
            DuplicatePolicy::ReplaceOldest => "replace-oldest",
        })
    }
}

impl FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reject" => Ok(DuplicatePolicy::Reject),
            "replace-oldest" => Ok(DuplicatePolicy::ReplaceOldest),
            other => Err(format!("unknown duplicate policy: {}", other)),
        }
    }
}

/// Room configuration file format
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    /// Human readable room name, reported by `tunnel.isRoom`
    pub name: String,

    /// Address peers connect to
    pub listen_addr: SocketAddr,

    /// Address of the HTTP endpoints
    pub http_addr: SocketAddr,

    /// Public domain of the room, used in multiserver addresses
    pub domain: String,

    /// Base of alias URLs handed to peers
    pub alias_base_url: String,

    /// File holding the room's base64 encoded secret seed
    pub key_file: PathBuf,

    /// Base64 network key; both ends of a handshake must agree on it
    pub network_key: String,

    pub privacy_mode: PrivacyMode,

    pub duplicate_policy: DuplicatePolicy,

    /// Upper bound on simultaneously announced peers
    pub max_announced_peers: usize,

    /// Upper bound on tunnels a single peer takes part in
    pub max_tunnels_per_peer: usize,

    /// Drop a peer's aliases when its connection ends
    pub release_aliases_on_disconnect: bool,

    pub members: Vec<PeerIdentity>,

    pub admins: Vec<PeerIdentity>,

    /// Keys refused at connect time
    pub denied: Vec<PeerIdentity>,
}

pub const DEFAULT_NETWORK_KEY: &str = "dHVubmVscm9vbS1kZWZhdWx0LW5ldHdvcmsta2V5ISE=";

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            name: "tunnelroom".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8008)),
            http_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            domain: "localhost".to_string(),
            alias_base_url: "http://localhost:3000".to_string(),
            key_file: PathBuf::from("room.key"),
            network_key: DEFAULT_NETWORK_KEY.to_string(),
            privacy_mode: PrivacyMode::Open,
            duplicate_policy: DuplicatePolicy::Reject,
            max_announced_peers: 1024,
            max_tunnels_per_peer: 16,
            release_aliases_on_disconnect: false,
            members: Vec::new(),
            admins: Vec::new(),
            denied: Vec::new(),
        }
    }
}

impl RoomConfig {
    /// Load config from a specific file path
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse config from YAML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: RoomConfig = if content.trim().is_empty() {
            RoomConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.network_key_bytes()?;

        if self.max_announced_peers == 0 {
            return Err(ConfigError::Invalid(
                "max_announced_peers must be at least 1".to_string(),
            ));
        }
        if self.max_tunnels_per_peer == 0 {
            return Err(ConfigError::Invalid(
                "max_tunnels_per_peer must be at least 1".to_string(),
            ));
        }
        if !self.alias_base_url.starts_with("http://") && !self.alias_base_url.starts_with("https://") {
            return Err(ConfigError::Invalid(format!(
                "alias_base_url must be an http(s) URL, got '{}'",
                self.alias_base_url
            )));
        }
        if let Some(peer) = self.denied.iter().find(|p| self.admins.contains(p)) {
            return Err(ConfigError::Invalid(format!(
                "{} is both an admin and denied",
                peer
            )));
        }
        Ok(())
    }

    pub fn network_key_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        let bytes = STANDARD
            .decode(self.network_key.trim())
            .map_err(|e| ConfigError::Invalid(format!("network_key is not base64: {}", e)))?;
        if bytes.is_empty() {
            return Err(ConfigError::Invalid("network_key is empty".to_string()));
        }
        Ok(bytes)
    }

    /// Alias base URL without a trailing slash
    pub fn alias_base(&self) -> &str {
        self.alias_base_url.trim_end_matches('/')
    }

    /// Generate a template config file content
    pub fn template() -> String {
        r#"# tunnelroom configuration

name: "tunnelroom"
listen_addr: "0.0.0.0:8008"
http_addr: "0.0.0.0:3000"
domain: "localhost"
alias_base_url: "http://localhost:3000"
key_file: "room.key"

# open | community | restricted
privacy_mode: open

# reject | replace-oldest
duplicate_policy: reject

max_announced_peers: 1024
max_tunnels_per_peer: 16
release_aliases_on_disconnect: false

# members:
#   - "@<base64 key>.ed25519"
# admins: []
# denied: []
"#
        .to_string()
    }
}
