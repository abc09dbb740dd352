//! Alias bookkeeping
//!
//! An alias is a short name a peer registers on the room. The room hands back
//! an opaque token that web visitors use to find the owner; the token carries
//! no information about the owner or the connection.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use room_proto::PeerIdentity;
use std::collections::HashMap;

/// Size of an alias token in bytes before encoding
pub const TOKEN_BYTES: usize = 32;

/// A bound alias
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasRecord {
    pub name: String,
    pub owner: PeerIdentity,
    pub token: String,
    /// Owner's signature over the registration message
    pub signature: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Fresh random token, base64url without padding
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Name and token indexes over the bound aliases. A name has at most one owner.
#[derive(Debug, Default)]
pub struct AliasTable {
    by_name: HashMap<String, AliasRecord>,
    by_token: HashMap<String, String>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&AliasRecord> {
        self.by_name.get(name)
    }

    pub fn by_token(&self, token: &str) -> Option<&AliasRecord> {
        self.by_token.get(token).and_then(|name| self.by_name.get(name))
    }

    /// Bind `name` to `owner` with a new token, replacing any previous binding
    pub fn bind(&mut self, name: &str, owner: PeerIdentity, signature: Vec<u8>) -> &AliasRecord {
        self.unbind(name);

        let record = AliasRecord {
            name: name.to_string(),
            owner,
            token: generate_token(),
            signature,
            created_at: Utc::now(),
        };
        self.by_token.insert(record.token.clone(), record.name.clone());
        self.by_name.entry(name.to_string()).or_insert(record)
    }

    pub fn unbind(&mut self, name: &str) -> Option<AliasRecord> {
        let record = self.by_name.remove(name)?;
        self.by_token.remove(&record.token);
        Some(record)
    }

    /// Sorted names owned by `owner`
    pub fn owned_by(&self, owner: &PeerIdentity) -> Vec<String> {
        let mut names: Vec<String> = self
            .by_name
            .values()
            .filter(|record| record.owner == *owner)
            .map(|record| record.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Drop every alias of `owner`, returning the released names
    pub fn remove_owner(&mut self, owner: &PeerIdentity) -> Vec<String> {
        let names = self.owned_by(owner);
        for name in &names {
            self.unbind(name);
        }
        names
    }
}
