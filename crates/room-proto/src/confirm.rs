//! Messages peers sign to confirm alias registrations and web sign-ins

use crate::identity::PeerIdentity;

/// Text signed by a peer when it registers `alias` on `room`
pub fn alias_registration_message(room: &PeerIdentity, user: &PeerIdentity, alias: &str) -> Vec<u8> {
    format!("=room-alias-registration:{}:{}:{}", room, user, alias).into_bytes()
}

/// Text signed by a peer to answer a web sign-in challenge
pub fn sign_in_message(
    room: &PeerIdentity,
    client: &PeerIdentity,
    server_challenge: &str,
    client_challenge: &str,
) -> Vec<u8> {
    format!(
        "=http-auth-sign-in:{}:{}:{}:{}",
        room, client, server_challenge, client_challenge
    )
    .into_bytes()
}

/// Alias names: lowercase ascii letters and digits, at most 63 characters
pub fn is_valid_alias(alias: &str) -> bool {
    !alias.is_empty()
        && alias.len() <= 63
        && alias
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}
