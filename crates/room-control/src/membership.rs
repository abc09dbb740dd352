//! Who the room trusts

use room_proto::{PeerIdentity, TrustTier};
use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};
use tracing::info;

#[derive(Debug, Default)]
struct Lists {
    admins: HashSet<PeerIdentity>,
    members: HashSet<PeerIdentity>,
    denied: HashSet<PeerIdentity>,
}

/// Membership lists of a room. Changes apply to the next call a peer makes.
#[derive(Debug)]
pub struct Membership {
    room: PeerIdentity,
    lists: RwLock<Lists>,
}

impl Membership {
    pub fn new(
        room: PeerIdentity,
        admins: impl IntoIterator<Item = PeerIdentity>,
        members: impl IntoIterator<Item = PeerIdentity>,
        denied: impl IntoIterator<Item = PeerIdentity>,
    ) -> Self {
        Self {
            room,
            lists: RwLock::new(Lists {
                admins: admins.into_iter().collect(),
                members: members.into_iter().collect(),
                denied: denied.into_iter().collect(),
            }),
        }
    }

    /// Trust tier of a peer right now
    pub fn tier_of(&self, peer: &PeerIdentity) -> TrustTier {
        if *peer == self.room {
            return TrustTier::Privileged;
        }
        let lists = self.lists.read().unwrap_or_else(PoisonError::into_inner);
        if lists.admins.contains(peer) {
            TrustTier::Privileged
        } else if lists.members.contains(peer) {
            TrustTier::Authenticated
        } else {
            TrustTier::Anonymous
        }
    }

    pub fn is_member(&self, peer: &PeerIdentity) -> bool {
        self.tier_of(peer) >= TrustTier::Authenticated
    }

    pub fn is_denied(&self, peer: &PeerIdentity) -> bool {
        let lists = self.lists.read().unwrap_or_else(PoisonError::into_inner);
        lists.denied.contains(peer)
    }

    pub fn add_member(&self, peer: PeerIdentity) {
        let mut lists = self.lists.write().unwrap_or_else(PoisonError::into_inner);
        lists.denied.remove(&peer);
        if lists.members.insert(peer) {
            info!(peer = %peer, "Added member");
        }
    }

    pub fn remove_member(&self, peer: &PeerIdentity) {
        let mut lists = self.lists.write().unwrap_or_else(PoisonError::into_inner);
        if lists.members.remove(peer) {
            info!(peer = %peer, "Removed member");
        }
    }

    /// Refuse future connections from `peer`
    pub fn deny(&self, peer: PeerIdentity) {
        let mut lists = self.lists.write().unwrap_or_else(PoisonError::into_inner);
        lists.members.remove(&peer);
        lists.admins.remove(&peer);
        if lists.denied.insert(peer) {
            info!(peer = %peer, "Denied key");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use room_proto::KeyPair;

    fn id(seed: u8) -> PeerIdentity {
        KeyPair::from_seed([seed; 32]).identity()
    }

    #[test]
    fn test_tiers() {
        let membership = Membership::new(id(0), [id(1)], [id(2)], []);
        assert_eq!(membership.tier_of(&id(0)), TrustTier::Privileged);
        assert_eq!(membership.tier_of(&id(1)), TrustTier::Privileged);
        assert_eq!(membership.tier_of(&id(2)), TrustTier::Authenticated);
        assert_eq!(membership.tier_of(&id(3)), TrustTier::Anonymous);
    }

    #[test]
    fn test_membership_changes_apply_immediately() {
        let membership = Membership::new(id(0), [], [], []);
        assert!(!membership.is_member(&id(4)));

        membership.add_member(id(4));
        assert!(membership.is_member(&id(4)));

        membership.remove_member(&id(4));
        assert_eq!(membership.tier_of(&id(4)), TrustTier::Anonymous);
    }

    #[test]
    fn test_deny_revokes_membership() {
        let membership = Membership::new(id(0), [], [id(5)], []);
        membership.deny(id(5));
        assert!(membership.is_denied(&id(5)));
        assert!(!membership.is_member(&id(5)));

        membership.add_member(id(5));
        assert!(!membership.is_denied(&id(5)));
    }
}
