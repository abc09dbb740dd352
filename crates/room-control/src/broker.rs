//! Tunnel broker
//!
//! Keeps the room's shared state: announced endpoints, aliases and tunnel
//! counters. All of it lives in one [`RoomState`] behind a single lock; every
//! mutation and every feed publication happens under the write lock, so feed
//! order always matches state order.
//!
//! Connections themselves belong to the [`PeerHub`]; the broker only looks
//! them up.

use crate::aliases::{AliasRecord, AliasTable};
use crate::config::RoomConfig;
use crate::hub::{Connection, ConnectionInfo, PeerHub};
use crate::session::TunnelState;
use futures::StreamExt;
use room_proto::confirm::{alias_registration_message, is_valid_alias};
use room_proto::{
    encode_payload, ConnectArgs, ConnectWithOrigin, EndpointEvent, EndpointRecord, EndpointScope,
    Method, PeerIdentity, PrivacyMode, RegisterAliasArgs, RoomError,
};
use room_rpc::{DuplexSink, ResponseSink, RpcError, RpcStream};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the endpoint broadcast buffer
const ENDPOINT_BUFFER: usize = 256;

/// Limits and policies of a broker
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub max_announced_peers: usize,
    pub max_tunnels_per_peer: usize,
    pub release_aliases_on_disconnect: bool,
    /// Scope given to announced endpoints
    pub scope: EndpointScope,
    /// Alias URLs are `{alias_base}/alias/{token}`
    pub alias_base: String,
}

impl BrokerConfig {
    pub fn from_room_config(config: &RoomConfig) -> Self {
        Self {
            max_announced_peers: config.max_announced_peers,
            max_tunnels_per_peer: config.max_tunnels_per_peer,
            release_aliases_on_disconnect: config.release_aliases_on_disconnect,
            scope: match config.privacy_mode {
                PrivacyMode::Open => EndpointScope::Public,
                _ => EndpointScope::Private,
            },
            alias_base: config.alias_base().to_string(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::from_room_config(&RoomConfig::default())
    }
}

#[derive(Debug, Default)]
struct RoomState {
    /// In announcement order
    endpoints: Vec<EndpointRecord>,
    aliases: AliasTable,
    /// Tunnels each peer currently takes part in
    tunnels: HashMap<PeerIdentity, usize>,
}

pub struct TunnelBroker {
    room_id: PeerIdentity,
    hub: Arc<PeerHub>,
    state: RwLock<RoomState>,
    feed: broadcast::Sender<EndpointEvent>,
    config: BrokerConfig,
}

impl TunnelBroker {
    pub fn new(room_id: PeerIdentity, hub: Arc<PeerHub>, config: BrokerConfig) -> Self {
        let (feed, _) = broadcast::channel(ENDPOINT_BUFFER);
        Self {
            room_id,
            hub,
            state: RwLock::new(RoomState::default()),
            feed,
            config,
        }
    }

    pub fn room_id(&self) -> PeerIdentity {
        self.room_id
    }

    pub fn hub(&self) -> &Arc<PeerHub> {
        &self.hub
    }

    /// Currently announced endpoints, in announcement order
    pub fn announced(&self) -> Vec<EndpointRecord> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.endpoints.clone()
    }

    /// Announce the connection as reachable through the room
    pub fn announce(&self, info: &ConnectionInfo) -> Result<EndpointRecord, RoomError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        match info.session.tunnel_state() {
            Some(TunnelState::Unannounced) => {}
            Some(TunnelState::Announced) => {
                return state
                    .endpoints
                    .iter()
                    .find(|record| record.connection_id == info.id)
                    .cloned()
                    .ok_or_else(|| RoomError::Internal("announced endpoint missing".to_string()));
            }
            Some(TunnelState::Left) => {
                return Err(RoomError::InvalidState(
                    "cannot announce again after leaving".to_string(),
                ))
            }
            None => {
                return Err(RoomError::InvalidState(format!(
                    "session is {}",
                    info.session.state()
                )))
            }
        }

        // A replaced connection of the same peer may still be listed
        if let Some(pos) = state.endpoints.iter().position(|r| r.peer == info.peer) {
            state.endpoints.remove(pos);
            let _ = self.feed.send(EndpointEvent::Removed(info.peer));
        }

        if state.endpoints.len() >= self.config.max_announced_peers {
            warn!(peer = %info.peer, "Announce refused, room is full");
            return Err(RoomError::CapacityExceeded(format!(
                "room holds at most {} announced peers",
                self.config.max_announced_peers
            )));
        }

        info.session.set_tunnel(TunnelState::Announced)?;
        let record = EndpointRecord {
            peer: info.peer,
            connection_id: info.id,
            scope: self.config.scope,
            address_hint: info.remote_addr.map(|addr| addr.to_string()),
        };
        state.endpoints.push(record.clone());
        let _ = self.feed.send(EndpointEvent::Added(record.clone()));

        info!(peer = %info.peer, connection_id = info.id, announced = state.endpoints.len(), "Peer announced");
        Ok(record)
    }

    /// Withdraw an announcement
    pub fn leave(&self, info: &ConnectionInfo) -> Result<(), RoomError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        if info.session.tunnel_state() != Some(TunnelState::Announced) {
            return Err(RoomError::InvalidState(format!(
                "cannot leave, session is {}",
                info.session.state()
            )));
        }
        info.session.set_tunnel(TunnelState::Left)?;

        if let Some(pos) = state
            .endpoints
            .iter()
            .position(|record| record.connection_id == info.id)
        {
            state.endpoints.remove(pos);
            let _ = self.feed.send(EndpointEvent::Removed(info.peer));
        }

        info!(peer = %info.peer, connection_id = info.id, "Peer left");
        Ok(())
    }

    /// Live feed of endpoints seen by `subscriber`
    pub fn endpoints(self: &Arc<Self>, subscriber: PeerIdentity) -> EndpointFeed {
        let (snapshot, rx) = self.snapshot_and_subscribe(&subscriber);
        EndpointFeed {
            subscriber,
            pending: Some(EndpointEvent::Snapshot(snapshot)),
            rx,
            broker: self.clone(),
        }
    }

    fn snapshot_and_subscribe(
        &self,
        subscriber: &PeerIdentity,
    ) -> (Vec<EndpointRecord>, broadcast::Receiver<EndpointEvent>) {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let snapshot = state
            .endpoints
            .iter()
            .filter(|record| record.peer != *subscriber)
            .cloned()
            .collect();
        (snapshot, self.feed.subscribe())
    }

    /// Open a tunnel from `caller` to the peer named in `args`
    ///
    /// On success the target has accepted a `tunnel.connect` call carrying
    /// the caller's identity; splice it to the caller with [`splice`].
    pub async fn open_tunnel(
        self: &Arc<Self>,
        caller: &ConnectionInfo,
        args: &ConnectArgs,
    ) -> Result<Tunnel, RoomError> {
        if args.portal != self.room_id {
            return Err(RoomError::BadRequest(format!(
                "portal {} is not this room",
                args.portal
            )));
        }

        let target = self.resolve_target(&args.target)?;
        if target == caller.peer {
            return Err(RoomError::BadRequest(
                "cannot open a tunnel to yourself".to_string(),
            ));
        }
        let conn = self
            .hub
            .lookup(&target)
            .ok_or_else(|| RoomError::PeerUnreachable(format!("{} is not connected", target)))?;

        let guard = self.reserve_tunnel(caller.peer, target)?;

        let forward = ConnectWithOrigin {
            portal: self.room_id,
            target,
            origin: caller.peer,
        };
        let payload = encode_payload(&forward).map_err(|e| RoomError::Internal(e.to_string()))?;
        let (sink, stream) = conn
            .channel()
            .duplex(Method::TunnelConnect.as_str(), payload)
            .await
            .map_err(|e| RoomError::PeerUnreachable(format!("{}: {}", target, e)))?;

        info!(origin = %caller.peer, target = %target, "Opened tunnel");
        Ok(Tunnel {
            target,
            sink,
            stream,
            guard,
        })
    }

    fn resolve_target(&self, target: &str) -> Result<PeerIdentity, RoomError> {
        if target.starts_with('@') {
            return target
                .parse()
                .map_err(|e| RoomError::BadRequest(format!("bad target {}: {}", target, e)));
        }
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .aliases
            .get(target)
            .map(|record| record.owner)
            .ok_or_else(|| RoomError::PeerUnreachable(format!("no alias named {}", target)))
    }

    fn reserve_tunnel(
        self: &Arc<Self>,
        origin: PeerIdentity,
        target: PeerIdentity,
    ) -> Result<TunnelGuard, RoomError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let max = self.config.max_tunnels_per_peer;
        for peer in [origin, target] {
            if state.tunnels.get(&peer).copied().unwrap_or(0) >= max {
                return Err(RoomError::CapacityExceeded(format!(
                    "{} already takes part in {} tunnels",
                    peer, max
                )));
            }
        }
        for peer in [origin, target] {
            *state.tunnels.entry(peer).or_insert(0) += 1;
        }
        Ok(TunnelGuard {
            broker: self.clone(),
            peers: [origin, target],
        })
    }

    /// Tunnels `peer` currently takes part in
    pub fn tunnel_count(&self, peer: &PeerIdentity) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.tunnels.get(peer).copied().unwrap_or(0)
    }

    fn release_tunnel(&self, peers: &[PeerIdentity; 2]) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        for peer in peers {
            if let Some(count) = state.tunnels.get_mut(peer) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.tunnels.remove(peer);
                }
            }
        }
    }

    /// Bind an alias to `peer` and return its URL
    pub fn register_alias(
        &self,
        peer: PeerIdentity,
        args: &RegisterAliasArgs,
    ) -> Result<String, RoomError> {
        if !is_valid_alias(&args.alias) {
            return Err(RoomError::BadRequest(format!(
                "invalid alias '{}'",
                args.alias
            )));
        }
        let message = alias_registration_message(&self.room_id, &peer, &args.alias);
        if !peer.verify(&message, &args.signature) {
            return Err(RoomError::BadRequest(
                "alias registration signature does not verify".to_string(),
            ));
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = state.aliases.get(&args.alias) {
            if existing.owner == peer {
                return Ok(self.alias_url(&existing.token));
            }
            if self.hub.lookup(&existing.owner).is_some() {
                return Err(RoomError::AliasTaken(args.alias.clone()));
            }
            info!(alias = %args.alias, previous = %existing.owner, owner = %peer, "Taking over alias of offline peer");
        }

        let record = state.aliases.bind(&args.alias, peer, args.signature.clone());
        info!(alias = %record.name, owner = %peer, "Registered alias");
        Ok(self.alias_url(&record.token))
    }

    pub fn revoke_alias(&self, peer: &PeerIdentity, alias: &str) -> Result<(), RoomError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match state.aliases.get(alias) {
            Some(record) if record.owner == *peer => {}
            _ => return Err(RoomError::NotOwner(alias.to_string())),
        }
        state.aliases.unbind(alias);
        info!(alias = %alias, owner = %peer, "Revoked alias");
        Ok(())
    }

    pub fn list_aliases(&self, peer: &PeerIdentity) -> Vec<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.aliases.owned_by(peer)
    }

    /// Alias behind `name` and its owner's live connection
    pub fn resolve_alias(&self, name: &str) -> Result<(AliasRecord, Arc<Connection>), RoomError> {
        let record = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            state.aliases.get(name).cloned()
        };
        self.with_live_owner(record, name)
    }

    /// Alias behind an issued token and its owner's live connection
    pub fn resolve_alias_token(
        &self,
        token: &str,
    ) -> Result<(AliasRecord, Arc<Connection>), RoomError> {
        let record = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            state.aliases.by_token(token).cloned()
        };
        self.with_live_owner(record, "alias token")
    }

    fn with_live_owner(
        &self,
        record: Option<AliasRecord>,
        what: &str,
    ) -> Result<(AliasRecord, Arc<Connection>), RoomError> {
        let record = record.ok_or_else(|| RoomError::PeerUnreachable(format!("unknown {}", what)))?;
        let conn = self.hub.lookup(&record.owner).ok_or_else(|| {
            RoomError::PeerUnreachable(format!("owner of {} is offline", record.name))
        })?;
        Ok((record, conn))
    }

    fn alias_url(&self, token: &str) -> String {
        format!("{}/alias/{}", self.config.alias_base, token)
    }

    /// Forget what a closed connection left behind
    pub fn peer_disconnected(&self, peer: &PeerIdentity, connection_id: u64) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(pos) = state
            .endpoints
            .iter()
            .position(|r| r.peer == *peer && r.connection_id == connection_id)
        {
            state.endpoints.remove(pos);
            let _ = self.feed.send(EndpointEvent::Removed(*peer));
            debug!(peer = %peer, connection_id, "Dropped endpoint of closed connection");
        }

        if self.config.release_aliases_on_disconnect && self.hub.lookup(peer).is_none() {
            let released = state.aliases.remove_owner(peer);
            if !released.is_empty() {
                info!(peer = %peer, aliases = ?released, "Released aliases of disconnected peer");
            }
        }
    }
}

impl std::fmt::Debug for TunnelBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelBroker")
            .field("room_id", &self.room_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Catch-up-then-live feed of endpoint events for one subscriber
pub struct EndpointFeed {
    subscriber: PeerIdentity,
    pending: Option<EndpointEvent>,
    rx: broadcast::Receiver<EndpointEvent>,
    broker: Arc<TunnelBroker>,
}

impl EndpointFeed {
    /// Next event. Events about the subscriber itself are skipped. A
    /// subscriber that fell behind gets a fresh snapshot.
    pub async fn next(&mut self) -> Option<EndpointEvent> {
        loop {
            if let Some(event) = self.pending.take() {
                return Some(event);
            }
            match self.rx.recv().await {
                Ok(EndpointEvent::Added(record)) if record.peer == self.subscriber => continue,
                Ok(EndpointEvent::Removed(peer)) if peer == self.subscriber => continue,
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(subscriber = %self.subscriber, skipped, "Endpoint subscriber fell behind, resyncing");
                    let (snapshot, rx) = self.broker.snapshot_and_subscribe(&self.subscriber);
                    self.rx = rx;
                    return Some(EndpointEvent::Snapshot(snapshot));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl std::fmt::Debug for EndpointFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointFeed")
            .field("subscriber", &self.subscriber)
            .finish_non_exhaustive()
    }
}

/// Releases a tunnel's slot on both peers when dropped
pub struct TunnelGuard {
    broker: Arc<TunnelBroker>,
    peers: [PeerIdentity; 2],
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        self.broker.release_tunnel(&self.peers);
    }
}

/// The target's side of an opened tunnel
pub struct Tunnel {
    pub target: PeerIdentity,
    pub sink: DuplexSink,
    pub stream: RpcStream,
    guard: TunnelGuard,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("target", &self.target)
            .field("request_id", &self.sink.request_id())
            .finish()
    }
}

/// Pump frames between the caller's call and the target's call until both
/// directions finished or `cancel` fires
///
/// Each direction runs in its own task. An end or error from one side is
/// passed on to the other. If the target's connection goes away the caller
/// gets a `PeerUnreachable` error.
pub async fn splice(
    tunnel: Tunnel,
    mut from_caller: RpcStream,
    to_caller: ResponseSink,
    cancel: CancellationToken,
) {
    let Tunnel {
        target,
        sink: to_target,
        stream: mut from_target,
        guard,
    } = tunnel;
    let stop = cancel.child_token();

    let forward = {
        let stop = stop.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    item = from_caller.next() => match item {
                        Some(Ok(bytes)) => {
                            if to_target.send(bytes).await.is_err() {
                                stop.cancel();
                                break;
                            }
                        }
                        None => {
                            let _ = to_target.end().await;
                            break;
                        }
                        Some(Err(RpcError::Remote(err))) => {
                            let _ = to_target.error(err).await;
                            break;
                        }
                        Some(Err(_)) => {
                            stop.cancel();
                            break;
                        }
                    }
                }
            }
        })
    };

    let backward = {
        let stop = stop.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    item = from_target.next() => match item {
                        Some(Ok(bytes)) => {
                            if to_caller.send(bytes).await.is_err() {
                                stop.cancel();
                                break;
                            }
                        }
                        None => {
                            let _ = to_caller.end().await;
                            break;
                        }
                        Some(Err(RpcError::Remote(err))) => {
                            let _ = to_caller.error(err).await;
                            break;
                        }
                        Some(Err(e)) => {
                            let _ = to_caller
                                .error(RoomError::PeerUnreachable(format!("{}: {}", target, e)))
                                .await;
                            stop.cancel();
                            break;
                        }
                    }
                }
            }
            // Dropping an unfinished stream aborts the target's call
            drop(from_target);
        })
    };

    let _ = tokio::join!(forward, backward);
    drop(guard);
    debug!(target = %target, "Tunnel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DuplicatePolicy;
    use room_proto::KeyPair;
    use room_rpc::{ChannelDriver, RpcHandler, UnhandledCalls};
    use room_transport::memory::pipe;
    use room_transport::SecureChannel;
    use std::time::Duration;

    fn keys(seed: u8) -> KeyPair {
        KeyPair::from_seed([seed; 32])
    }

    fn unhandled(_: ConnectionInfo) -> Arc<dyn RpcHandler> {
        Arc::new(UnhandledCalls)
    }

    struct Fixture {
        broker: Arc<TunnelBroker>,
        hub: Arc<PeerHub>,
        // Keep the far ends and drivers alive
        _parked: Vec<(room_transport::BoxedIo, ChannelDriver)>,
    }

    impl Fixture {
        fn new(config: BrokerConfig) -> Self {
            let hub = Arc::new(PeerHub::new(DuplicatePolicy::Reject));
            let broker = Arc::new(TunnelBroker::new(keys(0).identity(), hub.clone(), config));
            Self {
                broker,
                hub,
                _parked: Vec::new(),
            }
        }

        fn connect(&mut self, seed: u8) -> Arc<Connection> {
            let (io, far) = pipe();
            let (conn, driver) = self
                .hub
                .accept(SecureChannel::new(keys(seed).identity(), io), unhandled)
                .unwrap();
            self._parked.push((far, driver));
            conn
        }
    }

    fn alias_args(owner: &KeyPair, alias: &str) -> RegisterAliasArgs {
        let message = alias_registration_message(&keys(0).identity(), &owner.identity(), alias);
        RegisterAliasArgs {
            alias: alias.to_string(),
            signature: owner.sign(&message).to_vec(),
        }
    }

    #[tokio::test]
    async fn test_repeated_announce_emits_one_added() {
        let mut fx = Fixture::new(BrokerConfig::default());
        let watcher = fx.connect(9);
        let mut feed = fx.broker.endpoints(watcher.peer());
        assert_eq!(feed.next().await, Some(EndpointEvent::Snapshot(vec![])));

        let a = fx.connect(1);
        let first = fx.broker.announce(a.info()).unwrap();
        let second = fx.broker.announce(a.info()).unwrap();
        assert_eq!(first, second);
        assert_eq!(fx.broker.announced().len(), 1);

        assert_eq!(feed.next().await, Some(EndpointEvent::Added(first)));
        assert!(
            tokio::time::timeout(Duration::from_millis(50), feed.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_leave_twice_is_invalid() {
        let mut fx = Fixture::new(BrokerConfig::default());
        let a = fx.connect(1);

        assert!(matches!(
            fx.broker.leave(a.info()),
            Err(RoomError::InvalidState(_))
        ));

        fx.broker.announce(a.info()).unwrap();
        fx.broker.leave(a.info()).unwrap();
        assert!(fx.broker.announced().is_empty());

        assert!(matches!(
            fx.broker.leave(a.info()),
            Err(RoomError::InvalidState(_))
        ));
        assert!(matches!(
            fx.broker.announce(a.info()),
            Err(RoomError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_feed_excludes_subscriber_and_keeps_order() {
        let mut fx = Fixture::new(BrokerConfig::default());
        let a = fx.connect(1);
        let b = fx.connect(2);
        let c = fx.connect(3);
        fx.broker.announce(b.info()).unwrap();
        fx.broker.announce(a.info()).unwrap();
        fx.broker.announce(c.info()).unwrap();

        let mut feed = fx.broker.endpoints(a.peer());
        match feed.next().await {
            Some(EndpointEvent::Snapshot(records)) => {
                let peers: Vec<_> = records.iter().map(|r| r.peer).collect();
                assert_eq!(peers, vec![b.peer(), c.peer()]);
            }
            other => panic!("expected snapshot, got {:?}", other),
        }

        fx.broker.leave(a.info()).unwrap();
        fx.broker.leave(c.info()).unwrap();
        assert_eq!(feed.next().await, Some(EndpointEvent::Removed(c.peer())));
    }

    #[tokio::test]
    async fn test_concurrent_announces_both_listed() {
        let mut fx = Fixture::new(BrokerConfig::default());
        let a = fx.connect(1);
        let b = fx.connect(2);

        let (ra, rb) = tokio::join!(
            {
                let broker = fx.broker.clone();
                let info = a.info().clone();
                tokio::spawn(async move { broker.announce(&info) })
            },
            {
                let broker = fx.broker.clone();
                let info = b.info().clone();
                tokio::spawn(async move { broker.announce(&info) })
            }
        );
        ra.unwrap().unwrap();
        rb.unwrap().unwrap();

        let peers: Vec<_> = fx.broker.announced().iter().map(|r| r.peer).collect();
        assert!(peers.contains(&a.peer()));
        assert!(peers.contains(&b.peer()));
    }

    #[tokio::test]
    async fn test_announce_capacity() {
        let mut fx = Fixture::new(BrokerConfig {
            max_announced_peers: 1,
            ..BrokerConfig::default()
        });
        let a = fx.connect(1);
        let b = fx.connect(2);
        fx.broker.announce(a.info()).unwrap();
        assert!(matches!(
            fx.broker.announce(b.info()),
            Err(RoomError::CapacityExceeded(_))
        ));
        assert_eq!(b.session().tunnel_state(), Some(TunnelState::Unannounced));
    }

    #[tokio::test]
    async fn test_lagging_endpoint_feed_resyncs() {
        let mut fx = Fixture::new(BrokerConfig::default());
        let a = fx.connect(1);
        let b = fx.connect(2);
        let mut feed = fx.broker.endpoints(a.peer());
        assert_eq!(feed.next().await, Some(EndpointEvent::Snapshot(vec![])));

        let record = fx.broker.announce(b.info()).unwrap();
        for _ in 0..ENDPOINT_BUFFER {
            let _ = fx.broker.feed.send(EndpointEvent::Removed(keys(7).identity()));
        }

        assert_eq!(
            feed.next().await,
            Some(EndpointEvent::Snapshot(vec![record]))
        );
    }

    #[tokio::test]
    async fn test_alias_lifecycle() {
        let mut fx = Fixture::new(BrokerConfig::default());
        let alice = keys(1);
        let bob = keys(2);
        fx.connect(1);
        fx.connect(2);

        let url = fx.broker.register_alias(alice.identity(), &alias_args(&alice, "alice")).unwrap();
        assert!(url.starts_with("http://localhost:3000/alias/"));

        // Same owner gets the same URL back
        let again = fx.broker.register_alias(alice.identity(), &alias_args(&alice, "alice")).unwrap();
        assert_eq!(url, again);

        assert!(matches!(
            fx.broker.register_alias(bob.identity(), &alias_args(&bob, "alice")),
            Err(RoomError::AliasTaken(_))
        ));
        assert!(matches!(
            fx.broker.revoke_alias(&bob.identity(), "alice"),
            Err(RoomError::NotOwner(_))
        ));
        assert!(matches!(
            fx.broker.revoke_alias(&bob.identity(), "nobody"),
            Err(RoomError::NotOwner(_))
        ));

        assert_eq!(fx.broker.list_aliases(&alice.identity()), vec!["alice"]);
        fx.broker.revoke_alias(&alice.identity(), "alice").unwrap();
        assert!(fx.broker.list_aliases(&alice.identity()).is_empty());

        let fresh = fx.broker.register_alias(alice.identity(), &alias_args(&alice, "alice")).unwrap();
        assert_ne!(fresh, url);
    }

    #[tokio::test]
    async fn test_alias_requires_valid_name_and_signature() {
        let fx = Fixture::new(BrokerConfig::default());
        let alice = keys(1);

        assert!(matches!(
            fx.broker.register_alias(alice.identity(), &alias_args(&alice, "Alice")),
            Err(RoomError::BadRequest(_))
        ));

        let forged = alias_args(&keys(2), "alice");
        assert!(matches!(
            fx.broker.register_alias(alice.identity(), &forged),
            Err(RoomError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_alias_token_needs_live_owner() {
        let mut fx = Fixture::new(BrokerConfig::default());
        let alice = keys(1);
        let conn = fx.connect(1);

        let url = fx.broker.register_alias(alice.identity(), &alias_args(&alice, "alice")).unwrap();
        let token = url.rsplit('/').next().unwrap();

        let (record, live) = fx.broker.resolve_alias_token(token).unwrap();
        assert_eq!(record.name, "alice");
        assert_eq!(live.id(), conn.id());

        fx.hub.close(&alice.identity());
        fx.broker.peer_disconnected(&alice.identity(), conn.id());

        assert!(matches!(
            fx.broker.resolve_alias_token(token),
            Err(RoomError::PeerUnreachable(_))
        ));
        assert!(matches!(
            fx.broker.resolve_alias("alice"),
            Err(RoomError::PeerUnreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_offline_owner_alias_can_be_taken_over() {
        let mut fx = Fixture::new(BrokerConfig::default());
        let alice = keys(1);
        let bob = keys(2);
        fx.connect(2);

        // Alice registered and went away
        fx.broker.register_alias(alice.identity(), &alias_args(&alice, "shared")).unwrap();
        fx.broker.register_alias(bob.identity(), &alias_args(&bob, "shared")).unwrap();
        assert_eq!(fx.broker.list_aliases(&bob.identity()), vec!["shared"]);
    }

    #[tokio::test]
    async fn test_release_aliases_on_disconnect() {
        let mut fx = Fixture::new(BrokerConfig {
            release_aliases_on_disconnect: true,
            ..BrokerConfig::default()
        });
        let alice = keys(1);
        let conn = fx.connect(1);
        fx.broker.register_alias(alice.identity(), &alias_args(&alice, "alice")).unwrap();

        fx.hub.close(&alice.identity());
        fx.broker.peer_disconnected(&alice.identity(), conn.id());
        assert!(fx.broker.list_aliases(&alice.identity()).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_drops_endpoint() {
        let mut fx = Fixture::new(BrokerConfig::default());
        let a = fx.connect(1);
        fx.broker.announce(a.info()).unwrap();

        // Stale connection id leaves the record alone
        fx.broker.peer_disconnected(&a.peer(), a.id() + 1);
        assert_eq!(fx.broker.announced().len(), 1);

        fx.broker.peer_disconnected(&a.peer(), a.id());
        assert!(fx.broker.announced().is_empty());
    }

    #[tokio::test]
    async fn test_open_tunnel_checks() {
        let mut fx = Fixture::new(BrokerConfig::default());
        let a = fx.connect(1);
        let room = keys(0).identity();

        let bad_portal = ConnectArgs {
            portal: keys(5).identity(),
            target: keys(2).identity().to_string(),
        };
        assert!(matches!(
            fx.broker.open_tunnel(a.info(), &bad_portal).await,
            Err(RoomError::BadRequest(_))
        ));

        let to_self = ConnectArgs {
            portal: room,
            target: a.peer().to_string(),
        };
        assert!(matches!(
            fx.broker.open_tunnel(a.info(), &to_self).await,
            Err(RoomError::BadRequest(_))
        ));

        let offline = ConnectArgs {
            portal: room,
            target: keys(2).identity().to_string(),
        };
        assert!(matches!(
            fx.broker.open_tunnel(a.info(), &offline).await,
            Err(RoomError::PeerUnreachable(_))
        ));

        let unknown_alias = ConnectArgs {
            portal: room,
            target: "ghost".to_string(),
        };
        assert!(matches!(
            fx.broker.open_tunnel(a.info(), &unknown_alias).await,
            Err(RoomError::PeerUnreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_tunnel_cap_and_release() {
        let mut fx = Fixture::new(BrokerConfig {
            max_tunnels_per_peer: 1,
            ..BrokerConfig::default()
        });
        let a = fx.connect(1);
        let b = fx.connect(2);
        let c = fx.connect(3);
        let room = keys(0).identity();

        let first = fx
            .broker
            .open_tunnel(
                a.info(),
                &ConnectArgs {
                    portal: room,
                    target: b.peer().to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(first.target, b.peer());
        assert_eq!(fx.broker.tunnel_count(&a.peer()), 1);

        let err = fx
            .broker
            .open_tunnel(
                a.info(),
                &ConnectArgs {
                    portal: room,
                    target: c.peer().to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::CapacityExceeded(_)));
        assert_eq!(fx.broker.tunnel_count(&c.peer()), 0);

        drop(first);
        assert_eq!(fx.broker.tunnel_count(&a.peer()), 0);
        assert_eq!(fx.broker.tunnel_count(&b.peer()), 0);
        // Released slots leave no entries behind
        assert!(fx.broker.state.read().unwrap().tunnels.is_empty());

        fx.broker
            .open_tunnel(
                a.info(),
                &ConnectArgs {
                    portal: room,
                    target: c.peer().to_string(),
                },
            )
            .await
            .unwrap();
    }
}
