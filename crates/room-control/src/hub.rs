//! Peer connection hub
//!
//! Owns every live connection of a node, keyed by the remote identity. At most
//! one connection per peer is registered at a time; what happens to a second
//! one is decided by the [`DuplicatePolicy`].
//!
//! Lifecycle events are published while the registry write lock is held, so a
//! listener that snapshots under the read lock and then subscribes never misses
//! or duplicates an event.

use crate::config::DuplicatePolicy;
use crate::session::Session;
use chrono::{DateTime, Utc};
use room_proto::{PeerIdentity, RoomError};
use room_rpc::{ChannelConfig, ChannelDriver, RpcChannel, RpcHandler};
use room_transport::{BoxedIo, Dialer, Handshaker, SecureChannel, TransportError};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of the lifecycle broadcast buffer
const LIFECYCLE_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Plain byte stream to the peer
    Direct,
    /// Carried inside a tunnel through a room
    Tunneled,
}

/// Identity and state of a connection, handed to its call handler
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: u64,
    pub peer: PeerIdentity,
    pub direction: Direction,
    pub remote_addr: Option<SocketAddr>,
    pub session: Session,
}

/// A live, authenticated connection
#[derive(Debug)]
pub struct Connection {
    info: ConnectionInfo,
    transport: TransportKind,
    created_at: DateTime<Utc>,
    channel: RpcChannel,
}

impl Connection {
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn id(&self) -> u64 {
        self.info.id
    }

    pub fn peer(&self) -> PeerIdentity {
        self.info.peer
    }

    pub fn direction(&self) -> Direction {
        self.info.direction
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn session(&self) -> &Session {
        &self.info.session
    }

    pub fn channel(&self) -> &RpcChannel {
        &self.channel
    }

    /// Close the underlying channel. Teardown follows once its driver stops.
    pub fn close(&self) {
        self.info.session.begin_closing();
        self.channel.close();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connected {
        peer: PeerIdentity,
        connection_id: u64,
        direction: Direction,
    },
    Disconnected {
        peer: PeerIdentity,
        connection_id: u64,
        direction: Direction,
    },
}

impl LifecycleEvent {
    fn connected(conn: &Connection) -> Self {
        LifecycleEvent::Connected {
            peer: conn.peer(),
            connection_id: conn.id(),
            direction: conn.direction(),
        }
    }

    fn disconnected(conn: &Connection) -> Self {
        LifecycleEvent::Disconnected {
            peer: conn.peer(),
            connection_id: conn.id(),
            direction: conn.direction(),
        }
    }

    pub fn peer(&self) -> PeerIdentity {
        match self {
            LifecycleEvent::Connected { peer, .. } | LifecycleEvent::Disconnected { peer, .. } => *peer,
        }
    }
}

/// Catch-up-then-live feed of lifecycle events
#[derive(Debug)]
pub struct LifecycleFeed {
    backlog: VecDeque<LifecycleEvent>,
    rx: broadcast::Receiver<LifecycleEvent>,
    ended: bool,
}

impl LifecycleFeed {
    /// Next event. `None` once the hub is gone or this listener fell behind.
    pub async fn next(&mut self) -> Option<LifecycleEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        if self.ended {
            return None;
        }
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Lifecycle listener fell behind, dropping it");
                self.ended = true;
                None
            }
            Err(broadcast::error::RecvError::Closed) => {
                self.ended = true;
                None
            }
        }
    }
}

/// Decides whether an authenticated peer may connect at all
pub trait Admission: Send + Sync {
    fn admit(&self, peer: &PeerIdentity) -> Result<(), RoomError>;
}

/// Registry of live connections
pub struct PeerHub {
    connections: RwLock<HashMap<PeerIdentity, Arc<Connection>>>,
    events: broadcast::Sender<LifecycleEvent>,
    next_id: AtomicU64,
    policy: DuplicatePolicy,
    channel_config: ChannelConfig,
    admission: Option<Arc<dyn Admission>>,
}

impl PeerHub {
    pub fn new(policy: DuplicatePolicy) -> Self {
        let (events, _) = broadcast::channel(LIFECYCLE_BUFFER);
        Self {
            connections: RwLock::new(HashMap::new()),
            events,
            next_id: AtomicU64::new(1),
            policy,
            channel_config: ChannelConfig::default(),
            admission: None,
        }
    }

    pub fn with_channel_config(mut self, config: ChannelConfig) -> Self {
        self.channel_config = config;
        self
    }

    /// Check every inbound peer against `admission` before registering it
    pub fn with_admission(mut self, admission: Arc<dyn Admission>) -> Self {
        self.admission = Some(admission);
        self
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Subscribe to lifecycle events. Live connections are replayed first.
    pub fn listen(&self) -> LifecycleFeed {
        let connections = self.connections.read().unwrap_or_else(PoisonError::into_inner);
        let mut backlog: Vec<&Arc<Connection>> = connections.values().collect();
        backlog.sort_by_key(|conn| conn.id());
        LifecycleFeed {
            backlog: backlog.into_iter().map(|c| LifecycleEvent::connected(c)).collect(),
            rx: self.events.subscribe(),
            ended: false,
        }
    }

    pub fn lookup(&self, peer: &PeerIdentity) -> Option<Arc<Connection>> {
        let connections = self.connections.read().unwrap_or_else(PoisonError::into_inner);
        connections.get(peer).cloned()
    }

    /// Whether `connection_id` is the live connection of `peer`
    pub fn is_live(&self, peer: &PeerIdentity, connection_id: u64) -> bool {
        self.lookup(peer).is_some_and(|conn| conn.id() == connection_id)
    }

    /// Live connections ordered by connection id
    pub fn list(&self) -> Vec<Arc<Connection>> {
        let connections = self.connections.read().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<_> = connections.values().cloned().collect();
        list.sort_by_key(|conn| conn.id());
        list
    }

    pub fn count(&self) -> usize {
        let connections = self.connections.read().unwrap_or_else(PoisonError::into_inner);
        connections.len()
    }

    /// Close the connection to `peer`, if any. Idempotent.
    pub fn close(&self, peer: &PeerIdentity) {
        let removed = {
            let mut connections = self.connections.write().unwrap_or_else(PoisonError::into_inner);
            let removed = connections.remove(peer);
            if let Some(conn) = &removed {
                let _ = self.events.send(LifecycleEvent::disconnected(conn));
            }
            removed
        };
        if let Some(conn) = removed {
            info!(peer = %peer, connection_id = conn.id(), "Closed connection");
            conn.close();
        }
    }

    /// Unregister a connection. Does nothing if `peer` is now served by a
    /// different connection.
    pub fn remove(&self, peer: &PeerIdentity, connection_id: u64) -> Option<Arc<Connection>> {
        let mut connections = self.connections.write().unwrap_or_else(PoisonError::into_inner);
        match connections.get(peer) {
            Some(conn) if conn.id() == connection_id => {}
            _ => return None,
        }
        let conn = connections.remove(peer)?;
        let _ = self.events.send(LifecycleEvent::disconnected(&conn));
        info!(peer = %peer, connection_id, "Unregistered connection");
        Some(conn)
    }

    /// Register an authenticated inbound stream
    ///
    /// Returns the connection and the driver of its channel. The caller runs
    /// the driver, usually through [`PeerHub::drive`].
    pub fn accept<F>(
        &self,
        secure: SecureChannel,
        make_handler: F,
    ) -> Result<(Arc<Connection>, ChannelDriver), RoomError>
    where
        F: FnOnce(ConnectionInfo) -> Arc<dyn RpcHandler>,
    {
        if let Some(admission) = &self.admission {
            admission.admit(&secure.remote)?;
        }
        self.register(secure, Direction::Inbound, TransportKind::Direct, make_handler)
    }

    /// Dial `address`, authenticate it as `expected` and register the connection.
    /// The connection's channel runs in a background task.
    pub async fn dial<F>(
        self: &Arc<Self>,
        dialer: &dyn Dialer,
        address: &str,
        expected: &PeerIdentity,
        handshaker: &dyn Handshaker,
        make_handler: F,
    ) -> Result<Arc<Connection>, RoomError>
    where
        F: FnOnce(ConnectionInfo) -> Arc<dyn RpcHandler>,
    {
        let (io, remote_addr) = dialer.dial(address).await.map_err(|e| match e {
            TransportError::Handshake(msg) => RoomError::Handshake(msg),
            other => RoomError::Dial(other.to_string()),
        })?;

        let secure = handshaker.client(io, expected).await.map_err(|e| match e {
            TransportError::Dial(msg) => RoomError::Dial(msg),
            other => RoomError::Handshake(other.to_string()),
        })?;
        let secure = secure.with_remote_addr(remote_addr);

        let (conn, driver) =
            self.register(secure, Direction::Outbound, TransportKind::Direct, make_handler)?;
        tokio::spawn(self.clone().drive(conn.clone(), driver, |_| {}));
        Ok(conn)
    }

    /// Authenticate `peer` over a stream relayed by a room and register it
    ///
    /// Outbound tunnels run the client side of the handshake against `peer`.
    /// Inbound tunnels run the server side and must authenticate as `peer`,
    /// the origin the room reported. The channel runs in a background task.
    pub async fn tunneled<F>(
        self: &Arc<Self>,
        io: BoxedIo,
        direction: Direction,
        peer: &PeerIdentity,
        handshaker: &dyn Handshaker,
        make_handler: F,
    ) -> Result<Arc<Connection>, RoomError>
    where
        F: FnOnce(ConnectionInfo) -> Arc<dyn RpcHandler>,
    {
        let secure = match direction {
            Direction::Outbound => handshaker.client(io, peer).await,
            Direction::Inbound => handshaker.server(io).await,
        }
        .map_err(|e| RoomError::Handshake(e.to_string()))?;

        if secure.remote != *peer {
            warn!(origin = %peer, remote = %secure.remote, "Tunnel authenticated as another peer");
            return Err(RoomError::Handshake(format!(
                "tunnel from {} authenticated as {}",
                peer, secure.remote
            )));
        }
        if direction == Direction::Inbound {
            if let Some(admission) = &self.admission {
                admission.admit(&secure.remote)?;
            }
        }

        let (conn, driver) = self.register(secure, direction, TransportKind::Tunneled, make_handler)?;
        info!(peer = %peer, ?direction, connection_id = conn.id(), "Tunneled connection established");
        tokio::spawn(self.clone().drive(conn.clone(), driver, |_| {}));
        Ok(conn)
    }

    /// Run a connection's channel to completion, then tear it down
    ///
    /// `on_teardown` runs after the connection left the registry and before
    /// its session is marked closed.
    pub async fn drive<F>(self: Arc<Self>, conn: Arc<Connection>, driver: ChannelDriver, on_teardown: F)
    where
        F: FnOnce(&ConnectionInfo) + Send,
    {
        driver.run().await;

        let info = conn.info();
        info.session.begin_closing();
        self.remove(&info.peer, info.id);
        on_teardown(info);
        info.session.finish();
        debug!(peer = %info.peer, connection_id = info.id, "Connection torn down");
    }

    fn register<F>(
        &self,
        secure: SecureChannel,
        direction: Direction,
        transport: TransportKind,
        make_handler: F,
    ) -> Result<(Arc<Connection>, ChannelDriver), RoomError>
    where
        F: FnOnce(ConnectionInfo) -> Arc<dyn RpcHandler>,
    {
        let info = ConnectionInfo {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            peer: secure.remote,
            direction,
            remote_addr: secure.remote_addr,
            session: Session::new(),
        };
        let handler = make_handler(info.clone());
        let (channel, driver) = RpcChannel::new(
            secure.io,
            secure.remote,
            handler,
            self.channel_config.clone(),
        );
        let conn = Arc::new(Connection {
            info,
            transport,
            created_at: Utc::now(),
            channel,
        });

        self.attach(conn.clone())?;
        conn.session().activate()?;
        Ok((conn, driver))
    }

    fn attach(&self, conn: Arc<Connection>) -> Result<(), RoomError> {
        let peer = conn.peer();
        let replaced = {
            let mut connections = self.connections.write().unwrap_or_else(PoisonError::into_inner);

            let replaced = match connections.get(&peer) {
                None => None,
                Some(existing) => match self.policy {
                    DuplicatePolicy::Reject => {
                        warn!(
                            peer = %peer,
                            existing = existing.id(),
                            "Refusing duplicate connection"
                        );
                        return Err(RoomError::InvalidState(format!(
                            "{} is already connected",
                            peer
                        )));
                    }
                    DuplicatePolicy::ReplaceOldest => {
                        let old = connections.remove(&peer);
                        if let Some(old) = &old {
                            let _ = self.events.send(LifecycleEvent::disconnected(old));
                        }
                        old
                    }
                },
            };

            connections.insert(peer, conn.clone());
            let _ = self.events.send(LifecycleEvent::connected(&conn));
            replaced
        };

        if let Some(old) = replaced {
            info!(
                peer = %peer,
                old_connection = old.id(),
                connection_id = conn.id(),
                "Replaced existing connection"
            );
            old.close();
        } else {
            info!(
                peer = %peer,
                connection_id = conn.id(),
                direction = ?conn.direction(),
                "Registered connection"
            );
        }
        Ok(())
    }
}

impl Default for PeerHub {
    fn default() -> Self {
        Self::new(DuplicatePolicy::default())
    }
}

impl std::fmt::Debug for PeerHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHub")
            .field("connections", &self.count())
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use room_proto::KeyPair;
    use room_rpc::UnhandledCalls;
    use room_transport::memory::pipe;
    use std::time::Duration;

    fn id(seed: u8) -> PeerIdentity {
        KeyPair::from_seed([seed; 32]).identity()
    }

    fn secure(peer: PeerIdentity) -> SecureChannel {
        let (io, _other) = pipe();
        SecureChannel::new(peer, io)
    }

    fn unhandled(_: ConnectionInfo) -> Arc<dyn RpcHandler> {
        Arc::new(UnhandledCalls)
    }

    #[tokio::test]
    async fn test_accept_and_lookup() {
        let hub = PeerHub::default();
        let (conn, _driver) = hub.accept(secure(id(1)), unhandled).unwrap();

        assert_eq!(hub.count(), 1);
        assert_eq!(hub.lookup(&id(1)).unwrap().id(), conn.id());
        assert!(hub.lookup(&id(2)).is_none());
        assert!(conn.session().tunnel_state().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_rejected_by_default() {
        let hub = PeerHub::default();
        let (first, _d1) = hub.accept(secure(id(1)), unhandled).unwrap();
        let err = hub.accept(secure(id(1)), unhandled).unwrap_err();

        assert!(matches!(err, RoomError::InvalidState(_)));
        assert_eq!(hub.lookup(&id(1)).unwrap().id(), first.id());
    }

    #[tokio::test]
    async fn test_duplicate_replaces_oldest() {
        let hub = PeerHub::new(DuplicatePolicy::ReplaceOldest);
        let mut feed = hub.listen();

        let (first, _d1) = hub.accept(secure(id(1)), unhandled).unwrap();
        let (second, _d2) = hub.accept(secure(id(1)), unhandled).unwrap();

        assert!(first.channel().is_closed());
        assert_eq!(hub.lookup(&id(1)).unwrap().id(), second.id());

        let events: Vec<_> = [
            feed.next().await.unwrap(),
            feed.next().await.unwrap(),
            feed.next().await.unwrap(),
        ]
        .into();
        assert!(matches!(events[0], LifecycleEvent::Connected { connection_id, .. } if connection_id == first.id()));
        assert!(matches!(events[1], LifecycleEvent::Disconnected { connection_id, .. } if connection_id == first.id()));
        assert!(matches!(events[2], LifecycleEvent::Connected { connection_id, .. } if connection_id == second.id()));
    }

    #[tokio::test]
    async fn test_listen_replays_live_connections() {
        let hub = PeerHub::default();
        let (a, _da) = hub.accept(secure(id(1)), unhandled).unwrap();
        let (b, _db) = hub.accept(secure(id(2)), unhandled).unwrap();

        let mut feed = hub.listen();
        assert_eq!(
            feed.next().await,
            Some(LifecycleEvent::Connected {
                peer: id(1),
                connection_id: a.id(),
                direction: Direction::Inbound,
            })
        );
        assert_eq!(feed.next().await.unwrap().peer(), id(2));

        hub.remove(&id(2), b.id());
        assert_eq!(
            feed.next().await,
            Some(LifecycleEvent::Disconnected {
                peer: id(2),
                connection_id: b.id(),
                direction: Direction::Inbound,
            })
        );
    }

    #[tokio::test]
    async fn test_remove_ignores_stale_connection_id() {
        let hub = PeerHub::default();
        let (conn, _driver) = hub.accept(secure(id(1)), unhandled).unwrap();

        assert!(hub.remove(&id(1), conn.id() + 100).is_none());
        assert_eq!(hub.count(), 1);
        assert!(hub.remove(&id(1), conn.id()).is_some());
        assert_eq!(hub.count(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let hub = PeerHub::default();
        let mut feed = hub.listen();
        let (conn, _driver) = hub.accept(secure(id(1)), unhandled).unwrap();

        hub.close(&id(1));
        hub.close(&id(1));

        assert!(conn.channel().is_closed());
        assert_eq!(hub.count(), 0);
        assert!(matches!(feed.next().await, Some(LifecycleEvent::Connected { .. })));
        assert!(matches!(feed.next().await, Some(LifecycleEvent::Disconnected { .. })));
        assert!(
            tokio::time::timeout(Duration::from_millis(50), feed.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_lagging_listener_is_dropped() {
        let hub = PeerHub::default();
        let mut feed = hub.listen();

        let mut drivers = Vec::new();
        for i in 0..(LIFECYCLE_BUFFER + 10) {
            let seed = [i as u8, (i >> 8) as u8].repeat(16);
            let peer = KeyPair::from_seed(seed.try_into().unwrap()).identity();
            drivers.push(hub.accept(secure(peer), unhandled).unwrap());
        }

        assert_eq!(feed.next().await, None);
        assert_eq!(feed.next().await, None);
    }

    struct DenyAll;

    impl Admission for DenyAll {
        fn admit(&self, peer: &PeerIdentity) -> Result<(), RoomError> {
            Err(RoomError::PermissionDenied(peer.to_string()))
        }
    }

    #[tokio::test]
    async fn test_admission_refuses_before_registering() {
        let hub = PeerHub::default().with_admission(Arc::new(DenyAll));
        let mut feed = hub.listen();

        let err = hub.accept(secure(id(1)), unhandled).unwrap_err();
        assert!(matches!(err, RoomError::PermissionDenied(_)));
        assert_eq!(hub.count(), 0);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), feed.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_drive_tears_down_when_remote_goes_away() {
        let hub = Arc::new(PeerHub::default());
        let (io, remote) = pipe();
        let (conn, driver) = hub
            .accept(SecureChannel::new(id(1), io), unhandled)
            .unwrap();

        let task = tokio::spawn(hub.clone().drive(conn.clone(), driver, |_| {}));
        drop(remote);

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(conn.session().is_closed());
        assert_eq!(hub.count(), 0);
    }
}
