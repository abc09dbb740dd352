//! The room server

use crate::bridge::SignInBridge;
use crate::broker::{BrokerConfig, TunnelBroker};
use crate::config::{ConfigError, RoomConfig};
use crate::dispatch::RoomHandler;
use crate::hub::{Admission, Connection, PeerHub};
use crate::membership::Membership;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use room_proto::{KeyPair, Manifest, Metadata, PeerIdentity, PrivacyMode, RoomError};
use room_rpc::RpcHandler;
use room_transport::{BoxedIo, Handshaker, KeyHandshake, SecureChannel, TcpRoomListener};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Refuses denied keys, and non-members of restricted rooms
struct RoomAdmission {
    membership: Arc<Membership>,
    mode: PrivacyMode,
}

impl Admission for RoomAdmission {
    fn admit(&self, peer: &PeerIdentity) -> Result<(), RoomError> {
        if self.membership.is_denied(peer) {
            return Err(RoomError::PermissionDenied(format!("{} is denied", peer)));
        }
        if self.mode == PrivacyMode::Restricted && !self.membership.is_member(peer) {
            return Err(RoomError::PermissionDenied(format!(
                "{} is not a member of this room",
                peer
            )));
        }
        Ok(())
    }
}

/// A room: accepts peers, serves their calls and brokers tunnels between them
pub struct Room {
    keys: KeyPair,
    config: RoomConfig,
    manifest: Manifest,
    membership: Arc<Membership>,
    hub: Arc<PeerHub>,
    broker: Arc<TunnelBroker>,
    bridge: SignInBridge,
    handshaker: KeyHandshake,
}

impl Room {
    pub fn new(config: RoomConfig, keys: KeyPair) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;

        let id = keys.identity();
        let membership = Arc::new(Membership::new(
            id,
            config.admins.iter().copied(),
            config.members.iter().copied(),
            config.denied.iter().copied(),
        ));
        let hub = Arc::new(
            PeerHub::new(config.duplicate_policy).with_admission(Arc::new(RoomAdmission {
                membership: membership.clone(),
                mode: config.privacy_mode,
            })),
        );
        let broker = Arc::new(TunnelBroker::new(
            id,
            hub.clone(),
            BrokerConfig::from_room_config(&config),
        ));
        let handshaker = KeyHandshake::new(keys.clone(), &config.network_key_bytes()?);

        info!(
            room = %id,
            name = %config.name,
            mode = %config.privacy_mode,
            duplicate_policy = %config.duplicate_policy,
            "Room created"
        );

        Ok(Arc::new(Self {
            keys,
            manifest: Manifest::for_mode(config.privacy_mode),
            config,
            membership,
            hub,
            broker,
            bridge: SignInBridge::new(),
            handshaker,
        }))
    }

    pub fn id(&self) -> PeerIdentity {
        self.keys.identity()
    }

    pub fn keys(&self) -> &KeyPair {
        &self.keys
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub fn hub(&self) -> &Arc<PeerHub> {
        &self.hub
    }

    pub fn broker(&self) -> &Arc<TunnelBroker> {
        &self.broker
    }

    pub fn bridge(&self) -> &SignInBridge {
        &self.bridge
    }

    pub fn handshaker(&self) -> &KeyHandshake {
        &self.handshaker
    }

    /// Address peers use to reach the room: `net:{domain}:{port}~shs:{key}`
    pub fn multiserver_address(&self) -> String {
        format!(
            "net:{}:{}~shs:{}",
            self.config.domain,
            self.config.listen_addr.port(),
            STANDARD.encode(self.id().as_bytes())
        )
    }

    /// What `tunnel.isRoom` tells `peer`
    pub fn metadata_for(&self, peer: &PeerIdentity) -> Metadata {
        let mode = self.config.privacy_mode;
        let mut features = vec!["tunnel".to_string()];
        if mode == PrivacyMode::Open {
            features.push("room1".to_string());
        }
        if matches!(mode, PrivacyMode::Open | PrivacyMode::Community) {
            features.push("alias".to_string());
        }
        features.push("httpAuth".to_string());

        Metadata {
            name: self.config.name.clone(),
            membership: self.membership.is_member(peer),
            features,
        }
    }

    /// Register an authenticated stream and start serving it
    pub fn admit(self: &Arc<Self>, secure: SecureChannel) -> Result<Arc<Connection>, RoomError> {
        let room = self.clone();
        let (conn, driver) = self.hub.accept(secure, move |info| {
            Arc::new(RoomHandler::new(room, info)) as Arc<dyn RpcHandler>
        })?;

        let broker = self.broker.clone();
        tokio::spawn(self.hub.clone().drive(conn.clone(), driver, move |info| {
            broker.peer_disconnected(&info.peer, info.id);
        }));
        Ok(conn)
    }

    /// Authenticate a raw stream and admit it
    pub async fn handle_raw(
        self: &Arc<Self>,
        io: BoxedIo,
        addr: Option<SocketAddr>,
    ) -> Result<Arc<Connection>, RoomError> {
        let secure = self
            .handshaker
            .server(io)
            .await
            .map_err(|e| RoomError::Handshake(e.to_string()))?
            .with_remote_addr(addr);
        self.admit(secure)
    }

    /// Accept connections until `shutdown` fires, then close every connection
    pub async fn serve(self: Arc<Self>, listener: TcpRoomListener, shutdown: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!(address = %addr, room = %self.id(), "Room listening");
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((io, addr)) => {
                        debug!(address = %addr, "Accepted TCP connection");
                        let room = self.clone();
                        tokio::spawn(async move {
                            match room.handle_raw(io, Some(addr)).await {
                                Ok(conn) => {
                                    debug!(peer = %conn.peer(), address = %addr, "Peer admitted");
                                }
                                Err(e) => {
                                    warn!(address = %addr, error = %e, "Connection refused");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
        }

        self.shutdown();
    }

    /// Close every connection
    pub fn shutdown(&self) {
        let connections = self.hub.list();
        info!(connections = connections.len(), "Shutting down room");
        for conn in connections {
            self.hub.close(&conn.peer());
        }
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id())
            .field("name", &self.config.name)
            .field("mode", &self.config.privacy_mode)
            .finish_non_exhaustive()
    }
}
