//! Peer side of a room connection
//!
//! [`RoomClient`] dials a room, calls its methods and receives the tunnels
//! other peers open towards it.

use crate::hub::{Connection, ConnectionInfo, Direction, PeerHub};
use async_trait::async_trait;
use room_proto::confirm::{alias_registration_message, sign_in_message};
use room_proto::{
    CallKind, ConnectArgs, ConnectWithOrigin, EndpointRecord, KeyPair, ManifestEntry, Metadata,
    Method, PeerIdentity, RegisterAliasArgs, RegisterAliasReply, RevokeAliasArgs, RoomError,
    SendSolutionArgs, WhoamiReply,
};
use room_rpc::{CallIo, DuplexSink, IncomingCall, ResponseSink, RpcHandler, RpcStream};
use room_transport::{BoxedIo, Dialer, KeyHandshake};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info};

/// Tunnels waiting for the client to pick them up
const TUNNEL_BACKLOG: usize = 16;

/// A tunnel another peer opened to us through the room
pub struct IncomingTunnel {
    pub origin: PeerIdentity,
    /// Bytes sent by the origin
    pub stream: RpcStream,
    /// Writes bytes back to the origin
    pub sink: ResponseSink,
    _done: oneshot::Sender<()>,
}

impl std::fmt::Debug for IncomingTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingTunnel")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// Answers the room's `tunnel.connect` calls
struct PeerHandler {
    room: PeerIdentity,
    tunnels: mpsc::Sender<IncomingTunnel>,
}

#[async_trait]
impl RpcHandler for PeerHandler {
    async fn handle(&self, call: IncomingCall) {
        if call.method != Method::TunnelConnect.as_str() || call.kind != CallKind::Duplex {
            let _ = call
                .responder
                .error(RoomError::PermissionDenied(format!(
                    "{} is not served by peers",
                    call.method
                )))
                .await;
            return;
        }

        let args: ConnectWithOrigin = match call.args() {
            Ok(args) => args,
            Err(e) => {
                let _ = call.responder.error(e).await;
                return;
            }
        };
        if args.portal != self.room {
            let _ = call
                .responder
                .error(RoomError::PermissionDenied(format!(
                    "tunnels through {} are not accepted",
                    args.portal
                )))
                .await;
            return;
        }

        let IncomingCall {
            responder,
            incoming,
            cancel,
            ..
        } = call;
        let Some(stream) = incoming else {
            return;
        };

        let (done_tx, done_rx) = oneshot::channel();
        let tunnel = IncomingTunnel {
            origin: args.origin,
            stream,
            sink: responder,
            _done: done_tx,
        };

        debug!(origin = %args.origin, "Incoming tunnel");
        if let Err(mpsc::error::SendError(tunnel)) = self.tunnels.send(tunnel).await {
            let _ = tunnel
                .sink
                .error(RoomError::PeerUnreachable("peer is not accepting tunnels".to_string()))
                .await;
            return;
        }

        // The call stays open until the tunnel is dropped
        tokio::select! {
            _ = done_rx => {}
            _ = cancel.cancelled() => {}
        }
    }
}

/// A peer's connection to a room
pub struct RoomClient {
    keys: KeyPair,
    room: PeerIdentity,
    handshaker: KeyHandshake,
    hub: Arc<PeerHub>,
    conn: Arc<Connection>,
    tunnels: Mutex<mpsc::Receiver<IncomingTunnel>>,
}

impl RoomClient {
    /// Dial the room at `address` and authenticate it as `room`
    pub async fn connect(
        dialer: &dyn Dialer,
        address: &str,
        room: PeerIdentity,
        keys: KeyPair,
        network_key: &[u8],
    ) -> Result<Self, RoomError> {
        let hub = Arc::new(PeerHub::default());
        let handshaker = KeyHandshake::new(keys.clone(), network_key);
        let (tx, rx) = mpsc::channel(TUNNEL_BACKLOG);

        let conn = hub
            .dial(dialer, address, &room, &handshaker, move |_: ConnectionInfo| {
                Arc::new(PeerHandler { room, tunnels: tx }) as Arc<dyn RpcHandler>
            })
            .await?;

        info!(room = %room, address = %address, "Connected to room");
        Ok(Self {
            keys,
            room,
            handshaker,
            hub,
            conn,
            tunnels: Mutex::new(rx),
        })
    }

    pub fn id(&self) -> PeerIdentity {
        self.keys.identity()
    }

    pub fn room_id(&self) -> PeerIdentity {
        self.room
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Connections of this client: the room and peers reached through it
    pub fn hub(&self) -> &Arc<PeerHub> {
        &self.hub
    }

    pub fn is_closed(&self) -> bool {
        self.conn.channel().is_closed()
    }

    async fn request<A: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        args: &A,
    ) -> Result<R, RoomError> {
        Ok(self.conn.channel().request(method.as_str(), args).await?)
    }

    pub async fn whoami(&self) -> Result<PeerIdentity, RoomError> {
        let reply: WhoamiReply = self.request(Method::Whoami, &()).await?;
        Ok(reply.id)
    }

    pub async fn manifest(&self) -> Result<Vec<ManifestEntry>, RoomError> {
        self.request(Method::Manifest, &()).await
    }

    pub async fn is_room(&self) -> Result<Metadata, RoomError> {
        self.request(Method::TunnelIsRoom, &()).await
    }

    /// Room clock in microseconds since the Unix epoch
    pub async fn ping(&self) -> Result<i64, RoomError> {
        self.request(Method::TunnelPing, &()).await
    }

    pub async fn announce(&self) -> Result<EndpointRecord, RoomError> {
        self.request(Method::TunnelAnnounce, &()).await
    }

    pub async fn leave(&self) -> Result<(), RoomError> {
        self.request(Method::TunnelLeave, &()).await
    }

    /// Feed of [`room_proto::EndpointEvent`]s
    pub async fn endpoints(&self) -> Result<RpcStream, RoomError> {
        let args = room_proto::encode_payload(&())
            .map_err(|e| RoomError::Internal(e.to_string()))?;
        Ok(self
            .conn
            .channel()
            .stream(Method::TunnelEndpoints.as_str(), args)
            .await?)
    }

    /// Open a tunnel to `target`, an alias name or a textual identity
    pub async fn connect_to(&self, target: &str) -> Result<(DuplexSink, RpcStream), RoomError> {
        let args = ConnectArgs {
            portal: self.room,
            target: target.to_string(),
        };
        let payload = room_proto::encode_payload(&args)
            .map_err(|e| RoomError::Internal(e.to_string()))?;
        Ok(self
            .conn
            .channel()
            .duplex(Method::TunnelConnect.as_str(), payload)
            .await?)
    }

    /// Next tunnel opened towards us. `None` once the connection is gone.
    pub async fn next_tunnel(&self) -> Option<IncomingTunnel> {
        self.tunnels.lock().await.recv().await
    }

    /// Open a tunnel to `peer` and run an authenticated RPC connection over it
    pub async fn connect_peer<F>(
        &self,
        peer: PeerIdentity,
        make_handler: F,
    ) -> Result<Arc<Connection>, RoomError>
    where
        F: FnOnce(ConnectionInfo) -> Arc<dyn RpcHandler>,
    {
        let (sink, stream) = self.connect_to(&peer.to_string()).await?;
        let io: BoxedIo = Box::new(CallIo::caller(sink, stream));
        self.hub
            .tunneled(io, Direction::Outbound, &peer, &self.handshaker, make_handler)
            .await
    }

    /// Run an authenticated RPC connection over a tunnel opened towards us
    ///
    /// The tunnel's call stays open until the connection's channel closes.
    pub async fn accept_peer<F>(
        &self,
        tunnel: IncomingTunnel,
        make_handler: F,
    ) -> Result<Arc<Connection>, RoomError>
    where
        F: FnOnce(ConnectionInfo) -> Arc<dyn RpcHandler>,
    {
        let IncomingTunnel {
            origin,
            stream,
            sink,
            _done: done,
        } = tunnel;
        let io: BoxedIo = Box::new(CallIo::callee(sink, stream));
        let conn = self
            .hub
            .tunneled(io, Direction::Inbound, &origin, &self.handshaker, make_handler)
            .await?;

        let channel = conn.channel().clone();
        tokio::spawn(async move {
            channel.closed().await;
            drop(done);
        });
        Ok(conn)
    }

    /// Register `alias` and return its URL
    pub async fn register_alias(&self, alias: &str) -> Result<String, RoomError> {
        let message = alias_registration_message(&self.room, &self.id(), alias);
        let args = RegisterAliasArgs {
            alias: alias.to_string(),
            signature: self.keys.sign(&message).to_vec(),
        };
        let reply: RegisterAliasReply = self.request(Method::RegisterAlias, &args).await?;
        Ok(reply.url)
    }

    pub async fn revoke_alias(&self, alias: &str) -> Result<(), RoomError> {
        let args = RevokeAliasArgs {
            alias: alias.to_string(),
        };
        self.request(Method::RevokeAlias, &args).await
    }

    pub async fn list_aliases(&self) -> Result<Vec<String>, RoomError> {
        self.request(Method::ListAliases, &()).await
    }

    /// Answer a web sign-in challenge
    pub async fn send_solution(&self, sc: &str, cc: &str) -> Result<bool, RoomError> {
        let message = sign_in_message(&self.room, &self.id(), sc, cc);
        let args = SendSolutionArgs {
            sc: sc.to_string(),
            cc: cc.to_string(),
            signature: self.keys.sign(&message).to_vec(),
        };
        self.request(Method::SendSolution, &args).await
    }

    /// Close the room connection and every peer connection, then wait for
    /// the room connection's teardown
    pub async fn close(&self) {
        for conn in self.hub.list() {
            conn.close();
        }
        self.conn.channel().closed().await;
        self.conn.session().wait_closed().await;
    }
}

impl std::fmt::Debug for RoomClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomClient")
            .field("id", &self.id())
            .field("room", &self.room)
            .finish_non_exhaustive()
    }
}
