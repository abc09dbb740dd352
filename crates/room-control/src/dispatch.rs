//! Serves the room's RPC methods on one connection
//!
//! Every call is checked against the manifest with the caller's current trust
//! tier before any method logic runs. A call naming a method the room does not
//! know, or using the wrong call kind, is a protocol violation and closes the
//! connection.

use crate::broker::splice;
use crate::hub::ConnectionInfo;
use crate::room::Room;
use async_trait::async_trait;
use chrono::Utc;
use room_proto::confirm::sign_in_message;
use room_proto::{
    ConnectArgs, Method, RegisterAliasArgs, RegisterAliasReply, RevokeAliasArgs, RoomError,
    SendSolutionArgs, WhoamiReply,
};
use room_rpc::{IncomingCall, ResponseSink, RpcHandler};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Call handler of one room connection
pub struct RoomHandler {
    room: Arc<Room>,
    info: ConnectionInfo,
}

impl RoomHandler {
    pub fn new(room: Arc<Room>, info: ConnectionInfo) -> Self {
        Self { room, info }
    }

    async fn violation(&self, call: &IncomingCall, reason: String) {
        warn!(peer = %self.info.peer, method = %call.method, reason = %reason, "Protocol violation");
        let _ = call
            .responder
            .error(RoomError::ProtocolViolation(reason))
            .await;
        call.channel.close();
    }

    async fn endpoints(&self, call: IncomingCall) {
        let mut feed = self.room.broker().endpoints(self.info.peer);
        loop {
            tokio::select! {
                _ = call.cancel.cancelled() => break,
                event = feed.next() => match event {
                    Some(event) => {
                        if call.responder.send_value(&event).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = call.responder.end().await;
                        break;
                    }
                }
            }
        }
        debug!(peer = %self.info.peer, "Endpoint feed finished");
    }

    async fn connect(&self, call: IncomingCall) {
        let args: ConnectArgs = match call.args() {
            Ok(args) => args,
            Err(e) => {
                let _ = call.responder.error(e).await;
                return;
            }
        };
        let IncomingCall {
            responder,
            incoming,
            cancel,
            ..
        } = call;
        let Some(incoming) = incoming else {
            let _ = responder
                .error(RoomError::Internal("duplex call without input".to_string()))
                .await;
            return;
        };

        match self.room.broker().open_tunnel(&self.info, &args).await {
            Ok(tunnel) => splice(tunnel, incoming, responder, cancel).await,
            Err(e) => {
                debug!(peer = %self.info.peer, target = %args.target, error = %e, "Tunnel refused");
                let _ = responder.error(e).await;
            }
        }
    }

    fn send_solution(&self, args: SendSolutionArgs) -> Result<bool, RoomError> {
        let bridge = self.room.bridge();
        if !bridge.contains(&args.sc) {
            return Err(RoomError::BadRequest("unknown sign-in challenge".to_string()));
        }

        let message = sign_in_message(&self.room.id(), &self.info.peer, &args.sc, &args.cc);
        if self.info.peer.verify(&message, &args.signature) {
            bridge.signal_success(&args.sc)?;
            Ok(true)
        } else {
            let _ = bridge.signal_failure(&args.sc, "signature does not verify");
            Err(RoomError::BadRequest(
                "sign-in signature does not verify".to_string(),
            ))
        }
    }
}

async fn respond<T: Serialize>(responder: &ResponseSink, result: Result<T, RoomError>) {
    let _ = responder.reply(result).await;
}

#[async_trait]
impl RpcHandler for RoomHandler {
    async fn handle(&self, call: IncomingCall) {
        let method: Method = match call.method.parse() {
            Ok(method) => method,
            Err(e) => {
                self.violation(&call, format!("{}", e)).await;
                return;
            }
        };
        if method.call_kind() != call.kind {
            let reason = format!(
                "{} is a {:?} method, called as {:?}",
                method,
                method.call_kind(),
                call.kind
            );
            self.violation(&call, reason).await;
            return;
        }

        let manifest = self.room.manifest();
        let tier = self.room.membership().tier_of(&self.info.peer);
        if !manifest.is_permitted(tier, method) {
            debug!(peer = %self.info.peer, %method, ?tier, "Call refused");
            let _ = call
                .responder
                .error(RoomError::PermissionDenied(format!(
                    "{} requires {:?}",
                    method,
                    manifest.required_tier(method)
                )))
                .await;
            return;
        }

        let broker = self.room.broker();
        let peer = self.info.peer;
        match method {
            Method::Manifest => respond(&call.responder, Ok(manifest.describe())).await,
            Method::Whoami => {
                respond(&call.responder, Ok(WhoamiReply { id: self.room.id() })).await
            }
            Method::TunnelAnnounce => {
                respond(&call.responder, broker.announce(&self.info)).await
            }
            Method::TunnelLeave => respond(&call.responder, broker.leave(&self.info)).await,
            Method::TunnelEndpoints => self.endpoints(call).await,
            Method::TunnelIsRoom => {
                respond(&call.responder, Ok(self.room.metadata_for(&peer))).await
            }
            Method::TunnelPing => {
                respond(&call.responder, Ok(Utc::now().timestamp_micros())).await
            }
            Method::TunnelConnect => self.connect(call).await,
            Method::RegisterAlias => {
                let result = call
                    .args::<RegisterAliasArgs>()
                    .and_then(|args| broker.register_alias(peer, &args))
                    .map(|url| RegisterAliasReply { url });
                respond(&call.responder, result).await
            }
            Method::RevokeAlias => {
                let result = call
                    .args::<RevokeAliasArgs>()
                    .and_then(|args| broker.revoke_alias(&peer, &args.alias));
                respond(&call.responder, result).await
            }
            Method::ListAliases => {
                respond(&call.responder, Ok(broker.list_aliases(&peer))).await
            }
            Method::SendSolution => {
                let result = call
                    .args::<SendSolutionArgs>()
                    .and_then(|args| self.send_solution(args));
                respond(&call.responder, result).await
            }
        }
    }
}
