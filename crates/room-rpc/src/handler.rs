//! Serving calls opened by the remote side

use crate::channel::{ChannelInner, RpcChannel};
use crate::error::RpcError;
use crate::stream::RpcStream;
use async_trait::async_trait;
use bytes::Bytes;
use room_proto::{decode_payload, encode_payload, CallKind, Frame, RequestId, RoomError};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Serves inbound calls on a channel
///
/// Each call runs in its own task. When `handle` returns, a call that was
/// never answered is finished for the handler: streams get an end frame,
/// single-reply calls get an internal error.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(&self, call: IncomingCall);
}

/// Handler that refuses every call
#[derive(Debug, Clone, Copy, Default)]
pub struct UnhandledCalls;

#[async_trait]
impl RpcHandler for UnhandledCalls {
    async fn handle(&self, call: IncomingCall) {
        let _ = call
            .responder
            .error(RoomError::PermissionDenied(format!(
                "{} is not served here",
                call.method
            )))
            .await;
    }
}

/// A call opened by the remote side
pub struct IncomingCall {
    pub id: RequestId,
    pub method: String,
    pub kind: CallKind,
    pub args: Bytes,
    /// Channel the call arrived on
    pub channel: RpcChannel,
    pub responder: ResponseSink,
    /// The caller's frames, for sink and duplex calls
    pub incoming: Option<RpcStream>,
    /// Cancelled when the caller aborts or the channel closes
    pub cancel: CancellationToken,
}

impl IncomingCall {
    /// Decode the call arguments
    pub fn args<T: DeserializeOwned>(&self) -> Result<T, RoomError> {
        decode_payload(&self.args)
            .map_err(|e| RoomError::BadRequest(format!("{}: bad arguments: {}", self.method, e)))
    }
}

impl std::fmt::Debug for IncomingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingCall")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Writes the callee's side of a call
///
/// Cloneable so a handler can answer from several tasks. Writes after the
/// call finished or was aborted are dropped and reported as errors.
#[derive(Clone)]
pub struct ResponseSink {
    inner: Arc<ChannelInner>,
    id: RequestId,
    kind: CallKind,
    finished: Arc<Mutex<bool>>,
    cancel: CancellationToken,
}

impl ResponseSink {
    pub(crate) fn new(
        inner: Arc<ChannelInner>,
        id: RequestId,
        kind: CallKind,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner,
            id,
            kind,
            finished: Arc::new(Mutex::new(false)),
            cancel,
        }
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    /// Send a value. For single-reply calls this is the reply and finishes the call.
    pub async fn send(&self, payload: Bytes) -> Result<(), RpcError> {
        let terminal = !self.kind.callee_streams();
        self.write(Frame::data(self.id, payload), terminal).await
    }

    pub async fn send_value<T: Serialize>(&self, value: &T) -> Result<(), RpcError> {
        self.send(encode_payload(value)?).await
    }

    /// End the reply stream
    pub async fn end(&self) -> Result<(), RpcError> {
        self.write(Frame::end(self.id), true).await
    }

    /// Fail the call
    pub async fn error(&self, err: RoomError) -> Result<(), RpcError> {
        let body = encode_payload(&err.to_body())?;
        self.write(Frame::error(self.id, body), true).await
    }

    /// Answer with the outcome of a handler
    pub async fn reply<T: Serialize>(&self, result: Result<T, RoomError>) -> Result<(), RpcError> {
        match result {
            Ok(value) => self.send_value(&value).await,
            Err(err) => self.error(err).await,
        }
    }

    pub async fn is_finished(&self) -> bool {
        *self.finished.lock().await
    }

    async fn write(&self, frame: Frame, terminal: bool) -> Result<(), RpcError> {
        if self.kind == CallKind::Notify {
            return Ok(());
        }

        let mut finished = self.finished.lock().await;
        if self.cancel.is_cancelled() {
            trace!(request_id = self.id, "Dropping write to aborted call");
            return Err(RpcError::Aborted);
        }
        if *finished {
            return Err(RpcError::CallFinished);
        }

        self.inner.enqueue(frame.as_reply()).await?;
        if terminal {
            *finished = true;
        }
        Ok(())
    }

    /// The caller aborted: stop the handler and close our side once
    pub(crate) fn abort(&self) {
        self.cancel.cancel();
        if self.kind == CallKind::Notify {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            let mut finished = this.finished.lock().await;
            if !*finished {
                *finished = true;
                let _ = this.inner.enqueue(Frame::end(this.id).as_reply()).await;
            }
        });
    }

    /// Finish a call the handler left open
    pub(crate) async fn finish_default(&self) {
        if self.kind == CallKind::Notify {
            return;
        }

        let mut finished = self.finished.lock().await;
        if *finished || self.cancel.is_cancelled() {
            return;
        }
        *finished = true;

        let frame = if self.kind.callee_streams() {
            Frame::end(self.id)
        } else {
            let err = RoomError::Internal("handler returned without a reply".to_string());
            match encode_payload(&err.to_body()) {
                Ok(body) => Frame::error(self.id, body),
                Err(_) => Frame::end(self.id),
            }
        };
        let _ = self.inner.enqueue(frame.as_reply()).await;
    }
}
