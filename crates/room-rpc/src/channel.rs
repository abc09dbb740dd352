//! Multiplexed RPC channel implementation

use crate::error::RpcError;
use crate::handler::{IncomingCall, ResponseSink, RpcHandler};
use crate::pending::{error_from_payload, Delivery, PendingCalls, RequestIds, DEFAULT_STREAM_CAPACITY};
use crate::stream::{offer, DuplexSink, RpcStream, StreamEvent};
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use futures::{SinkExt, StreamExt};
use room_proto::{
    decode_payload, encode_payload, CallKind, CodecError, Frame, FrameCodec, FrameKind,
    PeerIdentity, RequestId,
};
use room_transport::BoxedIo;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Channel tuning
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Frames queued for the writer before senders wait
    pub queue_capacity: usize,
    /// Events buffered per streaming call before the reader waits for the consumer
    pub stream_capacity: usize,
    /// How long queued frames may take to flush on shutdown
    pub drain_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            stream_capacity: DEFAULT_STREAM_CAPACITY,
            drain_timeout: Duration::from_secs(1),
        }
    }
}

/// A call the remote opened and that is still running
struct InboundCall {
    incoming: Option<mpsc::Sender<StreamEvent>>,
    responder: ResponseSink,
}

pub(crate) struct ChannelInner {
    remote: PeerIdentity,
    ids: RequestIds,
    /// Held from id allocation until the opening frame is queued, so call
    /// frames leave in id order
    opening: Mutex<()>,
    writer: mpsc::Sender<Frame>,
    pending: PendingCalls,
    inbound: DashMap<RequestId, InboundCall>,
    highest_inbound: AtomicU32,
    stream_capacity: usize,
    /// Outbound calls we aborted whose final frame has not arrived yet
    aborted: DashSet<RequestId>,
    handler: Arc<dyn RpcHandler>,
    shutdown: CancellationToken,
    terminated: CancellationToken,
}

/// Handle to a multiplexed RPC channel
#[derive(Clone)]
pub struct RpcChannel {
    inner: Arc<ChannelInner>,
}

/// Drives the reader and writer of a channel. Run it with [`ChannelDriver::run`].
pub struct ChannelDriver {
    inner: Arc<ChannelInner>,
    reader: FramedRead<ReadHalf<BoxedIo>, FrameCodec>,
    writer: FramedWrite<WriteHalf<BoxedIo>, FrameCodec>,
    outbound: mpsc::Receiver<Frame>,
    drain_timeout: Duration,
}

/// Final reply of a sink call
pub struct SinkReply {
    rx: oneshot::Receiver<Result<Bytes, RpcError>>,
}

impl SinkReply {
    pub async fn response(self) -> Result<Bytes, RpcError> {
        self.rx.await.map_err(|_| RpcError::ConnectionClosed)?
    }
}

impl RpcChannel {
    /// Create a channel over an authenticated stream
    pub fn new(
        io: BoxedIo,
        remote: PeerIdentity,
        handler: Arc<dyn RpcHandler>,
        config: ChannelConfig,
    ) -> (Self, ChannelDriver) {
        let (read_half, write_half) = tokio::io::split(io);
        let (writer_tx, writer_rx) = mpsc::channel(config.queue_capacity);

        let inner = Arc::new(ChannelInner {
            remote,
            ids: RequestIds::new(),
            opening: Mutex::new(()),
            writer: writer_tx,
            pending: PendingCalls::with_stream_capacity(config.stream_capacity),
            inbound: DashMap::new(),
            highest_inbound: AtomicU32::new(0),
            stream_capacity: config.stream_capacity.max(1),
            aborted: DashSet::new(),
            handler,
            shutdown: CancellationToken::new(),
            terminated: CancellationToken::new(),
        });

        let driver = ChannelDriver {
            inner: inner.clone(),
            reader: FramedRead::new(read_half, FrameCodec::new()),
            writer: FramedWrite::new(write_half, FrameCodec::new()),
            outbound: writer_rx,
            drain_timeout: config.drain_timeout,
        };

        (Self { inner }, driver)
    }

    /// Create a channel and run its driver on the current runtime
    pub fn spawn(
        io: BoxedIo,
        remote: PeerIdentity,
        handler: Arc<dyn RpcHandler>,
        config: ChannelConfig,
    ) -> Self {
        let (channel, driver) = Self::new(io, remote, handler, config);
        tokio::spawn(driver.run());
        channel
    }

    pub fn remote(&self) -> PeerIdentity {
        self.inner.remote
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Outbound calls still waiting for their reply
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.count()
    }

    /// Single request, single response
    pub async fn call(&self, method: &str, args: Bytes) -> Result<Bytes, RpcError> {
        let (_, rx) = self
            .open(CallKind::Async, method, args, |pending, id| {
                pending.register_single(id, method)
            })
            .await?;
        rx.await.map_err(|_| RpcError::ConnectionClosed)?
    }

    /// Typed variant of [`RpcChannel::call`]
    pub async fn request<A, R>(&self, method: &str, args: &A) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let reply = self.call(method, encode_payload(args)?).await?;
        Ok(decode_payload(&reply)?)
    }

    /// Single request, stream of responses
    pub async fn stream(&self, method: &str, args: Bytes) -> Result<RpcStream, RpcError> {
        let (id, rx) = self
            .open(CallKind::Source, method, args, |pending, id| {
                pending.register_stream(id, method)
            })
            .await?;
        Ok(RpcStream::outbound(id, rx, self.clone()))
    }

    /// Streams in both directions
    pub async fn duplex(
        &self,
        method: &str,
        args: Bytes,
    ) -> Result<(DuplexSink, RpcStream), RpcError> {
        let (id, rx) = self
            .open(CallKind::Duplex, method, args, |pending, id| {
                pending.register_stream(id, method)
            })
            .await?;
        Ok((
            DuplexSink::new(id, self.clone()),
            RpcStream::outbound(id, rx, self.clone()),
        ))
    }

    /// Stream of requests, single response
    pub async fn sink(&self, method: &str, args: Bytes) -> Result<(DuplexSink, SinkReply), RpcError> {
        let (id, rx) = self
            .open(CallKind::Sink, method, args, |pending, id| {
                pending.register_single(id, method)
            })
            .await?;
        Ok((DuplexSink::new(id, self.clone()), SinkReply { rx }))
    }

    /// Fire and forget
    pub async fn notify(&self, method: &str, args: Bytes) -> Result<(), RpcError> {
        self.open(CallKind::Notify, method, args, |_, _| ()).await?;
        Ok(())
    }

    /// Close the channel: pending calls fail with `ConnectionClosed` and
    /// every running inbound call is cancelled. Idempotent.
    pub fn close(&self) {
        if !self.inner.shutdown.is_cancelled() {
            debug!(peer = %self.inner.remote, "Closing channel");
        }
        self.inner.shutdown_all();
    }

    /// Resolves once the channel has shut down
    pub async fn closed(&self) {
        self.inner.terminated.cancelled().await
    }

    /// Allocate an id, register the call and queue its opening frame. The
    /// remote requires ids in increasing order, so all three happen under
    /// the opening lock.
    async fn open<T>(
        &self,
        kind: CallKind,
        method: &str,
        args: Bytes,
        register: impl FnOnce(&PendingCalls, RequestId) -> T,
    ) -> Result<(RequestId, T), RpcError> {
        let _opening = self.inner.opening.lock().await;
        let id = self.inner.ids.allocate()?;
        let registered = register(&self.inner.pending, id);

        trace!(peer = %self.inner.remote, request_id = id, method = %method, "Opening call");
        if let Err(e) = self.enqueue(Frame::call(id, kind, method, args)).await {
            self.inner.pending.cancel(id);
            return Err(e);
        }
        Ok((id, registered))
    }

    pub(crate) async fn enqueue(&self, frame: Frame) -> Result<(), RpcError> {
        self.inner.enqueue(frame).await
    }

    /// Abort an outbound call
    pub(crate) fn abort_call(&self, id: RequestId) {
        if !self.inner.pending.cancel(id) {
            return;
        }
        self.inner.aborted.insert(id);

        let frame = Frame::abort(id);
        match self.inner.writer.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                // Queue is full; wait for room off the caller's path
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let inner = self.inner.clone();
                    handle.spawn(async move {
                        let _ = inner.enqueue(frame).await;
                    });
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("remote", &self.inner.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl std::fmt::Debug for ChannelDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelDriver")
            .field("remote", &self.inner.remote)
            .field("drain_timeout", &self.drain_timeout)
            .finish_non_exhaustive()
    }
}

impl ChannelInner {
    pub(crate) async fn enqueue(&self, frame: Frame) -> Result<(), RpcError> {
        if self.shutdown.is_cancelled() {
            return Err(RpcError::ConnectionClosed);
        }
        self.writer
            .send(frame)
            .await
            .map_err(|_| RpcError::ConnectionClosed)
    }

    fn shutdown_all(&self) {
        // Inbound call tokens are children of this one
        self.shutdown.cancel();
        self.pending.fail_all();
        self.inbound.clear();
        self.aborted.clear();
    }

    fn violation(&self, reason: &str) {
        warn!(peer = %self.remote, reason = %reason, "Protocol violation, closing channel");
        self.shutdown_all();
    }

    /// Route one received frame. An `Err` is a protocol violation; a
    /// `Blocked` delivery must complete before the next frame is read.
    fn handle_frame(self: &Arc<Self>, frame: Frame) -> Result<Delivery, String> {
        if frame.is_reply() {
            self.handle_reply(frame)
        } else {
            self.handle_request_frame(frame)
        }
    }

    fn handle_reply(&self, frame: Frame) -> Result<Delivery, String> {
        let id = frame.request_id;
        match frame.kind {
            FrameKind::Data | FrameKind::End | FrameKind::Error => {
                let kind = frame.kind;
                let delivery = self.pending.deliver(id, kind, frame.payload);
                if delivery.is_known() {
                    return Ok(delivery);
                }
                if self.aborted.contains(&id) {
                    if kind != FrameKind::Data {
                        self.aborted.remove(&id);
                    }
                    trace!(request_id = id, "Dropping frame for aborted call");
                    return Ok(Delivery::Delivered);
                }
                Err(format!("{:?} reply for unknown request {}", kind, id))
            }
            FrameKind::Abort => Err(format!("abort sent as reply for request {}", id)),
            kind => Err(format!("{:?} frame marked as reply", kind)),
        }
    }

    fn handle_request_frame(self: &Arc<Self>, frame: Frame) -> Result<Delivery, String> {
        let id = frame.request_id;
        let highest = self.highest_inbound.load(Ordering::SeqCst);

        if let Some(kind) = frame.kind.call_kind() {
            if id <= highest {
                return Err(format!(
                    "request id {} not above previous request {}",
                    id, highest
                ));
            }
            self.highest_inbound.store(id, Ordering::SeqCst);
            self.dispatch(id, kind, frame.method, frame.payload);
            return Ok(Delivery::Delivered);
        }

        match frame.kind {
            FrameKind::Abort => {
                if let Some((_, call)) = self.inbound.remove(&id) {
                    debug!(peer = %self.remote, request_id = id, "Caller aborted call");
                    call.responder.abort();
                }
                Ok(Delivery::Delivered)
            }
            kind => {
                let event = match kind {
                    FrameKind::Data => StreamEvent::Item(frame.payload),
                    FrameKind::Error => StreamEvent::Error(error_from_payload(&frame.payload)),
                    _ => StreamEvent::End,
                };
                match self.inbound.get(&id) {
                    Some(call) => match &call.incoming {
                        Some(tx) => Ok(offer(tx, event)),
                        None => Err(format!("{:?} frame on request {} that takes no input", kind, id)),
                    },
                    None if id != 0 && id <= highest => {
                        trace!(request_id = id, "Dropping late frame for finished call");
                        Ok(Delivery::Delivered)
                    }
                    None => Err(format!("{:?} frame for unknown request {}", kind, id)),
                }
            }
        }
    }

    fn dispatch(self: &Arc<Self>, id: RequestId, kind: CallKind, method: String, args: Bytes) {
        let cancel = self.shutdown.child_token();
        let responder = ResponseSink::new(self.clone(), id, kind, cancel.clone());

        let (incoming_tx, incoming) = if kind.caller_streams() {
            let (tx, rx) = mpsc::channel(self.stream_capacity);
            (Some(tx), Some(RpcStream::inbound(id, rx)))
        } else {
            (None, None)
        };

        if kind != CallKind::Notify {
            self.inbound.insert(
                id,
                InboundCall {
                    incoming: incoming_tx,
                    responder: responder.clone(),
                },
            );
        }

        trace!(peer = %self.remote, request_id = id, method = %method, ?kind, "Dispatching call");

        let call = IncomingCall {
            id,
            method,
            kind,
            args,
            channel: RpcChannel {
                inner: self.clone(),
            },
            responder: responder.clone(),
            incoming,
            cancel,
        };

        let handler = self.handler.clone();
        let inner = self.clone();
        tokio::spawn(async move {
            handler.handle(call).await;
            responder.finish_default().await;
            inner.inbound.remove(&id);
        });
    }
}

impl ChannelDriver {
    /// Run until the remote closes the stream, a protocol violation occurs or
    /// the channel is closed locally.
    pub async fn run(self) {
        let ChannelDriver {
            inner,
            mut reader,
            writer,
            outbound,
            drain_timeout,
        } = self;

        let writer_task = tokio::spawn(write_loop(
            writer,
            outbound,
            inner.shutdown.clone(),
            drain_timeout,
        ));

        loop {
            tokio::select! {
                biased;
                _ = inner.shutdown.cancelled() => break,
                next = reader.next() => match next {
                    Some(Ok(frame)) => match inner.handle_frame(frame) {
                        Ok(Delivery::Blocked(backlog)) => {
                            // Stop reading until the consumer makes room
                            tokio::select! {
                                biased;
                                _ = inner.shutdown.cancelled() => break,
                                _ = backlog.deliver() => {}
                            }
                        }
                        Ok(_) => {}
                        Err(reason) => {
                            inner.violation(&reason);
                            break;
                        }
                    },
                    Some(Err(CodecError::Io(e))) => {
                        debug!(peer = %inner.remote, error = %e, "Channel read failed");
                        break;
                    }
                    Some(Err(e)) => {
                        inner.violation(&e.to_string());
                        break;
                    }
                    None => {
                        debug!(peer = %inner.remote, "Remote closed the channel");
                        break;
                    }
                }
            }
        }

        inner.shutdown_all();
        let _ = writer_task.await;
        inner.terminated.cancel();
        debug!(peer = %inner.remote, "Channel terminated");
    }
}

async fn write_loop(
    mut writer: FramedWrite<WriteHalf<BoxedIo>, FrameCodec>,
    mut outbound: mpsc::Receiver<Frame>,
    shutdown: CancellationToken,
    drain_timeout: Duration,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = writer.send(frame).await {
                        debug!(error = %e, "Channel write failed");
                        shutdown.cancel();
                        return;
                    }
                }
                None => break,
            }
        }
    }

    // Flush what was queued before the shutdown
    let drain = async {
        while let Ok(frame) = outbound.try_recv() {
            if writer.feed(frame).await.is_err() {
                return;
            }
        }
        let _ = writer.flush().await;
        let _ = writer.get_mut().shutdown().await;
    };
    let _ = tokio::time::timeout(drain_timeout, drain).await;
}
