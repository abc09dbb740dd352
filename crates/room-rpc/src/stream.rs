//! Streaming halves of source, sink and duplex calls

use crate::channel::RpcChannel;
use crate::error::RpcError;
use crate::pending::Delivery;
use bytes::Bytes;
use futures::Stream;
use room_proto::{decode_payload, encode_payload, Frame, RequestId, RoomError};
use serde::{de::DeserializeOwned, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// One event on a call's stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Item(Bytes),
    End,
    Error(RoomError),
}

/// An event that did not fit in its call's queue
///
/// The reader holds on to it, and reads nothing else from the connection,
/// until the consumer makes room or goes away.
#[derive(Debug)]
pub struct Backlog {
    tx: mpsc::Sender<StreamEvent>,
    event: StreamEvent,
}

impl Backlog {
    /// Wait for room in the queue. Returns at once if the consumer is gone.
    pub async fn deliver(self) {
        let _ = self.tx.send(self.event).await;
    }
}

/// Queue `event` without waiting
pub(crate) fn offer(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> Delivery {
    match tx.try_send(event) {
        Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Delivered,
        Err(mpsc::error::TrySendError::Full(event)) => Delivery::Blocked(Backlog {
            tx: tx.clone(),
            event,
        }),
    }
}

/// Receiving half of a streaming call
///
/// Yields `Ok` items until the other side ends the stream. An error frame
/// yields one `Err` and ends the stream. If the channel goes away before the
/// stream ended, the last item is `Err(ConnectionClosed)`.
///
/// Dropping an unfinished stream opened by this side aborts the call.
///
/// Only a bounded number of events is buffered per stream. Once that fills
/// up the channel stops reading from the connection until this stream is
/// polled, so a stream left unread stalls its sender.
pub struct RpcStream {
    id: RequestId,
    rx: mpsc::Receiver<StreamEvent>,
    done: bool,
    /// Set for streams this side opened
    owner: Option<RpcChannel>,
}

impl RpcStream {
    pub(crate) fn outbound(
        id: RequestId,
        rx: mpsc::Receiver<StreamEvent>,
        channel: RpcChannel,
    ) -> Self {
        Self {
            id,
            rx,
            done: false,
            owner: Some(channel),
        }
    }

    pub(crate) fn inbound(id: RequestId, rx: mpsc::Receiver<StreamEvent>) -> Self {
        Self {
            id,
            rx,
            done: false,
            owner: None,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.done
    }

    /// Next item, decoded
    pub async fn next_value<T: DeserializeOwned>(&mut self) -> Option<Result<T, RpcError>> {
        let item = futures::StreamExt::next(self).await?;
        Some(item.and_then(|bytes| decode_payload(&bytes).map_err(RpcError::from)))
    }

    /// Stop the stream. The remote is told to stop sending; frames already in
    /// flight are dropped.
    pub fn abort(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.rx.close();
        if let Some(channel) = &self.owner {
            channel.abort_call(self.id);
        }
    }
}

impl Stream for RpcStream {
    type Item = Result<Bytes, RpcError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(StreamEvent::Item(bytes))) => Poll::Ready(Some(Ok(bytes))),
            Poll::Ready(Some(StreamEvent::End)) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(StreamEvent::Error(err))) => {
                self.done = true;
                Poll::Ready(Some(Err(RpcError::Remote(err))))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(Some(Err(RpcError::ConnectionClosed)))
            }
        }
    }
}

impl Drop for RpcStream {
    fn drop(&mut self) {
        self.abort();
    }
}

impl std::fmt::Debug for RpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcStream")
            .field("id", &self.id)
            .field("done", &self.done)
            .finish()
    }
}

/// Sending half of a sink or duplex call opened by this side
#[derive(Clone, Debug)]
pub struct DuplexSink {
    id: RequestId,
    channel: RpcChannel,
}

impl DuplexSink {
    pub(crate) fn new(id: RequestId, channel: RpcChannel) -> Self {
        Self { id, channel }
    }

    pub fn request_id(&self) -> RequestId {
        self.id
    }

    pub async fn send(&self, payload: Bytes) -> Result<(), RpcError> {
        self.channel.enqueue(Frame::data(self.id, payload)).await
    }

    pub async fn send_value<T: Serialize>(&self, value: &T) -> Result<(), RpcError> {
        self.send(encode_payload(value)?).await
    }

    /// Finish this side of the call
    pub async fn end(&self) -> Result<(), RpcError> {
        self.channel.enqueue(Frame::end(self.id)).await
    }

    pub async fn error(&self, err: RoomError) -> Result<(), RpcError> {
        let body = encode_payload(&err.to_body())?;
        self.channel.enqueue(Frame::error(self.id, body)).await
    }
}
