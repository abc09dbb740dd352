//! Pending calls tracker
//!
//! Tracks requests this side opened and routes reply frames back to the waiting caller.

use crate::error::RpcError;
use crate::stream::{offer, Backlog, StreamEvent};
use bytes::Bytes;
use dashmap::DashMap;
use room_proto::{decode_payload, FrameKind, RequestId, RoomError, RpcErrorBody};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Allocates request ids: 1, 2, 3, ... and never reuses one
#[derive(Debug)]
pub struct RequestIds {
    next: AtomicU32,
}

impl RequestIds {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: RequestId) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }

    /// Next id. Once `u32::MAX` has been handed out the allocator is exhausted.
    pub fn allocate(&self) -> Result<RequestId, RpcError> {
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| {
                if id == 0 {
                    None
                } else {
                    Some(id.wrapping_add(1))
                }
            })
            .map_err(|_| RpcError::RequestIdsExhausted)
    }

    /// Whether `id` has been handed out already
    pub fn issued(&self, id: RequestId) -> bool {
        let next = self.next.load(Ordering::SeqCst);
        id != 0 && (next == 0 || id < next)
    }
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Events buffered per streaming call before the reader waits
pub const DEFAULT_STREAM_CAPACITY: usize = 64;

enum ReplySink {
    Single(oneshot::Sender<Result<Bytes, RpcError>>),
    Stream(mpsc::Sender<StreamEvent>),
}

/// Outcome of routing a reply frame
#[derive(Debug)]
pub enum Delivery {
    /// Handed to the caller, or dropped because the caller stopped listening
    Delivered,
    /// The caller's queue is full; the event waits in the backlog
    Blocked(Backlog),
    /// No call is pending under this id
    Unknown,
}

impl Delivery {
    pub fn is_known(&self) -> bool {
        !matches!(self, Delivery::Unknown)
    }
}

struct PendingCall {
    method: String,
    sink: ReplySink,
}

/// Outbound calls awaiting replies
#[derive(Clone)]
pub struct PendingCalls {
    calls: Arc<DashMap<RequestId, PendingCall>>,
    stream_capacity: usize,
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::with_stream_capacity(DEFAULT_STREAM_CAPACITY)
    }
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stream_capacity(stream_capacity: usize) -> Self {
        Self {
            calls: Arc::new(DashMap::new()),
            stream_capacity: stream_capacity.max(1),
        }
    }

    /// Register a call answered by a single value
    pub fn register_single(
        &self,
        id: RequestId,
        method: &str,
    ) -> oneshot::Receiver<Result<Bytes, RpcError>> {
        let (tx, rx) = oneshot::channel();
        self.calls.insert(
            id,
            PendingCall {
                method: method.to_string(),
                sink: ReplySink::Single(tx),
            },
        );
        trace!(request_id = id, method = %method, "Registered pending call");
        rx
    }

    /// Register a call answered by a stream
    pub fn register_stream(
        &self,
        id: RequestId,
        method: &str,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(self.stream_capacity);
        self.calls.insert(
            id,
            PendingCall {
                method: method.to_string(),
                sink: ReplySink::Stream(tx),
            },
        );
        trace!(request_id = id, method = %method, "Registered pending stream");
        rx
    }

    /// Route a reply frame
    pub fn deliver(&self, id: RequestId, kind: FrameKind, payload: Bytes) -> Delivery {
        let streaming = match self.calls.get(&id) {
            Some(call) => match &call.sink {
                ReplySink::Stream(tx) => Some(tx.clone()),
                ReplySink::Single(_) => None,
            },
            None => return Delivery::Unknown,
        };

        if let (Some(tx), FrameKind::Data) = (&streaming, kind) {
            return offer(tx, StreamEvent::Item(payload));
        }

        let Some((_, call)) = self.calls.remove(&id) else {
            return Delivery::Unknown;
        };

        match (call.sink, kind) {
            (ReplySink::Single(tx), FrameKind::Data) => {
                let _ = tx.send(Ok(payload));
            }
            (ReplySink::Single(tx), FrameKind::Error) => {
                let _ = tx.send(Err(RpcError::Remote(error_from_payload(&payload))));
            }
            (ReplySink::Single(tx), _) => {
                let _ = tx.send(Err(RpcError::Remote(RoomError::Internal(format!(
                    "{} ended without a reply",
                    call.method
                )))));
            }
            (ReplySink::Stream(tx), FrameKind::Error) => {
                return offer(&tx, StreamEvent::Error(error_from_payload(&payload)));
            }
            (ReplySink::Stream(tx), _) => return offer(&tx, StreamEvent::End),
        }
        Delivery::Delivered
    }

    /// Forget a call without delivering anything
    pub fn cancel(&self, id: RequestId) -> bool {
        if let Some((_, call)) = self.calls.remove(&id) {
            debug!(request_id = id, method = %call.method, "Cancelled pending call");
            return true;
        }
        false
    }

    /// Fail every pending call with `ConnectionClosed`
    pub fn fail_all(&self) {
        let ids: Vec<RequestId> = self.calls.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, call)) = self.calls.remove(&id) {
                match call.sink {
                    ReplySink::Single(tx) => {
                        let _ = tx.send(Err(RpcError::ConnectionClosed));
                    }
                    // Dropping the sender ends the stream with ConnectionClosed
                    ReplySink::Stream(tx) => drop(tx),
                }
            }
        }
    }

    pub fn count(&self) -> usize {
        self.calls.len()
    }
}

/// Decode the body of an error frame
pub(crate) fn error_from_payload(payload: &[u8]) -> RoomError {
    match decode_payload::<RpcErrorBody>(payload) {
        Ok(body) => RoomError::from_body(body),
        Err(e) => RoomError::Internal(format!("malformed error body: {}", e)),
    }
}
