//! Multiplexed RPC channel
//!
//! One [`RpcChannel`] runs over one authenticated byte stream and carries any
//! number of concurrent calls in both directions. Calls come in five shapes
//! (async, source, sink, duplex, notify); every frame of a call shares its
//! request id, and frames written by the callee carry the reply flag.

pub mod channel;
pub mod error;
pub mod handler;
pub mod io;
pub mod pending;
pub mod stream;

pub use channel::{ChannelConfig, ChannelDriver, RpcChannel, SinkReply};
pub use error::RpcError;
pub use io::CallIo;
pub use handler::{IncomingCall, ResponseSink, RpcHandler, UnhandledCalls};
pub use pending::{Delivery, PendingCalls, RequestIds, DEFAULT_STREAM_CAPACITY};
pub use stream::{Backlog, DuplexSink, RpcStream, StreamEvent};
