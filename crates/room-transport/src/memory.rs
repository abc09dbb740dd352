//! In-process transport built on `tokio::io::duplex`

use crate::{BoxedIo, Dialer, TransportError, TransportResult};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::sync::{mpsc, Mutex};

const PIPE_CAPACITY: usize = 64 * 1024;

/// A connected pair of in-memory byte streams
pub fn pipe() -> (BoxedIo, BoxedIo) {
    let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
    (Box::new(a), Box::new(b))
}

/// Create a dialer/listener pair. Every dial hands one end of a fresh pipe to
/// the listener; the address is ignored.
pub fn listener() -> (MemoryDialer, MemoryListener) {
    let (tx, rx) = mpsc::channel(16);
    (
        MemoryDialer { tx },
        MemoryListener { rx: Mutex::new(rx) },
    )
}

#[derive(Debug, Clone)]
pub struct MemoryDialer {
    tx: mpsc::Sender<BoxedIo>,
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, address: &str) -> TransportResult<(BoxedIo, Option<SocketAddr>)> {
        let (local, remote) = pipe();
        self.tx
            .send(remote)
            .await
            .map_err(|_| TransportError::Dial(format!("{}: listener is gone", address)))?;
        Ok((local, None))
    }
}

#[derive(Debug)]
pub struct MemoryListener {
    rx: Mutex<mpsc::Receiver<BoxedIo>>,
}

impl MemoryListener {
    /// Next dialed stream, or `None` once every dialer is dropped
    pub async fn accept(&self) -> Option<BoxedIo> {
        self.rx.lock().await.recv().await
    }
}
