//! TCP dialer and listener

use crate::{BoxedIo, Dialer, TransportError, TransportResult};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Dials TCP addresses
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, address: &str) -> TransportResult<(BoxedIo, Option<SocketAddr>)> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Dial(format!("{}: {}", address, e)))?;

        let _ = stream.set_nodelay(true);
        let peer_addr = stream.peer_addr().ok();
        debug!(address = %address, "TCP connection established");

        Ok((Box::new(stream), peer_addr))
    }
}

/// Accepts raw TCP connections. The handshake runs separately so a slow
/// peer never blocks the accept loop.
#[derive(Debug)]
pub struct TcpRoomListener {
    listener: TcpListener,
}

impl TcpRoomListener {
    pub async fn bind(addr: SocketAddr) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept(&self) -> TransportResult<(BoxedIo, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        let _ = stream.set_nodelay(true);
        Ok((Box::new(stream), addr))
    }
}
