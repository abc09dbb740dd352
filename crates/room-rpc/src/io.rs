//! Byte stream carried by a duplex call
//!
//! [`CallIo`] lets anything that speaks `AsyncRead + AsyncWrite` run over the
//! two halves of a duplex call, such as a tunnel relayed by a room. Reads
//! yield the remote's data frames in order; end of stream is the remote's end
//! frame. Writes become data frames; shutting down the writer ends our side.

use crate::handler::ResponseSink;
use crate::stream::{DuplexSink, RpcStream};
use crate::error::RpcError;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tokio_util::sync::PollSender;
use tracing::trace;

/// Chunks waiting to be written as frames
const WRITE_QUEUE: usize = 16;

/// Largest payload written as one frame
const MAX_CHUNK: usize = 64 * 1024;

enum CallWriter {
    Caller(DuplexSink),
    Callee(ResponseSink),
}

impl CallWriter {
    async fn send(&self, chunk: Bytes) -> Result<(), RpcError> {
        match self {
            CallWriter::Caller(sink) => sink.send(chunk).await,
            CallWriter::Callee(sink) => sink.send(chunk).await,
        }
    }

    async fn end(&self) -> Result<(), RpcError> {
        match self {
            CallWriter::Caller(sink) => sink.end().await,
            CallWriter::Callee(sink) => sink.end().await,
        }
    }
}

/// `AsyncRead + AsyncWrite` over a duplex call
pub struct CallIo {
    reader: StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>,
    writer: PollSender<Bytes>,
}

impl CallIo {
    /// Byte stream over a duplex call this side opened. Needs a tokio runtime.
    pub fn caller(sink: DuplexSink, stream: RpcStream) -> Self {
        Self::new(CallWriter::Caller(sink), stream)
    }

    /// Byte stream over a duplex call the remote opened. Needs a tokio runtime.
    pub fn callee(sink: ResponseSink, stream: RpcStream) -> Self {
        Self::new(CallWriter::Callee(sink), stream)
    }

    fn new(writer: CallWriter, stream: RpcStream) -> Self {
        let (tx, mut rx) = mpsc::channel::<Bytes>(WRITE_QUEUE);
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if let Err(e) = writer.send(chunk).await {
                    trace!(error = %e, "Call closed under byte stream");
                    return;
                }
            }
            let _ = writer.end().await;
        });

        let items = stream
            .map(|item| item.map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e)))
            .boxed();

        Self {
            reader: StreamReader::new(items),
            writer: PollSender::new(tx),
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, RpcError::ConnectionClosed)
}

impl AsyncRead for CallIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for CallIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(self.writer.poll_reserve(cx)).map_err(|_| closed())?;

        let len = buf.len().min(MAX_CHUNK);
        self.writer
            .send_item(Bytes::copy_from_slice(&buf[..len]))
            .map_err(|_| closed())?;
        Poll::Ready(Ok(len))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.writer.close();
        Poll::Ready(Ok(()))
    }
}

impl std::fmt::Debug for CallIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallIo").finish_non_exhaustive()
    }
}
