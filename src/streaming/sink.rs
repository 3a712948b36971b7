//! Byte-writable, closable transports the bridge streams into.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::SinkError;
use crate::metrics;

/// Exclusive write access to one client transport.
///
/// `close` must be idempotent: closing an already-closed sink succeeds
/// without touching the transport again.
#[async_trait]
pub trait StreamSink: Send {
    /// Append bytes. Fails once closed or when the peer has gone away.
    async fn write(&mut self, data: Bytes) -> Result<(), SinkError>;

    /// Terminate the transport. The peer observes end-of-stream.
    async fn close(&mut self) -> Result<(), SinkError>;

    fn is_closed(&self) -> bool;
}

/// Unbuffered sink over an async writer with per-write timeout.
/// Writes go straight to the stream for lowest latency.
pub struct IoSink<W> {
    writer: W,
    write_timeout: Duration,
    bytes_written: u64,
    closed: bool,
}

impl<W: AsyncWrite + Unpin + Send> IoSink<W> {
    pub fn new(writer: W, write_timeout: Duration) -> Self {
        Self {
            writer,
            write_timeout,
            bytes_written: 0,
            closed: false,
        }
    }

    /// Write the HTTP preamble for an SSE response.
    pub async fn send_headers(&mut self) -> Result<(), SinkError> {
        self.write(Bytes::from_static(super::sse::SSE_HEADERS.as_bytes()))
            .await
    }

    /// Write a complete non-200 response and close.
    /// Used when the stream is refused before headers are sent.
    pub async fn reject(&mut self, status: u16, reason: &str) {
        let response = super::sse::format_error_response(status, reason);
        if let Err(e) = self.write(Bytes::from(response)).await {
            tracing::debug!(status, error = %e, "Failed to send error response to client");
        }
        let _ = self.close().await;
    }

    /// Total bytes written.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> StreamSink for IoSink<W> {
    async fn write(&mut self, data: Bytes) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed);
        }

        tokio::time::timeout(self.write_timeout, self.writer.write_all(&data))
            .await
            .map_err(|_| SinkError::Timeout)?
            .map_err(classify_io_error)?;

        self.bytes_written += data.len() as u64;
        metrics::record_bytes_sent(data.len() as u64);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        if self.closed {
            return Ok(());
        }
        // Mark first: a failed shutdown still leaves nothing writable.
        self.closed = true;

        // Bounded so a slow or broken client cannot hang the close
        tokio::time::timeout(self.write_timeout, self.writer.shutdown())
            .await
            .map_err(|_| SinkError::Timeout)?
            .map_err(classify_io_error)
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

fn classify_io_error(err: io::Error) -> SinkError {
    match err.kind() {
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => SinkError::Disconnected,
        io::ErrorKind::TimedOut => SinkError::Timeout,
        _ => SinkError::Io(err),
    }
}

/// Sink that forwards frames into an in-process channel.
///
/// Suits hosts whose response body is itself a stream. Closing drops the
/// sender so the receiver sees end-of-stream.
pub struct ChannelSink {
    tx: Option<mpsc::Sender<Bytes>>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }
}

#[async_trait]
impl StreamSink for ChannelSink {
    async fn write(&mut self, data: Bytes) -> Result<(), SinkError> {
        let tx = self.tx.as_ref().ok_or(SinkError::Closed)?;
        let len = data.len() as u64;
        tx.send(data).await.map_err(|_| SinkError::Disconnected)?;
        metrics::record_bytes_sent(len);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.tx = None;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}
