//! Error types for the stream bridge and its host daemon.

use std::io;
use thiserror::Error;

/// Result type alias for daemon operations.
pub type Result<T> = std::result::Result<T, DaemonError>;

/// Top-level error type for the daemon.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Socket error: {0}")]
    Socket(String),
}

/// Errors during fd handoff from Apache.
#[derive(Error, Debug)]
pub enum HandoffError {
    #[error("Failed to receive fd: {0}")]
    ReceiveFailed(String),

    #[error("No file descriptor received")]
    NoFileDescriptor,

    #[error("Invalid socket type: expected SOCK_STREAM")]
    InvalidSocketType,

    #[error("Control message truncated")]
    ControlMessageTruncated,

    #[error("Data truncated (exceeded buffer size)")]
    DataTruncated,

    #[error("Handoff timeout")]
    Timeout,

    #[error("System error: {0}")]
    System(#[from] nix::Error),
}

/// Errors raised inside a generation collaborator.
///
/// These never reach the bridge as errors: generators turn them into a
/// single `StreamEvent::Error` carrying the display text.
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection failed: {0}")]
    Connection(String),
}

/// A frame payload could not be serialized.
#[derive(Error, Debug)]
#[error("Encoding error: {0}")]
pub struct EncodingError(#[from] serde_json::Error);

/// Failures writing to or closing a [`StreamSink`](crate::streaming::StreamSink).
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink already closed")]
    Closed,

    #[error("Client disconnected")]
    Disconnected,

    #[error("Write timeout")]
    Timeout,

    #[error("Write error: {0}")]
    Io(#[from] io::Error),
}

/// Fatal conditions inside the bridge itself.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Write(#[from] SinkError),
}
