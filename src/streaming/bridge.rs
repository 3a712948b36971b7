//! The bridge from generation events to an SSE client stream.
//!
//! A [`StreamBridge`] owns one [`StreamSink`] for the lifetime of one
//! generation. It consumes events strictly one at a time, writes the encoded
//! frame, and closes the sink on the first terminal condition. Once terminal,
//! nothing further reaches the sink.

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::event::{EventHandler, EventReceiver, StreamEvent, Token};
use super::sink::StreamSink;
use super::sse;
use crate::error::{BridgeError, SinkError};
use crate::metrics::{self, ErrorReason};

/// Error frame sent when the generator disappears without a terminal event.
pub const PRODUCER_GONE_MESSAGE: &str = "generation ended unexpectedly";
/// Error frame sent when the generator stays silent past the idle timeout.
pub const IDLE_TIMEOUT_MESSAGE: &str = "upstream timeout";
/// Error frame sent when the daemon shuts down mid-stream.
pub const SHUTDOWN_MESSAGE: &str = "server shutting down";

/// Lifecycle of one bridge. `Closed` and `Errored` both leave the sink
/// closed; they differ only for logging and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Closed,
    Errored,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        self != StreamState::Open
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamState::Open => "open",
            StreamState::Closed => "closed",
            StreamState::Errored => "errored",
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a bridge left `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalCause {
    Completed,
    Upstream,
    WriteFailed,
    EncodingFailed,
    ProducerGone,
    IdleTimeout,
    Shutdown,
}

impl TerminalCause {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminalCause::Completed => "completed",
            TerminalCause::Upstream => "upstream",
            TerminalCause::WriteFailed => "write_failed",
            TerminalCause::EncodingFailed => "encoding_failed",
            TerminalCause::ProducerGone => "producer_gone",
            TerminalCause::IdleTimeout => "idle_timeout",
            TerminalCause::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for TerminalCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signal asking the generation collaborator to stop producing.
pub trait AbortSignal: Send + Sync {
    fn abort(&self);
}

impl AbortSignal for CancellationToken {
    fn abort(&self) {
        self.cancel();
    }
}

/// Summary of a finished bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeReport {
    pub state: StreamState,
    pub cause: Option<TerminalCause>,
    /// Frames fully written to the sink.
    pub frames: u64,
    pub bytes: u64,
    /// Events delivered after the bridge went terminal.
    pub ignored: u64,
    /// Time from the start of `run` to the first token received.
    pub first_token: Option<Duration>,
}

/// Drives one sink from one stream of generation events.
pub struct StreamBridge<S> {
    sink: S,
    state: StreamState,
    cause: Option<TerminalCause>,
    abort: Option<Box<dyn AbortSignal>>,
    idle_timeout: Option<Duration>,
    shutdown: Option<watch::Receiver<bool>>,
    frames: u64,
    bytes: u64,
    ignored: u64,
    first_token: Option<Duration>,
}

impl<S: StreamSink> StreamBridge<S> {
    /// Take exclusive ownership of `sink` for one generation.
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            state: StreamState::Open,
            cause: None,
            abort: None,
            idle_timeout: None,
            shutdown: None,
            frames: 0,
            bytes: 0,
            ignored: 0,
            first_token: None,
        }
    }

    /// Signal fired (at most once) when the client transport fails.
    pub fn with_abort(mut self, abort: impl AbortSignal + 'static) -> Self {
        self.abort = Some(Box::new(abort));
        self
    }

    /// Fail the stream if no event arrives within `timeout` while running.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// End the stream with an error frame once `shutdown` turns true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn cause(&self) -> Option<TerminalCause> {
        self.cause
    }

    pub fn report(&self) -> BridgeReport {
        BridgeReport {
            state: self.state,
            cause: self.cause,
            frames: self.frames,
            bytes: self.bytes,
            ignored: self.ignored,
            first_token: self.first_token,
        }
    }

    /// Give the sink back, e.g. to inspect what was written.
    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Apply one event. Events arriving after a terminal transition are
    /// logged and dropped.
    pub async fn handle(&mut self, event: StreamEvent) -> StreamState {
        if self.state.is_terminal() {
            self.ignored += 1;
            metrics::record_ignored_event();
            tracing::warn!(
                event = event.kind(),
                state = %self.state,
                "Event after stream end ignored"
            );
            return self.state;
        }

        match event {
            StreamEvent::Token(token) => self.forward_token(token).await,
            StreamEvent::End => self.finish(StreamState::Closed, TerminalCause::Completed).await,
            StreamEvent::Error { message } => self.fail(&message, TerminalCause::Upstream).await,
        }
        self.state
    }

    /// Drain `events` in order until the stream is terminal.
    ///
    /// Also ends the stream with an error frame if the producer drops its
    /// sender early, goes idle past the idle timeout, or shutdown is
    /// signaled.
    pub async fn run(mut self, mut events: EventReceiver) -> BridgeReport {
        let started = Instant::now();
        while !self.state.is_terminal() {
            let next = tokio::select! {
                biased;

                _ = shutdown_signaled(&mut self.shutdown) => Next::Shutdown,

                event = recv_with_idle(&mut events, self.idle_timeout) => match event {
                    Ok(Some(event)) => Next::Event(event),
                    Ok(None) => Next::ProducerGone,
                    Err(()) => Next::IdleTimeout,
                },
            };

            match next {
                Next::Event(event) => {
                    if matches!(event, StreamEvent::Token(_)) {
                        self.first_token.get_or_insert_with(|| started.elapsed());
                    }
                    self.handle(event).await;
                }
                Next::ProducerGone => {
                    tracing::warn!("Event channel closed without a terminal event");
                    self.fail(PRODUCER_GONE_MESSAGE, TerminalCause::ProducerGone)
                        .await;
                }
                Next::IdleTimeout => {
                    tracing::warn!(
                        timeout = ?self.idle_timeout,
                        "No event from generator within idle timeout"
                    );
                    self.fail(IDLE_TIMEOUT_MESSAGE, TerminalCause::IdleTimeout)
                        .await;
                    self.fire_abort();
                }
                Next::Shutdown => {
                    tracing::info!("Shutdown signaled, closing stream");
                    self.fail(SHUTDOWN_MESSAGE, TerminalCause::Shutdown).await;
                    self.fire_abort();
                }
            }
        }

        // Stop the producer and account for anything it already queued.
        events.close();
        while let Some(event) = events.try_recv() {
            self.handle(event).await;
        }

        self.report()
    }

    async fn forward_token(&mut self, token: Token) {
        if let Err(e) = self.emit(&StreamEvent::Token(token)).await {
            match e {
                BridgeError::Encoding(e) => {
                    tracing::error!(error = %e, "Failed to encode token frame");
                    self.finish(StreamState::Errored, TerminalCause::EncodingFailed)
                        .await;
                }
                BridgeError::Write(e) => {
                    metrics::record_write_error(ErrorReason::from_sink_error(&e));
                    tracing::warn!(error = %e, "Client write error");
                    self.finish(StreamState::Errored, TerminalCause::WriteFailed)
                        .await;
                }
            }
            self.fire_abort();
        }
    }

    /// Best-effort error frame, then close.
    async fn fail(&mut self, message: &str, cause: TerminalCause) {
        match self.emit(&StreamEvent::error(message)).await {
            Ok(()) => {}
            Err(BridgeError::Encoding(e)) => {
                tracing::error!(error = %e, "Failed to encode error frame");
            }
            Err(BridgeError::Write(e)) => {
                tracing::debug!(error = %e, "Failed to deliver error frame");
            }
        }
        self.finish(StreamState::Errored, cause).await;
    }

    async fn emit(&mut self, event: &StreamEvent) -> Result<(), BridgeError> {
        if let Some(frame) = sse::encode(event)? {
            let len = frame.len() as u64;
            self.sink.write(frame).await?;
            self.frames += 1;
            self.bytes += len;
            metrics::record_frame_sent();
        }
        Ok(())
    }

    /// The single terminal transition.
    async fn finish(&mut self, state: StreamState, cause: TerminalCause) {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.cause = Some(cause);

        if let Err(e) = self.sink.close().await {
            // The transport may already be broken; it is closed either way.
            if !matches!(e, SinkError::Closed) {
                tracing::debug!(error = %e, "Sink close failed");
            }
        }

        tracing::debug!(
            state = %state,
            cause = %cause,
            frames = self.frames,
            "Stream terminated"
        );
    }

    fn fire_abort(&mut self) {
        if let Some(abort) = self.abort.take() {
            metrics::record_upstream_abort();
            tracing::debug!("Aborting upstream generation");
            abort.abort();
        }
    }
}

#[async_trait]
impl<S: StreamSink> EventHandler for StreamBridge<S> {
    async fn on_token(&mut self, token: Token) {
        self.handle(StreamEvent::Token(token)).await;
    }

    async fn on_end(&mut self) {
        self.handle(StreamEvent::End).await;
    }

    async fn on_error(&mut self, message: String) {
        self.handle(StreamEvent::Error { message }).await;
    }
}

enum Next {
    Event(StreamEvent),
    ProducerGone,
    IdleTimeout,
    Shutdown,
}

async fn recv_with_idle(
    events: &mut EventReceiver,
    idle: Option<Duration>,
) -> Result<Option<StreamEvent>, ()> {
    match idle {
        Some(d) => tokio::time::timeout(d, events.recv()).await.map_err(|_| ()),
        None => Ok(events.recv().await),
    }
}

/// Resolves once shutdown is signaled; never resolves without a receiver
/// or after the coordinator is gone.
async fn shutdown_signaled(shutdown: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = shutdown {
        let closed = rx.wait_for(|down| *down).await.is_err();
        if !closed {
            return;
        }
    }
    std::future::pending::<()>().await
}
