//! Per-connection handling: receive the handoff, then bridge one generation
//! onto the client socket.

use std::os::unix::io::AsRawFd;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::ServerConfig;
use crate::error::HandoffError;
use crate::generation::{GenerationRequest, Generator};
use crate::metrics::{self, ErrorReason, Timer};
use crate::server::handoff::{receive_handoff, Handoff};
use crate::shutdown::StreamGuard;
use crate::streaming::{event_channel, BridgeReport, IoSink, StreamBridge, StreamSink};

/// How long a generator may keep running after its stream has ended.
const GENERATOR_GRACE: Duration = Duration::from_secs(5);

/// Handles one handoff connection from Apache.
pub struct ConnectionHandler {
    config: ServerConfig,
    generator: Arc<dyn Generator>,
}

impl ConnectionHandler {
    pub fn new(config: ServerConfig, generator: Arc<dyn Generator>) -> Self {
        Self { config, generator }
    }

    /// Entry point for a connection: receive the client fd, stream one
    /// generation to it, close it. Errors and panics are logged, never
    /// propagated.
    pub async fn handle(&self, stream: UnixStream, guard: StreamGuard) {
        let conn_id = guard.id();
        let span = tracing::info_span!("connection", id = conn_id);

        let result = AssertUnwindSafe(self.handle_inner(stream, &guard).instrument(span))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(Some(report))) => {
                tracing::debug!(
                    id = conn_id,
                    state = %report.state,
                    frames = report.frames,
                    "Connection finished"
                );
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => {
                tracing::error!(id = conn_id, error = %e, "Connection error");
            }
            Err(panic) => {
                let panic_msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                tracing::error!(id = conn_id, panic = %panic_msg, "Connection handler panicked");
            }
        }
    }

    async fn handle_inner(
        &self,
        stream: UnixStream,
        guard: &StreamGuard,
    ) -> Result<Option<BridgeReport>, ConnectionError> {
        let handoff_timer = Timer::new();
        let handoff = receive_handoff(
            &stream,
            self.config.handoff_timeout(),
            self.config.handoff_buffer_size,
        )
        .await
        .map_err(|e| {
            metrics::record_handoff_error(ErrorReason::from_handoff_error(&e));
            ConnectionError::Handoff(e)
        })?;
        metrics::record_handoff_success(handoff_timer.elapsed());
        drop(stream);

        tracing::info!(
            client_fd = handoff.client_fd.as_raw_fd(),
            data_len = handoff.data_len,
            user_id = ?handoff.data.user_id,
            prompt_len = handoff.data.prompt.as_ref().map(|s| s.len()),
            "Received handoff"
        );

        self.stream_to_client(handoff, guard).await
    }

    async fn stream_to_client(
        &self,
        handoff: Handoff,
        guard: &StreamGuard,
    ) -> Result<Option<BridgeReport>, ConnectionError> {
        let Handoff { client_fd, data, .. } = handoff;

        let std_stream = std::net::TcpStream::from(client_fd);
        std_stream
            .set_nonblocking(true)
            .map_err(|e| ConnectionError::Stream(format!("Failed to set non-blocking: {}", e)))?;
        let tcp_stream = tokio::net::TcpStream::from_std(std_stream)
            .map_err(|e| ConnectionError::Stream(format!("Failed to create tokio stream: {}", e)))?;
        // Frames are small and latency-sensitive.
        let _ = tcp_stream.set_nodelay(true);

        let mut sink = IoSink::new(tcp_stream, self.config.write_timeout());

        if guard.is_shutdown() {
            sink.reject(503, "Server shutting down").await;
            return Ok(None);
        }

        sink.send_headers()
            .await
            .map_err(|e| ConnectionError::Stream(format!("Failed to send headers: {}", e)))?;

        let request = GenerationRequest::from_handoff(&data, guard.id());
        let report = self.bridge(sink, request, guard).await;
        Ok(Some(report))
    }

    /// Run one generation into `sink`: the generator on its own task, the
    /// bridge on this one.
    pub async fn bridge<S: StreamSink + 'static>(
        &self,
        sink: S,
        request: GenerationRequest,
        guard: &StreamGuard,
    ) -> BridgeReport {
        let timer = Timer::new();
        let request_id = request.request_id.clone();
        let (events, receiver) = event_channel(self.config.event_buffer);
        let abort = CancellationToken::new();

        let generator = self.generator.clone();
        let mut task = {
            let abort = abort.clone();
            tokio::spawn(async move { generator.generate(request, events, abort).await })
        };

        let mut bridge = StreamBridge::new(sink)
            .with_abort(abort.clone())
            .with_shutdown(guard.subscribe());
        if let Some(idle) = self.config.idle_timeout() {
            bridge = bridge.with_idle_timeout(idle);
        }

        let report = bridge.run(receiver).await;
        if let Some(first) = report.first_token {
            metrics::record_first_token(self.generator.name(), first);
        }

        // The stream is over either way; make sure the generator winds down.
        abort.cancel();
        match tokio::time::timeout(GENERATOR_GRACE, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_panic() => {
                tracing::error!(request_id = %request_id, error = %e, "Generator task panicked");
            }
            Ok(Err(e)) => {
                tracing::debug!(request_id = %request_id, error = %e, "Generator task cancelled");
            }
            Err(_) => {
                tracing::warn!(request_id = %request_id, "Generator ignored abort, cancelling task");
                task.abort();
            }
        }

        let cause = report.cause.map(|c| c.as_str()).unwrap_or("none");
        metrics::record_stream_finished(report.state.as_str(), cause, timer.elapsed());
        tracing::info!(
            request_id = %request_id,
            generator = self.generator.name(),
            state = %report.state,
            cause,
            frames = report.frames,
            bytes = report.bytes,
            ignored = report.ignored,
            duration_ms = timer.elapsed().as_millis() as u64,
            "Stream completed"
        );

        report
    }
}

/// Errors during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Handoff error: {0}")]
    Handoff(#[from] HandoffError),

    #[error("Stream error: {0}")]
    Stream(String),
}
