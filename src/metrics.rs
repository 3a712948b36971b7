//! Prometheus metrics for the bridge daemon.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use nix::libc;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::error::{HandoffError, SinkError};

/// Error reason labels for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorReason {
    /// Client disconnected (EPIPE, ECONNRESET, BrokenPipe, ConnectionReset)
    ClientDisconnected,
    /// Timeout (deadline exceeded, ETIMEDOUT)
    Timeout,
    /// Operation was canceled
    Canceled,
    /// Network error (other network-related errors)
    Network,
    /// Other/unknown error
    Other,
}

impl ErrorReason {
    /// Convert to static string for metrics label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorReason::ClientDisconnected => "client_disconnected",
            ErrorReason::Timeout => "timeout",
            ErrorReason::Canceled => "canceled",
            ErrorReason::Network => "network",
            ErrorReason::Other => "other",
        }
    }

    /// Classify an I/O error into an ErrorReason.
    pub fn from_io_error(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => {
                ErrorReason::ClientDisconnected
            }
            io::ErrorKind::TimedOut => ErrorReason::Timeout,
            io::ErrorKind::Interrupted => ErrorReason::Canceled,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::AddrInUse
            | io::ErrorKind::AddrNotAvailable => ErrorReason::Network,
            _ => match err.raw_os_error() {
                Some(libc::EPIPE) | Some(libc::ECONNRESET) => ErrorReason::ClientDisconnected,
                Some(libc::ETIMEDOUT) => ErrorReason::Timeout,
                Some(libc::ECANCELED) => ErrorReason::Canceled,
                _ => ErrorReason::Other,
            },
        }
    }

    pub fn from_sink_error(err: &SinkError) -> Self {
        match err {
            SinkError::Disconnected => ErrorReason::ClientDisconnected,
            SinkError::Timeout => ErrorReason::Timeout,
            SinkError::Io(e) => Self::from_io_error(e),
            SinkError::Closed => ErrorReason::Other,
        }
    }

    pub fn from_handoff_error(err: &HandoffError) -> Self {
        match err {
            HandoffError::Timeout => ErrorReason::Timeout,
            HandoffError::System(errno) => Self::from_io_error(&io::Error::from(*errno)),
            _ => ErrorReason::Other,
        }
    }
}

/// Initialize metrics descriptions.
pub fn init_metrics() {
    describe_gauge!(
        "bridge_active_streams",
        "Number of currently active client streams"
    );
    describe_counter!(
        "bridge_connections_total",
        "Total number of connections accepted"
    );

    describe_counter!("bridge_handoffs_total", "Total handoffs received");
    describe_counter!("bridge_handoff_errors_total", "Handoff receive errors");
    describe_histogram!(
        "bridge_handoff_duration_seconds",
        "Time to receive handoff from Apache"
    );

    describe_counter!("bridge_frames_sent_total", "Total SSE frames written");
    describe_counter!("bridge_bytes_sent_total", "Total bytes sent to clients");
    describe_counter!("bridge_write_errors_total", "Client write errors");
    describe_counter!(
        "bridge_streams_finished_total",
        "Streams finished, by terminal state and cause"
    );
    describe_counter!(
        "bridge_upstream_aborts_total",
        "Generations aborted by the bridge"
    );
    describe_counter!(
        "bridge_ignored_events_total",
        "Events delivered after their stream ended"
    );
    describe_histogram!(
        "bridge_stream_duration_seconds",
        "Total stream duration per request"
    );
    describe_histogram!(
        "bridge_first_token_seconds",
        "Time from request to first event from the generator"
    );
}

/// Start the Prometheus metrics HTTP server.
pub async fn start_metrics_server(addr: SocketAddr) -> anyhow::Result<()> {
    // Handoff duration: 0.1ms to ~1.6s
    let handoff_buckets: [f64; 15] = [
        0.0001, 0.0002, 0.0004, 0.0008, 0.0016, 0.0032, 0.0064, 0.0128, 0.0256, 0.0512, 0.1024,
        0.2048, 0.4096, 0.8192, 1.6384,
    ];

    // Stream duration: 10ms to ~163s
    let duration_buckets: [f64; 15] = [
        0.01, 0.02, 0.04, 0.08, 0.16, 0.32, 0.64, 1.28, 2.56, 5.12, 10.24, 20.48, 40.96, 81.92,
        163.84,
    ];

    // First token: 1ms to ~16s
    let first_token_buckets: [f64; 15] = [
        0.001, 0.002, 0.004, 0.008, 0.016, 0.032, 0.064, 0.128, 0.256, 0.512, 1.024, 2.048, 4.096,
        8.192, 16.384,
    ];

    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("bridge_handoff_duration_seconds".to_string()),
            &handoff_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full("bridge_stream_duration_seconds".to_string()),
            &duration_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full("bridge_first_token_seconds".to_string()),
            &first_token_buckets,
        )?
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to start metrics server: {}", e))?;

    tracing::info!(%addr, "Metrics server started");
    Ok(())
}

pub fn record_connection_accepted() {
    counter!("bridge_connections_total").increment(1);
}

pub fn set_active_streams(count: u64) {
    gauge!("bridge_active_streams").set(count as f64);
}

pub fn record_handoff_success(duration: Duration) {
    counter!("bridge_handoffs_total").increment(1);
    histogram!("bridge_handoff_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_handoff_error(reason: ErrorReason) {
    counter!("bridge_handoff_errors_total", "reason" => reason.as_str()).increment(1);
}

pub fn record_frame_sent() {
    counter!("bridge_frames_sent_total").increment(1);
}

pub fn record_bytes_sent(bytes: u64) {
    counter!("bridge_bytes_sent_total").increment(bytes);
}

pub fn record_write_error(reason: ErrorReason) {
    counter!("bridge_write_errors_total", "reason" => reason.as_str()).increment(1);
}

pub fn record_upstream_abort() {
    counter!("bridge_upstream_aborts_total").increment(1);
}

pub fn record_ignored_event() {
    counter!("bridge_ignored_events_total").increment(1);
}

pub fn record_stream_finished(state: &'static str, cause: &'static str, duration: Duration) {
    counter!("bridge_streams_finished_total", "state" => state, "cause" => cause).increment(1);
    histogram!("bridge_stream_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_first_token(generator: &'static str, duration: Duration) {
    histogram!("bridge_first_token_seconds", "generator" => generator)
        .record(duration.as_secs_f64());
}

/// Timer for measuring durations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
