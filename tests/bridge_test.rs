//! Integration tests for the stream bridge.
//!
//! Events come from a synthetic producer over the event channel; output is
//! captured through in-memory sinks, so every wire byte can be compared.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sse_stream_bridge::config::ServerConfig;
use sse_stream_bridge::generation::{GenerationRequest, Generator, MockGenerator};
use sse_stream_bridge::server::ConnectionHandler;
use sse_stream_bridge::shutdown::ShutdownCoordinator;
use sse_stream_bridge::streaming::{
    event_channel, ChannelSink, EventSender, IoSink, StreamBridge, StreamEvent, StreamState,
    TerminalCause, IDLE_TIMEOUT_MESSAGE, PRODUCER_GONE_MESSAGE,
};

fn content_frame(token: &str) -> String {
    format!("data: {}\n\n", serde_json::json!({ "content": token }))
}

fn error_frame(message: &str) -> String {
    format!("data: {}\n\n", serde_json::json!({ "error": message }))
}

/// Feed `events` through a bridge into a channel sink and collect the wire.
async fn run_script(events: Vec<StreamEvent>) -> (StreamState, Vec<String>) {
    let (tx, rx) = event_channel(events.len().max(1));
    // A small sink buffer keeps the bridge under backpressure from the reader.
    let (sink, mut wire) = ChannelSink::new(4);

    let producer = tokio::spawn(async move {
        for event in events {
            if !tx.send(event).await {
                break;
            }
        }
    });
    let reader = tokio::spawn(async move {
        let mut frames = Vec::new();
        while let Some(frame) = wire.recv().await {
            frames.push(String::from_utf8(frame.to_vec()).unwrap());
        }
        frames
    });

    let report = StreamBridge::new(sink).run(rx).await;
    producer.await.unwrap();
    let frames = reader.await.unwrap();
    (report.state, frames)
}

#[tokio::test]
async fn test_scenario_a_tokens_then_end() {
    let (state, frames) = run_script(vec![
        StreamEvent::token("Hel"),
        StreamEvent::token("lo"),
        StreamEvent::End,
    ])
    .await;

    assert_eq!(state, StreamState::Closed);
    assert_eq!(
        frames,
        vec![
            "data: {\"content\":\"Hel\"}\n\n".to_string(),
            "data: {\"content\":\"lo\"}\n\n".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_scenario_b_token_then_error() {
    let (state, frames) =
        run_script(vec![StreamEvent::token("Hi"), StreamEvent::error("rate limited")]).await;

    assert_eq!(state, StreamState::Errored);
    assert_eq!(
        frames,
        vec![
            "data: {\"content\":\"Hi\"}\n\n".to_string(),
            "data: {\"error\":\"rate limited\"}\n\n".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_scenario_c_end_only() {
    let (state, frames) = run_script(vec![StreamEvent::End]).await;
    assert_eq!(state, StreamState::Closed);
    assert!(frames.is_empty());
}

#[tokio::test]
async fn test_order_preserved_for_varied_sequences() {
    let cases: Vec<Vec<&str>> = vec![
        vec!["a"],
        vec!["The", " quick", " brown", " fox"],
        vec!["", " ", "\"quoted\"", "line\nbreak", "ünïcödé"],
        (0..200).map(|_| "x").collect(),
    ];

    for tokens in cases {
        let mut events: Vec<StreamEvent> = tokens.iter().map(|t| StreamEvent::token(*t)).collect();
        events.push(StreamEvent::End);

        let (state, frames) = run_script(events).await;
        let expected: Vec<String> = tokens.iter().map(|t| content_frame(t)).collect();

        assert_eq!(state, StreamState::Closed);
        assert_eq!(frames, expected);
        assert!(!frames.iter().any(|f| f.contains("\"error\"")));
    }
}

#[tokio::test]
async fn test_error_after_tokens_then_silence() {
    let (state, frames) = run_script(vec![
        StreamEvent::token("one"),
        StreamEvent::token("two"),
        StreamEvent::error("upstream \"quota\" exceeded"),
        StreamEvent::token("late"),
        StreamEvent::End,
    ])
    .await;

    assert_eq!(state, StreamState::Errored);
    assert_eq!(
        frames,
        vec![
            content_frame("one"),
            content_frame("two"),
            error_frame("upstream \"quota\" exceeded"),
        ]
    );
}

#[tokio::test]
async fn test_io_sink_wire_bytes() {
    let (client, mut server) = tokio::io::duplex(4096);
    let (tx, rx) = event_channel(8);

    tx.send(StreamEvent::token("Hel")).await;
    tx.send(StreamEvent::token("lo")).await;
    tx.send(StreamEvent::End).await;

    let sink = IoSink::new(client, Duration::from_secs(1));
    let report = StreamBridge::new(sink).run(rx).await;
    assert_eq!(report.frames, 2);

    let mut wire = String::new();
    server.read_to_string(&mut wire).await.unwrap();
    assert_eq!(
        wire,
        "data: {\"content\":\"Hel\"}\n\ndata: {\"content\":\"lo\"}\n\n"
    );
}

/// Emits tokens until aborted, then records that it stopped.
struct EndlessGenerator {
    stopped: mpsc::UnboundedSender<usize>,
}

#[async_trait]
impl Generator for EndlessGenerator {
    fn name(&self) -> &'static str {
        "endless"
    }

    async fn generate(&self, _request: GenerationRequest, events: EventSender, abort: CancellationToken) {
        let mut sent = 0;
        while !abort.is_cancelled() {
            tokio::select! {
                biased;
                _ = abort.cancelled() => break,
                ok = events.send(StreamEvent::token("tok")) => {
                    if !ok {
                        break;
                    }
                    sent += 1;
                }
            }
            tokio::task::yield_now().await;
        }
        let _ = self.stopped.send(sent);
    }
}

#[tokio::test]
async fn test_client_disconnect_aborts_generation() {
    let (stopped_tx, mut stopped_rx) = mpsc::unbounded_channel();
    let generator: Arc<dyn Generator> = Arc::new(EndlessGenerator {
        stopped: stopped_tx,
    });
    let handler = ConnectionHandler::new(ServerConfig::default(), generator);
    let shutdown = ShutdownCoordinator::new();
    let guard = shutdown.register_stream();

    let (sink, mut wire) = ChannelSink::new(1);
    let reader = tokio::spawn(async move {
        // Read three frames, then hang up.
        for _ in 0..3 {
            wire.recv().await.unwrap();
        }
    });

    let report = handler
        .bridge(sink, GenerationRequest::new("go"), &guard)
        .await;
    reader.await.unwrap();

    assert_eq!(report.state, StreamState::Errored);
    assert_eq!(report.cause, Some(TerminalCause::WriteFailed));
    assert!(report.frames >= 3);

    let produced = tokio::time::timeout(Duration::from_secs(1), stopped_rx.recv())
        .await
        .expect("generator should stop after abort")
        .unwrap();
    assert!(produced as u64 >= report.frames);
}

#[tokio::test]
async fn test_handler_streams_scripted_generation() {
    let script = vec![StreamEvent::token("Hi"), StreamEvent::error("rate limited")];
    let generator: Arc<dyn Generator> = Arc::new(MockGenerator::scripted(script));
    let handler = ConnectionHandler::new(ServerConfig::default(), generator);
    let shutdown = ShutdownCoordinator::new();
    let guard = shutdown.register_stream();

    let (sink, mut wire) = ChannelSink::new(8);
    let report = handler
        .bridge(sink, GenerationRequest::new("hello"), &guard)
        .await;

    assert_eq!(report.cause, Some(TerminalCause::Upstream));
    assert!(report.first_token.is_some());
    assert_eq!(wire.recv().await, Some(Bytes::from(content_frame("Hi"))));
    assert_eq!(wire.recv().await, Some(Bytes::from(error_frame("rate limited"))));
    assert_eq!(wire.recv().await, None);
}

/// Emits one token, then panics.
struct PanickingGenerator;

#[async_trait]
impl Generator for PanickingGenerator {
    fn name(&self) -> &'static str {
        "panicking"
    }

    async fn generate(&self, _request: GenerationRequest, events: EventSender, _abort: CancellationToken) {
        events.send(StreamEvent::token("a")).await;
        panic!("generator exploded");
    }
}

#[tokio::test]
async fn test_handler_survives_generator_panic() {
    let handler = ConnectionHandler::new(ServerConfig::default(), Arc::new(PanickingGenerator));
    let shutdown = ShutdownCoordinator::new();
    let guard = shutdown.register_stream();

    let (sink, mut wire) = ChannelSink::new(8);
    let report = tokio::time::timeout(
        Duration::from_secs(5),
        handler.bridge(sink, GenerationRequest::new("boom"), &guard),
    )
    .await
    .expect("bridge should finish after the generator dies");

    assert_eq!(report.state, StreamState::Errored);
    assert_eq!(report.cause, Some(TerminalCause::ProducerGone));
    assert_eq!(report.frames, 2);
    assert_eq!(wire.recv().await, Some(Bytes::from(content_frame("a"))));
    assert_eq!(
        wire.recv().await,
        Some(Bytes::from(error_frame(PRODUCER_GONE_MESSAGE)))
    );
    assert_eq!(wire.recv().await, None);
}

/// Never produces anything until aborted.
struct SilentGenerator;

#[async_trait]
impl Generator for SilentGenerator {
    fn name(&self) -> &'static str {
        "silent"
    }

    async fn generate(&self, _request: GenerationRequest, _events: EventSender, abort: CancellationToken) {
        abort.cancelled().await;
    }
}

#[tokio::test]
async fn test_handler_idle_timeout() {
    let config = ServerConfig {
        idle_timeout_secs: 1,
        ..ServerConfig::default()
    };
    let handler = ConnectionHandler::new(config, Arc::new(SilentGenerator));
    let shutdown = ShutdownCoordinator::new();
    let guard = shutdown.register_stream();

    let (sink, mut wire) = ChannelSink::new(8);
    let report = handler
        .bridge(sink, GenerationRequest::new("anyone?"), &guard)
        .await;

    assert_eq!(report.cause, Some(TerminalCause::IdleTimeout));
    assert_eq!(wire.recv().await, Some(Bytes::from(error_frame(IDLE_TIMEOUT_MESSAGE))));
    assert_eq!(wire.recv().await, None);
}

#[tokio::test]
async fn test_handler_shutdown_mid_stream() {
    let handler = ConnectionHandler::new(ServerConfig::default(), Arc::new(SilentGenerator));
    let shutdown = ShutdownCoordinator::new();
    let guard = shutdown.register_stream();

    let (sink, mut wire) = ChannelSink::new(8);
    let trigger = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            shutdown.shutdown();
        })
    };

    let report = handler
        .bridge(sink, GenerationRequest::new("wait"), &guard)
        .await;
    trigger.await.unwrap();

    assert_eq!(report.cause, Some(TerminalCause::Shutdown));
    let frame = wire.recv().await.unwrap();
    assert!(String::from_utf8_lossy(&frame).contains("\"error\""));
    assert_eq!(wire.recv().await, None);
}
