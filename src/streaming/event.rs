//! Stream events and the channel generators push them through.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// One incremental fragment of generated text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn new(content: impl Into<String>) -> Self {
        Self(content.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Token {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Token {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An event emitted by a generation collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Next fragment of output.
    Token(Token),
    /// Generation finished normally.
    End,
    /// Generation failed upstream.
    Error { message: String },
}

impl StreamEvent {
    pub fn token(content: impl Into<String>) -> Self {
        Self::Token(Token::new(content))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Token(_))
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Token(_) => "token",
            Self::End => "end",
            Self::Error { .. } => "error",
        }
    }
}

/// Callbacks through which a generator reports progress.
///
/// Implemented directly by [`StreamBridge`](super::StreamBridge) and by
/// [`EventSender`], which forwards into the bridge's channel.
#[async_trait]
pub trait EventHandler: Send {
    async fn on_token(&mut self, token: Token);

    async fn on_end(&mut self);

    async fn on_error(&mut self, message: String);
}

/// Create the single-consumer channel between a generator and a bridge.
///
/// The channel is bounded so a slow client backpressures the generator.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSender { tx }, EventReceiver { rx })
}

/// Producer half held by the generation collaborator.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<StreamEvent>,
}

impl EventSender {
    /// Push an event. Returns false once the bridge has stopped listening.
    pub async fn send(&self, event: StreamEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    /// Whether the consuming bridge has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
impl EventHandler for EventSender {
    async fn on_token(&mut self, token: Token) {
        if !self.send(StreamEvent::Token(token)).await {
            tracing::debug!("Token dropped, bridge no longer listening");
        }
    }

    async fn on_end(&mut self) {
        let _ = self.send(StreamEvent::End).await;
    }

    async fn on_error(&mut self, message: String) {
        let _ = self.send(StreamEvent::Error { message }).await;
    }
}

/// Consumer half drained by the bridge.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<StreamEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Take an already-queued event without waiting.
    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.rx.try_recv().ok()
    }

    /// Stop accepting new events; queued events can still be drained.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
