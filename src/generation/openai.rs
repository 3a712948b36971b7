//! OpenAI-compatible upstream generator.
//!
//! Streams the Chat Completions API and forwards each content delta as a
//! token. Upstream failures become a single error event.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::traits::{GenerationRequest, Generator};
use crate::config::GeneratorConfig;
use crate::error::GenerationError;
use crate::streaming::{EventSender, StreamEvent};

pub struct OpenAIGenerator {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
}

impl OpenAIGenerator {
    pub fn new(client: Client, api_key: String, api_base: String, model: String) -> Self {
        Self {
            client,
            api_key,
            api_base: api_base.trim_end_matches('/').to_string(),
            model,
        }
    }

    /// Build from configuration, reading the API key from config or
    /// `OPENAI_API_KEY`.
    pub fn from_config(config: &GeneratorConfig) -> Result<Self, GenerationError> {
        let api_key = config
            .openai
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .ok_or_else(|| {
                GenerationError::Config(
                    "OpenAI API key not configured. Set OPENAI_API_KEY or generator.openai.api_key"
                        .to_string(),
                )
            })?;

        let client = Client::builder()
            .timeout(config.timeout())
            .pool_max_idle_per_host(config.openai.pool_max_idle_per_host)
            .build()
            .map_err(|e| GenerationError::Connection(e.to_string()))?;

        Ok(Self::new(
            client,
            api_key,
            config.openai.api_base.clone(),
            config.openai.model.clone(),
        ))
    }

    fn open(&self, request: GenerationRequest) -> Result<EventSource, GenerationError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: request.prompt,
        });

        let body = ChatRequest {
            model: &self.model,
            messages,
            stream: true,
        };

        let req = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body);

        EventSource::new(req).map_err(|e| GenerationError::Connection(e.to_string()))
    }
}

#[async_trait]
impl Generator for OpenAIGenerator {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn generate(
        &self,
        request: GenerationRequest,
        events: EventSender,
        abort: CancellationToken,
    ) {
        let request_id = request.request_id.clone();
        let mut es = match self.open(request) {
            Ok(es) => es,
            Err(e) => {
                events.send(StreamEvent::error(e.to_string())).await;
                return;
            }
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = abort.cancelled() => {
                    tracing::debug!(request_id = %request_id, "Upstream generation aborted");
                    break;
                }
                next = es.next() => next,
            };

            let (event, terminal) = match translate(next) {
                Some(Ok(Some(event))) => {
                    let terminal = event.is_terminal();
                    (event, terminal)
                }
                Some(Ok(None)) => continue,
                Some(Err(e)) => {
                    tracing::warn!(request_id = %request_id, error = %e, "Upstream stream error");
                    (StreamEvent::error(e.to_string()), true)
                }
                None => (StreamEvent::End, true),
            };

            if !events.send(event).await || terminal {
                break;
            }
        }

        // The event source reconnects on its own unless closed.
        es.close();
    }
}

/// Map one event-source item to at most one stream event.
///
/// `None` means the upstream stream is over; `Ok(None)` means the item
/// carried nothing to forward.
fn translate(
    item: Option<Result<Event, reqwest_eventsource::Error>>,
) -> Option<Result<Option<StreamEvent>, GenerationError>> {
    let item = item?;
    Some(match item {
        Ok(Event::Open) => Ok(None),
        Ok(Event::Message(msg)) => parse_chunk(&msg.data),
        Err(reqwest_eventsource::Error::StreamEnded) => return None,
        Err(reqwest_eventsource::Error::InvalidStatusCode(status, _)) => Err(GenerationError::Api {
            status: status.as_u16(),
            message: status
                .canonical_reason()
                .unwrap_or("unexpected status")
                .to_string(),
        }),
        Err(reqwest_eventsource::Error::Transport(e)) => Err(GenerationError::Http(e.to_string())),
        Err(e) => Err(GenerationError::Stream(e.to_string())),
    })
}

/// Parse one `data:` payload from the Chat Completions stream.
fn parse_chunk(data: &str) -> Result<Option<StreamEvent>, GenerationError> {
    if data == "[DONE]" {
        return Ok(Some(StreamEvent::End));
    }

    let chunk: ChatChunk = serde_json::from_str(data)
        .map_err(|e| GenerationError::Parse(format!("Failed to parse chunk: {}", e)))?;

    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(None);
    };

    match choice.delta.content {
        Some(content) if !content.is_empty() => Ok(Some(StreamEvent::token(content))),
        // Content and finish_reason arrive in separate chunks; the stream
        // then sends [DONE], which ends it.
        _ => Ok(None),
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::oneshot;

    use crate::streaming::{event_channel, EventReceiver};

    #[test]
    fn test_parse_content_chunk() {
        let data = r#"{"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#;
        assert_eq!(parse_chunk(data).unwrap(), Some(StreamEvent::token("Hel")));
    }

    #[test]
    fn test_parse_done_marker() {
        assert_eq!(parse_chunk("[DONE]").unwrap(), Some(StreamEvent::End));
    }

    #[test]
    fn test_parse_role_only_and_finish_chunks() {
        let role = r#"{"choices":[{"delta":{"role":"assistant"},"finish_reason":null}]}"#;
        assert_eq!(parse_chunk(role).unwrap(), None);

        let finish = r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        assert_eq!(parse_chunk(finish).unwrap(), None);

        assert_eq!(parse_chunk(r#"{"choices":[]}"#).unwrap(), None);
    }

    #[test]
    fn test_parse_malformed_chunk() {
        let err = parse_chunk("{not json").unwrap_err();
        assert!(matches!(err, GenerationError::Parse(_)));
    }

    #[test]
    fn test_stream_end_is_completion() {
        assert!(translate(None).is_none());
        assert!(translate(Some(Err(reqwest_eventsource::Error::StreamEnded))).is_none());
    }

    #[test]
    fn test_missing_api_key() {
        let mut config = GeneratorConfig::default();
        config.provider = "openai".to_string();
        config.openai.api_key = None;
        if std::env::var("OPENAI_API_KEY").is_err() {
            assert!(matches!(
                OpenAIGenerator::from_config(&config),
                Err(GenerationError::Config(_))
            ));
        }
    }

    const SSE_HEAD: &str = "HTTP/1.1 200 OK\r\n\
        Content-Type: text/event-stream\r\n\
        Cache-Control: no-cache\r\n\
        Connection: close\r\n\r\n";

    fn chunk(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({ "choices": [{ "delta": { "content": content } }] })
        )
    }

    /// Read one full request (headers plus `Content-Length` body).
    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut tmp = [0u8; 4096];
        loop {
            let n = stream.read(&mut tmp).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&tmp[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..pos]).to_ascii_lowercase();
                let body_len = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= pos + 4 + body_len {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Serve one connection with `response`. If `hold` is given, the
    /// connection stays open until it fires.
    async fn serve_once(
        response: String,
        hold: Option<oneshot::Receiver<()>>,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_request(&mut stream).await;
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.flush().await.unwrap();
            if let Some(hold) = hold {
                let _ = hold.await;
            }
            request
        });
        (base, server)
    }

    fn generator(api_base: String) -> OpenAIGenerator {
        OpenAIGenerator::new(
            Client::new(),
            "test-key".to_string(),
            api_base,
            "gpt-test".to_string(),
        )
    }

    async fn collect(mut rx: EventReceiver) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_streams_tokens_until_done() {
        let body = format!("{}{}{}data: [DONE]\n\n", SSE_HEAD, chunk("Hel"), chunk("lo"));
        let (base, server) = serve_once(body, None).await;

        let (tx, rx) = event_channel(16);
        let mut request = GenerationRequest::new("greet me");
        request.system = Some("be brief".to_string());
        tokio::time::timeout(
            Duration::from_secs(5),
            generator(base).generate(request, tx, CancellationToken::new()),
        )
        .await
        .expect("generation should finish");

        assert_eq!(
            collect(rx).await,
            vec![StreamEvent::token("Hel"), StreamEvent::token("lo"), StreamEvent::End]
        );

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /chat/completions "));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer test-key"));
        assert!(request.contains(r#""stream":true"#));
        assert!(request.contains(r#""role":"system""#));
        assert!(request.contains("greet me"));
    }

    #[tokio::test]
    async fn test_error_status_becomes_single_error_event() {
        let body = r#"{"error":{"message":"slow down"}}"#;
        let response = format!(
            "HTTP/1.1 429 Too Many Requests\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let (base, _server) = serve_once(response, None).await;

        let (tx, rx) = event_channel(16);
        tokio::time::timeout(
            Duration::from_secs(5),
            generator(base).generate(GenerationRequest::new("x"), tx, CancellationToken::new()),
        )
        .await
        .expect("generation should finish");

        let events = collect(rx).await;
        assert_eq!(events.len(), 1, "got {:?}", events);
        match &events[0] {
            StreamEvent::Error { message } => assert!(message.contains("429"), "{}", message),
            other => panic!("expected error event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_abort_stops_open_stream() {
        let (release, hold) = oneshot::channel();
        let (base, _server) = serve_once(format!("{}{}", SSE_HEAD, chunk("first")), Some(hold)).await;

        let (tx, mut rx) = event_channel(16);
        let abort = CancellationToken::new();
        let task = {
            let abort = abort.clone();
            let generator = generator(base);
            tokio::spawn(async move {
                generator.generate(GenerationRequest::new("x"), tx, abort).await
            })
        };

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("first token");
        assert_eq!(first, Some(StreamEvent::token("first")));

        abort.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("generator should stop once aborted")
            .unwrap();
        assert_eq!(rx.recv().await, None);
        let _ = release.send(());
    }
}
