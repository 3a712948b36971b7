//! Mock generator for testing and demos.
//!
//! Streams a canned response word-by-word, or replays a fixed script of
//! events.

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::traits::{GenerationRequest, Generator};
use crate::streaming::{EventSender, StreamEvent};

pub struct MockGenerator {
    /// Delay before each event.
    token_delay: Duration,
    script: Option<Vec<StreamEvent>>,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self::with_delay(Duration::from_millis(50))
    }

    pub fn with_delay(token_delay: Duration) -> Self {
        Self {
            token_delay,
            script: None,
        }
    }

    /// Replay exactly `events` for every request, ignoring the prompt.
    pub fn scripted(events: Vec<StreamEvent>) -> Self {
        Self {
            token_delay: Duration::ZERO,
            script: Some(events),
        }
    }

    fn canned(request: &GenerationRequest) -> Vec<StreamEvent> {
        let preview: String = request.prompt.chars().take(100).collect();
        let preview = if preview.len() < request.prompt.len() {
            format!("{}...", preview)
        } else {
            preview
        };

        let response = format!(
            "Hello! I received your prompt: \"{}\"\n\n\
             This response is streamed token by token through the SSE bridge. \
             Configure an upstream generator to replace it.",
            preview
        );

        let mut events: Vec<StreamEvent> = response
            .split_whitespace()
            .enumerate()
            .map(|(i, word)| {
                if i == 0 {
                    StreamEvent::token(word)
                } else {
                    StreamEvent::token(format!(" {}", word))
                }
            })
            .collect();
        events.push(StreamEvent::End);
        events
    }
}

impl Default for MockGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Generator for MockGenerator {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn generate(
        &self,
        request: GenerationRequest,
        events: EventSender,
        abort: CancellationToken,
    ) {
        let script = match &self.script {
            Some(script) => script.clone(),
            None => Self::canned(&request),
        };

        for event in script {
            if !self.token_delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = abort.cancelled() => break,
                    _ = tokio::time::sleep(self.token_delay) => {}
                }
            } else if abort.is_cancelled() {
                break;
            }

            if !events.send(event).await {
                break;
            }
        }

        if abort.is_cancelled() {
            tracing::debug!(request_id = %request.request_id, "Mock generation aborted");
        }
    }
}
