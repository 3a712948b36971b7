//! Generator trait definitions.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::server::RequestData;
use crate::streaming::EventSender;

/// A generation collaborator that produces tokens for one request.
///
/// Implementations push zero or more `Token` events followed by exactly
/// one `End` or `Error` into `events`, and stop promptly once `abort` is
/// cancelled.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generator name for metrics/logging.
    fn name(&self) -> &'static str;

    async fn generate(
        &self,
        request: GenerationRequest,
        events: EventSender,
        abort: CancellationToken,
    );
}

/// What to generate.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system: Option<String>,
    /// Request ID for correlation.
    pub request_id: String,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Build from handoff data, falling back to a connection-derived ID.
    pub fn from_handoff(data: &RequestData, conn_id: u64) -> Self {
        Self {
            prompt: data.prompt.clone().unwrap_or_default(),
            system: data.system.clone(),
            request_id: data
                .request_id
                .clone()
                .unwrap_or_else(|| format!("conn-{}", conn_id)),
        }
    }
}
