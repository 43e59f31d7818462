//! Model endpoints a turn can call
//!
//! The router resolves a request's `modelId` to one [`LlmService`] through
//! the registry. Each registered endpoint is wrapped in [`LoggingService`],
//! so every model call of every turn leaves one log line under the turn's
//! span.

mod anthropic;
mod error;
mod registry;
mod types;

pub use anthropic::{AnthropicModel, AnthropicService};
pub use error::{LlmError, LlmErrorKind};
pub use registry::{LlmConfig, ModelInfo, ModelRegistry};
pub use types::*;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

/// One model a client may name as `modelId`
#[async_trait]
pub trait LlmService: Send + Sync {
    /// A single non-streaming completion. Proposed tool calls come back as
    /// `ToolUse` content blocks for the coordinator to run.
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    fn model_id(&self) -> &str;
}

/// Records latency, transcript size and token usage of each call.
/// Retryable failures log at warn; anything else fails the turn and logs
/// at error.
pub struct LoggingService {
    inner: Arc<dyn LlmService>,
    model_id: String,
}

impl LoggingService {
    pub fn new(inner: Arc<dyn LlmService>) -> Self {
        let model_id = inner.model_id().to_string();
        Self { inner, model_id }
    }
}

#[async_trait]
impl LlmService for LoggingService {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let started = Instant::now();
        let result = self.inner.complete(request).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match &result {
            Ok(response) => tracing::info!(
                model = %self.model_id,
                elapsed_ms,
                messages = request.messages.len(),
                offered_tools = request.tools.len(),
                proposed_calls = response.tool_uses().len(),
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                "Model call completed"
            ),
            Err(e) if e.kind.is_retryable() => tracing::warn!(
                model = %self.model_id,
                elapsed_ms,
                kind = ?e.kind,
                error = %e.message,
                "Model call failed, retryable"
            ),
            Err(e) => tracing::error!(
                model = %self.model_id,
                elapsed_ms,
                kind = ?e.kind,
                error = %e.message,
                "Model call failed"
            ),
        }

        result
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
