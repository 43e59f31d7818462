//! Turn runtime
//!
//! [`TurnRouter`] owns the per-turn flow: it validates a request, picks
//! an [`ExecutionPath`], runs it under the session's turn lock and
//! publishes events. Agent turns are driven by [`AgentRun`], which feeds
//! the pure transition function and executes the effects it returns.

mod engine;
mod router;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use engine::{AgentRun, AgentRunOutcome};
pub use router::{classify, RouterSettings, TurnRequest, TurnRouter};
pub use traits::{ModelClient, RegistryModelClient};

use crate::llm::{LlmError, LlmRequest, LlmResponse};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Router as shared by the HTTP layer
pub type SharedRouter = TurnRouter<Arc<dyn ModelClient>>;

/// Which path a turn takes, decided once per turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPath {
    Agent,
    /// Continue an agent suspended on `ask_user`
    AgentResume,
    RetrievalOnly,
    ToolAugmented,
    Plain,
}

const RETRY_DELAY: Duration = Duration::from_millis(250);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Model calls do not mutate anything on our side, so a transient
/// failure is retried once before the turn gives up.
pub(crate) async fn complete_with_retry<M: ModelClient + ?Sized>(
    models: &M,
    model_id: &str,
    request: &LlmRequest,
) -> Result<LlmResponse, LlmError> {
    match models.complete(model_id, request).await {
        Err(e) if e.kind.is_retryable() => {
            let delay = e.retry_after.unwrap_or(RETRY_DELAY).min(MAX_RETRY_DELAY);
            tracing::warn!(
                model = %model_id,
                error = %e,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Model call failed, retrying once"
            );
            tokio::time::sleep(delay).await;
            models.complete(model_id, request).await
        }
        other => other,
    }
}
