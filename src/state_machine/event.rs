//! Events that drive the agent state machine

use super::AgentAction;
use crate::llm::ContentBlock;

#[derive(Debug, Clone)]
pub enum AgentEvent {
    ModelResponded {
        content: Vec<ContentBlock>,
        text: String,
        actions: Vec<AgentAction>,
    },
    ModelFailed {
        message: String,
    },
    /// Every call of the current round has a result
    ToolsFinished,
    /// The step's results are in the transcript
    ObservationsRecorded,
    UserAnswered {
        text: String,
    },
    /// Observed at a step boundary after a newer message or a disconnect
    Cancelled,
}
