//! Effects produced by agent transitions

use crate::events::TurnEvent;
use crate::llm::{ContentBlock, ToolUse};

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEffect {
    /// Ask the model for the next step
    RequestModel,

    /// Append the model's response to the transcript
    AppendAssistant { content: Vec<ContentBlock> },

    /// Open a step record with the model's reasoning text
    BeginStep { reasoning: String },

    /// Run one round of tool calls through the coordinator
    ExecuteTools { calls: Vec<ToolUse> },

    /// Close the open step record with the round's results
    RecordStep { terminal: bool },

    /// Append the round's results to the transcript
    RecordObservations,

    /// Append the user's answer as the `ask_user` result
    AppendAnswer { call_id: String, text: String },

    /// Publish an event to the session's subscribers
    Notify(TurnEvent),
}

impl AgentEffect {
    pub fn notify(event: TurnEvent) -> Self {
        AgentEffect::Notify(event)
    }
}
