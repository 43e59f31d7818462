//! Agent state types

use crate::llm::{LlmMessage, ToolDefinition, ToolUse};
use serde::Serialize;
use serde_json::{json, Value};

/// Reserved tool the model calls to finish with an answer
pub const FINAL_ANSWER_TOOL: &str = "final_answer";
/// Reserved tool the model calls to ask the user a question
pub const ASK_USER_TOOL: &str = "ask_user";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AgentState {
    /// Waiting on the model for step `step` (0-based)
    Reasoning { step: u32 },

    /// Running the tool calls the model proposed at `step`
    Acting { step: u32, calls: Vec<ToolUse> },

    /// Folding the step's results back into the transcript
    Observing { step: u32 },

    /// Suspended until the user answers; resumed by the next message
    AwaitingUserInput {
        step: u32,
        question: String,
        call_id: String,
    },

    Completed { answer: String },

    MaxStepsReached { steps: u32 },

    /// Interrupted by a newer message or a disconnect; stopped at a step boundary
    Cancelled { step: u32 },

    Errored { message: String },
}

impl AgentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentState::Completed { .. }
                | AgentState::MaxStepsReached { .. }
                | AgentState::Cancelled { .. }
                | AgentState::Errored { .. }
        )
    }

    /// Terminal, or suspended waiting on the user
    pub fn is_resting(&self) -> bool {
        self.is_terminal() || matches!(self, AgentState::AwaitingUserInput { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            AgentState::Reasoning { .. } => "reasoning",
            AgentState::Acting { .. } => "acting",
            AgentState::Observing { .. } => "observing",
            AgentState::AwaitingUserInput { .. } => "awaiting_user_input",
            AgentState::Completed { .. } => "completed",
            AgentState::MaxStepsReached { .. } => "max_steps_reached",
            AgentState::Cancelled { .. } => "cancelled",
            AgentState::Errored { .. } => "errored",
        }
    }
}

/// What the model asked for in one response
#[derive(Debug, Clone, PartialEq)]
pub enum AgentAction {
    FinalAnswer { call_id: String, answer: String },
    AskUser { call_id: String, question: String },
    Invoke(ToolUse),
}

impl AgentAction {
    pub fn from_tool_use(call: ToolUse) -> Self {
        let field = |name: &str| {
            call.input
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        match call.name.as_str() {
            FINAL_ANSWER_TOOL => AgentAction::FinalAnswer {
                answer: field("answer"),
                call_id: call.id,
            },
            ASK_USER_TOOL => AgentAction::AskUser {
                question: field("question"),
                call_id: call.id,
            },
            _ => AgentAction::Invoke(call),
        }
    }
}

/// Per-turn agent configuration
#[derive(Debug, Clone, Copy)]
pub struct AgentContext {
    pub max_steps: u32,
}

/// Everything needed to resume an agent suspended on `ask_user`
#[derive(Debug, Clone, PartialEq)]
pub struct AgentCheckpoint {
    pub step: u32,
    pub max_steps: u32,
    pub question: String,
    pub call_id: String,
    pub transcript: Vec<LlmMessage>,
}

impl AgentCheckpoint {
    pub fn state(&self) -> AgentState {
        AgentState::AwaitingUserInput {
            step: self.step,
            question: self.question.clone(),
            call_id: self.call_id.clone(),
        }
    }
}

/// Schemas for the reserved agent tools
pub fn reserved_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: FINAL_ANSWER_TOOL.to_string(),
            description: "Finish the task and give the user your final answer.".to_string(),
            input_schema: json!({
                "type": "object",
                "required": ["answer"],
                "properties": {
                    "answer": {"type": "string", "description": "The complete answer for the user"}
                }
            }),
        },
        ToolDefinition {
            name: ASK_USER_TOOL.to_string(),
            description: "Ask the user a clarifying question and wait for their reply. Use only when you cannot proceed without it.".to_string(),
            input_schema: json!({
                "type": "object",
                "required": ["question"],
                "properties": {
                    "question": {"type": "string", "description": "The question to ask"}
                }
            }),
        },
    ]
}
