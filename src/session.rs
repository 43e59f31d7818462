//! Session data model
//!
//! A [`Session`] holds one user's conversation history, tool selection,
//! data source selection, uploaded files and agent settings. History only
//! grows through [`Session::commit_turn`], which appends exactly one user
//! message and one bundled assistant message.

mod selection;
mod store;

pub use selection::{SelectionTarget, ServerSelection, ToolFilter, ToolSelection};
pub use store::{SessionError, SessionHandle, SessionStore};

use crate::llm::LlmMessage;
use crate::retrieval::SourceAttribution;
use crate::state_machine::AgentCheckpoint;
use crate::storage::FileRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// A tool call made during a turn and how it ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    pub success: bool,
    /// Observation text fed back to the model, or the failure reason
    pub output: String,
}

/// One reasoning step of an agent turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStep {
    pub index: u32,
    pub reasoning: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub terminal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentOutcome {
    Completed,
    MaxStepsReached,
    AwaitingUserInput,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageKind {
    Chat,
    ToolAugmented {
        #[serde(default)]
        cancelled: bool,
    },
    Retrieval {
        attributions: Vec<SourceAttribution>,
    },
    Agent {
        outcome: AgentOutcome,
        steps: Vec<AgentStep>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(flatten)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<FileRef>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text.into(), MessageKind::Chat)
    }

    pub fn assistant(text: impl Into<String>, kind: MessageKind) -> Self {
        Self::new(Role::Assistant, text.into(), kind)
    }

    fn new(role: Role, content: String, kind: MessageKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            kind,
            tool_calls: Vec::new(),
            artifacts: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCallRecord>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    #[must_use]
    pub fn with_artifacts(mut self, artifacts: Vec<FileRef>) -> Self {
        self.artifacts = artifacts;
        self
    }
}

/// Per-session agent settings and suspended state
#[derive(Debug, Clone, Default)]
pub struct AgentSettings {
    pub max_steps: u32,
    /// Steps taken by the most recent agent turn
    pub current_step: u32,
    /// Set while the agent waits for an answer to `ask_user`
    pub checkpoint: Option<AgentCheckpoint>,
}

impl AgentSettings {
    pub fn pending_question(&self) -> Option<&str> {
        self.checkpoint.as_ref().map(|c| c.question.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub owner: String,
    history: Vec<Message>,
    pub selection: ToolSelection,
    pub sources: BTreeSet<String>,
    /// Uploaded files by display name
    pub files: BTreeMap<String, FileRef>,
    pub agent: AgentSettings,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: String, owner: String, agent_max_steps: u32) -> Self {
        Self {
            id,
            owner,
            history: Vec::new(),
            selection: ToolSelection::default(),
            sources: BTreeSet::new(),
            files: BTreeMap::new(),
            agent: AgentSettings {
                max_steps: agent_max_steps,
                ..AgentSettings::default()
            },
            created_at: Utc::now(),
        }
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// Append the turn's user message and its single bundled response
    pub fn commit_turn(&mut self, user: Message, response: Message) {
        debug_assert_eq!(user.role, Role::User);
        debug_assert_eq!(response.role, Role::Assistant);
        self.history.push(user);
        self.history.push(response);
    }

    /// History as model transcript input. Only conversational text is
    /// replayed; tool traces stay on the stored messages.
    pub fn llm_history(&self) -> Vec<LlmMessage> {
        self.history
            .iter()
            .filter(|m| !m.content.trim().is_empty())
            .map(|m| match m.role {
                Role::User => LlmMessage::user(m.content.clone()),
                Role::Assistant => {
                    LlmMessage::assistant(vec![crate::llm::ContentBlock::text(m.content.clone())])
                }
            })
            .collect()
    }
}
