//! API request and response types

use crate::error::ErrorKind;
use crate::llm::ModelInfo;
use crate::session::{Message, ToolSelection};
use crate::storage::FileRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Response for session creation
#[derive(Debug, Serialize)]
pub struct SessionCreatedResponse {
    pub session_id: String,
}

/// Everything the client needs to redraw a session
#[derive(Debug, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub owner: String,
    pub messages: Vec<Message>,
    pub selection: ToolSelection,
    pub sources: Vec<String>,
    pub files: BTreeMap<String, FileRef>,
    pub agent: AgentSnapshot,
    pub turn_running: bool,
}

#[derive(Debug, Serialize)]
pub struct AgentSnapshot {
    pub max_steps: u32,
    pub current_step: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_question: Option<String>,
}

/// Response for a completed turn
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub message: Message,
}

/// Request to replace the session's tool selection
#[derive(Debug, Deserialize)]
pub struct SelectToolsRequest {
    /// Server names or qualified tool names
    pub tools: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SelectToolsResponse {
    pub selection: ToolSelection,
}

/// Request to upload a file; `data` is base64
#[derive(Debug, Deserialize)]
pub struct UploadFileRequest {
    pub name: String,
    pub data: String,
}

#[derive(Debug, Serialize)]
pub struct UploadFileResponse {
    pub name: String,
    pub reference: FileRef,
    pub size: usize,
}

/// Response for model list
#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelInfo>,
    pub default: String,
}

#[derive(Debug, Serialize)]
pub struct ToolServerInfo {
    pub name: String,
    pub exclusive: bool,
    pub tools: Vec<ToolInfo>,
}

#[derive(Debug, Serialize)]
pub struct ToolInfo {
    /// Name to pass in `selectedTools`
    pub qualified_name: String,
    pub description: String,
}

#[derive(Debug, Serialize)]
pub struct ToolsResponse {
    pub servers: Vec<ToolServerInfo>,
}

#[derive(Debug, Serialize)]
pub struct SourcesResponse {
    pub sources: Vec<String>,
}

/// Response for lifecycle actions
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            kind: None,
        }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = Some(kind);
        self
    }
}
