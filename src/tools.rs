//! Tool servers and the catalog that resolves qualified tool names
//!
//! A tool server groups related tools behind one name, one access policy
//! and one transport. Tools are offered to the model under qualified names
//! of the form `<server>_<tool>`, e.g. `calculator_evaluate`.

mod calculator;
mod canvas;
mod files;
mod http;

pub use calculator::CalculatorTool;
pub use canvas::CanvasTool;
pub use files::{InspectFileTool, WriteFileTool};
pub use http::HttpToolServer;

use crate::events::EventEmitter;
use crate::llm::ToolDefinition;
use crate::session::{SelectionTarget, ToolSelection};
use crate::storage::{FileRef, FileStore, StorageError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolServerError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("{0}")]
    Failed(String),
    #[error("Tool server unavailable: {0}")]
    Unavailable(String),
}

/// A file produced by a tool, before it is stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub media_type: String,
    pub data: Vec<u8>,
}

/// Raw result of a tool call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub content: String,
    pub artifacts: Vec<Artifact>,
    pub ui_payload: Option<String>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    #[must_use]
    pub fn with_ui_payload(mut self, html: impl Into<String>) -> Self {
        self.ui_payload = Some(html.into());
        self
    }
}

/// How a tool's result is routed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    #[default]
    Standard,
    /// Result is rendered on the client canvas, not added to the conversation
    Canvas,
}

/// Schema of one tool as a server lists it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    #[serde(default)]
    pub kind: ToolKind,
}

/// Access and scheduling metadata for a server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerPolicy {
    /// Any one of these groups grants access; empty means everyone
    pub required_groups: BTreeSet<String>,
    pub exclusive: bool,
    /// Calls to this server run one at a time, in proposal order
    pub sequential: bool,
}

/// Everything a tool call may use, built fresh for each call
#[derive(Clone)]
pub struct ToolContext {
    pub cancel: CancellationToken,
    pub session_id: String,
    pub user_id: String,
    pub turn_id: String,
    pub call_id: String,
    files: Arc<dyn FileStore>,
    emitter: Option<EventEmitter>,
}

impl ToolContext {
    pub fn new(
        cancel: CancellationToken,
        session_id: String,
        user_id: String,
        turn_id: String,
        call_id: String,
        files: Arc<dyn FileStore>,
        emitter: Option<EventEmitter>,
    ) -> Self {
        Self {
            cancel,
            session_id,
            user_id,
            turn_id,
            call_id,
            files,
            emitter,
        }
    }

    /// Read a stored file as the calling user
    pub async fn read_file(&self, reference: &FileRef) -> Result<Vec<u8>, ToolServerError> {
        self.files
            .get(&self.user_id, reference)
            .await
            .map_err(|e| match e {
                StorageError::Forbidden(_) => {
                    ToolServerError::Failed(format!("Access to {reference} denied"))
                }
                other => ToolServerError::Failed(other.to_string()),
            })
    }

    pub fn report_progress(&self, message: impl Into<String>) {
        if let Some(emitter) = &self.emitter {
            emitter.tool_progress(&self.call_id, message);
        }
    }
}

/// A single tool hosted in-process
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Tool description for the model
    fn description(&self) -> String;

    /// JSON schema for tool input
    fn input_schema(&self) -> Value;

    fn kind(&self) -> ToolKind {
        ToolKind::Standard
    }

    /// Execute the tool. Long-running tools should watch `ctx.cancel`.
    async fn run(&self, input: Value, ctx: ToolContext) -> Result<ToolOutput, ToolServerError>;
}

#[async_trait]
pub trait ToolServer: Send + Sync {
    fn name(&self) -> &str;

    fn policy(&self) -> &ServerPolicy;

    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolServerError>;

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        ctx: ToolContext,
    ) -> Result<ToolOutput, ToolServerError>;
}

/// Tool server whose tools run in-process
pub struct LocalToolServer {
    name: String,
    policy: ServerPolicy,
    tools: Vec<Arc<dyn Tool>>,
}

impl LocalToolServer {
    pub fn new(name: impl Into<String>, policy: ServerPolicy, tools: Vec<Arc<dyn Tool>>) -> Self {
        Self {
            name: name.into(),
            policy,
            tools,
        }
    }

    pub fn calculator() -> Self {
        Self::new("calculator", ServerPolicy::default(), vec![Arc::new(CalculatorTool)])
    }

    pub fn canvas() -> Self {
        Self::new("canvas", ServerPolicy::default(), vec![Arc::new(CanvasTool)])
    }

    /// File tools share one store, so their calls are kept in order
    pub fn files() -> Self {
        Self::new(
            "files",
            ServerPolicy {
                sequential: true,
                ..ServerPolicy::default()
            },
            vec![Arc::new(InspectFileTool), Arc::new(WriteFileTool)],
        )
    }
}

#[async_trait]
impl ToolServer for LocalToolServer {
    fn name(&self) -> &str {
        &self.name
    }

    fn policy(&self) -> &ServerPolicy {
        &self.policy
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolServerError> {
        Ok(self
            .tools
            .iter()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description(),
                input_schema: t.input_schema(),
                kind: t.kind(),
            })
            .collect())
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        ctx: ToolContext,
    ) -> Result<ToolOutput, ToolServerError> {
        let handler = self
            .tools
            .iter()
            .find(|t| t.name() == tool)
            .ok_or_else(|| ToolServerError::UnknownTool(tool.to_string()))?;
        handler.run(arguments, ctx).await
    }
}

/// A tool offered to the model for one turn
#[derive(Debug, Clone)]
pub struct OfferedTool {
    pub server: String,
    pub tool: String,
    pub kind: ToolKind,
    pub definition: ToolDefinition,
}

pub fn qualified_name(server: &str, tool: &str) -> String {
    format!("{server}_{tool}")
}

/// Schema `format` marking an argument that names an uploaded file
pub const FILE_REF_FORMAT: &str = "file-ref";

/// Top-level arguments of `schema` that hold uploaded file names, either
/// one name or an array of them
pub fn file_arguments(schema: &Value) -> Vec<String> {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Vec::new();
    };
    properties
        .iter()
        .filter(|(_, property)| {
            let property = property.get("items").unwrap_or(property);
            property.get("format").and_then(Value::as_str) == Some(FILE_REF_FORMAT)
        })
        .map(|(name, _)| name.clone())
        .collect()
}

/// All known tool servers, by name
#[derive(Default)]
pub struct ToolCatalog {
    servers: BTreeMap<String, Arc<dyn ToolServer>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding the in-process servers
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register(Arc::new(LocalToolServer::calculator()));
        catalog.register(Arc::new(LocalToolServer::canvas()));
        catalog.register(Arc::new(LocalToolServer::files()));
        catalog
    }

    pub fn register(&mut self, server: Arc<dyn ToolServer>) {
        let name = server.name().to_string();
        if self.servers.insert(name.clone(), server).is_some() {
            tracing::warn!(server = %name, "Replacing tool server with the same name");
        }
    }

    pub fn get(&self, server: &str) -> Option<Arc<dyn ToolServer>> {
        self.servers.get(server).cloned()
    }

    pub fn server_names(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }

    /// Split a qualified tool name into its server and tool. The longest
    /// matching server name wins.
    pub fn split_qualified<'a>(&self, qualified: &'a str) -> Option<(&str, &'a str)> {
        self.servers
            .keys()
            .filter_map(|server| {
                qualified
                    .strip_prefix(server.as_str())
                    .and_then(|rest| rest.strip_prefix('_'))
                    .filter(|tool| !tool.is_empty())
                    .map(|tool| (server.as_str(), tool))
            })
            .max_by_key(|(server, _)| server.len())
    }

    /// Resolve a selection entry: a server name selects the whole server,
    /// a qualified name selects one tool.
    pub async fn resolve_selection(&self, entry: &str) -> Result<SelectionTarget, String> {
        if let Some(server) = self.servers.get(entry) {
            return Ok(SelectionTarget {
                server: entry.to_string(),
                tool: None,
                exclusive: server.policy().exclusive,
            });
        }

        let (server_name, tool) = self
            .split_qualified(entry)
            .ok_or_else(|| format!("Unknown tool or server '{entry}'"))?;
        let server = self
            .servers
            .get(server_name)
            .ok_or_else(|| format!("Unknown tool server '{server_name}'"))?;
        let tools = server.list_tools().await.map_err(|e| e.to_string())?;
        if !tools.iter().any(|spec| spec.name == tool) {
            return Err(format!("Unknown tool '{entry}'"));
        }
        Ok(SelectionTarget {
            server: server_name.to_string(),
            tool: Some(tool.to_string()),
            exclusive: server.policy().exclusive,
        })
    }

    /// Tools the selection offers to the model. A server that fails to
    /// list its tools is skipped for this turn.
    pub async fn offered_tools(&self, selection: &ToolSelection) -> Vec<OfferedTool> {
        let mut offered = Vec::new();
        for (server_name, _) in selection.servers() {
            let Some(server) = self.servers.get(server_name) else {
                continue;
            };
            let specs = match server.list_tools().await {
                Ok(specs) => specs,
                Err(e) => {
                    tracing::warn!(server = %server_name, error = %e, "Failed to list tools");
                    continue;
                }
            };
            offered.extend(
                specs
                    .into_iter()
                    .filter(|spec| selection.allows(server_name, &spec.name))
                    .map(|spec| OfferedTool {
                        server: server_name.to_string(),
                        definition: ToolDefinition {
                            name: qualified_name(server_name, &spec.name),
                            description: spec.description,
                            input_schema: spec.input_schema,
                        },
                        tool: spec.name,
                        kind: spec.kind,
                    }),
            );
        }
        offered
    }
}
