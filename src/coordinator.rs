//! Tool invocation coordinator
//!
//! Runs one round of model-proposed tool calls. Every call gets a start
//! event before any call is spawned, calls run concurrently up to the
//! configured bound (calls to a sequential server share one lane and run
//! in proposal order), and the round returns only once every call has
//! finished, with results in proposal order. Failures of any kind become
//! failed results; nothing here aborts the turn.

use crate::auth::{Decision, ToolAuthorizer};
use crate::events::{EventEmitter, TurnEvent};
use crate::llm::{ContentBlock, ToolUse};
use crate::session::{ToolCallRecord, ToolSelection};
use crate::storage::{FileRef, FileStore};
use crate::tools::{ToolCatalog, ToolContext, ToolKind, ToolOutput};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub const UNAUTHORIZED: &str = "Unauthorized";
pub const TIMEOUT: &str = "Timeout";
pub const NOT_SELECTED: &str = "Tool not selected";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredArtifact {
    pub name: String,
    pub media_type: String,
    pub reference: FileRef,
}

/// Decoded tool result payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolPayload {
    Text { text: String },
    File { files: Vec<StoredArtifact>, text: String },
    Html { fragment: String, text: String },
    Error { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
    pub success: bool,
    pub payload: ToolPayload,
    pub elapsed: Duration,
}

impl ToolResult {
    fn new(call: &ToolUse, payload: ToolPayload, elapsed: Duration) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.input.clone(),
            success: !matches!(payload, ToolPayload::Error { .. }),
            payload,
            elapsed,
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match &self.payload {
            ToolPayload::Error { reason } => Some(reason),
            _ => None,
        }
    }

    /// What the model sees as this call's result
    pub fn observation(&self) -> String {
        match &self.payload {
            ToolPayload::Text { text } => text.clone(),
            ToolPayload::File { files, text } => {
                let mut observation = text.clone();
                for file in files {
                    if !observation.is_empty() {
                        observation.push('\n');
                    }
                    observation.push_str(&format!("Created file {} ({})", file.name, file.reference));
                }
                observation
            }
            ToolPayload::Html { text, .. } if !text.is_empty() => text.clone(),
            ToolPayload::Html { .. } => "Displayed content on the user's canvas.".to_string(),
            ToolPayload::Error { reason } => format!("Error: {reason}"),
        }
    }

    pub fn to_content_block(&self) -> ContentBlock {
        ContentBlock::tool_result(&self.call_id, self.observation(), !self.success)
    }

    pub fn to_record(&self) -> ToolCallRecord {
        ToolCallRecord {
            call_id: self.call_id.clone(),
            name: self.name.clone(),
            arguments: self.arguments.clone(),
            success: self.success,
            output: self.failure_reason().map_or_else(|| self.observation(), str::to_string),
        }
    }

    pub fn artifacts(&self) -> Vec<FileRef> {
        match &self.payload {
            ToolPayload::File { files, .. } => files.iter().map(|f| f.reference.clone()).collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    pub call_timeout: Duration,
    pub max_concurrency: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            max_concurrency: 4,
        }
    }
}

/// Per-turn context injected into every call of a round
pub struct TurnScope {
    pub session_id: String,
    pub user_id: String,
    pub turn_id: String,
    /// Uploaded files by display name
    pub files: BTreeMap<String, FileRef>,
    pub selection: ToolSelection,
    /// Routing kind by qualified tool name
    pub kinds: HashMap<String, ToolKind>,
    /// Arguments holding uploaded file names, by qualified tool name
    pub file_arguments: HashMap<String, Vec<String>>,
    pub cancel: CancellationToken,
    pub emitter: EventEmitter,
}

struct CoordinatorInner {
    catalog: Arc<ToolCatalog>,
    authorizer: Arc<ToolAuthorizer>,
    files: Arc<dyn FileStore>,
    config: CoordinatorConfig,
}

#[derive(Clone)]
pub struct ToolCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl ToolCoordinator {
    pub fn new(
        catalog: Arc<ToolCatalog>,
        authorizer: Arc<ToolAuthorizer>,
        files: Arc<dyn FileStore>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                catalog,
                authorizer,
                files,
                config,
            }),
        }
    }

    /// Execute one round of calls. Returns one result per call, in
    /// proposal order, after all calls have finished.
    pub async fn run_round(&self, scope: &Arc<TurnScope>, calls: Vec<ToolUse>) -> Vec<ToolResult> {
        for call in &calls {
            scope.emitter.emit(TurnEvent::ToolCallStarted {
                call_id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.input.clone(),
            });
        }

        let proposed = calls.clone();
        let permits = Arc::new(Semaphore::new(self.inner.config.max_concurrency.max(1)));
        let mut join_set = JoinSet::new();
        for lane in self.lanes(calls) {
            let this = self.clone();
            let scope = Arc::clone(scope);
            let permits = Arc::clone(&permits);
            join_set.spawn(async move {
                let mut finished = Vec::with_capacity(lane.len());
                for (index, call) in lane {
                    let _permit = permits.acquire().await.ok();
                    finished.push((index, this.invoke(&scope, &call).await));
                }
                finished
            });
        }

        let mut results: Vec<Option<ToolResult>> = vec![None; proposed.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(finished) => {
                    for (index, result) in finished {
                        results[index] = Some(result);
                    }
                }
                Err(e) => {
                    tracing::error!(turn_id = %scope.turn_id, error = %e, "Tool task failed");
                }
            }
        }

        results
            .into_iter()
            .zip(proposed)
            .map(|(result, call)| {
                result.unwrap_or_else(|| {
                    let result = ToolResult::new(
                        &call,
                        ToolPayload::Error {
                            reason: "Internal error".to_string(),
                        },
                        Duration::ZERO,
                    );
                    emit_finished(&scope.emitter, &result);
                    result
                })
            })
            .collect()
    }

    /// Group calls into lanes: one per sequential server, one per other call
    fn lanes(&self, calls: Vec<ToolUse>) -> Vec<Vec<(usize, ToolUse)>> {
        let mut lanes: Vec<Vec<(usize, ToolUse)>> = Vec::new();
        let mut sequential: HashMap<String, usize> = HashMap::new();
        for (index, call) in calls.into_iter().enumerate() {
            let sequential_server = self
                .inner
                .catalog
                .split_qualified(&call.name)
                .filter(|(server, _)| {
                    self.inner
                        .catalog
                        .get(server)
                        .is_some_and(|s| s.policy().sequential)
                })
                .map(|(server, _)| server.to_string());
            match sequential_server {
                Some(server) => {
                    let lane = *sequential.entry(server).or_insert_with(|| {
                        lanes.push(Vec::new());
                        lanes.len() - 1
                    });
                    lanes[lane].push((index, call));
                }
                None => lanes.push(vec![(index, call)]),
            }
        }
        lanes
    }

    async fn invoke(&self, scope: &TurnScope, call: &ToolUse) -> ToolResult {
        let started = Instant::now();
        let payload = self.execute(scope, call).await;
        let result = ToolResult::new(call, payload, started.elapsed());

        tracing::info!(
            turn_id = %scope.turn_id,
            call_id = %result.call_id,
            tool = %result.name,
            success = result.success,
            duration_ms = %result.elapsed.as_millis(),
            "Tool call finished"
        );

        if let ToolPayload::Html { fragment, .. } = &result.payload {
            scope.emitter.emit(TurnEvent::UiPayload {
                call_id: result.call_id.clone(),
                html: fragment.clone(),
            });
        }
        emit_finished(&scope.emitter, &result);
        result
    }

    async fn execute(&self, scope: &TurnScope, call: &ToolUse) -> ToolPayload {
        let catalog = &self.inner.catalog;
        let Some((server_name, tool)) = catalog.split_qualified(&call.name) else {
            return error_payload(format!("Unknown tool: {}", call.name));
        };
        if !scope.selection.allows(server_name, tool) {
            return error_payload(NOT_SELECTED);
        }

        if let Decision::Deny(denial) = self
            .inner
            .authorizer
            .authorize(&scope.user_id, server_name)
            .await
        {
            tracing::warn!(
                user_id = %scope.user_id,
                server = %server_name,
                ?denial,
                "Tool call denied"
            );
            return error_payload(UNAUTHORIZED);
        }

        let Some(server) = catalog.get(server_name) else {
            return error_payload(UNAUTHORIZED);
        };

        let ctx = ToolContext::new(
            scope.cancel.clone(),
            scope.session_id.clone(),
            scope.user_id.clone(),
            scope.turn_id.clone(),
            call.id.clone(),
            Arc::clone(&self.inner.files),
            Some(scope.emitter.clone()),
        );
        let arguments = match scope.file_arguments.get(&call.name) {
            Some(names) => inject_file_references(call.input.clone(), names, &scope.files),
            None => call.input.clone(),
        };

        match tokio::time::timeout(
            self.inner.config.call_timeout,
            server.call_tool(tool, arguments, ctx),
        )
        .await
        {
            Err(_) => error_payload(TIMEOUT),
            Ok(Err(e)) => error_payload(e.to_string()),
            Ok(Ok(output)) => {
                let kind = scope.kinds.get(&call.name).copied().unwrap_or_default();
                self.decode(scope, output, kind).await
            }
        }
    }

    /// Decode a raw tool output once into its payload variant, storing
    /// any artifacts on the caller's behalf
    async fn decode(&self, scope: &TurnScope, output: ToolOutput, kind: ToolKind) -> ToolPayload {
        if kind == ToolKind::Canvas || output.ui_payload.is_some() {
            return match output.ui_payload {
                Some(fragment) => ToolPayload::Html {
                    fragment,
                    text: output.content,
                },
                None => ToolPayload::Html {
                    fragment: output.content,
                    text: String::new(),
                },
            };
        }
        if output.artifacts.is_empty() {
            return ToolPayload::Text {
                text: output.content,
            };
        }

        let mut files = Vec::with_capacity(output.artifacts.len());
        for artifact in output.artifacts {
            match self
                .inner
                .files
                .put(&scope.user_id, &artifact.name, artifact.data)
                .await
            {
                Ok(stored) => files.push(StoredArtifact {
                    name: artifact.name,
                    media_type: artifact.media_type,
                    reference: stored.reference,
                }),
                Err(e) => {
                    tracing::error!(error = %e, artifact = %artifact.name, "Failed to store artifact");
                    return error_payload(format!("Failed to store {}", artifact.name));
                }
            }
        }
        ToolPayload::File {
            files,
            text: output.content,
        }
    }
}

fn error_payload(reason: impl Into<String>) -> ToolPayload {
    ToolPayload::Error {
        reason: reason.into(),
    }
}

fn emit_finished(emitter: &EventEmitter, result: &ToolResult) {
    let event = match result.failure_reason() {
        Some(reason) => TurnEvent::ToolCallFailed {
            call_id: result.call_id.clone(),
            name: result.name.clone(),
            success: false,
            reason: reason.to_string(),
        },
        None => TurnEvent::ToolCallCompleted {
            call_id: result.call_id.clone(),
            name: result.name.clone(),
            success: true,
            output: result.observation(),
        },
    };
    emitter.emit(event);
}

/// Replace uploaded file names with their references in the arguments
/// listed in `names`. Other arguments pass through untouched.
pub fn inject_file_references(
    input: Value,
    names: &[String],
    files: &BTreeMap<String, FileRef>,
) -> Value {
    let Value::Object(mut map) = input else {
        return input;
    };
    for name in names {
        match map.get_mut(name) {
            Some(Value::Array(items)) => {
                for item in items {
                    swap_reference(item, files);
                }
            }
            Some(value) => swap_reference(value, files),
            None => {}
        }
    }
    Value::Object(map)
}

fn swap_reference(value: &mut Value, files: &BTreeMap<String, FileRef>) {
    if let Some(reference) = value.as_str().and_then(|name| files.get(name)) {
        *value = Value::String(reference.as_str().to_string());
    }
}
