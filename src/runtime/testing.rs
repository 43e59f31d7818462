//! Mock implementations for testing
//!
//! These mocks let the router, coordinator and agent loop run end to end
//! without a model provider, tool servers or a retrieval service.

use super::router::{TurnRequest, TurnRouter};
use super::traits::ModelClient;
use crate::auth::{StaticGroupDirectory, ToolAuthorizer};
use crate::coordinator::{CoordinatorConfig, ToolCoordinator};
use crate::events::EventEnvelope;
use crate::llm::{ContentBlock, LlmError, LlmRequest, LlmResponse, ModelInfo, Usage};
use crate::retrieval::{
    RetrievalAnswer, RetrievalError, RetrievalIntegrator, RetrievalService, SourceAttribution,
};
use crate::runtime::{RouterSettings, SharedRouter};
use crate::session::{SessionHandle, SessionStore};
use crate::storage::InMemoryFileStore;
use crate::tools::{
    ServerPolicy, ToolCatalog, ToolContext, ToolOutput, ToolServer, ToolServerError, ToolSpec,
    ToolKind,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub const TEST_MODEL: &str = "test-model";

// ============================================================================
// Mock Model Client
// ============================================================================

/// Model client that returns queued responses in order
pub struct MockModelClient {
    responses: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    models: BTreeSet<String>,
    delay: Mutex<Option<Duration>>,
    requests: Mutex<Vec<(String, LlmRequest)>>,
}

impl MockModelClient {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            models: [TEST_MODEL.to_string(), "m1".to_string()].into(),
            delay: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn queue_response(&self, response: LlmResponse) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    pub fn queue_text(&self, text: &str) {
        self.queue_response(response(vec![ContentBlock::text(text)]));
    }

    /// Queue a response proposing one tool call, optionally with text
    pub fn queue_tool_call(&self, text: &str, id: &str, name: &str, input: Value) {
        let mut content = Vec::new();
        if !text.is_empty() {
            content.push(ContentBlock::text(text));
        }
        content.push(ContentBlock::tool_use(id, name, input));
        self.queue_response(response(content));
    }

    pub fn queue_error(&self, error: LlmError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    /// Delay every response, to hold a turn open
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Recorded requests with the model id each was sent to
    pub fn requests(&self) -> Vec<(String, LlmRequest)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl Default for MockModelClient {
    fn default() -> Self {
        Self::new()
    }
}

fn response(content: Vec<ContentBlock>) -> LlmResponse {
    LlmResponse {
        content,
        end_turn: true,
        usage: Usage::default(),
    }
}

#[async_trait]
impl ModelClient for MockModelClient {
    fn has_model(&self, model_id: &str) -> bool {
        self.models.contains(model_id)
    }

    fn default_model_id(&self) -> String {
        TEST_MODEL.to_string()
    }

    fn model_info(&self) -> Vec<ModelInfo> {
        self.models
            .iter()
            .map(|id| ModelInfo {
                id: id.clone(),
                description: "Scripted test model".to_string(),
            })
            .collect()
    }

    async fn complete(
        &self,
        model_id: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse, LlmError> {
        self.requests
            .lock()
            .unwrap()
            .push((model_id.to_string(), request.clone()));
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::invalid_request("No mock response queued")))
    }
}

// ============================================================================
// Mock Tool Server
// ============================================================================

#[derive(Debug, Clone)]
pub enum MockBehavior {
    Reply(ToolOutput),
    Delay(Duration, ToolOutput),
    Fail(String),
    /// Never returns
    Hang,
}

/// Tool server with scripted tools that records every call
pub struct MockToolServer {
    name: String,
    policy: ServerPolicy,
    tools: Vec<(String, MockBehavior)>,
    calls: Mutex<Vec<(String, Value)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockToolServer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            policy: ServerPolicy::default(),
            tools: Vec::new(),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: ServerPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_tool(mut self, name: &str, behavior: MockBehavior) -> Self {
        self.tools.push((name.to_string(), behavior));
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Highest number of calls that were running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Tool name and arguments of every call, in arrival order
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ToolServer for MockToolServer {
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
            .map(|(name, _)| ToolSpec {
                name: name.clone(),
                description: format!("Mock {name}"),
                input_schema: json!({"type": "object", "properties": {}}),
                kind: ToolKind::Standard,
            })
            .collect())
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        _ctx: ToolContext,
    ) -> Result<ToolOutput, ToolServerError> {
        let behavior = self
            .tools
            .iter()
            .find(|(name, _)| name == tool)
            .map(|(_, behavior)| behavior.clone())
            .ok_or_else(|| ToolServerError::UnknownTool(tool.to_string()))?;

        self.calls.lock().unwrap().push((tool.to_string(), arguments));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        match behavior {
            MockBehavior::Reply(output) => Ok(output),
            MockBehavior::Delay(delay, output) => {
                tokio::time::sleep(delay).await;
                Ok(output)
            }
            MockBehavior::Fail(message) => Err(ToolServerError::Failed(message)),
            MockBehavior::Hang => std::future::pending().await,
        }
    }
}

// ============================================================================
// Mock Retrieval Service
// ============================================================================

pub struct MockRetrieval {
    sources: Vec<String>,
    answer: String,
    failures: AtomicUsize,
    attempts: AtomicUsize,
    discovers: AtomicUsize,
    queries: Mutex<Vec<Vec<String>>>,
}

impl MockRetrieval {
    pub fn new(sources: &[&str]) -> Self {
        Self {
            sources: sources.iter().map(|s| (*s).to_string()).collect(),
            answer: "The handbook grants 25 vacation days per year.".to_string(),
            failures: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
            discovers: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_answer(mut self, answer: &str) -> Self {
        self.answer = answer.to_string();
        self
    }

    /// Fail the next `n` queries with a transient error
    pub fn fail_next_queries(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Source ids of every query that reached the service
    pub fn recorded_queries(&self) -> Vec<Vec<String>> {
        self.queries.lock().unwrap().clone()
    }

    pub fn query_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn discover_calls(&self) -> usize {
        self.discovers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RetrievalService for MockRetrieval {
    async fn discover(&self, _user: &str) -> Result<Vec<String>, RetrievalError> {
        self.discovers.fetch_add(1, Ordering::SeqCst);
        Ok(self.sources.clone())
    }

    async fn query(
        &self,
        _user: &str,
        sources: &[String],
        _text: &str,
    ) -> Result<RetrievalAnswer, RetrievalError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(RetrievalError::Unavailable("connection reset".to_string()));
        }

        self.queries.lock().unwrap().push(sources.to_vec());
        Ok(RetrievalAnswer {
            answer: self.answer.clone(),
            attributions: sources
                .iter()
                .map(|id| SourceAttribution {
                    source_id: id.clone(),
                    title: format!("Source {id}"),
                    snippet: None,
                })
                .collect(),
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn tool_context(user: &str) -> ToolContext {
    tool_context_with_files(user, Arc::new(InMemoryFileStore::new()))
}

pub fn tool_context_with_files(user: &str, files: Arc<InMemoryFileStore>) -> ToolContext {
    ToolContext::new(
        CancellationToken::new(),
        "session".to_string(),
        user.to_string(),
        "turn".to_string(),
        "call".to_string(),
        files,
        None,
    )
}

/// Everything already sitting in the receiver
pub fn drain_events(rx: &mut broadcast::Receiver<EventEnvelope>) -> Vec<EventEnvelope> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// A router wired to mocks, plus handles on each mock
pub struct Harness {
    pub router: Arc<SharedRouter>,
    pub models: Arc<MockModelClient>,
    pub sessions: Arc<SessionStore>,
    pub authorizer: Arc<ToolAuthorizer>,
    pub directory: Arc<StaticGroupDirectory>,
    pub files: Arc<InMemoryFileStore>,
    pub retrieval: Arc<MockRetrieval>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_servers(vec![], CoordinatorConfig::default())
    }

    pub fn with_servers(servers: Vec<Arc<dyn ToolServer>>, config: CoordinatorConfig) -> Self {
        let mut catalog = ToolCatalog::builtin();
        for server in servers {
            catalog.register(server);
        }
        let catalog = Arc::new(catalog);
        let directory = Arc::new(StaticGroupDirectory::default());
        let files = Arc::new(InMemoryFileStore::new());
        let authorizer = Arc::new(ToolAuthorizer::new(catalog.clone(), directory.clone()));
        let coordinator =
            ToolCoordinator::new(catalog.clone(), authorizer.clone(), files.clone(), config);
        let retrieval = Arc::new(MockRetrieval::new(&["docs", "wiki"]));
        let integrator = Arc::new(RetrievalIntegrator::new(Some(retrieval.clone())));
        let models = Arc::new(MockModelClient::new());

        Self {
            router: Arc::new(TurnRouter::new(
                models.clone() as Arc<dyn ModelClient>,
                catalog,
                coordinator,
                integrator,
                RouterSettings::default(),
            )),
            models,
            sessions: Arc::new(SessionStore::new(5, Duration::from_secs(600))),
            authorizer,
            directory,
            files,
            retrieval,
        }
    }

    pub async fn session(&self) -> Arc<SessionHandle> {
        self.sessions.create("alice").await
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

pub fn text_request(text: &str) -> TurnRequest {
    TurnRequest {
        text: text.to_string(),
        ..TurnRequest::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{TIMEOUT, UNAUTHORIZED};
    use crate::error::ErrorKind;
    use crate::events::TurnEvent;
    use crate::runtime::ExecutionPath;
    use crate::session::{AgentOutcome, MessageKind, Role};

    fn event_types(events: &[EventEnvelope]) -> Vec<&'static str> {
        events.iter().map(|e| e.event.event_type()).collect()
    }

    fn position(events: &[EventEnvelope], event_type: &str) -> usize {
        events
            .iter()
            .position(|e| e.event.event_type() == event_type)
            .unwrap_or_else(|| panic!("no {event_type} event in {:?}", event_types(events)))
    }

    // ========================================================================
    // Plain and tool-augmented paths
    // ========================================================================

    #[tokio::test]
    async fn plain_turn_appends_exactly_two_messages() {
        let harness = Harness::new();
        let handle = harness.session().await;
        let mut rx = handle.subscribe();
        harness.models.queue_text("Hello there!");

        let message = harness
            .router
            .handle_turn(&handle, "alice", text_request("Hi"))
            .await
            .unwrap();
        assert_eq!(message.content, "Hello there!");
        assert_eq!(message.kind, MessageKind::Chat);

        let session = handle.lock().await;
        assert_eq!(session.history().len(), 2);
        assert_eq!(session.history()[0].role, Role::User);
        assert_eq!(session.history()[0].content, "Hi");
        drop(session);

        let events = drain_events(&mut rx);
        assert!(matches!(
            events[0].event,
            TurnEvent::TurnStarted { path: ExecutionPath::Plain }
        ));
        assert_eq!(event_types(&events).last(), Some(&"final_response"));
        assert!(harness.models.requests()[0].1.tools.is_empty());
    }

    #[tokio::test]
    async fn calculator_scenario_reports_four() {
        let harness = Harness::new();
        let handle = harness.session().await;
        let mut rx = handle.subscribe();
        harness
            .models
            .queue_tool_call("", "toolu_1", "calculator_evaluate", json!({"expression": "2+2"}));
        harness.models.queue_text("2 + 2 = 4");

        let request = TurnRequest {
            text: "2+2?".to_string(),
            model_id: Some("m1".to_string()),
            selected_tools: Some(vec!["calculator_evaluate".to_string()]),
            ..TurnRequest::default()
        };
        let message = harness.router.handle_turn(&handle, "alice", request).await.unwrap();

        let events = drain_events(&mut rx);
        let started = position(&events, "tool_call_started");
        let completed = position(&events, "tool_call_completed");
        assert!(started < completed);
        assert!(matches!(
            &events[started].event,
            TurnEvent::ToolCallStarted { name, .. } if name == "calculator_evaluate"
        ));
        assert!(matches!(
            &events[completed].event,
            TurnEvent::ToolCallCompleted { success: true, output, .. } if output == "4"
        ));
        let last = events.last().unwrap();
        assert!(matches!(
            &last.event,
            TurnEvent::FinalResponse { message } if message.content.contains('4')
        ));

        assert!(message.content.contains('4'));
        assert_eq!(message.tool_calls.len(), 1);
        assert!(message.tool_calls[0].success);

        let requests = harness.models.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].0, "m1");
        let offered: Vec<_> = requests[0].1.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(offered, vec!["calculator_evaluate"]);

        // Tool traces stay on the bundled response
        assert_eq!(handle.lock().await.history().len(), 2);
    }

    #[tokio::test]
    async fn unauthorized_server_fails_call_but_not_turn() {
        let payroll = Arc::new(
            MockToolServer::new("payroll")
                .with_policy(ServerPolicy {
                    required_groups: ["hr".to_string()].into(),
                    ..ServerPolicy::default()
                })
                .with_tool("lookup", MockBehavior::Reply(ToolOutput::text("salary table"))),
        );
        let harness = Harness::with_servers(vec![payroll.clone()], CoordinatorConfig::default());
        let handle = harness.session().await;
        harness
            .models
            .queue_tool_call("", "c1", "payroll_lookup", json!({}));
        harness.models.queue_text("I am not allowed to read payroll data.");

        let request = TurnRequest {
            text: "What does Bob earn?".to_string(),
            selected_tools: Some(vec!["payroll".to_string()]),
            ..TurnRequest::default()
        };
        let message = harness.router.handle_turn(&handle, "alice", request).await.unwrap();

        assert_eq!(payroll.call_count(), 0);
        assert!(!message.tool_calls[0].success);
        assert_eq!(message.tool_calls[0].output, UNAUTHORIZED);

        let follow_up = &harness.models.requests()[1].1;
        assert!(matches!(
            &follow_up.messages.last().unwrap().content[0],
            ContentBlock::ToolResult { is_error: true, content, .. } if content.contains(UNAUTHORIZED)
        ));
    }

    #[tokio::test]
    async fn revoked_group_applies_to_the_next_call() {
        let payroll = Arc::new(
            MockToolServer::new("payroll")
                .with_policy(ServerPolicy {
                    required_groups: ["hr".to_string()].into(),
                    ..ServerPolicy::default()
                })
                .with_tool("lookup", MockBehavior::Reply(ToolOutput::text("ok"))),
        );
        let harness = Harness::with_servers(vec![payroll.clone()], CoordinatorConfig::default());
        harness.directory.grant("alice", "hr");
        let handle = harness.session().await;
        let request = TurnRequest {
            text: "lookup".to_string(),
            selected_tools: Some(vec!["payroll".to_string()]),
            ..TurnRequest::default()
        };

        harness.models.queue_tool_call("", "c1", "payroll_lookup", json!({}));
        harness.models.queue_text("done");
        let first = harness.router.handle_turn(&handle, "alice", request.clone()).await.unwrap();
        assert!(first.tool_calls[0].success);

        harness.directory.revoke("alice", "hr");
        harness.models.queue_tool_call("", "c2", "payroll_lookup", json!({}));
        harness.models.queue_text("denied");
        let second = harness.router.handle_turn(&handle, "alice", request).await.unwrap();
        assert_eq!(second.tool_calls[0].output, UNAUTHORIZED);
        assert_eq!(payroll.call_count(), 1);
    }

    #[tokio::test]
    async fn timed_out_call_is_reported_to_the_model() {
        let slow = Arc::new(MockToolServer::new("slow").with_tool("forever", MockBehavior::Hang));
        let harness = Harness::with_servers(
            vec![slow],
            CoordinatorConfig {
                call_timeout: Duration::from_millis(50),
                ..CoordinatorConfig::default()
            },
        );
        let handle = harness.session().await;
        harness.models.queue_tool_call("", "c1", "slow_forever", json!({}));
        harness.models.queue_text("The tool took too long.");

        let request = TurnRequest {
            text: "run it".to_string(),
            selected_tools: Some(vec!["slow".to_string()]),
            ..TurnRequest::default()
        };
        let message = harness.router.handle_turn(&handle, "alice", request).await.unwrap();
        assert_eq!(message.tool_calls[0].output, TIMEOUT);
        assert_eq!(message.content, "The tool took too long.");
    }

    #[tokio::test]
    async fn selection_persists_across_turns() {
        let harness = Harness::new();
        let handle = harness.session().await;
        harness.models.queue_text("first");
        harness.models.queue_text("second");

        let request = TurnRequest {
            text: "one".to_string(),
            selected_tools: Some(vec!["calculator".to_string()]),
            ..TurnRequest::default()
        };
        harness.router.handle_turn(&handle, "alice", request).await.unwrap();
        harness
            .router
            .handle_turn(&handle, "alice", text_request("two"))
            .await
            .unwrap();

        let requests = harness.models.requests();
        assert_eq!(requests[1].1.tools.len(), 1);
        // Earlier turn is replayed as conversation text
        assert_eq!(requests[1].1.messages.len(), 3);
    }

    // ========================================================================
    // Validation and provider errors
    // ========================================================================

    #[tokio::test]
    async fn invalid_requests_leave_session_untouched() {
        let harness = Harness::new();
        let handle = harness.session().await;
        let mut rx = handle.subscribe();

        let cases = [
            text_request("   "),
            TurnRequest {
                text: "hi".to_string(),
                model_id: Some("no-such-model".to_string()),
                ..TurnRequest::default()
            },
            TurnRequest {
                text: "hi".to_string(),
                agent_mode: true,
                agent_max_steps: Some(0),
                ..TurnRequest::default()
            },
            TurnRequest {
                text: "hi".to_string(),
                selected_tools: Some(vec!["calculator".to_string(), "nonexistent_tool".to_string()]),
                ..TurnRequest::default()
            },
            TurnRequest {
                text: "hi".to_string(),
                retrieval_only: true,
                selected_sources: Some(vec!["  ".to_string()]),
                ..TurnRequest::default()
            },
        ];

        for request in cases {
            let err = harness
                .router
                .handle_turn(&handle, "alice", request)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{err}");
        }

        let session = handle.lock().await;
        assert!(session.history().is_empty());
        assert!(session.selection.is_empty());
        assert_eq!(session.agent.max_steps, 5);
        drop(session);

        assert_eq!(harness.models.request_count(), 0);
        let events = drain_events(&mut rx);
        assert_eq!(events.len(), 5);
        assert!(events.iter().all(|e| matches!(
            e.event,
            TurnEvent::TurnError { kind: ErrorKind::Validation, .. }
        )));
    }

    #[tokio::test]
    async fn provider_failure_emits_single_error_and_keeps_history() {
        let harness = Harness::new();
        let handle = harness.session().await;
        harness.models.queue_text("ok");
        harness
            .router
            .handle_turn(&handle, "alice", text_request("first"))
            .await
            .unwrap();

        let mut rx = handle.subscribe();
        harness.models.queue_error(LlmError::auth("bad key"));
        let request = TurnRequest {
            text: "second".to_string(),
            selected_tools: Some(vec!["canvas".to_string()]),
            ..TurnRequest::default()
        };
        let err = harness
            .router
            .handle_turn(&handle, "alice", request)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Provider);

        let session = handle.lock().await;
        assert_eq!(session.history().len(), 2);
        assert!(session.selection.is_empty());
        drop(session);

        let types = event_types(&drain_events(&mut rx));
        assert_eq!(types, vec!["turn_started", "turn_error"]);
    }

    #[tokio::test]
    async fn transient_model_failure_is_retried_once() {
        let harness = Harness::new();
        let handle = harness.session().await;
        harness.models.queue_error(LlmError::server_error("overloaded"));
        harness.models.queue_text("recovered");

        let message = harness
            .router
            .handle_turn(&handle, "alice", text_request("hi"))
            .await
            .unwrap();
        assert_eq!(message.content, "recovered");
        assert_eq!(harness.models.request_count(), 2);
    }

    #[tokio::test]
    async fn malformed_tool_call_aborts_turn() {
        let harness = Harness::new();
        let handle = harness.session().await;
        harness
            .models
            .queue_tool_call("", "c1", "calculator_evaluate", json!("2+2"));

        let request = TurnRequest {
            text: "2+2?".to_string(),
            selected_tools: Some(vec!["calculator".to_string()]),
            ..TurnRequest::default()
        };
        let err = harness
            .router
            .handle_turn(&handle, "alice", request)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Provider);
        assert!(handle.lock().await.history().is_empty());
    }

    // ========================================================================
    // Agent path
    // ========================================================================

    #[tokio::test]
    async fn agent_budget_of_two_stops_after_second_round() {
        let harness = Harness::new();
        let handle = harness.session().await;
        let mut rx = handle.subscribe();
        for i in 0..3 {
            harness.models.queue_tool_call(
                "thinking",
                &format!("c{i}"),
                "calculator_evaluate",
                json!({"expression": "1+1"}),
            );
        }

        let request = TurnRequest {
            text: "keep going".to_string(),
            selected_tools: Some(vec!["calculator".to_string()]),
            agent_mode: true,
            agent_max_steps: Some(2),
            ..TurnRequest::default()
        };
        let message = harness.router.handle_turn(&handle, "alice", request).await.unwrap();

        assert_eq!(harness.models.request_count(), 2);
        assert!(matches!(
            &message.kind,
            MessageKind::Agent { outcome: AgentOutcome::MaxStepsReached, steps } if steps.len() == 2
        ));

        let events = drain_events(&mut rx);
        let reached = position(&events, "max_steps_reached");
        assert!(matches!(events[reached].event, TurnEvent::MaxStepsReached { steps: 2 }));
        assert_eq!(event_types(&events).last(), Some(&"final_response"));
        assert_eq!(handle.lock().await.history().len(), 2);
    }

    #[tokio::test]
    async fn agent_completes_within_budget() {
        let harness = Harness::new();
        let handle = harness.session().await;
        harness.models.queue_text("Let me think about this.");
        harness
            .models
            .queue_tool_call("", "c1", "final_answer", json!({"answer": "Paris."}));

        let request = TurnRequest {
            text: "Capital of France?".to_string(),
            agent_mode: true,
            ..TurnRequest::default()
        };
        let message = harness.router.handle_turn(&handle, "alice", request).await.unwrap();
        assert_eq!(message.content, "Paris.");

        // Plain text is fed back verbatim with no synthetic prompt
        let second = &harness.models.requests()[1].1;
        assert_eq!(second.messages.len(), 2);
        assert!(matches!(
            &second.messages[1].content[0],
            ContentBlock::Text { text } if text == "Let me think about this."
        ));
        let tools: Vec<_> = second.tools.iter().map(|t| t.name.as_str()).collect();
        assert!(tools.contains(&"final_answer"));
    }

    #[tokio::test]
    async fn ask_user_suspends_and_next_message_resumes() {
        let harness = Harness::new();
        let handle = harness.session().await;
        harness
            .models
            .queue_tool_call("", "ask1", "ask_user", json!({"question": "Which city?"}));

        let request = TurnRequest {
            text: "Book a hotel".to_string(),
            agent_mode: true,
            ..TurnRequest::default()
        };
        let asked = harness.router.handle_turn(&handle, "alice", request).await.unwrap();
        assert_eq!(asked.content, "Which city?");
        assert_eq!(
            handle.lock().await.agent.pending_question(),
            Some("Which city?")
        );

        let mut rx = handle.subscribe();
        harness
            .models
            .queue_tool_call("", "c2", "final_answer", json!({"answer": "Booked in Lyon."}));
        let done = harness
            .router
            .handle_turn(&handle, "alice", text_request("Lyon"))
            .await
            .unwrap();
        assert_eq!(done.content, "Booked in Lyon.");

        let events = drain_events(&mut rx);
        assert!(matches!(
            events[0].event,
            TurnEvent::TurnStarted { path: ExecutionPath::AgentResume }
        ));
        let resumed = &harness.models.requests()[1].1.messages;
        assert!(matches!(
            &resumed.last().unwrap().content[0],
            ContentBlock::ToolResult { tool_use_id, content, .. } if tool_use_id == "ask1" && content == "Lyon"
        ));

        let session = handle.lock().await;
        assert!(session.agent.checkpoint.is_none());
        assert_eq!(session.history().len(), 4);
    }

    // ========================================================================
    // Retrieval
    // ========================================================================

    #[tokio::test]
    async fn retrieval_only_returns_answer_verbatim() {
        let harness = Harness::new();
        let handle = harness.session().await;
        let request = TurnRequest {
            text: "How many vacation days?".to_string(),
            selected_sources: Some(vec!["docs".to_string()]),
            retrieval_only: true,
            ..TurnRequest::default()
        };
        let message = harness.router.handle_turn(&handle, "alice", request).await.unwrap();

        assert_eq!(message.content, "The handbook grants 25 vacation days per year.");
        assert!(matches!(&message.kind, MessageKind::Retrieval { attributions } if attributions.len() == 1));
        assert_eq!(harness.models.request_count(), 0);
        assert_eq!(harness.retrieval.recorded_queries(), vec![vec!["docs".to_string()]]);
    }

    #[tokio::test]
    async fn integrated_retrieval_grounds_the_prompt() {
        let harness = Harness::new();
        let handle = harness.session().await;
        harness.models.queue_text("You get 25 days.");
        let request = TurnRequest {
            text: "How many vacation days?".to_string(),
            selected_sources: Some(vec!["wiki".to_string()]),
            ..TurnRequest::default()
        };
        harness.router.handle_turn(&handle, "alice", request).await.unwrap();

        let sent = &harness.models.requests()[0].1.messages[0];
        assert!(matches!(
            &sent.content[0],
            ContentBlock::Text { text } if text.contains("25 vacation days") && text.ends_with("How many vacation days?")
        ));

        // Stored history keeps what the user typed
        assert_eq!(
            handle.lock().await.history()[0].content,
            "How many vacation days?"
        );
    }

    // ========================================================================
    // Serialization and cancellation
    // ========================================================================

    #[tokio::test]
    async fn newer_message_cancels_running_tool_turn() {
        let slow = Arc::new(MockToolServer::new("slow").with_tool(
            "work",
            MockBehavior::Delay(Duration::from_millis(200), ToolOutput::text("done")),
        ));
        let harness = Harness::with_servers(vec![slow.clone()], CoordinatorConfig::default());
        let handle = harness.session().await;
        harness.models.queue_tool_call("", "c1", "slow_work", json!({}));
        harness.models.queue_text("second answer");

        let first = {
            let router = harness.router.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                let request = TurnRequest {
                    text: "start work".to_string(),
                    selected_tools: Some(vec!["slow".to_string()]),
                    ..TurnRequest::default()
                };
                router.handle_turn(&handle, "alice", request).await
            })
        };

        while slow.call_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let request = TurnRequest {
            text: "never mind".to_string(),
            selected_tools: Some(vec![]),
            ..TurnRequest::default()
        };
        let second = harness.router.handle_turn(&handle, "alice", request).await.unwrap();
        let first = first.await.unwrap().unwrap();

        assert!(matches!(first.kind, MessageKind::ToolAugmented { cancelled: true }));
        assert_eq!(second.content, "second answer");
        // The cancelled round's results were not sent back to the model
        assert_eq!(harness.models.request_count(), 2);

        let session = handle.lock().await;
        let contents: Vec<_> = session.history().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents[0], "start work");
        assert_eq!(contents[2], "never mind");
        assert_eq!(session.history().len(), 4);
    }

    #[tokio::test]
    async fn invalid_message_does_not_interrupt_running_turn() {
        let slow = Arc::new(MockToolServer::new("slow").with_tool(
            "work",
            MockBehavior::Delay(Duration::from_millis(200), ToolOutput::text("done")),
        ));
        let harness = Harness::with_servers(vec![slow.clone()], CoordinatorConfig::default());
        let handle = harness.session().await;
        harness.models.queue_tool_call("", "c1", "slow_work", json!({}));
        harness.models.queue_text("work finished");

        let first = {
            let router = harness.router.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                let request = TurnRequest {
                    text: "start work".to_string(),
                    selected_tools: Some(vec!["slow".to_string()]),
                    ..TurnRequest::default()
                };
                router.handle_turn(&handle, "alice", request).await
            })
        };

        while slow.call_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let err = harness
            .router
            .handle_turn(&handle, "alice", text_request("   "))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let first = first.await.unwrap().unwrap();
        assert!(matches!(first.kind, MessageKind::ToolAugmented { cancelled: false }));
        assert_eq!(first.content, "work finished");
        assert_eq!(handle.lock().await.history().len(), 2);
    }

    #[tokio::test]
    async fn newest_message_supersedes_queued_turn() {
        let slow = Arc::new(MockToolServer::new("slow").with_tool(
            "work",
            MockBehavior::Delay(Duration::from_millis(200), ToolOutput::text("done")),
        ));
        let harness = Harness::with_servers(vec![slow.clone()], CoordinatorConfig::default());
        let handle = harness.session().await;
        harness.models.queue_tool_call("", "c1", "slow_work", json!({}));
        harness.models.queue_text("C done");

        let spawn_turn = |text: &str, selected_tools: Option<Vec<String>>| {
            let router = harness.router.clone();
            let handle = handle.clone();
            let request = TurnRequest {
                text: text.to_string(),
                selected_tools,
                ..TurnRequest::default()
            };
            tokio::spawn(async move { router.handle_turn(&handle, "alice", request).await })
        };

        let a = spawn_turn("A", Some(vec!["slow".to_string()]));
        while slow.call_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let b = spawn_turn("B", None);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let c = harness
            .router
            .handle_turn(&handle, "alice", text_request("C"))
            .await
            .unwrap();

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert!(matches!(a.kind, MessageKind::ToolAugmented { cancelled: true }));
        assert!(matches!(b.kind, MessageKind::ToolAugmented { cancelled: true }));
        assert_eq!(c.content, "C done");
        // The superseded turn never reached the model or the tools
        assert_eq!(harness.models.request_count(), 2);
        assert_eq!(slow.call_count(), 1);

        let session = handle.lock().await;
        let users: Vec<_> = session
            .history()
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(users, vec!["A", "B", "C"]);
        assert_eq!(session.history().len(), 6);
    }

    #[tokio::test]
    async fn disconnect_stops_agent_at_checkpoint() {
        let slow = Arc::new(MockToolServer::new("slow").with_tool(
            "work",
            MockBehavior::Delay(Duration::from_millis(100), ToolOutput::text("done")),
        ));
        let harness = Harness::with_servers(vec![slow.clone()], CoordinatorConfig::default());
        let handle = harness.session().await;
        for i in 0..3 {
            harness
                .models
                .queue_tool_call("", &format!("c{i}"), "slow_work", json!({}));
        }

        let turn = {
            let router = harness.router.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                let request = TurnRequest {
                    text: "work".to_string(),
                    selected_tools: Some(vec!["slow".to_string()]),
                    agent_mode: true,
                    ..TurnRequest::default()
                };
                router.handle_turn(&handle, "alice", request).await
            })
        };

        while slow.call_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        harness.sessions.remove(handle.id(), "alice").await.unwrap();
        let message = turn.await.unwrap().unwrap();

        assert!(matches!(
            message.kind,
            MessageKind::Agent { outcome: AgentOutcome::Cancelled, .. }
        ));
        assert!(message.content.contains("disconnect"), "{}", message.content);
        assert_eq!(slow.call_count(), 1);
        assert_eq!(harness.models.request_count(), 1);
    }

    #[tokio::test]
    async fn sessions_run_turns_independently() {
        let harness = Harness::new();
        harness.models.set_delay(Duration::from_millis(50));
        harness.models.queue_text("a");
        harness.models.queue_text("b");
        let one = harness.session().await;
        let two = harness.sessions.create("bob").await;

        let (first, second) = tokio::join!(
            harness.router.handle_turn(&one, "alice", text_request("hi")),
            harness.router.handle_turn(&two, "bob", text_request("hi")),
        );
        first.unwrap();
        second.unwrap();
        assert_eq!(one.lock().await.history().len(), 2);
        assert_eq!(two.lock().await.history().len(), 2);
    }

    #[tokio::test]
    async fn queued_turns_for_one_session_do_not_interleave() {
        let harness = Harness::new();
        harness.models.set_delay(Duration::from_millis(30));
        harness.models.queue_text("first");
        harness.models.queue_text("second");
        let handle = harness.session().await;

        let (a, b) = tokio::join!(
            harness.router.handle_turn(&handle, "alice", text_request("one")),
            harness.router.handle_turn(&handle, "alice", text_request("two")),
        );
        a.unwrap();
        b.unwrap();

        let session = handle.lock().await;
        let roles: Vec<_> = session.history().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);
    }
}
