//! Request router: one entry point per inbound message

use super::engine::{flatten_calls, AgentRun};
use super::{complete_with_retry, ExecutionPath, ModelClient};
use crate::config::AGENT_STEP_RANGE;
use crate::coordinator::{ToolCoordinator, ToolResult, TurnScope};
use crate::error::TurnError;
use crate::events::{EventEmitter, TurnEvent};
use crate::llm::{LlmMessage, LlmRequest, ToolDefinition};
use crate::retrieval::{grounded_prompt, RetrievalIntegrator};
use crate::session::{
    AgentOutcome, Message, MessageKind, SelectionTarget, Session, SessionHandle,
};
use crate::state_machine::{reserved_tool_definitions, AgentCheckpoint, AgentState};
use crate::system_prompt::{system_content, PromptMode};
use crate::tools::{file_arguments, OfferedTool, ToolCatalog};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

const CANCELLED_TOOL_REPLY: &str =
    "Stopped before the tools finished: the turn was interrupted by a newer message or a disconnect.";

/// Inbound message and the per-turn options that come with it
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub text: String,
    #[serde(default)]
    pub model_id: Option<String>,
    /// Replaces the session's tool selection when present
    #[serde(default)]
    pub selected_tools: Option<Vec<String>>,
    /// Replaces the session's data sources when present
    #[serde(default)]
    pub selected_sources: Option<Vec<String>>,
    #[serde(default)]
    pub retrieval_only: bool,
    #[serde(default)]
    pub agent_mode: bool,
    #[serde(default)]
    pub agent_max_steps: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct RouterSettings {
    pub max_tokens: Option<u32>,
}

/// A request that passed validation, with its selection entries resolved
struct TurnPlan {
    model_id: String,
    text: String,
    selection: Option<Vec<SelectionTarget>>,
    sources: Option<BTreeSet<String>>,
    max_steps: Option<u32>,
}

/// Pick the execution path. First match wins.
pub fn classify(request: &TurnRequest, session: &Session) -> ExecutionPath {
    if session.agent.checkpoint.is_some() {
        ExecutionPath::AgentResume
    } else if request.agent_mode {
        ExecutionPath::Agent
    } else if request.retrieval_only && !session.sources.is_empty() {
        ExecutionPath::RetrievalOnly
    } else if !session.selection.is_empty() {
        ExecutionPath::ToolAugmented
    } else {
        ExecutionPath::Plain
    }
}

/// Publish the turn's terminal event
fn finish_turn(
    emitter: &EventEmitter,
    result: Result<Message, TurnError>,
) -> Result<Message, TurnError> {
    match result {
        Ok(message) => {
            emitter.emit(TurnEvent::FinalResponse {
                message: message.clone(),
            });
            Ok(message)
        }
        Err(e) => {
            match &e {
                TurnError::Internal(detail) => tracing::error!(error = %detail, "Turn failed"),
                other => tracing::warn!(error = %other, kind = ?other.kind(), "Turn failed"),
            }
            emitter.emit(TurnEvent::TurnError {
                kind: e.kind(),
                message: e.user_message(),
            });
            Err(e)
        }
    }
}

fn cancelled_tool_reply() -> Message {
    Message::assistant(
        CANCELLED_TOOL_REPLY,
        MessageKind::ToolAugmented { cancelled: true },
    )
}

pub struct TurnRouter<M: ModelClient> {
    models: M,
    catalog: Arc<ToolCatalog>,
    coordinator: ToolCoordinator,
    retrieval: Arc<RetrievalIntegrator>,
    settings: RouterSettings,
}

impl<M: ModelClient> TurnRouter<M> {
    pub fn new(
        models: M,
        catalog: Arc<ToolCatalog>,
        coordinator: ToolCoordinator,
        retrieval: Arc<RetrievalIntegrator>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            models,
            catalog,
            coordinator,
            retrieval,
            settings,
        }
    }

    pub fn models(&self) -> &M {
        &self.models
    }

    pub fn catalog(&self) -> &Arc<ToolCatalog> {
        &self.catalog
    }

    pub fn retrieval(&self) -> &Arc<RetrievalIntegrator> {
        &self.retrieval
    }

    /// Run one turn to completion. A request that passes validation
    /// cancels the session's running turn, then waits for it to release
    /// the session before starting.
    ///
    /// On success the session's history has grown by exactly the user's
    /// message and the returned response. On error it is unchanged.
    pub async fn handle_turn(
        &self,
        handle: &SessionHandle,
        user_id: &str,
        request: TurnRequest,
    ) -> Result<Message, TurnError> {
        let turn_id = Uuid::new_v4().to_string();
        let emitter = EventEmitter::new(handle.id(), turn_id.clone(), handle.event_sender());
        let span = tracing::info_span!(
            "turn",
            session_id = %handle.id(),
            turn_id = %turn_id,
            user_id = %user_id,
            path = tracing::field::Empty
        );

        async {
            // Nothing is touched, and no running turn is interrupted, until
            // the request is known to be well formed
            let plan = match self.validate(&request).await {
                Ok(plan) => plan,
                Err(e) => return finish_turn(&emitter, Err(e)),
            };
            let generation = handle.announce_message();

            let mut session = handle.lock().await;
            let turn = handle.begin_turn(generation);
            let result = self
                .run_turn(&mut session, user_id, &request, plan, turn.token(), &emitter)
                .await;
            if let Ok(message) = &result {
                tracing::info!(
                    history = session.history().len(),
                    tool_calls = message.tool_calls.len(),
                    "Turn completed"
                );
            }
            // The terminal event goes out before the next queued turn starts
            finish_turn(&emitter, result)
        }
        .instrument(span)
        .await
    }

    async fn run_turn(
        &self,
        session: &mut Session,
        user_id: &str,
        request: &TurnRequest,
        plan: TurnPlan,
        cancel: &CancellationToken,
        emitter: &EventEmitter,
    ) -> Result<Message, TurnError> {
        let previous = (
            session.selection.clone(),
            session.sources.clone(),
            session.agent.max_steps,
        );
        if let Some(targets) = plan.selection.clone() {
            session.selection.replace(targets);
        }
        if let Some(sources) = plan.sources.clone() {
            session.sources = sources;
        }
        if let Some(max_steps) = plan.max_steps {
            session.agent.max_steps = max_steps;
        }

        let path = classify(request, session);
        tracing::Span::current().record("path", tracing::field::debug(&path));
        tracing::info!(path = ?path, model = %plan.model_id, "Turn started");
        emitter.emit(TurnEvent::TurnStarted { path });

        let response = match path {
            ExecutionPath::Plain => self.run_plain(session, user_id, &plan, emitter).await,
            ExecutionPath::RetrievalOnly => {
                self.run_retrieval_only(session, user_id, &plan, emitter)
                    .await
            }
            ExecutionPath::ToolAugmented => {
                self.run_tools(session, user_id, &plan, cancel, emitter)
                    .await
            }
            ExecutionPath::Agent | ExecutionPath::AgentResume => {
                self.run_agent(session, user_id, &plan, cancel, emitter)
                    .await
            }
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                // A failed turn leaves the session as it found it
                (session.selection, session.sources, session.agent.max_steps) = previous;
                return Err(e);
            }
        };

        session.commit_turn(Message::user(plan.text), response.clone());
        Ok(response)
    }

    /// Reject a malformed request. Looks only at the request, so it runs
    /// before the session is locked or its running turn disturbed.
    async fn validate(&self, request: &TurnRequest) -> Result<TurnPlan, TurnError> {
        let text = request.text.trim();
        if text.is_empty() {
            return Err(TurnError::validation("Message text is empty"));
        }

        let model_id = request
            .model_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| self.models.default_model_id());
        if !self.models.has_model(&model_id) {
            return Err(TurnError::validation(format!("Unknown model '{model_id}'")));
        }

        if let Some(steps) = request.agent_max_steps {
            if !AGENT_STEP_RANGE.contains(&steps) {
                return Err(TurnError::validation(format!(
                    "Agent step budget must be between {} and {}, got {steps}",
                    AGENT_STEP_RANGE.start(),
                    AGENT_STEP_RANGE.end()
                )));
            }
        }

        let selection = match &request.selected_tools {
            Some(entries) => {
                let mut targets = Vec::with_capacity(entries.len());
                for entry in entries {
                    let target = self
                        .catalog
                        .resolve_selection(entry)
                        .await
                        .map_err(TurnError::validation)?;
                    targets.push(target);
                }
                Some(targets)
            }
            None => None,
        };

        let sources: Option<BTreeSet<String>> = request
            .selected_sources
            .as_ref()
            .map(|ids| ids.iter().map(|id| id.trim().to_string()).filter(|id| !id.is_empty()).collect());

        if request.retrieval_only
            && !request.agent_mode
            && sources.as_ref().is_some_and(BTreeSet::is_empty)
        {
            return Err(TurnError::validation(
                "Retrieval-only mode needs at least one data source",
            ));
        }

        Ok(TurnPlan {
            model_id,
            text: text.to_string(),
            selection,
            sources,
            max_steps: request.agent_max_steps,
        })
    }

    // ========================================================================
    // Execution paths
    // ========================================================================

    async fn run_plain(
        &self,
        session: &Session,
        user_id: &str,
        plan: &TurnPlan,
        emitter: &EventEmitter,
    ) -> Result<Message, TurnError> {
        let prompt = self.grounded_text(session, user_id, &plan.text, emitter).await?;
        let mut messages = session.llm_history();
        messages.push(LlmMessage::user(prompt));

        let request = LlmRequest {
            system: system_content(PromptMode::Chat),
            messages,
            tools: vec![],
            max_tokens: self.settings.max_tokens,
        };
        let response = complete_with_retry(&self.models, &plan.model_id, &request).await?;
        Ok(Message::assistant(response.text(), MessageKind::Chat))
    }

    async fn run_retrieval_only(
        &self,
        session: &Session,
        user_id: &str,
        plan: &TurnPlan,
        emitter: &EventEmitter,
    ) -> Result<Message, TurnError> {
        let answer = self
            .retrieval
            .query(user_id, &session.sources, &plan.text)
            .await?;
        emitter.emit(TurnEvent::RetrievalResult {
            answer: answer.answer.clone(),
            attributions: answer.attributions.clone(),
        });
        Ok(Message::assistant(
            answer.answer,
            MessageKind::Retrieval {
                attributions: answer.attributions,
            },
        ))
    }

    /// One model call with the selected tools, one coordinator round if
    /// the model asked for tools, and one follow-up call over the results
    async fn run_tools(
        &self,
        session: &Session,
        user_id: &str,
        plan: &TurnPlan,
        cancel: &CancellationToken,
        emitter: &EventEmitter,
    ) -> Result<Message, TurnError> {
        if cancel.is_cancelled() {
            tracing::info!("Turn superseded before the first model call");
            return Ok(cancelled_tool_reply());
        }

        let prompt = self.grounded_text(session, user_id, &plan.text, emitter).await?;
        let offered = self.catalog.offered_tools(&session.selection).await;
        let tools: Vec<ToolDefinition> = offered.iter().map(|t| t.definition.clone()).collect();
        let scope = self.scope(session, user_id, &offered, cancel, emitter);

        let mut messages = session.llm_history();
        messages.push(LlmMessage::user(prompt));
        let system = system_content(PromptMode::Tools);

        let request = LlmRequest {
            system: system.clone(),
            messages: messages.clone(),
            tools: tools.clone(),
            max_tokens: self.settings.max_tokens,
        };
        let first = complete_with_retry(&self.models, &plan.model_id, &request).await?;
        let calls = first.proposed_calls()?;
        if calls.is_empty() {
            return Ok(Message::assistant(
                first.text(),
                MessageKind::ToolAugmented { cancelled: false },
            ));
        }

        let results = self.coordinator.run_round(&scope, calls).await;
        if cancel.is_cancelled() {
            tracing::info!(discarded = results.len(), "Turn cancelled after tool round");
            return Ok(cancelled_tool_reply());
        }

        messages.push(LlmMessage::assistant(first.content));
        messages.push(LlmMessage::tool_results(
            results.iter().map(ToolResult::to_content_block).collect(),
        ));
        let follow_up = LlmRequest {
            system,
            messages,
            tools,
            max_tokens: self.settings.max_tokens,
        };
        let second = complete_with_retry(&self.models, &plan.model_id, &follow_up).await?;
        if !second.tool_uses().is_empty() {
            tracing::warn!(
                proposed = second.tool_uses().len(),
                "Ignoring tool calls proposed after the tool round"
            );
        }

        let mut text = second.text();
        if text.trim().is_empty() {
            text = results
                .iter()
                .map(ToolResult::observation)
                .collect::<Vec<_>>()
                .join("\n");
        }

        Ok(
            Message::assistant(text, MessageKind::ToolAugmented { cancelled: false })
                .with_tool_calls(results.iter().map(ToolResult::to_record).collect())
                .with_artifacts(results.iter().flat_map(ToolResult::artifacts).collect()),
        )
    }

    async fn run_agent(
        &self,
        session: &mut Session,
        user_id: &str,
        plan: &TurnPlan,
        cancel: &CancellationToken,
        emitter: &EventEmitter,
    ) -> Result<Message, TurnError> {
        let offered = self.catalog.offered_tools(&session.selection).await;
        let mut tools: Vec<ToolDefinition> = offered.iter().map(|t| t.definition.clone()).collect();
        tools.extend(reserved_tool_definitions());
        let scope = self.scope(session, user_id, &offered, cancel, emitter);

        let checkpoint = session.agent.checkpoint.clone();
        let max_steps = checkpoint
            .as_ref()
            .map_or(session.agent.max_steps, |c| c.max_steps);
        let run = AgentRun::new(
            &self.models,
            &self.coordinator,
            scope,
            plan.model_id.clone(),
            system_content(PromptMode::Agent { max_steps }),
            tools,
            self.settings.max_tokens,
            max_steps,
        );

        let outcome = match checkpoint {
            Some(checkpoint) => {
                tracing::info!(step = checkpoint.step, "Resuming agent with the user's answer");
                run.resume(checkpoint, plan.text.clone()).await?
            }
            None => {
                let mut transcript = session.llm_history();
                transcript.push(LlmMessage::user(plan.text.clone()));
                run.start(transcript).await?
            }
        };

        let tool_calls = flatten_calls(&outcome.steps);
        let last_reasoning = outcome
            .steps
            .iter()
            .rev()
            .map(|s| s.reasoning.trim())
            .find(|r| !r.is_empty())
            .map(str::to_string);

        let (content, result, checkpoint) = match outcome.state {
            AgentState::Completed { answer } => (answer, AgentOutcome::Completed, None),
            AgentState::MaxStepsReached { steps } => (
                last_reasoning.unwrap_or_else(|| {
                    format!("Stopped after {steps} steps without reaching a final answer.")
                }),
                AgentOutcome::MaxStepsReached,
                None,
            ),
            AgentState::AwaitingUserInput {
                step,
                question,
                call_id,
            } => (
                question.clone(),
                AgentOutcome::AwaitingUserInput,
                Some(AgentCheckpoint {
                    step,
                    max_steps,
                    question,
                    call_id,
                    transcript: outcome.transcript,
                }),
            ),
            AgentState::Cancelled { step } => (
                format!(
                    "Stopped at step {}: the turn was interrupted by a newer message or a disconnect.",
                    step + 1
                ),
                AgentOutcome::Cancelled,
                None,
            ),
            AgentState::Errored { message } => {
                return Err(outcome
                    .failure
                    .unwrap_or_else(|| TurnError::internal(message)));
            }
            other => {
                return Err(TurnError::internal(format!(
                    "agent stopped in state {}",
                    other.name()
                )));
            }
        };

        session.agent.current_step = u32::try_from(outcome.steps.len()).unwrap_or(u32::MAX);
        session.agent.checkpoint = checkpoint;

        Ok(Message::assistant(
            content,
            MessageKind::Agent {
                outcome: result,
                steps: outcome.steps,
            },
        )
        .with_tool_calls(tool_calls)
        .with_artifacts(outcome.artifacts))
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// The user's text, prefixed with a retrieval answer when the session
    /// has data sources selected
    async fn grounded_text(
        &self,
        session: &Session,
        user_id: &str,
        text: &str,
        emitter: &EventEmitter,
    ) -> Result<String, TurnError> {
        if session.sources.is_empty() {
            return Ok(text.to_string());
        }
        let answer = self.retrieval.query(user_id, &session.sources, text).await?;
        emitter.emit(TurnEvent::RetrievalResult {
            answer: answer.answer.clone(),
            attributions: answer.attributions.clone(),
        });
        Ok(grounded_prompt(&answer, text))
    }

    fn scope(
        &self,
        session: &Session,
        user_id: &str,
        offered: &[OfferedTool],
        cancel: &CancellationToken,
        emitter: &EventEmitter,
    ) -> Arc<TurnScope> {
        Arc::new(TurnScope {
            session_id: session.id.clone(),
            user_id: user_id.to_string(),
            turn_id: emitter.turn_id().to_string(),
            files: session.files.clone(),
            selection: session.selection.clone(),
            kinds: offered
                .iter()
                .map(|t| (t.definition.name.clone(), t.kind))
                .collect::<HashMap<_, _>>(),
            file_arguments: offered
                .iter()
                .map(|t| (t.definition.name.clone(), file_arguments(&t.definition.input_schema)))
                .filter(|(_, names)| !names.is_empty())
                .collect(),
            cancel: cancel.clone(),
            emitter: emitter.clone(),
        })
    }
}
