//! Agent loop driver
//!
//! Runs the pure transition function in an explicit loop: execute the
//! effects of the last transition, feed any resulting event back in, stop
//! once the state is terminal or suspended on the user. Cancellation is
//! checked before every model call and after every tool round.

use super::{complete_with_retry, ModelClient};
use crate::coordinator::{ToolCoordinator, ToolResult, TurnScope};
use crate::error::TurnError;
use crate::events::TurnEvent;
use crate::llm::{ContentBlock, LlmMessage, LlmRequest, SystemContent, ToolDefinition};
use crate::session::{AgentStep, ToolCallRecord};
use crate::state_machine::{
    begin, transition, AgentAction, AgentCheckpoint, AgentContext, AgentEffect, AgentEvent,
    AgentState,
};
use crate::storage::FileRef;
use std::collections::VecDeque;
use std::sync::Arc;

/// Everything an agent turn produced
#[derive(Debug)]
pub struct AgentRunOutcome {
    pub state: AgentState,
    /// Model transcript at the point the loop stopped
    pub transcript: Vec<LlmMessage>,
    /// Steps recorded during this turn
    pub steps: Vec<AgentStep>,
    pub artifacts: Vec<FileRef>,
    /// Set when the loop ended in `Errored`
    pub failure: Option<TurnError>,
}

struct StepDraft {
    index: u32,
    reasoning: String,
}

pub struct AgentRun<'a, M: ModelClient> {
    models: &'a M,
    coordinator: &'a ToolCoordinator,
    scope: Arc<TurnScope>,
    model_id: String,
    system: Vec<SystemContent>,
    tools: Vec<ToolDefinition>,
    max_tokens: Option<u32>,
    context: AgentContext,
    state: AgentState,
    transcript: Vec<LlmMessage>,
    first_index: u32,
    steps: Vec<AgentStep>,
    open_step: Option<StepDraft>,
    round: Vec<ToolResult>,
    artifacts: Vec<FileRef>,
    failure: Option<TurnError>,
}

impl<'a, M: ModelClient> AgentRun<'a, M> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        models: &'a M,
        coordinator: &'a ToolCoordinator,
        scope: Arc<TurnScope>,
        model_id: String,
        system: Vec<SystemContent>,
        tools: Vec<ToolDefinition>,
        max_tokens: Option<u32>,
        max_steps: u32,
    ) -> Self {
        Self {
            models,
            coordinator,
            scope,
            model_id,
            system,
            tools,
            max_tokens,
            context: AgentContext { max_steps },
            state: AgentState::Reasoning { step: 0 },
            transcript: Vec::new(),
            first_index: 0,
            steps: Vec::new(),
            open_step: None,
            round: Vec::new(),
            artifacts: Vec::new(),
            failure: None,
        }
    }

    /// Start a fresh loop over `transcript`, which ends with the user's
    /// message
    pub async fn start(mut self, transcript: Vec<LlmMessage>) -> Result<AgentRunOutcome, TurnError> {
        self.transcript = transcript;
        let initial = begin();
        self.state = initial.new_state;
        self.drive(initial.effects.into(), VecDeque::new()).await
    }

    /// Continue a loop suspended on `ask_user`, with `answer` as the
    /// pending call's result
    pub async fn resume(
        mut self,
        checkpoint: AgentCheckpoint,
        answer: String,
    ) -> Result<AgentRunOutcome, TurnError> {
        self.state = checkpoint.state();
        self.first_index = checkpoint.step + 1;
        self.transcript = checkpoint.transcript;
        let events = VecDeque::from([AgentEvent::UserAnswered { text: answer }]);
        self.drive(VecDeque::new(), events).await
    }

    async fn drive(
        mut self,
        mut effects: VecDeque<AgentEffect>,
        mut events: VecDeque<AgentEvent>,
    ) -> Result<AgentRunOutcome, TurnError> {
        loop {
            while let Some(effect) = effects.pop_front() {
                if let Some(event) = self.execute_effect(effect).await {
                    events.push_back(event);
                }
            }

            let Some(event) = events.pop_front() else {
                break;
            };
            let result = transition(&self.state, &self.context, event)
                .map_err(|e| TurnError::internal(e.to_string()))?;
            tracing::debug!(
                from = self.state.name(),
                to = result.new_state.name(),
                effects = result.effects.len(),
                "Agent transition"
            );
            self.state = result.new_state;
            effects.extend(result.effects);
        }

        if !self.state.is_resting() {
            return Err(TurnError::internal(format!(
                "agent loop stalled in state {}",
                self.state.name()
            )));
        }

        tracing::info!(
            state = self.state.name(),
            steps = self.steps.len(),
            "Agent loop stopped"
        );
        Ok(AgentRunOutcome {
            state: self.state,
            transcript: self.transcript,
            steps: self.steps,
            artifacts: self.artifacts,
            failure: self.failure,
        })
    }

    async fn execute_effect(&mut self, effect: AgentEffect) -> Option<AgentEvent> {
        match effect {
            AgentEffect::RequestModel => Some(self.request_model().await),

            AgentEffect::AppendAssistant { content } => {
                if !content.is_empty() {
                    self.transcript.push(LlmMessage::assistant(content));
                }
                None
            }

            AgentEffect::BeginStep { reasoning } => {
                let index = self.first_index + u32::try_from(self.steps.len()).unwrap_or(u32::MAX);
                self.open_step = Some(StepDraft { index, reasoning });
                None
            }

            AgentEffect::ExecuteTools { calls } => {
                self.round = self.coordinator.run_round(&self.scope, calls).await;
                if self.scope.cancel.is_cancelled() {
                    tracing::info!(
                        discarded = self.round.len(),
                        "Turn cancelled, dropping tool round"
                    );
                    self.round.clear();
                    return Some(AgentEvent::Cancelled);
                }
                Some(AgentEvent::ToolsFinished)
            }

            AgentEffect::RecordStep { terminal } => {
                if let Some(draft) = self.open_step.take() {
                    let step = AgentStep {
                        index: draft.index,
                        reasoning: draft.reasoning,
                        tool_calls: self.round.iter().map(ToolResult::to_record).collect(),
                        terminal,
                    };
                    self.scope.emitter.emit(TurnEvent::AgentStep { step: step.clone() });
                    self.steps.push(step);
                }
                None
            }

            AgentEffect::RecordObservations => {
                if !self.round.is_empty() {
                    let round = std::mem::take(&mut self.round);
                    self.artifacts.extend(round.iter().flat_map(ToolResult::artifacts));
                    self.transcript.push(LlmMessage::tool_results(
                        round.iter().map(ToolResult::to_content_block).collect(),
                    ));
                }
                Some(AgentEvent::ObservationsRecorded)
            }

            AgentEffect::AppendAnswer { call_id, text } => {
                self.transcript.push(LlmMessage::tool_results(vec![ContentBlock::tool_result(
                    call_id, text, false,
                )]));
                Some(AgentEvent::ObservationsRecorded)
            }

            AgentEffect::Notify(event) => {
                self.scope.emitter.emit(event);
                None
            }
        }
    }

    async fn request_model(&mut self) -> AgentEvent {
        if self.scope.cancel.is_cancelled() {
            return AgentEvent::Cancelled;
        }

        let request = LlmRequest {
            system: self.system.clone(),
            messages: self.transcript.clone(),
            tools: self.tools.clone(),
            max_tokens: self.max_tokens,
        };
        let response = match complete_with_retry(self.models, &self.model_id, &request).await {
            Ok(response) => response,
            Err(e) => return self.fail(e.into()),
        };

        match response.proposed_calls() {
            Ok(calls) => AgentEvent::ModelResponded {
                text: response.text(),
                actions: calls.into_iter().map(AgentAction::from_tool_use).collect(),
                content: response.content,
            },
            Err(e) => self.fail(e.into()),
        }
    }

    fn fail(&mut self, error: TurnError) -> AgentEvent {
        tracing::warn!(error = %error, "Agent model call failed");
        let message = error.to_string();
        self.failure = Some(error);
        AgentEvent::ModelFailed { message }
    }
}

/// Every tool call made across `steps`, in order
pub(crate) fn flatten_calls(steps: &[AgentStep]) -> Vec<ToolCallRecord> {
    steps
        .iter()
        .flat_map(|step| step.tool_calls.iter().cloned())
        .collect()
}
