//! Pure agent transition function

use super::{AgentAction, AgentContext, AgentEffect, AgentEvent, AgentState};
use crate::events::TurnEvent;
use crate::llm::ContentBlock;
use thiserror::Error;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: AgentState,
    pub effects: Vec<AgentEffect>,
}

impl TransitionResult {
    pub fn new(state: AgentState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    #[must_use]
    pub fn with_effect(mut self, effect: AgentEffect) -> Self {
        self.effects.push(effect);
        self
    }

    #[must_use]
    pub fn with_effects(mut self, effects: impl IntoIterator<Item = AgentEffect>) -> Self {
        self.effects.extend(effects);
        self
    }

    /// Announce the new state to subscribers
    #[must_use]
    fn announced(self) -> Self {
        let state = self.new_state.clone();
        self.with_effect(AgentEffect::notify(TurnEvent::StateChange { state }))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Agent already finished ({0})")]
    Terminal(&'static str),
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

/// Initial step of a fresh agent turn
pub fn begin() -> TransitionResult {
    TransitionResult::new(AgentState::Reasoning { step: 0 })
        .announced()
        .with_effect(AgentEffect::RequestModel)
}

/// Pure transition function: same inputs, same outputs, no I/O
pub fn transition(
    state: &AgentState,
    context: &AgentContext,
    event: AgentEvent,
) -> Result<TransitionResult, TransitionError> {
    if state.is_terminal() {
        return Err(TransitionError::Terminal(state.name()));
    }

    match (state, event) {
        // ============================================================
        // Cancellation (any non-terminal state, at a step boundary)
        // ============================================================
        (
            AgentState::Reasoning { step }
            | AgentState::Acting { step, .. }
            | AgentState::Observing { step }
            | AgentState::AwaitingUserInput { step, .. },
            AgentEvent::Cancelled,
        ) => Ok(TransitionResult::new(AgentState::Cancelled { step: *step }).announced()),

        // ============================================================
        // Reasoning
        // ============================================================
        (
            AgentState::Reasoning { step },
            AgentEvent::ModelResponded {
                content,
                text,
                actions,
            },
        ) => Ok(handle_response(*step, content, text, actions)),

        (AgentState::Reasoning { .. }, AgentEvent::ModelFailed { message }) => {
            Ok(TransitionResult::new(AgentState::Errored { message }).announced())
        }

        // ============================================================
        // Acting -> Observing
        // ============================================================
        (AgentState::Acting { step, .. }, AgentEvent::ToolsFinished) => {
            Ok(TransitionResult::new(AgentState::Observing { step: *step })
                .with_effect(AgentEffect::RecordStep { terminal: false })
                .announced()
                .with_effect(AgentEffect::RecordObservations))
        }

        // ============================================================
        // Observing -> next step or budget exhausted
        // ============================================================
        (AgentState::Observing { step }, AgentEvent::ObservationsRecorded) => {
            Ok(advance(*step, context))
        }

        // ============================================================
        // Resume after ask_user; the answer is the step's observation
        // ============================================================
        (AgentState::AwaitingUserInput { step, call_id, .. }, AgentEvent::UserAnswered { text }) => {
            Ok(TransitionResult::new(AgentState::Observing { step: *step })
                .announced()
                .with_effect(AgentEffect::AppendAnswer {
                    call_id: call_id.clone(),
                    text,
                }))
        }

        (state, event) => Err(TransitionError::InvalidTransition(format!(
            "{event:?} in state {}",
            state.name()
        ))),
    }
}

fn handle_response(
    step: u32,
    content: Vec<ContentBlock>,
    text: String,
    actions: Vec<AgentAction>,
) -> TransitionResult {
    let mut final_answer = None;
    let mut question = None;
    let mut calls = Vec::new();
    for action in actions {
        match action {
            AgentAction::FinalAnswer { call_id, answer } => {
                final_answer.get_or_insert((call_id, answer));
            }
            AgentAction::AskUser { call_id, question: q } => {
                question.get_or_insert((call_id, q));
            }
            AgentAction::Invoke(call) => calls.push(call),
        }
    }

    // Completion wins over a question, which wins over tool calls
    if let Some((call_id, answer)) = final_answer {
        let answer = if answer.trim().is_empty() {
            text.clone()
        } else {
            answer
        };
        return TransitionResult::new(AgentState::Completed { answer })
            .with_effect(AgentEffect::AppendAssistant {
                content: keep_tool_use(content, &call_id),
            })
            .with_effect(AgentEffect::BeginStep { reasoning: text })
            .with_effect(AgentEffect::RecordStep { terminal: true })
            .announced();
    }

    if let Some((call_id, question)) = question {
        return TransitionResult::new(AgentState::AwaitingUserInput {
            step,
            question: question.clone(),
            call_id: call_id.clone(),
        })
        .with_effect(AgentEffect::AppendAssistant {
            content: keep_tool_use(content, &call_id),
        })
        .with_effect(AgentEffect::BeginStep { reasoning: text })
        .with_effect(AgentEffect::RecordStep { terminal: false })
        .with_effect(AgentEffect::notify(TurnEvent::AwaitingUserInput { question }))
        .announced();
    }

    let opening = [
        AgentEffect::AppendAssistant { content },
        AgentEffect::BeginStep { reasoning: text },
    ];

    if calls.is_empty() {
        // Plain text counts as an observation of its own; the model's text
        // is already in the transcript and becomes the next step's input.
        return TransitionResult::new(AgentState::Observing { step })
            .with_effects(opening)
            .with_effect(AgentEffect::RecordStep { terminal: false })
            .announced()
            .with_effect(AgentEffect::RecordObservations);
    }

    TransitionResult::new(AgentState::Acting {
        step,
        calls: calls.clone(),
    })
    .with_effects(opening)
    .announced()
    .with_effect(AgentEffect::ExecuteTools { calls })
}

fn advance(step: u32, context: &AgentContext) -> TransitionResult {
    let next = step + 1;
    if next >= context.max_steps {
        TransitionResult::new(AgentState::MaxStepsReached { steps: next })
            .with_effect(AgentEffect::notify(TurnEvent::MaxStepsReached { steps: next }))
            .announced()
    } else {
        TransitionResult::new(AgentState::Reasoning { step: next })
            .announced()
            .with_effect(AgentEffect::RequestModel)
    }
}

/// Drop tool-use blocks other than `call_id`, so the transcript never
/// holds a call without a matching result
fn keep_tool_use(content: Vec<ContentBlock>, call_id: &str) -> Vec<ContentBlock> {
    content
        .into_iter()
        .filter(|block| match block {
            ContentBlock::ToolUse { id, .. } => id == call_id,
            _ => true,
        })
        .collect()
}
