//! Turn event emission
//!
//! Each turn gets its own [`EventEmitter`] publishing onto the session's
//! broadcast channel. The emitter enforces ordering: a tool call's
//! progress and result only follow its start, and nothing follows the
//! turn's terminal event. Delivery is at-most-once with no replay; a
//! subscriber that is not listening misses the event.

use crate::error::ErrorKind;
use crate::retrieval::SourceAttribution;
use crate::runtime::ExecutionPath;
use crate::session::{AgentStep, Message};
use crate::state_machine::AgentState;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    TurnStarted {
        path: ExecutionPath,
    },
    StateChange {
        state: AgentState,
    },
    ToolCallStarted {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolCallProgress {
        call_id: String,
        message: String,
    },
    ToolCallCompleted {
        call_id: String,
        name: String,
        success: bool,
        output: String,
    },
    ToolCallFailed {
        call_id: String,
        name: String,
        success: bool,
        reason: String,
    },
    UiPayload {
        call_id: String,
        html: String,
    },
    AgentStep {
        step: AgentStep,
    },
    AwaitingUserInput {
        question: String,
    },
    MaxStepsReached {
        steps: u32,
    },
    RetrievalResult {
        answer: String,
        attributions: Vec<SourceAttribution>,
    },
    TurnError {
        kind: ErrorKind,
        message: String,
    },
    FinalResponse {
        message: Message,
    },
}

impl TurnEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            TurnEvent::TurnStarted { .. } => "turn_started",
            TurnEvent::StateChange { .. } => "state_change",
            TurnEvent::ToolCallStarted { .. } => "tool_call_started",
            TurnEvent::ToolCallProgress { .. } => "tool_call_progress",
            TurnEvent::ToolCallCompleted { .. } => "tool_call_completed",
            TurnEvent::ToolCallFailed { .. } => "tool_call_failed",
            TurnEvent::UiPayload { .. } => "ui_payload",
            TurnEvent::AgentStep { .. } => "agent_step",
            TurnEvent::AwaitingUserInput { .. } => "awaiting_user_input",
            TurnEvent::MaxStepsReached { .. } => "max_steps_reached",
            TurnEvent::RetrievalResult { .. } => "retrieval_result",
            TurnEvent::TurnError { .. } => "turn_error",
            TurnEvent::FinalResponse { .. } => "final_response",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnEvent::TurnError { .. } | TurnEvent::FinalResponse { .. }
        )
    }
}

/// An event as delivered to subscribers
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub session_id: String,
    pub turn_id: String,
    /// Position within the turn, starting at 1
    pub sequence: u64,
    #[serde(flatten)]
    pub event: TurnEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallPhase {
    Started,
    Finished,
}

#[derive(Default)]
struct EmitterState {
    sequence: u64,
    calls: HashMap<String, CallPhase>,
    closed: bool,
}

struct EmitterInner {
    session_id: String,
    turn_id: String,
    tx: broadcast::Sender<EventEnvelope>,
    state: Mutex<EmitterState>,
}

#[derive(Clone)]
pub struct EventEmitter {
    inner: Arc<EmitterInner>,
}

impl EventEmitter {
    pub fn new(
        session_id: impl Into<String>,
        turn_id: impl Into<String>,
        tx: broadcast::Sender<EventEnvelope>,
    ) -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                session_id: session_id.into(),
                turn_id: turn_id.into(),
                tx,
                state: Mutex::new(EmitterState::default()),
            }),
        }
    }

    pub fn turn_id(&self) -> &str {
        &self.inner.turn_id
    }

    /// Publish an event if it is legal at this point of the turn.
    /// Returns whether it was published.
    pub fn emit(&self, event: TurnEvent) -> bool {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if state.closed {
            tracing::warn!(
                turn_id = %self.inner.turn_id,
                event = event.event_type(),
                "Dropping event emitted after turn end"
            );
            return false;
        }

        if let Err(reason) = check_order(&mut state.calls, &event) {
            tracing::warn!(
                turn_id = %self.inner.turn_id,
                event = event.event_type(),
                reason,
                "Dropping out-of-order event"
            );
            return false;
        }

        if event.is_terminal() {
            state.closed = true;
        }
        state.sequence += 1;

        let envelope = EventEnvelope {
            session_id: self.inner.session_id.clone(),
            turn_id: self.inner.turn_id.clone(),
            sequence: state.sequence,
            event,
        };
        tracing::debug!(
            turn_id = %envelope.turn_id,
            sequence = envelope.sequence,
            event = envelope.event.event_type(),
            "Emitting event"
        );
        // No subscribers is fine; events are not replayed.
        let _ = self.inner.tx.send(envelope);
        true
    }

    pub fn tool_progress(&self, call_id: &str, message: impl Into<String>) -> bool {
        self.emit(TurnEvent::ToolCallProgress {
            call_id: call_id.to_string(),
            message: message.into(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }
}

fn check_order(
    calls: &mut HashMap<String, CallPhase>,
    event: &TurnEvent,
) -> Result<(), &'static str> {
    match event {
        TurnEvent::ToolCallStarted { call_id, .. } => {
            if calls.contains_key(call_id) {
                return Err("call already started");
            }
            calls.insert(call_id.clone(), CallPhase::Started);
        }
        TurnEvent::ToolCallProgress { call_id, .. } | TurnEvent::UiPayload { call_id, .. } => {
            if calls.get(call_id) != Some(&CallPhase::Started) {
                return Err("call is not running");
            }
        }
        TurnEvent::ToolCallCompleted { call_id, .. } | TurnEvent::ToolCallFailed { call_id, .. } => {
            if calls.get(call_id) != Some(&CallPhase::Started) {
                return Err("call is not running");
            }
            calls.insert(call_id.clone(), CallPhase::Finished);
        }
        _ => {}
    }
    Ok(())
}
