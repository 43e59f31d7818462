//! Agent step state machine
//!
//! Pure transitions: given a state, the turn's context and an event, the
//! machine returns the next state and the effects the runtime must carry
//! out. All I/O lives in the runtime.

mod effect;
mod event;
mod state;
mod transition;

#[cfg(test)]
mod proptests;

pub use effect::AgentEffect;
pub use event::AgentEvent;
pub use state::{
    reserved_tool_definitions, AgentAction, AgentCheckpoint, AgentContext, AgentState,
    ASK_USER_TOOL, FINAL_ANSWER_TOOL,
};
pub use transition::{begin, transition, TransitionError, TransitionResult};
