//! Property-based tests for the agent state machine
//!
//! A simulated driver plays the runtime's part: it answers each effect with
//! the event the runtime would produce and feeds model responses from a
//! generated script.

use super::*;
use crate::llm::{ContentBlock, ToolUse};
use proptest::prelude::*;
use std::collections::VecDeque;

// ============================================================================
// Generators
// ============================================================================

#[derive(Debug, Clone)]
enum ScriptedResponse {
    Text,
    Tools(usize),
    Final,
    Ask,
    Failure,
}

fn arb_response() -> impl Strategy<Value = ScriptedResponse> {
    prop_oneof![
        3 => Just(ScriptedResponse::Text),
        5 => (1usize..4).prop_map(ScriptedResponse::Tools),
        1 => Just(ScriptedResponse::Final),
        1 => Just(ScriptedResponse::Ask),
        1 => Just(ScriptedResponse::Failure),
    ]
}

fn arb_non_terminal_state() -> impl Strategy<Value = AgentState> {
    prop_oneof![
        (0u32..10).prop_map(|step| AgentState::Reasoning { step }),
        (0u32..10).prop_map(|step| AgentState::Acting { step, calls: vec![] }),
        (0u32..10).prop_map(|step| AgentState::Observing { step }),
        (0u32..10).prop_map(|step| AgentState::AwaitingUserInput {
            step,
            question: "q".to_string(),
            call_id: "c".to_string(),
        }),
    ]
}

fn arb_terminal_state() -> impl Strategy<Value = AgentState> {
    prop_oneof![
        "[a-z]{0,10}".prop_map(|answer| AgentState::Completed { answer }),
        (1u32..20).prop_map(|steps| AgentState::MaxStepsReached { steps }),
        (0u32..20).prop_map(|step| AgentState::Cancelled { step }),
        "[a-z]{0,10}".prop_map(|message| AgentState::Errored { message }),
    ]
}

fn arb_event() -> impl Strategy<Value = AgentEvent> {
    prop_oneof![
        Just(AgentEvent::ToolsFinished),
        Just(AgentEvent::ObservationsRecorded),
        Just(AgentEvent::Cancelled),
        "[a-z]{1,10}".prop_map(|text| AgentEvent::UserAnswered { text }),
        "[a-z]{1,10}".prop_map(|message| AgentEvent::ModelFailed { message }),
    ]
}

// ============================================================================
// Simulated driver
// ============================================================================

fn to_event(response: &ScriptedResponse, counter: &mut u32) -> AgentEvent {
    let mut next_id = || {
        *counter += 1;
        format!("call-{counter}")
    };
    let actions = match response {
        ScriptedResponse::Text => vec![],
        ScriptedResponse::Tools(n) => (0..*n)
            .map(|_| {
                AgentAction::Invoke(ToolUse {
                    id: next_id(),
                    name: "calculator_evaluate".to_string(),
                    input: serde_json::json!({"expression": "1+1"}),
                })
            })
            .collect(),
        ScriptedResponse::Final => vec![AgentAction::FinalAnswer {
            call_id: next_id(),
            answer: "done".to_string(),
        }],
        ScriptedResponse::Ask => vec![AgentAction::AskUser {
            call_id: next_id(),
            question: "which?".to_string(),
        }],
        ScriptedResponse::Failure => {
            return AgentEvent::ModelFailed {
                message: "boom".to_string(),
            }
        }
    };
    AgentEvent::ModelResponded {
        content: vec![ContentBlock::text("thinking")],
        text: "thinking".to_string(),
        actions,
    }
}

struct Run {
    state: AgentState,
    model_requests: u32,
    steps_recorded: u32,
}

fn drive(max_steps: u32, script: &[ScriptedResponse]) -> Run {
    let context = AgentContext { max_steps };
    let mut script: VecDeque<_> = script.iter().cloned().collect();
    let mut counter = 0;
    let mut run = Run {
        state: AgentState::Reasoning { step: 0 },
        model_requests: 0,
        steps_recorded: 0,
    };

    let mut pending: VecDeque<AgentEffect> = begin().effects.into();
    let mut events: VecDeque<AgentEvent> = VecDeque::new();
    loop {
        while let Some(effect) = pending.pop_front() {
            match effect {
                AgentEffect::RequestModel => {
                    run.model_requests += 1;
                    let response = script.pop_front().unwrap_or(ScriptedResponse::Final);
                    events.push_back(to_event(&response, &mut counter));
                }
                AgentEffect::ExecuteTools { .. } => events.push_back(AgentEvent::ToolsFinished),
                AgentEffect::RecordObservations | AgentEffect::AppendAnswer { .. } => {
                    events.push_back(AgentEvent::ObservationsRecorded);
                }
                AgentEffect::RecordStep { .. } => run.steps_recorded += 1,
                _ => {}
            }
        }
        let Some(event) = events.pop_front() else {
            return run;
        };
        let result = transition(&run.state, &context, event).expect("driver only sends valid events");
        run.state = result.new_state;
        pending.extend(result.effects);
    }
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn model_is_never_asked_more_than_the_budget(
        max_steps in 1u32..8,
        script in proptest::collection::vec(arb_response(), 0..20),
    ) {
        let run = drive(max_steps, &script);
        prop_assert!(run.model_requests <= max_steps);
        prop_assert!(run.state.is_resting());
    }

    #[test]
    fn budget_exhaustion_reports_exact_step_count(
        max_steps in 1u32..8,
        tools in proptest::collection::vec(1usize..4, 20),
    ) {
        let script: Vec<_> = tools.into_iter().map(ScriptedResponse::Tools).collect();
        let run = drive(max_steps, &script);
        prop_assert_eq!(run.state, AgentState::MaxStepsReached { steps: max_steps });
        prop_assert_eq!(run.model_requests, max_steps);
        prop_assert_eq!(run.steps_recorded, max_steps);
    }

    #[test]
    fn completing_within_budget_is_never_max_steps(
        max_steps in 1u32..8,
        lead in 0usize..8,
    ) {
        let lead = lead.min(max_steps as usize - 1);
        let mut script = vec![ScriptedResponse::Text; lead];
        script.push(ScriptedResponse::Final);
        let run = drive(max_steps, &script);
        prop_assert!(
            matches!(run.state, AgentState::Completed { .. }),
            "unexpected state {:?}",
            run.state
        );
        prop_assert_eq!(run.model_requests as usize, lead + 1);
    }

    #[test]
    fn terminal_states_reject_every_event(
        state in arb_terminal_state(),
        event in arb_event(),
    ) {
        let err = transition(&state, &AgentContext { max_steps: 5 }, event);
        prop_assert!(matches!(err, Err(TransitionError::Terminal(_))));
    }

    #[test]
    fn cancel_from_any_live_state_is_terminal(state in arb_non_terminal_state()) {
        let result = transition(&state, &AgentContext { max_steps: 5 }, AgentEvent::Cancelled)
            .expect("cancel is always accepted");
        prop_assert!(result.new_state.is_terminal());
        prop_assert!(!result.effects.contains(&AgentEffect::RequestModel));
    }
}
