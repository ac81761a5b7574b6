//! Property-based tests for the state machine
//!
//! Whole turns are driven through the pure transition function with an
//! arbitrary classifier, answering every step effect synthetically.

use super::router::RouteDecision;
use super::state::*;
use super::transition::*;
use super::*;
use crate::retrieval::{DocumentFingerprint, DocumentIndex, Passage};
use crate::system_prompt::REFUSAL_MESSAGE;
use proptest::prelude::*;
use std::collections::VecDeque;
use std::path::PathBuf;

// ============================================================================
// Test Helpers
// ============================================================================

const DOC: &str = "/uploads/guide.pdf";

/// Upper bound on transitions in a single turn
const STEP_LIMIT: usize = 64;

fn test_index() -> DocumentIndex {
    DocumentIndex::new(
        PathBuf::from(DOC),
        DocumentFingerprint {
            len: 1,
            modified_ms: 1,
        },
        vec![Passage {
            text: "passage".to_string(),
            page: 1,
            embedding: vec![1.0],
        }],
    )
}

fn search_call(n: usize) -> ToolCall {
    ToolCall::new(
        format!("call-{n}"),
        ToolInput::WebSearch(WebSearchInput {
            query: "q".to_string(),
        }),
    )
}

/// Scripted collaborators for one turn
#[derive(Debug, Clone)]
struct Script {
    decisions: Vec<RouteDecision>,
    with_document: bool,
    document_exists: bool,
    search_calls: usize,
}

#[derive(Debug, Default)]
struct TurnTrace {
    classifications: usize,
    rag_dispatches: usize,
    search_requests: usize,
    search_executions: usize,
    general_answers: usize,
    turn_done: usize,
    rag_flag_flips: usize,
    search_flag_flips: usize,
    live_messages: Vec<ChatMessage>,
    transitions: usize,
}

fn respond(effect: &Effect, script: &Script, decisions: &mut VecDeque<RouteDecision>) -> Option<Event> {
    match effect {
        Effect::BuildIndex { .. } => Some(if script.document_exists {
            Event::IndexBuilt {
                index: test_index(),
                documents: vec![],
            }
        } else {
            Event::DocumentMissing
        }),
        Effect::Classify => Some(Event::RouteDecided {
            decision: decisions.pop_front().unwrap_or(RouteDecision::GeneralChat),
        }),
        Effect::RequestSearch => Some(Event::SearchRequested {
            content: String::new(),
            tool_calls: (0..script.search_calls).map(search_call).collect(),
        }),
        Effect::ExecuteSearch { call, skipped } => Some(Event::SearchComplete {
            results: std::iter::once(call)
                .chain(skipped)
                .map(|c| ChatMessage::tool_result(&c.id, "[]", NodeName::Search))
                .collect(),
        }),
        Effect::AnswerFromDocument => Some(Event::AnswerGenerated {
            content: "from document".to_string(),
        }),
        Effect::AnswerGeneral => Some(Event::AnswerGenerated {
            content: "general".to_string(),
        }),
        _ => None,
    }
}

fn run_turn(initial: &SessionState, script: &Script) -> (SessionState, TurnTrace) {
    let mut trace = TurnTrace::default();
    let mut decisions: VecDeque<RouteDecision> = script.decisions.iter().copied().collect();
    let mut state = initial.clone();
    let mut pending = vec![Event::UserMessage {
        text: "What is the normal range for blood pressure?".to_string(),
        document_path: script.with_document.then(|| PathBuf::from(DOC)),
    }];

    while let Some(event) = pending.pop() {
        trace.transitions += 1;
        assert!(trace.transitions <= STEP_LIMIT, "turn did not terminate");

        let before = state.clone();
        let result = transition(&state, event).expect("scripted events are always valid");
        state = result.new_state;

        // The opening message resets the flags; after that they only rise
        if trace.transitions > 1 {
            assert!(!before.rag_used || state.rag_used, "rag_used was reset mid-turn");
            assert!(
                !before.search_performed || state.search_performed,
                "search_performed was reset mid-turn"
            );
            trace.rag_flag_flips += usize::from(!before.rag_used && state.rag_used);
            trace.search_flag_flips +=
                usize::from(!before.search_performed && state.search_performed);
        }

        for effect in &result.effects {
            match effect {
                Effect::Classify => trace.classifications += 1,
                Effect::AnswerFromDocument => trace.rag_dispatches += 1,
                Effect::RequestSearch => trace.search_requests += 1,
                Effect::ExecuteSearch { .. } => trace.search_executions += 1,
                Effect::AnswerGeneral => trace.general_answers += 1,
                Effect::NotifyTurnDone => trace.turn_done += 1,
                Effect::NotifyMessage { message, live: true } => {
                    trace.live_messages.push(message.clone());
                }
                _ => {}
            }
            if let Some(next) = respond(effect, script, &mut decisions) {
                pending.push(next);
            }
        }
    }

    (state, trace)
}

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_decision() -> impl Strategy<Value = RouteDecision> {
    prop_oneof![
        Just(RouteDecision::OutOfScope),
        Just(RouteDecision::Rag),
        Just(RouteDecision::Search),
        Just(RouteDecision::GeneralChat),
    ]
}

fn arb_in_scope_decision() -> impl Strategy<Value = RouteDecision> {
    prop_oneof![
        Just(RouteDecision::Rag),
        Just(RouteDecision::Search),
        Just(RouteDecision::GeneralChat),
    ]
}

fn arb_script() -> impl Strategy<Value = Script> {
    (
        proptest::collection::vec(arb_decision(), 0..8),
        any::<bool>(),
        any::<bool>(),
        0usize..3,
    )
        .prop_map(|(decisions, with_document, document_exists, search_calls)| Script {
            decisions,
            with_document,
            document_exists,
            search_calls,
        })
}

fn arb_prior_state() -> impl Strategy<Value = SessionState> {
    (any::<bool>(), any::<bool>(), 0u32..5, any::<bool>()).prop_map(
        |(rag_used, search_performed, router_visits, with_index)| SessionState {
            rag_used,
            search_performed,
            router_visits,
            retriever: with_index.then(test_index),
            messages: vec![ChatMessage::user("earlier")],
            ..SessionState::default()
        },
    )
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn every_turn_terminates_idle(prior in arb_prior_state(), script in arb_script()) {
        let (state, trace) = run_turn(&prior, &script);
        prop_assert_eq!(state.phase, TurnPhase::Idle);
        prop_assert_eq!(trace.turn_done, 1);
        prop_assert_eq!(trace.live_messages.len(), 1);
        prop_assert!(trace.classifications <= MAX_ROUTER_VISITS as usize);
        prop_assert!(state.router_visits <= MAX_ROUTER_VISITS + 1);
    }

    #[test]
    fn capabilities_run_at_most_once(prior in arb_prior_state(), script in arb_script()) {
        let (_, trace) = run_turn(&prior, &script);
        prop_assert!(trace.rag_dispatches <= 1);
        prop_assert!(trace.search_requests <= 1);
        prop_assert!(trace.search_executions <= 1);
        prop_assert!(trace.general_answers <= 1);
        prop_assert!(trace.rag_flag_flips <= 1);
        prop_assert!(trace.search_flag_flips <= 1);
    }

    #[test]
    fn no_document_never_dispatches_rag(
        prior in arb_prior_state(),
        decisions in proptest::collection::vec(arb_decision(), 0..8),
    ) {
        let script = Script { decisions, with_document: false, document_exists: false, search_calls: 1 };
        let (state, trace) = run_turn(&prior, &script);
        prop_assert_eq!(trace.rag_dispatches, 0);
        prop_assert!(state.retriever.is_none());
    }

    #[test]
    fn missing_document_never_reaches_a_model(
        decisions in proptest::collection::vec(arb_decision(), 0..8),
    ) {
        let script = Script { decisions, with_document: true, document_exists: false, search_calls: 1 };
        let (state, trace) = run_turn(&SessionState::default(), &script);
        prop_assert_eq!(trace.classifications, 0);
        prop_assert_eq!(trace.general_answers, 0);
        prop_assert_eq!(state.messages.last().map(|m| m.node), Some(Some(NodeName::Index)));
    }

    #[test]
    fn out_of_scope_first_refuses_immediately(
        prior in arb_prior_state(),
        rest in proptest::collection::vec(arb_decision(), 0..4),
    ) {
        let mut decisions = vec![RouteDecision::OutOfScope];
        decisions.extend(rest);
        let script = Script { decisions, with_document: false, document_exists: false, search_calls: 1 };
        let (state, trace) = run_turn(&prior, &script);
        prop_assert_eq!(trace.classifications, 1);
        prop_assert_eq!(trace.live_messages[0].content.as_str(), REFUSAL_MESSAGE);
        prop_assert_eq!(state.messages.last().map(|m| m.content.as_str()), Some(REFUSAL_MESSAGE));
    }

    #[test]
    fn in_scope_turns_end_with_general_chat(
        decisions in proptest::collection::vec(arb_in_scope_decision(), 0..8),
        with_document in any::<bool>(),
        search_calls in 0usize..3,
    ) {
        let script = Script { decisions, with_document, document_exists: true, search_calls };
        let (state, trace) = run_turn(&SessionState::default(), &script);
        prop_assert_eq!(trace.general_answers, 1);
        let last = state.messages.last().unwrap();
        prop_assert_eq!(last.node, Some(NodeName::GeneralChat));
        prop_assert_eq!(&trace.live_messages[0], last);
    }

    #[test]
    fn search_results_answer_every_tool_call(search_calls in 1usize..4) {
        let script = Script {
            decisions: vec![RouteDecision::Search],
            with_document: false,
            document_exists: false,
            search_calls,
        };
        let (state, _) = run_turn(&SessionState::default(), &script);
        let tool_results = state.messages.iter().filter(|m| m.role == Role::Tool).count();
        prop_assert_eq!(tool_results, search_calls);
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn blood_pressure_question_searches_then_answers() {
    let script = Script {
        decisions: vec![RouteDecision::Search, RouteDecision::Search],
        with_document: false,
        document_exists: false,
        search_calls: 1,
    };
    let (state, trace) = run_turn(&SessionState::default(), &script);

    assert_eq!(trace.search_executions, 1);
    assert_eq!(trace.classifications, 2);
    assert!(state.search_performed);
    let nodes: Vec<Option<NodeName>> = state.messages.iter().map(|m| m.node).collect();
    assert_eq!(
        nodes,
        vec![
            None,
            Some(NodeName::Search),
            Some(NodeName::Search),
            Some(NodeName::GeneralChat)
        ]
    );
}

#[test]
fn state_round_trips_between_turns() {
    let script = Script {
        decisions: vec![RouteDecision::Rag, RouteDecision::Search, RouteDecision::Rag],
        with_document: true,
        document_exists: true,
        search_calls: 1,
    };
    let (after_first, _) = run_turn(&SessionState::default(), &script);

    let json = serde_json::to_string(&after_first).unwrap();
    let restored: SessionState = serde_json::from_str(&json).unwrap();
    assert_eq!(restored.messages, after_first.messages);
    assert_eq!(restored.document_path, after_first.document_path);
    assert_eq!(restored.rag_used, after_first.rag_used);
    assert_eq!(restored.search_performed, after_first.search_performed);
    assert_eq!(restored.retriever, after_first.retriever);

    let (after_second, trace) = run_turn(&restored, &script);
    assert_eq!(trace.rag_dispatches, 1);
    assert_eq!(trace.search_executions, 1);
    assert!(after_second.messages.len() > after_first.messages.len());
}
