//! Pure state transition function
//!
//! Every edge of the decision graph is a match arm here; the executor only
//! performs the effects returned and feeds their outcome back in as events.

use super::router::{route, RouteFlags, RouteOutcome};
use super::state::{ChatMessage, NodeName, SessionState, TurnPhase};
use super::{Effect, Event};
use crate::system_prompt::{DOCUMENT_MISSING_MESSAGE, FILE_NOT_FOUND_MESSAGE, REFUSAL_MESSAGE};
use thiserror::Error;

/// Router entries allowed per turn before general chat is forced
///
/// Each usage flag flips at most once, so the policy itself never needs more
/// than three entries.
pub const MAX_ROUTER_VISITS: u32 = 3;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: SessionState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: SessionState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

/// Errors that can occur during transition
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Agent is busy, wait for the current turn to finish")]
    AgentBusy,
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

/// Pure transition function
pub fn transition(state: &SessionState, event: Event) -> Result<TransitionResult, TransitionError> {
    match (&state.phase, event) {
        // ============================================================
        // Turn start
        // ============================================================
        (TurnPhase::Idle | TurnPhase::Error { .. }, Event::UserMessage { text, document_path }) => {
            let mut next = state.clone();
            next.search_performed = false;
            next.rag_used = false;
            next.router_visits = 0;
            next.messages.push(ChatMessage::user(text));
            next.document_path = document_path.filter(|p| !p.as_os_str().is_empty());

            match next.document_path.clone() {
                Some(path) => {
                    next.phase = TurnPhase::Indexing;
                    Ok(TransitionResult::new(next).with_effects([
                        Effect::Checkpoint,
                        Effect::NotifyState,
                        Effect::BuildIndex { path },
                    ]))
                }
                None => {
                    // No document: nothing to index, and no stale retriever
                    next.retriever = None;
                    next.documents.clear();
                    Ok(enter_router(next))
                }
            }
        }

        (phase, Event::UserMessage { .. }) if phase.is_working() => {
            Err(TransitionError::AgentBusy)
        }

        // ============================================================
        // Indexer
        // ============================================================
        (TurnPhase::Indexing, Event::IndexBuilt { index, documents }) => {
            let mut next = state.clone();
            next.retriever = Some(index);
            next.documents = documents;
            Ok(enter_router(next))
        }

        (TurnPhase::Indexing, Event::IndexReused) => Ok(enter_router(state.clone())),

        (TurnPhase::Indexing, Event::DocumentMissing) => Ok(finish_turn(
            state.clone(),
            ChatMessage::assistant(FILE_NOT_FOUND_MESSAGE, NodeName::Index),
        )),

        // ============================================================
        // Router
        // ============================================================
        (TurnPhase::Routing, Event::RouteDecided { decision }) => {
            let mut next = state.clone();
            let flags = RouteFlags {
                rag_used: next.rag_used,
                search_performed: next.search_performed,
                has_retriever: next.retriever.is_some(),
            };

            match route(decision, flags) {
                RouteOutcome::Refuse => Ok(finish_turn(
                    next,
                    ChatMessage::assistant(REFUSAL_MESSAGE, NodeName::Router),
                )),
                RouteOutcome::DispatchRag => {
                    next.rag_used = true;
                    Ok(dispatch(next, TurnPhase::AnsweringFromDocument, Effect::AnswerFromDocument))
                }
                RouteOutcome::SkipRag => {
                    next.rag_used = true;
                    Ok(enter_router(next))
                }
                RouteOutcome::RequestSearch => {
                    next.search_performed = true;
                    Ok(dispatch(next, TurnPhase::RequestingSearch, Effect::RequestSearch))
                }
                RouteOutcome::GeneralChat => Ok(dispatch(
                    next,
                    TurnPhase::AnsweringGeneral,
                    Effect::AnswerGeneral,
                )),
            }
        }

        // ============================================================
        // Search
        // ============================================================
        (TurnPhase::RequestingSearch, Event::SearchRequested { content, tool_calls }) => {
            let mut next = state.clone();
            let message = ChatMessage::assistant(content, NodeName::Search)
                .with_tool_calls(tool_calls.clone());
            next.messages.push(message.clone());

            let mut calls = tool_calls.into_iter();
            let Some(call) = calls.next() else {
                // Model declined to search; flag stays set
                return Ok(with_notice(enter_router(next), message));
            };

            next.phase = TurnPhase::Searching;
            Ok(TransitionResult::new(next).with_effects([
                Effect::Checkpoint,
                Effect::NotifyState,
                Effect::notify_message(message),
                Effect::ExecuteSearch {
                    call,
                    skipped: calls.collect(),
                },
            ]))
        }

        (TurnPhase::Searching, Event::SearchComplete { results }) => {
            let mut next = state.clone();
            next.messages.extend(results.iter().cloned());
            let result = results.into_iter().rev().fold(enter_router(next), with_notice);
            Ok(result)
        }

        // ============================================================
        // Answering nodes
        // ============================================================
        (TurnPhase::AnsweringFromDocument, Event::AnswerGenerated { content }) => {
            let mut next = state.clone();
            let message = ChatMessage::assistant(content, NodeName::Rag);
            next.messages.push(message.clone());
            Ok(with_notice(enter_router(next), message))
        }

        (TurnPhase::AnsweringFromDocument, Event::DocumentMissing) => Ok(finish_turn(
            state.clone(),
            ChatMessage::assistant(DOCUMENT_MISSING_MESSAGE, NodeName::Rag),
        )),

        (TurnPhase::AnsweringGeneral, Event::AnswerGenerated { content }) => Ok(finish_turn(
            state.clone(),
            ChatMessage::assistant(content, NodeName::GeneralChat),
        )),

        // ============================================================
        // Failures
        // ============================================================
        (phase, Event::StepFailed { message, error_kind }) if phase.is_working() => {
            let mut next = state.clone();
            next.phase = TurnPhase::Error {
                message: message.clone(),
                error_kind,
            };
            Ok(TransitionResult::new(next).with_effects([
                Effect::Checkpoint,
                Effect::NotifyState,
                Effect::NotifyError { message },
            ]))
        }

        (phase, event) => Err(TransitionError::InvalidTransition(format!(
            "No transition from {phase:?} on {}",
            event_name(&event)
        ))),
    }
}

/// Enter the router, or force general chat once the visit budget is spent
fn enter_router(mut state: SessionState) -> TransitionResult {
    state.router_visits += 1;
    if state.router_visits > MAX_ROUTER_VISITS {
        return dispatch(state, TurnPhase::AnsweringGeneral, Effect::AnswerGeneral);
    }
    dispatch(state, TurnPhase::Routing, Effect::Classify)
}

fn dispatch(mut state: SessionState, phase: TurnPhase, step: Effect) -> TransitionResult {
    state.phase = phase;
    TransitionResult::new(state).with_effects([Effect::Checkpoint, Effect::NotifyState, step])
}

/// Announce an appended intermediate message right after the checkpoint
fn with_notice(mut result: TransitionResult, message: ChatMessage) -> TransitionResult {
    result.effects.insert(1, Effect::notify_message(message));
    result
}

/// Append the turn's final message and return to idle
fn finish_turn(mut state: SessionState, message: ChatMessage) -> TransitionResult {
    state.messages.push(message.clone());
    state.phase = TurnPhase::Idle;
    TransitionResult::new(state).with_effects([
        Effect::Checkpoint,
        Effect::notify_live_message(message),
        Effect::NotifyState,
        Effect::NotifyTurnDone,
    ])
}

fn event_name(event: &Event) -> &'static str {
    match event {
        Event::UserMessage { .. } => "UserMessage",
        Event::IndexBuilt { .. } => "IndexBuilt",
        Event::IndexReused => "IndexReused",
        Event::DocumentMissing => "DocumentMissing",
        Event::RouteDecided { .. } => "RouteDecided",
        Event::SearchRequested { .. } => "SearchRequested",
        Event::SearchComplete { .. } => "SearchComplete",
        Event::AnswerGenerated { .. } => "AnswerGenerated",
        Event::StepFailed { .. } => "StepFailed",
    }
}
