//! Session recovery logic
//!
//! A session whose latest checkpoint is in a working phase was interrupted
//! mid-turn. Resuming re-issues the step that phase was waiting on, so a
//! step may run more than once.

use crate::state_machine::{Effect, ErrorKind, SessionState, TurnPhase};

/// Result of inspecting a loaded checkpoint
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryDecision {
    /// The state to resume with
    pub state: SessionState,
    /// Step to re-issue, if any
    pub resume: Option<Effect>,
    pub reason: RecoveryReason,
}

/// Why we made a particular recovery decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryReason {
    /// Idle or errored; nothing was in flight
    NotInterrupted,
    /// Working phase with everything needed to re-run its step
    InterruptedMidTurn,
    /// Working phase whose inputs are gone; the turn is failed instead
    Unresumable,
}

impl RecoveryDecision {
    fn settled(state: SessionState) -> Self {
        Self {
            state,
            resume: None,
            reason: RecoveryReason::NotInterrupted,
        }
    }

    fn resume(state: SessionState, effect: Effect) -> Self {
        Self {
            state,
            resume: Some(effect),
            reason: RecoveryReason::InterruptedMidTurn,
        }
    }

    fn fail(mut state: SessionState, message: &str, error_kind: ErrorKind) -> Self {
        state.phase = TurnPhase::Error {
            message: message.to_string(),
            error_kind,
        };
        Self {
            state,
            resume: None,
            reason: RecoveryReason::Unresumable,
        }
    }
}

/// Decide how to continue a session loaded from its latest checkpoint.
pub fn recover(state: SessionState) -> RecoveryDecision {
    let effect = match &state.phase {
        TurnPhase::Idle | TurnPhase::Error { .. } => return RecoveryDecision::settled(state),
        TurnPhase::Indexing => match state.document_path.clone() {
            Some(path) => Effect::BuildIndex { path },
            None => {
                return RecoveryDecision::fail(
                    state,
                    "Interrupted while indexing without a document",
                    ErrorKind::IndexFailure,
                )
            }
        },
        TurnPhase::Routing => Effect::Classify,
        TurnPhase::RequestingSearch => Effect::RequestSearch,
        TurnPhase::Searching => {
            let Some((call, skipped)) = state.pending_tool_calls().split_first() else {
                return RecoveryDecision::fail(
                    state,
                    "Interrupted search has no pending tool call",
                    ErrorKind::ToolInvocationFailure,
                );
            };
            Effect::ExecuteSearch {
                call: call.clone(),
                skipped: skipped.to_vec(),
            }
        }
        TurnPhase::AnsweringFromDocument => Effect::AnswerFromDocument,
        TurnPhase::AnsweringGeneral => Effect::AnswerGeneral,
    };
    RecoveryDecision::resume(state, effect)
}
