//! Session state machine
//!
//! Implements the Elm Architecture pattern with pure state transitions: the
//! decision graph `INDEX -> ROUTER -> {RAG, SEARCH, GENERAL_CHAT}` lives
//! entirely in [`transition`], and the runtime only performs effects.

mod effect;
pub mod event;
pub mod router;
pub mod state;
pub(crate) mod transition;

#[cfg(test)]
mod proptests;

pub use effect::Effect;
pub use event::Event;
pub use router::RouteDecision;
pub use state::{ChatMessage, ErrorKind, NodeName, Role, SessionState, ToolCall, TurnPhase};
pub use transition::transition;
