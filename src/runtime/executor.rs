//! Session runtime executor

use super::recovery::{self, RecoveryReason};
use super::traits::{CheckpointStore, DocumentRetrieval, LlmClient, ToolExecutor};
use super::SseEvent;

use crate::llm::{ContentBlock, LlmMessage, LlmRequest, MessageRole, SystemContent};
use crate::retrieval::{format_context, RetrievalError};
use crate::state_machine::state::ToolInput;
use crate::state_machine::{
    transition, ChatMessage, Effect, ErrorKind, Event, NodeName, RouteDecision, Role,
    SessionState, ToolCall, TurnPhase,
};
use crate::system_prompt::{rag_prompt, route_response_format, router_prompt, GENERAL_CHAT_PROMPT};
use crate::tools::ToolContext;
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Result recorded for search calls beyond the first in one request
pub const SKIPPED_SEARCH_RESULT: &str = "Skipped: only one web search runs per turn";

/// Generic session runtime that can work with any storage, LLM, tool and retrieval implementations
pub struct ConversationRuntime<S, L, T, R>
where
    S: CheckpointStore + 'static,
    L: LlmClient + 'static,
    T: ToolExecutor + 'static,
    R: DocumentRetrieval + 'static,
{
    session_id: String,
    state: SessionState,
    storage: S,
    llm_client: Arc<L>,
    tool_executor: Arc<T>,
    retrieval: Arc<R>,
    event_rx: mpsc::Receiver<Event>,
    broadcast_tx: broadcast::Sender<SseEvent>,
    /// Upper bound on any single model, search or indexing step
    step_timeout: Duration,
}

impl<S, L, T, R> ConversationRuntime<S, L, T, R>
where
    S: CheckpointStore + 'static,
    L: LlmClient + 'static,
    T: ToolExecutor + 'static,
    R: DocumentRetrieval + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: impl Into<String>,
        state: SessionState,
        storage: S,
        llm_client: Arc<L>,
        tool_executor: Arc<T>,
        retrieval: Arc<R>,
        event_rx: mpsc::Receiver<Event>,
        broadcast_tx: broadcast::Sender<SseEvent>,
        step_timeout: Duration,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            state,
            storage,
            llm_client,
            tool_executor,
            retrieval,
            event_rx,
            broadcast_tx,
            step_timeout,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(session_id = %self.session_id, "Starting session runtime");

        let decision = recovery::recover(std::mem::take(&mut self.state));
        self.state = decision.state;
        match (decision.reason, decision.resume) {
            (_, Some(effect)) => {
                tracing::info!(
                    session_id = %self.session_id,
                    phase = ?self.state.phase,
                    "Resuming interrupted turn"
                );
                if let Err(e) = self.resume(effect).await {
                    tracing::error!(session_id = %self.session_id, error = %e, "Failed to resume turn");
                }
            }
            (RecoveryReason::Unresumable, None) => {
                tracing::warn!(session_id = %self.session_id, "Interrupted turn cannot resume");
                if let Err(e) = self.storage.put_checkpoint(&self.session_id, &self.state).await {
                    tracing::error!(session_id = %self.session_id, error = %e, "Failed to checkpoint");
                }
            }
            (_, None) => {}
        }

        // Process events in a loop - no recursion
        while let Some(event) = self.event_rx.recv().await {
            if let Err(e) = self.process_event(event).await {
                tracing::warn!(session_id = %self.session_id, error = %e, "Error handling event");
            }
        }

        tracing::info!(session_id = %self.session_id, "Session runtime stopped");
    }

    async fn resume(&mut self, effect: Effect) -> Result<(), String> {
        let _ = self.broadcast_tx.send(SseEvent::StateChange {
            state: phase_json(&self.state.phase),
        });
        match self.execute_effect(effect).await {
            Ok(Some(event)) => self.process_event(event).await,
            Ok(None) => Ok(()),
            Err(e) => {
                self.abort_turn(&e);
                Err(e)
            }
        }
    }

    async fn process_event(&mut self, event: Event) -> Result<(), String> {
        // Events generated by effects are processed before the next user event
        let mut events_to_process = vec![event];

        while let Some(current_event) = events_to_process.pop() {
            // Pure state transition
            let result = match transition(&self.state, current_event) {
                Ok(r) => r,
                Err(e) => {
                    // Transition errors are user-facing (e.g., "agent is busy")
                    let _ = self.broadcast_tx.send(SseEvent::Error {
                        message: e.to_string(),
                    });
                    return Err(e.to_string());
                }
            };

            self.state = result.new_state;

            for effect in result.effects {
                if effect.is_step() {
                    if let Some(node) = self.state.phase.node() {
                        tracing::info!(
                            session_id = %self.session_id,
                            node = node.as_str(),
                            "Entering node"
                        );
                    }
                }
                match self.execute_effect(effect).await {
                    Ok(Some(generated_event)) => events_to_process.push(generated_event),
                    Ok(None) => {}
                    Err(e) => {
                        self.abort_turn(&e);
                        return Err(e);
                    }
                }
            }
        }

        Ok(())
    }

    /// Storage failed mid-turn; the turn cannot make durable progress
    fn abort_turn(&mut self, message: &str) {
        tracing::error!(session_id = %self.session_id, error = %message, "Aborting turn");
        self.state.phase = TurnPhase::Error {
            message: message.to_string(),
            error_kind: ErrorKind::Storage,
        };
        let _ = self.broadcast_tx.send(SseEvent::StateChange {
            state: phase_json(&self.state.phase),
        });
        let _ = self.broadcast_tx.send(SseEvent::Error {
            message: message.to_string(),
        });
    }

    /// Execute an effect and optionally return a generated event
    async fn execute_effect(&mut self, effect: Effect) -> Result<Option<Event>, String> {
        match effect {
            Effect::Checkpoint => {
                let version = self
                    .storage
                    .put_checkpoint(&self.session_id, &self.state)
                    .await
                    .map_err(|e| format!("Failed to write checkpoint: {e}"))?;
                tracing::debug!(
                    session_id = %self.session_id,
                    version,
                    phase = ?self.state.phase,
                    "Checkpoint written"
                );
                Ok(None)
            }

            Effect::NotifyState => {
                let _ = self.broadcast_tx.send(SseEvent::StateChange {
                    state: phase_json(&self.state.phase),
                });
                Ok(None)
            }

            Effect::NotifyMessage { message, live } => {
                let _ = self.broadcast_tx.send(SseEvent::Message { message, live });
                Ok(None)
            }

            Effect::NotifyTurnDone => {
                tracing::info!(
                    session_id = %self.session_id,
                    messages = self.state.messages.len(),
                    router_visits = self.state.router_visits,
                    "Turn complete"
                );
                let _ = self.broadcast_tx.send(SseEvent::TurnDone);
                Ok(None)
            }

            Effect::NotifyError { message } => {
                let kind = match &self.state.phase {
                    TurnPhase::Error { error_kind, .. } => error_kind.as_str(),
                    _ => "unknown",
                };
                tracing::warn!(session_id = %self.session_id, error = %message, kind, "Turn failed");
                let _ = self.broadcast_tx.send(SseEvent::Error { message });
                Ok(None)
            }

            step => Ok(Some(self.run_step(step).await)),
        }
    }

    /// Run a step while rejecting user events that arrive before it finishes
    async fn run_step(&mut self, effect: Effect) -> Event {
        let runner = StepRunner {
            session_id: self.session_id.clone(),
            state: self.state.clone(),
            llm_client: self.llm_client.clone(),
            tool_executor: self.tool_executor.clone(),
            retrieval: self.retrieval.clone(),
            step_timeout: self.step_timeout,
        };
        let step = runner.run(effect);
        tokio::pin!(step);

        loop {
            tokio::select! {
                event = &mut step => return event,
                Some(incoming) = self.event_rx.recv() => self.reject_while_working(incoming),
            }
        }
    }

    fn reject_while_working(&self, event: Event) {
        match transition(&self.state, event) {
            Err(e) => {
                tracing::info!(session_id = %self.session_id, error = %e, "Rejected event during step");
                let _ = self.broadcast_tx.send(SseEvent::Error {
                    message: e.to_string(),
                });
            }
            Ok(_) => {
                tracing::warn!(session_id = %self.session_id, "Dropped event accepted mid-step");
            }
        }
    }
}

/// Owned view of a session used to perform one step
struct StepRunner<L, T, R> {
    session_id: String,
    state: SessionState,
    llm_client: Arc<L>,
    tool_executor: Arc<T>,
    retrieval: Arc<R>,
    /// Upper bound on the step; expiry fires the step's cancellation token
    step_timeout: Duration,
}

impl<L, T, R> StepRunner<L, T, R>
where
    L: LlmClient,
    T: ToolExecutor,
    R: DocumentRetrieval,
{
    async fn run(self, effect: Effect) -> Event {
        let cancel = CancellationToken::new();
        let (name, outcome) = match effect {
            Effect::BuildIndex { path } => ("index", self.timed(self.build_index(path)).await),
            Effect::Classify => ("router", self.timed(self.classify()).await),
            Effect::RequestSearch => ("search_request", self.timed(self.request_search()).await),
            Effect::ExecuteSearch { call, skipped } => (
                "search",
                self.timed(self.execute_search(call, skipped, cancel.clone()))
                    .await,
            ),
            Effect::AnswerFromDocument => ("rag", self.timed(self.answer_from_document()).await),
            Effect::AnswerGeneral => ("general_chat", self.timed(self.answer_general()).await),
            other => {
                return Event::StepFailed {
                    message: format!("Not a step: {other:?}"),
                    error_kind: ErrorKind::Storage,
                }
            }
        };

        outcome.unwrap_or_else(|| {
            cancel.cancel();
            tracing::warn!(
                session_id = %self.session_id,
                step = name,
                timeout = ?self.step_timeout,
                "Step timed out"
            );
            Event::StepFailed {
                message: format!("Step `{name}` timed out after {:?}", self.step_timeout),
                error_kind: ErrorKind::TimedOut,
            }
        })
    }

    async fn timed<F>(&self, step: F) -> Option<Event>
    where
        F: Future<Output = Event>,
    {
        tokio::time::timeout(self.step_timeout, step).await.ok()
    }

    fn question(&self) -> &str {
        self.state.latest_question().unwrap_or_default()
    }

    async fn build_index(&self, path: PathBuf) -> Event {
        if !is_file(&path).await {
            tracing::info!(session_id = %self.session_id, path = %path.display(), "Document not found");
            return Event::DocumentMissing;
        }

        if self
            .state
            .retriever
            .as_ref()
            .is_some_and(|index| index.is_current_for(&path))
        {
            tracing::debug!(session_id = %self.session_id, path = %path.display(), "Reusing index");
            return Event::IndexReused;
        }

        match self.retrieval.build_index(&path).await {
            Ok(built) => Event::IndexBuilt {
                index: built.index,
                documents: built.documents,
            },
            Err(RetrievalError::NotFound(_)) => Event::DocumentMissing,
            Err(e) => Event::StepFailed {
                message: e.to_string(),
                error_kind: ErrorKind::IndexFailure,
            },
        }
    }

    async fn classify(&self) -> Event {
        let prompt = router_prompt(
            self.question(),
            self.state.retriever.is_some(),
            self.state.search_performed,
            self.state.rag_used,
        );
        let request = LlmRequest {
            response_format: Some(route_response_format()),
            ..LlmRequest::prompt(prompt)
        };

        let response = match self.llm_client.complete(&request).await {
            Ok(r) => r,
            Err(e) => {
                return Event::StepFailed {
                    message: format!("Router call failed: {e}"),
                    error_kind: ErrorKind::ClassificationFailure,
                }
            }
        };

        match RouteDecision::parse(&response.text()) {
            Ok(decision) => {
                tracing::info!(
                    session_id = %self.session_id,
                    decision = decision.label(),
                    visit = self.state.router_visits,
                    "Route decided"
                );
                Event::RouteDecided { decision }
            }
            Err(e) => Event::StepFailed {
                message: e.to_string(),
                error_kind: ErrorKind::ClassificationFailure,
            },
        }
    }

    async fn request_search(&self) -> Event {
        let request = LlmRequest {
            messages: to_llm_messages(&self.state.messages),
            tools: self.tool_executor.definitions(),
            ..LlmRequest::default()
        };

        match self.llm_client.complete(&request).await {
            Ok(response) => {
                let tool_calls: Vec<ToolCall> = response
                    .tool_uses()
                    .into_iter()
                    .map(|(id, name, input)| {
                        ToolCall::new(id, ToolInput::from_name_and_value(name, input.clone()))
                    })
                    .collect();
                tracing::debug!(
                    session_id = %self.session_id,
                    calls = tool_calls.len(),
                    "Search requested"
                );
                Event::SearchRequested {
                    content: response.text(),
                    tool_calls,
                }
            }
            Err(e) => Event::StepFailed {
                message: format!("Search request failed: {e}"),
                error_kind: ErrorKind::GenerationFailure,
            },
        }
    }

    async fn execute_search(
        &self,
        call: ToolCall,
        skipped: Vec<ToolCall>,
        cancel: CancellationToken,
    ) -> Event {
        let ctx = ToolContext::new(cancel, self.session_id.clone());
        let name = call.name().to_string();

        match self
            .tool_executor
            .execute(&name, call.input.to_value(), ctx)
            .await
        {
            None => Event::StepFailed {
                message: format!("Unknown tool: {name}"),
                error_kind: ErrorKind::ToolInvocationFailure,
            },
            Some(output) if !output.success => Event::StepFailed {
                message: format!("Tool `{name}` failed: {}", output.output),
                error_kind: ErrorKind::ToolInvocationFailure,
            },
            Some(output) => {
                let mut results = vec![ChatMessage::tool_result(
                    call.id,
                    output.output,
                    NodeName::Search,
                )];
                results.extend(skipped.into_iter().map(|c| {
                    ChatMessage::tool_result(c.id, SKIPPED_SEARCH_RESULT, NodeName::Search)
                }));
                Event::SearchComplete { results }
            }
        }
    }

    async fn answer_from_document(&self) -> Event {
        let Some(path) = self.state.document_path.as_deref() else {
            return Event::DocumentMissing;
        };
        if !is_file(path).await {
            tracing::info!(session_id = %self.session_id, path = %path.display(), "Indexed document disappeared");
            return Event::DocumentMissing;
        }
        let Some(index) = self.state.retriever.as_ref() else {
            return Event::StepFailed {
                message: "No document index for this session".to_string(),
                error_kind: ErrorKind::IndexFailure,
            };
        };

        let question = self.question();
        let passages = match self.retrieval.retrieve(index, question).await {
            Ok(p) => p,
            Err(e) => {
                return Event::StepFailed {
                    message: format!("Retrieval failed: {e}"),
                    error_kind: ErrorKind::IndexFailure,
                }
            }
        };
        tracing::debug!(session_id = %self.session_id, passages = passages.len(), "Passages retrieved");

        let request = LlmRequest::prompt(rag_prompt(&format_context(&passages), question));
        match self.llm_client.complete(&request).await {
            Ok(response) => Event::AnswerGenerated {
                content: response.text(),
            },
            Err(e) => Event::StepFailed {
                message: format!("Answer generation failed: {e}"),
                error_kind: ErrorKind::GenerationFailure,
            },
        }
    }

    async fn answer_general(&self) -> Event {
        let request = LlmRequest {
            system: vec![SystemContent::new(GENERAL_CHAT_PROMPT)],
            messages: to_llm_messages(&self.state.messages),
            ..LlmRequest::default()
        };
        match self.llm_client.complete(&request).await {
            Ok(response) => Event::AnswerGenerated {
                content: response.text(),
            },
            Err(e) => Event::StepFailed {
                message: format!("Answer generation failed: {e}"),
                error_kind: ErrorKind::GenerationFailure,
            },
        }
    }
}

fn phase_json(phase: &TurnPhase) -> Value {
    serde_json::to_value(phase).unwrap_or(Value::Null)
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|meta| meta.is_file())
}

/// Convert session history into provider messages.
///
/// Consecutive tool results merge into one user message. Tool calls with no
/// recorded result (a turn that failed mid-search) are dropped, since
/// providers reject unanswered calls.
pub fn to_llm_messages(messages: &[ChatMessage]) -> Vec<LlmMessage> {
    let answered: HashSet<&str> = messages
        .iter()
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();

    let mut out: Vec<LlmMessage> = Vec::with_capacity(messages.len());
    for message in messages {
        match message.role {
            Role::User => out.push(LlmMessage::user(message.content.clone())),
            Role::Assistant => {
                let mut content = Vec::new();
                if !message.content.is_empty() {
                    content.push(ContentBlock::text(message.content.clone()));
                }
                content.extend(
                    message
                        .tool_calls
                        .iter()
                        .filter(|call| answered.contains(call.id.as_str()))
                        .map(|call| {
                            ContentBlock::tool_use(call.id.clone(), call.name(), call.input.to_value())
                        }),
                );
                if !content.is_empty() {
                    out.push(LlmMessage {
                        role: MessageRole::Assistant,
                        content,
                    });
                }
            }
            Role::Tool => {
                let Some(id) = message.tool_call_id.as_deref() else {
                    continue;
                };
                let block = ContentBlock::tool_result(id, message.content.clone(), false);
                match out.last_mut() {
                    Some(last)
                        if last.role == MessageRole::User
                            && last
                                .content
                                .iter()
                                .all(|b| matches!(b, ContentBlock::ToolResult { .. })) =>
                    {
                        last.content.push(block);
                    }
                    _ => out.push(LlmMessage {
                        role: MessageRole::User,
                        content: vec![block],
                    }),
                }
            }
        }
    }
    out
}
