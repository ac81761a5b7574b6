//! Mock implementations for testing
//!
//! These mocks enable end-to-end testing of the runtime without real I/O.

use super::traits::*;
use super::{ConversationRuntime, SseEvent};
use crate::llm::{ContentBlock, Embedder, Embedding, LlmError, LlmRequest, LlmResponse, ToolDefinition, Usage};
use crate::retrieval::{
    BuiltIndex, DocumentFingerprint, DocumentIndex, DocumentSegment, Passage, RetrievalError,
};
use crate::state_machine::{Event, SessionState};
use crate::tools::{ToolContext, ToolOutput};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

// ============================================================================
// Mock LLM Client
// ============================================================================

/// Mock LLM client that returns queued responses
pub struct MockLlmClient {
    responses: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    model_id: String,
    /// Sleep before every reply
    delay: Option<Duration>,
    /// Record of all requests made
    pub requests: Mutex<Vec<LlmRequest>>,
}

impl MockLlmClient {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            model_id: model_id.into(),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a successful response
    pub fn queue_response(&self, response: LlmResponse) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    /// Queue a classifier reply carrying `label`
    pub fn queue_route(&self, label: &str) {
        self.queue_response(LlmResponse::text_only(
            json!({ "next_step": label }).to_string(),
        ));
    }

    /// Queue a reply holding one web search tool call
    pub fn queue_search_call(&self, id: &str, query: &str) {
        self.queue_response(LlmResponse {
            content: vec![ContentBlock::tool_use(
                id,
                crate::state_machine::state::WEB_SEARCH_TOOL,
                json!({ "query": query }),
            )],
            end_turn: false,
            usage: Usage::default(),
        });
    }

    /// Queue an error response
    pub fn queue_error(&self, error: LlmError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    /// Get recorded requests
    pub fn recorded_requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::network("No mock response queued")))
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

// ============================================================================
// Mock Tool Executor
// ============================================================================

/// Mock tool executor with predefined outputs
pub struct MockToolExecutor {
    outputs: HashMap<String, ToolOutput>,
    definitions: Vec<ToolDefinition>,
    /// Record of tool executions
    pub executions: Mutex<Vec<(String, Value)>>,
}

impl MockToolExecutor {
    pub fn new() -> Self {
        Self {
            outputs: HashMap::new(),
            definitions: Vec::new(),
            executions: Mutex::new(Vec::new()),
        }
    }

    /// Add a tool with a predefined output
    pub fn with_tool(mut self, name: impl Into<String>, output: ToolOutput) -> Self {
        let name = name.into();
        self.definitions.push(ToolDefinition {
            name: name.clone(),
            description: format!("Mock {name}"),
            input_schema: json!({ "type": "object", "properties": {} }),
        });
        self.outputs.insert(name, output);
        self
    }

    /// Get recorded executions
    pub fn recorded_executions(&self) -> Vec<(String, Value)> {
        self.executions.lock().unwrap().clone()
    }
}

impl Default for MockToolExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolExecutor for MockToolExecutor {
    async fn execute(&self, name: &str, input: Value, _ctx: ToolContext) -> Option<ToolOutput> {
        self.executions
            .lock()
            .unwrap()
            .push((name.to_string(), input));
        self.outputs.get(name).cloned()
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        self.definitions.clone()
    }
}

// ============================================================================
// Mock Retrieval
// ============================================================================

/// Retrieval returning fixed passages for any existing file
#[derive(Default)]
pub struct MockRetrieval {
    passages: Vec<String>,
    fail_builds: bool,
    pub builds: Mutex<Vec<PathBuf>>,
    pub queries: Mutex<Vec<String>>,
}

impl MockRetrieval {
    pub fn with_passages(passages: &[&str]) -> Self {
        Self {
            passages: passages.iter().map(|p| (*p).to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_builds: true,
            ..Self::default()
        }
    }

    pub fn build_count(&self) -> usize {
        self.builds.lock().unwrap().len()
    }

    pub fn recorded_queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl DocumentRetrieval for MockRetrieval {
    async fn build_index(&self, path: &Path) -> Result<BuiltIndex, RetrievalError> {
        self.builds.lock().unwrap().push(path.to_path_buf());
        if self.fail_builds {
            return Err(RetrievalError::Empty(path.to_path_buf()));
        }
        let fingerprint = DocumentFingerprint::of(path)
            .map_err(|_| RetrievalError::NotFound(path.to_path_buf()))?;
        let passages = self
            .passages
            .iter()
            .map(|text| Passage {
                text: text.clone(),
                page: 1,
                embedding: vec![1.0],
            })
            .collect();
        Ok(BuiltIndex {
            documents: vec![DocumentSegment {
                text: self.passages.join(" "),
                page: 1,
            }],
            index: DocumentIndex::new(path.to_path_buf(), fingerprint, passages),
        })
    }

    async fn retrieve(
        &self,
        index: &DocumentIndex,
        query: &str,
    ) -> Result<Vec<String>, RetrievalError> {
        self.queries.lock().unwrap().push(query.to_string());
        Ok(index.passages().iter().map(|p| p.text.clone()).collect())
    }
}

// ============================================================================
// Keyword Embedder
// ============================================================================

/// Deterministic embedder: one dimension per keyword holding its occurrence
/// count in the lowercased text
pub struct KeywordEmbedder {
    keywords: Vec<String>,
    calls: AtomicUsize,
}

impl KeywordEmbedder {
    pub fn new(keywords: &[&str]) -> Self {
        Self {
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of `embed_batch` calls so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|text| {
                let lower = text.to_lowercase();
                self.keywords
                    .iter()
                    .map(|k| lower.matches(k.as_str()).count() as f32)
                    .collect()
            })
            .collect())
    }

    fn model_id(&self) -> &str {
        "keyword"
    }
}

// ============================================================================
// In-Memory Checkpoint Store
// ============================================================================

/// Checkpoint store keeping every version in memory
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, Vec<SessionState>>>,
    fail_writes: AtomicBool,
}

impl InMemoryCheckpointStore {
    /// Make every subsequent write fail
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// All versions written for a session, oldest first
    pub fn history(&self, session_id: &str) -> Vec<SessionState> {
        self.checkpoints
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn put_checkpoint(&self, session_id: &str, state: &SessionState) -> Result<i64, String> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err("disk full".to_string());
        }
        let mut checkpoints = self.checkpoints.lock().unwrap();
        let versions = checkpoints.entry(session_id.to_string()).or_default();
        versions.push(state.clone());
        Ok(versions.len() as i64)
    }
}

// ============================================================================
// Test Runtime
// ============================================================================

const SESSION_ID: &str = "test-session";

/// A running `ConversationRuntime` wired to mocks
pub struct TestRuntime {
    pub storage: Arc<InMemoryCheckpointStore>,
    pub event_tx: mpsc::Sender<Event>,
    pub broadcast_rx: broadcast::Receiver<SseEvent>,
    pub llm: Arc<MockLlmClient>,
    pub tools: Arc<MockToolExecutor>,
    pub retrieval: Arc<MockRetrieval>,
    _runtime_handle: tokio::task::JoinHandle<()>,
}

impl TestRuntime {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> TestRuntimeBuilder {
        TestRuntimeBuilder::default()
    }
}

pub struct TestRuntimeBuilder {
    state: SessionState,
    llm: Option<MockLlmClient>,
    tools: Option<MockToolExecutor>,
    retrieval: Option<MockRetrieval>,
    storage: Arc<InMemoryCheckpointStore>,
    step_timeout: Duration,
}

impl Default for TestRuntimeBuilder {
    fn default() -> Self {
        Self {
            state: SessionState::default(),
            llm: None,
            tools: None,
            retrieval: None,
            storage: Arc::new(InMemoryCheckpointStore::default()),
            step_timeout: Duration::from_secs(5),
        }
    }
}

impl TestRuntimeBuilder {
    pub fn llm(mut self, llm: MockLlmClient) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn tools(mut self, tools: MockToolExecutor) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn retrieval(mut self, retrieval: MockRetrieval) -> Self {
        self.retrieval = Some(retrieval);
        self
    }

    /// Start from a previously checkpointed state
    pub fn state(mut self, state: SessionState) -> Self {
        self.state = state;
        self
    }

    pub fn storage(mut self, storage: Arc<InMemoryCheckpointStore>) -> Self {
        self.storage = storage;
        self
    }

    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn build(self) -> TestRuntime {
        let llm = Arc::new(self.llm.unwrap_or_else(|| MockLlmClient::new("mock")));
        let tools = Arc::new(self.tools.unwrap_or_default());
        let retrieval = Arc::new(self.retrieval.unwrap_or_default());

        let (event_tx, event_rx) = mpsc::channel(32);
        let (broadcast_tx, broadcast_rx) = broadcast::channel(256);

        let runtime = ConversationRuntime::new(
            SESSION_ID,
            self.state,
            self.storage.clone(),
            llm.clone(),
            tools.clone(),
            retrieval.clone(),
            event_rx,
            broadcast_tx,
            self.step_timeout,
        );
        let handle = tokio::spawn(runtime.run());

        TestRuntime {
            storage: self.storage,
            event_tx,
            broadcast_rx,
            llm,
            tools,
            retrieval,
            _runtime_handle: handle,
        }
    }
}

impl TestRuntime {
    pub async fn send_message(&self, text: &str, document_path: Option<PathBuf>) {
        self.event_tx
            .send(Event::UserMessage {
                text: text.to_string(),
                document_path,
            })
            .await
            .unwrap();
    }

    /// Collect events until the turn finishes; `None` on timeout
    pub async fn collect_until_done(&mut self, timeout: Duration) -> Option<Vec<SseEvent>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut events = Vec::new();
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(50), self.broadcast_rx.recv()).await {
                Ok(Ok(SseEvent::TurnDone)) => {
                    events.push(SseEvent::TurnDone);
                    return Some(events);
                }
                Ok(Ok(event)) => events.push(event),
                _ => continue,
            }
        }
        None
    }

    /// Wait for turn completion with timeout
    pub async fn wait_for_done(&mut self, timeout: Duration) -> bool {
        self.collect_until_done(timeout).await.is_some()
    }

    /// Wait for an error broadcast and return its message
    pub async fn wait_for_error(&mut self, timeout: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(50), self.broadcast_rx.recv()).await {
                Ok(Ok(SseEvent::Error { message })) => return Some(message),
                _ => continue,
            }
        }
        None
    }

    /// Wait for a specific phase type with timeout
    pub async fn wait_for_state(&mut self, expected_type: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(50), self.broadcast_rx.recv()).await {
                Ok(Ok(SseEvent::StateChange { state })) => {
                    if state.get("type").and_then(|v| v.as_str()) == Some(expected_type) {
                        return true;
                    }
                }
                _ => continue,
            }
        }
        false
    }

    /// Latest checkpointed state
    pub fn state(&self) -> SessionState {
        self.storage.history(SESSION_ID).pop().unwrap_or_default()
    }

    pub fn checkpoints(&self) -> Vec<SessionState> {
        self.storage.history(SESSION_ID)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MessageRole;
    use crate::state_machine::state::WEB_SEARCH_TOOL;
    use crate::state_machine::{ErrorKind, NodeName, Role, TurnPhase};
    use crate::system_prompt::{
        DOCUMENT_MISSING_MESSAGE, FILE_NOT_FOUND_MESSAGE, GENERAL_CHAT_PROMPT, REFUSAL_MESSAGE,
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn search_results() -> ToolOutput {
        ToolOutput::success(
            json!([{
                "title": "Blood pressure basics",
                "url": "https://example.org/bp",
                "content": "Normal blood pressure is below 120/80 mmHg.",
                "score": 0.92
            }])
            .to_string(),
        )
    }

    fn document() -> tempfile::NamedTempFile {
        let file = tempfile::Builder::new().suffix(".pdf").tempfile().unwrap();
        std::fs::write(file.path(), b"%PDF-1.4 label").unwrap();
        file
    }

    fn messages_of(events: &[SseEvent]) -> Vec<(crate::state_machine::ChatMessage, bool)> {
        events
            .iter()
            .filter_map(|e| match e {
                SseEvent::Message { message, live } => Some((message.clone(), *live)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn blood_pressure_question_searches_then_answers() {
        let llm = MockLlmClient::new("mock");
        llm.queue_route("search");
        llm.queue_search_call("call_1", "normal blood pressure range");
        llm.queue_route("general_chat");
        llm.queue_response(LlmResponse::text_only(
            "A normal blood pressure is below 120/80 mmHg.",
        ));
        let tools = MockToolExecutor::new().with_tool(WEB_SEARCH_TOOL, search_results());

        let mut rt = TestRuntime::new().llm(llm).tools(tools).build();
        rt.send_message("What is a normal blood pressure?", None).await;
        let events = rt.collect_until_done(WAIT).await.expect("turn completes");

        let state = rt.state();
        assert_eq!(state.phase, TurnPhase::Idle);
        assert!(state.search_performed);
        assert!(!state.rag_used);
        assert_eq!(state.messages.len(), 4);
        assert_eq!(state.messages[1].tool_calls.len(), 1);
        assert_eq!(state.messages[2].role, Role::Tool);
        assert_eq!(state.messages[2].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(
            state.messages[3].content,
            "A normal blood pressure is below 120/80 mmHg."
        );
        assert_eq!(state.messages[3].node, Some(NodeName::GeneralChat));

        let executions = rt.tools.recorded_executions();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].1["query"], "normal blood pressure range");

        let requests = rt.llm.recorded_requests();
        assert_eq!(requests.len(), 4);
        assert!(requests[0].response_format.is_some());
        assert_eq!(requests[1].tools.len(), 1);
        let second_route = requests[2].messages[0].content[0].clone();
        assert!(matches!(
            second_route,
            ContentBlock::Text { text } if text.contains("Search Already Used: Yes")
        ));
        assert_eq!(requests[3].system[0].text, GENERAL_CHAT_PROMPT);
        // user, assistant tool call, merged tool results
        assert_eq!(requests[3].messages.len(), 3);
        assert_eq!(requests[3].messages[2].role, MessageRole::User);

        // Every appended message is broadcast; only the final answer is live
        let broadcast = messages_of(&events);
        assert_eq!(broadcast.len(), 3);
        assert_eq!(
            broadcast.iter().filter(|(_, live)| *live).count(),
            1
        );
        assert!(broadcast.last().unwrap().1);
    }

    #[tokio::test]
    async fn non_medical_question_is_refused() {
        let llm = MockLlmClient::new("mock");
        llm.queue_route("out_of_scope");

        let mut rt = TestRuntime::new().llm(llm).build();
        rt.send_message("Who won the football match yesterday?", None)
            .await;
        assert!(rt.wait_for_done(WAIT).await);

        let state = rt.state();
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[1].content, REFUSAL_MESSAGE);
        assert_eq!(state.messages[1].node, Some(NodeName::Router));
        assert_eq!(rt.llm.recorded_requests().len(), 1);
        assert!(rt.tools.recorded_executions().is_empty());
    }

    #[tokio::test]
    async fn missing_document_reports_file_not_found() {
        let mut rt = TestRuntime::new().build();
        rt.send_message(
            "What dosage does my report recommend?",
            Some(PathBuf::from("/nonexistent/report.pdf")),
        )
        .await;
        assert!(rt.wait_for_done(WAIT).await);

        let state = rt.state();
        assert_eq!(state.messages.last().unwrap().content, FILE_NOT_FOUND_MESSAGE);
        assert!(rt.llm.recorded_requests().is_empty());
        assert_eq!(rt.retrieval.build_count(), 0);
    }

    #[tokio::test]
    async fn document_question_answers_from_passages() {
        let file = document();
        let llm = MockLlmClient::new("mock");
        llm.queue_route("rag");
        llm.queue_response(LlmResponse::text_only("Take 5 mg twice daily."));
        llm.queue_route("general_chat");
        llm.queue_response(LlmResponse::text_only(
            "Your report recommends 5 mg twice daily.",
        ));
        let retrieval = MockRetrieval::with_passages(&["Dosage: 5 mg twice daily."]);

        let mut rt = TestRuntime::new().llm(llm).retrieval(retrieval).build();
        rt.send_message(
            "What dosage does my report recommend?",
            Some(file.path().to_path_buf()),
        )
        .await;
        assert!(rt.wait_for_done(WAIT).await);

        let state = rt.state();
        assert!(state.rag_used);
        assert!(state.retriever.is_some());
        assert_eq!(state.documents.len(), 1);
        assert_eq!(state.messages[1].node, Some(NodeName::Rag));
        assert_eq!(state.messages[2].node, Some(NodeName::GeneralChat));

        assert_eq!(
            rt.retrieval.recorded_queries(),
            vec!["What dosage does my report recommend?".to_string()]
        );
        let requests = rt.llm.recorded_requests();
        let rag_request = &requests[1];
        assert!(rag_request.system.is_empty());
        assert!(matches!(
            &rag_request.messages[0].content[0],
            ContentBlock::Text { text }
                if text.contains("Dosage: 5 mg twice daily.")
                    && text.contains("Question: What dosage does my report recommend?")
        ));
    }

    #[tokio::test]
    async fn document_deleted_after_indexing_is_reported_by_rag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.pdf");
        std::fs::write(&path, b"%PDF-1.4 dosage").unwrap();

        let llm = MockLlmClient::new("mock").with_delay(Duration::from_millis(200));
        llm.queue_route("rag");
        let retrieval = MockRetrieval::with_passages(&["Dosage: 5 mg twice daily."]);

        let mut rt = TestRuntime::new().llm(llm).retrieval(retrieval).build();
        rt.send_message("What dosage does my report recommend?", Some(path.clone()))
            .await;
        assert!(rt.wait_for_state("routing", WAIT).await);
        std::fs::remove_file(&path).unwrap();
        assert!(rt.wait_for_done(WAIT).await);

        let state = rt.state();
        assert_eq!(state.phase, TurnPhase::Idle);
        let last = state.messages.last().unwrap();
        assert_eq!(last.content, DOCUMENT_MISSING_MESSAGE);
        assert_eq!(last.node, Some(NodeName::Rag));
        assert_eq!(rt.retrieval.build_count(), 1);
        assert!(rt.retrieval.recorded_queries().is_empty());
        // Only the classifier ran; no answer was generated
        assert_eq!(rt.llm.recorded_requests().len(), 1);
    }

    #[tokio::test]
    async fn unchanged_document_reuses_index_across_turns() {
        let file = document();
        let llm = MockLlmClient::new("mock");
        for answer in ["first answer", "second answer"] {
            llm.queue_route("general_chat");
            llm.queue_response(LlmResponse::text_only(answer));
        }

        let mut rt = TestRuntime::new()
            .llm(llm)
            .retrieval(MockRetrieval::with_passages(&["passage"]))
            .build();
        for question in ["Is ibuprofen safe?", "And paracetamol?"] {
            rt.send_message(question, Some(file.path().to_path_buf()))
                .await;
            assert!(rt.wait_for_done(WAIT).await);
        }

        assert_eq!(rt.retrieval.build_count(), 1);
        assert_eq!(rt.state().messages.len(), 4);
    }

    #[tokio::test]
    async fn turn_without_document_drops_previous_index() {
        let file = document();
        let llm = MockLlmClient::new("mock");
        for _ in 0..2 {
            llm.queue_route("general_chat");
            llm.queue_response(LlmResponse::text_only("answer"));
        }

        let mut rt = TestRuntime::new()
            .llm(llm)
            .retrieval(MockRetrieval::with_passages(&["passage"]))
            .build();
        rt.send_message("Is ibuprofen safe?", Some(file.path().to_path_buf()))
            .await;
        assert!(rt.wait_for_done(WAIT).await);
        rt.send_message("What about aspirin?", None).await;
        assert!(rt.wait_for_done(WAIT).await);

        assert!(rt.state().retriever.is_none());
        let requests = rt.llm.recorded_requests();
        assert!(matches!(
            &requests[2].messages[0].content[0],
            ContentBlock::Text { text } if text.contains("Files Available: No")
        ));
    }

    #[tokio::test]
    async fn unknown_route_label_fails_the_turn() {
        let llm = MockLlmClient::new("mock");
        llm.queue_route("chatbot");
        llm.queue_route("out_of_scope");

        let mut rt = TestRuntime::new().llm(llm).build();
        rt.send_message("What is a normal pulse?", None).await;
        let error = rt.wait_for_error(WAIT).await.expect("error broadcast");
        assert!(error.contains("chatbot"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            rt.state().phase,
            TurnPhase::Error {
                error_kind: ErrorKind::ClassificationFailure,
                ..
            }
        ));

        // A failed turn does not block the next one
        rt.send_message("Tell me a joke", None).await;
        assert!(rt.wait_for_done(WAIT).await);
        assert_eq!(rt.state().phase, TurnPhase::Idle);
        assert_eq!(rt.state().messages.last().unwrap().content, REFUSAL_MESSAGE);
    }

    #[tokio::test]
    async fn failed_search_fails_the_turn() {
        let llm = MockLlmClient::new("mock");
        llm.queue_route("search");
        llm.queue_search_call("call_1", "bp");
        let tools = MockToolExecutor::new()
            .with_tool(WEB_SEARCH_TOOL, ToolOutput::error("Search provider returned 500"));

        let mut rt = TestRuntime::new().llm(llm).tools(tools).build();
        rt.send_message("What is a normal blood pressure?", None).await;
        assert!(rt.wait_for_state("error", WAIT).await);

        let state = rt.state();
        assert!(matches!(
            state.phase,
            TurnPhase::Error {
                error_kind: ErrorKind::ToolInvocationFailure,
                ..
            }
        ));
        // The failed call is never answered, so the next request drops it
        assert!(crate::runtime::executor::to_llm_messages(&state.messages)
            .iter()
            .all(|m| m.role == MessageRole::User));
    }

    #[tokio::test]
    async fn index_failure_fails_the_turn() {
        let file = document();
        let mut rt = TestRuntime::new()
            .retrieval(MockRetrieval::failing())
            .build();
        rt.send_message("Summarise my report", Some(file.path().to_path_buf()))
            .await;
        assert!(rt.wait_for_state("error", WAIT).await);
        assert!(matches!(
            rt.state().phase,
            TurnPhase::Error {
                error_kind: ErrorKind::IndexFailure,
                ..
            }
        ));
        assert!(rt.state().retriever.is_none());
    }

    #[tokio::test]
    async fn slow_step_times_out() {
        let llm = MockLlmClient::new("mock").with_delay(Duration::from_secs(10));
        llm.queue_route("general_chat");

        let mut rt = TestRuntime::new()
            .llm(llm)
            .step_timeout(Duration::from_millis(100))
            .build();
        rt.send_message("What is a normal pulse?", None).await;
        let error = rt.wait_for_error(WAIT).await.expect("timeout error");
        assert!(error.contains("timed out"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            rt.state().phase,
            TurnPhase::Error {
                error_kind: ErrorKind::TimedOut,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn message_during_turn_is_rejected() {
        let llm = MockLlmClient::new("mock").with_delay(Duration::from_millis(200));
        llm.queue_route("general_chat");
        llm.queue_response(LlmResponse::text_only("60 to 100 beats per minute."));

        let mut rt = TestRuntime::new().llm(llm).build();
        rt.send_message("What is a normal pulse?", None).await;
        rt.send_message("Also, what about blood pressure?", None).await;

        let error = rt.wait_for_error(WAIT).await.expect("busy error");
        assert!(error.contains("busy"));
        assert!(rt.wait_for_done(WAIT).await);

        let users = rt
            .state()
            .messages
            .iter()
            .filter(|m| m.role == Role::User)
            .count();
        assert_eq!(users, 1);
    }

    #[tokio::test]
    async fn provider_error_fails_general_answer() {
        let llm = MockLlmClient::new("mock");
        llm.queue_route("general_chat");
        llm.queue_error(LlmError::rate_limit("quota exhausted"));

        let mut rt = TestRuntime::new().llm(llm).build();
        rt.send_message("How much sleep do adults need?", None).await;

        let error = rt.wait_for_error(WAIT).await.expect("generation error");
        assert!(error.contains("Answer generation failed"));
        assert!(matches!(
            rt.state().phase,
            TurnPhase::Error {
                error_kind: ErrorKind::GenerationFailure,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn checkpoint_failure_aborts_turn() {
        let storage = Arc::new(InMemoryCheckpointStore::default());
        storage.fail_writes();

        let mut rt = TestRuntime::new().storage(storage).build();
        rt.send_message("What is a normal pulse?", None).await;

        let error = rt.wait_for_error(WAIT).await.expect("storage error");
        assert!(error.contains("disk full"));
        assert!(rt.llm.recorded_requests().is_empty());
    }

    #[tokio::test]
    async fn interrupted_turn_resumes_from_checkpoint() {
        let llm = MockLlmClient::new("mock");
        llm.queue_route("general_chat");
        llm.queue_response(LlmResponse::text_only("60 to 100 beats per minute."));

        let interrupted = SessionState {
            messages: vec![crate::state_machine::ChatMessage::user(
                "What is a normal pulse?",
            )],
            router_visits: 1,
            phase: TurnPhase::Routing,
            ..SessionState::default()
        };

        let mut rt = TestRuntime::new().llm(llm).state(interrupted).build();
        assert!(rt.wait_for_done(WAIT).await);

        let state = rt.state();
        assert_eq!(state.phase, TurnPhase::Idle);
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[1].content, "60 to 100 beats per minute.");
    }

    #[tokio::test]
    async fn every_state_change_is_checkpointed() {
        let llm = MockLlmClient::new("mock");
        llm.queue_route("general_chat");
        llm.queue_response(LlmResponse::text_only("Drink water."));

        let mut rt = TestRuntime::new().llm(llm).build();
        rt.send_message("How do I avoid dehydration?", None).await;
        assert!(rt.wait_for_done(WAIT).await);

        let phases: Vec<TurnPhase> = rt.checkpoints().into_iter().map(|s| s.phase).collect();
        assert_eq!(
            phases,
            vec![
                TurnPhase::Routing,
                TurnPhase::AnsweringGeneral,
                TurnPhase::Idle
            ]
        );
    }
}
