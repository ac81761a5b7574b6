//! Prompt construction and fixed user-visible texts

use crate::llm::ResponseFormat;
use crate::state_machine::router::{RouteDecision, ROUTE_FIELD};
use serde_json::json;

/// Reply to non-medical questions
pub const REFUSAL_MESSAGE: &str =
    "I am a specialized medical assistant. I cannot answer non-medical questions.";

/// Reply when the turn's document path does not resolve at indexing time
pub const FILE_NOT_FOUND_MESSAGE: &str = "File not found.";

/// Reply when the indexed document disappeared before answering from it
pub const DOCUMENT_MISSING_MESSAGE: &str =
    "Please check the file you uploaded exists and isn't corrupted.";

/// System instruction for the open-domain answerer
pub const GENERAL_CHAT_PROMPT: &str = "You are a respectful medical agent. Answer ONLY medical questions. \
Do not hallucinate. If you are unsure, say so. \
You have tools (Search/RAG) at your disposal via the router, \
so only provide direct answers if you are certain of your training data.";

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "Yes"
    } else {
        "No"
    }
}

/// Classifier prompt for one router entry
pub fn router_prompt(
    question: &str,
    has_retriever: bool,
    search_performed: bool,
    rag_used: bool,
) -> String {
    format!(
        "You are a Medical Gatekeeper Orchestrator.
User Question: {question}
Files Available: {files}
Search Already Used: {searched}
Checked Medical PDFs: {checked}

CRITICAL RULES:
1. Evaluate if the question is related to medicine, health, biology, or clinical data.
2. If the question is NOT medical, return 'out_of_scope'.
3. If medical:
    - Use 'rag' if the answer is likely in the uploaded medical PDF. IF FILES ARE AVAILABLE!
    - Use 'search' ONLY if 'Search Already Used' is 'No'.
    - Use 'general_chat' if search has already been used or for general advice.
",
        files = yes_no(has_retriever),
        searched = yes_no(search_performed),
        checked = yes_no(rag_used),
    )
}

/// Structured output schema restricting the classifier to the four labels
pub fn route_response_format() -> ResponseFormat {
    let labels: Vec<&str> = RouteDecision::ALL.iter().map(|d| d.label()).collect();
    ResponseFormat {
        name: "router_decision".to_string(),
        schema: json!({
            "type": "object",
            "properties": {
                ROUTE_FIELD: {
                    "type": "string",
                    "enum": labels,
                    "description": "Pick 'rag' for doc info, 'search' for web info, \
                        'general_chat' for general medical knowledge, or 'out_of_scope' \
                        for non-medical topics."
                }
            },
            "required": [ROUTE_FIELD],
            "additionalProperties": false
        }),
    }
}

/// Prompt constraining the answer to retrieved passages
pub fn rag_prompt(context: &str, question: &str) -> String {
    format!("Answer based strictly on the context below:\n{context}\n\nQuestion: {question}\n")
}
