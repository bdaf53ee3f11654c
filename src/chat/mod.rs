
use serde::Serialize;

use crate::database::SearchHit;
use crate::model::ChatMessage;

/// Fixed instruction prepended to every server-side RAG conversation.
pub const SYSTEM_PROMPT_BASE: &str = "You are a helpful assistant. \
Answer using the provided context. If the context does not contain the \
answer, say you do not know. Keep responses concise and cite sources by \
their bracketed ids.";

/// Default system message for client-rag requests that bring none.
pub const SYSTEM_PROMPT_PLAIN: &str = "You are a helpful assistant.";

/// One retrieved chunk as surfaced to API clients.
#[derive(Debug, Clone, Serialize)]
pub struct RagChunk {
    pub source: String,
    pub score: f64,
    pub text: String,
    pub doc_id: i64,
    pub chunk_index: i64,
    pub url: String,
}

/// Structured retrieval report attached to every chat response.
///
/// Every string in here was normalized to valid UTF-8 on the way into the
/// store, so serialization cannot emit broken sequences.
#[derive(Debug, Clone, Serialize)]
pub struct RagPayload {
    pub enabled: bool,
    pub top_k: usize,
    pub doc_count: i64,
    pub chunk_count: i64,
    pub chunks: Vec<RagChunk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RagPayload {
    pub fn from_hits(
        hits: &[SearchHit],
        enabled: bool,
        top_k: usize,
        doc_count: i64,
        chunk_count: i64,
    ) -> Self {
        let chunks = hits
            .iter()
            .map(|hit| RagChunk {
                source: hit.source.clone(),
                score: hit.score,
                text: hit.text.clone(),
                doc_id: hit.doc_id,
                chunk_index: hit.chunk_index,
                url: format!("/rag/doc/{}#chunk-{}", hit.doc_id, hit.chunk_index),
            })
            .collect();
        Self {
            enabled,
            top_k,
            doc_count,
            chunk_count,
            chunks,
            trace: None,
            error: None,
        }
    }
}

/// `"[i] Source: <source>\n<text>\n\n"` for each hit, 1-indexed.
pub fn build_rag_context(hits: &[SearchHit]) -> String {
    let mut context = String::new();
    for (i, hit) in hits.iter().enumerate() {
        context.push_str(&format!("[{}] Source: {}\n", i + 1, hit.source));
        context.push_str(&hit.text);
        context.push_str("\n\n");
    }
    context
}

/// Base instruction plus the context block. When retrieval is on but found
/// nothing, the model is told so instead of being handed an empty section.
pub fn build_system_prompt(rag_context: &str, rag_enabled: bool) -> String {
    let mut prompt = SYSTEM_PROMPT_BASE.to_string();
    if rag_enabled && !rag_context.is_empty() {
        prompt.push_str("\n\nContext:\n");
        prompt.push_str(rag_context);
    } else if rag_enabled {
        prompt.push_str("\n\nContext:\n(No relevant sources found.)");
    }
    prompt
}

/// Splice the assembled system prompt into the conversation. An existing
/// system message is preserved verbatim below the assembled one.
pub fn merge_system_message(messages: &mut Vec<ChatMessage>, mut system_prompt: String) {
    match messages.first_mut() {
        Some(first) if first.role == "system" => {
            if !first.content.is_empty() {
                system_prompt.push_str("\n\nOriginal system message:\n");
                system_prompt.push_str(&first.content);
            }
            first.content = system_prompt;
        }
        _ => {
            messages.insert(
                0,
                ChatMessage {
                    role: "system".to_string(),
                    content: system_prompt,
                },
            );
        }
    }
}
