use std::convert::Infallible;
use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use axum::body::Bytes;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::sse::{Event, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{error, info};

use super::{assets, AppState};
use crate::chat::{
    build_rag_context, build_system_prompt, merge_system_message, RagPayload, SYSTEM_PROMPT_PLAIN,
};
use crate::ingest;
use crate::model::{ChatMessage, GenerateConfig, Usage};
use crate::retrieval;
use crate::{RagError, Result as RagResult};

/// Error wrapper translating the error taxonomy into HTTP statuses with a
/// JSON body. Handlers never crash the server; the worst case is a 500.
pub struct ApiError(RagError);

impl From<RagError> for ApiError {
    #[inline]
    fn from(err: RagError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RagError::InvalidRequest(_) | RagError::Encoding(_) => StatusCode::BAD_REQUEST,
            RagError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error!("http.error status={} message={}", status.as_u16(), self.0);
        let body = json!({"error": {"code": status.as_u16(), "message": self.0.to_string()}});
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn not_ready(error: Option<String>) -> ApiError {
    ApiError(RagError::NotReady(
        error.unwrap_or_else(|| "store not initialized".to_string()),
    ))
}

// ---- RAG document API ----

pub async fn rag_info(State(state): State<Arc<AppState>>) -> Json<Value> {
    let guard = state.store.lock().await;
    let ready = guard.store.is_some();
    let mut info = json!({
        "enabled": state.settings.rag_enabled && ready,
        "ready": ready,
        "doc_count": guard.store.as_ref().map_or(0, |s| s.doc_count()),
        "chunk_count": guard.store.as_ref().map_or(0, |s| s.chunk_count()),
        "embed_dim": guard.store.as_ref().map_or(0, |s| s.embed_dim() as i64),
    });
    if let Some(err) = &guard.error {
        info["error"] = json!(err);
    }
    Json(info)
}

#[derive(Debug, Deserialize)]
pub struct DocsQuery {
    pub limit: Option<i64>,
}

pub async fn rag_docs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DocsQuery>,
) -> ApiResult<Json<Value>> {
    let guard = state.store.lock().await;
    let error = guard.error.clone();
    let Some(store) = guard.store.as_ref() else {
        return Err(not_ready(error));
    };

    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let docs = store.list_docs(limit, 0).await?;
    let docs: Vec<Value> = docs
        .iter()
        .map(|doc| {
            json!({
                "id": doc.id,
                "filename": doc.filename,
                "mime": doc.mime,
                "added_at": doc.added_at,
                "chunk_count": doc.chunk_count,
                "url": format!("/rag/doc/{}", doc.id),
            })
        })
        .collect();
    Ok(Json(json!({"docs": docs})))
}

pub async fn rag_doc_page(
    State(state): State<Arc<AppState>>,
    Path(doc_id): Path<i64>,
) -> ApiResult<Html<String>> {
    let guard = state.store.lock().await;
    let error = guard.error.clone();
    let Some(store) = guard.store.as_ref() else {
        return Err(not_ready(error));
    };

    let (filename, chunks) = store.get_document_chunks(doc_id).await?;

    let mut page = String::with_capacity(1024);
    page.push_str("<!doctype html>\n<html><head><meta charset=\"utf-8\">\n<title>");
    page.push_str(&escape_html(&filename));
    page.push_str(
        "</title>\n<style>body{font-family:sans-serif;max-width:52rem;margin:2rem auto;padding:0 1rem}\
pre{white-space:pre-wrap;background:#f6f6f6;padding:.75rem;border-radius:4px}\
h2{font-size:1rem;color:#555}</style></head><body>\n",
    );
    page.push_str(&format!(
        "<h1>{}</h1>\n<p>{} chunks</p>\n",
        escape_html(&filename),
        chunks.len()
    ));
    for chunk in &chunks {
        page.push_str(&format!(
            "<section id=\"chunk-{index}\"><h2>Chunk {index}</h2><pre>{text}</pre></section>\n",
            index = chunk.chunk_index,
            text = escape_html(&chunk.text)
        ));
    }
    page.push_str("</body></html>\n");
    Ok(Html(page))
}

pub async fn rag_doc_delete(
    State(state): State<Arc<AppState>>,
    Path(doc_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let mut guard = state.store.lock().await;
    let error = guard.error.clone();
    let Some(store) = guard.store.as_mut() else {
        return Err(not_ready(error));
    };

    store.delete_doc(doc_id).await?;
    info!("rag.delete doc_id={doc_id}");
    Ok(Json(json!({
        "ok": true,
        "doc_id": doc_id,
        "doc_count": store.doc_count(),
        "chunk_count": store.chunk_count(),
    })))
}

pub async fn rag_upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let mut saved: Option<(std::path::PathBuf, String)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RagError::InvalidRequest(format!("invalid multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let original_name = field.file_name().unwrap_or("upload.txt").to_string();
        let extension = FsPath::new(&original_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if extension != "txt" && extension != "pdf" {
            return Err(RagError::InvalidRequest(format!(
                "unsupported file extension: .{extension} (expected .txt or .pdf)"
            ))
            .into());
        }

        let data = field
            .bytes()
            .await
            .map_err(|e| RagError::InvalidRequest(format!("failed to read upload: {e}")))?;
        if data.is_empty() {
            return Err(RagError::InvalidRequest("empty upload".to_string()).into());
        }

        let uploads = state.settings.uploads_dir();
        tokio::fs::create_dir_all(&uploads)
            .await
            .map_err(RagError::from)?;
        let stored_name = format!(
            "{}_{}",
            chrono::Utc::now().timestamp_millis(),
            sanitize_filename(&original_name)
        );
        let path = uploads.join(stored_name);
        tokio::fs::write(&path, &data).await.map_err(RagError::from)?;
        saved = Some((path, original_name));
        break;
    }

    let Some((path, original_name)) = saved else {
        return Err(RagError::InvalidRequest("missing multipart field `file`".to_string()).into());
    };

    let mut guard = state.store.lock().await;
    let error = guard.error.clone();
    let Some(store) = guard.store.as_mut() else {
        return Err(not_ready(error));
    };

    let outcome =
        ingest::ingest_file_as(store, &path, &original_name, &state.settings.ingest_options())
            .await?;
    info!(
        "rag.upload doc_id={} chunks={} filename={}",
        outcome.doc_id, outcome.chunk_count, outcome.filename
    );
    Ok(Json(json!({
        "ok": true,
        "doc": {
            "id": outcome.doc_id,
            "filename": outcome.filename,
            "mime": outcome.mime,
            "chunks": outcome.chunk_count,
        },
        "trace": outcome.trace,
        "rag": {
            "doc_count": store.doc_count(),
            "chunk_count": store.chunk_count(),
        },
    })))
}

// ---- MCP tool API ----

fn rag_tool_schema() -> Value {
    json!({
        "name": "rag_search",
        "description": "Search local documents and return relevant chunks.",
        "inputSchema": {
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "User query"},
                "top_k": {"type": "integer", "minimum": 1, "maximum": 10}
            },
            "required": ["query"]
        }
    })
}

pub async fn mcp_tools_list() -> Json<Value> {
    Json(json!([rag_tool_schema()]))
}

pub async fn mcp_tools_call(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let body: Value = serde_json::from_slice(&body)
        .map_err(|e| RagError::InvalidRequest(format!("invalid JSON: {e}")))?;

    let name = body.get("name").and_then(Value::as_str).unwrap_or_default();
    if name != "rag_search" {
        return Err(RagError::InvalidRequest(format!("unknown tool: {name}")).into());
    }
    let args = body.get("arguments").cloned().unwrap_or_else(|| json!({}));
    let query = args
        .get("query")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let mut top_k = state.settings.rag_top_k;
    if let Some(v) = args.get("top_k").and_then(Value::as_i64) {
        if v > 0 {
            top_k = v as usize;
        }
    }

    let guard = state.store.lock().await;
    let error = guard.error.clone();
    let Some(store) = guard.store.as_ref() else {
        return Err(not_ready(error));
    };

    let started = Instant::now();
    let hits = retrieval::retrieve(
        store,
        &query,
        top_k,
        state.settings.neighbor_chunks,
        state.settings.chunk_max_chars,
    )
    .await?;
    let elapsed_ms = started.elapsed().as_millis() as i64;

    let trace = vec![format!(
        "scanned {} chunks, {} hits in {elapsed_ms}ms",
        store.chunk_count(),
        hits.len()
    )];
    let context = build_rag_context(&hits);
    let chunks: Vec<Value> = hits
        .iter()
        .map(|hit| {
            json!({
                "source": hit.source,
                "score": hit.score,
                "text": hit.text,
                "doc_id": hit.doc_id,
                "chunk_index": hit.chunk_index,
                "url": format!("/rag/doc/{}#chunk-{}", hit.doc_id, hit.chunk_index),
            })
        })
        .collect();

    info!("rag.search query_len={} top_k={top_k} hits={} elapsed_ms={elapsed_ms}", query.len(), hits.len());
    Ok(Json(json!({
        "name": name,
        "result": {
            "query": query,
            "top_k": top_k,
            "elapsed_ms": elapsed_ms,
            "trace": trace,
            "chunks": chunks,
            "context": context,
        },
    })))
}

// ---- Chat completions ----

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub messages: Option<Vec<ChatMessage>>,
    pub rag_mode: Option<String>,
    pub rag_enable: Option<bool>,
    pub rag_top_k: Option<i64>,
    pub rag_payload: Option<Value>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub enable_thinking: bool,
    pub model: Option<String>,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<usize>,
    pub repetition_penalty: Option<f32>,
    pub beam_size: Option<usize>,
    pub do_sample: Option<bool>,
}

fn generate_config(request: &ChatRequest) -> GenerateConfig {
    let mut config = GenerateConfig::default();
    if let Some(v) = request.max_tokens {
        config.max_new_tokens = v;
    }
    if let Some(v) = request.temperature {
        config.temperature = v;
    }
    if let Some(v) = request.top_p {
        config.top_p = v;
    }
    if let Some(v) = request.top_k {
        config.top_k = v;
    }
    if let Some(v) = request.repetition_penalty {
        config.repetition_penalty = v;
    }
    if let Some(v) = request.beam_size {
        config.beam_size = v;
    }
    match request.do_sample {
        Some(v) => config.do_sample = v,
        None if config.temperature <= 0.0 => config.do_sample = false,
        None => {}
    }
    config
}

fn make_response_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("chatcmpl-{nanos:x}")
}

/// Best-effort process memory snapshot for the response envelope.
fn memory_stats() -> Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(rss_pages) = statm
                .split_whitespace()
                .nth(1)
                .and_then(|v| v.parse::<u64>().ok())
            {
                return json!({"rss_bytes": rss_pages * 4096});
            }
        }
    }
    json!({})
}

fn token_chunk(response_id: &str, model_name: &str, token: &str) -> String {
    json!({
        "id": response_id,
        "object": "chat.completion.chunk",
        "model": model_name,
        "choices": [{
            "index": 0,
            "delta": {"role": "assistant", "content": token},
            "finish_reason": null,
        }],
    })
    .to_string()
}

fn terminal_chunk(response_id: &str, model_name: &str, usage: &Usage, rag: &Value) -> String {
    json!({
        "id": response_id,
        "object": "chat.completion.chunk",
        "model": model_name,
        "choices": [{
            "index": 0,
            "delta": {},
            "finish_reason": "stop",
        }],
        "usage": usage,
        "mem": memory_stats(),
        "rag": rag,
    })
    .to_string()
}

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<Response> {
    let body: Value = serde_json::from_slice(&body)
        .map_err(|e| RagError::InvalidRequest(format!("invalid JSON: {e}")))?;
    let request: ChatRequest = serde_json::from_value(body)
        .map_err(|e| RagError::InvalidRequest(format!("malformed request: {e}")))?;

    let mut messages = request
        .messages
        .clone()
        .ok_or_else(|| RagError::InvalidRequest("`messages` must be an array".to_string()))?;
    if messages.is_empty() {
        return Err(RagError::InvalidRequest("`messages` cannot be empty".to_string()).into());
    }

    let client_rag = request.rag_mode.as_deref() == Some("client");
    let user_query = messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.clone())
        .unwrap_or_default();
    let rag_top_k = request
        .rag_top_k
        .filter(|&v| v > 0)
        .map(|v| v as usize)
        .unwrap_or(state.settings.rag_top_k);

    // Retrieval happens entirely under the store lock, which is released
    // before the model lock is taken.
    let (hits, rag_payload) = {
        let guard = state.store.lock().await;
        let ready = guard.store.is_some();
        let rag_enabled = if client_rag {
            false
        } else {
            request.rag_enable.unwrap_or(state.settings.rag_enabled)
        };
        let effective = rag_enabled && ready;

        let mut hits = Vec::new();
        if effective && !user_query.is_empty() {
            if let Some(store) = guard.store.as_ref() {
                hits = retrieval::retrieve(
                    store,
                    &user_query,
                    rag_top_k,
                    state.settings.neighbor_chunks,
                    state.settings.chunk_max_chars,
                )
                .await?;
            }
        }

        let payload = if client_rag {
            request.rag_payload.clone().unwrap_or_else(|| {
                json!({
                    "enabled": false,
                    "top_k": rag_top_k,
                    "doc_count": 0,
                    "chunk_count": 0,
                    "chunks": [],
                })
            })
        } else {
            let (doc_count, chunk_count) = guard
                .store
                .as_ref()
                .map_or((0, 0), |s| (s.doc_count(), s.chunk_count()));
            let mut payload =
                RagPayload::from_hits(&hits, effective, rag_top_k, doc_count, chunk_count);
            payload.error = guard.error.clone();
            serde_json::to_value(payload).map_err(|e| RagError::Internal(e.into()))?
        };
        (hits, payload)
    };

    if client_rag {
        if messages.first().map(|m| m.role != "system").unwrap_or(true) {
            messages.insert(
                0,
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT_PLAIN.to_string(),
                },
            );
        }
    } else {
        let enabled = rag_payload
            .get("enabled")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let context = build_rag_context(&hits);
        let system_prompt = build_system_prompt(&context, enabled);
        merge_system_message(&mut messages, system_prompt);
    }

    let config = generate_config(&request);
    let model_name = request
        .model
        .clone()
        .unwrap_or_else(|| state.settings.model_name.clone());
    let response_id = make_response_id();
    let prompt = {
        let model = state
            .model
            .lock()
            .map_err(|_| RagError::Internal(anyhow!("model lock poisoned")))?;
        model.apply_chat_template(&messages, true, request.enable_thinking)
    };

    if request.stream {
        return Ok(stream_completion(state, prompt, config, response_id, model_name, rag_payload));
    }

    let model = Arc::clone(&state.model);
    let (content, usage) = tokio::task::spawn_blocking(move || -> RagResult<(String, Usage)> {
        let mut model = model
            .lock()
            .map_err(|_| RagError::Internal(anyhow!("model lock poisoned")))?;
        let prefill = model.prefill(&prompt)?;
        let mut content = String::new();
        let usage = model.generate(prefill, &config, &mut |token| {
            content.push_str(token);
            true
        })?;
        Ok((content, usage))
    })
    .await
    .map_err(|e| RagError::Internal(anyhow!("generation task failed: {e}")))??;

    info!(
        "chat.generate.done id={response_id} prompt_tokens={} completion_tokens={} stream=false",
        usage.prompt_tokens, usage.completion_tokens
    );
    Ok(Json(json!({
        "id": response_id,
        "object": "chat.completion",
        "model": model_name,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop",
        }],
        "usage": usage,
        "mem": memory_stats(),
        "rag": rag_payload,
    }))
    .into_response())
}

/// SSE streaming: the blocking generation task feeds frames through a
/// channel. A dropped connection closes the channel and the token callback
/// returns false, stopping generation.
fn stream_completion(
    state: Arc<AppState>,
    prompt: String,
    config: GenerateConfig,
    response_id: String,
    model_name: String,
    rag_payload: Value,
) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<String>(64);
    let model = Arc::clone(&state.model);

    tokio::task::spawn_blocking(move || {
        let result = (|| -> RagResult<Usage> {
            let mut model = model
                .lock()
                .map_err(|_| RagError::Internal(anyhow!("model lock poisoned")))?;
            let prefill = model.prefill(&prompt)?;
            model.generate(prefill, &config, &mut |token| {
                tx.blocking_send(token_chunk(&response_id, &model_name, token))
                    .is_ok()
            })
        })();

        match result {
            Ok(usage) => {
                info!(
                    "chat.generate.done id={response_id} prompt_tokens={} completion_tokens={} stream=true",
                    usage.prompt_tokens, usage.completion_tokens
                );
                let _ = tx.blocking_send(terminal_chunk(
                    &response_id,
                    &model_name,
                    &usage,
                    &rag_payload,
                ));
            }
            Err(e) => {
                error!("chat.generate.error id={response_id} message={e}");
                let _ = tx.blocking_send(terminal_chunk(
                    &response_id,
                    &model_name,
                    &Usage::default(),
                    &rag_payload,
                ));
            }
        }
        let _ = tx.blocking_send("[DONE]".to_string());
    });

    let stream =
        ReceiverStream::new(rx).map(|data| Ok::<Event, Infallible>(Event::default().data(data)));
    Sse::new(stream).into_response()
}

// ---- Static assets ----

/// Compile-time web UI, served when no `--web` root is mounted.
pub async fn embedded_asset(uri: Uri) -> Response {
    match assets::lookup(uri.path()) {
        Some((bytes, mime)) => ([(header::CONTENT_TYPE, mime)], bytes).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": {"code": 404, "message": "not found"}})),
        )
            .into_response(),
    }
}

fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') || !c.is_ascii() {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
