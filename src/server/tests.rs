use super::*;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::util::ServiceExt;

use crate::database::VectorStore;
use crate::model::{ChatModel, ExtractiveModel};

async fn test_state(rag_enabled: bool) -> (TempDir, Arc<AppState>) {
    let temp_dir = TempDir::new().expect("temp dir");
    let mut store = VectorStore::open(&temp_dir.path().join("rag.db"), 64)
        .await
        .expect("open store");
    store
        .add_document("fruit.txt", "text/plain", "apple facts\n\nbanana facts", 64)
        .await
        .expect("seed");

    let settings = ServerSettings {
        port: 0,
        model_name: "test-model".to_string(),
        data_dir: temp_dir.path().join("data"),
        web_root: None,
        chunk_chars: 64,
        rag_enabled,
        rag_top_k: 4,
        neighbor_chunks: 1,
        chunk_max_chars: 2000,
        export_pdf_text: false,
    };
    let model: Box<dyn ChatModel> = Box::new(ExtractiveModel::new("test-model"));
    let state = Arc::new(AppState {
        settings,
        store: tokio::sync::Mutex::new(StoreState {
            store: Some(store),
            error: None,
        }),
        model: Arc::new(std::sync::Mutex::new(model)),
    });
    (temp_dir, state)
}

fn broken_state(temp_dir: &TempDir) -> Arc<AppState> {
    let settings = ServerSettings {
        port: 0,
        model_name: "test-model".to_string(),
        data_dir: temp_dir.path().join("data"),
        web_root: None,
        chunk_chars: 64,
        rag_enabled: true,
        rag_top_k: 4,
        neighbor_chunks: 1,
        chunk_max_chars: 2000,
        export_pdf_text: false,
    };
    let model: Box<dyn ChatModel> = Box::new(ExtractiveModel::new("test-model"));
    Arc::new(AppState {
        settings,
        store: tokio::sync::Mutex::new(StoreState {
            store: None,
            error: Some("embedding dim mismatch in existing database".to_string()),
        }),
        model: Arc::new(std::sync::Mutex::new(model)),
    })
}

async fn send(state: Arc<AppState>, request: Request<Body>) -> (StatusCode, Value) {
    let response = build_router(state)
        .oneshot(request)
        .await
        .expect("router response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

#[tokio::test]
async fn info_reports_counts_and_dim() {
    let (_tmp, state) = test_state(true).await;
    let (status, body) = send(state, get("/rag/info")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], json!(true));
    assert_eq!(body["ready"], json!(true));
    assert_eq!(body["doc_count"], json!(1));
    assert_eq!(body["chunk_count"], json!(2));
    assert_eq!(body["embed_dim"], json!(64));
    assert!(body.get("error").is_none());
}

#[tokio::test]
async fn info_surfaces_open_failure() {
    let tmp = TempDir::new().expect("temp dir");
    let state = broken_state(&tmp);
    let (status, body) = send(state.clone(), get("/rag/info")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], json!(false));
    assert_eq!(body["enabled"], json!(false));
    assert!(body["error"].as_str().expect("error").contains("dim mismatch"));

    let (status, body) = send(state, get("/rag/docs")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"]["message"]
        .as_str()
        .expect("message")
        .contains("dim mismatch"));
}

#[tokio::test]
async fn docs_listing_carries_urls() {
    let (_tmp, state) = test_state(true).await;
    let (status, body) = send(state, get("/rag/docs?limit=10")).await;
    assert_eq!(status, StatusCode::OK);
    let docs = body["docs"].as_array().expect("docs");
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["filename"], json!("fruit.txt"));
    assert_eq!(docs[0]["chunk_count"], json!(2));
    let url = docs[0]["url"].as_str().expect("url");
    assert!(url.starts_with("/rag/doc/"));
}

#[tokio::test]
async fn doc_page_renders_chunk_anchors() {
    let (_tmp, state) = test_state(true).await;
    let response = build_router(state)
        .oneshot(get("/rag/doc/1"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let html = String::from_utf8(bytes.to_vec()).expect("utf8");
    assert!(html.contains("id=\"chunk-0\""));
    assert!(html.contains("id=\"chunk-1\""));
    assert!(html.contains("fruit.txt"));
}

#[tokio::test]
async fn missing_doc_is_404() {
    let (_tmp, state) = test_state(true).await;
    let (status, body) = send(state, get("/rag/doc/99")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], json!(404));
}

#[tokio::test]
async fn delete_updates_counts_then_404s() {
    let (_tmp, state) = test_state(true).await;
    let delete = Request::builder()
        .method("DELETE")
        .uri("/rag/doc/1")
        .body(Body::empty())
        .expect("request");
    let (status, body) = send(state.clone(), delete).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["doc_count"], json!(0));
    assert_eq!(body["chunk_count"], json!(0));

    let delete_again = Request::builder()
        .method("DELETE")
        .uri("/rag/doc/1")
        .body(Body::empty())
        .expect("request");
    let (status, _) = send(state, delete_again).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn tools_list_describes_rag_search() {
    let (_tmp, state) = test_state(true).await;
    let (status, body) = send(state, get("/mcp/tools/list")).await;
    assert_eq!(status, StatusCode::OK);
    let tools = body.as_array().expect("array");
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["name"], json!("rag_search"));
    assert_eq!(tools[0]["inputSchema"]["required"], json!(["query"]));
}

#[tokio::test]
async fn tools_call_rejects_unknown_tool() {
    let (_tmp, state) = test_state(true).await;
    let (status, body) = send(
        state,
        post_json("/mcp/tools/call", json!({"name": "nope", "arguments": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"]
        .as_str()
        .expect("message")
        .contains("unknown tool"));
}

#[tokio::test]
async fn tools_call_returns_hits_and_context() {
    let (_tmp, state) = test_state(true).await;
    let (status, body) = send(
        state,
        post_json(
            "/mcp/tools/call",
            json!({"name": "rag_search", "arguments": {"query": "apple", "top_k": 3}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], json!("rag_search"));
    let result = &body["result"];
    assert_eq!(result["query"], json!("apple"));
    assert_eq!(result["top_k"], json!(3));
    assert!(result["elapsed_ms"].as_i64().expect("elapsed") >= 0);
    assert!(!result["chunks"].as_array().expect("chunks").is_empty());
    assert!(result["context"]
        .as_str()
        .expect("context")
        .contains("[1] Source: fruit.txt#"));
}

#[tokio::test]
async fn chat_completion_cites_retrieved_context() {
    let (_tmp, state) = test_state(true).await;
    let (status, body) = send(
        state,
        post_json(
            "/v1/chat/completions",
            json!({"messages": [{"role": "user", "content": "tell me apple facts"}]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["object"], json!("chat.completion"));
    assert_eq!(body["choices"][0]["finish_reason"], json!("stop"));
    let content = body["choices"][0]["message"]["content"]
        .as_str()
        .expect("content");
    assert!(content.contains("[1]"));
    assert_eq!(body["rag"]["enabled"], json!(true));
    assert!(!body["rag"]["chunks"].as_array().expect("chunks").is_empty());
    assert!(body["usage"]["prompt_tokens"].as_u64().expect("usage") > 0);
}

#[tokio::test]
async fn chat_without_rag_has_no_context() {
    let (_tmp, state) = test_state(true).await;
    let (status, body) = send(
        state,
        post_json(
            "/v1/chat/completions",
            json!({
                "messages": [{"role": "user", "content": "tell me apple facts"}],
                "rag_enable": false,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rag"]["enabled"], json!(false));
    assert!(body["rag"]["chunks"].as_array().expect("chunks").is_empty());
    let content = body["choices"][0]["message"]["content"]
        .as_str()
        .expect("content");
    assert!(content.contains("do not know"));
}

#[tokio::test]
async fn client_rag_payload_passes_through() {
    let (_tmp, state) = test_state(true).await;
    let payload = json!({"enabled": true, "top_k": 2, "doc_count": 7, "chunk_count": 9,
        "chunks": [{"source": "client.txt#0", "score": 0.5, "text": "client text"}]});
    let (status, body) = send(
        state,
        post_json(
            "/v1/chat/completions",
            json!({
                "messages": [{"role": "user", "content": "hello"}],
                "rag_mode": "client",
                "rag_payload": payload,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rag"], payload);
}

#[tokio::test]
async fn chat_rejects_malformed_bodies() {
    let (_tmp, state) = test_state(true).await;

    let bad_json = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .expect("request");
    let (status, _) = send(state.clone(), bad_json).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        state.clone(),
        post_json("/v1/chat/completions", json!({"messages": []})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        state,
        post_json("/v1/chat/completions", json!({"model": "x"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn streaming_chat_ends_with_done() {
    let (_tmp, state) = test_state(true).await;
    let response = build_router(state)
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({
                "messages": [{"role": "user", "content": "tell me apple facts"}],
                "stream": true,
            }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let body = String::from_utf8(bytes.to_vec()).expect("utf8");
    assert!(body.contains("chat.completion.chunk"));
    assert!(body.contains("\"finish_reason\":\"stop\""));
    assert!(body.trim_end().ends_with("data: [DONE]"));

    // The terminal frame carries the retrieval payload
    let terminal = body
        .lines()
        .filter(|line| line.starts_with("data: "))
        .map(|line| &line[6..])
        .filter(|data| *data != "[DONE]")
        .filter_map(|data| serde_json::from_str::<Value>(data).ok())
        .find(|frame| frame["choices"][0]["finish_reason"] == json!("stop"))
        .expect("terminal frame");
    assert_eq!(terminal["rag"]["enabled"], json!(true));
    assert!(terminal["usage"]["completion_tokens"].as_u64().expect("usage") > 0);
}

#[tokio::test]
async fn embedded_ui_served_without_web_root() {
    let (_tmp, state) = test_state(true).await;
    let response = build_router(state)
        .oneshot(get("/"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    assert!(content_type.starts_with("text/html"));
}
