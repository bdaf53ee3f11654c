pub mod assets;
pub mod routes;

#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::database::VectorStore;
use crate::ingest::IngestOptions;
use crate::model::ChatModel;

/// Uploads may carry whole books; the cap protects the ingest path.
const MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub port: u16,
    pub model_name: String,
    pub data_dir: PathBuf,
    pub web_root: Option<PathBuf>,
    pub chunk_chars: usize,
    pub rag_enabled: bool,
    pub rag_top_k: usize,
    pub neighbor_chunks: i64,
    pub chunk_max_chars: usize,
    pub export_pdf_text: bool,
}

impl ServerSettings {
    #[inline]
    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    #[inline]
    pub fn pdf_text_dir(&self) -> Option<PathBuf> {
        self.export_pdf_text
            .then(|| self.data_dir.join("pdf_txt"))
    }

    #[inline]
    pub fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            chunk_chars: self.chunk_chars,
            pdf_text_dir: self.pdf_text_dir(),
        }
    }
}

/// The store plus its open-time failure. A failed open leaves the server
/// running; store-backed routes answer 500 and `/rag/info` carries the error.
pub struct StoreState {
    pub store: Option<VectorStore>,
    pub error: Option<String>,
}

/// Shared per-request state.
///
/// The store lock covers every store operation, reads included, so each
/// request sees a linearizable view and the cached counts stay consistent
/// with what it just read. The model has its own lock, taken only after the
/// store lock is released; one generation runs at a time.
pub struct AppState {
    pub settings: ServerSettings,
    pub store: tokio::sync::Mutex<StoreState>,
    pub model: Arc<std::sync::Mutex<Box<dyn ChatModel>>>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let router = Router::new()
        .route("/rag/info", get(routes::rag_info))
        .route("/rag/docs", get(routes::rag_docs))
        .route(
            "/rag/doc/{id}",
            get(routes::rag_doc_page).delete(routes::rag_doc_delete),
        )
        .route("/rag/upload", post(routes::rag_upload))
        .route("/mcp/tools/list", get(routes::mcp_tools_list))
        .route("/mcp/tools/call", post(routes::mcp_tools_call))
        .route("/v1/chat/completions", post(routes::chat_completions));

    let router = match &state.settings.web_root {
        Some(root) => router.fallback_service(ServeDir::new(root)),
        None => router.fallback(get(routes::embedded_asset)),
    };

    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let port = state.settings.port;
    let state = Arc::new(state);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("http.listen addr=0.0.0.0:{port}");
    axum::serve(listener, app).await?;
    Ok(())
}
