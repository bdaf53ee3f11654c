use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use ragserve::database::VectorStore;
use ragserve::ingest::{seed_directory, IngestOptions};
use ragserve::model::{ChatModel, ExtractiveModel};
use ragserve::server::{self, AppState, ServerSettings, StoreState};

#[derive(Parser)]
#[command(name = "ragserve")]
#[command(about = "Retrieval-augmented chat server over a local document index")]
#[command(version)]
struct Cli {
    /// Model directory; its name is reported in chat responses
    #[arg(long, default_value = "assets/qwen3_0.6b")]
    model: PathBuf,

    /// Directory of .txt/.pdf files ingested into an empty store at startup
    #[arg(long)]
    seed_docs: Option<PathBuf>,

    /// SQLite database path (default: <data-dir>/rag.db)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Directory for uploads and PDF sidecar text
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// External web root; the embedded UI serves when omitted
    #[arg(long)]
    web: Option<PathBuf>,

    /// HTTP port
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Chunk byte budget
    #[arg(long, default_value_t = 512)]
    chunk_chars: usize,

    /// Embedding dimension; fixed once the database exists
    #[arg(long, default_value_t = 256)]
    embed_dim: usize,

    /// Retrieved chunks per query
    #[arg(long, default_value_t = 4)]
    rag_top_k: usize,

    /// Neighbor chunks expanded around each hit
    #[arg(long, default_value_t = 1)]
    neighbor_chunks: i64,

    /// Byte cap for each expanded context chunk
    #[arg(long, default_value_t = 2000)]
    chunk_max_chars: usize,

    /// Disable retrieval
    #[arg(long)]
    no_rag: bool,

    /// Keep PDF-extracted plaintext as sidecar files
    #[arg(long)]
    export_pdf_text: bool,

    /// Request GPU compute from the model runtime
    #[arg(long)]
    gpu: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    std::fs::create_dir_all(&cli.data_dir)?;
    let db_path = cli
        .db
        .clone()
        .unwrap_or_else(|| cli.data_dir.join("rag.db"));

    let (mut store, store_error) = match VectorStore::open(&db_path, cli.embed_dim).await {
        Ok(store) => {
            info!(
                "rag.store.open path={} docs={} chunks={} embed_dim={}",
                db_path.display(),
                store.doc_count(),
                store.chunk_count(),
                store.embed_dim()
            );
            (Some(store), None)
        }
        Err(e) => {
            warn!(
                "rag.store.open failed path={} error={e}",
                db_path.display()
            );
            (None, Some(e.to_string()))
        }
    };

    if let (Some(store), Some(seed)) = (store.as_mut(), cli.seed_docs.as_ref()) {
        if store.doc_count() > 0 {
            info!(
                "rag.seed skipped, store already holds {} documents",
                store.doc_count()
            );
        } else {
            let options = IngestOptions {
                chunk_chars: cli.chunk_chars,
                pdf_text_dir: cli.export_pdf_text.then(|| cli.data_dir.join("pdf_txt")),
            };
            match seed_directory(store, seed, &options).await {
                Ok(report) => {
                    for line in &report.trace {
                        info!("rag.seed {line}");
                    }
                    info!(
                        "rag.seed.done ingested={} docs={} chunks={}",
                        report.ingested,
                        store.doc_count(),
                        store.chunk_count()
                    );
                }
                Err(e) => warn!("rag.seed failed error={e}"),
            }
        }
    }

    let model_name = cli
        .model
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("qwen3-0.6b")
        .to_string();
    if cli.gpu {
        info!("model.gpu requested; built-in model runs on CPU");
    }
    let model: Box<dyn ChatModel> = Box::new(ExtractiveModel::new(model_name.clone()));

    let settings = ServerSettings {
        port: cli.port,
        model_name,
        data_dir: cli.data_dir.clone(),
        web_root: cli.web.clone(),
        chunk_chars: cli.chunk_chars,
        rag_enabled: !cli.no_rag,
        rag_top_k: cli.rag_top_k,
        neighbor_chunks: cli.neighbor_chunks,
        chunk_max_chars: cli.chunk_max_chars,
        export_pdf_text: cli.export_pdf_text,
    };

    let state = AppState {
        settings,
        store: tokio::sync::Mutex::new(StoreState {
            store,
            error: store_error,
        }),
        model: Arc::new(std::sync::Mutex::new(model)),
    };

    server::serve(state).await
}
