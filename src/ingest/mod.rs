#[cfg(test)]
mod tests;

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, warn};

use crate::database::VectorStore;
use crate::text::normalize_utf8;
use crate::{RagError, Result};

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub chunk_chars: usize,
    /// Sidecar directory for PDF-extracted plaintext; `None` disables export.
    pub pdf_text_dir: Option<PathBuf>,
}

#[derive(Debug)]
pub struct IngestOutcome {
    pub doc_id: i64,
    pub chunk_count: usize,
    pub filename: String,
    pub mime: String,
    pub trace: Vec<String>,
}

#[derive(Debug, Default)]
pub struct SeedReport {
    pub ingested: usize,
    pub trace: Vec<String>,
}

/// Read one `.txt` or `.pdf` file, normalize it to UTF-8, and commit it to
/// the store as a new document named after the file.
pub async fn ingest_file(
    store: &mut VectorStore,
    path: &Path,
    options: &IngestOptions,
) -> Result<IngestOutcome> {
    let mut trace = Vec::new();
    let display_name = display_filename(path, &mut trace);
    ingest_file_named(store, path, display_name, trace, options).await
}

/// Same as [`ingest_file`], but records the document under a caller-chosen
/// display name (uploads keep their original filename while the bytes live
/// under a collision-free stored name).
pub async fn ingest_file_as(
    store: &mut VectorStore,
    path: &Path,
    display_name: &str,
    options: &IngestOptions,
) -> Result<IngestOutcome> {
    ingest_file_named(store, path, display_name.to_string(), Vec::new(), options).await
}

async fn ingest_file_named(
    store: &mut VectorStore,
    path: &Path,
    display_name: String,
    mut trace: Vec<String>,
    options: &IngestOptions,
) -> Result<IngestOutcome> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let (raw, mime) = match extension.as_str() {
        "txt" => (tokio::fs::read(path).await?, "text/plain"),
        "pdf" => (extract_pdf_text(path).await?, "application/pdf"),
        other => {
            return Err(RagError::InvalidRequest(format!(
                "unsupported file extension: .{other} (expected .txt or .pdf)"
            )));
        }
    };

    let text = normalize_utf8(&raw)?;
    let text = text.trim();
    if text.is_empty() {
        return Err(RagError::InvalidRequest(format!(
            "no extractable text in {}",
            path.display()
        )));
    }

    if mime == "application/pdf" {
        if let Some(dir) = &options.pdf_text_dir {
            match export_sidecar(dir, path, text).await {
                Ok(sidecar) => trace.push(format!("exported plaintext to {}", sidecar.display())),
                Err(e) => {
                    warn!("rag.ingest.sidecar failed path={} error={e}", path.display());
                    trace.push(format!("plaintext export failed: {e}"));
                }
            }
        }
    }

    let (doc_id, chunk_count) = store
        .add_document(&display_name, mime, text, options.chunk_chars)
        .await?;

    debug!("rag.ingest.done doc_id={doc_id} chunks={chunk_count} filename={display_name}");
    Ok(IngestOutcome {
        doc_id,
        chunk_count,
        filename: display_name,
        mime: mime.to_string(),
        trace,
    })
}

/// Ingest every `.txt`/`.pdf` file directly inside `dir`. Individual file
/// failures go into the trace; they never abort the batch.
pub async fn seed_directory(
    store: &mut VectorStore,
    dir: &Path,
    options: &IngestOptions,
) -> Result<SeedReport> {
    if !dir.is_dir() {
        return Err(RagError::NotFound(format!(
            "docs directory not found: {}",
            dir.display()
        )));
    }

    let mut report = SeedReport::default();
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if ext == "txt" || ext == "pdf" {
            paths.push(path);
        }
    }
    paths.sort();

    for path in paths {
        match ingest_file(store, &path, options).await {
            Ok(outcome) => {
                report.ingested += 1;
                report.trace.extend(outcome.trace);
                report.trace.push(format!(
                    "ingested {} ({} chunks)",
                    outcome.filename, outcome.chunk_count
                ));
            }
            Err(e) => {
                report
                    .trace
                    .push(format!("failed to ingest {}: {e}", path.display()));
            }
        }
    }
    Ok(report)
}

/// Run `pdftotext` with an argv list; the filename never passes through a
/// shell.
async fn extract_pdf_text(path: &Path) -> Result<Vec<u8>> {
    let output = Command::new("pdftotext")
        .arg("-layout")
        .arg("-q")
        .arg("-enc")
        .arg("UTF-8")
        .arg(path)
        .arg("-")
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RagError::ExternalTool(
                    "pdftotext not found; please install poppler-utils".to_string(),
                )
            } else {
                RagError::ExternalTool(format!("failed to run pdftotext: {e}"))
            }
        })?;

    if !output.status.success() {
        return Err(RagError::ExternalTool(format!(
            "pdftotext failed with status {} for {}",
            output.status,
            path.display()
        )));
    }
    Ok(output.stdout)
}

async fn export_sidecar(dir: &Path, source: &Path, text: &str) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    let target = next_free_sidecar_path(dir, &stem);
    tokio::fs::write(&target, text).await?;
    Ok(target)
}

/// `<stem>.txt`, then `<stem>_1.txt`, `<stem>_2.txt`, ... on collision.
fn next_free_sidecar_path(dir: &Path, stem: &str) -> PathBuf {
    let mut candidate = dir.join(format!("{stem}.txt"));
    let mut counter = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{stem}_{counter}.txt"));
        counter += 1;
    }
    candidate
}

/// Display filename in valid UTF-8, falling back to the lossy raw value with
/// a trace warning when the OS name cannot be normalized.
fn display_filename(path: &Path, trace: &mut Vec<String>) -> String {
    let Some(name) = path.file_name() else {
        return "document.txt".to_string();
    };
    if let Some(utf8) = name.to_str() {
        return utf8.to_string();
    }
    if let Ok(normalized) = normalize_utf8(name.as_encoded_bytes()) {
        return normalized;
    }
    let lossy = name.to_string_lossy().to_string();
    trace.push(format!("filename is not valid UTF-8; stored as {lossy}"));
    lossy
}
