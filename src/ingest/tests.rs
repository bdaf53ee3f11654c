use super::*;
use crate::database::VectorStore;
use tempfile::TempDir;

async fn test_store(dir: &TempDir) -> VectorStore {
    VectorStore::open(&dir.path().join("rag.db"), 16)
        .await
        .expect("open store")
}

fn options(chunk_chars: usize) -> IngestOptions {
    IngestOptions {
        chunk_chars,
        pdf_text_dir: None,
    }
}

#[tokio::test]
async fn ingest_plain_text_file() {
    let temp_dir = TempDir::new().expect("temp dir");
    let mut store = test_store(&temp_dir).await;

    let path = temp_dir.path().join("notes.txt");
    tokio::fs::write(&path, "alpha beta").await.expect("write");

    let outcome = ingest_file(&mut store, &path, &options(64))
        .await
        .expect("ingest");
    assert_eq!(outcome.filename, "notes.txt");
    assert_eq!(outcome.mime, "text/plain");
    assert_eq!(outcome.chunk_count, 1);
    assert_eq!(store.doc_count(), 1);
}

#[tokio::test]
async fn ingest_normalizes_legacy_encoding() {
    let temp_dir = TempDir::new().expect("temp dir");
    let mut store = test_store(&temp_dir).await;

    // "中文" in GBK
    let path = temp_dir.path().join("legacy.txt");
    tokio::fs::write(&path, [0xD6, 0xD0, 0xCE, 0xC4])
        .await
        .expect("write");

    let outcome = ingest_file(&mut store, &path, &options(64))
        .await
        .expect("ingest");
    let (_, chunks) = store
        .get_document_chunks(outcome.doc_id)
        .await
        .expect("chunks");
    assert_eq!(chunks[0].text, "中文");
}

#[tokio::test]
async fn unsupported_extension_is_rejected() {
    let temp_dir = TempDir::new().expect("temp dir");
    let mut store = test_store(&temp_dir).await;

    let path = temp_dir.path().join("image.png");
    tokio::fs::write(&path, b"not text").await.expect("write");

    let err = ingest_file(&mut store, &path, &options(64))
        .await
        .expect_err("must reject");
    assert!(matches!(err, crate::RagError::InvalidRequest(_)));
}

#[tokio::test]
async fn empty_file_is_refused() {
    let temp_dir = TempDir::new().expect("temp dir");
    let mut store = test_store(&temp_dir).await;

    let path = temp_dir.path().join("empty.txt");
    tokio::fs::write(&path, "   \n ").await.expect("write");

    assert!(ingest_file(&mut store, &path, &options(64)).await.is_err());
    assert_eq!(store.doc_count(), 0);
}

#[tokio::test]
async fn seed_skips_bad_files_and_reports_them() {
    let temp_dir = TempDir::new().expect("temp dir");
    let mut store = test_store(&temp_dir).await;

    let docs = temp_dir.path().join("docs");
    tokio::fs::create_dir_all(&docs).await.expect("mkdir");
    tokio::fs::write(docs.join("good.txt"), "useful words")
        .await
        .expect("write");
    tokio::fs::write(docs.join("blank.txt"), "  ")
        .await
        .expect("write");
    tokio::fs::write(docs.join("skipped.png"), b"binary")
        .await
        .expect("write");

    let report = seed_directory(&mut store, &docs, &options(64))
        .await
        .expect("seed");
    assert_eq!(report.ingested, 1);
    assert!(report
        .trace
        .iter()
        .any(|line| line.contains("blank.txt") && line.contains("failed")));
    assert_eq!(store.doc_count(), 1);
}

#[tokio::test]
async fn seed_ignores_nested_directories() {
    let temp_dir = TempDir::new().expect("temp dir");
    let mut store = test_store(&temp_dir).await;

    let docs = temp_dir.path().join("docs");
    let nested = docs.join("nested");
    tokio::fs::create_dir_all(&nested).await.expect("mkdir");
    tokio::fs::write(docs.join("top.txt"), "top level")
        .await
        .expect("write");
    tokio::fs::write(nested.join("deep.txt"), "nested file")
        .await
        .expect("write");

    let report = seed_directory(&mut store, &docs, &options(64))
        .await
        .expect("seed");
    assert_eq!(report.ingested, 1);
}

#[tokio::test]
async fn missing_seed_directory_is_not_found() {
    let temp_dir = TempDir::new().expect("temp dir");
    let mut store = test_store(&temp_dir).await;
    let missing = temp_dir.path().join("nope");
    assert!(matches!(
        seed_directory(&mut store, &missing, &options(64)).await,
        Err(crate::RagError::NotFound(_))
    ));
}

#[test]
fn sidecar_names_resolve_collisions() {
    let temp_dir = TempDir::new().expect("temp dir");
    let dir = temp_dir.path();

    let first = next_free_sidecar_path(dir, "report");
    assert_eq!(first, dir.join("report.txt"));
    std::fs::write(&first, "x").expect("write");

    let second = next_free_sidecar_path(dir, "report");
    assert_eq!(second, dir.join("report_1.txt"));
    std::fs::write(&second, "x").expect("write");

    let third = next_free_sidecar_path(dir, "report");
    assert_eq!(third, dir.join("report_2.txt"));
}
