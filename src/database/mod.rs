pub mod models;


pub use models::*;

use std::cmp::Ordering;
use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use tracing::debug;

use crate::embeddings::chunking::split_text_chunks;
use crate::embeddings::{HashedEmbedder, DEFAULT_EMBED_DIM};
use crate::text::shorten_text;
use crate::{RagError, Result};

const HIT_TEXT_MAX_BYTES: usize = 520;

const SCHEMA: [&str; 5] = [
    "CREATE TABLE IF NOT EXISTS meta(key TEXT PRIMARY KEY, value TEXT)",
    "CREATE TABLE IF NOT EXISTS docs(
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        filename TEXT,
        mime TEXT,
        added_at INTEGER,
        chunk_count INTEGER)",
    "CREATE TABLE IF NOT EXISTS chunks(
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        doc_id INTEGER,
        chunk_index INTEGER,
        source TEXT,
        text TEXT)",
    "CREATE TABLE IF NOT EXISTS vectors(
        chunk_id INTEGER PRIMARY KEY,
        dim INTEGER,
        vec BLOB)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_doc ON chunks(doc_id)",
];

/// Durable store of documents, chunks, and embeddings over a single SQLite
/// file. All mutations run inside one transaction; the cached counts change
/// only after a commit.
#[derive(Debug)]
pub struct VectorStore {
    pool: Pool<Sqlite>,
    embedder: HashedEmbedder,
    embed_dim: usize,
    doc_count: i64,
    chunk_count: i64,
}

impl VectorStore {
    /// Open or create the store. Refuses to open a database whose stored
    /// `embed_dim` differs from the requested one.
    pub async fn open(path: &Path, embed_dim: usize) -> Result<Self> {
        let embed_dim = if embed_dim == 0 {
            DEFAULT_EMBED_DIM
        } else {
            embed_dim
        };

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(storage("failed to open database"))?;

        let mut store = Self {
            pool,
            embedder: HashedEmbedder::new(embed_dim),
            embed_dim,
            doc_count: 0,
            chunk_count: 0,
        };
        store.ensure_schema().await?;
        store.load_counts().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(storage("failed to create schema"))?;
        }

        let stored: Option<String> =
            sqlx::query_scalar("SELECT value FROM meta WHERE key = 'embed_dim'")
                .fetch_optional(&self.pool)
                .await
                .map_err(storage("failed to read embed_dim"))?;

        match stored {
            Some(value) => {
                let stored_dim: usize = value.parse().unwrap_or(0);
                if stored_dim > 0 && stored_dim != self.embed_dim {
                    return Err(RagError::Storage(format!(
                        "embedding dim mismatch in existing database: stored {stored_dim}, requested {}",
                        self.embed_dim
                    )));
                }
            }
            None => {
                sqlx::query("INSERT OR REPLACE INTO meta(key, value) VALUES('embed_dim', ?)")
                    .bind(self.embed_dim.to_string())
                    .execute(&self.pool)
                    .await
                    .map_err(storage("failed to store embed_dim"))?;
            }
        }
        Ok(())
    }

    async fn load_counts(&mut self) -> Result<()> {
        self.doc_count = sqlx::query_scalar("SELECT COUNT(*) FROM docs")
            .fetch_one(&self.pool)
            .await
            .map_err(storage("failed to count documents"))?;
        self.chunk_count = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await
            .map_err(storage("failed to count chunks"))?;
        Ok(())
    }

    /// Chunk, embed, and insert a document in one transaction.
    /// Returns the new document id and its chunk count.
    pub async fn add_document(
        &mut self,
        filename: &str,
        mime: &str,
        text: &str,
        chunk_chars: usize,
    ) -> Result<(i64, usize)> {
        let chunks = split_text_chunks(text, chunk_chars);
        if chunks.is_empty() {
            return Err(RagError::InvalidRequest(
                "no text chunks generated".to_string(),
            ));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(storage("failed to begin transaction"))?;

        let added_at = chrono::Utc::now().timestamp();
        let doc_id =
            sqlx::query("INSERT INTO docs(filename, mime, added_at, chunk_count) VALUES(?, ?, ?, ?)")
                .bind(filename)
                .bind(mime)
                .bind(added_at)
                .bind(chunks.len() as i64)
                .execute(&mut *tx)
                .await
                .map_err(storage("failed to insert document"))?
                .last_insert_rowid();

        for (index, chunk) in chunks.iter().enumerate() {
            let source = format!("{filename}#{index}");
            let chunk_id =
                sqlx::query("INSERT INTO chunks(doc_id, chunk_index, source, text) VALUES(?, ?, ?, ?)")
                    .bind(doc_id)
                    .bind(index as i64)
                    .bind(&source)
                    .bind(chunk)
                    .execute(&mut *tx)
                    .await
                    .map_err(storage("failed to insert chunk"))?
                    .last_insert_rowid();

            let vector = self.embedder.embed(chunk);
            sqlx::query("INSERT INTO vectors(chunk_id, dim, vec) VALUES(?, ?, ?)")
                .bind(chunk_id)
                .bind(self.embed_dim as i64)
                .bind(vector_to_blob(&vector))
                .execute(&mut *tx)
                .await
                .map_err(storage("failed to insert vector"))?;
        }

        tx.commit()
            .await
            .map_err(storage("failed to commit document"))?;

        self.doc_count += 1;
        self.chunk_count += chunks.len() as i64;
        debug!(
            "rag.store.add doc_id={doc_id} chunks={} filename={filename}",
            chunks.len()
        );
        Ok((doc_id, chunks.len()))
    }

    /// Remove a document with its chunks and vectors, atomically.
    pub async fn delete_doc(&mut self, doc_id: i64) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(storage("failed to begin transaction"))?;

        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM docs WHERE id = ?")
            .bind(doc_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage("failed to look up document"))?;
        if exists.is_none() {
            return Err(RagError::NotFound(format!("document {doc_id} not found")));
        }

        sqlx::query("DELETE FROM vectors WHERE chunk_id IN (SELECT id FROM chunks WHERE doc_id = ?)")
            .bind(doc_id)
            .execute(&mut *tx)
            .await
            .map_err(storage("failed to delete vectors"))?;
        sqlx::query("DELETE FROM chunks WHERE doc_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await
            .map_err(storage("failed to delete chunks"))?;
        sqlx::query("DELETE FROM docs WHERE id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await
            .map_err(storage("failed to delete document"))?;

        let doc_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM docs")
            .fetch_one(&mut *tx)
            .await
            .map_err(storage("failed to count documents"))?;
        let chunk_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&mut *tx)
            .await
            .map_err(storage("failed to count chunks"))?;

        tx.commit()
            .await
            .map_err(storage("failed to commit delete"))?;

        self.doc_count = doc_count;
        self.chunk_count = chunk_count;
        debug!("rag.store.delete doc_id={doc_id}");
        Ok(())
    }

    /// Linear cosine scan over every stored vector. Both sides are
    /// L2-normalized, so the dot product is the cosine similarity. Scores
    /// at or below zero are dropped; ties keep insertion order.
    pub async fn search(&self, query_vec: &[f32], top_k: usize) -> Result<Vec<SearchHit>> {
        let mut hits = Vec::new();
        if query_vec.is_empty() || top_k == 0 {
            return Ok(hits);
        }

        let rows = sqlx::query(
            "SELECT chunks.source, chunks.text, vectors.vec, vectors.dim, chunks.doc_id, chunks.chunk_index
             FROM vectors JOIN chunks ON vectors.chunk_id = chunks.id
             ORDER BY chunks.id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage("failed to scan vectors"))?;

        for row in rows {
            let dim: i64 = row.get("dim");
            let blob: Vec<u8> = row.get("vec");
            let Some(vector) = blob_to_vector(&blob, dim as usize) else {
                continue;
            };
            if vector.len() != query_vec.len() {
                continue;
            }
            let score = dot(query_vec, &vector);
            if score <= 0.0 {
                continue;
            }
            hits.push(SearchHit {
                source: row.get("source"),
                text: row.get("text"),
                score,
                doc_id: row.get("doc_id"),
                chunk_index: row.get("chunk_index"),
            });
        }

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        hits.truncate(top_k);
        for hit in &mut hits {
            hit.text = shorten_text(&hit.text, HIT_TEXT_MAX_BYTES);
        }
        Ok(hits)
    }

    /// Concatenate the chunks of `doc_id` with indices in `[start, end]`,
    /// labelling the `center` chunk as the match and the rest as neighbors.
    /// Returns an empty string when the range holds no rows.
    pub async fn expand_range(
        &self,
        doc_id: i64,
        start: i64,
        end: i64,
        center: i64,
    ) -> Result<String> {
        let start = start.max(0);
        if end < start || center < 0 {
            return Ok(String::new());
        }

        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT chunk_index, text FROM chunks
             WHERE doc_id = ? AND chunk_index BETWEEN ? AND ?
             ORDER BY chunk_index ASC",
        )
        .bind(doc_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(storage("failed to read chunk range"))?;

        let mut out = String::new();
        for (index, text) in rows {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            if index == center {
                out.push_str(&format!("(matched chunk {index})\n"));
            } else {
                out.push_str(&format!("(neighbor chunk {index})\n"));
            }
            out.push_str(&text);
        }
        Ok(out)
    }

    /// Expand a single hit to the `[center - n, center + n]` range.
    pub async fn expand_neighbors(&self, doc_id: i64, center: i64, neighbors: i64) -> Result<String> {
        if neighbors <= 0 || center < 0 {
            return Ok(String::new());
        }
        self.expand_range(doc_id, center - neighbors, center + neighbors, center)
            .await
    }

    /// Filename plus all chunks of a document, ordered by index.
    pub async fn get_document_chunks(&self, doc_id: i64) -> Result<(String, Vec<ChunkRow>)> {
        let filename: Option<String> = sqlx::query_scalar("SELECT filename FROM docs WHERE id = ?")
            .bind(doc_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage("failed to look up document"))?;
        let Some(filename) = filename else {
            return Err(RagError::NotFound(format!("document {doc_id} not found")));
        };

        let chunks: Vec<ChunkRow> = sqlx::query_as(
            "SELECT chunk_index, source, text FROM chunks
             WHERE doc_id = ? ORDER BY chunk_index ASC",
        )
        .bind(doc_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage("failed to read document chunks"))?;

        Ok((filename, chunks))
    }

    /// Newest documents first.
    pub async fn list_docs(&self, limit: i64, offset: i64) -> Result<Vec<DocInfo>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        sqlx::query_as(
            "SELECT id, filename, mime, added_at, chunk_count FROM docs
             ORDER BY id DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(storage("failed to list documents"))
    }

    #[inline]
    pub fn doc_count(&self) -> i64 {
        self.doc_count
    }

    #[inline]
    pub fn chunk_count(&self) -> i64 {
        self.chunk_count
    }

    #[inline]
    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    #[inline]
    pub fn embedder(&self) -> &HashedEmbedder {
        &self.embedder
    }
}

fn storage(context: &'static str) -> impl FnOnce(sqlx::Error) -> RagError {
    move |e| RagError::Storage(format!("{context}: {e}"))
}

fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for &value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

fn blob_to_vector(blob: &[u8], dim: usize) -> Option<Vec<f32>> {
    if dim == 0 || blob.len() != dim * 4 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| f64::from(x) * f64::from(y))
        .sum()
}
