use serde::Serialize;

/// One row of the `docs` table.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DocInfo {
    pub id: i64,
    pub filename: String,
    pub mime: String,
    pub added_at: i64,
    pub chunk_count: i64,
}

/// One chunk of a document, ordered by `chunk_index`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChunkRow {
    pub chunk_index: i64,
    pub source: String,
    pub text: String,
}

/// A search result: chunk reference plus cosine score.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub source: String,
    pub text: String,
    pub score: f64,
    pub doc_id: i64,
    pub chunk_index: i64,
}
