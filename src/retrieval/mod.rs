
use tracing::debug;

use crate::database::{SearchHit, VectorStore};
use crate::text::shorten_text;
use crate::Result;

/// A hit expanded to a contiguous chunk range of one document.
#[derive(Debug, Clone)]
struct ExpandedRange {
    doc_id: i64,
    start: i64,
    end: i64,
    best: SearchHit,
}

/// Query the store and expand each hit with its neighboring chunks.
///
/// Neighbor ranges of nearby hits in the same document are merged before the
/// text is read, so overlapping context is never emitted twice. The merged
/// hit keeps the source, index, and score of its best constituent. The result
/// may hold fewer than `top_k` hits; no refilling happens after the merge.
pub async fn retrieve(
    store: &VectorStore,
    query: &str,
    top_k: usize,
    neighbor_chunks: i64,
    chunk_max_chars: usize,
) -> Result<Vec<SearchHit>> {
    if query.is_empty() {
        return Ok(Vec::new());
    }

    let query_vec = store.embedder().embed(query);
    let hits = store.search(&query_vec, top_k).await?;
    if neighbor_chunks <= 0 || hits.is_empty() {
        return Ok(hits);
    }

    let mut ranges: Vec<ExpandedRange> = hits
        .into_iter()
        .map(|hit| ExpandedRange {
            doc_id: hit.doc_id,
            start: (hit.chunk_index - neighbor_chunks).max(0),
            end: hit.chunk_index + neighbor_chunks,
            best: hit,
        })
        .collect();
    ranges.sort_by_key(|r| (r.doc_id, r.start, r.end));

    let mut merged: Vec<ExpandedRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if last.doc_id == range.doc_id && range.start <= last.end + 1 => {
                last.end = last.end.max(range.end);
                if range.best.score > last.best.score {
                    last.best = range.best;
                }
            }
            _ => merged.push(range),
        }
    }

    let mut expanded = Vec::with_capacity(merged.len());
    for range in merged {
        let mut text = store
            .expand_range(range.doc_id, range.start, range.end, range.best.chunk_index)
            .await?;
        if chunk_max_chars > 0 {
            text = shorten_text(&text, chunk_max_chars);
        }
        let mut hit = range.best;
        hit.text = text;
        expanded.push(hit);
    }
    expanded.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    debug!(
        "rag.retrieve query_len={} top_k={top_k} hits={}",
        query.len(),
        expanded.len()
    );
    Ok(expanded)
}
