//! C11 — Hybrid Search Engine: parallel C3+C4 retrieval, min-max
//! normalization, weighted fusion, rerank via C6, and postrank (spec.md
//! §4.10). The one component that touches every other component in the
//! data-flow diagram (spec.md §2).

use crate::embed::{Embedder, Reranker};
use crate::query::parse_query;
use crate::sparse::{SearchFilter, SparseSegment};
use crate::types::SearchResult;
use crate::vector::{l2_normalize, VectorFilter, VectorStore};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SearchFilterOpts {
    pub path_prefix: Option<String>,
    pub languages: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub top_k: usize,
    pub enable_reranking: bool,
    pub rerank_candidates: usize,
    pub sparse_weight: f32,
    pub dense_weight: f32,
    pub enable_dedup: bool,
    pub dedup_threshold: f32,
    pub enable_diversity: bool,
    pub diversity_lambda: f32,
    pub group_by_file: bool,
    pub max_chunks_per_file: usize,
    pub include_content: bool,
    pub filter: SearchFilterOpts,
    pub prefetch_multiplier: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: 20,
            enable_reranking: true,
            rerank_candidates: 50,
            sparse_weight: 0.5,
            dense_weight: 0.5,
            enable_dedup: true,
            dedup_threshold: 0.85,
            enable_diversity: true,
            diversity_lambda: 0.7,
            group_by_file: false,
            max_chunks_per_file: 3,
            include_content: true,
            filter: SearchFilterOpts { path_prefix: None, languages: None },
            prefetch_multiplier: 3,
        }
    }
}

struct Candidate {
    doc_id: String,
    path: String,
    language: String,
    start_line: usize,
    end_line: usize,
    content: String,
    symbols: Vec<String>,
    sparse_raw: Option<f32>,
    dense_raw: Option<f32>,
    vector: Option<Vec<f32>>,
}

fn min_max_normalize(scores: &HashMap<String, f32>) -> HashMap<String, f32> {
    if scores.is_empty() {
        return HashMap::new();
    }
    let min = scores.values().cloned().fold(f32::INFINITY, f32::min);
    let max = scores.values().cloned().fold(f32::NEG_INFINITY, f32::max);
    let span = max - min;
    scores
        .iter()
        .map(|(k, v)| {
            let normalized = if span > f32::EPSILON { (v - min) / span } else { 1.0 };
            (k.clone(), normalized)
        })
        .collect()
}

/// `Search(store, query, opts) -> []SearchResult` (spec.md §4.10).
#[allow(clippy::too_many_arguments)]
pub async fn search(
    sparse: &Arc<SparseSegment>,
    vector: &Arc<dyn VectorStore>,
    embedder: &Arc<dyn Embedder>,
    reranker: &Arc<dyn Reranker>,
    query: &str,
    opts: &SearchOptions,
) -> crate::error::CoreResult<Vec<SearchResult>> {
    let parsed = parse_query(query);
    let prefetch = opts.prefetch_multiplier * opts.top_k.max(opts.rerank_candidates);

    let sparse_filter = SearchFilter { path_prefix: opts.filter.path_prefix.clone(), languages: opts.filter.languages.clone() };
    let dense_filter = VectorFilter { path_prefix: opts.filter.path_prefix.clone(), languages: opts.filter.languages.clone() };

    let sparse_fut = {
        let sparse = sparse.clone();
        let query_text = parsed.search_query.clone();
        tokio::task::spawn_blocking(move || sparse.query(&query_text, &sparse_filter, prefetch))
    };
    let dense_fut = async {
        let mut query_vec = embedder.embed(&[parsed.search_query.clone()]).await?.into_iter().next().unwrap_or_default();
        l2_normalize(&mut query_vec);
        vector.search(&query_vec, prefetch, &dense_filter).await
    };

    let (sparse_hits, dense_hits) = tokio::join!(sparse_fut, dense_fut);
    let sparse_hits = sparse_hits.map_err(|e| crate::error::CoreError::Internal(e.to_string()))??;
    let dense_hits = dense_hits?;

    // Preserve original sparse rank for the stable tie-break (spec.md
    // §4.10, "stable by original sparse rank, then doc_id lexicographic").
    let sparse_rank: HashMap<String, usize> = sparse_hits.iter().enumerate().map(|(i, h)| (h.doc_id.clone(), i)).collect();

    let sparse_raw: HashMap<String, f32> = sparse_hits.iter().map(|h| (h.doc_id.clone(), h.score)).collect();
    let dense_raw: HashMap<String, f32> = dense_hits.iter().map(|h| (h.doc_id.clone(), h.score)).collect();
    let sparse_norm = min_max_normalize(&sparse_raw);
    let dense_norm = min_max_normalize(&dense_raw);

    let mut doc_ids: Vec<String> = sparse_raw.keys().chain(dense_raw.keys()).cloned().collect();
    doc_ids.sort();
    doc_ids.dedup();

    let mut fused: Vec<(String, f32)> = doc_ids
        .into_iter()
        .map(|id| {
            let n_sparse = sparse_norm.get(&id).copied().unwrap_or(0.0);
            let n_dense = dense_norm.get(&id).copied().unwrap_or(0.0);
            let score = opts.sparse_weight * n_sparse + opts.dense_weight * n_dense;
            (id, score)
        })
        .collect();

    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| sparse_rank.get(&a.0).copied().unwrap_or(usize::MAX).cmp(&sparse_rank.get(&b.0).copied().unwrap_or(usize::MAX)))
            .then_with(|| a.0.cmp(&b.0))
    });
    fused.truncate(opts.rerank_candidates);

    let mut candidates: Vec<Candidate> = Vec::with_capacity(fused.len());
    for (doc_id, _) in &fused {
        let hydrated = sparse.get(doc_id)?;
        let (path, language, start_line, end_line, content, symbols) = match hydrated {
            Some(doc) => (doc.path, doc.language, doc.start_line, doc.end_line, doc.content, doc.symbols),
            None => continue,
        };
        let dense_vec = vector.get_vector(doc_id).await?;
        candidates.push(Candidate {
            doc_id: doc_id.clone(),
            path,
            language,
            start_line,
            end_line,
            content,
            symbols,
            sparse_raw: sparse_raw.get(doc_id).copied(),
            dense_raw: dense_raw.get(doc_id).copied(),
            vector: dense_vec,
        });
    }

    let fused_score_by_id: HashMap<String, f32> = fused.into_iter().collect();
    let mut vectors: HashMap<String, Vec<f32>> = HashMap::new();
    for c in &candidates {
        if let Some(v) = &c.vector {
            vectors.insert(c.doc_id.clone(), v.clone());
        }
    }

    let mut results: Vec<SearchResult> = candidates
        .into_iter()
        .map(|c| {
            let fused_score = fused_score_by_id.get(&c.doc_id).copied().unwrap_or(0.0);
            SearchResult {
                doc_id: c.doc_id,
                path: c.path,
                language: c.language,
                start_line: c.start_line,
                end_line: c.end_line,
                content: Some(c.content),
                symbols: c.symbols,
                sparse_score: c.sparse_raw,
                dense_score: c.dense_raw,
                fused_score,
                rerank_score: None,
                representative: true,
            }
        })
        .collect();

    if opts.enable_reranking && results.len() >= 2 {
        let texts: Vec<String> = results.iter().map(|r| r.content.clone().unwrap_or_default()).collect();
        let rerank_hits = reranker.rerank(query, &texts, opts.top_k.max(results.len())).await?;
        if !rerank_hits.is_empty() {
            let mut reranked = Vec::with_capacity(rerank_hits.len());
            for hit in &rerank_hits {
                if let Some(r) = results.get(hit.index) {
                    let mut r = r.clone();
                    r.rerank_score = Some(hit.score);
                    reranked.push(r);
                }
            }
            results = reranked;
        }
    }

    let mut results = postrank(results, &vectors, opts);

    if !opts.include_content {
        for r in &mut results {
            r.content = None;
        }
    }

    Ok(results)
}

/// Postrank stages: dedup, MMR diversify, group-by-file, truncate (spec.md
/// §4.10 step 7-8). Operates purely on already-fused/reranked results plus
/// the per-doc vectors fetched alongside them.
pub fn postrank(
    mut results: Vec<SearchResult>,
    vectors: &HashMap<String, Vec<f32>>,
    opts: &SearchOptions,
) -> Vec<SearchResult> {
    if opts.enable_dedup {
        results = dedup(results, vectors, opts.dedup_threshold);
    }
    if opts.enable_diversity {
        results = diversify(results, vectors, opts.diversity_lambda);
    }
    if opts.group_by_file {
        group_by_file(&mut results, opts.max_chunks_per_file);
        results.retain(|r| r.representative);
    }
    results.truncate(opts.top_k);
    results
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn dedup(results: Vec<SearchResult>, vectors: &HashMap<String, Vec<f32>>, threshold: f32) -> Vec<SearchResult> {
    let mut kept: Vec<SearchResult> = Vec::with_capacity(results.len());
    for r in results {
        let is_dup = match vectors.get(&r.doc_id) {
            Some(v) => kept.iter().any(|k| match vectors.get(&k.doc_id) {
                Some(kv) => cosine(v, kv) > threshold,
                None => false,
            }),
            None => false,
        };
        if !is_dup {
            kept.push(r);
        }
    }
    kept
}

fn relevance(r: &SearchResult) -> f32 {
    r.rerank_score.unwrap_or(r.fused_score)
}

fn diversify(results: Vec<SearchResult>, vectors: &HashMap<String, Vec<f32>>, lambda: f32) -> Vec<SearchResult> {
    if results.len() <= 1 {
        return results;
    }
    let mut remaining = results;
    let mut kept: Vec<SearchResult> = Vec::with_capacity(remaining.len());
    kept.push(remaining.remove(0));

    while !remaining.is_empty() {
        let mut best_idx = 0;
        let mut best_score = f32::NEG_INFINITY;
        for (i, candidate) in remaining.iter().enumerate() {
            let max_sim = match vectors.get(&candidate.doc_id) {
                Some(cv) => kept
                    .iter()
                    .filter_map(|k| vectors.get(&k.doc_id).map(|kv| cosine(cv, kv)))
                    .fold(0.0_f32, f32::max),
                None => 0.0,
            };
            let mmr_score = lambda * relevance(candidate) - (1.0 - lambda) * max_sim;
            if mmr_score > best_score {
                best_score = mmr_score;
                best_idx = i;
            }
        }
        kept.push(remaining.remove(best_idx));
    }
    kept
}

fn group_by_file(results: &mut [SearchResult], max_chunks_per_file: usize) {
    let mut per_path: HashMap<String, usize> = HashMap::new();
    for r in results.iter_mut() {
        let count = per_path.entry(r.path.clone()).or_insert(0);
        *count += 1;
        r.representative = *count <= max_chunks_per_file;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(doc_id: &str, path: &str, fused_score: f32) -> SearchResult {
        SearchResult {
            doc_id: doc_id.to_string(),
            path: path.to_string(),
            language: "rust".to_string(),
            start_line: 1,
            end_line: 2,
            content: Some("x".to_string()),
            symbols: vec![],
            sparse_score: Some(fused_score),
            dense_score: Some(fused_score),
            fused_score,
            rerank_score: None,
            representative: true,
        }
    }

    #[test]
    fn dedup_drops_near_identical_vectors() {
        let results = vec![result("a", "a.rs", 0.9), result("b", "b.rs", 0.8)];
        let mut vectors = HashMap::new();
        vectors.insert("a".to_string(), vec![1.0, 0.0]);
        vectors.insert("b".to_string(), vec![0.99, 0.14]);
        let deduped = dedup(results, &vectors, 0.85);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].doc_id, "a");
    }

    #[test]
    fn group_by_file_marks_overflow_non_representative() {
        let mut results = vec![result("a", "f.rs", 0.9), result("b", "f.rs", 0.8), result("c", "f.rs", 0.7)];
        group_by_file(&mut results, 2);
        assert!(results[0].representative);
        assert!(results[1].representative);
        assert!(!results[2].representative);
    }

    #[test]
    fn postrank_drops_non_representative_when_grouping_by_file() {
        let results = vec![result("a", "f.rs", 0.9), result("b", "f.rs", 0.8), result("c", "f.rs", 0.7)];
        let opts = SearchOptions {
            enable_dedup: false,
            enable_diversity: false,
            group_by_file: true,
            max_chunks_per_file: 2,
            top_k: 20,
            ..Default::default()
        };
        let out = postrank(results, &HashMap::new(), &opts);
        assert_eq!(out.len(), 2);
        assert_eq!(out.iter().map(|r| r.doc_id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn diversify_prefers_dissimilar_candidates() {
        let results = vec![result("a", "a.rs", 0.9), result("b", "b.rs", 0.85), result("c", "c.rs", 0.84)];
        let mut vectors = HashMap::new();
        vectors.insert("a".to_string(), vec![1.0, 0.0]);
        vectors.insert("b".to_string(), vec![0.99, 0.14]);
        vectors.insert("c".to_string(), vec![0.0, 1.0]);
        let diversified = diversify(results, &vectors, 0.5);
        assert_eq!(diversified[0].doc_id, "a");
        assert_eq!(diversified[1].doc_id, "c");
    }
}
