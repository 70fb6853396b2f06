//! C6 — Embedder / Reranker: external-collaborator traits (spec.md §4.6).
//! `Embed` preserves input order and returns L2-normalized fixed-dimension
//! vectors; `Rerank` scores a query against candidate texts. Model failures
//! surface as `CoreError::ModelUnavailable`/`Timeout`, never panics.

use crate::error::{CoreError, CoreResult};
use crate::vector::l2_normalize;
use async_trait::async_trait;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// `Embed([]string) -> [][]float32`, order-preserving.
    async fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>>;

    fn dimension(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct RerankHit {
    pub index: usize,
    pub score: f32,
}

#[async_trait]
pub trait Reranker: Send + Sync {
    /// `Rerank(query, []string, top_k) -> []{index, score}` desc by score.
    async fn rerank(&self, query: &str, candidates: &[String], top_k: usize) -> CoreResult<Vec<RerankHit>>;
}

/// Local embedder backed by `fastembed` — the teacher's own optional
/// "semantic" feature dependency — so the crate is exercisable without a
/// network call. Lazily loads the model on first use.
#[cfg(feature = "fastembed")]
pub struct FastEmbedEmbedder {
    model: std::sync::Mutex<fastembed::TextEmbedding>,
    dimension: usize,
}

#[cfg(feature = "fastembed")]
impl FastEmbedEmbedder {
    pub fn new(dimension: usize) -> CoreResult<Self> {
        let model = fastembed::TextEmbedding::try_new(fastembed::InitOptions::new(
            fastembed::EmbeddingModel::BGESmallENV15,
        ))
        .map_err(|e| CoreError::ModelUnavailable(format!("failed to load embedding model: {e}")))?;
        Ok(Self { model: std::sync::Mutex::new(model), dimension })
    }
}

#[cfg(feature = "fastembed")]
#[async_trait]
impl Embedder for FastEmbedEmbedder {
    async fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        let texts: Vec<String> = texts.to_vec();
        let dimension = self.dimension;
        let model = self.model.lock().unwrap_or_else(|p| p.into_inner());
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let mut embeddings = model
            .embed(refs, None)
            .map_err(|e| CoreError::ModelUnavailable(format!("embedding inference failed: {e}")))?;
        for v in embeddings.iter_mut() {
            l2_normalize(v);
        }
        debug_assert!(embeddings.iter().all(|v| v.len() == dimension));
        Ok(embeddings)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// HTTP client speaking to an out-of-process reranker service (a
/// cross-encoder-style model is too heavy to embed in-process by default).
pub struct HttpReranker {
    client: reqwest::Client,
    base_url: String,
}

impl HttpReranker {
    pub fn new(base_url: String) -> Self {
        Self { client: reqwest::Client::new(), base_url }
    }
}

#[derive(serde::Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    documents: &'a [String],
    top_k: usize,
}

#[derive(serde::Deserialize)]
struct RerankResponseItem {
    index: usize,
    score: f32,
}

#[derive(serde::Deserialize)]
struct RerankResponse {
    results: Vec<RerankResponseItem>,
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(&self, query: &str, candidates: &[String], top_k: usize) -> CoreResult<Vec<RerankHit>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let resp = self
            .client
            .post(format!("{}/rerank", self.base_url.trim_end_matches('/')))
            .json(&RerankRequest { query, documents: candidates, top_k })
            .send()
            .await
            .map_err(|e| CoreError::Timeout(format!("reranker request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(if status.is_server_error() {
                CoreError::ModelUnavailable(format!("reranker returned {status}: {body}"))
            } else {
                CoreError::Internal(format!("reranker returned {status}: {body}"))
            });
        }

        let parsed: RerankResponse =
            resp.json().await.map_err(|e| CoreError::Internal(format!("bad reranker response: {e}")))?;
        let mut hits: Vec<RerankHit> =
            parsed.results.into_iter().map(|r| RerankHit { index: r.index, score: r.score }).collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }
}

/// A no-op reranker that preserves fused-score ordering; used when no
/// reranker endpoint is configured (spec.md §4.10 step 6, "if enabled").
pub struct PassthroughReranker;

#[async_trait]
impl Reranker for PassthroughReranker {
    async fn rerank(&self, _query: &str, candidates: &[String], top_k: usize) -> CoreResult<Vec<RerankHit>> {
        Ok((0..candidates.len().min(top_k)).map(|index| RerankHit { index, score: 0.0 }).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passthrough_reranker_preserves_order_up_to_top_k() {
        let reranker = PassthroughReranker;
        let candidates = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let hits = reranker.rerank("q", &candidates, 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].index, 0);
        assert_eq!(hits[1].index, 1);
    }

    #[tokio::test]
    async fn passthrough_reranker_handles_empty_candidates() {
        let reranker = PassthroughReranker;
        let hits = reranker.rerank("q", &[], 5).await.unwrap();
        assert!(hits.is_empty());
    }
}
