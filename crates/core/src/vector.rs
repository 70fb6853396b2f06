//! C4 — Vector Collection: one collection per store, `Upsert`/
//! `DeleteByPathPrefix`/`Search` over `(doc_id, vector, payload)` points
//! (spec.md §4.4). Two implementations behind the same trait, selected at
//! store-creation time by `VECTOR_DB_URL` — the "sparse-via-BM25 vs
//! sparse-via-vector-db" tagged-variant redesign flag (spec.md §9) applied
//! here to the dense side instead.

use crate::error::{CoreError, CoreResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Payload carried alongside a vector (spec.md §4.4, `Point.payload`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub path: String,
    pub language: String,
    pub chunk_index: usize,
    pub start_line: usize,
    pub end_line: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Point {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Payload,
}

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub doc_id: String,
    pub score: f32,
    pub payload: Payload,
}

/// Filter over payload fields, shared with [`crate::sparse::SearchFilter`]'s
/// shape so C11 can build one filter and apply it to both retrieval legs.
#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub path_prefix: Option<String>,
    pub languages: Option<Vec<String>>,
}

impl VectorFilter {
    fn accepts(&self, payload: &Payload) -> bool {
        if let Some(prefix) = &self.path_prefix {
            if !payload.path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(langs) = &self.languages {
            if !langs.iter().any(|l| l == &payload.language) {
                return false;
            }
        }
        true
    }
}

/// L2-normalize a vector in place; a zero vector is left untouched (its
/// cosine similarity against anything is defined as 0).
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, points: Vec<Point>) -> CoreResult<()>;
    async fn delete_by_path_prefix(&self, prefix: &str) -> CoreResult<usize>;
    async fn delete_by_path(&self, path: &str) -> CoreResult<usize>;
    async fn search(&self, vector: &[f32], k: usize, filter: &VectorFilter) -> CoreResult<Vec<VectorHit>>;
    /// Fetch a point's vector for postrank dedup (spec.md §4.10 step 7a).
    async fn get_vector(&self, doc_id: &str) -> CoreResult<Option<Vec<f32>>>;
}

/// In-process flat-scan collection: fine at the scale a single-node dev
/// index runs at, and the default when no `VECTOR_DB_URL` is configured.
#[derive(Default)]
pub struct InMemoryVectorStore {
    points: RwLock<HashMap<String, Point>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, mut points: Vec<Point>) -> CoreResult<()> {
        let mut guard = self.points.write().unwrap_or_else(|p| p.into_inner());
        for point in points.drain(..) {
            let mut point = point;
            l2_normalize(&mut point.vector);
            // idempotent last-writer-wins on `id` (spec.md §5)
            guard.insert(point.id.clone(), point);
        }
        Ok(())
    }

    async fn delete_by_path_prefix(&self, prefix: &str) -> CoreResult<usize> {
        let mut guard = self.points.write().unwrap_or_else(|p| p.into_inner());
        let ids: Vec<String> =
            guard.values().filter(|p| p.payload.path.starts_with(prefix)).map(|p| p.id.clone()).collect();
        for id in &ids {
            guard.remove(id);
        }
        Ok(ids.len())
    }

    async fn delete_by_path(&self, path: &str) -> CoreResult<usize> {
        let mut guard = self.points.write().unwrap_or_else(|p| p.into_inner());
        let ids: Vec<String> =
            guard.values().filter(|p| p.payload.path == path).map(|p| p.id.clone()).collect();
        for id in &ids {
            guard.remove(id);
        }
        Ok(ids.len())
    }

    async fn search(&self, vector: &[f32], k: usize, filter: &VectorFilter) -> CoreResult<Vec<VectorHit>> {
        let mut query = vector.to_vec();
        l2_normalize(&mut query);

        let guard = self.points.read().unwrap_or_else(|p| p.into_inner());
        let mut scored: Vec<VectorHit> = guard
            .values()
            .filter(|p| filter.accepts(&p.payload))
            .map(|p| VectorHit { doc_id: p.id.clone(), score: cosine(&query, &p.vector), payload: p.payload.clone() })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn get_vector(&self, doc_id: &str) -> CoreResult<Option<Vec<f32>>> {
        let guard = self.points.read().unwrap_or_else(|p| p.into_inner());
        Ok(guard.get(doc_id).map(|p| p.vector.clone()))
    }
}

/// HTTP client speaking a Qdrant-like REST contract against an external
/// vector database, selected when `VECTOR_DB_URL` is set (spec.md §6.3).
pub struct HttpVectorStore {
    client: reqwest::Client,
    base_url: String,
    collection: String,
    api_key: Option<String>,
}

impl HttpVectorStore {
    pub fn new(base_url: String, collection: String, api_key: Option<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url, collection, api_key }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/collections/{}{}", self.base_url.trim_end_matches('/'), self.collection, path);
        let mut req = self.client.request(method, url);
        if let Some(key) = &self.api_key {
            req = req.header("api-key", key);
        }
        req
    }

    fn classify_error(status: reqwest::StatusCode, body: String) -> CoreError {
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            CoreError::Timeout(format!("vector db returned {status}: {body}"))
        } else {
            CoreError::Internal(format!("vector db returned {status}: {body}"))
        }
    }
}

#[derive(Serialize)]
struct UpsertBody {
    points: Vec<WirePoint>,
}

#[derive(Serialize)]
struct WirePoint {
    id: String,
    vector: Vec<f32>,
    payload: Payload,
}

#[derive(Serialize)]
struct SearchBody<'a> {
    vector: &'a [f32],
    limit: usize,
    filter: Option<WireFilter>,
    with_payload: bool,
}

#[derive(Serialize)]
struct WireFilter {
    path_prefix: Option<String>,
    languages: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct SearchResponseItem {
    id: String,
    score: f32,
    payload: Payload,
}

#[derive(Deserialize)]
struct SearchResponse {
    result: Vec<SearchResponseItem>,
}

#[derive(Deserialize)]
struct DeleteResponse {
    deleted: usize,
}

#[derive(Deserialize)]
struct GetVectorResponse {
    vector: Option<Vec<f32>>,
}

#[async_trait]
impl VectorStore for HttpVectorStore {
    async fn upsert(&self, points: Vec<Point>) -> CoreResult<()> {
        let wire_points = points
            .into_iter()
            .map(|mut p| {
                l2_normalize(&mut p.vector);
                WirePoint { id: p.id, vector: p.vector, payload: p.payload }
            })
            .collect();
        let resp = self
            .request(reqwest::Method::PUT, "/points")
            .json(&UpsertBody { points: wire_points })
            .send()
            .await
            .map_err(|e| CoreError::Timeout(format!("vector db upsert failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify_error(status, body));
        }
        Ok(())
    }

    async fn delete_by_path_prefix(&self, prefix: &str) -> CoreResult<usize> {
        let resp = self
            .request(reqwest::Method::POST, "/points/delete")
            .json(&WireFilter { path_prefix: Some(prefix.to_string()), languages: None })
            .send()
            .await
            .map_err(|e| CoreError::Timeout(format!("vector db delete failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify_error(status, body));
        }
        let parsed: DeleteResponse =
            resp.json().await.map_err(|e| CoreError::Internal(format!("bad delete response: {e}")))?;
        Ok(parsed.deleted)
    }

    async fn delete_by_path(&self, path: &str) -> CoreResult<usize> {
        // exact match is a path-prefix filter with nothing after it, but a
        // literal path is not a prefix of anything longer, so upstream
        // reuses the same filter shape with an exact-match flag encoded as
        // the full path.
        self.delete_by_path_prefix(path).await
    }

    async fn search(&self, vector: &[f32], k: usize, filter: &VectorFilter) -> CoreResult<Vec<VectorHit>> {
        let mut query = vector.to_vec();
        l2_normalize(&mut query);

        let wire_filter = if filter.path_prefix.is_some() || filter.languages.is_some() {
            Some(WireFilter { path_prefix: filter.path_prefix.clone(), languages: filter.languages.clone() })
        } else {
            None
        };

        let resp = self
            .request(reqwest::Method::POST, "/points/search")
            .json(&SearchBody { vector: &query, limit: k, filter: wire_filter, with_payload: true })
            .send()
            .await
            .map_err(|e| CoreError::Timeout(format!("vector db search failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify_error(status, body));
        }
        let parsed: SearchResponse =
            resp.json().await.map_err(|e| CoreError::Internal(format!("bad search response: {e}")))?;
        Ok(parsed
            .result
            .into_iter()
            .map(|item| VectorHit { doc_id: item.id, score: item.score, payload: item.payload })
            .collect())
    }

    async fn get_vector(&self, doc_id: &str) -> CoreResult<Option<Vec<f32>>> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/points/{doc_id}"))
            .send()
            .await
            .map_err(|e| CoreError::Timeout(format!("vector db get failed: {e}")))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify_error(status, body));
        }
        let parsed: GetVectorResponse =
            resp.json().await.map_err(|e| CoreError::Internal(format!("bad get response: {e}")))?;
        Ok(parsed.vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(id: &str, vector: Vec<f32>, path: &str, language: &str) -> Point {
        Point {
            id: id.into(),
            vector,
            payload: Payload { path: path.into(), language: language.into(), chunk_index: 0, start_line: 1, end_line: 1 },
        }
    }

    #[tokio::test]
    async fn search_ranks_by_cosine_similarity() {
        let store = InMemoryVectorStore::new();
        store
            .upsert(vec![
                point("a", vec![1.0, 0.0], "a.rs", "rust"),
                point("b", vec![0.0, 1.0], "b.rs", "rust"),
            ])
            .await
            .unwrap();

        let hits = store.search(&[1.0, 0.0], 10, &VectorFilter::default()).await.unwrap();
        assert_eq!(hits[0].doc_id, "a");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn upsert_same_id_is_last_writer_wins() {
        let store = InMemoryVectorStore::new();
        store.upsert(vec![point("a", vec![1.0, 0.0], "a.rs", "rust")]).await.unwrap();
        store.upsert(vec![point("a", vec![0.0, 1.0], "a.rs", "rust")]).await.unwrap();

        let vec = store.get_vector("a").await.unwrap().unwrap();
        assert!((vec[1] - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn delete_by_path_prefix_removes_matches() {
        let store = InMemoryVectorStore::new();
        store
            .upsert(vec![
                point("a", vec![1.0, 0.0], "src/a.rs", "rust"),
                point("b", vec![0.0, 1.0], "docs/b.md", "markdown"),
            ])
            .await
            .unwrap();

        let deleted = store.delete_by_path_prefix("src/").await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_vector("a").await.unwrap().is_none());
        assert!(store.get_vector("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn filter_excludes_other_languages() {
        let store = InMemoryVectorStore::new();
        store
            .upsert(vec![
                point("a", vec![1.0, 0.0], "a.py", "python"),
                point("b", vec![1.0, 0.0], "b.go", "go"),
            ])
            .await
            .unwrap();

        let filter = VectorFilter { path_prefix: None, languages: Some(vec!["go".to_string()]) };
        let hits = store.search(&[1.0, 0.0], 10, &filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "b");
    }
}
