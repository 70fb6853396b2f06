//! C13 — Streaming Session: the wire-exact message schema (spec.md §6.1)
//! and the `HANDSHAKE -> READY -> CLOSING -> CLOSED` state machine (spec.md
//! §4.12), transport-agnostic — the `server` binary drives this over an
//! actual WebSocket.

use crate::error::CoreError;
use crate::hybrid::{SearchFilterOpts, SearchOptions};
use crate::pipeline::FileInput;
use crate::store::StoreHandle;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    File { path: String, content: String },
    Search {
        req_id: String,
        query: String,
        #[serde(default = "default_top_k")]
        top_k: usize,
        #[serde(default)]
        filters: Option<WireFilter>,
        #[serde(default = "default_true")]
        include_content: bool,
        #[serde(default = "default_true")]
        enable_reranking: bool,
    },
    Delete {
        req_id: String,
        #[serde(default)]
        paths: Option<Vec<String>>,
        #[serde(default)]
        path_prefix: Option<String>,
    },
    Stats { req_id: String },
    Ping,
}

fn default_top_k() -> usize {
    20
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireFilter {
    pub path_prefix: Option<String>,
    pub languages: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ack { conn_id: String, store: String },
    Indexed { chunks_queued: usize, files_count: usize, batch_id: String },
    Results { req_id: String, query: String, results: Vec<WireSearchResult>, total: usize, search_time_ms: u64 },
    Deleted { req_id: String, sparse_deleted: usize, dense_deleted: usize },
    StatsResult { req_id: String, tracked_files: usize, total_size: u64, last_updated: Option<chrono::DateTime<chrono::Utc>> },
    Pong,
    Error { req_id: Option<String>, code: String, message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct WireSearchResult {
    pub doc_id: String,
    pub path: String,
    pub language: String,
    pub start_line: usize,
    pub end_line: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub symbols: Vec<String>,
    pub final_score: f32,
}

impl From<crate::types::SearchResult> for WireSearchResult {
    fn from(r: crate::types::SearchResult) -> Self {
        Self {
            doc_id: r.doc_id,
            path: r.path,
            language: r.language,
            start_line: r.start_line,
            end_line: r.end_line,
            content: r.content,
            symbols: r.symbols,
            final_score: r.rerank_score.unwrap_or(r.fused_score),
        }
    }
}

impl ServerMessage {
    pub fn from_error(req_id: Option<String>, err: &CoreError) -> Self {
        ServerMessage::Error { req_id, code: err.code().to_string(), message: err.detail() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshake,
    Ready,
    Closing,
    Closed,
}

/// Per-connection file-batching state (spec.md §4.12, `file` handling).
struct Batch {
    files: Vec<FileInput>,
    started_at: Instant,
}

impl Batch {
    fn new() -> Self {
        Self { files: Vec::new(), started_at: Instant::now() }
    }
}

/// One `(client, store)` duplex session (spec.md §4.12).
pub struct Session {
    pub conn_id: String,
    pub store_name: String,
    state: SessionState,
    store: Arc<StoreHandle>,
    embedder: Arc<dyn crate::embed::Embedder>,
    reranker: Arc<dyn crate::embed::Reranker>,
    batch_size: usize,
    batch_idle: Duration,
    batch: Batch,
    seen_req_ids: HashSet<String>,
}

impl Session {
    pub fn new(
        conn_id: String,
        store_name: String,
        store: Arc<StoreHandle>,
        embedder: Arc<dyn crate::embed::Embedder>,
        reranker: Arc<dyn crate::embed::Reranker>,
        batch_size: usize,
        batch_idle: Duration,
    ) -> Self {
        Self {
            conn_id,
            store_name,
            state: SessionState::Handshake,
            store,
            embedder,
            reranker,
            batch_size,
            batch_idle,
            batch: Batch::new(),
            seen_req_ids: HashSet::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The first client frame transitions HANDSHAKE -> READY and the
    /// server emits `ack`.
    pub fn handshake_ack(&mut self) -> ServerMessage {
        self.state = SessionState::Ready;
        ServerMessage::Ack { conn_id: self.conn_id.clone(), store: self.store_name.clone() }
    }

    pub fn begin_closing(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Closing;
        }
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// True once `batch_idle_ms` has elapsed since the first unflushed
    /// file arrived, even if `batch_size` hasn't been reached.
    pub fn batch_is_idle(&self) -> bool {
        !self.batch.files.is_empty() && self.batch.started_at.elapsed() >= self.batch_idle
    }

    /// Handle one client frame, producing zero or more server frames.
    /// `file` is fire-and-forget and may return an `indexed` frame when the
    /// accumulated batch flushes; everything else replies exactly once.
    pub async fn handle(&mut self, msg: ClientMessage) -> Vec<ServerMessage> {
        if self.state == SessionState::Handshake {
            let ack = self.handshake_ack();
            let mut out = vec![ack];
            out.extend(self.dispatch(msg).await);
            return out;
        }
        self.dispatch(msg).await
    }

    async fn dispatch(&mut self, msg: ClientMessage) -> Vec<ServerMessage> {
        match msg {
            ClientMessage::File { path, content } => self.on_file(path, content).await,
            ClientMessage::Search { req_id, query, top_k, filters, include_content, enable_reranking } => {
                vec![self.on_search(req_id, query, top_k, filters, include_content, enable_reranking).await]
            }
            ClientMessage::Delete { req_id, paths, path_prefix } => {
                vec![self.on_delete(req_id, paths, path_prefix).await]
            }
            ClientMessage::Stats { req_id } => vec![self.on_stats(req_id)],
            ClientMessage::Ping => vec![ServerMessage::Pong],
        }
    }

    fn reject_duplicate(&mut self, req_id: &str) -> Option<ServerMessage> {
        if !self.seen_req_ids.insert(req_id.to_string()) {
            return Some(ServerMessage::Error {
                req_id: Some(req_id.to_string()),
                code: "duplicate_req_id".to_string(),
                message: format!("req_id '{req_id}' already used on this connection"),
            });
        }
        None
    }

    async fn on_file(&mut self, path: String, content: String) -> Vec<ServerMessage> {
        self.batch.files.push(FileInput { path, content });
        if self.batch.files.len() >= self.batch_size || self.batch_is_idle() {
            return self.flush_batch().await;
        }
        Vec::new()
    }

    /// Force-flush the current batch regardless of size/idle thresholds —
    /// called on idle-timer expiry and connection close.
    pub async fn flush_batch(&mut self) -> Vec<ServerMessage> {
        if self.batch.files.is_empty() {
            return Vec::new();
        }
        let files = std::mem::replace(&mut self.batch, Batch::new()).files;
        let files_count = files.len();
        match crate::pipeline::index_files(&self.store, files, false).await {
            Ok(resp) => vec![ServerMessage::Indexed {
                chunks_queued: resp.chunks_queued,
                files_count,
                batch_id: uuid::Uuid::new_v4().to_string(),
            }],
            Err(e) => vec![ServerMessage::from_error(None, &e)],
        }
    }

    async fn on_search(
        &mut self,
        req_id: String,
        query: String,
        top_k: usize,
        filters: Option<WireFilter>,
        include_content: bool,
        enable_reranking: bool,
    ) -> ServerMessage {
        if let Some(dup) = self.reject_duplicate(&req_id) {
            return dup;
        }
        let started = Instant::now();
        let mut opts = SearchOptions { top_k, include_content, enable_reranking, ..Default::default() };
        if let Some(f) = filters {
            opts.filter = SearchFilterOpts { path_prefix: f.path_prefix, languages: f.languages };
        }

        match crate::hybrid::search(&self.store.sparse, &self.store.vector, &self.embedder, &self.reranker, &query, &opts).await {
            Ok(results) => {
                let total = results.len();
                let wire_results: Vec<WireSearchResult> = results.into_iter().map(WireSearchResult::from).collect();
                ServerMessage::Results {
                    req_id,
                    query,
                    results: wire_results,
                    total,
                    search_time_ms: started.elapsed().as_millis() as u64,
                }
            }
            Err(e) => ServerMessage::from_error(Some(req_id), &e),
        }
    }

    async fn on_delete(&mut self, req_id: String, paths: Option<Vec<String>>, path_prefix: Option<String>) -> ServerMessage {
        if let Some(dup) = self.reject_duplicate(&req_id) {
            return dup;
        }
        match crate::pipeline::delete_files(&self.store, paths, path_prefix).await {
            Ok(resp) => ServerMessage::Deleted { req_id, sparse_deleted: resp.sparse_deleted, dense_deleted: resp.dense_deleted },
            Err(e) => ServerMessage::from_error(Some(req_id), &e),
        }
    }

    fn on_stats(&mut self, req_id: String) -> ServerMessage {
        if let Some(dup) = self.reject_duplicate(&req_id) {
            return dup;
        }
        let stats = self.store.stats();
        ServerMessage::StatsResult {
            req_id,
            tracked_files: stats.chunk_count,
            total_size: stats.total_size,
            last_updated: stats.last_indexed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::embed::{Embedder, PassthroughReranker, Reranker};
    use crate::store::StoreManager;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct StubEmbedder;

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, texts: &[String]) -> crate::error::CoreResult<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
        fn dimension(&self) -> usize {
            2
        }
    }

    fn session(dir: &std::path::Path) -> Session {
        let mgr = StoreManager::new(CoreConfig { data_root: dir.to_path_buf(), ..Default::default() }, Arc::new(StubEmbedder));
        let store = mgr.ensure("default").unwrap();
        Session::new(
            "conn-1".to_string(),
            "default".to_string(),
            store,
            Arc::new(StubEmbedder),
            Arc::new(PassthroughReranker) as Arc<dyn Reranker>,
            5,
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn first_frame_transitions_to_ready_with_ack() {
        let dir = tempdir().unwrap();
        let mut s = session(dir.path());
        assert_eq!(s.state(), SessionState::Handshake);
        let out = s.handle(ClientMessage::Ping).await;
        assert_eq!(s.state(), SessionState::Ready);
        assert!(matches!(out[0], ServerMessage::Ack { .. }));
        assert!(matches!(out[1], ServerMessage::Pong));
    }

    #[tokio::test]
    async fn file_messages_batch_until_threshold() {
        let dir = tempdir().unwrap();
        let mut s = session(dir.path());
        s.handshake_ack();
        for i in 0..4 {
            let out = s.handle(ClientMessage::File { path: format!("f{i}.py"), content: "x = 1".into() }).await;
            assert!(out.is_empty());
        }
        let out = s.handle(ClientMessage::File { path: "f4.py".into(), content: "x = 1".into() }).await;
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], ServerMessage::Indexed { files_count: 5, .. }));
    }

    #[tokio::test]
    async fn duplicate_req_id_is_rejected() {
        let dir = tempdir().unwrap();
        let mut s = session(dir.path());
        s.handshake_ack();
        let first = s.handle(ClientMessage::Stats { req_id: "r1".into() }).await;
        assert!(matches!(first[0], ServerMessage::StatsResult { .. }));
        let second = s.handle(ClientMessage::Stats { req_id: "r1".into() }).await;
        match &second[0] {
            ServerMessage::Error { code, .. } => assert_eq!(code, "duplicate_req_id"),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn search_returns_results_message() {
        let dir = tempdir().unwrap();
        let mut s = session(dir.path());
        s.handshake_ack();
        s.handle(ClientMessage::File { path: "a.py".into(), content: "def f():\n    return 1\n".into() }).await;
        s.flush_batch().await;

        let out = s
            .handle(ClientMessage::Search {
                req_id: "r1".into(),
                query: "f".into(),
                top_k: 10,
                filters: None,
                include_content: true,
                enable_reranking: false,
            })
            .await;
        assert!(matches!(out[0], ServerMessage::Results { .. } | ServerMessage::Error { .. }));
    }
}
