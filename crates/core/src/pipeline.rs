//! C9 — Indexing Pipeline: `IndexFiles`/`DeleteFiles`/`Reindex`/
//! `SyncDeleted`, orchestrating C1/C2/C7/C8 exactly per the flow in
//! spec.md §4.8 — tracking commits before embeddings finish (at-least-once).

use crate::chunk::chunk_file;
use crate::error::CoreResult;
use crate::queue_sparse::SparseJob;
use crate::store::StoreHandle;
use crate::types::{normalize_path, Chunk, ChunkMethod, ChunkSkipReason, IndexJob, IndexJobChunk, SparseDoc};
use rayon::prelude::*;
use std::sync::Arc;

/// A single input file to [`IndexFiles`].
#[derive(Debug, Clone)]
pub struct FileInput {
    pub path: String,
    pub content: String,
}

/// `{job_id, status, files_accepted, chunks_queued, queue_position,
/// skipped_unchanged, errors?}` (spec.md §4.8).
#[derive(Debug, Clone, serde::Serialize)]
pub struct AcceptResponse {
    pub job_id: Option<String>,
    pub status: &'static str,
    pub files_accepted: usize,
    pub chunks_queued: usize,
    pub queue_position: Option<usize>,
    pub skipped_unchanged: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DeleteResponse {
    pub sparse_deleted: usize,
    pub dense_deleted: usize,
    pub time_ms: u64,
}

/// `IndexFiles(store, files, force) -> AcceptResponse` (spec.md §4.8).
pub async fn index_files(store: &StoreHandle, files: Vec<FileInput>, force: bool) -> CoreResult<AcceptResponse> {
    let files: Vec<FileInput> = files.into_iter().map(|f| FileInput { path: normalize_path(&f.path), content: f.content }).collect();

    let (to_process, skipped_unchanged): (Vec<FileInput>, usize) = if force {
        (files, 0)
    } else {
        let pairs: Vec<(String, &str)> = files.iter().map(|f| (f.path.clone(), f.content.as_str())).collect();
        let changes = store.tracker.check_changes(&pairs);
        let skipped = changes.unchanged.len();
        let keep: std::collections::HashSet<String> =
            changes.changed.into_iter().chain(changes.new).collect();
        (files.into_iter().filter(|f| keep.contains(&f.path)).collect(), skipped)
    };
    let store_cfg = &store.config;

    // Parallel AST parse fan-out (spec.md §5, "rayon for CPU-bound chunk/AST work").
    let chunked: Vec<(FileInput, crate::types::ChunkResult)> = to_process
        .into_par_iter()
        .map(|file| {
            let result = chunk_file(&file.path, &file.content, store_cfg, store_cfg.max_file_size_mb);
            (file, result)
        })
        .collect();

    let mut all_chunks: Vec<Chunk> = Vec::new();
    let mut per_file_chunk_ids: Vec<(String, String, Vec<String>)> = Vec::new();
    let mut errors = Vec::new();

    for (file, result) in chunked {
        if let Some(reason) = result.skip_reason {
            errors.push(match reason {
                ChunkSkipReason::Binary => format!("{}: skipped (binary content)", file.path),
                ChunkSkipReason::TooLarge => format!("{}: skipped (exceeds max file size)", file.path),
            });
            continue;
        }
        if result.chunks.is_empty() {
            continue;
        }
        if result.method != ChunkMethod::Ast {
            tracing::debug!(path = %file.path, method = ?result.method, "chunked with fallback method");
        }
        let chunk_ids: Vec<String> = result.chunks.iter().map(|c| c.doc_id.clone()).collect();
        per_file_chunk_ids.push((file.path.clone(), file.content.clone(), chunk_ids));
        all_chunks.extend(result.chunks);
    }

    let files_accepted = per_file_chunk_ids.len();
    let mut queue_position = None;
    let mut job_id = None;
    let mut chunks_queued = 0;

    if !all_chunks.is_empty() {
        let sparse_docs: Vec<SparseDoc> = all_chunks.iter().map(SparseDoc::from_chunk).collect();
        let _sparse_job_id = store.sparse_queue.enqueue(SparseJob::Upsert(sparse_docs));

        let track_entries: Vec<(String, &str, Vec<String>)> =
            per_file_chunk_ids.iter().map(|(path, content, ids)| (path.clone(), content.as_str(), ids.clone())).collect();
        store.tracker.track(&track_entries)?;

        let job_chunks: Vec<IndexJobChunk> = all_chunks.iter().map(IndexJobChunk::from_chunk).collect();
        chunks_queued = job_chunks.len();
        let job = IndexJob {
            job_id: uuid::Uuid::new_v4().to_string(),
            store: store.meta.read().unwrap_or_else(|p| p.into_inner()).name.clone(),
            created_at: chrono::Utc::now(),
            chunks: job_chunks,
        };
        let (jid, pos) = store.embedding_queue.enqueue(job).await?;
        job_id = Some(jid);
        queue_position = Some(pos);
    }

    Ok(AcceptResponse {
        job_id,
        status: if chunks_queued > 0 { "accepted" } else { "completed" },
        files_accepted,
        chunks_queued,
        queue_position,
        skipped_unchanged,
        errors,
    })
}

/// `DeleteFiles(store, paths?, prefix?) -> {sparse_deleted, dense_deleted, time_ms}`.
pub async fn delete_files(
    store: &StoreHandle,
    paths: Option<Vec<String>>,
    prefix: Option<String>,
) -> CoreResult<DeleteResponse> {
    let started = std::time::Instant::now();
    let mut sparse_deleted = 0;
    let mut dense_deleted = 0;

    if let Some(prefix) = &prefix {
        sparse_deleted += store.sparse.delete_by_path_prefix(prefix)?;
        dense_deleted += store.vector.delete_by_path_prefix(prefix).await?;
        store.tracker.untrack_by_prefix(prefix)?;
    }

    if let Some(paths) = &paths {
        for path in paths {
            let path = normalize_path(path);
            sparse_deleted += store.sparse.delete_by_path(&path)?;
            dense_deleted += store.vector.delete_by_path(&path).await?;
            store.tracker.untrack(&path)?;
        }
    }

    Ok(DeleteResponse { sparse_deleted, dense_deleted, time_ms: started.elapsed().as_millis() as u64 })
}

/// `Reindex(store, files) = { Clear; DeleteByPrefix(""); IndexFiles(force=true); }`.
pub async fn reindex(store: &StoreHandle, files: Vec<FileInput>) -> CoreResult<AcceptResponse> {
    store.tracker.clear()?;
    store.sparse.delete_by_path_prefix("")?;
    store.vector.delete_by_path_prefix("").await?;
    index_files(store, files, true).await
}

/// `SyncDeleted(store, current_paths) -> {deleted}`.
pub async fn sync_deleted(store: &StoreHandle, current_paths: &[String]) -> CoreResult<Vec<String>> {
    let deleted = store.tracker.find_deleted(current_paths);
    if !deleted.is_empty() {
        delete_files(store, Some(deleted.clone()), None).await?;
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::embed::Embedder;
    use crate::store::StoreManager;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct StubEmbedder;

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
        fn dimension(&self) -> usize {
            2
        }
    }

    fn manager(data_root: std::path::PathBuf) -> StoreManager {
        StoreManager::new(CoreConfig { data_root, ..Default::default() }, Arc::new(StubEmbedder))
    }

    #[tokio::test]
    async fn index_files_accepts_and_tracks() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path().to_path_buf());
        let store = mgr.ensure("default").unwrap();

        let files = vec![FileInput { path: "a.py".into(), content: "def f():\n    return 1\n".into() }];
        let resp = index_files(&store, files, false).await.unwrap();
        assert_eq!(resp.status, "accepted");
        assert_eq!(resp.files_accepted, 1);
        assert!(resp.chunks_queued > 0);

        let tracked = store.tracker.get("a.py");
        assert!(tracked.is_some());
    }

    #[tokio::test]
    async fn index_files_skips_unchanged_without_force() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path().to_path_buf());
        let store = mgr.ensure("default").unwrap();
        let content = "def f():\n    return 1\n".to_string();

        index_files(&store, vec![FileInput { path: "a.py".into(), content: content.clone() }], false).await.unwrap();
        let resp = index_files(&store, vec![FileInput { path: "a.py".into(), content }], false).await.unwrap();
        assert_eq!(resp.files_accepted, 0);
        assert_eq!(resp.status, "completed");
        assert_eq!(resp.skipped_unchanged, 1);
        assert_eq!(resp.chunks_queued, 0);
    }

    #[tokio::test]
    async fn delete_files_by_prefix_removes_tracked_entries() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path().to_path_buf());
        let store = mgr.ensure("default").unwrap();
        index_files(&store, vec![FileInput { path: "src/a.py".into(), content: "x = 1".into() }], false).await.unwrap();

        let resp = delete_files(&store, None, Some("src/".to_string())).await.unwrap();
        assert!(resp.sparse_deleted > 0 || resp.dense_deleted == 0);
        assert!(store.tracker.get("src/a.py").is_none());
    }

    #[tokio::test]
    async fn sync_deleted_removes_files_missing_from_current_set() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path().to_path_buf());
        let store = mgr.ensure("default").unwrap();
        index_files(&store, vec![FileInput { path: "a.py".into(), content: "x = 1".into() }], false).await.unwrap();

        let deleted = sync_deleted(&store, &[]).await.unwrap();
        assert_eq!(deleted, vec!["a.py".to_string()]);
        assert!(store.tracker.get("a.py").is_none());
    }
}
