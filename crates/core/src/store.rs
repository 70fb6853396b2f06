//! C12 — Store Manager: `Ensure`/`Create`/`Delete`/`List`/`Stats`/`Touch`
//! over the registry of stores, each backing three isolated resources — a
//! C3 sparse segment (+ C7 write queue), a C4 vector collection, and a C2
//! tracker file — provisioned atomically with rollback on partial failure
//! (spec.md §4.11).

use crate::cache::EmbeddingCache;
use crate::config::{CoreConfig, StoreConfig, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use crate::embed::Embedder;
use crate::error::{CoreError, CoreResult};
use crate::queue_embed::EmbeddingQueue;
use crate::queue_sparse::SparseWriteQueue;
use crate::sparse::SparseSegment;
use crate::tracker::FileTracker;
use crate::types::{validate_store_name, StoreMeta, DEFAULT_STORE};
use crate::vector::{HttpVectorStore, InMemoryVectorStore, VectorStore};
use dashmap::DashMap;
use std::sync::Arc;

/// Load `<store_dir>/meta.json` if it exists (spec.md §6.2, `meta.json`).
fn load_meta(store_dir: &std::path::Path) -> CoreResult<Option<StoreMeta>> {
    let path = store_dir.join("meta.json");
    if !path.exists() {
        return Ok(None);
    }
    let body = std::fs::read_to_string(&path)?;
    Ok(Some(serde_json::from_str(&body)?))
}

/// Write-to-temp + atomic rename, matching the tracker's own `tracker.json`
/// persistence idiom (tracker.rs).
fn persist_meta(store_dir: &std::path::Path, meta: &StoreMeta) -> CoreResult<()> {
    std::fs::create_dir_all(store_dir)?;
    let path = store_dir.join("meta.json");
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_string_pretty(meta)?;
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

/// Aggregate stats for a store (spec.md §4.11, `Stats`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub doc_count: usize,
    pub chunk_count: usize,
    pub total_size: u64,
    pub last_indexed: Option<chrono::DateTime<chrono::Utc>>,
}

/// Every resource a single store owns.
pub struct StoreHandle {
    pub meta: std::sync::RwLock<StoreMeta>,
    pub config: StoreConfig,
    pub tracker: Arc<FileTracker>,
    pub sparse: Arc<SparseSegment>,
    pub sparse_queue: SparseWriteQueue,
    pub vector: Arc<dyn VectorStore>,
    pub embedding_queue: EmbeddingQueue,
}

impl StoreHandle {
    pub fn stats(&self) -> StoreStats {
        let tracker_stats = self.tracker.stats();
        StoreStats {
            doc_count: self.sparse.doc_count(),
            chunk_count: tracker_stats.tracked_files,
            total_size: tracker_stats.total_size,
            last_indexed: tracker_stats.last_updated,
        }
    }
}

pub struct StoreManager {
    config: CoreConfig,
    embedder: Arc<dyn Embedder>,
    stores: DashMap<String, Arc<StoreHandle>>,
}

impl StoreManager {
    pub fn new(config: CoreConfig, embedder: Arc<dyn Embedder>) -> Self {
        Self { config, embedder, stores: DashMap::new() }
    }

    /// `Ensure(name)`: return the store, creating it with default metadata
    /// if it doesn't already exist, reloading persisted `meta.json` if a
    /// prior process already provisioned it on disk.
    pub fn ensure(&self, name: &str) -> CoreResult<Arc<StoreHandle>> {
        if let Some(existing) = self.stores.get(name) {
            return Ok(existing.clone());
        }
        self.create(name, String::new(), String::new(), None, None)
    }

    /// `Create(name, meta)`: provisions C3 + C4 + C2 atomically; rolls back
    /// all partially created resources if any step fails. `chunk_size`/
    /// `chunk_overlap` override the process defaults for this store only
    /// (spec.md §3); `None` falls back to [`DEFAULT_CHUNK_SIZE`]/
    /// [`DEFAULT_CHUNK_OVERLAP`].
    pub fn create(
        &self,
        name: &str,
        display_name: String,
        description: String,
        chunk_size: Option<usize>,
        chunk_overlap: Option<usize>,
    ) -> CoreResult<Arc<StoreHandle>> {
        validate_store_name(name).map_err(|e| CoreError::Validation(e.to_string()))?;
        if self.stores.contains_key(name) {
            return Err(CoreError::AlreadyExists(format!("store '{name}' already exists")));
        }

        let store_dir = self.config.store_dir(name);
        let queue_dir = self.config.queue_dir(name);

        let result = self.provision(name, &store_dir, &queue_dir, display_name, description, chunk_size, chunk_overlap);
        match result {
            Ok(handle) => {
                self.stores.insert(name.to_string(), handle.clone());
                Ok(handle)
            }
            Err(e) => {
                // rollback: remove anything that got created on disk
                let _ = std::fs::remove_dir_all(&store_dir);
                let _ = std::fs::remove_dir_all(&queue_dir);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn provision(
        &self,
        name: &str,
        store_dir: &std::path::Path,
        queue_dir: &std::path::Path,
        display_name: String,
        description: String,
        chunk_size: Option<usize>,
        chunk_overlap: Option<usize>,
    ) -> CoreResult<Arc<StoreHandle>> {
        let meta = match load_meta(store_dir)? {
            // A prior process already provisioned this store: its persisted
            // identity (name/description/timestamps/chunking) wins over
            // whatever defaults this call was about to apply.
            Some(existing) => existing,
            None => {
                let now = chrono::Utc::now();
                let meta = StoreMeta {
                    name: name.to_string(),
                    display_name,
                    description,
                    created_at: now,
                    updated_at: now,
                    chunk_size: chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
                    chunk_overlap: chunk_overlap.unwrap_or(DEFAULT_CHUNK_OVERLAP),
                };
                persist_meta(store_dir, &meta)?;
                meta
            }
        };
        let store_config = StoreConfig::from_core(&self.config, meta.chunk_size, meta.chunk_overlap);

        let tracker = Arc::new(FileTracker::load(store_dir)?);

        let sparse = Arc::new(SparseSegment::open(&store_dir.join("sparse"))?);
        let (sparse_queue, _writer_handle) = SparseWriteQueue::spawn(sparse.clone());

        let vector: Arc<dyn VectorStore> = match &self.config.vector_db_url {
            Some(url) => {
                Arc::new(HttpVectorStore::new(url.clone(), name.to_string(), self.config.vector_db_api_key.clone()))
            }
            None => Arc::new(InMemoryVectorStore::new()),
        };

        let cache = Arc::new(EmbeddingCache::new(10_000));
        let embedding_queue = EmbeddingQueue::spawn(
            queue_dir.to_path_buf(),
            store_config.embed_workers,
            store_config.max_queued_chunks,
            cache,
            self.embedder.clone(),
            vector.clone(),
            store_config.embed_batch_size,
        )?;

        Ok(Arc::new(StoreHandle {
            meta: std::sync::RwLock::new(meta),
            config: store_config,
            tracker,
            sparse,
            sparse_queue,
            vector,
            embedding_queue,
        }))
    }

    /// `Delete(name)`: remove the store and its on-disk resources.
    pub fn delete(&self, name: &str) -> CoreResult<()> {
        let Some((_, _handle)) = self.stores.remove(name) else {
            return Err(CoreError::NotFound(format!("store '{name}' not found")));
        };
        let _ = std::fs::remove_dir_all(self.config.store_dir(name));
        let _ = std::fs::remove_dir_all(self.config.queue_dir(name));
        Ok(())
    }

    /// `List() -> []Store`.
    pub fn list(&self) -> Vec<StoreMeta> {
        self.stores.iter().map(|e| e.value().meta.read().unwrap_or_else(|p| p.into_inner()).clone()).collect()
    }

    pub fn get(&self, name: &str) -> CoreResult<Arc<StoreHandle>> {
        self.stores.get(name).map(|e| e.value().clone()).ok_or_else(|| CoreError::NotFound(format!("store '{name}' not found")))
    }

    /// `Stats(name) -> {doc_count, chunk_count, total_size, last_indexed}`.
    pub fn stats(&self, name: &str) -> CoreResult<StoreStats> {
        Ok(self.get(name)?.stats())
    }

    /// `Touch(name)`: bump `updated_at` and persist it to `meta.json`.
    pub fn touch(&self, name: &str) -> CoreResult<()> {
        let handle = self.get(name)?;
        let meta = {
            let mut guard = handle.meta.write().unwrap_or_else(|p| p.into_inner());
            guard.updated_at = chrono::Utc::now();
            guard.clone()
        };
        persist_meta(&self.config.store_dir(name), &meta)
    }

    pub fn store_count(&self) -> usize {
        self.stores.len()
    }

    pub fn default_store_name() -> &'static str {
        DEFAULT_STORE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct StubEmbedder;

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.0; 4]).collect())
        }
        fn dimension(&self) -> usize {
            4
        }
    }

    fn manager(data_root: std::path::PathBuf) -> StoreManager {
        let config = CoreConfig { data_root, ..Default::default() };
        StoreManager::new(config, Arc::new(StubEmbedder))
    }

    // `ensure`/`create` provision an embedding queue and a sparse write
    // queue, each of which spawns a background tokio task — these need an
    // active runtime even though the methods themselves are synchronous.
    #[tokio::test]
    async fn ensure_creates_store_on_first_call() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path().to_path_buf());
        let handle = mgr.ensure("default").unwrap();
        assert_eq!(handle.stats().doc_count, 0);
        assert_eq!(mgr.store_count(), 1);
    }

    #[tokio::test]
    async fn create_rejects_duplicate_names() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path().to_path_buf());
        mgr.create("demo", "Demo".into(), "".into(), None, None).unwrap();
        let result = mgr.create("demo", "Demo".into(), "".into(), None, None);
        assert!(matches!(result, Err(CoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn create_rejects_invalid_names() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path().to_path_buf());
        let result = mgr.create("bad name!", "".into(), "".into(), None, None);
        assert!(matches!(result, Err(CoreError::Validation(_))));
    }

    #[tokio::test]
    async fn delete_removes_store_from_registry() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path().to_path_buf());
        mgr.ensure("demo").unwrap();
        mgr.delete("demo").unwrap();
        assert!(matches!(mgr.get("demo"), Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_reflects_created_stores() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path().to_path_buf());
        mgr.ensure("a").unwrap();
        mgr.ensure("b").unwrap();
        let names: Vec<String> = mgr.list().into_iter().map(|m| m.name).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"a".to_string()));
        assert!(names.contains(&"b".to_string()));
    }

    #[tokio::test]
    async fn create_persists_meta_json_and_honors_chunk_overrides() {
        let dir = tempdir().unwrap();
        let data_root = dir.path().to_path_buf();
        let mgr = manager(data_root.clone());
        let handle = mgr.create("demo", "Demo Store".into(), "a description".into(), Some(500), Some(50)).unwrap();
        assert_eq!(handle.config.chunk_size, 500);
        assert_eq!(handle.config.chunk_overlap, 50);

        let meta_path = mgr.config.store_dir("demo").join("meta.json");
        assert!(meta_path.exists());

        // A fresh manager (simulating a process restart) must reload the
        // persisted identity and chunking knobs instead of re-defaulting them.
        let mgr2 = manager(data_root);
        let reloaded = mgr2.ensure("demo").unwrap();
        assert_eq!(reloaded.meta.read().unwrap().display_name, "Demo Store");
        assert_eq!(reloaded.meta.read().unwrap().description, "a description");
        assert_eq!(reloaded.config.chunk_size, 500);
        assert_eq!(reloaded.config.chunk_overlap, 50);
    }
}
