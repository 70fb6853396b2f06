//! Process-wide configuration, read once from the environment variables
//! enumerated in spec.md §6.3. No config-file layer is introduced — the
//! feature surface for flexible configuration loading is explicitly out of
//! scope; this is the minimum a runnable binary needs.

use std::path::PathBuf;

/// Per-store chunking/queue knobs. Defaults come from [`CoreConfig`] but may
/// be overridden per store at creation time (spec.md §3, StoreConfig).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub embed_batch_size: usize,
    pub max_queued_chunks: usize,
    pub embed_workers: usize,
    pub max_file_size_mb: u64,
}

impl StoreConfig {
    /// Builds a per-store config from process defaults plus this store's own
    /// chunk size/overlap (spec.md §3: `Store` carries its own chunking
    /// knobs distinct from every other store).
    pub fn from_core(cfg: &CoreConfig, chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
            embed_batch_size: cfg.embed_batch_size,
            max_queued_chunks: cfg.embed_queue_max,
            embed_workers: cfg.embed_workers,
            max_file_size_mb: cfg.max_file_size_mb,
        }
    }
}

/// Default chunk size (bytes) for a store whose creator didn't override it.
pub const DEFAULT_CHUNK_SIZE: usize = 2000;
/// Default chunk overlap (bytes) for a store whose creator didn't override it.
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Process-wide configuration assembled from environment variables at
/// startup. Mirrors the `DATA_ROOT`/`MAX_FILE_SIZE_MB`/... table in
/// spec.md §6.3 exactly; CLI flags in the `server` binary may override
/// individual fields after construction.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub data_root: PathBuf,
    pub max_file_size_mb: u64,
    pub max_file_count: usize,
    pub embed_batch_size: usize,
    pub rerank_batch_size: usize,
    pub embed_queue_max: usize,
    pub embed_workers: usize,
    pub model_embed_dim: usize,
    pub vector_db_url: Option<String>,
    pub vector_db_api_key: Option<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            max_file_size_mb: 5,
            max_file_count: 10_000,
            embed_batch_size: 32,
            rerank_batch_size: 16,
            embed_queue_max: 100_000,
            embed_workers: 1,
            model_embed_dim: 384,
            vector_db_url: None,
            vector_db_api_key: None,
        }
    }
}

impl CoreConfig {
    /// Read `CoreConfig` from the environment, falling back to defaults for
    /// anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_root: std::env::var("DATA_ROOT").map(PathBuf::from).unwrap_or(defaults.data_root),
            max_file_size_mb: env_parse("MAX_FILE_SIZE_MB", defaults.max_file_size_mb),
            max_file_count: env_parse("MAX_FILE_COUNT", defaults.max_file_count),
            embed_batch_size: env_parse("EMBED_BATCH_SIZE", defaults.embed_batch_size),
            rerank_batch_size: env_parse("RERANK_BATCH_SIZE", defaults.rerank_batch_size),
            embed_queue_max: env_parse("EMBED_QUEUE_MAX", defaults.embed_queue_max),
            embed_workers: env_parse("EMBED_WORKERS", defaults.embed_workers),
            model_embed_dim: env_parse("MODEL_EMBED_DIM", defaults.model_embed_dim),
            vector_db_url: std::env::var("VECTOR_DB_URL").ok(),
            vector_db_api_key: std::env::var("VECTOR_DB_API_KEY").ok(),
        }
    }

    pub fn store_dir(&self, store: &str) -> PathBuf {
        self.data_root.join("stores").join(store)
    }

    pub fn queue_dir(&self, store: &str) -> PathBuf {
        self.data_root.join("queues").join(store)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
