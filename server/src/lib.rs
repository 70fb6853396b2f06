//! Library half of the `hybridsearch` binary: shared app state and route
//! handlers. `main.rs` is the thin CLI shell over this crate, mirroring the
//! teacher's `main.rs`-over-`lib.rs` split.

pub mod api;
pub mod ws;

use hybridsearch_core::embed::{Embedder, Reranker};
use hybridsearch_core::store::StoreManager;
use std::sync::Arc;
use std::time::Duration;

/// Shared state handed to every axum route (spec.md §4.12, §6.1).
pub struct AppContext {
    pub store_manager: Arc<StoreManager>,
    pub embedder: Arc<dyn Embedder>,
    pub reranker: Arc<dyn Reranker>,
    pub batch_size: usize,
    pub batch_idle: Duration,
    pub start_time: std::time::Instant,
}
