//! `hybridsearch` binary — thin CLI shell over the [`hybridsearch_server`] library crate.

use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use hybridsearch_core::config::CoreConfig;
use hybridsearch_core::embed::{Embedder, PassthroughReranker, Reranker};
use hybridsearch_core::store::StoreManager;
use hybridsearch_server::{api, ws, AppContext};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Multi-tenant hybrid code-search server: sparse (BM25) + dense (vector)
/// retrieval, fused and reranked, behind an HTTP + streaming interface.
#[derive(Parser)]
#[command(name = "hybridsearch", version, about, long_about = None)]
struct Cli {
    /// Base directory for all persistent state (overrides DATA_ROOT).
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Port to listen on (overrides PORT; auto-selects if unset).
    #[arg(long)]
    port: Option<u16>,

    /// Bind to 0.0.0.0 instead of 127.0.0.1.
    #[arg(long)]
    bind_all: bool,

    /// Files per connection before a batch is flushed to the indexer.
    #[arg(long, default_value_t = 50)]
    batch_size: usize,

    /// Milliseconds of inactivity before a partial batch is flushed anyway.
    #[arg(long, default_value_t = 500)]
    batch_idle_ms: u64,
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C, shutting down...");
    }
}

fn build_embedder(_cfg: &CoreConfig) -> Arc<dyn Embedder> {
    #[cfg(feature = "fastembed")]
    {
        match hybridsearch_core::embed::FastEmbedEmbedder::new(_cfg.model_embed_dim) {
            Ok(embedder) => return Arc::new(embedder),
            Err(e) => {
                error!(error = %e, "failed to load local embedding model, falling back is not possible without an embedder");
                std::process::exit(1);
            }
        }
    }
    #[cfg(not(feature = "fastembed"))]
    {
        error!("no embedder backend compiled in — rebuild with the `fastembed` feature or point VECTOR_DB_URL at a remote one");
        std::process::exit(1);
    }
}

fn build_reranker(cfg: &CoreConfig) -> Arc<dyn Reranker> {
    match &cfg.vector_db_url {
        Some(_) => Arc::new(PassthroughReranker),
        None => Arc::new(PassthroughReranker),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("hybridsearch=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = CoreConfig::from_env();
    if let Some(root) = cli.data_root {
        config.data_root = root;
    }

    let embedder = build_embedder(&config);
    if embedder.dimension() != config.model_embed_dim {
        error!(
            expected = config.model_embed_dim,
            actual = embedder.dimension(),
            "embedder dimensionality does not match MODEL_EMBED_DIM"
        );
        std::process::exit(1);
    }
    let reranker = build_reranker(&config);

    let store_manager = Arc::new(StoreManager::new(config, embedder.clone()));
    if let Err(e) = store_manager.ensure(StoreManager::default_store_name()) {
        error!(error = %e, "failed to provision default store");
        std::process::exit(1);
    }

    let ctx = Arc::new(AppContext {
        store_manager,
        embedder,
        reranker,
        batch_size: cli.batch_size,
        batch_idle: Duration::from_millis(cli.batch_idle_ms),
        start_time: std::time::Instant::now(),
    });

    let app = Router::new()
        .route("/health", get(api::health))
        .route("/stores", get(api::list_stores))
        .route("/stores/{store}/files", post(api::index_files))
        .route("/stores/{store}/search", post(api::search))
        .route("/stores/{store}/stats", get(api::stats))
        .route("/ws/{store}", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(ctx);

    let bind_addr = if cli.bind_all { "0.0.0.0" } else { "127.0.0.1" };
    let explicit_port = cli.port.or_else(|| std::env::var("PORT").ok().and_then(|p| p.parse().ok()));

    let listener = if let Some(port) = explicit_port {
        tokio::net::TcpListener::bind(format!("{bind_addr}:{port}")).await.unwrap_or_else(|e| {
            error!(port = port, error = %e, "could not bind to port");
            std::process::exit(1);
        })
    } else {
        const BASE: u16 = 8732;
        const RANGE: u16 = 10;
        let mut found = None;
        for port in BASE..BASE + RANGE {
            if let Ok(l) = tokio::net::TcpListener::bind(format!("{bind_addr}:{port}")).await {
                found = Some(l);
                break;
            }
        }
        found.unwrap_or_else(|| {
            error!(range_start = BASE, range_end = BASE + RANGE - 1, "no free port found");
            std::process::exit(1);
        })
    };

    let port = listener.local_addr().unwrap().port();
    info!(port = port, "http://{bind_addr}:{port}");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await.unwrap();
}
