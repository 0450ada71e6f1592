//! Shared cache authority backed by a directory on disk.
//!
//! Run with: cargo run -p authority-server
//!
//! Clients connect to `ws://<bind>/ws`. Settings come from the environment:
//! `SHARED_CACHE_ROOT`, `SHARED_CACHE_BIND` and
//! `SHARED_CACHE_CALLBACK_TIMEOUT_MS`.

use std::sync::Arc;

use anyhow::Context;
use axum::{Json, Router, extract::State, routing::get};
use shared_cache_authority::{ClientDirectory, Coordinator, FileSnapshot};
use shared_cache_core::AuthorityConfig;
use shared_cache_store::FsStore;
use shared_cache_transport::create_authority_router;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type Authority = Arc<Coordinator<FsStore>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = AuthorityConfig::from_env();
    let addr = config.bind_addr;
    tracing::info!(
        root = %config.store_root.display(),
        timeout = ?config.callback_timeout,
        "Starting authority"
    );

    let authority: Authority = Arc::new(Coordinator::from_config(ClientDirectory::new(), config));

    // Build router
    let app = Router::new()
        .route("/files", get(files_handler))
        .with_state(Arc::clone(&authority))
        .merge(create_authority_router(authority))
        .layer(TraceLayer::new_for_http());

    // Start server
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("Authority listening on ws://{addr}/ws");

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

/// State of every tracked file, for inspection.
async fn files_handler(State(authority): State<Authority>) -> Json<Vec<FileSnapshot>> {
    let mut snapshots = Vec::new();
    for name in authority.tracked_files().await {
        if let Some(snapshot) = authority.snapshot(&name).await {
            snapshots.push(snapshot);
        }
    }
    Json(snapshots)
}
