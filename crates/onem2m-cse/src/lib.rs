//! oneM2M CSE binary: configuration loading, logging, process wiring and a
//! minimal health/readiness surface around a running [`CseContext`].
//!
//! Generic over the `Store` backend the same way `CseContext` is; `run`
//! picks the concrete backend from configuration and hands off to
//! [`serve`], which is monomorphized per backend.

pub mod cli;
pub mod settings;
pub mod transport;

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use onem2m_common::{CseConfig, StorageBackend};
use onem2m_core::context::CseContext;
use onem2m_core::store::Store;
use onem2m_storage_document::DocumentStore;
use onem2m_storage_memory::MemoryStore;
use serde_json::{json, Value};
use tracing::info;

use crate::transport::{LoggingAnnouncementSender, LoggingNotificationSender};

/// Install a `tracing-subscriber` `fmt` layer filtered by `config.logging`.
/// Returns an error rather than panicking so `main` can decide how to report it.
pub fn setup_tracing(config: &CseConfig) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.logging.filter)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.json {
        subscriber.json().try_init()
    } else {
        subscriber.try_init()
    }
    .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

/// Build the storage backend named by `config.storage.backend` and run the
/// CSE to completion (until a shutdown signal arrives).
pub async fn run(config: CseConfig, listen_addr: SocketAddr) -> Result<()> {
    match config.storage.backend {
        StorageBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            serve(store, config, listen_addr).await
        }
        StorageBackend::Document => {
            std::fs::create_dir_all(&config.storage.data_dir)
                .context("creating storage data directory")?;
            let db_path = format!("{}/onem2m.sqlite3", config.storage.data_dir.trim_end_matches('/'));
            let store = Arc::new(DocumentStore::open(&db_path).map_err(|e| anyhow::anyhow!(e.to_string()))?);
            serve(store, config, listen_addr).await
        }
    }
}

/// Wire a `CseContext` over `store`, start the expiration sweep, and serve
/// the health/readiness HTTP surface until shutdown.
async fn serve<S: Store + 'static>(
    store: Arc<S>,
    config: CseConfig,
    listen_addr: SocketAddr,
) -> Result<()> {
    let context = CseContext::new(
        store,
        config,
        Arc::new(LoggingNotificationSender),
        Arc::new(LoggingAnnouncementSender),
    );
    context.start_expiration_sweep();

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz::<S>))
        .with_state(context);

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    info!(%listen_addr, "CSE listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("axum server exited with an error")?;

    Ok(())
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn readyz<S: Store + 'static>(State(context): State<Arc<CseContext<S>>>) -> Json<Value> {
    let ready = context
        .store
        .get_stat("requests")
        .await
        .is_ok();
    Json(json!({ "ready": ready }))
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C handler");
    info!("shutdown signal received");
}

/// Parse `host:port` (falling back to the config defaults) into a `SocketAddr`.
pub fn listen_address(config: &CseConfig) -> Result<SocketAddr> {
    SocketAddr::from_str(&format!("{}:{}", config.cse.listen_host, config.cse.listen_port))
        .context("parsing listen address")
}
