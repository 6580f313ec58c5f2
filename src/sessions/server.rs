use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use super::api::{self, AppState};
use super::backend::Drivers;
use super::db::{DbHandle, SessionDb};
use super::events::EventBus;
use super::manager::{ManagerSettings, SessionManager};
use super::registry::Registry;
use super::ws;

/// Configuration for the session server.
pub struct ServerConfig {
    pub port: u16,
    pub host: Option<String>,
    pub db_path: PathBuf,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3141,
            host: None,
            db_path: PathBuf::from(".harbor/harbor.db"),
            dev_mode: false,
        }
    }
}

impl ServerConfig {
    /// Explicit host, else all interfaces in dev mode and loopback otherwise.
    pub fn bind_host(&self) -> &str {
        match &self.host {
            Some(host) => host,
            None if self.dev_mode => "0.0.0.0",
            None => "127.0.0.1",
        }
    }
}

/// Build the full application router: REST API plus both websockets.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .route("/ws/console/{id}", get(ws::console_handler))
        .route("/ws/events", get(ws::events_handler))
        .with_state(state)
}

/// Open the database and assemble the manager over it.
pub fn open_manager(
    db_path: &std::path::Path,
    drivers: Drivers,
    settings: ManagerSettings,
) -> Result<Arc<SessionManager>> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = SessionDb::new(db_path).context("Failed to initialize session database")?;
    let registry = Arc::new(Registry::new(DbHandle::new(db), EventBus::new()));
    Ok(SessionManager::new(registry, drivers, settings))
}

/// Start the session server and its background loops.
pub async fn start_server(
    config: ServerConfig,
    drivers: Drivers,
    settings: ManagerSettings,
) -> Result<()> {
    if drivers.is_empty() {
        anyhow::bail!("No execution backend is enabled. Enable docker or kubernetes in .harbor/harbor.toml");
    }
    let kinds: Vec<&str> = drivers.kinds().iter().map(|k| k.as_str()).collect();
    let manager = open_manager(&config.db_path, drivers, settings)?;

    let failed = manager
        .reconcile()
        .await
        .context("Failed to reconcile sessions")?;
    if failed > 0 {
        tracing::warn!(failed, "sessions marked failed during startup reconciliation");
    }

    let background = CancellationToken::new();
    let tasks = manager.start(background.clone());

    let mut app = build_router(Arc::new(AppState {
        manager: manager.clone(),
    }));
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.bind_host(), config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, backends = ?kinds, "harbor server listening");
    println!("Harbor running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    background.cancel();
    manager.shutdown().await;
    for task in tasks {
        let _ = task.await;
    }
    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
