#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `sync_http_api` is the HTTP and WebSocket surface over the file-sync,
//! patch-sync, and command-execution cores: one [`axum::Router`] exposing the
//! endpoint table under `/api/v1` plus the `/ws` push channel.
//!
//! # Design
//!
//! Handlers hold no business logic beyond request decoding, calling the
//! relevant core operation, and translating the result (or [`error::AppError`])
//! into an HTTP response; the actual sync, patch, and execution semantics
//! live in the `fileservice`, `patchsync`, and `exec` crates this one wires
//! together. [`ServerConfig::from_env`] reads the handful of environment
//! variables the server binary exposes.
//!
//! # Errors
//!
//! See [`error::AppError`] for the HTTP status mapping of every failure a
//! handler can produce.
//!
//! # See also
//!
//! - [`fileservice`], [`patchsync`], [`exec`] for the cores this crate
//!   exposes.
//! - [`notify_bus`] for the events forwarded over `/ws`.

mod error;
mod routes;
mod state;
mod ws;

use std::path::PathBuf;

use axum::routing::{get, post, put};
use axum::Router;

pub use error::{AppError, AppResult};
pub use state::AppState;

/// Runtime configuration for the server binary, read from the environment
/// per the ambient configuration convention this workspace follows.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind: String,
    /// Workspace directory this server synchronises.
    pub workspace: PathBuf,
    /// Path to the server-side fingerprint cache file.
    pub cache_file: PathBuf,
    /// Default command timeout, in seconds, when a submission omits one.
    pub command_timeout_seconds: u64,
}

impl ServerConfig {
    /// Reads configuration from `SYNC_HTTP_BIND`, `SYNC_HTTP_WORKSPACE`,
    /// `SYNC_HTTP_CACHE_FILE`, and `SYNC_HTTP_COMMAND_TIMEOUT_SECS`, falling
    /// back to their documented defaults when unset.
    #[must_use]
    pub fn from_env() -> Self {
        let workspace = std::env::var("SYNC_HTTP_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let cache_file = std::env::var("SYNC_HTTP_CACHE_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| workspace.join(".sync_http_cache.json"));

        Self {
            bind: std::env::var("SYNC_HTTP_BIND").unwrap_or_else(|_| "127.0.0.1:7878".to_owned()),
            workspace,
            cache_file,
            command_timeout_seconds: std::env::var("SYNC_HTTP_COMMAND_TIMEOUT_SECS")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(30),
        }
    }
}

/// Builds the full application router over `state`.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(routes::capabilities::root))
        .route("/api/v1/files", get(routes::files::list))
        .route("/api/v1/files/content", get(routes::files::read_content).put(routes::files::write_content))
        .route("/api/v1/files/delta", put(routes::files::apply_delta))
        .route("/api/v1/files/sync", post(routes::files::batch_sync))
        .route("/api/v1/files/delta_sync", post(routes::files::batch_sync))
        .route("/api/v1/files/mkdir", post(routes::files::mkdir))
        .route("/api/v1/sync/init", post(routes::sync::init))
        .route("/api/v1/sync/patch", post(routes::sync::apply_patch))
        .route("/api/v1/sync/status", get(routes::sync::status))
        .route("/api/v1/sync/conflicts", get(routes::sync::conflicts))
        .route("/api/v1/sync/resolve", post(routes::sync::resolve))
        .route("/api/v1/sync/clean", post(routes::sync::clean))
        .route("/api/v1/commands", post(routes::commands::submit))
        .route("/api/v1/commands/{id}", get(routes::commands::status))
        .route("/api/v1/commands/{id}/output", get(routes::commands::output))
        .route("/ws", get(ws::handler))
        .with_state(state)
}

/// Builds application state from `config` and serves it until the process is
/// signalled to stop.
///
/// # Errors
///
/// Returns [`AppError::FileService`] if the workspace's fingerprint cache
/// exists but cannot be parsed, or an I/O error if the listener cannot bind.
pub async fn serve(config: ServerConfig) -> AppResult<()> {
    let state = AppState::new(config.workspace.clone(), config.cache_file.clone(), config.command_timeout_seconds)?;
    let app = router(state);

    tracing::info!(bind = %config.bind, workspace = %config.workspace.display(), "starting sync-http server");
    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
