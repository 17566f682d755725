use axum::extract::State;
use axum::Json;
use serde::Serialize;
use tracing::instrument;

use crate::state::AppState;

#[derive(Serialize)]
pub(crate) struct Capabilities {
    name: &'static str,
    version: &'static str,
    delta_sync_supported: bool,
    git_sync_supported: bool,
}

/// `GET /` — advertises what this server supports so clients can degrade
/// gracefully rather than probing endpoints one by one.
#[instrument(skip_all)]
pub(crate) async fn root(State(_state): State<AppState>) -> Json<Capabilities> {
    Json(Capabilities {
        name: "sync-http-server",
        version: env!("CARGO_PKG_VERSION"),
        delta_sync_supported: true,
        git_sync_supported: true,
    })
}
