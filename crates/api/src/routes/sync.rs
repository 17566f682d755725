use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use patchsync::{ApplyOutcome, ConflictEntry, PatchBundle, Resolution, SyncStatus};
use serde::Deserialize;
use tracing::instrument;

use crate::error::AppResult;
use crate::state::AppState;

#[derive(Deserialize)]
pub(crate) struct InitRequest {
    #[serde(default)]
    force: bool,
}

/// `POST /api/v1/sync/init`
#[instrument(skip(state))]
pub(crate) async fn init(State(state): State<AppState>, Json(request): Json<InitRequest>) -> AppResult<()> {
    state.patch_sync.init(request.force).await?;
    Ok(())
}

/// `POST /api/v1/sync/patch` — applies a bundle; a non-clean apply surfaces as
/// `409 Conflict` carrying the outstanding [`ConflictEntry`] list rather than
/// an error, since the patch itself was handled successfully.
#[instrument(skip(state, bundle), fields(base_commit = %bundle.base_commit))]
pub(crate) async fn apply_patch(State(state): State<AppState>, Json(bundle): Json<PatchBundle>) -> AppResult<Response> {
    let outcome = state.patch_sync.apply_bundle(&bundle).await?;
    let status = match outcome {
        ApplyOutcome::Applied { .. } => StatusCode::OK,
        ApplyOutcome::Conflicts(_) => StatusCode::CONFLICT,
    };
    Ok((status, Json(outcome)).into_response())
}

/// `GET /api/v1/sync/status`
#[instrument(skip(state))]
pub(crate) async fn status(State(state): State<AppState>) -> AppResult<Json<SyncStatus>> {
    Ok(Json(state.patch_sync.status().await?))
}

/// `GET /api/v1/sync/conflicts`
#[instrument(skip(state))]
pub(crate) async fn conflicts(State(state): State<AppState>) -> Json<Vec<ConflictEntry>> {
    Json(state.patch_sync.conflicts())
}

#[derive(Deserialize)]
pub(crate) struct ResolveRequest {
    resolutions: Vec<Resolution>,
}

/// `POST /api/v1/sync/resolve`
#[instrument(skip(state, request), fields(count = request.resolutions.len()))]
pub(crate) async fn resolve(State(state): State<AppState>, Json(request): Json<ResolveRequest>) -> AppResult<Response> {
    let outcome = state.patch_sync.resolve(request.resolutions).await?;
    let status = if outcome.remaining_conflicts.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    Ok((status, Json(outcome)).into_response())
}

/// `POST /api/v1/sync/clean`
#[instrument(skip(state))]
pub(crate) async fn clean(State(state): State<AppState>) -> AppResult<()> {
    state.patch_sync.clean().await?;
    Ok(())
}
