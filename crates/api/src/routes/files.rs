use axum::extract::{Query, State};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use delta::codec::DeltaPayload;
use fingerprint::FileFingerprint;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Deserialize)]
pub(crate) struct PathQuery {
    path: String,
}

/// `GET /api/v1/files?path=`
#[instrument(skip(state), fields(path = %query.path))]
pub(crate) async fn list(State(state): State<AppState>, Query(query): Query<PathQuery>) -> AppResult<Json<Vec<fileservice::DirEntry>>> {
    let entries = state.files.list(&query.path).await?;
    Ok(Json(entries))
}

#[derive(Serialize)]
pub(crate) struct ReadContentResponse {
    content: String,
    last_modified: DateTime<Utc>,
    whole_digest: String,
    fingerprint: FileFingerprint,
}

/// `GET /api/v1/files/content?path=`
#[instrument(skip(state), fields(path = %query.path))]
pub(crate) async fn read_content(State(state): State<AppState>, Query(query): Query<PathQuery>) -> AppResult<Json<ReadContentResponse>> {
    let outcome = state.files.read(&query.path).await?;
    Ok(Json(ReadContentResponse {
        content: BASE64.encode(&outcome.bytes),
        last_modified: outcome.last_modified,
        whole_digest: outcome.whole_digest,
        fingerprint: outcome.fingerprint,
    }))
}

#[derive(Deserialize)]
pub(crate) struct WriteContentRequest {
    path: String,
    content: String,
    #[serde(default)]
    checksum: Option<String>,
}

/// `PUT /api/v1/files/content`
#[instrument(skip(state, request), fields(path = %request.path))]
pub(crate) async fn write_content(State(state): State<AppState>, Json(request): Json<WriteContentRequest>) -> AppResult<Json<FileFingerprint>> {
    let bytes = BASE64
        .decode(&request.content)
        .map_err(|source| AppError::BadRequest(format!("invalid base64 content: {source}")))?;
    let fingerprint = state.files.write_full(&request.path, bytes, request.checksum.as_deref()).await?;
    Ok(Json(fingerprint))
}

#[derive(Deserialize)]
pub(crate) struct DeltaRequest {
    path: String,
    payload: DeltaPayload,
}

/// `PUT /api/v1/files/delta`
#[instrument(skip(state, request), fields(path = %request.path))]
pub(crate) async fn apply_delta(State(state): State<AppState>, Json(request): Json<DeltaRequest>) -> AppResult<Json<FileFingerprint>> {
    let plan = delta::codec::decode(&request.payload)?;
    let fingerprint = state.files.apply_delta(&request.path, plan).await?;
    Ok(Json(fingerprint))
}

#[derive(Deserialize)]
pub(crate) struct BatchRequestItem {
    path: String,
    payload: DeltaPayload,
}

#[derive(Deserialize)]
pub(crate) struct BatchRequest {
    items: Vec<BatchRequestItem>,
}

#[derive(Serialize)]
pub(crate) struct BatchResponse {
    items: Vec<fileservice::BatchOutcome>,
}

/// Shared body for `POST /api/v1/files/sync` and `POST
/// /api/v1/files/delta_sync`: the request shape is identical either way, the
/// client just chooses which endpoint to hit based on its own capability
/// negotiation.
#[instrument(skip(state, request), fields(items = request.items.len()))]
pub(crate) async fn batch_sync(State(state): State<AppState>, Json(request): Json<BatchRequest>) -> Json<BatchResponse> {
    let mut decoded = Vec::with_capacity(request.items.len());
    let mut outcomes = Vec::new();

    for item in request.items {
        match delta::codec::decode(&item.payload) {
            Ok(plan) => decoded.push((item.path, plan)),
            Err(source) => outcomes.push(fileservice::BatchOutcome {
                path: item.path,
                fingerprint: None,
                error: Some(source.to_string()),
            }),
        }
    }

    outcomes.extend(state.files.batch_sync(decoded).await);
    Json(BatchResponse { items: outcomes })
}

#[derive(Deserialize)]
pub(crate) struct MkdirRequest {
    path: String,
}

/// `POST /api/v1/files/mkdir`
#[instrument(skip(state, request), fields(path = %request.path))]
pub(crate) async fn mkdir(State(state): State<AppState>, Json(request): Json<MkdirRequest>) -> AppResult<()> {
    state.files.mkdir(&request.path).await?;
    Ok(())
}
