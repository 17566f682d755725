use axum::extract::{Path, State};
use axum::Json;
use exec::{CommandRequest, CommandState, CommandStatus};
use serde::Serialize;
use tracing::instrument;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Serialize)]
pub(crate) struct SubmitResponse {
    command_id: String,
}

/// `POST /api/v1/commands`
#[instrument(skip(state, request), fields(command = %request.command))]
pub(crate) async fn submit(State(state): State<AppState>, Json(mut request): Json<CommandRequest>) -> Json<SubmitResponse> {
    if request.timeout_seconds.is_none() {
        request.timeout_seconds = Some(state.default_command_timeout_seconds);
    }
    let command_id = state.commands.submit(request).await;
    Json(SubmitResponse { command_id })
}

/// `GET /api/v1/commands/{id}`
#[instrument(skip(state))]
pub(crate) async fn status(State(state): State<AppState>, Path(command_id): Path<String>) -> AppResult<Json<CommandStatus>> {
    state
        .commands
        .status(&command_id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::UnknownCommand(command_id))
}

#[derive(Serialize)]
pub(crate) struct OutputResponse {
    output: String,
    is_complete: bool,
}

/// `GET /api/v1/commands/{id}/output`
#[instrument(skip(state))]
pub(crate) async fn output(State(state): State<AppState>, Path(command_id): Path<String>) -> AppResult<Json<OutputResponse>> {
    let status = state
        .commands
        .status(&command_id)
        .await
        .ok_or_else(|| AppError::UnknownCommand(command_id))?;
    let is_complete = matches!(status.state, CommandState::Completed | CommandState::Failed | CommandState::Timeout);
    Ok(Json(OutputResponse {
        output: status.output,
        is_complete,
    }))
}
