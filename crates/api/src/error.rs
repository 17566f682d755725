use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Every failure a handler can produce, translated to one HTTP status and a
/// `{error, message}` JSON body by [`IntoResponse`].
#[derive(Debug, Error)]
pub enum AppError {
    /// Any failure from the file-service core.
    #[error(transparent)]
    FileService(#[from] fileservice::Error),
    /// Any failure from the patch-sync core.
    #[error(transparent)]
    PatchSync(#[from] patchsync::Error),
    /// A delta payload could not be decoded.
    #[error("failed to decode delta payload: {0}")]
    Decode(#[from] delta::codec::DecodeError),
    /// A request body failed to parse or failed basic validation.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// A `{id}` path parameter did not name a known command.
    #[error("unknown command id: {0}")]
    UnknownCommand(String),
    /// The HTTP listener failed to bind, or the accept loop ended abnormally.
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::FileService(source) => file_service_status(source),
            AppError::PatchSync(source) => patch_sync_status(source),
            AppError::Decode(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::UnknownCommand(_) => StatusCode::NOT_FOUND,
            AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            AppError::FileService(source) => file_service_code(source),
            AppError::PatchSync(source) => patch_sync_code(source),
            AppError::Decode(_) => "DECODE_ERROR",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::UnknownCommand(_) => "NOT_FOUND",
            AppError::Io(_) => "IO_ERROR",
        }
    }
}

fn file_service_status(source: &fileservice::Error) -> StatusCode {
    match source {
        fileservice::Error::NotFound(_) => StatusCode::NOT_FOUND,
        fileservice::Error::NotADirectory(_) | fileservice::Error::IsDirectory(_) => StatusCode::BAD_REQUEST,
        fileservice::Error::ChecksumMismatch { .. } | fileservice::Error::NoBase(_) | fileservice::Error::ShrinkingDelta(_) => {
            StatusCode::CONFLICT
        }
        fileservice::Error::Io { .. } | fileservice::Error::Fingerprint(_) | fileservice::Error::Cache(_) | fileservice::Error::Join(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn file_service_code(source: &fileservice::Error) -> &'static str {
    match source {
        fileservice::Error::NotFound(_) => "NOT_FOUND",
        fileservice::Error::NotADirectory(_) => "NOT_A_DIRECTORY",
        fileservice::Error::IsDirectory(_) => "IS_DIRECTORY",
        fileservice::Error::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
        fileservice::Error::NoBase(_) => "NO_BASE",
        fileservice::Error::ShrinkingDelta(_) => "SHRINKING_DELTA",
        fileservice::Error::Io { .. } => "IO_ERROR",
        fileservice::Error::Fingerprint(_) => "FINGERPRINT_ERROR",
        fileservice::Error::Cache(_) => "CACHE_ERROR",
        fileservice::Error::Join(_) => "JOIN_ERROR",
    }
}

fn patch_sync_status(source: &patchsync::Error) -> StatusCode {
    match source {
        patchsync::Error::DirtyTree | patchsync::Error::UnknownBase(_) => StatusCode::CONFLICT,
        patchsync::Error::Io { .. } | patchsync::Error::Spawn(_) | patchsync::Error::GitFailed { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn patch_sync_code(source: &patchsync::Error) -> &'static str {
    match source {
        patchsync::Error::DirtyTree => "DIRTY_TREE",
        patchsync::Error::UnknownBase(_) => "UNKNOWN_BASE",
        patchsync::Error::Io { .. } => "IO_ERROR",
        patchsync::Error::Spawn(_) => "SPAWN_ERROR",
        patchsync::Error::GitFailed { .. } => "GIT_FAILED",
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            error: self.error_code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Handler return-type alias used throughout `routes`.
pub type AppResult<T> = Result<T, AppError>;

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.to_string())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::BadRequest(rejection.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let error = AppError::FileService(fileservice::Error::NotFound("a.txt".to_owned()));
        assert_eq!(error.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(error.error_code(), "NOT_FOUND");
    }

    #[test]
    fn checksum_mismatch_maps_to_409() {
        let error = AppError::FileService(fileservice::Error::ChecksumMismatch {
            path: "a.txt".to_owned(),
            expected: "aaa".to_owned(),
            actual: "bbb".to_owned(),
        });
        assert_eq!(error.status_code(), StatusCode::CONFLICT);
        assert_eq!(error.error_code(), "CHECKSUM_MISMATCH");
    }

    #[test]
    fn dirty_tree_maps_to_409() {
        let error = AppError::PatchSync(patchsync::Error::DirtyTree);
        assert_eq!(error.status_code(), StatusCode::CONFLICT);
        assert_eq!(error.error_code(), "DIRTY_TREE");
    }

    #[test]
    fn unknown_command_maps_to_404() {
        let error = AppError::UnknownCommand("missing-id".to_owned());
        assert_eq!(error.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(error.error_code(), "NOT_FOUND");
    }

    #[test]
    fn error_body_renders_the_display_message() {
        let error = AppError::BadRequest("bad path".to_owned());
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
