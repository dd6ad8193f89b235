//! Request error taxonomy and HTTP response mapping.

use axum::Json;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::fmt;
use std::io;

/// Everything that can go wrong while serving a listing or an upload.
///
/// Per-request errors only; none of these aborts the process. Configuration
/// problems surface as [`ConfigError`] during startup instead.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    DirectoryNotFound,
    NotADirectory,
    UploadsDisabled,
    DirectoryNotUploadable,
    RuleNotFound,
    MissingFile,
    SizeExceeded { limit: u64 },
    ExtensionNotAllowed { extension: String },
    ValidatorNotConfigured { name: String },
    ValidationFailed { reason: String },
    DestinationConflict { name: String },
    StagingIo(io::Error),
    CommitIo(io::Error),
    Internal(io::Error),
    TooManyRequests { retry_after: u64 },
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::BadRequest(msg) => f.write_str(msg),
            ApiError::DirectoryNotFound => write!(f, "directory not found"),
            ApiError::NotADirectory => write!(f, "path is not a directory"),
            ApiError::UploadsDisabled => write!(f, "uploads are disabled"),
            ApiError::DirectoryNotUploadable => {
                write!(f, "uploads are not allowed to this directory")
            }
            ApiError::RuleNotFound => write!(f, "no upload rule for this directory"),
            ApiError::MissingFile => write!(f, "no file was uploaded"),
            ApiError::SizeExceeded { limit } => {
                write!(f, "file exceeds size limit of {limit} bytes")
            }
            ApiError::ExtensionNotAllowed { extension } => {
                write!(f, "file extension {extension:?} is not allowed")
            }
            ApiError::ValidatorNotConfigured { name } => {
                write!(f, "validator {name:?} is not configured")
            }
            ApiError::ValidationFailed { reason } => write!(f, "file rejected: {reason}"),
            ApiError::DestinationConflict { name } => {
                write!(f, "a file named {name:?} already exists")
            }
            ApiError::StagingIo(err) => write!(f, "staging failed: {err}"),
            ApiError::CommitIo(err) => write!(f, "commit failed: {err}"),
            ApiError::Internal(err) => write!(f, "internal error: {err}"),
            ApiError::TooManyRequests { .. } => write!(f, "too many upload requests"),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::DirectoryNotFound | ApiError::RuleNotFound => StatusCode::NOT_FOUND,
            ApiError::UploadsDisabled | ApiError::DirectoryNotUploadable => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_)
            | ApiError::NotADirectory
            | ApiError::MissingFile
            | ApiError::SizeExceeded { .. }
            | ApiError::ExtensionNotAllowed { .. }
            | ApiError::ValidationFailed { .. }
            | ApiError::DestinationConflict { .. } => StatusCode::BAD_REQUEST,
            ApiError::ValidatorNotConfigured { .. }
            | ApiError::StagingIo(_)
            | ApiError::CommitIo(_)
            | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
        };

        let mut headers = HeaderMap::new();
        if let ApiError::TooManyRequests { retry_after } = &self
            && *retry_after > 0
            && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert(header::RETRY_AFTER, value);
        }

        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, headers, Json(body)).into_response()
    }
}

/// Startup configuration failures. All of these are fatal.
#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Parse(serde_json::Error),
    InvalidSize { directory: String, value: String },
    UnknownValidator { directory: String, name: String },
    ReservedDirectory { directory: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "cannot read upload rules: {err}"),
            ConfigError::Parse(err) => write!(f, "cannot parse upload rules: {err}"),
            ConfigError::InvalidSize { directory, value } => {
                write!(f, "invalid max file size {value:?} for {directory:?}")
            }
            ConfigError::UnknownValidator { directory, name } => {
                write!(f, "unknown validator {name:?} for {directory:?}")
            }
            ConfigError::ReservedDirectory { directory } => {
                write!(
                    f,
                    "upload rule {directory:?} targets the reserved staging area"
                )
            }
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err)
    }
}
