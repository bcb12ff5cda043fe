//! Error types for the upload service.

use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Errors that can occur while receiving, extracting or deploying a bundle.
#[derive(Debug, Error)]
pub enum DeployError {
    // ─────────────────────────────────────────────────────────────────────────
    // Upload validation errors
    // ─────────────────────────────────────────────────────────────────────────
    /// The request body exceeded the upload ceiling.
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge {
        /// Maximum accepted size in bytes.
        limit: usize,
    },

    /// The request could not be parsed as a multipart form.
    #[error("invalid multipart form: {0}")]
    InvalidMultipart(String),

    /// The multipart form has no `bundle` file field.
    #[error("bundle field is required")]
    MissingBundle,

    /// The bundle filename does not carry a supported extension.
    #[error("bundle must be one of: .zip, .tar, .tar.gz, .tgz")]
    UnsupportedBundle,

    // ─────────────────────────────────────────────────────────────────────────
    // Extraction errors
    // ─────────────────────────────────────────────────────────────────────────
    /// The bundle path has no recognised archive suffix.
    #[error("unsupported archive format")]
    UnsupportedArchive,

    /// An entry name is `..` or starts with `../` once cleaned.
    #[error("invalid archive path: {entry}")]
    InvalidArchivePath {
        /// The entry name as stored in the archive.
        entry: String,
    },

    /// An entry resolves to a location outside the extraction directory.
    #[error("archive path escapes output directory: {entry}")]
    ArchiveEscape {
        /// The entry name as stored in the archive.
        entry: String,
    },

    /// The archive is corrupt or could not be read.
    #[error("failed to extract bundle: {0}")]
    Archive(String),

    // ─────────────────────────────────────────────────────────────────────────
    // Pipeline errors
    // ─────────────────────────────────────────────────────────────────────────
    /// The build/deploy executable exited unsuccessfully.
    #[error("build/deploy failed: {}", exit_description(.exit_code))]
    BuildFailed {
        /// Exit code, absent when the process was killed by a signal.
        exit_code: Option<i32>,
    },

    /// The build/deploy executable could not be started.
    #[error("build/deploy failed: failed to spawn {}: {source}", .program.display())]
    Spawn {
        /// Executable that failed to start.
        program: PathBuf,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// The revision lookup command failed.
    #[error("revision lookup failed: {0}")]
    RevisionLookup(String),

    // ─────────────────────────────────────────────────────────────────────────
    // Store errors
    // ─────────────────────────────────────────────────────────────────────────
    /// A job with this id was already created.
    #[error("deployment {0} already exists")]
    DuplicateJob(String),

    /// No job exists with this id.
    #[error("deployment not found")]
    JobNotFound(String),

    // ─────────────────────────────────────────────────────────────────────────
    // Infrastructure errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Filesystem failure while preparing the work directory.
    #[error("{context}: {source}")]
    Io {
        /// What was being attempted.
        context: &'static str,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_owned(),
    }
}

impl DeployError {
    /// Wrap an I/O error with a short description of the failed step.
    #[must_use]
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    /// Whether the error was caused by the client's request.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::PayloadTooLarge { .. }
                | Self::InvalidMultipart(_)
                | Self::MissingBundle
                | Self::UnsupportedBundle
                | Self::UnsupportedArchive
                | Self::InvalidArchivePath { .. }
                | Self::ArchiveEscape { .. }
                | Self::Archive(_)
        )
    }

    /// HTTP status used when the error terminates a request.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        if self.is_client_error() {
            return StatusCode::BAD_REQUEST;
        }
        match self {
            Self::JobNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<figment::Error> for DeployError {
    fn from(e: figment::Error) -> Self {
        Self::Config(e.to_string())
    }
}

/// JSON body for every error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error message.
    pub error: String,
}

impl ErrorResponse {
    /// Build an error body from any displayable message.
    #[must_use]
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

impl IntoResponse for DeployError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            Self::UnsupportedArchive
            | Self::InvalidArchivePath { .. }
            | Self::ArchiveEscape { .. } => format!("failed to extract bundle: {self}"),
            _ => self.to_string(),
        };
        (status, Json(ErrorResponse::new(message))).into_response()
    }
}

/// Result type alias for upload and deployment operations.
pub type DeployResult<T> = Result<T, DeployError>;
