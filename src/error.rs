//! Error types and handling
//!
//! Common error types used across the recording session pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Session-wide error type
///
/// Every variant carries a message a user can act on; raw diagnostics from
/// the encoder are attached to [`SessionError::ConversionFailed`] for
/// caller-side logging only.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("no capture sources available to combine — select a microphone or a screen first")]
    NoSourcesAvailable,

    #[error("recording is not ready — combine streams before starting")]
    NotReady,

    #[error("a region selection is already in progress")]
    RegionSelectionInProgress,

    #[error("region selection was cancelled")]
    RegionSelectionCancelled,

    #[error("recording input is empty or missing: {0}")]
    EmptyOrMissingInput(String),

    #[error("video conversion failed: {0}")]
    ConversionFailed(String),

    #[error("recorder error: {0}")]
    Recorder(String),

    #[error("overlay surface error: {0}")]
    Overlay(String),

    #[error("mirror transport error: {0}")]
    Mirror(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Stable machine-readable code for frontend surfaces
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::DeviceUnavailable(_) => "DEVICE_UNAVAILABLE",
            SessionError::NoSourcesAvailable => "NO_SOURCES_AVAILABLE",
            SessionError::NotReady => "NOT_READY",
            SessionError::RegionSelectionInProgress => "REGION_SELECTION_IN_PROGRESS",
            SessionError::RegionSelectionCancelled => "REGION_SELECTION_CANCELLED",
            SessionError::EmptyOrMissingInput(_) => "EMPTY_OR_MISSING_INPUT",
            SessionError::ConversionFailed(_) => "CONVERSION_FAILED",
            SessionError::Recorder(_) => "RECORDER_ERROR",
            SessionError::Overlay(_) => "OVERLAY_ERROR",
            SessionError::Mirror(_) => "MIRROR_ERROR",
            SessionError::Io(_) => "IO_ERROR",
        }
    }
}

/// Error response for frontend surfaces
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<SessionError> for ErrorResponse {
    fn from(error: SessionError) -> Self {
        ErrorResponse {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type alias using SessionError
pub type SessionResult<T> = Result<T, SessionError>;
