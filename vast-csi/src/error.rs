//! Driver error taxonomy.
//!
//! A single enum carries every failure mode described by the error handling
//! design: validation failures, VMS API errors, and lookup misses. Mapping
//! from `DriverError` to a gRPC `Status` is owned entirely by
//! [`crate::dispatcher::map_error`] so the RPC name can be folded into the
//! message text; this type itself stays transport-agnostic.

use thiserror::Error;

/// Structured error returned by the VMS REST API (HTTP 400 or 503).
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: u16,
    pub reason: String,
    pub body: String,
    pub url: String,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let first_line = self.body.lines().next().unwrap_or("");
        write!(
            f,
            "Unable to accomplish request to {}. {}, <{}({})>",
            self.url, first_line, self.reason, self.status
        )
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Missing required fields: {0}")]
    MissingFields(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("volume already exists with conflicting capacity: {0}")]
    VolumeAlreadyExists(String),

    #[error("source not found: {0}")]
    SourceNotFound(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("mount failed: {0}")]
    MountFailed(String),

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("{0}")]
    Other(anyhow::Error),
}

impl From<anyhow::Error> for DriverError {
    fn from(err: anyhow::Error) -> Self {
        DriverError::Other(err)
    }
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        DriverError::Other(err.into())
    }
}

pub type DriverResult<T> = Result<T, DriverError>;
