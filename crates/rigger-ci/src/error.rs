//! Error taxonomy for pipeline orchestration.

use std::path::PathBuf;

use thiserror::Error;

use crate::outcome::Phase;

/// Errors raised while resolving, fetching, staging, or running a job.
#[derive(Error, Debug)]
pub enum CiError {
    /// Malformed pipeline configuration or matrix. Fatal before any job runs.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Artifact retrieval failed (connection, non-2xx status, empty body, timeout).
    #[error("transport error fetching {url}: {reason}")]
    Transport { url: String, reason: String },

    /// Artifact source reported the content as absent.
    #[error("artifact not found: {url}")]
    NotFound { url: String },

    /// Fetched bytes did not match the pinned SHA-256 digest.
    #[error("digest mismatch for {url}: expected {expected}, got {actual}")]
    DigestMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    /// Toolchain installer could not be started or exited non-zero.
    #[error("toolchain install failed ({installer}): {reason}")]
    Install { installer: PathBuf, reason: String },

    /// Filesystem write failed while staging an artifact.
    #[error("staging {path} failed: {source}")]
    Stage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Build or test command could not be run to completion.
    #[error("{phase} command `{command}` failed: {reason}")]
    Run {
        phase: Phase,
        command: String,
        reason: String,
    },

    /// Invalid JSON in a pipeline document.
    #[error("invalid pipeline document: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error outside of staging (e.g. reading a config file).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CiError {
    /// Convenience constructor for configuration errors.
    pub fn config(msg: impl Into<String>) -> Self {
        CiError::Configuration(msg.into())
    }

    /// Wrap an IO error raised while writing `path`.
    pub fn stage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CiError::Stage {
            path: path.into(),
            source,
        }
    }

    /// Whether this error is a pre-flight configuration failure.
    pub fn is_configuration(&self) -> bool {
        matches!(self, CiError::Configuration(_) | CiError::Json(_))
    }
}

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, CiError>;
