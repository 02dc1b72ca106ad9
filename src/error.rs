//! Error types for blend-retarget.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the orchestrating side of a transfer.
///
/// Failures that happen inside the engine process never arrive here as
/// values; they are reconstructed from exit code and stdout into a
/// [`FailureKind`](crate::job::FailureKind) on the job result.
#[derive(Error, Debug)]
pub enum Error {
    /// Input file or directory does not exist
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    /// File exists but is not an engine scene file
    #[error("Not a .blend file: {0}")]
    NotSceneFile(PathBuf),

    /// Directory contained no scene files
    #[error("No .blend files found in {0}")]
    NoSources(PathBuf),

    /// Engine executable could not be resolved or started
    #[error("Failed to launch engine {program}: {reason}")]
    Launch { program: PathBuf, reason: String },

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Control script could not be rendered
    #[error("Script generation failed: {0}")]
    Script(#[from] minijinja::Error),

    /// Config or report (de)serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an "other" error from a string.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Create an invalid configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a launch error for `program`.
    pub fn launch(program: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Launch {
            program: program.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for blend-retarget operations.
pub type Result<T> = std::result::Result<T, Error>;
