//! Shared error type and result alias for the CPM workspace.

use std::path::PathBuf;

/// Errors produced anywhere in the CPM workspace.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A dataset or model text stream had a syntactic problem.
    #[error("malformed input at {context}: {detail}")]
    MalformedInput {
        /// Where the bad input was found (file path, or a short description).
        context: String,
        /// What was wrong with it.
        detail: String,
    },

    /// A model file's stream ended prematurely or carried the wrong version.
    #[error("corrupt model file {path:?}: {detail}")]
    CorruptModel {
        /// Path to the offending model file.
        path: PathBuf,
        /// What was wrong with it.
        detail: String,
    },

    /// A caller passed an out-of-range or otherwise invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An internal self-check failed (e.g. evaluator sign consistency).
    #[error("inconsistent state: {0}")]
    Inconsistent(String),

    /// A file could not be opened or read/written.
    #[error("I/O failure on {path:?}: {source}")]
    IoFailure {
        /// Path that could not be accessed.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Build a [`Error::MalformedInput`] with a plain string context.
    pub fn malformed(context: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::MalformedInput {
            context: context.into(),
            detail: detail.into(),
        }
    }

    /// Build an [`Error::IoFailure`] tagged with the path that failed.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::IoFailure {
            path: path.into(),
            source,
        }
    }
}

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;
