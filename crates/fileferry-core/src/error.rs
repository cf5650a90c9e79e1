//! Error types for planning and executing transfers.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::plan::StepKind;

/// A request that would copy or move a path into itself.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RecursionError {
    /// The destination is the source itself.
    #[error("Cannot copy or move {path} onto itself")]
    SelfCopy { path: PathBuf },

    /// The destination lies inside a source directory.
    #[error("Cannot copy or move {directory} into its own subdirectory {destination}")]
    DestinationInsideSource {
        directory: PathBuf,
        destination: PathBuf,
    },

    /// After resolving links, the move would make a directory its own ancestor.
    #[error("Moving {directory} to {destination} would create a cycle")]
    SourceInsideDestinationCycle {
        directory: PathBuf,
        destination: PathBuf,
    },
}

/// Errors that abort a request before anything is executed.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The request rejected by the recursion guard.
    #[error("Recursion violation: {0}")]
    RecursionViolation(#[from] RecursionError),

    /// A source does not exist.
    #[error("Source not found: {path}")]
    SourceNotFound { path: PathBuf },

    /// A source could not be read.
    #[error("Permission denied: {path}")]
    PermissionDenied { path: PathBuf },

    /// The destination exists but is not a directory.
    #[error("Destination is not a directory: {path}")]
    DestinationNotDirectory { path: PathBuf },

    /// The request has no sources.
    #[error("Nothing to transfer")]
    EmptyRequest,

    /// Generic I/O error.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PlanError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            std::io::ErrorKind::NotFound => Self::SourceNotFound { path },
            _ => Self::Io { path, source },
        }
    }
}

/// Errors raised while executing a single step.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The step's source disappeared.
    #[error("Source not found: {path}")]
    SourceNotFound { path: PathBuf },

    /// Permission denied for a path.
    #[error("Permission denied: {path}")]
    PermissionDenied { path: PathBuf },

    /// The destination device ran out of space.
    #[error("No space left on device: {path}")]
    DestinationFull { path: PathBuf },

    /// Generic I/O error.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The trash service refused the path.
    #[error("Trash unavailable for {path}: {message}")]
    TrashUnavailable { path: PathBuf, message: String },

    /// A copied file does not match its source length.
    #[error("Size mismatch at {path}: expected {expected} bytes, found {actual}")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// The session was cancelled mid-step.
    #[error("Operation cancelled")]
    Cancelled,
}

impl TransferError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            std::io::ErrorKind::NotFound => Self::SourceNotFound { path },
            std::io::ErrorKind::StorageFull => Self::DestinationFull { path },
            _ => Self::Io { path, source },
        }
    }

    /// The path the error refers to, if any.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::SourceNotFound { path }
            | Self::PermissionDenied { path }
            | Self::DestinationFull { path }
            | Self::Io { path, .. }
            | Self::TrashUnavailable { path, .. }
            | Self::SizeMismatch { path, .. } => Some(path),
            Self::Cancelled => None,
        }
    }

    /// Classify this error for reporting.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::SourceNotFound { .. } => FailureKind::SourceNotFound,
            Self::PermissionDenied { .. } => FailureKind::PermissionDenied,
            Self::DestinationFull { .. } => FailureKind::DestinationFull,
            Self::Io { .. } | Self::Cancelled => FailureKind::Io,
            Self::TrashUnavailable { .. } => FailureKind::TrashUnavailable,
            Self::SizeMismatch { .. } => FailureKind::SizeMismatch,
        }
    }
}

/// Category of a recorded step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    SourceNotFound,
    PermissionDenied,
    DestinationFull,
    Io,
    TrashUnavailable,
    SizeMismatch,
}

/// A failed step as it appears in a session outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    /// The kind of step that failed.
    pub step: StepKind,
    /// The offending path.
    pub path: PathBuf,
    /// Failure category.
    pub kind: FailureKind,
    /// A human-readable error message.
    pub message: String,
}

impl StepFailure {
    /// Record a failure of `step`, falling back to `path` when the error has none.
    pub fn new(step: StepKind, path: &Path, error: &TransferError) -> Self {
        Self {
            step,
            path: error.path().unwrap_or(path).to_path_buf(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.step, self.path.display(), self.message)
    }
}
