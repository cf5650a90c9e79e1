//! Transfer request types.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// How deleted items are disposed of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteMode {
    /// Remove from disk.
    Permanent,
    /// Hand over to the trash service.
    Trash,
}

/// A transfer submitted by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferRequest {
    /// Copy files/directories into a destination directory.
    Copy {
        sources: Vec<PathBuf>,
        destination: PathBuf,
    },
    /// Move files/directories into a destination directory.
    Move {
        sources: Vec<PathBuf>,
        destination: PathBuf,
    },
    /// Delete files/directories.
    Delete { targets: Vec<PathBuf>, mode: DeleteMode },
}

impl TransferRequest {
    /// Create a copy request.
    pub fn copy(sources: Vec<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self::Copy {
            sources,
            destination: destination.into(),
        }
    }

    /// Create a move request.
    pub fn move_to(sources: Vec<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self::Move {
            sources,
            destination: destination.into(),
        }
    }

    /// Create a delete request.
    pub fn delete(targets: Vec<PathBuf>, permanent: bool) -> Self {
        let mode = if permanent {
            DeleteMode::Permanent
        } else {
            DeleteMode::Trash
        };
        Self::Delete { targets, mode }
    }

    /// The kind of transfer.
    pub fn kind(&self) -> TransferKind {
        match self {
            Self::Copy { .. } => TransferKind::Copy,
            Self::Move { .. } => TransferKind::Move,
            Self::Delete { .. } => TransferKind::Delete,
        }
    }

    /// The source paths (delete targets for deletions).
    pub fn sources(&self) -> &[PathBuf] {
        match self {
            Self::Copy { sources, .. } | Self::Move { sources, .. } => sources,
            Self::Delete { targets, .. } => targets,
        }
    }

    /// The destination directory, if the request has one.
    pub fn destination(&self) -> Option<&Path> {
        match self {
            Self::Copy { destination, .. } | Self::Move { destination, .. } => Some(destination),
            Self::Delete { .. } => None,
        }
    }
}

/// The type of transfer being performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferKind {
    Copy,
    Move,
    Delete,
}

impl std::fmt::Display for TransferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Copy => write!(f, "Copy"),
            Self::Move => write!(f, "Move"),
            Self::Delete => write!(f, "Delete"),
        }
    }
}
