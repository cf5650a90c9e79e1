//! Planned transfer steps.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::request::TransferKind;

/// Unique identifier for a transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Create a new session ID.
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of a step, used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepKind {
    CreateDirectory,
    CopyFile,
    CopySymlink,
    MoveFile,
    RemovePath,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateDirectory => write!(f, "Create directory"),
            Self::CopyFile => write!(f, "Copy file"),
            Self::CopySymlink => write!(f, "Copy symlink"),
            Self::MoveFile => write!(f, "Move file"),
            Self::RemovePath => write!(f, "Remove"),
        }
    }
}

/// A single atomic filesystem operation within a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStep {
    /// Create the directory `dst`, mirroring the source directory `src`.
    CreateDirectory { src: PathBuf, dst: PathBuf },
    /// Copy file content from `src` to `dst`.
    CopyFile { src: PathBuf, dst: PathBuf, size: u64 },
    /// Recreate the symbolic link `src` at `dst` without following it.
    CopySymlink { src: PathBuf, dst: PathBuf },
    /// Move the file `src` to `dst`.
    MoveFile { src: PathBuf, dst: PathBuf, size: u64 },
    /// Remove `path`, either permanently or by sending it to the trash.
    RemovePath { path: PathBuf, permanent: bool },
}

impl TransferStep {
    /// Get the kind of this step.
    pub fn kind(&self) -> StepKind {
        match self {
            Self::CreateDirectory { .. } => StepKind::CreateDirectory,
            Self::CopyFile { .. } => StepKind::CopyFile,
            Self::CopySymlink { .. } => StepKind::CopySymlink,
            Self::MoveFile { .. } => StepKind::MoveFile,
            Self::RemovePath { .. } => StepKind::RemovePath,
        }
    }

    /// Bytes this step contributes to the plan total.
    pub fn size(&self) -> u64 {
        match self {
            Self::CopyFile { size, .. } | Self::MoveFile { size, .. } => *size,
            _ => 0,
        }
    }

    /// The path this step reads from (or removes).
    pub fn source(&self) -> &Path {
        match self {
            Self::CreateDirectory { src, .. }
            | Self::CopyFile { src, .. }
            | Self::CopySymlink { src, .. }
            | Self::MoveFile { src, .. } => src,
            Self::RemovePath { path, .. } => path,
        }
    }

    /// The path this step creates or writes, if any.
    pub fn destination(&self) -> Option<&Path> {
        match self {
            Self::CreateDirectory { dst, .. }
            | Self::CopyFile { dst, .. }
            | Self::CopySymlink { dst, .. }
            | Self::MoveFile { dst, .. } => Some(dst),
            Self::RemovePath { .. } => None,
        }
    }

    /// The path most relevant to a user watching progress.
    pub fn display_path(&self) -> &Path {
        self.destination().unwrap_or_else(|| self.source())
    }
}

/// An ordered, immutable list of steps for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPlan {
    /// What kind of request produced this plan.
    pub kind: TransferKind,
    /// Destination root directory for copies and moves.
    pub destination: Option<PathBuf>,
    /// Steps in execution order.
    pub steps: Vec<TransferStep>,
    /// Sum of all step sizes.
    pub total_bytes: u64,
}

impl TransferPlan {
    /// Create a plan, computing the byte total from its steps.
    pub fn new(kind: TransferKind, destination: Option<PathBuf>, steps: Vec<TransferStep>) -> Self {
        let total_bytes = steps.iter().map(TransferStep::size).sum();
        Self {
            kind,
            destination,
            steps,
            total_bytes,
        }
    }

    /// Number of steps in the plan.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Check if the plan has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Iterate over the steps in order.
    pub fn iter(&self) -> std::slice::Iter<'_, TransferStep> {
        self.steps.iter()
    }
}
