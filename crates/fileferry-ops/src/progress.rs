//! Progress reporting types for transfers.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use fileferry_core::{SessionId, StepFailure, StepKind, TransferKind};

use crate::conflict::Conflict;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Pending,
    Running,
    Completed,
    PartiallyFailed,
    Cancelled,
    Failed,
}

impl SessionState {
    /// Check if the session has finished.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Completed => write!(f, "Completed"),
            Self::PartiallyFailed => write!(f, "Partially failed"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeStatus {
    /// Every step was applied or skipped by decision.
    Completed,
    /// At least one step failed.
    PartiallyFailed,
    /// A cancel request or a `Cancel` decision stopped processing.
    Cancelled,
    /// A precondition failed before any step could run.
    Failed,
}

impl From<OutcomeStatus> for SessionState {
    fn from(status: OutcomeStatus) -> Self {
        match status {
            OutcomeStatus::Completed => Self::Completed,
            OutcomeStatus::PartiallyFailed => Self::PartiallyFailed,
            OutcomeStatus::Cancelled => Self::Cancelled,
            OutcomeStatus::Failed => Self::Failed,
        }
    }
}

/// Snapshot of an ongoing transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferProgress {
    /// The session being reported on.
    pub session_id: SessionId,
    /// The type of transfer.
    pub kind: TransferKind,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Bytes written so far.
    pub bytes_done: u64,
    /// Total bytes in the plan.
    pub total_bytes: u64,
    /// Steps finished (applied, skipped or failed).
    pub steps_done: usize,
    /// Total steps in the plan.
    pub steps_total: usize,
    /// The path currently being processed.
    pub current_path: Option<PathBuf>,
    /// The kind of step currently running.
    pub current_step: Option<StepKind>,
    /// A conflict waiting for an answer, if any.
    pub pending_conflict: Option<Conflict>,
}

impl TransferProgress {
    /// Create the initial snapshot for a session.
    pub fn new(session_id: SessionId, kind: TransferKind, steps_total: usize, total_bytes: u64) -> Self {
        Self {
            session_id,
            kind,
            state: SessionState::Pending,
            bytes_done: 0,
            total_bytes,
            steps_done: 0,
            steps_total,
            current_path: None,
            current_step: None,
            pending_conflict: None,
        }
    }

    /// Get the progress as a percentage (0.0 to 100.0).
    pub fn percentage(&self) -> f64 {
        if self.total_bytes > 0 {
            (self.bytes_done as f64 / self.total_bytes as f64) * 100.0
        } else if self.steps_total > 0 {
            (self.steps_done as f64 / self.steps_total as f64) * 100.0
        } else {
            0.0
        }
    }
}

/// Result of a finished session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferOutcome {
    /// The session that produced this outcome.
    pub session_id: SessionId,
    /// The type of transfer.
    pub kind: TransferKind,
    /// How the session ended.
    pub status: OutcomeStatus,
    /// Bytes written.
    pub bytes_done: u64,
    /// Total bytes in the plan.
    pub total_bytes: u64,
    /// Steps that were applied.
    pub steps_completed: usize,
    /// Steps skipped by a conflict decision.
    pub steps_skipped: usize,
    /// Every step that failed, in execution order.
    pub failures: Vec<StepFailure>,
}

impl TransferOutcome {
    /// Check if the session completed without failures.
    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Completed
    }

    /// Get a human-readable summary of the outcome.
    pub fn summary(&self) -> String {
        let action = match self.kind {
            TransferKind::Copy => "Copied",
            TransferKind::Move => "Moved",
            TransferKind::Delete => "Deleted",
        };

        match self.status {
            OutcomeStatus::Completed if self.steps_skipped == 0 => {
                format!("{} {} items", action, self.steps_completed)
            }
            OutcomeStatus::Completed => format!(
                "{} {} items, {} skipped",
                action, self.steps_completed, self.steps_skipped
            ),
            OutcomeStatus::PartiallyFailed => format!(
                "{} {} items, {} failed",
                action,
                self.steps_completed,
                self.failures.len()
            ),
            OutcomeStatus::Cancelled => format!(
                "{} cancelled after {} items",
                self.kind, self.steps_completed
            ),
            OutcomeStatus::Failed => match self.failures.first() {
                Some(failure) => format!("{} failed: {}", self.kind, failure),
                None => format!("{} failed", self.kind),
            },
        }
    }
}

/// Event emitted by running sessions.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Progress update.
    Progress(TransferProgress),
    /// A conflict needs an answer before the session can continue.
    ConflictEncountered {
        session_id: SessionId,
        conflict: Conflict,
    },
    /// The session reached a terminal state.
    Finished(TransferOutcome),
}

impl TransferEvent {
    /// The session this event belongs to.
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::Progress(progress) => progress.session_id,
            Self::ConflictEncountered { session_id, .. } => *session_id,
            Self::Finished(outcome) => outcome.session_id,
        }
    }
}
