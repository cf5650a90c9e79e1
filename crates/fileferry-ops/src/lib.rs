//! Transfer engine for fileferry.
//!
//! This crate plans and executes copy, move and delete requests: the
//! recursion guard rejects self-nesting transfers, the planner turns a
//! request into ordered steps, and the session manager runs each plan on
//! its own task with progress, conflict and completion events delivered
//! over a broadcast channel.

mod conflict;
mod copy;
mod executor;
mod guard;
mod planner;
mod progress;
mod session;
mod trash;

pub use conflict::{
    Conflict, ConflictAnswer, ConflictDecision, ConflictPolicy, ConflictResolver, EntryInfo,
    auto_rename_path,
};
pub use executor::TransferExecutor;
pub use guard::validate;
pub use planner::plan;
pub use progress::{OutcomeStatus, SessionState, TransferEvent, TransferOutcome, TransferProgress};
pub use session::{SessionError, SessionHandle, SessionManager, TransferSession};
pub use trash::{SystemTrash, TrashError, TrashService};
