//! Transfer sessions and the manager that runs them concurrently.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use fileferry_core::{
    PlanError, SessionId, StepKind, TransferConfig, TransferPlan, TransferRequest, TransferStep,
};

use crate::conflict::{Conflict, ConflictAnswer, ConflictDecision, ConflictPolicy, ConflictResolver};
use crate::executor::TransferExecutor;
use crate::planner;
use crate::progress::{SessionState, TransferEvent, TransferOutcome, TransferProgress};
use crate::trash::{SystemTrash, TrashService};

/// Errors returned by the session manager.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The request was rejected during planning.
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// No session with this id is known (never existed or already retired).
    #[error("Unknown session {0}")]
    UnknownSession(SessionId),

    /// The session is not waiting for a conflict decision.
    #[error("Session {0} has no pending conflict")]
    NoPendingConflict(SessionId),

    /// A background task died before producing a result.
    #[error("Task failed: {message}")]
    TaskFailed { message: String },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A conflict waiting for an answer, tagged with its prompt number.
#[derive(Debug)]
struct PendingPrompt {
    ticket: u64,
    conflict: Conflict,
    responder: oneshot::Sender<ConflictAnswer>,
}

/// State shared between a running session and the outside world.
#[derive(Debug)]
struct SessionShared {
    id: SessionId,
    cancel: CancellationToken,
    snapshot: watch::Sender<TransferProgress>,
    prompt: Mutex<Option<PendingPrompt>>,
    prompts_issued: AtomicU64,
    outcome: Mutex<Option<TransferOutcome>>,
    events: broadcast::Sender<TransferEvent>,
}

/// Cheap, cloneable control surface for one session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    /// The session id.
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// Request cancellation.
    ///
    /// Returns `false` if the session already finished or was already
    /// cancelled. The executor honors the request at its next check point.
    pub fn cancel(&self) -> bool {
        if self.shared.snapshot.borrow().state.is_terminal() || self.shared.cancel.is_cancelled() {
            return false;
        }
        self.shared.cancel.cancel();
        true
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// The latest progress snapshot.
    pub fn progress(&self) -> TransferProgress {
        self.shared.snapshot.borrow().clone()
    }

    /// Watch progress snapshots of this session only.
    pub fn watch(&self) -> watch::Receiver<TransferProgress> {
        self.shared.snapshot.subscribe()
    }

    /// The conflict the session is waiting on, if any.
    pub fn pending_conflict(&self) -> Option<Conflict> {
        self.shared.snapshot.borrow().pending_conflict.clone()
    }

    /// The pending conflict together with its prompt ticket.
    ///
    /// Tickets increase with every prompt of the session. Pass the ticket to
    /// [`resolve_prompt`](Self::resolve_prompt) so an answer meant for one
    /// conflict is never applied to a later one.
    pub fn pending_prompt(&self) -> Option<(u64, Conflict)> {
        lock(&self.shared.prompt)
            .as_ref()
            .map(|pending| (pending.ticket, pending.conflict.clone()))
    }

    /// Answer whichever conflict is pending and let the session continue.
    pub fn resolve_conflict(&self, answer: ConflictAnswer) -> Result<(), SessionError> {
        let pending = lock(&self.shared.prompt).take();
        self.deliver(pending, answer)
    }

    /// Answer the conflict with prompt ticket `ticket`.
    ///
    /// Fails with [`SessionError::NoPendingConflict`] if that prompt was
    /// already answered or abandoned, even when a newer one is waiting.
    pub fn resolve_prompt(&self, ticket: u64, answer: ConflictAnswer) -> Result<(), SessionError> {
        let pending = {
            let mut slot = lock(&self.shared.prompt);
            match slot.as_ref() {
                Some(pending) if pending.ticket == ticket => slot.take(),
                _ => None,
            }
        };
        self.deliver(pending, answer)
    }

    fn deliver(&self, pending: Option<PendingPrompt>, answer: ConflictAnswer) -> Result<(), SessionError> {
        match pending {
            Some(pending) => pending
                .responder
                .send(answer)
                .map_err(|_| SessionError::NoPendingConflict(self.id())),
            None => Err(SessionError::NoPendingConflict(self.id())),
        }
    }

    /// The final outcome, once the session is terminal.
    pub fn outcome(&self) -> Option<TransferOutcome> {
        lock(&self.shared.outcome).clone()
    }

    /// Wait until the session reaches a terminal state.
    pub async fn wait(&self) -> Option<TransferOutcome> {
        let mut rx = self.shared.snapshot.subscribe();
        let _ = rx.wait_for(|progress| progress.state.is_terminal()).await;
        self.outcome()
    }

    /// Publish `conflict` and suspend until it is answered or the session is cancelled.
    pub(crate) async fn prompt(&self, conflict: Conflict) -> ConflictAnswer {
        let (tx, rx) = oneshot::channel();
        let ticket = self.shared.prompts_issued.fetch_add(1, Ordering::Relaxed) + 1;
        *lock(&self.shared.prompt) = Some(PendingPrompt {
            ticket,
            conflict: conflict.clone(),
            responder: tx,
        });
        self.shared
            .snapshot
            .send_modify(|progress| progress.pending_conflict = Some(conflict.clone()));
        let _ = self.shared.events.send(TransferEvent::ConflictEncountered {
            session_id: self.id(),
            conflict,
        });

        let cancelled = ConflictAnswer::once(ConflictDecision::Cancel);
        let answer = tokio::select! {
            answer = rx => answer.unwrap_or(cancelled),
            _ = self.shared.cancel.cancelled() => cancelled,
        };

        lock(&self.shared.prompt).take();
        self.shared
            .snapshot
            .send_modify(|progress| progress.pending_conflict = None);
        answer
    }
}

/// One in-flight transfer, owned by the executor running it.
#[derive(Debug)]
pub struct TransferSession {
    handle: SessionHandle,
    plan: Arc<TransferPlan>,
    state: SessionState,
    bytes_done: u64,
    step_bytes: u64,
    steps_done: usize,
    current: Option<(PathBuf, StepKind)>,
    sticky_decision: Option<ConflictDecision>,
}

impl TransferSession {
    /// Create a pending session for `plan`, reporting on `events`.
    pub fn new(id: SessionId, plan: TransferPlan, events: broadcast::Sender<TransferEvent>) -> Self {
        let progress = TransferProgress::new(id, plan.kind, plan.len(), plan.total_bytes);
        let (snapshot, _) = watch::channel(progress);

        Self {
            handle: SessionHandle {
                shared: Arc::new(SessionShared {
                    id,
                    cancel: CancellationToken::new(),
                    snapshot,
                    prompt: Mutex::new(None),
                    prompts_issued: AtomicU64::new(0),
                    outcome: Mutex::new(None),
                    events,
                }),
            },
            plan: Arc::new(plan),
            state: SessionState::Pending,
            bytes_done: 0,
            step_bytes: 0,
            steps_done: 0,
            current: None,
            sticky_decision: None,
        }
    }

    /// The session id.
    pub fn id(&self) -> SessionId {
        self.handle.id()
    }

    /// A control handle for this session.
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// The plan being executed.
    pub fn plan(&self) -> &TransferPlan {
        &self.plan
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Bytes written so far.
    pub fn bytes_done(&self) -> u64 {
        self.bytes_done
    }

    /// Number of finished steps.
    pub fn steps_done(&self) -> usize {
        self.steps_done
    }

    /// The "apply to all" decision, once one was made.
    pub fn sticky_decision(&self) -> Option<&ConflictDecision> {
        self.sticky_decision.as_ref()
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    pub(crate) fn set_sticky_decision(&mut self, decision: ConflictDecision) {
        self.sticky_decision = Some(decision);
    }

    pub(crate) fn shared_plan(&self) -> Arc<TransferPlan> {
        Arc::clone(&self.plan)
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.handle.shared.cancel.clone()
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.publish();
    }

    pub(crate) fn begin_step(&mut self, step: &TransferStep, path: &Path) {
        self.step_bytes = 0;
        self.current = Some((path.to_path_buf(), step.kind()));
    }

    /// Account for `copied` bytes of the running step, never past its planned size.
    pub(crate) fn record_step_bytes(&mut self, copied: u64, step_size: u64) {
        let counted = copied.min(step_size);
        if counted > self.step_bytes {
            self.bytes_done += counted - self.step_bytes;
            self.step_bytes = counted;
        }
        self.bytes_done = self.bytes_done.min(self.plan.total_bytes);
    }

    /// Close the running step; an applied step counts its full planned size.
    pub(crate) fn end_step(&mut self, applied_size: Option<u64>) {
        if let Some(size) = applied_size {
            self.record_step_bytes(size, size);
        }
        self.step_bytes = 0;
        self.steps_done += 1;
        self.publish();
    }

    /// Push the current counters to watchers and subscribers.
    pub(crate) fn publish(&self) {
        let (path, kind) = match &self.current {
            Some((path, kind)) => (Some(path.clone()), Some(*kind)),
            None => (None, None),
        };

        self.handle.shared.snapshot.send_modify(|progress| {
            progress.state = self.state;
            progress.bytes_done = self.bytes_done;
            progress.steps_done = self.steps_done;
            progress.current_path = path;
            progress.current_step = kind;
        });

        let snapshot = self.handle.progress();
        let _ = self.handle.shared.events.send(TransferEvent::Progress(snapshot));
    }

    /// Store the outcome, then flip to the terminal state.
    pub(crate) fn finish(&mut self, outcome: &TransferOutcome) {
        *lock(&self.handle.shared.outcome) = Some(outcome.clone());
        self.current = None;
        self.set_state(outcome.status.into());
        let _ = self
            .handle
            .shared
            .events
            .send(TransferEvent::Finished(outcome.clone()));
    }
}

/// Runs transfer sessions concurrently, one tokio task each.
pub struct SessionManager {
    config: Arc<TransferConfig>,
    executor: Arc<TransferExecutor>,
    sessions: Arc<DashMap<SessionId, SessionHandle>>,
    finished: Arc<Mutex<VecDeque<SessionId>>>,
    next_id: AtomicU64,
    events: broadcast::Sender<TransferEvent>,
}

impl SessionManager {
    /// Create a manager that sends trash deletions to the desktop trash.
    pub fn new(config: TransferConfig, policy: ConflictPolicy) -> Self {
        Self::with_trash(config, policy, Arc::new(SystemTrash))
    }

    /// Create a manager with a custom trash service.
    pub fn with_trash(
        config: TransferConfig,
        policy: ConflictPolicy,
        trash: Arc<dyn TrashService>,
    ) -> Self {
        let config = Arc::new(config);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let executor = TransferExecutor::new(Arc::clone(&config), ConflictResolver::new(policy), trash);

        Self {
            config,
            executor: Arc::new(executor),
            sessions: Arc::new(DashMap::new()),
            finished: Arc::new(Mutex::new(VecDeque::new())),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    /// Subscribe to events from all sessions.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Copy `sources` into `destination`.
    pub async fn copy(
        &self,
        sources: Vec<PathBuf>,
        destination: impl Into<PathBuf>,
    ) -> Result<SessionId, SessionError> {
        self.submit(TransferRequest::copy(sources, destination)).await
    }

    /// Move `sources` into `destination`.
    pub async fn move_to(
        &self,
        sources: Vec<PathBuf>,
        destination: impl Into<PathBuf>,
    ) -> Result<SessionId, SessionError> {
        self.submit(TransferRequest::move_to(sources, destination))
            .await
    }

    /// Delete `paths`, permanently or via the trash.
    pub async fn delete(&self, paths: Vec<PathBuf>, permanent: bool) -> Result<SessionId, SessionError> {
        self.submit(TransferRequest::delete(paths, permanent)).await
    }

    /// Plan `request` and start executing it in the background.
    ///
    /// Planning errors are returned here and leave the filesystem untouched.
    /// The result is retained until [`await_outcome`](Self::await_outcome) or
    /// [`acknowledge`](Self::acknowledge) is called.
    pub async fn submit(&self, request: TransferRequest) -> Result<SessionId, SessionError> {
        self.start(request, false).await
    }

    /// Like [`submit`](Self::submit), but the session is retired as soon as it finishes.
    pub async fn submit_detached(&self, request: TransferRequest) -> Result<SessionId, SessionError> {
        self.start(request, true).await
    }

    async fn start(&self, request: TransferRequest, detached: bool) -> Result<SessionId, SessionError> {
        let plan = tokio::task::spawn_blocking(move || planner::plan(&request))
            .await
            .map_err(|e| SessionError::TaskFailed {
                message: e.to_string(),
            })??;

        let id = SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let span = info_span!("transfer", session = %id, kind = %plan.kind);
        info!(
            parent: &span,
            steps = plan.len(),
            total_bytes = plan.total_bytes,
            detached,
            "Starting transfer"
        );

        let mut session = TransferSession::new(id, plan, self.events.clone());
        self.sessions.insert(id, session.handle().clone());

        let executor = Arc::clone(&self.executor);
        let sessions = Arc::clone(&self.sessions);
        let finished = Arc::clone(&self.finished);
        let max_retained = self.config.max_retained_outcomes;

        tokio::spawn(
            async move {
                let outcome = executor.execute(&mut session).await;
                info!(status = ?outcome.status, "{}", outcome.summary());

                if detached {
                    sessions.remove(&id);
                } else {
                    retain_outcome(&sessions, &finished, id, max_retained);
                }
            }
            .instrument(span),
        );

        Ok(id)
    }

    /// Request cancellation of a session. No-op for finished or unknown sessions.
    pub fn cancel(&self, id: SessionId) -> bool {
        let handle = self.handle(id);
        handle.is_some_and(|handle| handle.cancel())
    }

    /// The latest progress snapshot of a session.
    pub fn progress(&self, id: SessionId) -> Option<TransferProgress> {
        self.handle(id).map(|handle| handle.progress())
    }

    /// A control handle for a session.
    pub fn handle(&self, id: SessionId) -> Option<SessionHandle> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Answer the conflict a session is waiting on.
    pub fn resolve_conflict(&self, id: SessionId, answer: ConflictAnswer) -> Result<(), SessionError> {
        self.handle(id)
            .ok_or(SessionError::UnknownSession(id))?
            .resolve_conflict(answer)
    }

    /// Answer a specific prompt of a session; see [`SessionHandle::resolve_prompt`].
    pub fn resolve_prompt(
        &self,
        id: SessionId,
        ticket: u64,
        answer: ConflictAnswer,
    ) -> Result<(), SessionError> {
        self.handle(id)
            .ok_or(SessionError::UnknownSession(id))?
            .resolve_prompt(ticket, answer)
    }

    /// Wait for a session to finish, then retire it.
    pub async fn await_outcome(&self, id: SessionId) -> Result<TransferOutcome, SessionError> {
        let handle = self.handle(id).ok_or(SessionError::UnknownSession(id))?;
        let outcome = handle.wait().await.ok_or_else(|| SessionError::TaskFailed {
            message: format!("session {id} ended without an outcome"),
        })?;
        self.acknowledge(id);
        Ok(outcome)
    }

    /// Retire a finished session and return its outcome.
    ///
    /// Returns `None` while the session is still running or if it is unknown.
    pub fn acknowledge(&self, id: SessionId) -> Option<TransferOutcome> {
        let mut finished = lock(&self.finished);
        let outcome = self.sessions.get(&id).and_then(|entry| entry.value().outcome())?;
        self.sessions.remove(&id);
        finished.retain(|retained| *retained != id);
        debug!(session = %id, "Acknowledged transfer");
        Some(outcome)
    }

    /// Ids of sessions that have not finished yet.
    pub fn active_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| !entry.value().progress().state.is_terminal())
            .map(|entry| *entry.key())
            .collect();
        ids.sort();
        ids
    }

    /// Number of sessions tracked, running or awaiting acknowledgement.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if no sessions are tracked.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Keep a finished session until acknowledged, evicting the oldest beyond `max_retained`.
fn retain_outcome(
    sessions: &DashMap<SessionId, SessionHandle>,
    finished: &Mutex<VecDeque<SessionId>>,
    id: SessionId,
    max_retained: usize,
) {
    let mut finished = lock(finished);
    if !sessions.contains_key(&id) {
        return;
    }
    finished.push_back(id);

    while finished.len() > max_retained {
        let Some(oldest) = finished.pop_front() else {
            break;
        };
        sessions.remove(&oldest);
        warn!(session = %oldest, "Dropping unacknowledged transfer result");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fileferry_core::TransferKind;

    fn empty_session(id: u64) -> TransferSession {
        let (events, _) = broadcast::channel(16);
        let plan = TransferPlan::new(
            TransferKind::Copy,
            None,
            vec![TransferStep::CopyFile {
                src: PathBuf::from("/s/a"),
                dst: PathBuf::from("/d/a"),
                size: 100,
            }],
        );
        TransferSession::new(SessionId::new(id), plan, events)
    }

    #[test]
    fn test_step_bytes_never_exceed_plan() {
        let mut session = empty_session(1);
        session.record_step_bytes(60, 100);
        session.record_step_bytes(40, 100);
        assert_eq!(session.bytes_done(), 60);

        session.record_step_bytes(500, 100);
        assert_eq!(session.bytes_done(), 100);

        session.end_step(Some(100));
        assert_eq!(session.bytes_done(), 100);
        assert_eq!(session.steps_done(), 1);
    }

    #[test]
    fn test_cancel_is_noop_after_finish() {
        let mut session = empty_session(2);
        let handle = session.handle().clone();

        session.set_state(SessionState::Completed);
        assert!(!handle.cancel());
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn test_cancel_only_once() {
        let session = empty_session(3);
        let handle = session.handle().clone();

        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(session.is_cancelled());
    }

    #[test]
    fn test_resolve_without_pending_conflict() {
        let session = empty_session(4);
        let result = session
            .handle()
            .resolve_conflict(ConflictAnswer::once(ConflictDecision::Skip));
        assert!(matches!(result, Err(SessionError::NoPendingConflict(_))));
    }

    #[tokio::test]
    async fn test_stale_ticket_is_rejected() {
        let session = empty_session(5);
        let handle = session.handle().clone();
        let conflict = |name: &str| Conflict {
            session_id: SessionId::new(5),
            existing: crate::conflict::EntryInfo {
                path: PathBuf::from("/d").join(name),
                size: 1,
                is_dir: false,
                modified: None,
            },
            incoming: crate::conflict::EntryInfo {
                path: PathBuf::from("/s").join(name),
                size: 2,
                is_dir: false,
                modified: None,
            },
        };

        let (prompter, first_conflict) = (handle.clone(), conflict("a"));
        let first = tokio::spawn(async move { prompter.prompt(first_conflict).await });
        while handle.pending_prompt().is_none() {
            tokio::task::yield_now().await;
        }
        let (ticket, pending) = handle.pending_prompt().unwrap();
        assert_eq!(pending.existing.path, PathBuf::from("/d/a"));
        handle
            .resolve_prompt(ticket, ConflictAnswer::once(ConflictDecision::Skip))
            .unwrap();
        assert_eq!(first.await.unwrap().decision, ConflictDecision::Skip);

        let (prompter, second_conflict) = (handle.clone(), conflict("b"));
        let second = tokio::spawn(async move { prompter.prompt(second_conflict).await });
        while handle.pending_prompt().is_none() {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            handle.resolve_prompt(ticket, ConflictAnswer::once(ConflictDecision::Overwrite)),
            Err(SessionError::NoPendingConflict(_))
        ));

        let (next, pending) = handle.pending_prompt().unwrap();
        assert!(next > ticket);
        assert_eq!(pending.existing.path, PathBuf::from("/d/b"));
        handle
            .resolve_prompt(next, ConflictAnswer::once(ConflictDecision::Overwrite))
            .unwrap();
        assert_eq!(second.await.unwrap().decision, ConflictDecision::Overwrite);
    }

    #[test]
    fn test_retention_evicts_oldest() {
        let sessions = DashMap::new();
        let finished = Mutex::new(VecDeque::new());
        for id in 1..=3 {
            let session = empty_session(id);
            sessions.insert(session.id(), session.handle().clone());
            retain_outcome(&sessions, &finished, session.id(), 2);
        }

        assert!(!sessions.contains_key(&SessionId::new(1)));
        assert!(sessions.contains_key(&SessionId::new(2)));
        assert!(sessions.contains_key(&SessionId::new(3)));
    }
}
