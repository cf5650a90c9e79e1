//! Plan execution.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use fileferry_core::{StepFailure, StepKind, TransferConfig, TransferError, TransferStep};

use crate::conflict::{Conflict, ConflictDecision, ConflictResolver, rename_target};
use crate::copy::{
    CopyOptions, copy_file_chunked, copy_symlink, finish_move, is_same_entry, remove_entry,
    remove_single,
};
use crate::progress::{OutcomeStatus, SessionState, TransferOutcome};
use crate::session::TransferSession;
use crate::trash::TrashService;

/// How a single step ended, short of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Applied,
    Skipped,
    Cancelled,
}

/// Where a writing step ends up after conflict resolution.
#[derive(Debug)]
enum Target {
    Write(PathBuf),
    Skip,
    Cancel,
}

/// Bookkeeping for one execution of a plan.
#[derive(Debug, Default)]
struct RunState {
    /// Planned directory paths that were renamed, with their actual path.
    redirects: Vec<(PathBuf, PathBuf)>,
    /// Planned destination directories whose subtree is skipped.
    skipped_dirs: Vec<PathBuf>,
    /// Source paths that must survive the run.
    retained: Vec<PathBuf>,
    completed: usize,
    skipped: usize,
    failures: Vec<StepFailure>,
}

impl RunState {
    fn actual_destination(&self, planned: &Path) -> PathBuf {
        for (from, to) in self.redirects.iter().rev() {
            if let Ok(rest) = planned.strip_prefix(from) {
                return if rest.as_os_str().is_empty() {
                    to.clone()
                } else {
                    to.join(rest)
                };
            }
        }
        planned.to_path_buf()
    }

    fn is_skipped(&self, planned: &Path) -> bool {
        self.skipped_dirs.iter().any(|dir| planned.starts_with(dir))
    }

    fn is_retained(&self, path: &Path) -> bool {
        self.retained.iter().any(|kept| kept.starts_with(path))
    }

    fn retain(&mut self, path: &Path) {
        self.retained.push(path.to_path_buf());
    }

    fn record_failure(&mut self, step: &TransferStep, error: &TransferError) {
        self.failures
            .push(StepFailure::new(step.kind(), step.display_path(), error));
        self.retain(step.source());
        if let TransferStep::CreateDirectory { dst, .. } = step {
            self.skipped_dirs.push(dst.clone());
        }
    }
}

/// Runs the steps of a session's plan against the filesystem.
pub struct TransferExecutor {
    config: Arc<TransferConfig>,
    resolver: ConflictResolver,
    trash: Arc<dyn TrashService>,
}

impl TransferExecutor {
    /// Create an executor.
    pub fn new(
        config: Arc<TransferConfig>,
        resolver: ConflictResolver,
        trash: Arc<dyn TrashService>,
    ) -> Self {
        Self {
            config,
            resolver,
            trash,
        }
    }

    /// Execute the session's plan to completion, cancellation or failure.
    ///
    /// Steps run in plan order. A failing step is recorded and processing
    /// continues unless `stop_on_error` is set. Completed steps are never
    /// rolled back.
    pub async fn execute(&self, session: &mut TransferSession) -> TransferOutcome {
        let plan = session.shared_plan();
        let mut run = RunState::default();

        session.set_state(SessionState::Running);
        info!(steps = plan.len(), total_bytes = plan.total_bytes, "Transfer running");

        if let Some(root) = plan.destination.clone() {
            let path = root.clone();
            let created = blocking(&root, move || {
                fs::create_dir_all(&path).map_err(|e| TransferError::io(&path, e))
            })
            .await;

            if let Err(error) = created {
                warn!(path = %root.display(), %error, "Cannot create destination");
                run.failures
                    .push(StepFailure::new(StepKind::CreateDirectory, &root, &error));
                return self.finish(session, run, OutcomeStatus::Failed);
            }
        }

        let mut cancelled = false;
        for step in plan.iter() {
            if session.is_cancelled() {
                cancelled = true;
                break;
            }

            session.begin_step(step, step.display_path());
            match self.run_step(session, &mut run, step).await {
                Ok(StepOutcome::Applied) => {
                    run.completed += 1;
                    session.end_step(Some(step.size()));
                }
                Ok(StepOutcome::Skipped) => {
                    run.skipped += 1;
                    session.end_step(None);
                }
                Ok(StepOutcome::Cancelled) | Err(TransferError::Cancelled) => {
                    cancelled = true;
                    break;
                }
                Err(error) => {
                    warn!(
                        step = %step.kind(),
                        path = %step.display_path().display(),
                        %error,
                        "Step failed"
                    );
                    run.record_failure(step, &error);
                    session.end_step(None);
                    if self.config.stop_on_error {
                        break;
                    }
                }
            }
        }

        let status = if cancelled {
            OutcomeStatus::Cancelled
        } else if !run.failures.is_empty() {
            OutcomeStatus::PartiallyFailed
        } else {
            OutcomeStatus::Completed
        };
        self.finish(session, run, status)
    }

    fn finish(
        &self,
        session: &mut TransferSession,
        run: RunState,
        status: OutcomeStatus,
    ) -> TransferOutcome {
        let plan = session.plan();
        let outcome = TransferOutcome {
            session_id: session.id(),
            kind: plan.kind,
            status,
            bytes_done: session.bytes_done(),
            total_bytes: plan.total_bytes,
            steps_completed: run.completed,
            steps_skipped: run.skipped,
            failures: run.failures,
        };
        session.finish(&outcome);
        outcome
    }

    async fn run_step(
        &self,
        session: &mut TransferSession,
        run: &mut RunState,
        step: &TransferStep,
    ) -> Result<StepOutcome, TransferError> {
        debug!(step = %step.kind(), path = %step.display_path().display(), "Running step");

        match step {
            TransferStep::CreateDirectory { src, dst } => {
                self.create_directory(session, run, src, dst).await
            }
            TransferStep::CopyFile { src, dst, size } => {
                let target = match self.prepare_target(session, run, src, dst, true).await? {
                    Target::Write(target) => target,
                    Target::Skip => return Ok(StepOutcome::Skipped),
                    Target::Cancel => return Ok(StepOutcome::Cancelled),
                };
                self.copy_with_progress(session, src, &target, *size, false)
                    .await?;
                Ok(StepOutcome::Applied)
            }
            TransferStep::CopySymlink { src, dst } => {
                let target = match self.prepare_target(session, run, src, dst, false).await? {
                    Target::Write(target) => target,
                    Target::Skip => return Ok(StepOutcome::Skipped),
                    Target::Cancel => return Ok(StepOutcome::Cancelled),
                };
                let src = src.clone();
                blocking(&target.clone(), move || copy_symlink(&src, &target)).await?;
                Ok(StepOutcome::Applied)
            }
            TransferStep::MoveFile { src, dst, size } => {
                let target = match self.prepare_target(session, run, src, dst, true).await? {
                    Target::Write(target) => target,
                    Target::Skip => {
                        run.retain(src);
                        return Ok(StepOutcome::Skipped);
                    }
                    Target::Cancel => return Ok(StepOutcome::Cancelled),
                };
                self.move_file(session, src, &target, *size).await?;
                Ok(StepOutcome::Applied)
            }
            TransferStep::RemovePath { path, permanent } => {
                if run.is_retained(path) {
                    debug!(path = %path.display(), "Keeping source with retained entries");
                    run.retain(path);
                    return Ok(StepOutcome::Skipped);
                }
                self.remove(path, *permanent).await?;
                Ok(StepOutcome::Applied)
            }
        }
    }

    async fn create_directory(
        &self,
        session: &mut TransferSession,
        run: &mut RunState,
        src: &Path,
        dst: &Path,
    ) -> Result<StepOutcome, TransferError> {
        if run.is_skipped(dst) {
            run.retain(src);
            return Ok(StepOutcome::Skipped);
        }

        let target = run.actual_destination(dst);
        let Some(existing_is_dir) = probe_kind(&target).await? else {
            create_dir(&target).await?;
            return Ok(StepOutcome::Applied);
        };

        match self.ask(session, &target, src).await? {
            ConflictDecision::Overwrite if existing_is_dir => {
                debug!(path = %target.display(), "Merging into existing directory");
            }
            ConflictDecision::Overwrite => {
                remove_blocking(&target).await?;
                create_dir(&target).await?;
            }
            ConflictDecision::Rename(name) => {
                let renamed = renamed_path(&target, name.as_deref());
                create_dir(&renamed).await?;
                run.redirects.push((dst.to_path_buf(), renamed));
            }
            ConflictDecision::Skip => {
                run.skipped_dirs.push(dst.to_path_buf());
                run.retain(src);
                return Ok(StepOutcome::Skipped);
            }
            ConflictDecision::Cancel => return Ok(StepOutcome::Cancelled),
        }

        Ok(StepOutcome::Applied)
    }

    /// Resolve the real destination of a file-like step.
    ///
    /// With `replaces_files` the step itself replaces an existing file, so
    /// only an existing directory is removed on `Overwrite`.
    async fn prepare_target(
        &self,
        session: &mut TransferSession,
        run: &mut RunState,
        src: &Path,
        planned: &Path,
        replaces_files: bool,
    ) -> Result<Target, TransferError> {
        if run.is_skipped(planned) {
            run.retain(src);
            return Ok(Target::Skip);
        }

        let target = run.actual_destination(planned);
        let Some(existing_is_dir) = probe_kind(&target).await? else {
            return Ok(Target::Write(target));
        };

        match self.ask(session, &target, src).await? {
            ConflictDecision::Overwrite => {
                if same_entry(src, &target).await {
                    debug!(path = %target.display(), "Source and destination are the same entry");
                    run.retain(src);
                    return Ok(Target::Skip);
                }
                if existing_is_dir || !replaces_files {
                    remove_blocking(&target).await?;
                }
                Ok(Target::Write(target))
            }
            ConflictDecision::Rename(name) => Ok(Target::Write(renamed_path(&target, name.as_deref()))),
            ConflictDecision::Skip => Ok(Target::Skip),
            ConflictDecision::Cancel => Ok(Target::Cancel),
        }
    }

    async fn ask(
        &self,
        session: &mut TransferSession,
        existing: &Path,
        incoming: &Path,
    ) -> Result<ConflictDecision, TransferError> {
        let id = session.id();
        let (existing, incoming) = (existing.to_path_buf(), incoming.to_path_buf());
        let conflict = blocking(&existing.clone(), move || {
            Ok(Conflict::probe(id, &existing, &incoming))
        })
        .await?;

        Ok(self.resolver.resolve(session, conflict).await)
    }

    /// Chunked copy in a blocking task, publishing throttled progress while it runs.
    async fn copy_with_progress(
        &self,
        session: &mut TransferSession,
        src: &Path,
        dst: &Path,
        size: u64,
        force_metadata: bool,
    ) -> Result<u64, TransferError> {
        let counter = Arc::new(AtomicU64::new(0));
        let options = CopyOptions {
            chunk_size: self.config.chunk_size,
            preserve_metadata: self.config.preserve_metadata || force_metadata,
        };

        let mut job = {
            let counter = Arc::clone(&counter);
            let cancel = session.cancel_token();
            let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
            tokio::task::spawn_blocking(move || {
                copy_file_chunked(&src, &dst, options, &cancel, |n| {
                    counter.fetch_add(n, Ordering::Relaxed);
                })
            })
        };

        let period = self.config.progress_interval().max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = &mut job => {
                    session.record_step_bytes(counter.load(Ordering::Relaxed), size);
                    return result.map_err(|e| TransferError::Io {
                        path: dst.to_path_buf(),
                        source: io::Error::other(e),
                    })?;
                }
                _ = ticker.tick() => {
                    session.record_step_bytes(counter.load(Ordering::Relaxed), size);
                    session.publish();
                }
            }
        }
    }

    async fn move_file(
        &self,
        session: &mut TransferSession,
        src: &Path,
        dst: &Path,
        size: u64,
    ) -> Result<(), TransferError> {
        if !self.config.force_copy_on_move {
            let (from, to) = (src.to_path_buf(), dst.to_path_buf());
            let renamed = blocking(dst, move || Ok(fs::rename(&from, &to))).await?;
            match renamed {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
                    debug!(path = %src.display(), "Rename crosses devices, copying instead");
                }
                Err(e) => return Err(TransferError::io(src, e)),
            }
        }

        let from = src.to_path_buf();
        let is_symlink = blocking(src, move || {
            fs::symlink_metadata(&from)
                .map(|metadata| metadata.file_type().is_symlink())
                .map_err(|e| TransferError::io(&from, e))
        })
        .await?;

        let (from, to) = (src.to_path_buf(), dst.to_path_buf());
        if is_symlink {
            return blocking(dst, move || {
                if fs::symlink_metadata(&to).is_ok() {
                    remove_entry(&to)?;
                }
                copy_symlink(&from, &to)?;
                fs::remove_file(&from).map_err(|e| TransferError::io(&from, e))
            })
            .await;
        }

        self.copy_with_progress(session, src, dst, size, true).await?;
        blocking(dst, move || {
            let expected = fs::symlink_metadata(&from)
                .map_err(|e| TransferError::io(&from, e))?
                .len();
            finish_move(&from, &to, expected)
        })
        .await
    }

    async fn remove(&self, path: &Path, permanent: bool) -> Result<(), TransferError> {
        let target = path.to_path_buf();
        if permanent {
            return blocking(path, move || remove_single(&target)).await;
        }

        let trash = Arc::clone(&self.trash);
        blocking(path, move || {
            let result = trash.move_to_trash(&target);
            result.map_err(|e| TransferError::TrashUnavailable {
                path: target,
                message: e.message,
            })
        })
        .await
    }
}

/// Run blocking filesystem work off the async threads.
async fn blocking<T, F>(path: &Path, f: F) -> Result<T, TransferError>
where
    F: FnOnce() -> Result<T, TransferError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TransferError::Io {
            path: path.to_path_buf(),
            source: io::Error::other(e),
        })?
}

/// `Some(is_dir)` if something exists at `path`, without following symlinks.
async fn probe_kind(path: &Path) -> Result<Option<bool>, TransferError> {
    let target = path.to_path_buf();
    blocking(path, move || match fs::symlink_metadata(&target) {
        Ok(metadata) => Ok(Some(metadata.is_dir())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(TransferError::io(&target, e)),
    })
    .await
}

async fn create_dir(path: &Path) -> Result<(), TransferError> {
    let target = path.to_path_buf();
    blocking(path, move || {
        fs::create_dir_all(&target).map_err(|e| TransferError::io(&target, e))
    })
    .await
}

async fn remove_blocking(path: &Path) -> Result<(), TransferError> {
    let target = path.to_path_buf();
    blocking(path, move || remove_entry(&target)).await
}

async fn same_entry(a: &Path, b: &Path) -> bool {
    let (a, b) = (a.to_path_buf(), b.to_path_buf());
    tokio::task::spawn_blocking(move || is_same_entry(&a, &b))
        .await
        .unwrap_or(false)
}

fn renamed_path(existing: &Path, name: Option<&str>) -> PathBuf {
    match (existing.parent(), name) {
        (Some(parent), Some(name)) => parent.join(name),
        _ => rename_target(existing, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirects_apply_to_descendants() {
        let mut run = RunState::default();
        run.redirects
            .push((PathBuf::from("/d/photos"), PathBuf::from("/d/photos (2)")));

        assert_eq!(
            run.actual_destination(Path::new("/d/photos")),
            PathBuf::from("/d/photos (2)")
        );
        assert_eq!(
            run.actual_destination(Path::new("/d/photos/a/b.jpg")),
            PathBuf::from("/d/photos (2)/a/b.jpg")
        );
        assert_eq!(
            run.actual_destination(Path::new("/d/photos-old/x")),
            PathBuf::from("/d/photos-old/x")
        );
    }

    #[test]
    fn test_skipped_dirs_cover_subtree() {
        let mut run = RunState::default();
        run.skipped_dirs.push(PathBuf::from("/d/music"));

        assert!(run.is_skipped(Path::new("/d/music/track.flac")));
        assert!(!run.is_skipped(Path::new("/d/musical")));
    }

    #[test]
    fn test_retained_entries_protect_ancestors() {
        let mut run = RunState::default();
        run.retain(Path::new("/s/dir/sub/file.txt"));

        assert!(run.is_retained(Path::new("/s/dir/sub")));
        assert!(run.is_retained(Path::new("/s/dir")));
        assert!(!run.is_retained(Path::new("/s/other")));
    }

    #[test]
    fn test_failed_directory_skips_children() {
        let mut run = RunState::default();
        let step = TransferStep::CreateDirectory {
            src: PathBuf::from("/s/dir"),
            dst: PathBuf::from("/d/dir"),
        };
        run.record_failure(
            &step,
            &TransferError::PermissionDenied {
                path: PathBuf::from("/d/dir"),
            },
        );

        assert_eq!(run.failures.len(), 1);
        assert!(run.is_skipped(Path::new("/d/dir/a.txt")));
        assert!(run.is_retained(Path::new("/s/dir")));
    }
}
