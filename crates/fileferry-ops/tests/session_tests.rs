use fileferry_core::{SessionId, TransferConfig, TransferRequest};
use fileferry_ops::{
    ConflictAnswer, ConflictDecision, ConflictPolicy, OutcomeStatus, SessionError,
    SessionManager, SessionState, TransferEvent,
};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{sleep, timeout};

const TIMEOUT: Duration = Duration::from_secs(30);

fn write(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

/// Poll until `check` holds; session bookkeeping settles right after the terminal event.
async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn test_cancel_finished_session_is_noop() {
    let temp = TempDir::new().unwrap();
    write(&temp.path().join("a.txt"), "a");

    let manager = SessionManager::new(TransferConfig::default(), ConflictPolicy::Prompt);
    let id = manager
        .copy(vec![temp.path().join("a.txt")], temp.path().join("out"))
        .await
        .unwrap();

    let handle = manager.handle(id).unwrap();
    timeout(TIMEOUT, handle.wait()).await.unwrap();

    assert!(!manager.cancel(id));
    assert!(!handle.is_cancelled());

    let outcome = manager.await_outcome(id).await.unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Completed);
}

#[tokio::test]
async fn test_unknown_sessions() {
    let manager = SessionManager::new(TransferConfig::default(), ConflictPolicy::Prompt);
    let ghost = SessionId::new(404);

    assert!(!manager.cancel(ghost));
    assert!(manager.progress(ghost).is_none());
    assert!(manager.acknowledge(ghost).is_none());
    assert!(matches!(
        manager.resolve_conflict(ghost, ConflictAnswer::once(ConflictDecision::Skip)),
        Err(SessionError::UnknownSession(_))
    ));
    assert!(matches!(
        manager.await_outcome(ghost).await,
        Err(SessionError::UnknownSession(_))
    ));
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let temp = TempDir::new().unwrap();
    let blocked_dst = temp.path().join("blocked");
    write(&temp.path().join("src/a.txt"), "new");
    write(&blocked_dst.join("a.txt"), "old");
    write(&temp.path().join("src/b.txt"), "bee");

    let manager = SessionManager::new(TransferConfig::default(), ConflictPolicy::Prompt);
    let mut events = manager.subscribe();

    let blocked = manager
        .copy(vec![temp.path().join("src/a.txt")], &blocked_dst)
        .await
        .unwrap();
    let free = manager
        .copy(vec![temp.path().join("src/b.txt")], temp.path().join("free"))
        .await
        .unwrap();
    assert_ne!(blocked, free);

    // Wait until the first session is parked on its conflict.
    timeout(TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(TransferEvent::ConflictEncountered { session_id, .. }) if session_id == blocked => {
                    break;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .unwrap();
    assert!(manager.handle(blocked).unwrap().pending_conflict().is_some());

    let free_outcome = timeout(TIMEOUT, manager.await_outcome(free))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(free_outcome.status, OutcomeStatus::Completed);
    assert_eq!(manager.active_sessions(), vec![blocked]);

    assert!(manager.cancel(blocked));
    let blocked_outcome = timeout(TIMEOUT, manager.await_outcome(blocked))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(blocked_outcome.status, OutcomeStatus::Cancelled);
    assert_eq!(fs::read_to_string(blocked_dst.join("a.txt")).unwrap(), "old");
    assert_eq!(
        fs::read_to_string(temp.path().join("free/b.txt")).unwrap(),
        "bee"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_overlapping_destinations_last_writer_wins() {
    let temp = TempDir::new().unwrap();
    let dst = temp.path().join("shared");
    write(&temp.path().join("left/data.txt"), "left");
    write(&temp.path().join("right/data.txt"), "right");

    let manager = SessionManager::new(
        TransferConfig::default(),
        ConflictPolicy::Fixed(ConflictAnswer::for_all(ConflictDecision::Overwrite)),
    );
    let left = manager
        .copy(vec![temp.path().join("left/data.txt")], &dst)
        .await
        .unwrap();
    let right = manager
        .copy(vec![temp.path().join("right/data.txt")], &dst)
        .await
        .unwrap();

    let left = timeout(TIMEOUT, manager.await_outcome(left)).await.unwrap().unwrap();
    let right = timeout(TIMEOUT, manager.await_outcome(right)).await.unwrap().unwrap();
    assert_eq!(left.status, OutcomeStatus::Completed);
    assert_eq!(right.status, OutcomeStatus::Completed);

    let content = fs::read_to_string(dst.join("data.txt")).unwrap();
    assert!(content == "left" || content == "right");
    let leftovers: Vec<_> = fs::read_dir(&dst)
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .filter(|name| name.to_string_lossy().ends_with(".part"))
        .collect();
    assert!(leftovers.is_empty(), "unfinished copies left: {leftovers:?}");
}

#[tokio::test]
async fn test_progress_snapshot_after_completion() {
    let temp = TempDir::new().unwrap();
    write(&temp.path().join("src/a.bin"), "0123456789");

    let manager = SessionManager::new(TransferConfig::default(), ConflictPolicy::Prompt);
    let id = manager
        .copy(vec![temp.path().join("src")], temp.path().join("dst"))
        .await
        .unwrap();
    timeout(TIMEOUT, manager.handle(id).unwrap().wait())
        .await
        .unwrap();

    let progress = manager.progress(id).unwrap();
    assert_eq!(progress.state, SessionState::Completed);
    assert_eq!(progress.bytes_done, 10);
    assert_eq!(progress.steps_done, progress.steps_total);
    assert!((progress.percentage() - 100.0).abs() < f64::EPSILON);
    assert!(progress.pending_conflict.is_none());

    let outcome = manager.acknowledge(id).unwrap();
    assert_eq!(outcome.bytes_done, 10);
    assert!(manager.handle(id).is_none());
}

#[tokio::test]
async fn test_retention_cap_evicts_oldest() {
    let temp = TempDir::new().unwrap();
    write(&temp.path().join("a.txt"), "a");

    let config = TransferConfig::builder()
        .max_retained_outcomes(2usize)
        .build()
        .unwrap();
    let manager = SessionManager::new(
        config,
        ConflictPolicy::Fixed(ConflictAnswer::for_all(ConflictDecision::Overwrite)),
    );

    let mut ids = Vec::new();
    for n in 0..3 {
        let id = manager
            .copy(vec![temp.path().join("a.txt")], temp.path().join(format!("out{n}")))
            .await
            .unwrap();
        timeout(TIMEOUT, manager.handle(id).unwrap().wait())
            .await
            .unwrap();
        ids.push(id);
    }

    eventually(|| manager.len() == 2).await;
    assert!(manager.handle(ids[0]).is_none());
    assert!(manager.acknowledge(ids[1]).is_some());
    assert!(manager.acknowledge(ids[2]).is_some());
    assert!(manager.is_empty());
}

#[tokio::test]
async fn test_detached_session_retires_itself() {
    let temp = TempDir::new().unwrap();
    write(&temp.path().join("a.txt"), "a");

    let manager = SessionManager::new(TransferConfig::default(), ConflictPolicy::Prompt);
    let id = manager
        .submit_detached(TransferRequest::copy(
            vec![temp.path().join("a.txt")],
            temp.path().join("out"),
        ))
        .await
        .unwrap();

    eventually(|| manager.handle(id).is_none()).await;
    assert!(temp.path().join("out/a.txt").exists());
}

#[tokio::test]
async fn test_resolve_without_prompt_is_rejected() {
    let temp = TempDir::new().unwrap();
    write(&temp.path().join("a.txt"), "a");

    let manager = SessionManager::new(TransferConfig::default(), ConflictPolicy::Prompt);
    let id = manager
        .copy(vec![temp.path().join("a.txt")], temp.path().join("out"))
        .await
        .unwrap();
    timeout(TIMEOUT, manager.handle(id).unwrap().wait())
        .await
        .unwrap();

    assert!(matches!(
        manager.resolve_conflict(id, ConflictAnswer::once(ConflictDecision::Overwrite)),
        Err(SessionError::NoPendingConflict(_))
    ));
}
