//! Conflict detection and resolution for transfers.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::debug;

use fileferry_core::SessionId;

use crate::session::TransferSession;

/// Metadata about one side of a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    /// Path of the entry.
    pub path: PathBuf,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Last modification time, if available.
    pub modified: Option<SystemTime>,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

impl EntryInfo {
    /// Read metadata for `path` without following a final symlink.
    ///
    /// Missing or unreadable entries are reported with empty metadata.
    pub fn probe(path: &Path) -> Self {
        match fs::symlink_metadata(path) {
            Ok(metadata) => Self {
                path: path.to_path_buf(),
                size: if metadata.is_dir() { 0 } else { metadata.len() },
                modified: metadata.modified().ok(),
                is_dir: metadata.is_dir(),
            },
            Err(_) => Self {
                path: path.to_path_buf(),
                size: 0,
                modified: None,
                is_dir: false,
            },
        }
    }
}

/// A destination collision that needs a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    /// The session that hit the collision.
    pub session_id: SessionId,
    /// The entry already present at the destination.
    pub existing: EntryInfo,
    /// The entry about to be written there.
    pub incoming: EntryInfo,
}

impl Conflict {
    /// Create a conflict by probing both paths.
    pub fn probe(session_id: SessionId, existing: &Path, incoming: &Path) -> Self {
        Self {
            session_id,
            existing: EntryInfo::probe(existing),
            incoming: EntryInfo::probe(incoming),
        }
    }
}

/// How to resolve a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConflictDecision {
    /// Replace the existing entry (directories are merged).
    Overwrite,
    /// Write under a different name.
    ///
    /// `None` asks for an automatically generated name; a requested name that
    /// still collides gets a numeric suffix.
    Rename(Option<String>),
    /// Leave the existing entry alone and skip this item.
    #[default]
    Skip,
    /// Abort the entire session.
    Cancel,
}

/// A decision together with its "apply to all" flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictAnswer {
    /// The decision for this conflict.
    pub decision: ConflictDecision,
    /// Reuse this decision for every later conflict of the session.
    pub apply_to_all: bool,
}

impl ConflictAnswer {
    /// An answer for the current conflict only.
    pub fn once(decision: ConflictDecision) -> Self {
        Self {
            decision,
            apply_to_all: false,
        }
    }

    /// An answer that sticks for the rest of the session.
    pub fn for_all(decision: ConflictDecision) -> Self {
        Self {
            decision,
            apply_to_all: true,
        }
    }
}

/// Where conflict decisions come from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Emit a conflict event and wait for the caller to answer it.
    #[default]
    Prompt,
    /// Answer every conflict the same way without asking.
    Fixed(ConflictAnswer),
}

/// Resolves conflicts for a session, honoring its sticky decision.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    policy: ConflictPolicy,
}

impl ConflictResolver {
    /// Create a resolver backed by `policy`.
    pub fn new(policy: ConflictPolicy) -> Self {
        Self { policy }
    }

    /// Decide what to do about `conflict`.
    ///
    /// A `Rename` result always carries the final, non-colliding file name.
    pub async fn resolve(
        &self,
        session: &mut TransferSession,
        conflict: Conflict,
    ) -> ConflictDecision {
        let decision = match session.sticky_decision() {
            Some(sticky) => sticky.clone(),
            None => {
                let answer = match &self.policy {
                    ConflictPolicy::Fixed(answer) => answer.clone(),
                    ConflictPolicy::Prompt => session.handle().prompt(conflict.clone()).await,
                };
                if answer.apply_to_all && answer.decision != ConflictDecision::Cancel {
                    // A custom name only fits the item it was typed for.
                    let sticky = match &answer.decision {
                        ConflictDecision::Rename(_) => ConflictDecision::Rename(None),
                        other => other.clone(),
                    };
                    session.set_sticky_decision(sticky);
                }
                answer.decision
            }
        };

        debug!(
            session = %session.id(),
            existing = %conflict.existing.path.display(),
            ?decision,
            "Resolved conflict"
        );

        match decision {
            ConflictDecision::Rename(requested) => {
                let target = rename_target(&conflict.existing.path, requested.as_deref());
                let name = target
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned());
                ConflictDecision::Rename(name)
            }
            other => other,
        }
    }
}

/// Pick the path a renamed item is written to.
///
/// A requested name is honored when it is free; otherwise it (or the
/// original name) gets a numeric suffix.
pub(crate) fn rename_target(existing: &Path, requested: Option<&str>) -> PathBuf {
    let parent = existing.parent().unwrap_or(Path::new(""));
    let base = match requested {
        Some(name) if !name.is_empty() => parent.join(name),
        _ => existing.to_path_buf(),
    };

    if requested.is_some_and(|name| !name.is_empty()) && fs::symlink_metadata(&base).is_err() {
        return base;
    }
    auto_rename_path(&base)
}

/// Generate an auto-renamed path to avoid conflicts.
///
/// For "file.txt", tries "file (2).txt", "file (3).txt", etc.
pub fn auto_rename_path(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or(Path::new(""));
    let stem = path.file_stem().unwrap_or_default();
    let extension = path.extension();

    let mut n: u64 = 2;
    loop {
        let mut name = OsString::from(stem);
        name.push(format!(" ({n})"));
        if let Some(ext) = extension {
            name.push(".");
            name.push(ext);
        }

        let candidate = parent.join(&name);
        if fs::symlink_metadata(&candidate).is_err() {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_auto_rename_path() {
        let path = PathBuf::from("/nonexistent-dir/test.txt");
        let renamed = auto_rename_path(&path);
        assert_eq!(renamed, PathBuf::from("/nonexistent-dir/test (2).txt"));
    }

    #[test]
    fn test_auto_rename_no_extension() {
        let path = PathBuf::from("/nonexistent-dir/testfile");
        let renamed = auto_rename_path(&path);
        assert_eq!(renamed, PathBuf::from("/nonexistent-dir/testfile (2)"));
    }

    #[test]
    fn test_auto_rename_skips_taken_names() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.txt"), "1").unwrap();
        fs::write(temp.path().join("a (2).txt"), "2").unwrap();
        fs::write(temp.path().join("a (3).txt"), "3").unwrap();

        let renamed = auto_rename_path(&temp.path().join("a.txt"));
        assert_eq!(renamed, temp.path().join("a (4).txt"));
    }

    #[test]
    fn test_auto_rename_multi_dot() {
        let path = PathBuf::from("/nonexistent-dir/archive.tar.gz");
        assert_eq!(
            auto_rename_path(&path),
            PathBuf::from("/nonexistent-dir/archive.tar (2).gz")
        );
    }

    #[test]
    fn test_rename_target_prefers_requested_name() {
        let temp = TempDir::new().unwrap();
        let existing = temp.path().join("a.txt");
        fs::write(&existing, "x").unwrap();

        assert_eq!(
            rename_target(&existing, Some("b.txt")),
            temp.path().join("b.txt")
        );

        fs::write(temp.path().join("b.txt"), "y").unwrap();
        assert_eq!(
            rename_target(&existing, Some("b.txt")),
            temp.path().join("b (2).txt")
        );
        assert_eq!(rename_target(&existing, None), temp.path().join("a (2).txt"));
    }

    #[test]
    fn test_answer_constructors() {
        assert!(!ConflictAnswer::once(ConflictDecision::Skip).apply_to_all);
        assert!(ConflictAnswer::for_all(ConflictDecision::Overwrite).apply_to_all);
        assert_eq!(ConflictDecision::default(), ConflictDecision::Skip);
    }
}
