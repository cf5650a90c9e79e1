//! Recursion guard for copy and move requests.
//!
//! Rejects requests whose destination is a source itself or lies inside a
//! source directory. Paths are compared lexically first and then again with
//! symbolic links resolved, so a destination that reaches back into a source
//! through a link is caught as well.

use std::fs;
use std::path::{Component, Path, PathBuf};

use fileferry_core::{RecursionError, TransferKind};

/// Validate that `destination` does not lie within any of `sources`.
///
/// Deletions have no destination and always pass. Sources that do not exist
/// are ignored here; the planner reports them.
pub fn validate(
    sources: &[PathBuf],
    destination: &Path,
    kind: TransferKind,
) -> Result<(), RecursionError> {
    if kind == TransferKind::Delete {
        return Ok(());
    }

    let destination = normalize(destination);
    let resolved_destination = resolve(&destination);

    for source in sources {
        let source = normalize(source);

        if destination == source {
            return Err(RecursionError::SelfCopy { path: source });
        }

        // Moving an item into the directory it already lives in is a no-op rename onto itself.
        if kind == TransferKind::Move && source.parent() == Some(destination.as_path()) {
            return Err(RecursionError::SelfCopy { path: source });
        }

        let Ok(metadata) = fs::symlink_metadata(&source) else {
            continue;
        };
        if !metadata.is_dir() {
            continue;
        }

        if destination.starts_with(&source) {
            return Err(RecursionError::DestinationInsideSource {
                directory: source,
                destination,
            });
        }

        let resolved_source = resolve(&source);
        if resolved_destination == resolved_source {
            return Err(RecursionError::SelfCopy { path: source });
        }
        if resolved_destination.starts_with(&resolved_source) {
            return Err(match kind {
                TransferKind::Move => RecursionError::SourceInsideDestinationCycle {
                    directory: source,
                    destination,
                },
                _ => RecursionError::DestinationInsideSource {
                    directory: source,
                    destination,
                },
            });
        }
    }

    Ok(())
}

/// Make `path` absolute and fold `.` and `..` components without touching the filesystem.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut normalized = PathBuf::new();

    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }

    normalized
}

/// Resolve symbolic links in `path`.
///
/// The longest existing ancestor is canonicalized and the remaining,
/// not-yet-existing components are appended unchanged.
fn resolve(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut rest = Vec::new();

    loop {
        if let Ok(canonical) = fs::canonicalize(existing) {
            let mut resolved = canonical;
            for name in rest.iter().rev() {
                resolved.push(name);
            }
            return resolved;
        }

        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}
