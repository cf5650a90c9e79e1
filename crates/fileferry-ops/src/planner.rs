//! Transfer planning.
//!
//! Turns a [`TransferRequest`] into an ordered [`TransferPlan`] without
//! modifying the filesystem. Directory trees are walked depth-first in
//! lexicographic order so the same tree always yields the same plan.

use std::fs;
use std::path::{Path, PathBuf};

use jwalk::{Parallelism, WalkDir};
use tracing::{debug, warn};

use fileferry_core::{DeleteMode, PlanError, TransferPlan, TransferRequest, TransferStep};

use crate::guard;

/// Build the plan for a request.
///
/// Fails with [`PlanError::RecursionViolation`] if the request would copy or
/// move a directory into itself; this is the only place the guard runs.
pub fn plan(request: &TransferRequest) -> Result<TransferPlan, PlanError> {
    if request.sources().is_empty() {
        return Err(PlanError::EmptyRequest);
    }

    let sources: Vec<PathBuf> = request
        .sources()
        .iter()
        .map(|source| guard::normalize(source))
        .collect();

    let destination = match request.destination() {
        Some(destination) => {
            let destination = guard::normalize(destination);
            guard::validate(&sources, &destination, request.kind())?;
            check_destination(&destination)?;
            Some(destination)
        }
        None => None,
    };

    let mut steps = Vec::new();
    for source in &sources {
        let metadata = fs::symlink_metadata(source).map_err(|e| PlanError::io(source, e))?;

        let target = destination
            .as_deref()
            .map(|destination| target_path(source, destination))
            .transpose()?;

        match (request, target) {
            (TransferRequest::Copy { .. }, Some(target)) => {
                if metadata.is_dir() {
                    plan_copy_tree(source, &target, &mut steps)?;
                } else if metadata.file_type().is_symlink() {
                    steps.push(TransferStep::CopySymlink {
                        src: source.clone(),
                        dst: target,
                    });
                } else {
                    steps.push(TransferStep::CopyFile {
                        src: source.clone(),
                        dst: target,
                        size: metadata.len(),
                    });
                }
            }
            (TransferRequest::Move { .. }, Some(target)) => {
                if metadata.is_dir() {
                    plan_move_tree(source, &target, &mut steps)?;
                } else {
                    steps.push(TransferStep::MoveFile {
                        src: source.clone(),
                        dst: target,
                        size: file_size(&metadata),
                    });
                }
            }
            (TransferRequest::Delete { mode, .. }, _) => match mode {
                DeleteMode::Trash => steps.push(TransferStep::RemovePath {
                    path: source.clone(),
                    permanent: false,
                }),
                DeleteMode::Permanent if metadata.is_dir() => {
                    plan_delete_tree(source, &mut steps)?;
                }
                DeleteMode::Permanent => steps.push(TransferStep::RemovePath {
                    path: source.clone(),
                    permanent: true,
                }),
            },
            // Copy and move requests always carry a destination.
            (_, None) => {}
        }
    }

    let plan = TransferPlan::new(request.kind(), destination, steps);
    debug!(
        kind = %plan.kind,
        steps = plan.len(),
        total_bytes = plan.total_bytes,
        "Planned transfer"
    );
    Ok(plan)
}

/// A missing destination is created at execution time; anything but a directory is rejected.
fn check_destination(destination: &Path) -> Result<(), PlanError> {
    match fs::metadata(destination) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(PlanError::DestinationNotDirectory {
            path: destination.to_path_buf(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PlanError::io(destination, e)),
    }
}

fn target_path(source: &Path, destination: &Path) -> Result<PathBuf, PlanError> {
    let name = source.file_name().ok_or_else(|| PlanError::Io {
        path: source.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"),
    })?;
    Ok(destination.join(name))
}

fn file_size(metadata: &fs::Metadata) -> u64 {
    if metadata.file_type().is_symlink() {
        0
    } else {
        metadata.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Directory,
    File,
    Symlink,
}

#[derive(Debug)]
struct WalkEntry {
    path: PathBuf,
    depth: usize,
    kind: EntryKind,
    size: u64,
}

/// A directory visit in depth-first order.
enum Visit<'a> {
    /// Reached an entry (directories before their children).
    Enter(&'a WalkEntry),
    /// Left a directory after all of its children.
    Leave(&'a WalkEntry),
}

/// Walk `root` depth-first with children sorted by name.
fn walk(root: &Path) -> Result<Vec<WalkEntry>, PlanError> {
    let walker = WalkDir::new(root)
        .parallelism(Parallelism::Serial)
        .sort(true)
        .skip_hidden(false)
        .follow_links(false);

    let mut entries = Vec::new();
    for entry_result in walker {
        let entry = entry_result.map_err(|err| {
            let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            let kind = err
                .io_error()
                .map(std::io::Error::kind)
                .unwrap_or(std::io::ErrorKind::Other);
            PlanError::io(path, std::io::Error::new(kind, err.to_string()))
        })?;

        let path = entry.path();
        let file_type = entry.file_type();
        let (kind, size) = if file_type.is_dir() {
            (EntryKind::Directory, 0)
        } else if file_type.is_symlink() {
            (EntryKind::Symlink, 0)
        } else if file_type.is_file() {
            let metadata = fs::symlink_metadata(&path).map_err(|e| PlanError::io(&path, e))?;
            (EntryKind::File, metadata.len())
        } else {
            warn!(path = %path.display(), "Skipping special file");
            continue;
        };

        entries.push(WalkEntry {
            path,
            depth: entry.depth(),
            kind,
            size,
        });
    }

    Ok(entries)
}

/// Interleave directory exits into a pre-order listing.
fn visits(entries: &[WalkEntry]) -> Vec<Visit<'_>> {
    let mut visits = Vec::with_capacity(entries.len() * 2);
    let mut open: Vec<&WalkEntry> = Vec::new();

    for entry in entries {
        while open.last().is_some_and(|dir| dir.depth >= entry.depth) {
            if let Some(dir) = open.pop() {
                visits.push(Visit::Leave(dir));
            }
        }
        visits.push(Visit::Enter(entry));
        if entry.kind == EntryKind::Directory {
            open.push(entry);
        }
    }
    while let Some(dir) = open.pop() {
        visits.push(Visit::Leave(dir));
    }

    visits
}

fn relocate(path: &Path, root: &Path, target: &Path) -> PathBuf {
    match path.strip_prefix(root) {
        Ok(relative) if relative.as_os_str().is_empty() => target.to_path_buf(),
        Ok(relative) => target.join(relative),
        Err(_) => target.to_path_buf(),
    }
}

fn plan_copy_tree(root: &Path, target: &Path, steps: &mut Vec<TransferStep>) -> Result<(), PlanError> {
    for entry in walk(root)? {
        let src = entry.path.clone();
        let dst = relocate(&entry.path, root, target);
        steps.push(match entry.kind {
            EntryKind::Directory => TransferStep::CreateDirectory { src, dst },
            EntryKind::Symlink => TransferStep::CopySymlink { src, dst },
            EntryKind::File => TransferStep::CopyFile {
                src,
                dst,
                size: entry.size,
            },
        });
    }
    Ok(())
}

fn plan_move_tree(root: &Path, target: &Path, steps: &mut Vec<TransferStep>) -> Result<(), PlanError> {
    let entries = walk(root)?;
    for visit in visits(&entries) {
        match visit {
            Visit::Enter(entry) => {
                let src = entry.path.clone();
                let dst = relocate(&entry.path, root, target);
                steps.push(match entry.kind {
                    EntryKind::Directory => TransferStep::CreateDirectory { src, dst },
                    EntryKind::File | EntryKind::Symlink => TransferStep::MoveFile {
                        src,
                        dst,
                        size: entry.size,
                    },
                });
            }
            Visit::Leave(dir) => steps.push(TransferStep::RemovePath {
                path: dir.path.clone(),
                permanent: true,
            }),
        }
    }
    Ok(())
}

fn plan_delete_tree(root: &Path, steps: &mut Vec<TransferStep>) -> Result<(), PlanError> {
    let entries = walk(root)?;
    for visit in visits(&entries) {
        match visit {
            Visit::Enter(entry) if entry.kind != EntryKind::Directory => {
                steps.push(TransferStep::RemovePath {
                    path: entry.path.clone(),
                    permanent: true,
                });
            }
            Visit::Enter(_) => {}
            Visit::Leave(dir) => steps.push(TransferStep::RemovePath {
                path: dir.path.clone(),
                permanent: true,
            }),
        }
    }
    Ok(())
}
