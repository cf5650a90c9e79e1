//! Blocking file helpers used by the executor.
//!
//! Everything here runs inside `spawn_blocking`.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;

use filetime::FileTime;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use fileferry_core::TransferError;

/// Suffix of the temporary file content is written to before it is renamed into place.
const PART_SUFFIX: &str = ".part";

/// Options for a chunked copy.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CopyOptions {
    /// Bytes per read/write chunk.
    pub chunk_size: usize,
    /// Apply source permissions and mtime to the copy.
    pub preserve_metadata: bool,
}

/// Create a fresh hidden temporary file next to `dst`, e.g. `.report.pdf.x7Gq2k.part`.
///
/// The name is randomized and the file is created exclusively, so an existing
/// entry is never opened or truncated.
pub(crate) fn part_file(dst: &Path) -> io::Result<NamedTempFile> {
    let parent = match dst.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut prefix = OsString::from(".");
    if let Some(name) = dst.file_name() {
        prefix.push(name);
        prefix.push(".");
    }

    let mut builder = tempfile::Builder::new();
    builder.prefix(&prefix).suffix(PART_SUFFIX);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // The mode a plain `File::create` gets once the umask applies.
        builder.permissions(fs::Permissions::from_mode(0o666));
    }
    builder.tempfile_in(parent)
}

/// Copy `src` to `dst` in chunks, calling `on_chunk` with the byte count of each chunk.
///
/// Content goes to a uniquely named `.part` sibling first; metadata is
/// applied once all bytes are written and the file is then renamed over
/// `dst`. The cancel token is checked before every chunk. On error or
/// cancellation the temporary file is removed and `dst` is left untouched.
pub(crate) fn copy_file_chunked(
    src: &Path,
    dst: &Path,
    options: CopyOptions,
    cancel: &CancellationToken,
    mut on_chunk: impl FnMut(u64),
) -> Result<u64, TransferError> {
    let mut reader = File::open(src).map_err(|e| TransferError::io(src, e))?;
    let metadata = reader.metadata().map_err(|e| TransferError::io(src, e))?;

    // Dropping the temporary file on any early return deletes it.
    let mut temp = part_file(dst).map_err(|e| TransferError::io(dst, e))?;

    let mut buffer = vec![0u8; options.chunk_size.max(1)];
    let mut copied = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransferError::io(src, e)),
        };
        temp.write_all(&buffer[..read]).map_err(|e| TransferError::io(dst, e))?;
        copied += read as u64;
        on_chunk(read as u64);
    }
    temp.flush().map_err(|e| TransferError::io(dst, e))?;

    if options.preserve_metadata {
        if let Err(e) = apply_metadata(&metadata, temp.path()) {
            warn!(path = %dst.display(), error = %e, "Failed to preserve metadata");
        }
    }

    temp.persist(dst).map_err(|e| TransferError::io(dst, e.error))?;

    Ok(copied)
}

/// Copy permission bits and modification time from `metadata` onto `path`.
pub(crate) fn apply_metadata(metadata: &fs::Metadata, path: &Path) -> io::Result<()> {
    fs::set_permissions(path, metadata.permissions())?;
    let mtime = FileTime::from_last_modification_time(metadata);
    filetime::set_file_mtime(path, mtime)
}

/// Recreate the symbolic link `src` at `dst`.
pub(crate) fn copy_symlink(src: &Path, dst: &Path) -> Result<(), TransferError> {
    let target = fs::read_link(src).map_err(|e| TransferError::io(src, e))?;

    #[cfg(unix)]
    let result = std::os::unix::fs::symlink(&target, dst);

    #[cfg(windows)]
    let result = {
        let resolved = src.parent().map(|p| p.join(&target)).unwrap_or_else(|| target.clone());
        if resolved.is_dir() {
            std::os::windows::fs::symlink_dir(&target, dst)
        } else {
            std::os::windows::fs::symlink_file(&target, dst)
        }
    };

    #[cfg(not(any(unix, windows)))]
    let result: io::Result<()> = Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symbolic links are not supported on this platform",
    ));

    result.map_err(|e| TransferError::io(dst, e))
}

/// Remove a replaced entry so something else can take its place.
pub(crate) fn remove_entry(path: &Path) -> Result<(), TransferError> {
    let metadata = fs::symlink_metadata(path).map_err(|e| TransferError::io(path, e))?;
    let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|e| TransferError::io(path, e))
}

/// Remove a single file, symlink or empty directory.
pub(crate) fn remove_single(path: &Path) -> Result<(), TransferError> {
    let metadata = fs::symlink_metadata(path).map_err(|e| TransferError::io(path, e))?;
    let result = if metadata.is_dir() {
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|e| TransferError::io(path, e))
}

/// Finish a copy-based move: remove `src` only if `dst` has exactly `expected` bytes.
pub(crate) fn finish_move(src: &Path, dst: &Path, expected: u64) -> Result<(), TransferError> {
    let actual = fs::symlink_metadata(dst)
        .map_err(|e| TransferError::io(dst, e))?
        .len();
    if actual != expected {
        return Err(TransferError::SizeMismatch {
            path: dst.to_path_buf(),
            expected,
            actual,
        });
    }
    fs::remove_file(src).map_err(|e| TransferError::io(src, e))
}

/// Check whether two paths name the same filesystem entry.
///
/// Symbolic links are not followed: a link pointing at `a` is a different
/// entry from `a`.
#[cfg(unix)]
pub(crate) fn is_same_entry(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (fs::symlink_metadata(a), fs::symlink_metadata(b)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

/// Check whether two paths name the same filesystem entry.
///
/// Only the parent directories are resolved, so a link is never confused
/// with its target.
#[cfg(not(unix))]
pub(crate) fn is_same_entry(a: &Path, b: &Path) -> bool {
    fn location(path: &Path) -> Option<std::path::PathBuf> {
        let parent = path.parent().filter(|p| !p.as_os_str().is_empty())?;
        Some(fs::canonicalize(parent).ok()?.join(path.file_name()?))
    }

    match (location(a), location(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn options(chunk_size: usize) -> CopyOptions {
        CopyOptions {
            chunk_size,
            preserve_metadata: true,
        }
    }

    /// Names in `dir` that look like unfinished copies.
    fn part_files(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(PART_SUFFIX))
            .collect()
    }

    #[test]
    fn test_part_file_is_hidden_sibling() {
        let temp = TempDir::new().unwrap();
        let part = part_file(&temp.path().join("report.pdf")).unwrap();

        let name = part.path().file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(part.path().parent(), Some(temp.path()));
        assert!(name.starts_with(".report.pdf."));
        assert!(name.ends_with(".part"));
    }

    #[test]
    fn test_existing_part_file_is_left_alone() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src.txt");
        let dst = temp.path().join("report.pdf");
        let foreign = temp.path().join("report.pdf.part");
        fs::write(&src, "fresh").unwrap();
        fs::write(&foreign, "user data").unwrap();

        copy_file_chunked(&src, &dst, options(2), &CancellationToken::new(), |_| {}).unwrap();

        assert_eq!(fs::read_to_string(&dst).unwrap(), "fresh");
        assert_eq!(fs::read_to_string(&foreign).unwrap(), "user data");
        assert_eq!(part_files(temp.path()), vec!["report.pdf.part".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_link_is_not_same_entry_as_target() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("a.txt");
        let link = temp.path().join("link.txt");
        fs::write(&target, "a").unwrap();
        std::os::unix::fs::symlink(&target, &link).unwrap();

        assert!(is_same_entry(&target, &target));
        assert!(!is_same_entry(&target, &link));
        assert!(!is_same_entry(&target, &temp.path().join("missing")));
    }

    #[test]
    fn test_copy_in_chunks() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src.bin");
        let dst = temp.path().join("dst.bin");
        fs::write(&src, vec![7u8; 10_000]).unwrap();

        let mut chunks = Vec::new();
        let copied = copy_file_chunked(&src, &dst, options(4096), &CancellationToken::new(), |n| {
            chunks.push(n)
        })
        .unwrap();

        assert_eq!(copied, 10_000);
        assert_eq!(chunks, vec![4096, 4096, 1808]);
        assert_eq!(fs::read(&dst).unwrap(), vec![7u8; 10_000]);
        assert!(part_files(temp.path()).is_empty());
    }

    #[test]
    fn test_copy_preserves_mtime() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("old.txt");
        let dst = temp.path().join("new.txt");
        fs::write(&src, "content").unwrap();

        let past = SystemTime::now() - Duration::from_secs(86_400);
        filetime::set_file_mtime(&src, FileTime::from_system_time(past)).unwrap();

        copy_file_chunked(&src, &dst, options(1024), &CancellationToken::new(), |_| {}).unwrap();

        let src_mtime = FileTime::from_last_modification_time(&fs::metadata(&src).unwrap());
        let dst_mtime = FileTime::from_last_modification_time(&fs::metadata(&dst).unwrap());
        assert_eq!(src_mtime.unix_seconds(), dst_mtime.unix_seconds());
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_preserves_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let src = temp.path().join("script.sh");
        let dst = temp.path().join("copy.sh");
        fs::write(&src, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&src, fs::Permissions::from_mode(0o750)).unwrap();

        copy_file_chunked(&src, &dst, options(1024), &CancellationToken::new(), |_| {}).unwrap();

        let mode = fs::metadata(&dst).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o750);
    }

    #[test]
    fn test_cancelled_copy_leaves_nothing() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src.bin");
        let dst = temp.path().join("dst.bin");
        fs::write(&src, vec![1u8; 8192]).unwrap();

        let token = CancellationToken::new();
        let cancel = token.clone();
        let result = copy_file_chunked(&src, &dst, options(1024), &token, |_| cancel.cancel());

        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert!(!dst.exists());
        assert!(part_files(temp.path()).is_empty());
    }

    #[test]
    fn test_copy_overwrites_existing_destination() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src.txt");
        let dst = temp.path().join("dst.txt");
        fs::write(&src, "new").unwrap();
        fs::write(&dst, "old old old").unwrap();

        copy_file_chunked(&src, &dst, options(2), &CancellationToken::new(), |_| {}).unwrap();
        assert_eq!(fs::read_to_string(&dst).unwrap(), "new");
    }

    #[test]
    fn test_finish_move_rejects_size_mismatch() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src.bin");
        let dst = temp.path().join("dst.bin");
        fs::write(&src, vec![0u8; 100]).unwrap();
        fs::write(&dst, vec![0u8; 40]).unwrap();

        let result = finish_move(&src, &dst, 100);
        assert!(matches!(
            result,
            Err(TransferError::SizeMismatch {
                expected: 100,
                actual: 40,
                ..
            })
        ));
        assert!(src.exists());
    }

    #[test]
    fn test_finish_move_removes_source_when_sizes_match() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src.bin");
        let dst = temp.path().join("dst.bin");
        fs::write(&src, vec![0u8; 100]).unwrap();
        fs::write(&dst, vec![0u8; 100]).unwrap();

        finish_move(&src, &dst, 100).unwrap();
        assert!(!src.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_symlink_keeps_target() {
        let temp = TempDir::new().unwrap();
        let link = temp.path().join("link");
        let copy = temp.path().join("copy");
        std::os::unix::fs::symlink("target.txt", &link).unwrap();

        copy_symlink(&link, &copy).unwrap();
        assert_eq!(fs::read_link(&copy).unwrap(), PathBuf::from("target.txt"));
    }
}
