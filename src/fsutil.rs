use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{io_err, DcError};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn tmp_path_for(path: &Path) -> Result<PathBuf, DcError> {
    let parent = path
        .parent()
        .ok_or_else(|| io_err(path, std::io::Error::other("path has no parent")))?;
    let tmp_name = format!(
        ".{}.tmp-{}-{}",
        path.file_name().and_then(|v| v.to_str()).unwrap_or("entry"),
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed),
    );
    Ok(parent.join(tmp_name))
}

/// Write `content` to a hidden sibling and rename it into place, so readers
/// never observe a partially written file.
pub fn atomic_write_file(path: &Path, content: &[u8]) -> Result<(), DcError> {
    let tmp_path = tmp_path_for(path)?;
    {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)
            .map_err(|e| io_err(&tmp_path, e))?;
        file.write_all(content).map_err(|e| io_err(&tmp_path, e))?;
        file.sync_all().map_err(|e| io_err(&tmp_path, e))?;
    }
    fs::rename(&tmp_path, path).map_err(|e| io_err(path, e))
}

/// Copy `source` to `dest` through a hidden temporary file.
pub fn atomic_copy_file(source: &Path, dest: &Path) -> Result<u64, DcError> {
    let tmp_path = tmp_path_for(dest)?;
    let bytes = fs::copy(source, &tmp_path).map_err(|e| io_err(source, e))?;
    fs::rename(&tmp_path, dest).map_err(|e| io_err(dest, e))?;
    Ok(bytes)
}

/// Move `source` to `dest`, falling back to copy-and-remove when a rename
/// is not possible (different filesystems).
pub fn move_file(source: &Path, dest: &Path) -> Result<(), DcError> {
    match fs::rename(source, dest) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(io_err(source, err)),
        Err(_) => {
            atomic_copy_file(source, dest)?;
            fs::remove_file(source).map_err(|e| io_err(source, e))
        }
    }
}

/// Hidden temporaries start with a dot and are skipped by directory scans.
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

#[cfg(unix)]
pub fn make_executable(path: &Path) -> Result<(), DcError> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = fs::metadata(path).map_err(|e| io_err(path, e))?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    fs::set_permissions(path, perms).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
pub fn make_executable(_path: &Path) -> Result<(), DcError> {
    Ok(())
}
