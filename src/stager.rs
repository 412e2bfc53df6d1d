//! Input staging and output resolution for WU working directories.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{io_err, DcError};
use crate::fsutil;
use crate::mailbox::BoxKind;
use crate::workunit::{InputFile, TransferMode};

/// File names beginning with this prefix belong to the backends.
pub const RESERVED_PREFIX: &str = "dc_";

/// Fetches remote inputs. Network transport lives outside this crate.
pub trait UrlFetcher: Send + Sync {
    fn fetch(&self, url: &str, dest: &Path) -> std::io::Result<()>;
}

/// Fetcher used when the application provides none.
#[derive(Debug, Default)]
pub struct NoUrlFetcher;

impl UrlFetcher for NoUrlFetcher {
    fn fetch(&self, url: &str, _dest: &Path) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("no URL fetcher configured for {url}"),
        ))
    }
}

pub fn is_url(source: &str) -> bool {
    source.contains("://")
}

/// Reject logical names that could escape the working directory or clash
/// with backend-owned files.
pub fn validate_logical_name(name: &str) -> Result<(), DcError> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(DcError::BadParam(format!("invalid logical file name `{name}`")));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(DcError::BadParam(format!(
            "logical file name `{name}` contains a path separator"
        )));
    }
    if name.starts_with(RESERVED_PREFIX) || BoxKind::ALL.iter().any(|k| k.dir_name() == name) {
        return Err(DcError::BadParam(format!("logical file name `{name}` is reserved")));
    }
    Ok(())
}

pub struct FileStager {
    persistent_dir: PathBuf,
    fetcher: Arc<dyn UrlFetcher>,
}

impl FileStager {
    pub fn new(persistent_dir: PathBuf, fetcher: Arc<dyn UrlFetcher>) -> Self {
        Self {
            persistent_dir,
            fetcher,
        }
    }

    /// Materialize `source` as `workdir/logical_name` according to `mode`.
    ///
    /// On error nothing is left at the destination and, for volatile
    /// inputs, the source is untouched.
    pub fn stage_input(
        &self,
        workdir: &Path,
        logical_name: &str,
        source: &str,
        mode: TransferMode,
    ) -> Result<PathBuf, DcError> {
        validate_logical_name(logical_name)?;
        let dest = workdir.join(logical_name);

        match mode {
            TransferMode::Regular => self.fetch_or_copy(source, &dest)?,
            TransferMode::Persistent => {
                let cached = self.ensure_cached(source)?;
                fsutil::atomic_copy_file(&cached, &dest)?;
            }
            TransferMode::Volatile => {
                if is_url(source) {
                    return Err(DcError::BadParam(format!(
                        "volatile transfer needs a local file, got {source}"
                    )));
                }
                fsutil::move_file(Path::new(source), &dest)?;
            }
        }

        debug!(logical_name, source, %mode, dest = %dest.display(), "staged input");
        Ok(dest)
    }

    /// Whether a persistent artifact for `source` is already cached.
    pub fn is_cached(&self, source: &str) -> bool {
        self.cache_path(source).is_file()
    }

    /// Copy already staged inputs from one working directory to another.
    pub fn restage(
        &self,
        inputs: &[InputFile],
        old_dir: &Path,
        new_dir: &Path,
    ) -> Result<(), DcError> {
        for input in inputs {
            let from = old_dir.join(&input.logical_name);
            let to = new_dir.join(&input.logical_name);
            if from.is_file() {
                fsutil::atomic_copy_file(&from, &to)?;
            } else if input.mode != TransferMode::Volatile {
                // The staged copy is gone; go back to the origin.
                match input.mode {
                    TransferMode::Persistent => {
                        let cached = self.ensure_cached(&input.source)?;
                        fsutil::atomic_copy_file(&cached, &to)?;
                    }
                    _ => self.fetch_or_copy(&input.source, &to)?,
                }
            } else {
                return Err(DcError::Internal(format!(
                    "volatile input `{}` no longer exists in {}",
                    input.logical_name,
                    old_dir.display()
                )));
            }
        }
        Ok(())
    }

    /// Map declared outputs to the files present in `dir`.
    pub fn resolve_outputs(&self, outputs: &[String], dir: &Path) -> BTreeMap<String, PathBuf> {
        let mut found = BTreeMap::new();
        for name in outputs {
            let path = dir.join(name);
            if path.is_file() {
                found.insert(name.clone(), path);
            } else {
                warn!(output = %name, dir = %dir.display(), "declared output file is missing");
            }
        }
        found
    }

    fn fetch_or_copy(&self, source: &str, dest: &Path) -> Result<(), DcError> {
        if is_url(source) {
            self.fetcher
                .fetch(source, dest)
                .map_err(|e| io_err(dest, e))?;
        } else {
            fsutil::atomic_copy_file(Path::new(source), dest)?;
        }
        Ok(())
    }

    fn cache_path(&self, source: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        let digest = hasher.finalize();
        let key = digest
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<String>();
        self.persistent_dir.join(key)
    }

    fn ensure_cached(&self, source: &str) -> Result<PathBuf, DcError> {
        let cached = self.cache_path(source);
        if cached.is_file() {
            debug!(source, cached = %cached.display(), "reusing persistent input");
            return Ok(cached);
        }
        fs::create_dir_all(&self.persistent_dir).map_err(|e| io_err(&self.persistent_dir, e))?;
        if is_url(source) {
            let partial = cached.with_extension("partial");
            self.fetcher
                .fetch(source, &partial)
                .map_err(|e| io_err(&partial, e))?;
            fs::rename(&partial, &cached).map_err(|e| io_err(&cached, e))?;
        } else {
            fsutil::atomic_copy_file(Path::new(source), &cached)?;
        }
        Ok(cached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingFetcher {
        calls: AtomicUsize,
    }

    impl UrlFetcher for CountingFetcher {
        fn fetch(&self, url: &str, dest: &Path) -> std::io::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            fs::write(dest, format!("fetched {url}"))
        }
    }

    fn stager(root: &Path) -> FileStager {
        FileStager::new(root.join(".persistent"), Arc::new(NoUrlFetcher))
    }

    #[test]
    fn rejects_separators_and_reserved_names() {
        for bad in ["a/b", "a\\b", "", ".", "..", "dc_client.toml", "SubresultBox"] {
            let err = validate_logical_name(bad).unwrap_err();
            assert_eq!(err.code(), crate::error::ErrorCode::BadParam, "{bad}");
        }
        assert!(validate_logical_name("in.txt").is_ok());
    }

    #[test]
    fn regular_copy_keeps_source() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("a.txt");
        fs::write(&src, "hello").unwrap();
        let wd = tmp.path().join("wu");
        fs::create_dir_all(&wd).unwrap();

        let dest = stager(tmp.path())
            .stage_input(&wd, "in.txt", src.to_str().unwrap(), TransferMode::Regular)
            .unwrap();
        assert_eq!(fs::read_to_string(dest).unwrap(), "hello");
        assert!(src.exists());
    }

    #[test]
    fn volatile_moves_source() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("a.txt");
        fs::write(&src, "bye").unwrap();
        let wd = tmp.path().join("wu");
        fs::create_dir_all(&wd).unwrap();

        stager(tmp.path())
            .stage_input(&wd, "in.txt", src.to_str().unwrap(), TransferMode::Volatile)
            .unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read_to_string(wd.join("in.txt")).unwrap(), "bye");
    }

    #[test]
    fn missing_source_is_a_system_error() {
        let tmp = TempDir::new().unwrap();
        let wd = tmp.path().join("wu");
        fs::create_dir_all(&wd).unwrap();
        let err = stager(tmp.path())
            .stage_input(&wd, "in.txt", "/no/such/file", TransferMode::Regular)
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::System);
        assert!(!wd.join("in.txt").exists());
    }

    #[test]
    fn url_without_fetcher_fails() {
        let tmp = TempDir::new().unwrap();
        let err = stager(tmp.path())
            .stage_input(tmp.path(), "in.txt", "http://example.org/x", TransferMode::Regular)
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::System);
    }

    #[test]
    fn persistent_url_is_fetched_once() {
        let tmp = TempDir::new().unwrap();
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
        });
        let stager = FileStager::new(tmp.path().join(".persistent"), fetcher.clone());
        let url = "http://example.org/big.dat";

        for wu in ["wu1", "wu2"] {
            let wd = tmp.path().join(wu);
            fs::create_dir_all(&wd).unwrap();
            stager
                .stage_input(&wd, "big.dat", url, TransferMode::Persistent)
                .unwrap();
            assert_eq!(
                fs::read_to_string(wd.join("big.dat")).unwrap(),
                format!("fetched {url}")
            );
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(stager.is_cached(url));
    }

    #[test]
    fn resolve_outputs_skips_missing() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("out.txt"), "r").unwrap();
        let found = stager(tmp.path())
            .resolve_outputs(&["out.txt".to_string(), "gone.txt".to_string()], tmp.path());
        assert_eq!(found.len(), 1);
        assert_eq!(found["out.txt"], tmp.path().join("out.txt"));
    }

    #[test]
    fn restage_copies_into_new_dir() {
        let tmp = TempDir::new().unwrap();
        let old = tmp.path().join("old");
        let new = tmp.path().join("new");
        fs::create_dir_all(&old).unwrap();
        fs::create_dir_all(&new).unwrap();
        fs::write(old.join("in.txt"), "data").unwrap();
        let inputs = vec![InputFile {
            logical_name: "in.txt".into(),
            source: "/gone/a.txt".into(),
            mode: TransferMode::Volatile,
        }];
        stager(tmp.path()).restage(&inputs, &old, &new).unwrap();
        assert_eq!(fs::read_to_string(new.join("in.txt")).unwrap(), "data");
    }
}
