//! File-based mailboxes shared by the master and a running client.
//!
//! Each box is a directory under the WU working directory holding one file
//! per entry. Entries are written atomically (hidden temporary + rename) and
//! consumed oldest-first; reading an entry deletes it.
//!
//! - [`BoxKind::Client`]: master → client messages.
//! - [`BoxKind::Master`]: client → master messages.
//! - [`BoxKind::Subresult`]: client → master named sub-result files.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

use crate::error::{io_err, DcError};
use crate::fsutil;

static ENTRY_COUNTER: AtomicU64 = AtomicU64::new(0);

// Separates the ordering prefix from the logical name in sub-result entries.
const NAME_SEPARATOR: &str = "--";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxKind {
    Client,
    Master,
    Subresult,
}

impl BoxKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            BoxKind::Client => "ClientMessageBox",
            BoxKind::Master => "MasterMessageBox",
            BoxKind::Subresult => "SubresultBox",
        }
    }

    pub const ALL: [BoxKind; 3] = [BoxKind::Client, BoxKind::Master, BoxKind::Subresult];
}

/// A consumed sub-result entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubresultEntry {
    pub logical_name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Mailbox {
    kind: BoxKind,
    dir: PathBuf,
}

impl Mailbox {
    /// Refer to the box of `kind` under `root`; nothing is created.
    pub fn open(root: &Path, kind: BoxKind) -> Self {
        Self {
            kind,
            dir: root.join(kind.dir_name()),
        }
    }

    /// Create every box under `root`.
    pub fn create_all(root: &Path) -> Result<(), DcError> {
        for kind in BoxKind::ALL {
            Mailbox::open(root, kind).ensure()?;
        }
        Ok(())
    }

    pub fn kind(&self) -> BoxKind {
        self.kind
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure(&self) -> Result<(), DcError> {
        fs::create_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))
    }

    /// Post a free-form text message.
    pub fn post_message(&self, text: &str) -> Result<PathBuf, DcError> {
        self.ensure()?;
        let path = self.dir.join(format!("{}.msg", entry_prefix()));
        fsutil::atomic_write_file(&path, text.as_bytes())?;
        Ok(path)
    }

    /// Post a copy of `source` under `logical_name`.
    pub fn post_file(&self, logical_name: &str, source: &Path) -> Result<PathBuf, DcError> {
        self.ensure()?;
        let path = self
            .dir
            .join(format!("{}{NAME_SEPARATOR}{logical_name}", entry_prefix()));
        fsutil::atomic_copy_file(source, &path)?;
        Ok(path)
    }

    /// Number of entries waiting. A missing box counts as empty.
    pub fn pending(&self) -> Result<usize, DcError> {
        Ok(self.sorted_entries()?.len())
    }

    /// Read and delete the oldest text message. Invalid UTF-8 is replaced
    /// with U+FFFD.
    pub fn take_message(&self) -> Result<Option<String>, DcError> {
        let Some(path) = self.sorted_entries()?.into_iter().next() else {
            return Ok(None);
        };
        let bytes = fs::read(&path).map_err(|e| io_err(&path, e))?;
        fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Move the oldest sub-result file into `dest_dir`, named after its
    /// logical name.
    pub fn take_file(&self, dest_dir: &Path) -> Result<Option<SubresultEntry>, DcError> {
        let Some(path) = self.sorted_entries()?.into_iter().next() else {
            return Ok(None);
        };
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let logical_name = file_name
            .split_once(NAME_SEPARATOR)
            .map(|(_, name)| name.to_string())
            .unwrap_or(file_name);

        fs::create_dir_all(dest_dir).map_err(|e| io_err(dest_dir, e))?;
        let dest = dest_dir.join(&logical_name);
        fsutil::move_file(&path, &dest)?;
        Ok(Some(SubresultEntry {
            logical_name,
            path: dest,
        }))
    }

    fn sorted_entries(&self) -> Result<Vec<PathBuf>, DcError> {
        let read = match fs::read_dir(&self.dir) {
            Ok(read) => read,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_err(&self.dir, err)),
        };

        let mut entries = Vec::new();
        for entry in read {
            let entry = entry.map_err(|e| io_err(&self.dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if fsutil::is_hidden(&name) || !entry.path().is_file() {
                continue;
            }
            entries.push((name, entry.path()));
        }
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(entries.into_iter().map(|(_, path)| path).collect())
    }
}

// Zero-padded nanosecond timestamp plus a process-local counter, so entry
// names sort in posting order.
fn entry_prefix() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let counter = ENTRY_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{nanos:020}-{:010}-{counter:08}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn messages_are_consumed_in_order() {
        let tmp = TempDir::new().unwrap();
        let mbox = Mailbox::open(tmp.path(), BoxKind::Master);
        mbox.post_message("first").unwrap();
        mbox.post_message("second").unwrap();
        assert_eq!(mbox.pending().unwrap(), 2);

        assert_eq!(mbox.take_message().unwrap().as_deref(), Some("first"));
        assert_eq!(mbox.take_message().unwrap().as_deref(), Some("second"));
        assert_eq!(mbox.take_message().unwrap(), None);
        assert_eq!(mbox.pending().unwrap(), 0);
    }

    #[test]
    fn undecodable_message_is_consumed() {
        let tmp = TempDir::new().unwrap();
        let mbox = Mailbox::open(tmp.path(), BoxKind::Master);
        mbox.ensure().unwrap();
        fs::write(mbox.dir().join("00000000000000000000-x.msg"), [0xff, 0xfe, b'o', b'k']).unwrap();
        mbox.post_message("next").unwrap();

        assert_eq!(mbox.take_message().unwrap().as_deref(), Some("\u{fffd}\u{fffd}ok"));
        assert_eq!(mbox.take_message().unwrap().as_deref(), Some("next"));
        assert_eq!(mbox.pending().unwrap(), 0);
    }

    #[test]
    fn missing_box_is_empty() {
        let tmp = TempDir::new().unwrap();
        let mbox = Mailbox::open(&tmp.path().join("nowhere"), BoxKind::Client);
        assert_eq!(mbox.pending().unwrap(), 0);
        assert!(mbox.take_message().unwrap().is_none());
    }

    #[test]
    fn subresult_files_keep_logical_names() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("partial.dat");
        fs::write(&src, "42").unwrap();

        let mbox = Mailbox::open(tmp.path(), BoxKind::Subresult);
        mbox.post_file("partial-1.dat", &src).unwrap();
        assert!(src.exists());

        let dest = tmp.path().join("subresults");
        let entry = mbox.take_file(&dest).unwrap().unwrap();
        assert_eq!(entry.logical_name, "partial-1.dat");
        assert_eq!(entry.path, dest.join("partial-1.dat"));
        assert_eq!(fs::read_to_string(&entry.path).unwrap(), "42");
        assert_eq!(mbox.pending().unwrap(), 0);
    }

    #[test]
    fn hidden_temporaries_are_ignored() {
        let tmp = TempDir::new().unwrap();
        let mbox = Mailbox::open(tmp.path(), BoxKind::Client);
        mbox.ensure().unwrap();
        fs::write(mbox.dir().join(".half-written.tmp"), "x").unwrap();
        assert_eq!(mbox.pending().unwrap(), 0);
    }

    #[test]
    fn create_all_makes_three_boxes() {
        let tmp = TempDir::new().unwrap();
        Mailbox::create_all(tmp.path()).unwrap();
        for name in ["ClientMessageBox", "MasterMessageBox", "SubresultBox"] {
            assert!(tmp.path().join(name).is_dir());
        }
    }
}
