//! API for the client executable running inside a WU working directory.
//!
//! The master writes [`ClientDescriptor`] into the working directory on
//! submit; [`ClientContext::open`] reads it back and gives the client the
//! other half of the mailbox protocol.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{io_err, DcError};
use crate::fsutil;
use crate::mailbox::{BoxKind, Mailbox};
use crate::stager::validate_logical_name;
use crate::workunit::WorkUnit;

pub const CLIENT_DESCRIPTOR_FILE: &str = "dc_client.toml";
/// Logical name a client uses to locate its checkpoint file.
pub const CHECKPOINT_LABEL: &str = "checkpoint";
pub const CHECKPOINT_FILE: &str = "dc_checkpoint";
pub const PROGRESS_FILE: &str = "dc_progress";

/// Parameters the master hands to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDescriptor {
    pub wu_name: String,
    pub max_subresults: u32,
    pub max_message_size: usize,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl ClientDescriptor {
    pub fn for_wu(wu: &WorkUnit, max_message_size: usize) -> Self {
        Self {
            wu_name: wu.name.clone(),
            max_subresults: wu.subresult_budget_left(),
            max_message_size,
            inputs: wu.inputs.iter().map(|f| f.logical_name.clone()).collect(),
            outputs: wu.outputs.clone(),
        }
    }

    pub fn write(&self, dir: &Path) -> Result<PathBuf, DcError> {
        let text = toml::to_string(self)
            .map_err(|e| DcError::Internal(format!("cannot encode client descriptor: {e}")))?;
        let path = dir.join(CLIENT_DESCRIPTOR_FILE);
        fsutil::atomic_write_file(&path, text.as_bytes())?;
        Ok(path)
    }

    pub fn read(dir: &Path) -> Result<Self, DcError> {
        let path = dir.join(CLIENT_DESCRIPTOR_FILE);
        let text = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        Ok(toml::from_str(&text)?)
    }
}

/// Client-side view of one WU.
#[derive(Debug)]
pub struct ClientContext {
    dir: PathBuf,
    descriptor: ClientDescriptor,
    subresults_sent: u32,
}

impl ClientContext {
    pub fn open(dir: &Path) -> Result<Self, DcError> {
        let descriptor = ClientDescriptor::read(dir)?;
        debug!(wu = %descriptor.wu_name, dir = %dir.display(), "opened client context");
        Ok(Self {
            dir: dir.to_path_buf(),
            descriptor,
            subresults_sent: 0,
        })
    }

    /// Open the context of the working directory named by `DC_WORKDIR`, or
    /// of the current directory.
    pub fn from_env() -> Result<Self, DcError> {
        let dir = match std::env::var_os("DC_WORKDIR") {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir().map_err(|e| io_err(Path::new("."), e))?,
        };
        Self::open(&dir)
    }

    pub fn wu_name(&self) -> &str {
        &self.descriptor.wu_name
    }

    pub fn descriptor(&self) -> &ClientDescriptor {
        &self.descriptor
    }

    /// Physical path of an input, an output or the checkpoint file.
    pub fn resolve_file_name(&self, logical_name: &str) -> Result<PathBuf, DcError> {
        if logical_name == CHECKPOINT_LABEL {
            return Ok(self.dir.join(CHECKPOINT_FILE));
        }
        let known = self.descriptor.inputs.iter().any(|n| n == logical_name)
            || self.descriptor.outputs.iter().any(|n| n == logical_name);
        if !known {
            return Err(DcError::BadParam(format!(
                "`{logical_name}` is not an input or output of {}",
                self.descriptor.wu_name
            )));
        }
        Ok(self.dir.join(logical_name))
    }

    /// The checkpoint left by a previous run, if any.
    pub fn last_checkpoint(&self) -> Option<PathBuf> {
        let path = self.dir.join(CHECKPOINT_FILE);
        path.is_file().then_some(path)
    }

    pub fn send_subresult(&mut self, logical_name: &str, path: &Path) -> Result<(), DcError> {
        validate_logical_name(logical_name)?;
        if self.subresults_sent >= self.descriptor.max_subresults {
            return Err(DcError::TooMany(format!(
                "sub-result budget of {} exhausted",
                self.descriptor.max_subresults
            )));
        }
        Mailbox::open(&self.dir, BoxKind::Subresult).post_file(logical_name, path)?;
        self.subresults_sent += 1;
        Ok(())
    }

    pub fn send_message(&self, text: &str) -> Result<(), DcError> {
        if text.len() > self.descriptor.max_message_size {
            return Err(DcError::BadParam(format!(
                "message of {} bytes exceeds the limit of {}",
                text.len(),
                self.descriptor.max_message_size
            )));
        }
        Mailbox::open(&self.dir, BoxKind::Master).post_message(text)?;
        Ok(())
    }

    /// Consume the next message sent by the master.
    pub fn check_event(&self) -> Result<Option<String>, DcError> {
        Mailbox::open(&self.dir, BoxKind::Client).take_message()
    }

    /// Record `path` as the latest checkpoint.
    pub fn checkpoint_made(&self, path: &Path) -> Result<(), DcError> {
        let target = self.dir.join(CHECKPOINT_FILE);
        if path != target {
            fsutil::atomic_copy_file(path, &target)?;
        }
        debug!(wu = %self.descriptor.wu_name, "checkpoint recorded");
        Ok(())
    }

    pub fn fraction_done(&self, fraction: f64) -> Result<(), DcError> {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(DcError::BadParam(format!(
                "fraction {fraction} is outside 0.0..=1.0"
            )));
        }
        fsutil::atomic_write_file(
            &self.dir.join(PROGRESS_FILE),
            format!("{fraction:.4}\n").as_bytes(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use tempfile::TempDir;

    fn setup(max_subresults: u32) -> (TempDir, ClientContext) {
        let tmp = TempDir::new().unwrap();
        ClientDescriptor {
            wu_name: "proj_1".into(),
            max_subresults,
            max_message_size: 8,
            inputs: vec!["in.txt".into()],
            outputs: vec!["out.txt".into()],
        }
        .write(tmp.path())
        .unwrap();
        let ctx = ClientContext::open(tmp.path()).unwrap();
        (tmp, ctx)
    }

    #[test]
    fn descriptor_roundtrip() {
        let (tmp, ctx) = setup(2);
        assert_eq!(ctx.wu_name(), "proj_1");
        assert_eq!(ClientDescriptor::read(tmp.path()).unwrap(), *ctx.descriptor());
    }

    #[test]
    fn resolves_declared_names_only() {
        let (tmp, ctx) = setup(0);
        assert_eq!(ctx.resolve_file_name("in.txt").unwrap(), tmp.path().join("in.txt"));
        assert_eq!(ctx.resolve_file_name("out.txt").unwrap(), tmp.path().join("out.txt"));
        assert_eq!(
            ctx.resolve_file_name(CHECKPOINT_LABEL).unwrap(),
            tmp.path().join(CHECKPOINT_FILE)
        );
        assert_eq!(
            ctx.resolve_file_name("other").unwrap_err().code(),
            ErrorCode::BadParam
        );
    }

    #[test]
    fn subresult_budget_is_enforced() {
        let (tmp, mut ctx) = setup(1);
        let src = tmp.path().join("part.dat");
        std::fs::write(&src, "1").unwrap();
        ctx.send_subresult("part.dat", &src).unwrap();
        let err = ctx.send_subresult("part.dat", &src).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TooMany);
        assert_eq!(
            Mailbox::open(tmp.path(), BoxKind::Subresult).pending().unwrap(),
            1
        );
    }

    #[test]
    fn messages_flow_both_ways() {
        let (tmp, ctx) = setup(0);
        ctx.send_message("hello").unwrap();
        assert_eq!(
            ctx.send_message("far too long").unwrap_err().code(),
            ErrorCode::BadParam
        );
        assert_eq!(
            Mailbox::open(tmp.path(), BoxKind::Master)
                .take_message()
                .unwrap()
                .as_deref(),
            Some("hello")
        );

        Mailbox::open(tmp.path(), BoxKind::Client)
            .post_message("stop")
            .unwrap();
        assert_eq!(ctx.check_event().unwrap().as_deref(), Some("stop"));
        assert_eq!(ctx.check_event().unwrap(), None);
    }

    #[test]
    fn checkpoint_and_progress() {
        let (tmp, ctx) = setup(0);
        assert!(ctx.last_checkpoint().is_none());
        let state = tmp.path().join("state.bin");
        std::fs::write(&state, "step 3").unwrap();
        ctx.checkpoint_made(&state).unwrap();
        let checkpoint = ctx.last_checkpoint().unwrap();
        assert_eq!(std::fs::read_to_string(checkpoint).unwrap(), "step 3");

        ctx.fraction_done(0.5).unwrap();
        assert_eq!(
            std::fs::read_to_string(tmp.path().join(PROGRESS_FILE)).unwrap(),
            "0.5000\n"
        );
        assert!(ctx.fraction_done(1.5).is_err());
    }
}
