//! Execution backends.
//!
//! Every backend implements [`BackendDriver`]. The registry holds one
//! driver, chosen at runtime from [`BackendKind`] in the configuration.
//! Drivers are shared with the poller's status workers, so they are
//! `Send + Sync` and keep their own bookkeeping behind locks.

pub mod boinc;
pub mod clustergrid;
pub mod command;
pub mod condor;
pub mod condor_log;
pub mod local;
#[cfg(test)]
pub(crate) mod mock;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::DcConfig;
use crate::error::DcError;
use crate::mailbox::{BoxKind, Mailbox};
use crate::workunit::{CorrelationId, ResultStatus, WorkUnit, WuResult};

/// File receiving the client's standard output.
pub const STDOUT_FILE: &str = "dc_stdout.txt";
/// File receiving the client's standard error.
pub const STDERR_FILE: &str = "dc_stderr.txt";
/// Directory collecting consumed sub-results.
pub const SUBRESULTS_DIR: &str = "dc_subresults";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Condor,
    ClusterGrid,
    Boinc,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Condor => "condor",
            BackendKind::ClusterGrid => "clustergrid",
            BackendKind::Boinc => "boinc",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a status check observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollStatus {
    /// Accepted by the backend, not started yet.
    Queued,
    StillRunning,
    Finished,
    /// Running, with at least one sub-result waiting.
    SubresultReady,
    /// The backend answered with something we cannot interpret.
    Undefined,
    /// The backend reports the job as failed or lost.
    Error,
}

impl PollStatus {
    pub fn is_anomaly(&self) -> bool {
        matches!(self, PollStatus::Undefined | PollStatus::Error)
    }
}

/// Which output [`BackendDriver::fetch_output`] should collect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Final,
    Partial,
}

/// Features a backend supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub exit_code: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub log: bool,
    pub subresults: bool,
    pub messaging: bool,
    pub suspend: bool,
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = [
            ("exit_code", self.exit_code),
            ("stdout", self.stdout),
            ("stderr", self.stderr),
            ("log", self.log),
            ("subresults", self.subresults),
            ("messaging", self.messaging),
            ("suspend", self.suspend),
        ];
        let names: Vec<&str> = flags
            .iter()
            .filter(|(_, on)| *on)
            .map(|(name, _)| *name)
            .collect();
        write!(f, "{}", names.join(","))
    }
}

/// One execution environment.
pub trait BackendDriver: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn capabilities(&self) -> Capabilities;

    /// Start the WU. Calling it again for a WU whose previous attempt failed
    /// must be safe.
    fn submit(&self, wu: &WorkUnit) -> Result<CorrelationId, DcError>;

    fn poll_status(&self, wu: &WorkUnit) -> Result<PollStatus, DcError>;

    /// Collect the final output, or consume one pending sub-result.
    fn fetch_output(&self, wu: &WorkUnit, kind: OutputKind) -> Result<WuResult, DcError>;

    fn cancel(&self, _wu: &WorkUnit) -> Result<(), DcError> {
        Err(not_impl(self.kind(), "cancel"))
    }

    fn suspend(&self, _wu: &WorkUnit) -> Result<(), DcError> {
        Err(not_impl(self.kind(), "suspend"))
    }

    fn resume(&self, _wu: &WorkUnit) -> Result<(), DcError> {
        Err(not_impl(self.kind(), "resume"))
    }

    /// Forget backend-side state for the WU (finished, destroyed or about
    /// to be recreated).
    fn cleanup(&self, _wu: &WorkUnit) -> Result<(), DcError> {
        Ok(())
    }
}

pub(crate) fn not_impl(kind: BackendKind, operation: &'static str) -> DcError {
    DcError::NotImpl {
        backend: kind.as_str(),
        operation,
    }
}

/// Build the driver selected by `config.backend`.
pub fn build_driver(config: &DcConfig, app_name: &str) -> Result<Arc<dyn BackendDriver>, DcError> {
    let driver: Arc<dyn BackendDriver> = match config.backend {
        BackendKind::Local => Arc::new(local::LocalForkDriver::new()),
        BackendKind::Condor => Arc::new(condor::CondorDriver::new(
            config.condor.clone(),
            config.command_timeout(),
        )),
        BackendKind::ClusterGrid => Arc::new(clustergrid::ClusterGridDriver::new(
            config.clustergrid.clone(),
            config.command_timeout(),
        )),
        BackendKind::Boinc => Arc::new(boinc::NativeBoincDriver::new(
            &config.boinc,
            app_name,
            config.command_timeout(),
        )?),
    };
    Ok(driver)
}

/// Resolve the client reference: paths are taken as-is, bare names are
/// looked up on `PATH`.
pub fn resolve_client(client: &str) -> Result<PathBuf, DcError> {
    if client.contains('/') {
        let path = PathBuf::from(client);
        if path.is_file() {
            return Ok(path);
        }
        return Err(DcError::BadParam(format!("client executable {client} not found")));
    }
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(client))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| DcError::BadParam(format!("client executable `{client}` not found on PATH")))
}

/// Status of a live job, upgraded when the sub-result box has entries.
pub(crate) fn running_status(mailbox_root: &Path) -> Result<PollStatus, DcError> {
    if Mailbox::open(mailbox_root, BoxKind::Subresult).pending()? > 0 {
        Ok(PollStatus::SubresultReady)
    } else {
        Ok(PollStatus::StillRunning)
    }
}

/// Consume the oldest sub-result under `mailbox_root` into a SUB result.
pub(crate) fn take_subresult(wu: &WorkUnit, mailbox_root: &Path) -> Result<WuResult, DcError> {
    let dest = wu
        .workdir
        .join(SUBRESULTS_DIR)
        .join(format!("{:04}", wu.subresults_delivered + 1));
    let entry = Mailbox::open(mailbox_root, BoxKind::Subresult)
        .take_file(&dest)?
        .ok_or_else(|| DcError::Internal(format!("no sub-result pending for {}", wu.name)))?;

    let mut result = WuResult::new(&wu.name, ResultStatus::Sub, dest);
    result.outputs.insert(entry.logical_name, entry.path);
    Ok(result)
}

/// Attach the standard stream files found in `dir` to `result`.
pub(crate) fn attach_streams(result: &mut WuResult, dir: &Path) {
    let stdout = dir.join(STDOUT_FILE);
    let stderr = dir.join(STDERR_FILE);
    result.stdout = stdout.is_file().then_some(stdout);
    result.stderr = stderr.is_file().then_some(stderr);
}
