//! Runs each WU as a child process of the master.

use std::collections::HashMap;
use std::fs::File;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::command::run_command;
use super::{
    attach_streams, resolve_client, running_status, take_subresult, BackendDriver, BackendKind,
    Capabilities, OutputKind, PollStatus, STDERR_FILE, STDOUT_FILE,
};
use crate::error::{io_err, DcError};
use crate::termination::Termination;
use crate::workunit::{CorrelationId, ResultStatus, WorkUnit, WuResult};

const SIGNAL_TIMEOUT: Duration = Duration::from_secs(10);

struct LocalJob {
    child: Option<Child>,
    exit: Option<ExitStatus>,
}

/// Fork/exec backend. The correlation id is the child's PID.
pub struct LocalForkDriver {
    jobs: Mutex<HashMap<u32, LocalJob>>,
}

impl Default for LocalForkDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalForkDriver {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn pid_of(wu: &WorkUnit) -> Result<u32, DcError> {
        wu.correlation_id
            .as_ref()
            .and_then(|id| id.as_str().parse().ok())
            .ok_or_else(|| DcError::Internal(format!("work unit {} has no local pid", wu.name)))
    }

    fn signal(&self, wu: &WorkUnit, signal: &str) -> Result<(), DcError> {
        let pid = Self::pid_of(wu)?;
        run_command(
            "kill",
            &[signal.to_string(), pid.to_string()],
            &wu.workdir,
            SIGNAL_TIMEOUT,
        )?
        .check()?;
        Ok(())
    }
}

fn termination_of(status: ExitStatus) -> Option<Termination> {
    if let Some(code) = status.code() {
        return Some(Termination::Exited(code));
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Some(Termination::Signaled(signal));
        }
    }
    None
}

impl BackendDriver for LocalForkDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            exit_code: true,
            stdout: true,
            stderr: true,
            log: false,
            subresults: true,
            messaging: true,
            suspend: cfg!(unix),
        }
    }

    fn submit(&self, wu: &WorkUnit) -> Result<CorrelationId, DcError> {
        let client = resolve_client(&wu.client)?;
        let stdout_path = wu.workdir.join(STDOUT_FILE);
        let stderr_path = wu.workdir.join(STDERR_FILE);
        let stdout = File::create(&stdout_path).map_err(|e| io_err(&stdout_path, e))?;
        let stderr = File::create(&stderr_path).map_err(|e| io_err(&stderr_path, e))?;

        let child = Command::new(&client)
            .args(&wu.args)
            .current_dir(&wu.workdir)
            .env("DC_WORKDIR", &wu.workdir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| io_err(&client, e))?;

        let pid = child.id();
        self.jobs.lock().insert(
            pid,
            LocalJob {
                child: Some(child),
                exit: None,
            },
        );
        info!(wu = %wu.name, pid, client = %client.display(), "started local client");
        Ok(CorrelationId::new(pid.to_string()))
    }

    fn poll_status(&self, wu: &WorkUnit) -> Result<PollStatus, DcError> {
        let pid = Self::pid_of(wu)?;
        let mut jobs = self.jobs.lock();
        let Some(job) = jobs.get_mut(&pid) else {
            debug!(wu = %wu.name, pid, "no child process tracked for pid");
            return Ok(PollStatus::Undefined);
        };
        if job.exit.is_some() {
            return Ok(PollStatus::Finished);
        }
        let Some(child) = job.child.as_mut() else {
            return Ok(PollStatus::Undefined);
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                // Reaped; the Child handle is no longer needed.
                job.exit = Some(status);
                job.child = None;
                debug!(wu = %wu.name, pid, ?status, "local client exited");
                Ok(PollStatus::Finished)
            }
            Ok(None) => running_status(&wu.workdir),
            Err(err) => {
                warn!(wu = %wu.name, pid, error = %err, "waitpid failed");
                Ok(PollStatus::Error)
            }
        }
    }

    fn fetch_output(&self, wu: &WorkUnit, kind: OutputKind) -> Result<WuResult, DcError> {
        if kind == OutputKind::Partial {
            return take_subresult(wu, &wu.workdir);
        }

        let pid = Self::pid_of(wu)?;
        let exit = self
            .jobs
            .lock()
            .get(&pid)
            .and_then(|job| job.exit)
            .ok_or_else(|| DcError::Internal(format!("work unit {} has not exited", wu.name)))?;

        let termination = termination_of(exit);
        let status = match termination {
            Some(Termination::Exited(_)) => ResultStatus::Final,
            _ => ResultStatus::Invalid,
        };
        let mut result = WuResult::new(&wu.name, status, wu.workdir.clone());
        result.exit_code = termination.map(|t| t.exit_code());
        attach_streams(&mut result, &wu.workdir);
        Ok(result)
    }

    fn cancel(&self, wu: &WorkUnit) -> Result<(), DcError> {
        let pid = Self::pid_of(wu)?;
        let mut jobs = self.jobs.lock();
        let Some(job) = jobs.get_mut(&pid) else {
            return Ok(());
        };
        if let Some(mut child) = job.child.take() {
            let _ = child.kill();
            let status = child.wait().map_err(|e| io_err(&wu.workdir, e))?;
            job.exit = Some(status);
            info!(wu = %wu.name, pid, "killed local client");
        }
        Ok(())
    }

    fn suspend(&self, wu: &WorkUnit) -> Result<(), DcError> {
        self.signal(wu, "-STOP")
    }

    fn resume(&self, wu: &WorkUnit) -> Result<(), DcError> {
        self.signal(wu, "-CONT")
    }

    fn cleanup(&self, wu: &WorkUnit) -> Result<(), DcError> {
        let Ok(pid) = Self::pid_of(wu) else {
            return Ok(());
        };
        if let Some(job) = self.jobs.lock().remove(&pid)
            && let Some(mut child) = job.child
        {
            let _ = child.kill();
            let _ = child.wait();
        }
        Ok(())
    }
}
