//! Condor pool backend.
//!
//! Jobs are submitted with `condor_submit` from the WU working directory,
//! which Condor sees through a shared filesystem. Progress is read from the
//! user event log named in the submit descriptor.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use super::command::run_command;
use super::condor_log::EventLogTail;
use super::{
    attach_streams, resolve_client, running_status, take_subresult, BackendDriver, BackendKind,
    Capabilities, OutputKind, PollStatus, STDERR_FILE, STDOUT_FILE,
};
use crate::config::CondorConfig;
use crate::error::{command_err, io_err, DcError};
use crate::fsutil::atomic_write_file;
use crate::termination::{parse_termination, Termination};
use crate::workunit::{CorrelationId, ResultStatus, WorkUnit, WuResult};

pub const SUBMIT_FILE: &str = "dc_condor_submit.txt";
pub const LOG_FILE: &str = "dc_condor.log";

pub struct CondorDriver {
    config: CondorConfig,
    timeout: Duration,
    tails: Mutex<HashMap<CorrelationId, EventLogTail>>,
}

impl CondorDriver {
    pub fn new(config: CondorConfig, timeout: Duration) -> Self {
        Self {
            config,
            timeout,
            tails: Mutex::new(HashMap::new()),
        }
    }

    fn job_id(wu: &WorkUnit) -> Result<&CorrelationId, DcError> {
        wu.correlation_id
            .as_ref()
            .ok_or_else(|| DcError::Internal(format!("work unit {} has no Condor job id", wu.name)))
    }

    fn run_on_job(&self, binary: &str, wu: &WorkUnit) -> Result<(), DcError> {
        let id = Self::job_id(wu)?;
        run_command(binary, &[id.to_string()], &wu.workdir, self.timeout)?.check()?;
        Ok(())
    }
}

/// Render the submit descriptor for `wu`.
pub fn submit_descriptor(wu: &WorkUnit, executable: &Path, universe: &str) -> String {
    let mut lines = vec![
        format!("Executable = {}", executable.display()),
        format!("arguments = \"{}\"", quote_arguments(&wu.args)),
        format!("Universe = {universe}"),
        format!("output = {STDOUT_FILE}"),
        format!("error = {STDERR_FILE}"),
        format!("log = {LOG_FILE}"),
        format!("initialdir = {}", wu.workdir.display()),
        format!("priority = {}", wu.priority),
        format!("environment = \"DC_WORKDIR={}\"", wu.workdir.display()),
    ];
    if !wu.inputs.is_empty() {
        let names: Vec<&str> = wu.inputs.iter().map(|f| f.logical_name.as_str()).collect();
        lines.push(format!("transfer_input_files = {}", names.join(",")));
    }
    lines.push("should_transfer_files = IF_NEEDED".to_string());
    lines.push("when_to_transfer_output = ON_EXIT".to_string());
    lines.push("Queue".to_string());
    lines.join("\n") + "\n"
}

// New-style Condor argument quoting: single-quote arguments with spaces,
// double any embedded quotes.
fn quote_arguments(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            let escaped = arg.replace('"', "\"\"").replace('\'', "''");
            if escaped.contains(' ') || escaped.is_empty() {
                format!("'{escaped}'")
            } else {
                escaped
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Extract `cluster.0` from `condor_submit` output such as
/// `1 job(s) submitted to cluster 42.`
pub fn parse_submit_output(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .find(|line| line.contains("submitted to cluster"))
        .and_then(|line| line.split_whitespace().last())
        .map(|token| token.trim_end_matches('.'))
        .filter(|cluster| !cluster.is_empty() && cluster.chars().all(|c| c.is_ascii_digit()))
        .map(|cluster| format!("{cluster}.0"))
}

impl BackendDriver for CondorDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Condor
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            exit_code: true,
            stdout: true,
            stderr: true,
            log: true,
            subresults: true,
            messaging: true,
            suspend: true,
        }
    }

    fn submit(&self, wu: &WorkUnit) -> Result<CorrelationId, DcError> {
        let executable = resolve_client(&wu.client)?;
        let descriptor_path = wu.workdir.join(SUBMIT_FILE);
        atomic_write_file(
            &descriptor_path,
            submit_descriptor(wu, &executable, &self.config.universe).as_bytes(),
        )?;

        // A log left by an earlier failed attempt would confuse the tail.
        let log_path = wu.workdir.join(LOG_FILE);
        if log_path.exists() {
            std::fs::remove_file(&log_path).map_err(|e| io_err(&log_path, e))?;
        }

        let output = run_command(
            &self.config.submit_bin,
            &[SUBMIT_FILE.to_string()],
            &wu.workdir,
            self.timeout,
        )?
        .check()?;
        let id = parse_submit_output(&output.stdout).ok_or_else(|| {
            command_err(
                &output.command_form,
                format!("unrecognized output: {}", output.stdout.trim()),
            )
        })?;

        info!(wu = %wu.name, job = %id, "submitted Condor job");
        let id = CorrelationId::new(id);
        self.tails.lock().insert(id.clone(), EventLogTail::default());
        Ok(id)
    }

    fn poll_status(&self, wu: &WorkUnit) -> Result<PollStatus, DcError> {
        let id = Self::job_id(wu)?;
        let status = self
            .tails
            .lock()
            .entry(id.clone())
            .or_default()
            .advance(&wu.workdir.join(LOG_FILE))?;

        match status {
            None | Some(PollStatus::Queued) => Ok(PollStatus::Queued),
            Some(PollStatus::StillRunning) => running_status(&wu.workdir),
            Some(other) => Ok(other),
        }
    }

    fn fetch_output(&self, wu: &WorkUnit, kind: OutputKind) -> Result<WuResult, DcError> {
        if kind == OutputKind::Partial {
            return take_subresult(wu, &wu.workdir);
        }

        let log_path = wu.workdir.join(LOG_FILE);
        let id = Self::job_id(wu)?;
        let record = match self
            .tails
            .lock()
            .get(id)
            .and_then(|tail| tail.terminated_event())
        {
            Some(event) => event.text.clone(),
            None => std::fs::read_to_string(&log_path).map_err(|e| io_err(&log_path, e))?,
        };

        let mut result = WuResult::new(&wu.name, ResultStatus::Final, wu.workdir.clone());
        match parse_termination(&record) {
            Ok(termination) => {
                if matches!(termination, Termination::Signaled(_)) {
                    result.status = ResultStatus::Invalid;
                }
                result.exit_code = Some(termination.exit_code());
            }
            Err(err) => warn!(wu = %wu.name, job = %id, error = %err, "cannot read exit code"),
        }
        result.syslog = Some(log_path);
        attach_streams(&mut result, &wu.workdir);
        Ok(result)
    }

    fn cancel(&self, wu: &WorkUnit) -> Result<(), DcError> {
        self.run_on_job(&self.config.rm_bin, wu)
    }

    fn suspend(&self, wu: &WorkUnit) -> Result<(), DcError> {
        self.run_on_job(&self.config.hold_bin, wu)
    }

    fn resume(&self, wu: &WorkUnit) -> Result<(), DcError> {
        self.run_on_job(&self.config.release_bin, wu)
    }

    fn cleanup(&self, wu: &WorkUnit) -> Result<(), DcError> {
        if let Some(id) = &wu.correlation_id {
            self.tails.lock().remove(id);
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::fsutil::make_executable;
    use std::fs;
    use tempfile::TempDir;

    // Fake condor_submit: logs submit, execute and termination events.
    const FAKE_SUBMIT: &str = r#"#!/bin/sh
cat >> dc_condor.log <<'EOF'
000 (077.000.000) 10/16 12:00:00 Job submitted from host: <127.0.0.1:9618>
...
001 (077.000.000) 10/16 12:00:01 Job executing on host: <127.0.0.1:9618>
...
005 (077.000.000) 10/16 12:00:02 Job terminated.
	(1) Normal termination (return value 5)
...
EOF
echo "Submitting job(s)."
echo "1 job(s) submitted to cluster 77."
"#;

    fn write_script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        make_executable(&path).unwrap();
        path.display().to_string()
    }

    fn make_wu(dir: &Path) -> WorkUnit {
        WorkUnit::new(
            "condor_wu".into(),
            "sh".into(),
            vec!["-c".into(), "echo two words".into()],
            0,
            None,
            dir.to_path_buf(),
        )
    }

    #[test]
    fn submit_output_parsing() {
        assert_eq!(
            parse_submit_output("Submitting job(s).\n1 job(s) submitted to cluster 42.\n"),
            Some("42.0".to_string())
        );
        assert_eq!(parse_submit_output("ERROR: no such file"), None);
    }

    #[test]
    fn descriptor_contains_required_keys() {
        let tmp = TempDir::new().unwrap();
        let wu = make_wu(tmp.path());
        let text = submit_descriptor(&wu, Path::new("/bin/sh"), "vanilla");
        for key in ["Executable = /bin/sh", "Universe = vanilla", "output = dc_stdout.txt",
            "error = dc_stderr.txt", "log = dc_condor.log", "Queue"] {
            assert!(text.contains(key), "missing {key}");
        }
        assert!(text.contains("arguments = \"-c 'echo two words'\""));
    }

    #[test]
    fn full_cycle_with_fake_cli() {
        let bin = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let config = CondorConfig {
            submit_bin: write_script(bin.path(), "condor_submit", FAKE_SUBMIT),
            rm_bin: write_script(bin.path(), "condor_rm", "#!/bin/sh\necho \"$1\" > removed\n"),
            ..CondorConfig::default()
        };
        let driver = CondorDriver::new(config, Duration::from_secs(5));
        let mut wu = make_wu(work.path());

        let id = driver.submit(&wu).unwrap();
        assert_eq!(id.as_str(), "77.0");
        assert!(work.path().join(SUBMIT_FILE).is_file());
        wu.correlation_id = Some(id);

        assert_eq!(driver.poll_status(&wu).unwrap(), PollStatus::Finished);
        let result = driver.fetch_output(&wu, OutputKind::Final).unwrap();
        assert_eq!(result.exit_code, Some(5));
        assert_eq!(result.status, ResultStatus::Final);
        assert_eq!(result.syslog, Some(work.path().join(LOG_FILE)));

        driver.cancel(&wu).unwrap();
        assert_eq!(
            fs::read_to_string(work.path().join("removed")).unwrap().trim(),
            "77.0"
        );
    }

    #[test]
    fn failing_submit_surfaces_error() {
        let bin = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let config = CondorConfig {
            submit_bin: write_script(bin.path(), "condor_submit", "#!/bin/sh\necho 'ERROR: pool down' >&2\nexit 1\n"),
            ..CondorConfig::default()
        };
        let driver = CondorDriver::new(config, Duration::from_secs(5));
        let err = driver.submit(&make_wu(work.path())).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::System);
        assert!(err.to_string().contains("pool down"));
    }
}
