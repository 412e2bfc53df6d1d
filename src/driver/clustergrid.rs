//! ClusterGrid broker backend.
//!
//! The WU working directory doubles as the grid job directory:
//!
//! ```text
//! <workdir>/bin/<client>
//! <workdir>/input/<logical inputs>
//! <workdir>/output/
//! <workdir>/tmp/
//! <workdir>/dc_job.ini
//! ```
//!
//! The broker tools answer with whitespace separated tokens; the status
//! word and the job id sit at fixed positions.

use std::fs;
use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use super::command::{run_command, CommandOutput};
use super::{
    attach_streams, not_impl, resolve_client, BackendDriver, BackendKind, Capabilities,
    OutputKind, PollStatus, STDERR_FILE, STDOUT_FILE,
};
use crate::config::ClusterGridConfig;
use crate::error::{command_err, io_err, DcError};
use crate::fsutil::{atomic_copy_file, atomic_write_file, make_executable};
use crate::termination::{parse_termination, Termination};
use crate::workunit::{CorrelationId, ResultStatus, WorkUnit, WuResult};

pub const DESCRIPTOR_FILE: &str = "dc_job.ini";
pub const JOB_LOG_FILE: &str = "dc_job.log";
pub const LAYOUT_DIRS: [&str; 4] = ["bin", "input", "output", "tmp"];

pub struct ClusterGridDriver {
    config: ClusterGridConfig,
    timeout: Duration,
}

impl ClusterGridDriver {
    pub fn new(config: ClusterGridConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }

    fn job_id(wu: &WorkUnit) -> Result<&CorrelationId, DcError> {
        wu.correlation_id
            .as_ref()
            .ok_or_else(|| DcError::Internal(format!("work unit {} has no grid job id", wu.name)))
    }

    fn run(&self, binary: &str, args: &[&str], cwd: &Path) -> Result<CommandOutput, DcError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        run_command(binary, &args, cwd, self.timeout)?.check()
    }

    fn build_job_tree(&self, wu: &WorkUnit) -> Result<String, DcError> {
        for input in &wu.inputs {
            if LAYOUT_DIRS.contains(&input.logical_name.as_str()) {
                return Err(DcError::BadParam(format!(
                    "input name `{}` clashes with the grid job layout",
                    input.logical_name
                )));
            }
        }
        for dir in LAYOUT_DIRS {
            let path = wu.workdir.join(dir);
            fs::create_dir_all(&path).map_err(|e| io_err(&path, e))?;
        }

        let client = resolve_client(&wu.client)?;
        let exe_name = client
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| DcError::BadParam(format!("bad client path {}", client.display())))?;
        let exe_dest = wu.workdir.join("bin").join(&exe_name);
        atomic_copy_file(&client, &exe_dest)?;
        make_executable(&exe_dest)?;

        for input in &wu.inputs {
            atomic_copy_file(
                &wu.workdir.join(&input.logical_name),
                &wu.workdir.join("input").join(&input.logical_name),
            )?;
        }
        Ok(exe_name)
    }
}

/// Render the INI-style job descriptor.
pub fn job_descriptor(wu: &WorkUnit, exe_name: &str) -> String {
    let inputs: Vec<&str> = wu.inputs.iter().map(|f| f.logical_name.as_str()).collect();
    format!(
        "[job]\n\
         name = {name}\n\
         executable = bin/{exe_name}\n\
         arguments = {args}\n\
         priority = {priority}\n\
         stdout = output/{STDOUT_FILE}\n\
         stderr = output/{STDERR_FILE}\n\
         log = output/{JOB_LOG_FILE}\n\
         \n\
         [input]\n\
         directory = input\n\
         files = {inputs}\n\
         \n\
         [output]\n\
         directory = output\n\
         files = {outputs}\n",
        name = wu.name,
        args = wu.args.join(" "),
        priority = wu.priority,
        inputs = inputs.join(" "),
        outputs = wu.outputs.join(" "),
    )
}

/// `clgr_submit` prints e.g. `Job submission ok 4711`: status word third,
/// job id fourth.
pub fn parse_submit_output(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match (tokens.get(2), tokens.get(3)) {
            (Some(status), Some(id)) if status.eq_ignore_ascii_case("ok") => Some(id.to_string()),
            _ => None,
        }
    })
}

/// `clgr_status -i <id>` prints e.g. `Job 4711 RUNNING`: state word third.
pub fn parse_status_output(stdout: &str) -> PollStatus {
    let Some(line) = stdout.lines().find(|l| !l.trim().is_empty()) else {
        return PollStatus::Undefined;
    };
    let Some(state) = line.split_whitespace().nth(2) else {
        return PollStatus::Undefined;
    };
    match state.to_ascii_uppercase().as_str() {
        "SUBMITTED" | "SCHEDULED" | "QUEUED" | "WAITING" => PollStatus::Queued,
        "RUNNING" | "STAGING" => PollStatus::StillRunning,
        "FINISHED" | "DONE" => PollStatus::Finished,
        "FAILED" | "ERROR" | "LOST" => PollStatus::Error,
        _ => PollStatus::Undefined,
    }
}

impl BackendDriver for ClusterGridDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::ClusterGrid
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            exit_code: true,
            stdout: true,
            stderr: true,
            log: true,
            subresults: false,
            messaging: false,
            suspend: false,
        }
    }

    fn submit(&self, wu: &WorkUnit) -> Result<CorrelationId, DcError> {
        let exe_name = self.build_job_tree(wu)?;
        atomic_write_file(
            &wu.workdir.join(DESCRIPTOR_FILE),
            job_descriptor(wu, &exe_name).as_bytes(),
        )?;

        let output = self.run(&self.config.submit_bin, &[DESCRIPTOR_FILE], &wu.workdir)?;
        let id = parse_submit_output(&output.stdout).ok_or_else(|| {
            command_err(
                &output.command_form,
                format!("submission not accepted: {}", output.stdout.trim()),
            )
        })?;
        info!(wu = %wu.name, job = %id, "submitted ClusterGrid job");
        Ok(CorrelationId::new(id))
    }

    fn poll_status(&self, wu: &WorkUnit) -> Result<PollStatus, DcError> {
        let id = Self::job_id(wu)?;
        let output = self.run(&self.config.status_bin, &["-i", id.as_str()], &wu.workdir)?;
        Ok(parse_status_output(&output.stdout))
    }

    fn fetch_output(&self, wu: &WorkUnit, kind: OutputKind) -> Result<WuResult, DcError> {
        if kind == OutputKind::Partial {
            return Err(not_impl(self.kind(), "sub-results"));
        }
        let id = Self::job_id(wu)?;
        let output = self.run(
            &self.config.getout_bin,
            &["-d", "-i", id.as_str()],
            &wu.workdir,
        )?;

        let output_dir = wu.workdir.join("output");
        let log_path = output_dir.join(JOB_LOG_FILE);
        let record = match fs::read_to_string(&log_path) {
            Ok(text) => text,
            Err(_) => output.stdout.clone(),
        };

        let mut result = WuResult::new(&wu.name, ResultStatus::Final, output_dir.clone());
        match parse_termination(&record) {
            Ok(termination) => {
                if matches!(termination, Termination::Signaled(_)) {
                    result.status = ResultStatus::Invalid;
                }
                result.exit_code = Some(termination.exit_code());
            }
            Err(err) => warn!(wu = %wu.name, job = %id, error = %err, "cannot read exit code"),
        }
        result.syslog = log_path.is_file().then_some(log_path);
        attach_streams(&mut result, &output_dir);
        Ok(result)
    }

    fn cancel(&self, wu: &WorkUnit) -> Result<(), DcError> {
        let id = Self::job_id(wu)?;
        self.run(&self.config.rm_bin, &["-i", id.as_str()], &wu.workdir)?;
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::workunit::{InputFile, TransferMode};
    use tempfile::TempDir;

    fn write_script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        make_executable(&path).unwrap();
        path.display().to_string()
    }

    fn fake_config(bin: &Path, state: &str) -> ClusterGridConfig {
        ClusterGridConfig {
            submit_bin: write_script(bin, "clgr_submit", "#!/bin/sh\necho 'Job submission ok 4711'\n"),
            status_bin: write_script(bin, "clgr_status", &format!("#!/bin/sh\necho \"Job $2 {state}\"\n")),
            getout_bin: write_script(
                bin,
                "clgr_getout",
                "#!/bin/sh\necho result > output/out.dat\necho hi > output/dc_stdout.txt\nprintf 'job 4711 terminated with status 2\\n' > output/dc_job.log\necho 'getout ok'\n",
            ),
            rm_bin: write_script(bin, "clgr_rm", "#!/bin/sh\necho \"$2\" > removed\n"),
        }
    }

    fn make_wu(dir: &Path) -> WorkUnit {
        let mut wu = WorkUnit::new(
            "grid_wu".into(),
            "sh".into(),
            vec!["run.sh".into()],
            0,
            None,
            dir.to_path_buf(),
        );
        fs::write(dir.join("in.txt"), "input").unwrap();
        wu.inputs.push(InputFile {
            logical_name: "in.txt".into(),
            source: "in.txt".into(),
            mode: TransferMode::Regular,
        });
        wu.outputs.push("out.dat".into());
        wu
    }

    #[test]
    fn token_parsing() {
        assert_eq!(parse_submit_output("Job submission ok 4711\n"), Some("4711".into()));
        assert_eq!(parse_submit_output("Job submission failed: quota"), None);
        assert_eq!(parse_status_output("Job 4711 RUNNING"), PollStatus::StillRunning);
        assert_eq!(parse_status_output("Job 4711 FINISHED"), PollStatus::Finished);
        assert_eq!(parse_status_output("Job 4711 scheduled"), PollStatus::Queued);
        assert_eq!(parse_status_output("Job 4711 FAILED"), PollStatus::Error);
        assert_eq!(parse_status_output("garbage"), PollStatus::Undefined);
        assert_eq!(parse_status_output(""), PollStatus::Undefined);
    }

    #[test]
    fn submit_builds_job_tree() {
        let bin = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let driver = ClusterGridDriver::new(fake_config(bin.path(), "RUNNING"), Duration::from_secs(5));
        let wu = make_wu(work.path());

        let id = driver.submit(&wu).unwrap();
        assert_eq!(id.as_str(), "4711");
        for dir in LAYOUT_DIRS {
            assert!(work.path().join(dir).is_dir(), "{dir}");
        }
        assert!(work.path().join("bin/sh").is_file());
        assert_eq!(fs::read_to_string(work.path().join("input/in.txt")).unwrap(), "input");
        let ini = fs::read_to_string(work.path().join(DESCRIPTOR_FILE)).unwrap();
        assert!(ini.contains("executable = bin/sh"));
        assert!(ini.contains("files = out.dat"));
    }

    #[test]
    fn finished_job_output_is_collected() {
        let bin = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let driver = ClusterGridDriver::new(fake_config(bin.path(), "FINISHED"), Duration::from_secs(5));
        let mut wu = make_wu(work.path());
        wu.correlation_id = Some(driver.submit(&wu).unwrap());

        assert_eq!(driver.poll_status(&wu).unwrap(), PollStatus::Finished);
        let result = driver.fetch_output(&wu, OutputKind::Final).unwrap();
        assert_eq!(result.exit_code, Some(2));
        assert_eq!(result.output_dir, work.path().join("output"));
        assert!(result.stdout.is_some());
        assert!(result.syslog.is_some());

        driver.cancel(&wu).unwrap();
        assert_eq!(fs::read_to_string(work.path().join("removed")).unwrap().trim(), "4711");
    }

    #[test]
    fn no_suspend_or_subresults() {
        let work = TempDir::new().unwrap();
        let driver = ClusterGridDriver::new(ClusterGridConfig::default(), Duration::from_secs(1));
        let wu = make_wu(work.path());
        assert!(driver.suspend(&wu).unwrap_err().is_not_impl());
        assert!(driver.resume(&wu).unwrap_err().is_not_impl());
        assert!(driver.fetch_output(&wu, OutputKind::Partial).unwrap_err().is_not_impl());
    }
}
