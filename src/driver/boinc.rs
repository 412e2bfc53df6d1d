//! BOINC project backend.
//!
//! Work is published with the project's `create_work` tool; inputs are
//! copied into the download area first. The project's assimilator hands
//! results back by creating `<results_dir>/<job>/` holding the output files,
//! the client's streams, an optional `SubresultBox/` and finally a
//! `dc_outcome` termination record.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use super::command::run_command;
use super::{
    attach_streams, running_status, take_subresult, BackendDriver, BackendKind, Capabilities,
    OutputKind, PollStatus,
};
use crate::config::BoincConfig;
use crate::error::{io_err, DcError};
use crate::fsutil::atomic_copy_file;
use crate::termination::{parse_termination, Termination};
use crate::workunit::{CorrelationId, ResultStatus, WorkUnit, WuResult};

/// Written last by the assimilator; its presence means the WU is done.
pub const OUTCOME_FILE: &str = "dc_outcome";

pub struct NativeBoincDriver {
    app_name: String,
    project_root: PathBuf,
    create_work_bin: PathBuf,
    cancel_bin: PathBuf,
    download_dir: PathBuf,
    results_dir: PathBuf,
    wu_template: String,
    result_template: String,
    timeout: Duration,
}

impl NativeBoincDriver {
    pub fn new(config: &BoincConfig, app_name: &str, timeout: Duration) -> Result<Self, DcError> {
        let project_root = config
            .project_root
            .clone()
            .ok_or_else(|| DcError::Config("missing required key `boinc.project_root`".into()))?;
        let create_work = config.create_work_bin.as_deref().unwrap_or("bin/create_work");
        let cancel = config.cancel_bin.as_deref().unwrap_or("bin/cancel_jobs");

        Ok(Self {
            app_name: app_name.to_string(),
            create_work_bin: project_root.join(create_work),
            cancel_bin: project_root.join(cancel),
            download_dir: project_root.join(
                config
                    .download_dir
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("download")),
            ),
            results_dir: project_root.join(
                config
                    .results_dir
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("dcapi_results")),
            ),
            wu_template: config
                .wu_template
                .clone()
                .unwrap_or_else(|| format!("templates/{app_name}_wu")),
            result_template: config
                .result_template
                .clone()
                .unwrap_or_else(|| format!("templates/{app_name}_result")),
            project_root,
            timeout,
        })
    }

    /// BOINC workunit names must be unique in the project database, so a
    /// recreated WU gets a generation suffix.
    pub fn job_name(wu: &WorkUnit) -> String {
        if wu.generation == 0 {
            wu.name.clone()
        } else {
            format!("{}_r{}", wu.name, wu.generation)
        }
    }

    fn result_dir(&self, wu: &WorkUnit) -> Result<PathBuf, DcError> {
        let id = wu
            .correlation_id
            .as_ref()
            .ok_or_else(|| DcError::Internal(format!("work unit {} was not published", wu.name)))?;
        Ok(self.results_dir.join(id.as_str()))
    }

    fn path_str(path: &Path) -> String {
        path.display().to_string()
    }
}

impl BackendDriver for NativeBoincDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Boinc
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            exit_code: true,
            stdout: true,
            stderr: true,
            log: true,
            subresults: true,
            messaging: false,
            suspend: false,
        }
    }

    fn submit(&self, wu: &WorkUnit) -> Result<CorrelationId, DcError> {
        let job = Self::job_name(wu);
        std::fs::create_dir_all(&self.download_dir).map_err(|e| io_err(&self.download_dir, e))?;

        let mut published = Vec::new();
        for input in &wu.inputs {
            let name = format!("{job}_{}", input.logical_name);
            atomic_copy_file(
                &wu.workdir.join(&input.logical_name),
                &self.download_dir.join(&name),
            )?;
            published.push(name);
        }

        let mut args = vec![
            "--appname".to_string(),
            self.app_name.clone(),
            "--wu_name".to_string(),
            job.clone(),
            "--wu_template".to_string(),
            self.wu_template.clone(),
            "--result_template".to_string(),
            self.result_template.clone(),
            "--priority".to_string(),
            wu.priority.to_string(),
        ];
        if !wu.args.is_empty() {
            args.push("--command_line".to_string());
            args.push(wu.args.join(" "));
        }
        args.extend(published);

        run_command(
            &Self::path_str(&self.create_work_bin),
            &args,
            &self.project_root,
            self.timeout,
        )?
        .check()?;
        info!(wu = %wu.name, job = %job, app = %self.app_name, "published BOINC workunit");
        Ok(CorrelationId::new(job))
    }

    fn poll_status(&self, wu: &WorkUnit) -> Result<PollStatus, DcError> {
        let dir = self.result_dir(wu)?;
        if dir.join(OUTCOME_FILE).is_file() {
            return Ok(PollStatus::Finished);
        }
        if !dir.is_dir() {
            return Ok(PollStatus::Queued);
        }
        running_status(&dir)
    }

    fn fetch_output(&self, wu: &WorkUnit, kind: OutputKind) -> Result<WuResult, DcError> {
        let dir = self.result_dir(wu)?;
        if kind == OutputKind::Partial {
            return take_subresult(wu, &dir);
        }

        let outcome_path = dir.join(OUTCOME_FILE);
        let record = std::fs::read_to_string(&outcome_path).map_err(|e| io_err(&outcome_path, e))?;
        let mut result = WuResult::new(&wu.name, ResultStatus::Final, dir.clone());
        match parse_termination(&record) {
            Ok(Termination::Exited(code)) => result.exit_code = Some(code),
            Ok(signaled) => {
                result.status = ResultStatus::Invalid;
                result.exit_code = Some(signaled.exit_code());
            }
            Err(err) => {
                // The project gave up on the WU (client errors, too many
                // failed replicas).
                warn!(wu = %wu.name, error = %err, "BOINC outcome has no exit code");
                result.status = ResultStatus::Invalid;
            }
        }
        result.syslog = Some(outcome_path);
        attach_streams(&mut result, &dir);
        Ok(result)
    }

    fn cancel(&self, wu: &WorkUnit) -> Result<(), DcError> {
        let id = wu
            .correlation_id
            .as_ref()
            .ok_or_else(|| DcError::Internal(format!("work unit {} was not published", wu.name)))?;
        run_command(
            &Self::path_str(&self.cancel_bin),
            &["--name".to_string(), id.to_string()],
            &self.project_root,
            self.timeout,
        )?
        .check()?;
        Ok(())
    }
}
