//! Owns every work unit of one master: identity, working directories,
//! lifecycle state and the calls into the backend driver.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::client::ClientDescriptor;
use crate::config::DcConfig;
use crate::driver::{BackendDriver, Capabilities};
use crate::error::{io_err, DcError};
use crate::mailbox::{BoxKind, Mailbox};
use crate::stager::{validate_logical_name, FileStager, NoUrlFetcher, UrlFetcher};
use crate::workunit::{
    make_wu_name, validate_identifier, CorrelationId, InputFile, TransferMode, WorkUnit, WuEvent,
    WuState,
};

/// Directory under the work root holding the persistent input cache.
pub const PERSISTENT_DIR: &str = ".persistent";

pub struct Registry {
    project: String,
    work_root: PathBuf,
    driver: Arc<dyn BackendDriver>,
    stager: FileStager,
    units: HashMap<String, WorkUnit>,
    /// Live WU names in creation order; the poller sweeps in this order.
    order: Vec<String>,
    /// Every name handed out so far, destroyed WUs included.
    issued: HashSet<String>,
    max_units: usize,
    max_message_size: usize,
}

impl Registry {
    pub fn new(
        project: &str,
        work_root: PathBuf,
        driver: Arc<dyn BackendDriver>,
        config: &DcConfig,
    ) -> Self {
        let stager = FileStager::new(work_root.join(PERSISTENT_DIR), Arc::new(NoUrlFetcher));
        Self {
            project: project.to_string(),
            work_root,
            driver,
            stager,
            units: HashMap::new(),
            order: Vec::new(),
            issued: HashSet::new(),
            max_units: config.max_workunits,
            max_message_size: config.max_message_size,
        }
    }

    /// Replace the fetcher used for URL inputs.
    pub fn with_url_fetcher(mut self, fetcher: Arc<dyn UrlFetcher>) -> Self {
        self.stager = FileStager::new(self.work_root.join(PERSISTENT_DIR), fetcher);
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    pub fn capabilities(&self) -> Capabilities {
        self.driver.capabilities()
    }

    pub(crate) fn driver(&self) -> Arc<dyn BackendDriver> {
        Arc::clone(&self.driver)
    }

    pub(crate) fn stager(&self) -> &FileStager {
        &self.stager
    }

    /// Live WU names in creation order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn get(&self, name: &str) -> Result<&WorkUnit, DcError> {
        self.units
            .get(name)
            .ok_or_else(|| DcError::UnknownWu(name.to_string()))
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Result<&mut WorkUnit, DcError> {
        self.units
            .get_mut(name)
            .ok_or_else(|| DcError::UnknownWu(name.to_string()))
    }

    /// Create a WU and allocate its working directory. Returns the WU name.
    pub fn create(
        &mut self,
        client: &str,
        args: &[String],
        subresult_budget: u32,
        tag: Option<&str>,
    ) -> Result<String, DcError> {
        if client.trim().is_empty() {
            return Err(DcError::BadParam("client executable must be non-empty".into()));
        }
        if let Some(tag) = tag {
            validate_identifier("tag", tag).map_err(DcError::BadParam)?;
        }
        if self.units.len() >= self.max_units {
            return Err(DcError::TooMany(format!(
                "limit of {} work units reached",
                self.max_units
            )));
        }

        let name = loop {
            let candidate = make_wu_name(&self.project, tag);
            if self.issued.insert(candidate.clone()) {
                break candidate;
            }
        };

        let workdir = self.work_root.join(&name);
        let allocated = fs::create_dir_all(&workdir)
            .map_err(|e| io_err(&workdir, e))
            .and_then(|()| Mailbox::create_all(&workdir));
        if let Err(err) = allocated {
            return Err(DcError::TooMany(format!(
                "cannot allocate working directory: {err}"
            )));
        }

        let wu = WorkUnit::new(
            name.clone(),
            client.to_string(),
            args.to_vec(),
            subresult_budget,
            tag.map(str::to_string),
            workdir,
        );
        info!(wu = %name, client, "created work unit");
        self.units.insert(name.clone(), wu);
        self.order.push(name.clone());
        Ok(name)
    }

    /// Attach an input file, transferring it into the working directory now.
    pub fn add_input(
        &mut self,
        name: &str,
        logical_name: &str,
        source: &str,
        mode: TransferMode,
    ) -> Result<(), DcError> {
        let wu = self.get(name)?;
        check_attachable(wu, logical_name)?;
        let workdir = wu.workdir.clone();

        self.stager.stage_input(&workdir, logical_name, source, mode)?;
        self.get_mut(name)?.inputs.push(InputFile {
            logical_name: logical_name.to_string(),
            source: source.to_string(),
            mode,
        });
        Ok(())
    }

    /// Declare an output file the client is expected to produce.
    pub fn add_output(&mut self, name: &str, logical_name: &str) -> Result<(), DcError> {
        check_attachable(self.get(name)?, logical_name)?;
        self.get_mut(name)?.outputs.push(logical_name.to_string());
        Ok(())
    }

    pub fn set_priority(&mut self, name: &str, priority: i32) -> Result<(), DcError> {
        let wu = self.get_mut(name)?;
        require_state(wu, WuState::Created, "set priority")?;
        wu.priority = priority;
        Ok(())
    }

    pub fn submit(&mut self, name: &str) -> Result<(), DcError> {
        let max_message_size = self.max_message_size;
        let driver = self.driver();
        let wu = self.get_mut(name)?;
        require_state(wu, WuState::Created, "submit")?;

        ClientDescriptor::for_wu(wu, max_message_size).write(&wu.workdir)?;
        let id = driver.submit(wu).inspect_err(|err| {
            warn!(wu = %wu.name, error = %err, "submit failed, work unit stays CREATED");
        })?;

        info!(wu = %wu.name, job = %id, backend = %driver.kind(), "submitted work unit");
        wu.correlation_id = Some(id);
        apply(wu, WuEvent::Submit)
    }

    /// Abort the WU. A backend that cannot cancel is tolerated: the WU is
    /// marked ABORTED anyway.
    pub fn cancel(&mut self, name: &str) -> Result<(), DcError> {
        let driver = self.driver();
        let wu = self.get_mut(name)?;
        if wu.state.is_terminal() {
            return Err(DcError::BadParam(format!(
                "cannot cancel {} in state {}",
                wu.name, wu.state
            )));
        }

        if wu.state.has_backend_job() {
            match driver.cancel(wu) {
                Ok(()) => {}
                Err(err) if err.is_not_impl() => {
                    warn!(wu = %wu.name, error = %err, "backend cannot cancel, marking aborted");
                }
                Err(err) => return Err(err),
            }
        }
        info!(wu = %wu.name, "cancelled work unit");
        apply(wu, WuEvent::Cancel)
    }

    pub fn suspend(&mut self, name: &str) -> Result<(), DcError> {
        let driver = self.driver();
        let wu = self.get_mut(name)?;
        require_state(wu, WuState::Running, "suspend")?;
        driver.suspend(wu)?;
        info!(wu = %wu.name, "suspended work unit");
        apply(wu, WuEvent::Suspend)
    }

    /// Resume a suspended WU; it goes back to SUBMITTED until the backend
    /// reports it running again.
    pub fn resume(&mut self, name: &str) -> Result<(), DcError> {
        let driver = self.driver();
        let wu = self.get_mut(name)?;
        require_state(wu, WuState::Suspended, "resume")?;
        driver.resume(wu)?;
        info!(wu = %wu.name, "resumed work unit");
        apply(wu, WuEvent::Resume)
    }

    /// Forget the WU and remove its working directory.
    ///
    /// Refused while the backend job is running or suspended. A job that is
    /// only queued, or in an unknown state, is cancelled first.
    pub fn destroy(&mut self, name: &str) -> Result<(), DcError> {
        let driver = self.driver();
        let wu = self.get(name)?;
        if matches!(wu.state, WuState::Running | WuState::Suspended) {
            return Err(DcError::BadParam(format!(
                "cannot destroy {} while {}",
                wu.name, wu.state
            )));
        }

        if matches!(wu.state, WuState::Submitted | WuState::Unknown)
            && let Err(err) = driver.cancel(wu)
        {
            warn!(wu = %wu.name, error = %err, "cancel before destroy failed");
        }
        if wu.correlation_id.is_some()
            && let Err(err) = driver.cleanup(wu)
        {
            debug!(wu = %wu.name, error = %err, "backend cleanup failed");
        }

        remove_dir_if_exists(&wu.workdir)?;
        info!(wu = %name, "destroyed work unit");
        self.units.remove(name);
        self.order.retain(|n| n != name);
        Ok(())
    }

    /// Tear down the backend job and resubmit the WU from a fresh working
    /// directory under the same name.
    pub(crate) fn recreate(&mut self, name: &str) -> Result<CorrelationId, DcError> {
        let driver = self.driver();
        let max_message_size = self.max_message_size;
        let wu = self
            .units
            .get(name)
            .ok_or_else(|| DcError::UnknownWu(name.to_string()))?;

        if let Err(err) = driver.cancel(wu) {
            debug!(wu = %wu.name, error = %err, "cancel of the stale job failed");
        }
        if let Err(err) = driver.cleanup(wu) {
            debug!(wu = %wu.name, error = %err, "cleanup of the stale job failed");
        }

        let mut fresh = wu.clone();
        fresh.generation += 1;
        fresh.workdir = self
            .work_root
            .join(format!("{}.{}", wu.name, fresh.generation));
        fs::create_dir_all(&fresh.workdir).map_err(|e| io_err(&fresh.workdir, e))?;
        let submitted = Mailbox::create_all(&fresh.workdir)
            .and_then(|()| self.stager.restage(&wu.inputs, &wu.workdir, &fresh.workdir))
            .and_then(|()| ClientDescriptor::for_wu(&fresh, max_message_size).write(&fresh.workdir))
            .and_then(|_| driver.submit(&fresh));
        let id = match submitted {
            Ok(id) => id,
            Err(err) => {
                let _ = remove_dir_if_exists(&fresh.workdir);
                return Err(err);
            }
        };

        let wu = self.get_mut(name)?;
        wu.generation = fresh.generation;
        let stale_dir = std::mem::replace(&mut wu.workdir, fresh.workdir);
        wu.correlation_id = Some(id.clone());
        wu.anomaly_streak = 0;
        apply(wu, WuEvent::Recreate)?;

        if let Err(err) = remove_dir_if_exists(&stale_dir) {
            warn!(wu = %name, error = %err, "cannot remove stale working directory");
        }
        warn!(wu = %name, job = %id, generation = wu.generation, "recreated work unit");
        Ok(id)
    }

    pub fn state(&self, name: &str) -> Result<WuState, DcError> {
        Ok(self.get(name)?.state)
    }

    /// Number of WUs currently in `state`.
    pub fn count(&self, state: WuState) -> usize {
        self.units.values().filter(|wu| wu.state == state).count()
    }

    pub fn tag(&self, name: &str) -> Result<Option<&str>, DcError> {
        Ok(self.get(name)?.tag.as_deref())
    }

    pub fn correlation_id(&self, name: &str) -> Result<Option<&CorrelationId>, DcError> {
        Ok(self.get(name)?.correlation_id.as_ref())
    }

    /// Post a message into the WU's client mailbox.
    pub fn send_message(&self, name: &str, text: &str) -> Result<(), DcError> {
        let wu = self.get(name)?;
        if !self.driver.capabilities().messaging {
            return Err(crate::driver::not_impl(self.driver.kind(), "send_message"));
        }
        if text.len() > self.max_message_size {
            return Err(DcError::BadParam(format!(
                "message of {} bytes exceeds the limit of {}",
                text.len(),
                self.max_message_size
            )));
        }
        if wu.state.is_terminal() {
            return Err(DcError::BadParam(format!(
                "cannot message {} in state {}",
                wu.name, wu.state
            )));
        }
        Mailbox::open(&wu.workdir, BoxKind::Client).post_message(text)?;
        debug!(wu = %wu.name, bytes = text.len(), "sent message to client");
        Ok(())
    }

    pub fn serialize(&self, name: &str) -> Result<String, DcError> {
        Ok(serde_json::to_string(self.get(name)?)?)
    }

    /// Re-attach a serialized WU. Its working directory must still exist.
    pub fn deserialize(&mut self, json: &str) -> Result<String, DcError> {
        let wu: WorkUnit = serde_json::from_str(json)?;
        if self.units.contains_key(&wu.name) {
            return Err(DcError::BadParam(format!("work unit {} is already registered", wu.name)));
        }
        if self.units.len() >= self.max_units {
            return Err(DcError::TooMany(format!(
                "limit of {} work units reached",
                self.max_units
            )));
        }
        if !wu.workdir.is_dir() {
            return Err(DcError::BadParam(format!(
                "working directory {} of {} is gone",
                wu.workdir.display(),
                wu.name
            )));
        }

        let name = wu.name.clone();
        info!(wu = %name, state = %wu.state, "re-attached work unit");
        self.issued.insert(name.clone());
        self.order.push(name.clone());
        self.units.insert(name.clone(), wu);
        Ok(name)
    }
}

fn require_state(wu: &WorkUnit, expected: WuState, operation: &str) -> Result<(), DcError> {
    if wu.state != expected {
        return Err(DcError::BadParam(format!(
            "cannot {operation} {} in state {} (needs {expected})",
            wu.name, wu.state
        )));
    }
    Ok(())
}

fn check_attachable(wu: &WorkUnit, logical_name: &str) -> Result<(), DcError> {
    require_state(wu, WuState::Created, "attach files to")?;
    validate_logical_name(logical_name)?;
    if wu.has_logical_name(logical_name) {
        return Err(DcError::BadParam(format!(
            "logical file name `{logical_name}` is already used by {}",
            wu.name
        )));
    }
    Ok(())
}

pub(crate) fn apply(wu: &mut WorkUnit, event: WuEvent) -> Result<(), DcError> {
    let from = wu.state;
    let to = wu
        .apply(event)
        .map_err(|err| DcError::Internal(format!("{}: {err}", wu.name)))?;
    debug!(wu = %wu.name, %from, %to, ?event, "state transition");
    Ok(())
}

fn remove_dir_if_exists(dir: &Path) -> Result<(), DcError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(dir, err)),
    }
}
