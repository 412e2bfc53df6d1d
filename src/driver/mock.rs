//! Scripted driver for registry and poller tests.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;

use super::{
    not_impl, take_subresult, BackendDriver, BackendKind, Capabilities, OutputKind, PollStatus,
};
use crate::error::DcError;
use crate::workunit::{CorrelationId, ResultStatus, WorkUnit, WuResult};

#[derive(Default)]
struct MockState {
    /// Poll answers per WU name, consumed front to back.
    scripts: HashMap<String, VecDeque<Result<PollStatus, String>>>,
    next_id: u32,
    calls: Vec<String>,
    fail_submit: HashSet<String>,
    final_status: HashMap<String, ResultStatus>,
}

pub(crate) struct MockDriver {
    state: Mutex<MockState>,
    pub cancel_supported: bool,
    pub suspend_supported: bool,
    pub messaging: bool,
    /// Answer once a WU's script runs out.
    pub idle_status: PollStatus,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            cancel_supported: true,
            suspend_supported: true,
            messaging: true,
            idle_status: PollStatus::StillRunning,
        }
    }

    pub fn script(&self, wu: &str, statuses: &[PollStatus]) {
        self.state
            .lock()
            .scripts
            .entry(wu.to_string())
            .or_default()
            .extend(statuses.iter().copied().map(Ok));
    }

    /// Make the next poll of `wu` fail with an error.
    pub fn script_error(&self, wu: &str, message: &str) {
        self.state
            .lock()
            .scripts
            .entry(wu.to_string())
            .or_default()
            .push_back(Err(message.to_string()));
    }

    pub fn fail_next_submit(&self, wu: &str) {
        self.state.lock().fail_submit.insert(wu.to_string());
    }

    pub fn finish_as(&self, wu: &str, status: ResultStatus) {
        self.state.lock().final_status.insert(wu.to_string(), status);
    }

    /// Recorded calls as `operation:wu_name`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn count_calls(&self, operation: &str) -> usize {
        let prefix = format!("{operation}:");
        self.calls().iter().filter(|c| c.starts_with(&prefix)).count()
    }

    fn record(&self, operation: &str, wu: &WorkUnit) {
        self.state.lock().calls.push(format!("{operation}:{}", wu.name));
    }
}

impl BackendDriver for MockDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            exit_code: true,
            stdout: false,
            stderr: false,
            log: false,
            subresults: true,
            messaging: self.messaging,
            suspend: self.suspend_supported,
        }
    }

    fn submit(&self, wu: &WorkUnit) -> Result<CorrelationId, DcError> {
        self.record("submit", wu);
        let mut state = self.state.lock();
        if state.fail_submit.remove(&wu.name) {
            return Err(DcError::Command {
                command: "mock-submit".into(),
                message: "scripted failure".into(),
            });
        }
        state.next_id += 1;
        Ok(CorrelationId::new(format!("mock-{}", state.next_id)))
    }

    fn poll_status(&self, wu: &WorkUnit) -> Result<PollStatus, DcError> {
        let next = self
            .state
            .lock()
            .scripts
            .get_mut(&wu.name)
            .and_then(VecDeque::pop_front);
        match next {
            Some(Ok(status)) => Ok(status),
            Some(Err(message)) => Err(DcError::Internal(message)),
            None => Ok(self.idle_status),
        }
    }

    fn fetch_output(&self, wu: &WorkUnit, kind: OutputKind) -> Result<WuResult, DcError> {
        self.record("fetch", wu);
        if kind == OutputKind::Partial {
            return take_subresult(wu, &wu.workdir);
        }
        let status = self
            .state
            .lock()
            .final_status
            .get(&wu.name)
            .copied()
            .unwrap_or(ResultStatus::Final);
        let mut result = WuResult::new(&wu.name, status, wu.workdir.clone());
        result.exit_code = Some(0);
        Ok(result)
    }

    fn cancel(&self, wu: &WorkUnit) -> Result<(), DcError> {
        self.record("cancel", wu);
        if self.cancel_supported {
            Ok(())
        } else {
            Err(not_impl(self.kind(), "cancel"))
        }
    }

    fn suspend(&self, wu: &WorkUnit) -> Result<(), DcError> {
        self.record("suspend", wu);
        if self.suspend_supported {
            Ok(())
        } else {
            Err(not_impl(self.kind(), "suspend"))
        }
    }

    fn resume(&self, wu: &WorkUnit) -> Result<(), DcError> {
        self.record("resume", wu);
        if self.suspend_supported {
            Ok(())
        } else {
            Err(not_impl(self.kind(), "resume"))
        }
    }

    fn cleanup(&self, wu: &WorkUnit) -> Result<(), DcError> {
        self.record("cleanup", wu);
        Ok(())
    }
}
