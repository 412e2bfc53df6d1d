use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{IllegalTransition, StateMachine, WuEvent, WuState};

/// How an input file reaches the WU working directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferMode {
    /// Byte-for-byte copy; the source stays with the caller.
    Regular,
    /// Copy through the persistent cache so later WUs can reuse it.
    Persistent,
    /// Move; the source belongs to the stager afterwards.
    Volatile,
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferMode::Regular => write!(f, "regular"),
            TransferMode::Persistent => write!(f, "persistent"),
            TransferMode::Volatile => write!(f, "volatile"),
        }
    }
}

/// An input file already staged into the working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFile {
    pub logical_name: String,
    /// Where the file was taken from (local path or URL).
    pub source: String,
    pub mode: TransferMode,
}

/// Backend-specific job identifier: a PID, a Condor `cluster.proc`, a grid
/// job id or a BOINC workunit name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A dispatchable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub name: String,
    pub tag: Option<String>,
    /// Client executable: a path, or a bare name looked up on `PATH`.
    pub client: String,
    pub args: Vec<String>,
    pub priority: i32,
    pub inputs: Vec<InputFile>,
    pub outputs: Vec<String>,
    pub workdir: PathBuf,
    pub subresult_budget: u32,
    pub subresults_delivered: u32,
    pub state: WuState,
    pub state_history: Vec<WuState>,
    pub correlation_id: Option<CorrelationId>,
    /// Consecutive undefined/error polls.
    pub anomaly_streak: u32,
    /// Number of times the WU was recreated.
    pub generation: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkUnit {
    pub fn new(
        name: String,
        client: String,
        args: Vec<String>,
        subresult_budget: u32,
        tag: Option<String>,
        workdir: PathBuf,
    ) -> Self {
        let now = Utc::now();
        Self {
            name,
            tag,
            client,
            args,
            priority: 0,
            inputs: Vec::new(),
            outputs: Vec::new(),
            workdir,
            subresult_budget,
            subresults_delivered: 0,
            state: WuState::Created,
            state_history: Vec::new(),
            correlation_id: None,
            anomaly_streak: 0,
            generation: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Run `event` through the state machine and record the move.
    pub fn apply(&mut self, event: WuEvent) -> Result<WuState, IllegalTransition> {
        let next = StateMachine::next(self.state, event)?;
        if next != self.state {
            self.state_history.push(self.state);
            self.state = next;
        }
        self.updated_at = Utc::now();
        Ok(next)
    }

    /// Whether `logical_name` is already used by an input or an output.
    pub fn has_logical_name(&self, logical_name: &str) -> bool {
        self.inputs.iter().any(|f| f.logical_name == logical_name)
            || self.outputs.iter().any(|o| o == logical_name)
    }

    /// Path of a staged input or an expected output inside the working directory.
    pub fn file_path(&self, logical_name: &str) -> PathBuf {
        self.workdir.join(logical_name)
    }

    pub fn subresult_budget_left(&self) -> u32 {
        self.subresult_budget.saturating_sub(self.subresults_delivered)
    }
}

/// Build a fresh WU name from the project scope, a new UUID and an
/// optional tag.
pub fn make_wu_name(project: &str, tag: Option<&str>) -> String {
    let id = Uuid::new_v4().simple().to_string();
    match tag {
        Some(tag) if !tag.is_empty() => format!("{project}_{id}_{tag}"),
        _ => format!("{project}_{id}"),
    }
}

/// Identifiers embedded in WU and file names: ASCII letters, digits, `-`, `_`.
pub fn validate_identifier(kind: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{kind} must be non-empty"));
    }
    if value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Ok(());
    }
    Err(format!(
        "{kind} must use only ASCII letters, digits, '-' or '_'"
    ))
}
