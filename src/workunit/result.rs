use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status carried by a [`WuResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultStatus {
    /// Terminal result the application accepted after its own checks.
    Accept,
    /// Terminal result of a run the backend reported as failed, or one the
    /// application rejected.
    Invalid,
    /// Terminal result of a completed run.
    Final,
    /// Partial result of a still running WU.
    Sub,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultStatus::Accept => write!(f, "ACCEPT"),
            ResultStatus::Invalid => write!(f, "INVALID"),
            ResultStatus::Final => write!(f, "FINAL"),
            ResultStatus::Sub => write!(f, "SUB"),
        }
    }
}

/// Output of a finished WU, or one partial artifact of a running one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WuResult {
    pub wu_name: String,
    pub status: ResultStatus,
    pub output_dir: PathBuf,
    /// Logical output name → located file.
    pub outputs: BTreeMap<String, PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub syslog: Option<PathBuf>,
    /// `None` when the backend's termination record could not be parsed.
    pub exit_code: Option<i32>,
    pub received_at: DateTime<Utc>,
}

impl WuResult {
    pub fn new(wu_name: &str, status: ResultStatus, output_dir: PathBuf) -> Self {
        Self {
            wu_name: wu_name.to_string(),
            status,
            output_dir,
            outputs: BTreeMap::new(),
            stdout: None,
            stderr: None,
            syslog: None,
            exit_code: None,
            received_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != ResultStatus::Sub
    }

    pub fn output(&self, logical_name: &str) -> Option<&Path> {
        self.outputs.get(logical_name).map(PathBuf::as_path)
    }

    /// Record the application's verdict on a terminal result. Sub-results
    /// carry no verdict and are left untouched.
    pub fn set_verdict(&mut self, accepted: bool) {
        if self.is_terminal() {
            self.status = if accepted {
                ResultStatus::Accept
            } else {
                ResultStatus::Invalid
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_applies_to_terminal_results_only() {
        let mut final_result = WuResult::new("wu", ResultStatus::Final, PathBuf::from("/tmp/wu"));
        final_result.set_verdict(true);
        assert_eq!(final_result.status, ResultStatus::Accept);
        final_result.set_verdict(false);
        assert_eq!(final_result.status, ResultStatus::Invalid);

        let mut sub = WuResult::new("wu", ResultStatus::Sub, PathBuf::from("/tmp/wu"));
        sub.set_verdict(true);
        assert_eq!(sub.status, ResultStatus::Sub);
        assert!(!sub.is_terminal());
    }

    #[test]
    fn output_lookup() {
        let mut result = WuResult::new("wu", ResultStatus::Final, PathBuf::from("/tmp/wu"));
        result
            .outputs
            .insert("out.txt".into(), PathBuf::from("/tmp/wu/out.txt"));
        assert_eq!(result.output("out.txt"), Some(Path::new("/tmp/wu/out.txt")));
        assert!(result.output("missing").is_none());
    }
}
