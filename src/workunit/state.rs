use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle states of a work unit.
///
/// The happy path is CREATED → SUBMITTED → RUNNING → FINISHED. SUSPENDED
/// loops back through SUBMITTED on resume, UNKNOWN marks a polling anomaly
/// and ABORTED is reachable from any live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WuState {
    Created,
    Submitted,
    Running,
    Suspended,
    Finished,
    Aborted,
    Unknown,
}

impl fmt::Display for WuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WuState::Created => write!(f, "CREATED"),
            WuState::Submitted => write!(f, "SUBMITTED"),
            WuState::Running => write!(f, "RUNNING"),
            WuState::Suspended => write!(f, "SUSPENDED"),
            WuState::Finished => write!(f, "FINISHED"),
            WuState::Aborted => write!(f, "ABORTED"),
            WuState::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl WuState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WuState::Finished | WuState::Aborted)
    }

    /// States in which a backend-side job may exist.
    pub fn has_backend_job(&self) -> bool {
        matches!(
            self,
            WuState::Submitted | WuState::Running | WuState::Suspended | WuState::Unknown
        )
    }

    /// States the poller sweeps.
    pub fn is_pollable(&self) -> bool {
        matches!(self, WuState::Submitted | WuState::Running | WuState::Unknown)
    }
}

/// Something that happened to a work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WuEvent {
    /// The application submitted the WU.
    Submit,
    /// The backend reports the job started.
    Start,
    /// The poller observed completion.
    Finish,
    Suspend,
    Resume,
    Cancel,
    /// A poll returned an undefined or error status.
    Anomaly,
    /// A healthy poll followed an anomaly.
    Recover,
    /// The WU was recreated and resubmitted after repeated anomalies.
    Recreate,
}

/// Rejected transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: WuState,
    pub event: WuEvent,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} is not allowed in state {}", self.event, self.from)
    }
}

/// The transition table.
pub struct StateMachine;

impl StateMachine {
    /// Compute the state reached from `from` on `event`.
    pub fn next(from: WuState, event: WuEvent) -> Result<WuState, IllegalTransition> {
        use WuEvent::*;
        use WuState::*;

        let to = match (from, event) {
            (Created, Submit) => Submitted,
            (Submitted, Start) => Running,
            (Running, Finish) => Finished,
            (Running, Suspend) => Suspended,
            (Suspended, Resume) => Submitted,
            (Created | Submitted | Running | Suspended | Unknown, Cancel) => Aborted,
            (Submitted | Running | Unknown, Anomaly) => Unknown,
            (Unknown, Recover) => Running,
            (Unknown, Recreate) => Submitted,
            _ => return Err(IllegalTransition { from, event }),
        };
        Ok(to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_walks_all_states() {
        let s = StateMachine::next(WuState::Created, WuEvent::Submit).unwrap();
        assert_eq!(s, WuState::Submitted);
        let s = StateMachine::next(s, WuEvent::Start).unwrap();
        assert_eq!(s, WuState::Running);
        let s = StateMachine::next(s, WuEvent::Finish).unwrap();
        assert_eq!(s, WuState::Finished);
        assert!(s.is_terminal());
    }

    #[test]
    fn finish_requires_running() {
        assert!(StateMachine::next(WuState::Submitted, WuEvent::Finish).is_err());
        assert!(StateMachine::next(WuState::Created, WuEvent::Finish).is_err());
    }

    #[test]
    fn suspend_resume_cycle() {
        let s = StateMachine::next(WuState::Running, WuEvent::Suspend).unwrap();
        assert_eq!(s, WuState::Suspended);
        let s = StateMachine::next(s, WuEvent::Resume).unwrap();
        assert_eq!(s, WuState::Submitted);
        assert!(StateMachine::next(WuState::Submitted, WuEvent::Suspend).is_err());
    }

    #[test]
    fn submit_only_from_created() {
        for from in [
            WuState::Submitted,
            WuState::Running,
            WuState::Suspended,
            WuState::Finished,
            WuState::Aborted,
            WuState::Unknown,
        ] {
            let err = StateMachine::next(from, WuEvent::Submit).unwrap_err();
            assert_eq!(err.from, from);
        }
    }

    #[test]
    fn cancel_from_live_states_only() {
        assert_eq!(
            StateMachine::next(WuState::Suspended, WuEvent::Cancel),
            Ok(WuState::Aborted)
        );
        assert!(StateMachine::next(WuState::Finished, WuEvent::Cancel).is_err());
        assert!(StateMachine::next(WuState::Aborted, WuEvent::Cancel).is_err());
    }

    #[test]
    fn anomaly_cycle() {
        let s = StateMachine::next(WuState::Running, WuEvent::Anomaly).unwrap();
        assert_eq!(s, WuState::Unknown);
        assert_eq!(StateMachine::next(s, WuEvent::Recover), Ok(WuState::Running));
        assert_eq!(StateMachine::next(s, WuEvent::Recreate), Ok(WuState::Submitted));
        assert!(StateMachine::next(WuState::Running, WuEvent::Recreate).is_err());
    }

    #[test]
    fn state_display() {
        assert_eq!(WuState::Created.to_string(), "CREATED");
        assert_eq!(WuState::Suspended.to_string(), "SUSPENDED");
        assert_eq!(WuState::Unknown.to_string(), "UNKNOWN");
    }
}
