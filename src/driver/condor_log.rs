//! Incremental reader for the Condor user event log.
//!
//! Each event starts with a header `NNN (cluster.proc.subproc) date time text`
//! and ends with a line holding `...`. The tail remembers the byte offset of
//! the first unconsumed event, so partially written events are picked up on
//! the next read.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{io_err, DcError};

use super::PollStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Submit,
    Execute,
    ExecutableError,
    Checkpointed,
    Evicted,
    Terminated,
    ImageSize,
    ShadowException,
    Aborted,
    Suspended,
    Unsuspended,
    Held,
    Released,
    Other(u16),
}

impl EventKind {
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => EventKind::Submit,
            1 => EventKind::Execute,
            2 => EventKind::ExecutableError,
            3 => EventKind::Checkpointed,
            4 => EventKind::Evicted,
            5 => EventKind::Terminated,
            6 => EventKind::ImageSize,
            7 => EventKind::ShadowException,
            9 => EventKind::Aborted,
            10 => EventKind::Suspended,
            11 => EventKind::Unsuspended,
            12 => EventKind::Held,
            13 => EventKind::Released,
            other => EventKind::Other(other),
        }
    }

    /// Job status implied by this event, or `None` when it says nothing
    /// about the job's progress.
    pub fn status(&self) -> Option<PollStatus> {
        match self {
            EventKind::Submit | EventKind::Evicted => Some(PollStatus::Queued),
            EventKind::Execute
            | EventKind::Checkpointed
            | EventKind::ImageSize
            | EventKind::Suspended
            | EventKind::Unsuspended
            | EventKind::Held
            | EventKind::Released => Some(PollStatus::StillRunning),
            EventKind::Terminated => Some(PollStatus::Finished),
            EventKind::ExecutableError | EventKind::ShadowException | EventKind::Aborted => {
                Some(PollStatus::Error)
            }
            EventKind::Other(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub kind: EventKind,
    pub cluster: u64,
    pub proc_id: u32,
    /// Header and body lines, separator excluded.
    pub text: String,
}

impl LogEvent {
    pub fn job_id(&self) -> String {
        format!("{}.{}", self.cluster, self.proc_id)
    }
}

/// Parse one event header: `005 (042.000.000) 10/16 12:01:00 Job terminated.`
pub fn parse_header(line: &str) -> Option<(EventKind, u64, u32)> {
    let mut tokens = line.split_whitespace();
    let code: u16 = tokens.next()?.parse().ok()?;
    let id = tokens.next()?.strip_prefix('(')?.strip_suffix(')')?;
    let mut parts = id.split('.');
    let cluster = parts.next()?.parse().ok()?;
    let proc_id = parts.next()?.parse().ok()?;
    Some((EventKind::from_code(code), cluster, proc_id))
}

/// Split complete events out of `text`. Returns the events and the number of
/// bytes consumed.
pub fn parse_events(text: &str) -> (Vec<LogEvent>, usize) {
    let mut events = Vec::new();
    let mut consumed = 0;
    let mut current: Option<(EventKind, u64, u32, String)> = None;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        offset += line.len();
        if !line.ends_with('\n') {
            break;
        }
        let trimmed = line.trim_end();
        if trimmed == "..." {
            if let Some((kind, cluster, proc_id, body)) = current.take() {
                events.push(LogEvent {
                    kind,
                    cluster,
                    proc_id,
                    text: body,
                });
            }
            consumed = offset;
            continue;
        }
        match current.as_mut() {
            Some((_, _, _, body)) => body.push_str(line),
            None => {
                if let Some((kind, cluster, proc_id)) = parse_header(trimmed) {
                    current = Some((kind, cluster, proc_id, line.to_string()));
                }
            }
        }
    }
    (events, consumed)
}

/// Tail state for one log file.
#[derive(Debug, Clone, Default)]
pub struct EventLogTail {
    offset: u64,
    last_status: Option<PollStatus>,
    terminated: Option<LogEvent>,
}

impl EventLogTail {
    /// Read events appended since the last call and fold them into the
    /// current status. Returns `None` until the log has a known event.
    pub fn advance(&mut self, path: &Path) -> Result<Option<PollStatus>, DcError> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(self.last_status),
            Err(err) => return Err(io_err(path, err)),
        };
        file.seek(SeekFrom::Start(self.offset))
            .map_err(|e| io_err(path, e))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf).map_err(|e| io_err(path, e))?;

        let (events, consumed) = parse_events(&buf);
        self.offset += consumed as u64;
        for event in events {
            if let Some(status) = event.kind.status() {
                // Termination is final even if stray events follow.
                if self.last_status != Some(PollStatus::Finished) {
                    self.last_status = Some(status);
                }
            }
            if event.kind == EventKind::Terminated {
                self.terminated = Some(event);
            }
        }
        Ok(self.last_status)
    }

    pub fn terminated_event(&self) -> Option<&LogEvent> {
        self.terminated.as_ref()
    }
}
