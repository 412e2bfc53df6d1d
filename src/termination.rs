//! Exit-code extraction from backend log text.
//!
//! Backends report job completion as free-form text: a line carrying a
//! termination marker (`Job terminated.`) followed by a status line such as
//! `(1) Normal termination (return value 0)` or
//! `(0) Abnormal termination (signal 9)`. Single-line forms like
//! `job 17 terminated with status 3` are accepted as well.
//!
//! Anything else is reported as [`TerminationError::FormatNotRecognized`];
//! callers never get a silent zero.

use thiserror::Error;

/// How a job ended, as recorded in its log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
}

impl Termination {
    /// Exit code in the shell convention (`128 + signal` for signals).
    pub fn exit_code(&self) -> i32 {
        match self {
            Termination::Exited(code) => *code,
            Termination::Signaled(signal) => signal.saturating_add(128),
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, Termination::Exited(0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TerminationError {
    #[error("no termination record found")]
    NoMarker,
    #[error("termination record format not recognized: {0}")]
    FormatNotRecognized(String),
}

/// Parse the last termination record in `log`.
pub fn parse_termination(log: &str) -> Result<Termination, TerminationError> {
    let lines: Vec<&str> = log.lines().collect();
    let marker = lines
        .iter()
        .rposition(|line| line.to_ascii_lowercase().contains("terminated"))
        .ok_or(TerminationError::NoMarker)?;

    if let Some(t) = parse_inline(lines[marker]) {
        return Ok(t);
    }

    // The status token sits on one of the lines after the marker, before
    // the record separator.
    for line in &lines[marker + 1..] {
        let trimmed = line.trim();
        if trimmed == "..." {
            break;
        }
        if let Some(t) = parse_status_line(trimmed) {
            return Ok(t);
        }
    }

    Err(TerminationError::FormatNotRecognized(
        lines[marker].trim().to_string(),
    ))
}

fn parse_status_line(line: &str) -> Option<Termination> {
    let lower = line.to_ascii_lowercase();
    if lower.contains("normal termination") && !lower.contains("abnormal") {
        return number_after(&lower, "return value").map(Termination::Exited);
    }
    if lower.contains("abnormal termination") {
        return number_after(&lower, "signal")
            .filter(is_signal)
            .map(Termination::Signaled);
    }
    None
}

fn parse_inline(line: &str) -> Option<Termination> {
    let lower = line.to_ascii_lowercase();
    if let Some(t) = parse_status_line(&lower) {
        return Some(t);
    }
    if let Some(code) = number_after(&lower, "status") {
        return Some(Termination::Exited(code));
    }
    if let Some(signal) = number_after(&lower, "signal").filter(is_signal) {
        return Some(Termination::Signaled(signal));
    }
    None
}

// Signal numbers that fit the `128 + signal` exit-code convention.
fn is_signal(number: &i32) -> bool {
    (1..=127).contains(number)
}

// First integer following `keyword`, skipping separators like `:` or `(`.
fn number_after(line: &str, keyword: &str) -> Option<i32> {
    let start = line.find(keyword)? + keyword.len();
    let rest = line[start..].trim_start_matches(|c: char| c.is_whitespace() || c == ':' || c == '=');
    let digits: String = rest
        .chars()
        .enumerate()
        .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && *c == '-'))
        .map(|(_, c)| c)
        .collect();
    digits.parse().ok()
}
