//! Blocking invocation of backend command-line tools.

use std::io::{BufReader, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{command_err, io_err, DcError};

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub command_form: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turn a non-zero exit into a [`DcError::Command`].
    pub fn check(self) -> Result<Self, DcError> {
        if self.success() {
            return Ok(self);
        }
        let detail = if self.stderr.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            self.stderr.trim().to_string()
        };
        Err(command_err(
            &self.command_form,
            format!("exit code {:?}: {detail}", self.exit_code),
        ))
    }
}

/// Run `binary args...` in `cwd`, capturing both streams, killing the
/// process when `timeout` elapses.
pub fn run_command(
    binary: &str,
    args: &[String],
    cwd: &Path,
    timeout: Duration,
) -> Result<CommandOutput, DcError> {
    let command_form = if args.is_empty() {
        binary.to_string()
    } else {
        format!("{binary} {}", args.join(" "))
    };
    debug!(command = %command_form, cwd = %cwd.display(), "running backend command");

    let mut child = Command::new(binary)
        .current_dir(cwd)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                command_err(&command_form, "binary not found")
            } else {
                io_err(cwd, err)
            }
        })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io_err(cwd, std::io::Error::other("missing stdout pipe")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io_err(cwd, std::io::Error::other("missing stderr pipe")))?;

    let stdout_reader = thread::spawn(move || {
        let mut buf = String::new();
        let _ = BufReader::new(stdout).read_to_string(&mut buf);
        buf
    });
    let stderr_reader = thread::spawn(move || {
        let mut buf = String::new();
        let _ = BufReader::new(stderr).read_to_string(&mut buf);
        buf
    });

    let start = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_reader.join();
                    let _ = stderr_reader.join();
                    return Err(command_err(
                        &command_form,
                        format!("timed out after {}s", timeout.as_secs()),
                    ));
                }
                thread::sleep(Duration::from_millis(10));
            }
            Err(err) => return Err(io_err(cwd, err)),
        }
    };

    Ok(CommandOutput {
        command_form,
        exit_code: status.code(),
        stdout: stdout_reader.join().unwrap_or_default(),
        stderr: stderr_reader.join().unwrap_or_default(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn captures_stdout_and_exit_code() {
        let tmp = TempDir::new().unwrap();
        let out = run_command(
            "sh",
            &["-c".into(), "echo hello; echo oops >&2; exit 3".into()],
            tmp.path(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.exit_code, Some(3));
        let err = out.check().unwrap_err();
        assert!(err.to_string().contains("oops"));
    }

    #[test]
    fn missing_binary_is_reported() {
        let tmp = TempDir::new().unwrap();
        let err = run_command("definitely-not-a-binary-xyz", &[], tmp.path(), Duration::from_secs(1))
            .unwrap_err();
        assert!(err.to_string().contains("binary not found"));
    }

    #[test]
    fn timeout_kills_the_process() {
        let tmp = TempDir::new().unwrap();
        let err = run_command("sleep", &["5".into()], tmp.path(), Duration::from_millis(100))
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
