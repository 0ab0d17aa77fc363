//! Transfer executor - runs the external sync tool for one data-set.
//!
//! The child's stdout and stderr are read line by line as they arrive and
//! handed to the caller's callbacks in order. Lines are raw bytes from the
//! tool, so bytes that are not UTF-8 are replaced rather than rejected. The child is spawned with
//! `kill_on_drop`, and on every return path it has either exited or been
//! killed and reaped.

use crate::utils::errors::{BackupError, Result};
use std::borrow::Cow;
use std::ffi::OsString;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A fully assembled transfer tool invocation
#[derive(Debug, Clone)]
pub struct TransferCommand {
    pub program: String,
    pub args: Vec<OsString>,
}

impl TransferCommand {
    pub fn new(program: &str, args: Vec<OsString>) -> Self {
        Self {
            program: program.to_string(),
            args,
        }
    }

    /// Shell-like rendering for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().map(|a| a.to_string_lossy().to_string()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a successful transfer
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    pub stdout_lines: usize,
    pub stderr_lines: usize,
}

/// Run `command` to completion, streaming output into the callbacks.
///
/// A non-zero exit is an error naming `dataset`. Cancelling `cancel` kills
/// the child and returns [`BackupError::Cancelled`].
pub async fn run_transfer<F, G>(
    command: &TransferCommand,
    dataset: &str,
    cancel: &CancellationToken,
    mut on_stdout: F,
    mut on_stderr: G,
) -> Result<TransferOutcome>
where
    F: FnMut(&str),
    G: FnMut(&str),
{
    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| BackupError::TransferSpawn {
            program: command.program.clone(),
            source,
        })?;

    debug!("Spawned {} (pid {:?})", command.program, child.id());

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("child stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("child stderr not captured"))?;

    let mut stdout_lines = BufReader::new(stdout).split(b'\n');
    let mut stderr_lines = BufReader::new(stderr).split(b'\n');
    let mut stdout_open = true;
    let mut stderr_open = true;
    let mut outcome = TransferOutcome::default();

    while stdout_open || stderr_open {
        tokio::select! {
            line = stdout_lines.next_segment(), if stdout_open => match line? {
                Some(line) => {
                    outcome.stdout_lines += 1;
                    on_stdout(&decode_line(&line));
                }
                None => stdout_open = false,
            },
            line = stderr_lines.next_segment(), if stderr_open => match line? {
                Some(line) => {
                    outcome.stderr_lines += 1;
                    on_stderr(&decode_line(&line));
                }
                None => stderr_open = false,
            },
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                return Err(BackupError::Cancelled);
            }
        }
    }

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            terminate(&mut child).await;
            return Err(BackupError::Cancelled);
        }
    };

    check_status(status, dataset)?;
    Ok(outcome)
}

fn decode_line(line: &[u8]) -> Cow<'_, str> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line)
}

fn check_status(status: ExitStatus, dataset: &str) -> Result<()> {
    if status.success() {
        Ok(())
    } else {
        Err(BackupError::TransferFailed {
            dataset: dataset.to_string(),
            status: status.to_string(),
        })
    }
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!("Failed to kill transfer process: {}", e);
    }
}
