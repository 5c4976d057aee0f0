// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wrappers around Linux block-device and filesystem commands.

use slog::{debug, info, warn, Logger};
use std::process::{Output, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

pub mod fs;
pub mod host;
pub mod lsblk;
pub mod mkfs;
pub mod mount;
pub mod scsi;

#[cfg(any(test, feature = "testing"))]
pub mod fakes;

pub const LSBLK: &str = "lsblk";
pub const UDEVADM: &str = "udevadm";
pub const MKFS_EXT4: &str = "mkfs.ext4";
pub const MOUNT: &str = "mount";
pub const UMOUNT: &str = "umount";

// How long to wait for the output pipes of a killed child to drain.
const KILLED_OUTPUT_GRACE: Duration = Duration::from_secs(2);

static COMMAND_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub struct CommandFailureInfo {
    command: String,
    status: std::process::ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl std::fmt::Display for CommandFailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Command [{}] executed and failed with status: {}",
            self.command, self.status
        )?;
        write!(f, "  stdout: {}", self.stdout.trim_end())?;
        write!(f, "  stderr: {}", self.stderr.trim_end())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to start execution of [{command}]: {err}")]
    ExecutionStart { command: String, err: std::io::Error },

    #[error("{0}")]
    CommandFailure(Box<CommandFailureInfo>),

    #[error(
        "Command [{command}] did not finish within {timeout:?}  \
         stdout: {stdout}  stderr: {stderr}"
    )]
    Timeout { command: String, timeout: Duration, stdout: String, stderr: String },

    #[error("Failed to parse command output: {0}")]
    ParseFailure(String),
}

impl ExecutionError {
    /// Returns the captured standard error of a command that ran to
    /// completion and failed.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            ExecutionError::CommandFailure(info) => Some(&info.stderr),
            ExecutionError::Timeout { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

fn command_to_string(command: &std::process::Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|s| s.to_string_lossy().into())
        .collect::<Vec<String>>()
        .join(" ")
}

pub fn output_to_exec_error(
    command: &std::process::Command,
    output: &Output,
) -> ExecutionError {
    ExecutionError::CommandFailure(Box::new(CommandFailureInfo {
        command: command_to_string(command),
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    }))
}

fn log_output(log: &Logger, id: u64, output: &Output) {
    debug!(
        log,
        "command finished";
        "id" => id,
        "status" => %output.status,
        "stdout" => String::from_utf8_lossy(&output.stdout).trim_end(),
        "stderr" => String::from_utf8_lossy(&output.stderr).trim_end(),
    );
}

// Helper function for starting the process and checking the
// exit code result.
pub async fn execute_async(
    log: &Logger,
    command: &mut tokio::process::Command,
) -> Result<Output, ExecutionError> {
    let id = COMMAND_ID.fetch_add(1, Ordering::Relaxed);
    let command_str = command_to_string(command.as_std());
    info!(log, "running command"; "id" => id, "command" => &command_str);

    command.stdin(Stdio::null());
    let output = command.output().await.map_err(|err| {
        ExecutionError::ExecutionStart { command: command_str.clone(), err }
    })?;
    log_output(log, id, &output);

    if !output.status.success() {
        return Err(output_to_exec_error(command.as_std(), &output));
    }

    Ok(output)
}

/// Runs `command`, killing it if it has not exited within `timeout`.
///
/// Whatever the child wrote before it was killed is returned in
/// [`ExecutionError::Timeout`].
pub async fn execute_with_timeout(
    log: &Logger,
    command: &mut tokio::process::Command,
    timeout: Duration,
) -> Result<Output, ExecutionError> {
    let id = COMMAND_ID.fetch_add(1, Ordering::Relaxed);
    let command_str = command_to_string(command.as_std());
    info!(
        log,
        "running command";
        "id" => id,
        "command" => &command_str,
        "timeout" => ?timeout,
    );

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = command.spawn().map_err(|err| {
        ExecutionError::ExecutionStart { command: command_str.clone(), err }
    })?;
    let stdout = child.stdout.take().map(|pipe| tokio::spawn(drain(pipe)));
    let stderr = child.stderr.take().map(|pipe| tokio::spawn(drain(pipe)));

    let waited = tokio::time::timeout(timeout, child.wait()).await;
    match waited {
        Ok(waited) => {
            let status = waited.map_err(|err| {
                ExecutionError::ExecutionStart {
                    command: command_str.clone(),
                    err,
                }
            })?;
            let output = Output {
                status,
                stdout: collect(stdout).await,
                stderr: collect(stderr).await,
            };
            log_output(log, id, &output);
            if !output.status.success() {
                return Err(output_to_exec_error(command.as_std(), &output));
            }
            Ok(output)
        }
        Err(_) => {
            warn!(
                log,
                "command timed out, killing it";
                "id" => id,
                "timeout" => ?timeout,
            );
            if let Err(err) = child.kill().await {
                warn!(log, "failed to kill command"; "id" => id, "error" => %err);
            }
            let stdout = collect(stdout).await;
            let stderr = collect(stderr).await;
            Err(ExecutionError::Timeout {
                command: command_str,
                timeout,
                stdout: String::from_utf8_lossy(&stdout).to_string(),
                stderr: String::from_utf8_lossy(&stderr).to_string(),
            })
        }
    }
}

async fn drain<R: AsyncRead + Unpin>(mut pipe: R) -> Vec<u8> {
    let mut buf = Vec::new();
    // A read error just truncates what we report.
    let _ = pipe.read_to_end(&mut buf).await;
    buf
}

async fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    let Some(handle) = handle else {
        return Vec::new();
    };
    match tokio::time::timeout(KILLED_OUTPUT_GRACE, handle).await {
        Ok(Ok(buf)) => buf,
        _ => Vec::new(),
    }
}

#[cfg(test)]
pub(crate) fn test_log() -> Logger {
    use slog::Drain;
    let decorator =
        slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, slog::o!("component" => "blockdev-utils-test"))
}
