//! Remote-shell transport: spawns commands on a remote host over `ssh`.
//!
//! Grounded on `cisco_lab::ssh::SshSession`. Kept intentionally generic — it
//! knows nothing about measurement tools, flows, or histograms; endpoint
//! controllers and the fleet coordinator's preclean phase build on top of it.

use std::{
    ffi::OsStr,
    process::{ExitStatus, Output, Stdio},
    string::FromUtf8Error,
    time::Duration,
};

use itertools::Itertools;
use thiserror::Error;
use tokio::{process::Command, time::timeout};

/// How long [`RemoteSession::new`] waits for the initial probe round trip.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A persistent SSH destination used to run commands on a remote host.
///
/// Every spawned command reuses a single multiplexed connection via
/// `ControlMaster`, so repeated invocations against the same host (preclean,
/// start, signal-stop, ...) don't pay a fresh handshake each time.
#[derive(Debug, Clone)]
pub struct RemoteSession {
    destination: String,
}

impl RemoteSession {
    /// Connect to `destination` (an SSH host, e.g. `user@host` or a configured
    /// `~/.ssh/config` alias) and verify it is reachable with a round-trip probe.
    pub async fn new(destination: impl Into<String>) -> Result<Self, RemoteError> {
        let destination = destination.into();
        log::trace!("[{destination}] connecting...");
        let this = Self { destination };

        match timeout(CONNECT_TIMEOUT, this.execute_cmd(&["echo", "test"])).await {
            Ok(Ok((stdout, stderr))) => {
                let stdout = String::from_utf8_lossy(&stdout);
                if !stderr.is_empty() {
                    log::error!(
                        "[{}] unexpected stderr during connect: {}",
                        this.name(),
                        String::from_utf8_lossy(&stderr)
                    );
                    return Err(RemoteError::Setup(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "unexpected stderr during connection probe",
                    )));
                }
                if stdout.trim() != "test" {
                    log::error!(
                        "[{}] unexpected stdout during connect: {stdout}",
                        this.name()
                    );
                    return Err(RemoteError::Setup(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("expected `test`, got `{stdout}`"),
                    )));
                }
                log::trace!("[{}] connection established", this.name());
                Ok(this)
            }
            Ok(Err(e)) => {
                log::error!("[{}] error while connecting: {e}", this.name());
                Err(e)
            }
            Err(_) => {
                log::error!("[{}] connection timeout", this.name());
                Err(RemoteError::Timeout)
            }
        }
    }

    /// The SSH destination string (host, or `user@host`).
    pub fn name(&self) -> &str {
        &self.destination
    }

    /// Build a raw `ssh` command with the multiplexing flags set, but no program
    /// argument yet.
    fn raw_command(&self, args: &[impl AsRef<OsStr>]) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-oControlMaster=auto")
            .arg("-oControlPath=/tmp/.flowfleet-ssh-%r@%h:%p")
            .arg("-oControlPersist=10m")
            .arg("-oBatchMode=yes")
            .args(args)
            .arg(&self.destination)
            .kill_on_drop(true);
        log::trace!("[tokio::process::Command] {cmd:?}");
        cmd
    }

    /// Get a command that executes `program` on the remote machine.
    pub fn command(&self, program: impl AsRef<OsStr>) -> Command {
        let mut cmd = self.raw_command(crate::ssh::EMPTY);
        cmd.arg(program);
        cmd
    }

    /// Execute a command and return `(stdout, stderr)`. Fails if the exit code
    /// is non-zero.
    pub async fn execute_cmd(
        &self,
        args: &[impl AsRef<str> + Sync],
    ) -> Result<(Vec<u8>, Vec<u8>), RemoteError> {
        let cmd_str = || args.iter().map(AsRef::as_ref).join(" ");
        log::trace!("[{}] `{}`", self.name(), cmd_str());

        let mut cmd = self.raw_command(EMPTY);
        for arg in args {
            cmd.arg(arg.as_ref());
        }
        let output = cmd.output().await.map_err(|e| {
            log::error!("[{}] `{}` failed to spawn: {e}", self.name(), cmd_str());
            RemoteError::Client(e)
        })?;

        check_output(self.name(), output, cmd_str)
    }

    /// Execute a command and return its parsed stdout, requiring empty stderr.
    pub async fn execute_cmd_stdout(
        &self,
        args: &[impl AsRef<str> + Sync],
    ) -> Result<String, RemoteError> {
        let (stdout, stderr) = self.execute_cmd(args).await?;
        if !stderr.is_empty() {
            return Err(RemoteError::CommandError(
                self.name().to_string(),
                args.iter().map(AsRef::as_ref).join(" "),
                255,
            ));
        }
        Ok(String::from_utf8(stdout)?)
    }

    /// Execute a command and return the raw exit status, without checking it.
    pub async fn execute_cmd_status(
        &self,
        args: &[impl AsRef<str> + Sync],
    ) -> Result<ExitStatus, RemoteError> {
        log::trace!(
            "[{}] `{}`",
            self.name(),
            args.iter().map(AsRef::as_ref).join(" ")
        );
        let mut cmd = self.raw_command(EMPTY);
        for arg in args {
            cmd.arg(arg.as_ref());
        }
        let out = cmd.output().await.map_err(RemoteError::Client)?;
        Ok(out.status)
    }

    /// Spawn a command and return the `tokio::process::Child` handle without
    /// waiting for it, for commands that are expected to run for the duration
    /// of a measurement (e.g. the measurement tool itself).
    pub fn spawn_command(
        &self,
        program: impl AsRef<OsStr>,
        args: &[String],
    ) -> Result<tokio::process::Child, RemoteError> {
        let mut cmd = self.command(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        log::trace!("[{}] spawning `{:?}`", self.name(), cmd);
        cmd.spawn().map_err(RemoteError::Client)
    }
}

pub(crate) const EMPTY: &[&str] = &[];

/// Check a completed command's exit status, logging stdout/stderr on failure.
fn check_output<F, S>(host: &str, output: Output, cmd: F) -> Result<(Vec<u8>, Vec<u8>), RemoteError>
where
    F: FnOnce() -> S,
    S: std::fmt::Display,
{
    if output.status.success() {
        Ok((output.stdout, output.stderr))
    } else {
        let cmd = cmd().to_string();
        log::error!(
            "[{}] `{}` exited with code {}{}{}",
            host,
            cmd,
            output.status.code().unwrap_or_default(),
            if output.stdout.is_empty() {
                String::new()
            } else {
                format!("\nSTDOUT:\n{}", String::from_utf8_lossy(&output.stdout))
            },
            if output.stderr.is_empty() {
                String::new()
            } else {
                format!("\nSTDERR:\n{}", String::from_utf8_lossy(&output.stderr))
            }
        );
        Err(RemoteError::CommandError(
            host.to_string(),
            cmd,
            output.status.code().unwrap_or_default(),
        ))
    }
}

/// Errors returned by [`RemoteSession`].
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("error while establishing the connection: {0}")]
    Setup(std::io::Error),
    #[error("timeout while establishing the session")]
    Timeout,
    #[error("remote transport error: {0}")]
    Client(#[from] std::io::Error),
    #[error("non-zero exit code of `{1}` on {0}: {2}")]
    CommandError(String, String, i32),
    #[error("cannot parse output as UTF-8: {0}")]
    FromUtf8(#[from] FromUtf8Error),
}

impl RemoteError {
    /// The exit status, if this was a [`RemoteError::CommandError`].
    pub fn status(&self) -> Option<i32> {
        match self {
            RemoteError::CommandError(_, _, status) => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn connects_to_localhost_over_loopback_ssh() {
        // This test only runs meaningfully where passwordless ssh to localhost is
        // configured; elsewhere it is expected to time out or fail to connect,
        // which is still a well-defined `RemoteError`, not a panic.
        let result = RemoteSession::new("localhost").await;
        match result {
            Ok(session) => assert_eq!(session.name(), "localhost"),
            Err(_) => {}
        }
    }
}
