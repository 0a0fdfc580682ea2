//! Remote command execution over the system `ssh` client.
//!
//! Non-zero remote exits are returned as values; only a failure to reach the
//! host at all surfaces as an error.

use std::ffi::OsString;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::run_log::RunLog;

mod command;
mod ssh;
mod types;

pub use command::{
    Exec, RemoteCommand, RenderOptions, has_program, prints_anything, test_path, write_file,
};
pub(crate) use command::quote;
pub use ssh::{SshTransport, expand_tilde};
pub use types::{CommandOutput, CommandRunner, ProcessCommandRunner, SpawnError};

/// Exit status `ssh` reserves for its own failures.
pub const SSH_CONNECTION_FAILURE: i32 = 255;
/// Exit status `timeout(1)` reports when the limit was hit.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Raised when the remote host cannot be reached.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConnectionError {
    /// Raised when `ssh` reports a connection-level failure.
    #[error("cannot reach {login}: {stderr}")]
    Unreachable {
        /// `user@host` that was contacted.
        login: String,
        /// Diagnostic emitted by the SSH client.
        stderr: String,
    },
    /// Raised when the local SSH client cannot be started.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

/// A remote command that ran but did not succeed.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("remote command exited with status {status_text}{}: {stderr}", timeout_note(.timed_out))]
pub struct CommandError {
    /// Exit code, when one was reported.
    pub exit_code: Option<i32>,
    /// Human readable exit status.
    pub status_text: String,
    /// Whether the per-command timeout was hit.
    pub timed_out: bool,
    /// Trimmed standard error.
    pub stderr: String,
}

const fn timeout_note(timed_out: &bool) -> &'static str {
    if *timed_out { " (timed out)" } else { "" }
}

/// Result of one remote command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExecOutcome {
    /// Remote exit code.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Whether the per-command timeout was hit.
    pub timed_out: bool,
}

impl ExecOutcome {
    /// Returns `true` when the remote command exited with status zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }

    /// Classifies a non-zero exit.
    #[must_use]
    pub fn failure(&self) -> Option<CommandError> {
        if self.is_success() {
            return None;
        }
        Some(CommandError {
            exit_code: self.exit_code,
            status_text: self
                .exit_code
                .map_or_else(|| String::from("unknown"), |code| code.to_string()),
            timed_out: self.timed_out,
            stderr: self.stderr.trim().to_owned(),
        })
    }

    /// Standard output followed by standard error.
    #[must_use]
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// Executes commands on the deployment target.
pub trait RemoteExecutor {
    /// Runs `command` on behalf of `step_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] when the host cannot be reached. A remote
    /// non-zero exit is reported through [`ExecOutcome`].
    fn execute(&self, step_id: &str, command: &RemoteCommand)
    -> Result<ExecOutcome, ConnectionError>;

    /// Renders `command` exactly as it would be sent.
    fn render(&self, command: &RemoteCommand) -> String;

    /// Names the remote endpoint in connection errors, e.g. `deploy@host`.
    fn destination(&self) -> String;

    /// Runs a no-op to confirm the host accepts commands.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] when the host cannot be reached or refuses
    /// to run even `true`.
    fn check_connectivity(&self) -> Result<(), ConnectionError> {
        let outcome = self.execute("connectivity", &Exec::new("true").into())?;
        if outcome.is_success() {
            return Ok(());
        }
        Err(ConnectionError::Unreachable {
            login: self.destination(),
            stderr: outcome.stderr.trim().to_owned(),
        })
    }
}

/// [`RemoteExecutor`] backed by the `ssh` client.
#[derive(Clone, Debug)]
pub struct SshExecutor<R: CommandRunner> {
    transport: SshTransport,
    runner: R,
    log: RunLog,
    render_options: RenderOptions,
    command_timeout: Option<Duration>,
}

impl<R: CommandRunner> SshExecutor<R> {
    /// Creates an executor that records every command in `log`.
    #[must_use]
    pub const fn new(transport: SshTransport, runner: R, log: RunLog) -> Self {
        Self {
            transport,
            runner,
            log,
            render_options: RenderOptions { use_sudo: false },
            command_timeout: None,
        }
    }

    /// Prefixes privileged invocations with `sudo`.
    #[must_use]
    pub const fn with_sudo(mut self, use_sudo: bool) -> Self {
        self.render_options.use_sudo = use_sudo;
        self
    }

    /// Bounds every command by `timeout`; `None` or zero disables the bound.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout.filter(|limit| !limit.is_zero());
        self
    }

    /// Connection settings in use.
    #[must_use]
    pub const fn transport(&self) -> &SshTransport {
        &self.transport
    }

    fn wrap_with_timeout(&self, rendered: &str) -> String {
        match self.command_timeout {
            Some(limit) => format!(
                "timeout {} sh -c {}",
                limit.as_secs().max(1),
                quote(rendered)
            ),
            None => rendered.to_owned(),
        }
    }
}

impl<R: CommandRunner> RemoteExecutor for SshExecutor<R> {
    fn execute(
        &self,
        step_id: &str,
        command: &RemoteCommand,
    ) -> Result<ExecOutcome, ConnectionError> {
        let rendered = self.render(command);
        self.log.command_issued(step_id, &rendered);
        debug!(step = step_id, command = %rendered, "issuing remote command");

        let args: Vec<OsString> = self
            .transport
            .command_args(&self.wrap_with_timeout(&rendered));
        let output = self.runner.run(&self.transport.ssh_bin, &args)?;

        if output.code == Some(SSH_CONNECTION_FAILURE) {
            return Err(ConnectionError::Unreachable {
                login: self.transport.login(),
                stderr: output.stderr.trim().to_owned(),
            });
        }

        Ok(ExecOutcome {
            timed_out: self.command_timeout.is_some() && output.code == Some(TIMEOUT_EXIT_CODE),
            exit_code: output.code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn render(&self, command: &RemoteCommand) -> String {
        command.render(self.render_options)
    }

    fn destination(&self) -> String {
        self.transport.login()
    }
}

#[cfg(test)]
mod tests;
