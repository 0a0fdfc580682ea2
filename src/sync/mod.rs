//! Pushes the local project tree to the target with `rsync` over the same SSH
//! transport the executor uses, then checks that the files arrived.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::executor::{
    CommandRunner, ConnectionError, Exec, RemoteCommand, RemoteExecutor, SSH_CONNECTION_FAILURE,
    SpawnError, SshTransport,
};
use crate::run_log::RunLog;

mod stats;

pub use stats::{TransferStats, parse_stats};

/// Paths never transferred, whatever the caller adds.
pub const DEFAULT_EXCLUDES: [&str; 8] = [
    ".git/", ".hg/", ".svn/", ".env", ".env.*", ".ssh/", "secrets/", ".secrets/",
];

/// Errors surfaced while synchronising files.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SyncError {
    /// Raised when the source directory does not exist.
    #[error("sync source directory missing: {path}")]
    MissingSource {
        /// Path that was expected to be synchronised.
        path: Utf8PathBuf,
    },
    /// Raised when `rsync` cannot be spawned.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    /// Raised when the remote host cannot be reached.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// Raised when `rsync` completes with a non-zero exit code.
    #[error("{program} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Command name used for the attempted operation.
        program: String,
        /// Exit status as reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
    /// Raised when the transfer summary cannot be read.
    #[error("cannot verify transfer: {message}")]
    Stats {
        /// What was missing from the output.
        message: String,
    },
    /// Raised when the remote file count cannot be obtained.
    #[error("cannot count files in {remote_dir}: {stderr}")]
    Verify {
        /// Remote directory that was inspected.
        remote_dir: String,
        /// Diagnostic from the remote command.
        stderr: String,
    },
    /// Raised when fewer files are present remotely than were sent.
    #[error("transfer incomplete: sent {sent} regular files but {present} are present in {remote_dir}")]
    Incomplete {
        /// Remote directory that was inspected.
        remote_dir: String,
        /// Regular files on the sending side.
        sent: u64,
        /// Regular files found remotely.
        present: u64,
    },
}

/// Outcome of a verified transfer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SyncReport {
    /// Bytes of file data sent.
    pub bytes_transferred: u64,
    /// Regular files on the sending side.
    pub files_sent: u64,
    /// Regular files found remotely after the transfer.
    pub files_present: u64,
}

/// Settings for [`FileSynchronizer`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SyncSettings {
    /// Path to the `rsync` executable.
    pub rsync_bin: String,
    /// Apply per-directory `.gitignore` rules during the transfer.
    pub respect_gitignore: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            rsync_bin: String::from("rsync"),
            respect_gitignore: true,
        }
    }
}

/// Pushes a local tree to a remote directory.
#[derive(Clone, Debug)]
pub struct FileSynchronizer<R: CommandRunner> {
    transport: SshTransport,
    settings: SyncSettings,
    runner: R,
    log: RunLog,
}

impl<R: CommandRunner> FileSynchronizer<R> {
    /// Creates a synchroniser sharing `transport` with the executor.
    #[must_use]
    pub const fn new(transport: SshTransport, settings: SyncSettings, runner: R, log: RunLog) -> Self {
        Self {
            transport,
            settings,
            runner,
            log,
        }
    }

    /// Transfers `local_dir` into `remote_dir` and verifies the result.
    ///
    /// Caller excludes are appended to [`DEFAULT_EXCLUDES`]. Running twice
    /// against an unchanged tree transfers nothing the second time.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when the source is missing, `rsync` fails, the
    /// summary cannot be parsed, or the remote holds fewer regular files than
    /// were sent.
    pub fn sync<E: RemoteExecutor>(
        &self,
        executor: &E,
        step_id: &str,
        local_dir: &Utf8Path,
        remote_dir: &str,
        extra_excludes: &[String],
    ) -> Result<SyncReport, SyncError> {
        let args = self.rsync_args(local_dir, remote_dir, extra_excludes)?;
        self.log.command_issued(step_id, &render_args(&self.settings.rsync_bin, &args));
        debug!(step = step_id, source = %local_dir, destination = remote_dir, "running rsync");

        let output = self.runner.run(&self.settings.rsync_bin, &args)?;
        if output.code == Some(SSH_CONNECTION_FAILURE) {
            return Err(SyncError::Connection(ConnectionError::Unreachable {
                login: self.transport.login(),
                stderr: output.stderr.trim().to_owned(),
            }));
        }
        if !output.is_success() {
            return Err(SyncError::CommandFailure {
                program: self.settings.rsync_bin.clone(),
                status: output.code,
                status_text: output.status_text(),
                stderr: output.stderr.trim().to_owned(),
            });
        }

        let stats = parse_stats(&output.stdout).map_err(|message| SyncError::Stats { message })?;
        let present = count_remote_files(executor, step_id, remote_dir)?;
        if present < stats.regular_files {
            return Err(SyncError::Incomplete {
                remote_dir: remote_dir.to_owned(),
                sent: stats.regular_files,
                present,
            });
        }

        info!(
            files = stats.regular_files,
            bytes = stats.transferred_bytes,
            destination = remote_dir,
            "synchronised project files"
        );
        Ok(SyncReport {
            bytes_transferred: stats.transferred_bytes,
            files_sent: stats.regular_files,
            files_present: present,
        })
    }

    fn rsync_args(
        &self,
        local_dir: &Utf8Path,
        remote_dir: &str,
        extra_excludes: &[String],
    ) -> Result<Vec<OsString>, SyncError> {
        if !local_dir.is_dir() {
            return Err(SyncError::MissingSource {
                path: local_dir.to_path_buf(),
            });
        }

        let mut args = vec![
            OsString::from("-az"),
            OsString::from("--delete"),
            OsString::from("--stats"),
        ];
        if self.settings.respect_gitignore {
            args.push(OsString::from("--filter=:- .gitignore"));
        }
        for pattern in DEFAULT_EXCLUDES
            .iter()
            .copied()
            .chain(extra_excludes.iter().map(String::as_str))
            .filter(|pattern| !pattern.trim().is_empty())
        {
            args.push(OsString::from("--exclude"));
            args.push(OsString::from(pattern));
        }
        args.push(OsString::from("--rsh"));
        args.push(OsString::from(self.transport.remote_shell()));
        args.push(OsString::from(format!(
            "{}/",
            local_dir.as_str().trim_end_matches('/')
        )));
        args.push(OsString::from(format!(
            "{}:{}/",
            self.transport.login(),
            remote_dir.trim_end_matches('/')
        )));
        Ok(args)
    }
}

fn count_remote_files<E: RemoteExecutor>(
    executor: &E,
    step_id: &str,
    remote_dir: &str,
) -> Result<u64, SyncError> {
    let command = RemoteCommand::pipe(
        Exec::new("find").args([remote_dir, "-type", "f"]).privileged(),
        Exec::new("wc").arg("-l"),
    );
    let outcome = executor.execute(step_id, &command)?;
    if let Some(failure) = outcome.failure() {
        return Err(SyncError::Verify {
            remote_dir: remote_dir.to_owned(),
            stderr: failure.stderr,
        });
    }
    outcome
        .stdout
        .trim()
        .parse()
        .map_err(|_| SyncError::Verify {
            remote_dir: remote_dir.to_owned(),
            stderr: format!("unexpected count output '{}'", outcome.stdout.trim()),
        })
}

fn render_args(program: &str, args: &[OsString]) -> String {
    std::iter::once(program.to_owned())
        .chain(args.iter().map(|arg| {
            crate::executor::quote(&arg.to_string_lossy()).into_owned()
        }))
        .collect::<Vec<_>>()
        .join(" ")
}
