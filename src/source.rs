//! Local checkout of the application's git repository.
//!
//! The access token, when present, is spliced into the https remote URL only
//! for the duration of the network operation. The persisted `origin` always
//! carries the token-free URL and every diagnostic is scrubbed before it is
//! returned.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::executor::{CommandRunner, SpawnError};
use crate::model::SourceRef;

const REDACTED: &str = "***";

/// Errors raised while fetching the application source.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SourceError {
    /// Raised when `git` cannot be started.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    /// Raised when a git operation exits unsuccessfully.
    #[error("git {operation} failed with status {status_text}: {stderr}")]
    Git {
        /// Operation that failed, such as `clone` or `pull`.
        operation: String,
        /// Human readable exit status.
        status_text: String,
        /// Redacted standard error.
        stderr: String,
    },
}

/// Clones or fast-forwards a repository into a local checkout.
#[derive(Clone, Debug)]
pub struct SourceFetcher<R: CommandRunner> {
    git_bin: String,
    runner: R,
}

impl<R: CommandRunner> SourceFetcher<R> {
    /// Creates a fetcher invoking `git_bin`.
    #[must_use]
    pub fn new(git_bin: impl Into<String>, runner: R) -> Self {
        Self {
            git_bin: git_bin.into(),
            runner,
        }
    }

    /// Brings `checkout_dir` up to date with `source.branch` and returns it.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] when git cannot be started or any operation
    /// fails. Token text never appears in the error.
    pub fn fetch(
        &self,
        source: &SourceRef,
        checkout_dir: &Utf8Path,
        token: Option<&str>,
    ) -> Result<Utf8PathBuf, SourceError> {
        let token = token.filter(|value| !value.is_empty());
        let auth_url = authenticated_url(&source.repo_url, token);
        let git = Git {
            bin: &self.git_bin,
            runner: &self.runner,
            token,
        };

        if checkout_dir.join(".git").exists() {
            info!(checkout = %checkout_dir, branch = %source.branch, "updating checkout");
            let dir = checkout_dir.as_str();
            let updated = update(&git, dir, &source.branch, &auth_url, &source.repo_url);
            if auth_url != source.repo_url {
                let reset = git.run(
                    "remote",
                    &["-C", dir, "remote", "set-url", "origin", source.repo_url.as_str()],
                );
                updated?;
                reset?;
            } else {
                updated?;
            }
        } else {
            info!(checkout = %checkout_dir, branch = %source.branch, "cloning repository");
            git.run(
                "clone",
                &[
                    "clone",
                    "--branch",
                    source.branch.as_str(),
                    "--single-branch",
                    auth_url.as_str(),
                    checkout_dir.as_str(),
                ],
            )?;
            if auth_url != source.repo_url {
                git.run(
                    "remote",
                    &[
                        "-C",
                        checkout_dir.as_str(),
                        "remote",
                        "set-url",
                        "origin",
                        source.repo_url.as_str(),
                    ],
                )?;
            }
        }
        Ok(checkout_dir.to_path_buf())
    }
}

fn update<R: CommandRunner>(
    git: &Git<'_, R>,
    dir: &str,
    branch: &str,
    auth_url: &str,
    clean_url: &str,
) -> Result<(), SourceError> {
    if auth_url != clean_url {
        git.run("remote", &["-C", dir, "remote", "set-url", "origin", auth_url])?;
    }
    git.run("fetch", &["-C", dir, "fetch", "origin", branch])?;
    git.run("checkout", &["-C", dir, "checkout", branch])?;
    git.run("pull", &["-C", dir, "pull", "--ff-only", "origin", branch])?;
    Ok(())
}

struct Git<'a, R: CommandRunner> {
    bin: &'a str,
    runner: &'a R,
    token: Option<&'a str>,
}

impl<R: CommandRunner> Git<'_, R> {
    fn run(&self, operation: &str, args: &[&str]) -> Result<(), SourceError> {
        debug!(
            command = %redact(&format!("{} {}", self.bin, args.join(" ")), self.token),
            "running git"
        );
        let os_args: Vec<OsString> = args.iter().map(OsString::from).collect();
        let output = self
            .runner
            .run(self.bin, &os_args)
            .map_err(|err| SpawnError {
                program: err.program,
                message: redact(&err.message, self.token),
            })?;
        if output.is_success() {
            return Ok(());
        }
        Err(SourceError::Git {
            operation: operation.to_owned(),
            status_text: output.status_text(),
            stderr: redact(output.stderr.trim(), self.token),
        })
    }
}

/// Inserts `x-access-token:<token>@` into https URLs; other schemes pass
/// through unchanged.
#[must_use]
pub fn authenticated_url(url: &str, token: Option<&str>) -> String {
    match (url.strip_prefix("https://"), token) {
        (Some(rest), Some(secret)) => {
            let host_part = rest.split_once('@').map_or(rest, |(_, after)| after);
            format!("https://x-access-token:{secret}@{host_part}")
        }
        _ => url.to_owned(),
    }
}

/// Replaces every occurrence of `token` in `text`.
#[must_use]
pub fn redact(text: &str, token: Option<&str>) -> String {
    match token {
        Some(secret) if !secret.is_empty() => text.replace(secret, REDACTED),
        _ => text.to_owned(),
    }
}
