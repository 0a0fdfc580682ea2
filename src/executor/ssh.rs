//! SSH client options shared by the executor and the rsync transport.

use std::ffi::OsString;
use std::time::Duration;

use super::command::quote;
use crate::model::{CredentialRef, DeploymentTarget};

/// Connection settings for the system `ssh` client.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshTransport {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Remote login.
    pub user: String,
    /// Remote host name or address.
    pub host: String,
    /// Remote SSH port.
    pub port: u16,
    /// How the client authenticates.
    pub credential: CredentialRef,
    /// Force batch mode so a missing key never blocks on a password prompt.
    pub batch_mode: bool,
    /// Enforce host key verification.
    pub strict_host_key_checking: bool,
    /// Known hosts file override; empty keeps the client default.
    pub known_hosts_file: String,
    /// Upper bound on establishing the connection.
    pub connect_timeout: Duration,
}

impl SshTransport {
    /// Builds transport settings for `target`.
    #[must_use]
    pub fn for_target(target: &DeploymentTarget, ssh_bin: impl Into<String>) -> Self {
        Self {
            ssh_bin: ssh_bin.into(),
            user: target.user.clone(),
            host: target.host.clone(),
            port: target.port,
            credential: target.credential.clone(),
            batch_mode: true,
            strict_host_key_checking: true,
            known_hosts_file: String::new(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Returns `user@host`.
    #[must_use]
    pub fn login(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Options common to every `ssh` invocation, excluding the destination.
    #[must_use]
    pub fn options(&self) -> Vec<OsString> {
        let mut args = vec![OsString::from("-p"), OsString::from(self.port.to_string())];

        if let CredentialRef::IdentityFile(path) = &self.credential {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(path)));
        }

        if self.batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.known_hosts_file
            )));
        }

        if !self.connect_timeout.is_zero() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "ConnectTimeout={}",
                self.connect_timeout.as_secs().max(1)
            )));
        }

        args
    }

    /// Full argument vector to run `remote_command` on the target.
    #[must_use]
    pub fn command_args(&self, remote_command: &str) -> Vec<OsString> {
        let mut args = self.options();
        args.push(OsString::from(self.login()));
        args.push(OsString::from(remote_command));
        args
    }

    /// Value for `rsync --rsh`.
    ///
    /// rsync splits this string on whitespace and honours shell quotes, so
    /// every word is quoted individually.
    #[must_use]
    pub fn remote_shell(&self) -> String {
        let mut words = vec![quote(&self.ssh_bin).into_owned()];
        words.extend(
            self.options()
                .iter()
                .map(|arg| quote(&arg.to_string_lossy()).into_owned()),
        );
        words.join(" ")
    }
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// The input is returned unchanged when `HOME` is not set.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}
