//! Configuration loading via `ortho-config`.
//!
//! `hoist.toml` (or `.hoist.toml`, or the file named by `HOIST_CONFIG_PATH`)
//! is found with `ortho-config` discovery and split into three tables:
//!
//! ```toml
//! [target]
//! host = "198.51.100.7"
//!
//! [app]
//! name = "shop"
//! internal_port = 3000
//!
//! [run]
//! settle_delay_secs = 5
//! ```
//!
//! Each table merges over its defaults and is overridden by its
//! `HOIST_TARGET_*`, `HOIST_APP_*` or `HOIST_RUN_*` environment variables.
//! [`DeploySettings::resolve`] then applies command-line overrides and
//! validates the result into domain values.

use std::collections::BTreeMap;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::ConfigDiscovery;
use ortho_config::figment::Figment;
use ortho_config::figment::providers::Env;
use ortho_config::figment::value::Value;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::executor::{SshTransport, expand_tilde};
use crate::model::{AppName, AppNameError, Application, CredentialRef, DeploymentTarget, SourceRef};
use crate::proxy::ProxySettings;
use crate::sync::SyncSettings;

const CONFIG_FILE: &str = "hoist.toml";

/// One table of `hoist.toml` and the environment variables overriding it.
pub trait ConfigSection: Default + DeserializeOwned {
    /// Table name, e.g. `target`.
    const TABLE: &'static str;
    /// Environment prefix, including the trailing underscore.
    const ENV_PREFIX: &'static str;

    /// Merges defaults, the section's table of `file` and the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when a value has the wrong type.
    fn load_from(file: Option<&Figment>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new();
        if let Some(file) = file {
            figment = figment.merge(file.focus(Self::TABLE));
        }
        figment
            .merge(Env::prefixed(Self::ENV_PREFIX))
            .extract()
            .map_err(|err| ConfigError::Parse(format!("[{}] {err}", Self::TABLE)))
    }
}

/// Connection and host layout settings, read from `[target]`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TargetConfig {
    /// Host name or address of the deployment target. Required.
    pub host: Option<String>,
    /// Login user.
    pub ssh_user: String,
    /// SSH port.
    pub ssh_port: u16,
    /// Private key; the agent and default keys are used when unset.
    pub ssh_identity_file: Option<String>,
    /// Parent directory of application directories on the host.
    pub base_dir: String,
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Path to the `rsync` executable.
    pub rsync_bin: String,
    /// Pass `BatchMode=yes` so missing keys fail instead of prompting.
    pub ssh_batch_mode: bool,
    /// Verify the host key against known hosts.
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override.
    pub ssh_known_hosts_file: Option<String>,
    /// Seconds allowed to establish the SSH connection.
    pub connect_timeout_secs: u64,
    /// Seconds allowed per remote command; zero disables the limit.
    pub command_timeout_secs: u64,
    /// Prefix privileged commands with `sudo`.
    pub use_sudo: bool,
    /// nginx directory holding linked site definitions.
    pub proxy_sites_available: Option<String>,
    /// nginx directory of enabled site links.
    pub proxy_sites_enabled: Option<String>,
    /// nginx directory whose `*.conf` files are included directly.
    pub proxy_conf_dir: Option<String>,
    /// Stop the distribution default server from claiming port 80.
    pub proxy_disable_default_site: bool,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: None,
            ssh_user: String::from("root"),
            ssh_port: 22,
            ssh_identity_file: None,
            base_dir: String::from("/opt/hoist"),
            ssh_bin: String::from("ssh"),
            rsync_bin: String::from("rsync"),
            ssh_batch_mode: true,
            ssh_strict_host_key_checking: true,
            ssh_known_hosts_file: None,
            connect_timeout_secs: 10,
            command_timeout_secs: 900,
            use_sudo: true,
            proxy_sites_available: None,
            proxy_sites_enabled: None,
            proxy_conf_dir: None,
            proxy_disable_default_site: true,
        }
    }
}

impl ConfigSection for TargetConfig {
    const TABLE: &'static str = "target";
    const ENV_PREFIX: &'static str = "HOIST_TARGET_";
}

/// Application settings, read from `[app]`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    /// Explicit application name.
    pub name: Option<String>,
    /// Port the application listens on. Required for deploys.
    pub internal_port: Option<u16>,
    /// Local directory to deploy when no repository is configured.
    pub project_dir: String,
    /// Git repository to fetch before deploying.
    pub repo_url: Option<String>,
    /// Branch to deploy.
    pub branch: String,
    /// Environment variable holding the repository access token.
    pub token_env: String,
    /// Local checkout location; defaults to `.hoist/checkout/<name>`.
    pub checkout_dir: Option<String>,
    /// Comma-separated rsync excludes added to the built-in list.
    pub extra_excludes: Option<String>,
    /// Honour `.gitignore` files while syncing.
    pub respect_gitignore: bool,
    /// Path to the `git` executable.
    pub git_bin: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: None,
            internal_port: None,
            project_dir: String::from("."),
            repo_url: None,
            branch: String::from("main"),
            token_env: String::from("HOIST_GIT_TOKEN"),
            checkout_dir: None,
            extra_excludes: None,
            respect_gitignore: true,
            git_bin: String::from("git"),
        }
    }
}

impl ConfigSection for AppConfig {
    const TABLE: &'static str = "app";
    const ENV_PREFIX: &'static str = "HOIST_APP_";
}

/// Run behaviour settings, read from `[run]`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    /// Directory receiving run logs.
    pub log_dir: String,
    /// Seconds to wait before health checks.
    pub settle_delay_secs: u64,
    /// Seconds to wait before retrying a failed step.
    pub retry_delay_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            log_dir: String::from(".hoist/runs"),
            settle_delay_secs: 5,
            retry_delay_secs: 2,
        }
    }
}

impl ConfigSection for RunConfig {
    const TABLE: &'static str = "run";
    const ENV_PREFIX: &'static str = "HOIST_RUN_";
}

/// Finds the first configuration file and rejects keys outside the three
/// tables, which would otherwise be ignored.
///
/// # Errors
///
/// Returns [`ConfigError`] when the file cannot be parsed or holds a
/// top-level key other than `[target]`, `[app]` or `[run]`.
pub fn discover_config_file() -> Result<Option<Figment>, ConfigError> {
    let Some(file) = ConfigDiscovery::builder("hoist")
        .env_var("HOIST_CONFIG_PATH")
        .config_file_name(CONFIG_FILE)
        .dotfile_name(".hoist.toml")
        .project_file_name(CONFIG_FILE)
        .build()
        .load_first()
        .map_err(|err| ConfigError::Parse(err.to_string()))?
    else {
        debug!("no configuration file found");
        return Ok(None);
    };

    let tables: BTreeMap<String, Value> = file
        .extract()
        .map_err(|err| ConfigError::Parse(err.to_string()))?;
    let sections = [TargetConfig::TABLE, AppConfig::TABLE, RunConfig::TABLE];
    if let Some(key) = tables.keys().find(|key| !sections.contains(&key.as_str())) {
        return Err(ConfigError::Invalid(format!(
            "unexpected key '{key}' in {CONFIG_FILE}; settings belong under [target], [app] or [run]"
        )));
    }
    debug!(tables = ?tables.keys().collect::<Vec<_>>(), "configuration file loaded");
    Ok(Some(file))
}

/// Metadata for a configuration field, used to generate actionable error
/// messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in {CONFIG_FILE}",
            self.description, self.env_var, self.toml_key, self.section
        ))
    }

    fn invalid(&self, reason: impl std::fmt::Display) -> ConfigError {
        ConfigError::Invalid(format!(
            "invalid {}: {reason} (check {} or {} in [{}] of {CONFIG_FILE})",
            self.description, self.env_var, self.toml_key, self.section
        ))
    }
}

const HOST: FieldMetadata =
    FieldMetadata::new("target host", "HOIST_TARGET_HOST", "host", "target");
const SSH_USER: FieldMetadata =
    FieldMetadata::new("SSH user", "HOIST_TARGET_SSH_USER", "ssh_user", "target");
const SSH_PORT: FieldMetadata =
    FieldMetadata::new("SSH port", "HOIST_TARGET_SSH_PORT", "ssh_port", "target");
const BASE_DIR: FieldMetadata =
    FieldMetadata::new("remote base directory", "HOIST_TARGET_BASE_DIR", "base_dir", "target");
const APP_NAME: FieldMetadata =
    FieldMetadata::new("application name", "HOIST_APP_NAME", "name", "app");
const INTERNAL_PORT: FieldMetadata = FieldMetadata::new(
    "application internal port",
    "HOIST_APP_INTERNAL_PORT",
    "internal_port",
    "app",
);
const PROJECT_DIR: FieldMetadata =
    FieldMetadata::new("project directory", "HOIST_APP_PROJECT_DIR", "project_dir", "app");

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a value that cannot be used.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

/// Entry point the settings are resolved for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    /// `hoist deploy`; the internal port is required.
    Deploy,
    /// `hoist cleanup`; only the name and target matter.
    Cleanup,
}

impl Operation {
    /// Name recorded in the run log.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::Cleanup => "cleanup",
        }
    }
}

/// Values given on the command line, taking precedence over every layer.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Overrides {
    /// `--project-dir`.
    pub project_dir: Option<String>,
    /// `--name`.
    pub name: Option<String>,
    /// `--port`.
    pub port: Option<u16>,
    /// `--exclude`, appended after configured excludes.
    pub excludes: Vec<String>,
}

/// Fully validated settings for one run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeploySettings {
    /// Remote host.
    pub target: DeploymentTarget,
    /// Application being deployed; `internal_port` is zero for cleanup.
    pub app: Application,
    /// SSH options shared by the executor and rsync.
    pub transport: SshTransport,
    /// rsync settings.
    pub sync: SyncSettings,
    /// Excludes added to the built-in list.
    pub extra_excludes: Vec<String>,
    /// nginx layout.
    pub proxy: ProxySettings,
    /// Prefix privileged commands with `sudo`.
    pub use_sudo: bool,
    /// Per-command limit; `None` disables it.
    pub command_timeout: Option<Duration>,
    /// Local checkout directory used when a repository is configured.
    pub checkout_dir: Option<Utf8PathBuf>,
    /// Path to `git`.
    pub git_bin: String,
    /// Directory receiving run logs.
    pub log_dir: Utf8PathBuf,
    /// Wait before health checks.
    pub settle_delay: Duration,
    /// Wait before retrying a failed step.
    pub retry_delay: Duration,
}

impl DeploySettings {
    /// Loads every layer from the environment and files, then resolves.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when loading or validation fails.
    pub fn load(operation: Operation, overrides: &Overrides) -> Result<Self, ConfigError> {
        let file = discover_config_file()?;
        Self::resolve(
            TargetConfig::load_from(file.as_ref())?,
            AppConfig::load_from(file.as_ref())?,
            RunConfig::load_from(file.as_ref())?,
            overrides,
            operation,
        )
    }

    /// Validates the layers and applies `overrides`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the environment variable and TOML key
    /// of the first missing or invalid value.
    pub fn resolve(
        target: TargetConfig,
        app: AppConfig,
        run: RunConfig,
        overrides: &Overrides,
        operation: Operation,
    ) -> Result<Self, ConfigError> {
        let host = non_empty(target.host.as_deref()).ok_or_else(|| HOST.missing())?;
        if non_empty(Some(target.ssh_user.as_str())).is_none() {
            return Err(SSH_USER.missing());
        }
        if target.ssh_port == 0 {
            return Err(SSH_PORT.invalid("port must be non-zero"));
        }
        if !target.base_dir.starts_with('/') {
            return Err(BASE_DIR.invalid(format!("'{}' is not absolute", target.base_dir)));
        }

        let repo_url = non_empty(app.repo_url.as_deref()).map(str::to_owned);
        let project_dir = Utf8PathBuf::from(
            overrides
                .project_dir
                .clone()
                .unwrap_or_else(|| app.project_dir.clone()),
        );
        if repo_url.is_none() && !project_dir.is_dir() {
            return Err(PROJECT_DIR.invalid(format!("{project_dir} is not a directory")));
        }
        let name = AppName::derive(
            overrides.name.as_deref().or(app.name.as_deref()),
            repo_url.as_deref(),
            &project_dir,
        )
        .map_err(|err: AppNameError| APP_NAME.invalid(err))?;

        let internal_port = match (overrides.port.or(app.internal_port), operation) {
            (Some(0), Operation::Deploy) => {
                return Err(INTERNAL_PORT.invalid("port must be non-zero"));
            }
            (Some(port), _) => port,
            (None, Operation::Deploy) => return Err(INTERNAL_PORT.missing()),
            (None, Operation::Cleanup) => 0,
        };

        let checkout_dir = repo_url.as_ref().map(|_| {
            app.checkout_dir
                .as_deref()
                .and_then(|dir| non_empty(Some(dir)))
                .map_or_else(
                    || Utf8PathBuf::from(format!(".hoist/checkout/{name}")),
                    |dir| Utf8PathBuf::from(expand_tilde(dir)),
                )
        });
        let source = repo_url.map(|url| SourceRef {
            repo_url: url,
            branch: app.branch.clone(),
            token_env: app.token_env.clone(),
        });

        let credential = non_empty(target.ssh_identity_file.as_deref())
            .map_or(CredentialRef::Agent, |path| {
                CredentialRef::IdentityFile(expand_tilde(path))
            });
        let deployment_target = DeploymentTarget {
            host: host.to_owned(),
            user: target.ssh_user.clone(),
            port: target.ssh_port,
            credential,
            base_dir: target.base_dir.clone(),
        };
        let mut transport = SshTransport::for_target(&deployment_target, target.ssh_bin.clone());
        transport.batch_mode = target.ssh_batch_mode;
        transport.strict_host_key_checking = target.ssh_strict_host_key_checking;
        transport.known_hosts_file = target
            .ssh_known_hosts_file
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_default();
        transport.connect_timeout = Duration::from_secs(target.connect_timeout_secs.max(1));

        let mut extra_excludes: Vec<String> = app
            .extra_excludes
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|pattern| !pattern.is_empty())
            .map(str::to_owned)
            .collect();
        extra_excludes.extend(overrides.excludes.iter().cloned());

        Ok(Self {
            app: Application {
                name,
                source,
                internal_port,
                project_dir: checkout_dir.clone().unwrap_or(project_dir),
            },
            target: deployment_target,
            transport,
            sync: SyncSettings {
                rsync_bin: target.rsync_bin,
                respect_gitignore: app.respect_gitignore,
            },
            extra_excludes,
            proxy: ProxySettings {
                sites_available: non_empty(target.proxy_sites_available.as_deref())
                    .map(str::to_owned),
                sites_enabled: non_empty(target.proxy_sites_enabled.as_deref()).map(str::to_owned),
                conf_dir: non_empty(target.proxy_conf_dir.as_deref()).map(str::to_owned),
                disable_default_site: target.proxy_disable_default_site,
            },
            use_sudo: target.use_sudo,
            command_timeout: Some(Duration::from_secs(target.command_timeout_secs))
                .filter(|limit| !limit.is_zero()),
            checkout_dir,
            git_bin: app.git_bin,
            log_dir: Utf8PathBuf::from(run.log_dir),
            settle_delay: Duration::from_secs(run.settle_delay_secs),
            retry_delay: Duration::from_secs(run.retry_delay_secs),
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|text| !text.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    #[fixture]
    fn target() -> TargetConfig {
        TargetConfig {
            host: Some(String::from("203.0.113.10")),
            ssh_user: String::from("deploy"),
            ssh_port: 2222,
            ssh_identity_file: Some(String::from("/keys/id_ed25519")),
            base_dir: String::from("/srv/apps"),
            ssh_bin: String::from("ssh"),
            rsync_bin: String::from("rsync"),
            ssh_batch_mode: true,
            ssh_strict_host_key_checking: false,
            ssh_known_hosts_file: None,
            connect_timeout_secs: 10,
            command_timeout_secs: 0,
            use_sudo: true,
            proxy_sites_available: None,
            proxy_sites_enabled: None,
            proxy_conf_dir: Some(String::from(" ")),
            proxy_disable_default_site: true,
        }
    }

    fn app(project_dir: &TempDir) -> AppConfig {
        AppConfig {
            name: None,
            internal_port: Some(8080),
            project_dir: project_dir.path().to_string_lossy().into_owned(),
            repo_url: None,
            branch: String::from("main"),
            token_env: String::from("HOIST_GIT_TOKEN"),
            checkout_dir: None,
            extra_excludes: Some(String::from("node_modules/, *.log ,")),
            respect_gitignore: true,
            git_bin: String::from("git"),
        }
    }

    fn run() -> RunConfig {
        RunConfig {
            log_dir: String::from(".hoist/runs"),
            settle_delay_secs: 5,
            retry_delay_secs: 2,
        }
    }

    fn project() -> TempDir {
        let tmp = TempDir::new().expect("temp dir");
        let dir = tmp.path().join("Demo");
        std::fs::create_dir(&dir).expect("project dir");
        tmp
    }

    #[rstest]
    fn resolve_builds_domain_values(target: TargetConfig) {
        let tmp = project();
        let mut app_config = app(&tmp);
        app_config.name = Some(String::from("Demo"));

        let settings = DeploySettings::resolve(
            target,
            app_config,
            run(),
            &Overrides {
                excludes: vec![String::from("tmp/")],
                ..Overrides::default()
            },
            Operation::Deploy,
        )
        .expect("settings resolve");

        assert_eq!(settings.app.name.as_str(), "demo");
        assert_eq!(settings.app.internal_port, 8080);
        assert_eq!(settings.target.app_dir(&settings.app.name), "/srv/apps/demo");
        assert_eq!(
            settings.target.credential,
            CredentialRef::IdentityFile(String::from("/keys/id_ed25519"))
        );
        assert_eq!(settings.transport.port, 2222);
        assert!(!settings.transport.strict_host_key_checking);
        assert_eq!(settings.extra_excludes, vec!["node_modules/", "*.log", "tmp/"]);
        assert_eq!(settings.command_timeout, None);
        assert_eq!(settings.settle_delay, Duration::from_secs(5));
        assert!(settings.checkout_dir.is_none());
        assert_eq!(settings.proxy, ProxySettings::default());
    }

    #[rstest]
    fn missing_host_names_env_var_and_key(target: TargetConfig) {
        let tmp = project();
        let err = DeploySettings::resolve(
            TargetConfig {
                host: Some(String::from("  ")),
                ..target
            },
            app(&tmp),
            run(),
            &Overrides::default(),
            Operation::Deploy,
        )
        .expect_err("host is required");

        let message = err.to_string();
        assert!(message.contains("HOIST_TARGET_HOST"), "{message}");
        assert!(message.contains("[target]"), "{message}");
        assert!(message.contains("hoist.toml"), "{message}");
    }

    #[rstest]
    fn port_is_required_for_deploy_only(target: TargetConfig) {
        let tmp = project();
        let mut app_config = app(&tmp);
        app_config.internal_port = None;
        app_config.name = Some(String::from("demo"));

        let err = DeploySettings::resolve(
            target.clone(),
            app_config.clone(),
            run(),
            &Overrides::default(),
            Operation::Deploy,
        )
        .expect_err("deploy needs a port");
        assert!(err.to_string().contains("HOIST_APP_INTERNAL_PORT"));

        let cleanup = DeploySettings::resolve(
            target,
            app_config,
            run(),
            &Overrides::default(),
            Operation::Cleanup,
        )
        .expect("cleanup does not need a port");
        assert_eq!(cleanup.app.internal_port, 0);
    }

    #[rstest]
    fn invalid_name_is_reported_not_stripped(target: TargetConfig) {
        let tmp = project();
        let err = DeploySettings::resolve(
            target,
            app(&tmp),
            run(),
            &Overrides {
                name: Some(String::from("my app")),
                ..Overrides::default()
            },
            Operation::Deploy,
        )
        .expect_err("space is invalid");

        let message = err.to_string();
        assert!(message.contains("invalid character ' '"), "{message}");
        assert!(message.contains("HOIST_APP_NAME"), "{message}");
    }

    #[rstest]
    fn repository_selects_checkout_dir(target: TargetConfig) {
        let tmp = project();
        let mut app_config = app(&tmp);
        app_config.project_dir = String::from("/nonexistent/path");
        app_config.repo_url = Some(String::from("https://github.com/acme/Shop.git"));

        let settings = DeploySettings::resolve(
            target,
            app_config,
            run(),
            &Overrides::default(),
            Operation::Deploy,
        )
        .expect("repository configuration resolves");

        assert_eq!(settings.app.name.as_str(), "shop");
        let checkout = Utf8PathBuf::from(".hoist/checkout/shop");
        assert_eq!(settings.checkout_dir.as_ref(), Some(&checkout));
        assert_eq!(settings.app.project_dir, checkout);
        assert!(settings.app.source.is_some());
    }

    #[rstest]
    fn missing_project_dir_is_config_error(target: TargetConfig) {
        let tmp = project();
        let err = DeploySettings::resolve(
            target,
            app(&tmp),
            run(),
            &Overrides {
                project_dir: Some(String::from("/nonexistent/project")),
                ..Overrides::default()
            },
            Operation::Deploy,
        )
        .expect_err("missing directory");

        assert!(err.to_string().contains("HOIST_APP_PROJECT_DIR"));
    }
}
