//! nginx site rendering and atomic installation.
//!
//! A new definition is written beside the live one, validated on its own
//! through a throwaway wrapper config, and only then moved into place. A
//! definition that fails validation never replaces the active site. After
//! activation `nginx -T` must list the definition, otherwise nginx would
//! keep serving whatever site it does load.

use std::fmt;

use thiserror::Error;
use tracing::{debug, info};

use crate::executor::{
    CommandError, ConnectionError, Exec, RemoteCommand, RemoteExecutor, test_path, write_file,
};
use crate::model::AppName;
use crate::provision::PackageFamily;

const DEBIAN_SITES_AVAILABLE: &str = "/etc/nginx/sites-available";
const DEBIAN_SITES_ENABLED: &str = "/etc/nginx/sites-enabled";
const CONF_D: &str = "/etc/nginx/conf.d";
const NGINX_CONF: &str = "/etc/nginx/nginx.conf";

/// Configured overrides for where nginx site definitions live.
///
/// Unset directories follow the package family of the host: Debian
/// derivatives link from `sites-enabled`, Red Hat derivatives include
/// `conf.d/*.conf`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProxySettings {
    /// Directory holding every linked site definition.
    pub sites_available: Option<String>,
    /// Directory of symlinks nginx loads.
    pub sites_enabled: Option<String>,
    /// Directory whose `*.conf` files nginx includes directly.
    pub conf_dir: Option<String>,
    /// Stop the distribution's default server from claiming port 80.
    pub disable_default_site: bool,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            sites_available: None,
            sites_enabled: None,
            conf_dir: None,
            disable_default_site: true,
        }
    }
}

impl ProxySettings {
    /// Resolves the layout used on a host of `family`.
    ///
    /// An explicit `conf_dir` wins, then explicit site directories, then the
    /// family default.
    #[must_use]
    pub fn layout(&self, family: PackageFamily) -> SiteLayout {
        if let Some(dir) = &self.conf_dir {
            return SiteLayout::Included { dir: trimmed(dir) };
        }
        if self.sites_available.is_some() || self.sites_enabled.is_some() {
            return SiteLayout::Linked {
                available: trimmed(
                    self.sites_available
                        .as_deref()
                        .unwrap_or(DEBIAN_SITES_AVAILABLE),
                ),
                enabled: trimmed(self.sites_enabled.as_deref().unwrap_or(DEBIAN_SITES_ENABLED)),
            };
        }
        match family {
            PackageFamily::Debian => SiteLayout::Linked {
                available: String::from(DEBIAN_SITES_AVAILABLE),
                enabled: String::from(DEBIAN_SITES_ENABLED),
            },
            PackageFamily::RedHat => SiteLayout::Included {
                dir: String::from(CONF_D),
            },
        }
    }
}

fn trimmed(dir: &str) -> String {
    dir.trim_end_matches('/').to_owned()
}

/// How nginx finds a site definition.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SiteLayout {
    /// Definition in `available`, enabled by a symlink in `enabled`.
    Linked {
        /// Directory of definitions.
        available: String,
        /// Directory of symlinks included by `nginx.conf`.
        enabled: String,
    },
    /// `<dir>/<app>.conf`, included by a `*.conf` glob.
    Included {
        /// Included directory.
        dir: String,
    },
}

impl SiteLayout {
    fn site_dir(&self) -> &str {
        match self {
            Self::Linked { available, .. } => available.as_str(),
            Self::Included { dir } => dir.as_str(),
        }
    }

    /// Path of `app`'s site definition.
    #[must_use]
    pub fn site_path(&self, app: &AppName) -> String {
        match self {
            Self::Linked { available, .. } => format!("{available}/{app}"),
            Self::Included { dir } => format!("{dir}/{app}.conf"),
        }
    }

    /// Path of `app`'s enabled symlink, when the layout uses one.
    #[must_use]
    pub fn enabled_path(&self, app: &AppName) -> Option<String> {
        match self {
            Self::Linked { enabled, .. } => Some(format!("{enabled}/{app}")),
            Self::Included { .. } => None,
        }
    }

    /// Path nginx reports for the site when it loads it.
    #[must_use]
    pub fn loaded_path(&self, app: &AppName) -> String {
        self.enabled_path(app).unwrap_or_else(|| self.site_path(app))
    }

    fn dirs(&self) -> Vec<&str> {
        match self {
            Self::Linked { available, enabled } => vec![available.as_str(), enabled.as_str()],
            Self::Included { dir } => vec![dir.as_str()],
        }
    }

    // Neither name matches a `*.conf` include glob.
    fn staging_path(&self, app: &AppName) -> String {
        format!("{}/.{app}.staging", self.site_dir())
    }

    fn wrapper_path(&self, app: &AppName) -> String {
        format!("{}/.{app}.check", self.site_dir())
    }
}

/// Renders the site definition for `app` forwarding to `internal_port`.
///
/// Output depends only on the arguments. The template is fixed: the app name
/// selects the file the definition is written to, not its contents.
#[must_use]
pub fn render_site(_app: &AppName, internal_port: u16) -> String {
    format!(
        "server {{
    listen 80;
    server_name _;
    location / {{
        proxy_pass http://127.0.0.1:{internal_port};
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
    }}
}}
"
    )
}

/// Result of [`ReverseProxyConfigurator::configure`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProxyOutcome {
    /// A new definition was validated and activated.
    Installed,
    /// The active definition was already identical and enabled.
    AlreadyCurrent,
}

/// Stage of the installation that failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProxyStage {
    /// Creating the site directories.
    Prepare,
    /// Writing the staged definition.
    Stage,
    /// `nginx -t` on the staged definition.
    Validate,
    /// Moving the definition into place and enabling it.
    Activate,
}

impl fmt::Display for ProxyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Prepare => "prepare",
            Self::Stage => "staging",
            Self::Validate => "validation",
            Self::Activate => "activation",
        })
    }
}

/// Errors raised while installing the site.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProxyError {
    /// Raised when a remote command in `stage` fails.
    #[error("proxy {stage} failed: {source}")]
    Command {
        /// Stage that failed.
        stage: ProxyStage,
        /// Underlying command failure.
        source: CommandError,
    },
    /// Raised when the active configuration does not include the site.
    #[error("nginx does not load {path}; check the include directives in {NGINX_CONF}")]
    NotLoaded {
        /// Path nginx was expected to report.
        path: String,
    },
    /// Raised when the host cannot be reached.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Installs nginx site definitions.
#[derive(Clone, Debug)]
pub struct ReverseProxyConfigurator {
    layout: SiteLayout,
    disable_default_site: bool,
}

impl Default for ReverseProxyConfigurator {
    fn default() -> Self {
        Self::new(&ProxySettings::default(), PackageFamily::Debian)
    }
}

impl ReverseProxyConfigurator {
    /// Creates a configurator for a host of `family`.
    #[must_use]
    pub fn new(settings: &ProxySettings, family: PackageFamily) -> Self {
        Self {
            layout: settings.layout(family),
            disable_default_site: settings.disable_default_site,
        }
    }

    /// Layout in use.
    #[must_use]
    pub const fn layout(&self) -> &SiteLayout {
        &self.layout
    }

    /// Installs the site for `app`, skipping when already current.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError`] when any stage fails. A validation failure
    /// removes the staged file and leaves the active site untouched.
    pub fn configure<E: RemoteExecutor>(
        &self,
        executor: &E,
        step_id: &str,
        app: &AppName,
        internal_port: u16,
    ) -> Result<ProxyOutcome, ProxyError> {
        let rendered = render_site(app, internal_port);
        let site = self.layout.site_path(app);
        let enabled = self.layout.enabled_path(app);

        let current = executor.execute(
            step_id,
            &Exec::new("cat").arg(site.as_str()).privileged().into(),
        )?;
        let is_enabled = match &enabled {
            Some(link) => executor.execute(step_id, &test_path("-L", link))?.is_success(),
            None => true,
        };
        if current.is_success() && current.stdout == rendered && is_enabled {
            debug!(site = %site, "proxy site already current");
            return Ok(ProxyOutcome::AlreadyCurrent);
        }

        let staging = self.layout.staging_path(app);
        let wrapper = self.layout.wrapper_path(app);
        run(
            executor,
            step_id,
            ProxyStage::Prepare,
            &Exec::new("mkdir")
                .arg("-p")
                .args(self.layout.dirs())
                .privileged()
                .into(),
        )?;
        run(
            executor,
            step_id,
            ProxyStage::Stage,
            &RemoteCommand::And(vec![
                write_file(&staging, &rendered, true),
                write_file(&wrapper, &wrapper_config(&staging), true),
            ]),
        )?;

        let validation = RemoteCommand::from(
            Exec::new("nginx")
                .args(["-t", "-q", "-c", wrapper.as_str()])
                .privileged(),
        );
        if let Err(err) = run(executor, step_id, ProxyStage::Validate, &validation) {
            let cleanup = Exec::new("rm")
                .args(["-f", staging.as_str(), wrapper.as_str()])
                .privileged();
            executor.execute(step_id, &cleanup.into())?;
            return Err(err);
        }

        let mut activation = vec![
            Exec::new("mv")
                .args(["-f", staging.as_str(), site.as_str()])
                .privileged()
                .into(),
        ];
        if let Some(link) = &enabled {
            activation.push(
                Exec::new("ln")
                    .args(["-sfn", site.as_str(), link.as_str()])
                    .privileged()
                    .into(),
            );
        }
        activation.push(
            Exec::new("rm")
                .args(["-f", wrapper.as_str()])
                .privileged()
                .into(),
        );
        run(
            executor,
            step_id,
            ProxyStage::Activate,
            &RemoteCommand::And(activation),
        )?;

        let loaded = self.layout.loaded_path(app);
        if !executor.execute(step_id, &loads_file(&loaded))?.is_success() {
            return Err(ProxyError::NotLoaded { path: loaded });
        }
        info!(site = %site, port = internal_port, "proxy site installed");
        Ok(ProxyOutcome::Installed)
    }

    /// Removes the site definition and its enabled symlink.
    #[must_use]
    pub fn remove_site(&self, app: &AppName) -> RemoteCommand {
        let mut paths = vec![String::from("-f")];
        paths.extend(self.layout.enabled_path(app));
        paths.push(self.layout.site_path(app));
        Exec::new("rm").args(paths).privileged().into()
    }

    /// Succeeds when neither the definition nor its symlink exists.
    #[must_use]
    pub fn site_absent(&self, app: &AppName) -> RemoteCommand {
        let site = test_path("-e", &self.layout.site_path(app));
        let present = match self.layout.enabled_path(app) {
            Some(link) => RemoteCommand::Or(vec![site, test_path("-L", &link)]),
            None => site,
        };
        RemoteCommand::not(present)
    }

    /// Stops the distribution default server from claiming port 80, when
    /// configured to. Returns the command and its already-satisfied check.
    ///
    /// Linked layouts drop the `default` symlink. Included layouts drop
    /// `default.conf` and the `default_server` flag from `nginx.conf`.
    #[must_use]
    pub fn disable_default_site(&self) -> Option<(RemoteCommand, RemoteCommand)> {
        if !self.disable_default_site {
            return None;
        }
        Some(match &self.layout {
            SiteLayout::Linked { enabled, .. } => {
                let path = format!("{enabled}/default");
                (
                    Exec::new("rm").args(["-f", path.as_str()]).privileged().into(),
                    RemoteCommand::not(test_path("-e", &path)),
                )
            }
            SiteLayout::Included { dir } => {
                let path = format!("{dir}/default.conf");
                let flagged =
                    RemoteCommand::from(Exec::new("grep").args(["-q", "default_server", NGINX_CONF]));
                (
                    RemoteCommand::And(vec![
                        Exec::new("rm").args(["-f", path.as_str()]).privileged().into(),
                        Exec::new("sed")
                            .args(["-i", "s/ default_server//g", NGINX_CONF])
                            .privileged()
                            .into(),
                    ]),
                    RemoteCommand::And(vec![
                        RemoteCommand::not(test_path("-e", &path)),
                        RemoteCommand::not(flagged),
                    ]),
                )
            }
        })
    }
}

/// Succeeds when `nginx -T` lists `path` among the loaded files.
fn loads_file(path: &str) -> RemoteCommand {
    RemoteCommand::pipe(
        Exec::new("nginx").arg("-T").privileged(),
        Exec::new("grep").args(["-qF".to_owned(), format!("# configuration file {path}:")]),
    )
}

/// Validates the full configuration, then reloads nginx.
#[must_use]
pub fn reload_command() -> RemoteCommand {
    RemoteCommand::And(vec![
        Exec::new("nginx").arg("-t").privileged().into(),
        Exec::new("systemctl")
            .args(["reload", "nginx"])
            .privileged()
            .into(),
    ])
}

fn wrapper_config(staged: &str) -> String {
    format!("events {{}}\nhttp {{\n    include {staged};\n}}\n")
}

fn run<E: RemoteExecutor>(
    executor: &E,
    step_id: &str,
    stage: ProxyStage,
    command: &RemoteCommand,
) -> Result<(), ProxyError> {
    let outcome = executor.execute(step_id, command)?;
    match outcome.failure() {
        Some(source) => Err(ProxyError::Command { stage, source }),
        None => Ok(()),
    }
}
