//! Capability probing and install planning for the target host.
//!
//! Probes are read-only and all complete before any action is planned, so a
//! host that already carries every capability yields an empty plan.

use std::fmt;

use thiserror::Error;
use tracing::{debug, info};

use crate::executor::{ConnectionError, Exec, RemoteCommand, RemoteExecutor, has_program};
use crate::plan::{Phase, Step};
use crate::strategy::Strategy;

const DEBIAN_IDS: [&str; 5] = ["debian", "ubuntu", "raspbian", "linuxmint", "pop"];
const REDHAT_IDS: [&str; 7] = ["rhel", "centos", "fedora", "rocky", "almalinux", "amzn", "ol"];

/// Distribution family, chosen once from `/etc/os-release`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PackageFamily {
    /// Debian, Ubuntu and derivatives.
    Debian,
    /// RHEL, Fedora and derivatives.
    RedHat,
}

/// Package manager used for installs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PackageManager {
    /// `apt-get`.
    AptGet,
    /// `dnf`.
    Dnf,
    /// `yum`, for RedHat hosts without `dnf`.
    Yum,
}

impl PackageManager {
    const fn program(self) -> &'static str {
        match self {
            Self::AptGet => "apt-get",
            Self::Dnf => "dnf",
            Self::Yum => "yum",
        }
    }

    /// Refreshes the package index.
    #[must_use]
    pub fn refresh_index(self) -> RemoteCommand {
        let exec = match self {
            Self::AptGet => Exec::new("apt-get").arg("update"),
            Self::Dnf | Self::Yum => Exec::new(self.program()).arg("makecache"),
        };
        exec.privileged().into()
    }

    /// Installs `packages` non-interactively.
    #[must_use]
    pub fn install(self, packages: &[&str]) -> RemoteCommand {
        Exec::new(self.program())
            .args(["install", "-y"])
            .args(packages.iter().copied())
            .privileged()
            .into()
    }

    /// Package names for `capability` under this manager's family.
    #[must_use]
    pub const fn packages(self, capability: Capability) -> &'static [&'static str] {
        match (self, capability) {
            (Self::AptGet, Capability::ContainerRuntime) => &["docker.io"],
            (Self::Dnf | Self::Yum, Capability::ContainerRuntime) => &["docker"],
            (_, Capability::ComposeTool) => &["docker-compose"],
            (_, Capability::ReverseProxy) => &["nginx"],
        }
    }
}

/// Software the deployment depends on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Capability {
    /// Docker engine.
    ContainerRuntime,
    /// `docker compose` or `docker-compose`.
    ComposeTool,
    /// nginx.
    ReverseProxy,
}

impl Capability {
    const fn slug(self) -> &'static str {
        match self {
            Self::ContainerRuntime => "docker",
            Self::ComposeTool => "compose",
            Self::ReverseProxy => "nginx",
        }
    }

    /// Probe that succeeds when the capability is installed.
    #[must_use]
    pub fn installed_probe(self) -> RemoteCommand {
        match self {
            Self::ContainerRuntime => has_program("docker"),
            Self::ComposeTool => RemoteCommand::Or(vec![
                ComposeTool::Plugin.version_probe(),
                ComposeTool::Standalone.version_probe(),
            ]),
            Self::ReverseProxy => has_program("nginx"),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Flavour of compose available on the host.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ComposeTool {
    /// `docker compose` CLI plugin.
    Plugin,
    /// `docker-compose` binary.
    Standalone,
}

impl ComposeTool {
    /// Starts a compose invocation.
    #[must_use]
    pub fn command(self) -> Exec {
        match self {
            Self::Plugin => Exec::new("docker").arg("compose"),
            Self::Standalone => Exec::new("docker-compose"),
        }
    }

    fn version_probe(self) -> RemoteCommand {
        self.command().arg("version").quiet().into()
    }
}

/// Install or enable action for one missing capability.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProvisionAction {
    /// Refresh the package index before the first install.
    RefreshIndex,
    /// Install the packages providing `capability`.
    Install {
        /// Capability being installed.
        capability: Capability,
        /// Packages to install.
        packages: Vec<String>,
    },
    /// Enable and start a systemd service.
    EnableService {
        /// Unit name.
        service: String,
    },
}

/// Result of probing the host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProvisionPlan {
    /// Detected family.
    pub family: PackageFamily,
    /// Manager used for installs.
    pub manager: PackageManager,
    /// Compose tool available once the plan has run, when needed.
    pub compose: Option<ComposeTool>,
    /// Ordered actions; empty for a fully provisioned host.
    pub actions: Vec<ProvisionAction>,
}

impl ProvisionPlan {
    /// Whether the host already has everything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Converts the actions into plan steps, each guarded by a probe.
    #[must_use]
    pub fn steps(&self) -> Vec<Step> {
        self.actions
            .iter()
            .map(|action| match action {
                ProvisionAction::RefreshIndex => Step::remote(
                    "provision.refresh_index",
                    Phase::Provisioning,
                    self.manager.refresh_index(),
                ),
                ProvisionAction::Install {
                    capability,
                    packages,
                } => {
                    let names: Vec<&str> = packages.iter().map(String::as_str).collect();
                    Step::remote(
                        format!("provision.install_{}", capability.slug()),
                        Phase::Provisioning,
                        self.manager.install(&names),
                    )
                    .satisfied_when(capability.installed_probe())
                    .keyed(format!("package:{}", packages.join(",")))
                }
                ProvisionAction::EnableService { service } => Step::remote(
                    format!("provision.enable_{service}"),
                    Phase::Provisioning,
                    Exec::new("systemctl")
                        .args(["enable", "--now"])
                        .arg(service.as_str())
                        .privileged(),
                )
                .satisfied_when(service_active(service))
                .keyed(format!("service:{service}")),
            })
            .collect()
    }
}

/// `systemctl is-active --quiet <service>`.
#[must_use]
pub fn service_active(service: &str) -> RemoteCommand {
    Exec::new("systemctl")
        .args(["is-active", "--quiet", service])
        .into()
}

/// Errors raised while probing the host.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProvisionError {
    /// Raised when the distribution is neither Debian nor RedHat family.
    #[error("unsupported platform: ID={id} ID_LIKE={id_like}")]
    UnsupportedPlatform {
        /// `ID` from `/etc/os-release`.
        id: String,
        /// `ID_LIKE` from `/etc/os-release`.
        id_like: String,
    },
    /// Raised when `/etc/os-release` cannot be read.
    #[error("cannot read /etc/os-release: {stderr}")]
    OsRelease {
        /// Diagnostic from the remote command.
        stderr: String,
    },
    /// Raised when the host cannot be reached.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Probes a host and plans the missing installs.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProvisioningPlanner;

impl ProvisioningPlanner {
    /// Probes `executor`'s host. The compose tool is only required for
    /// [`Strategy::Compose`].
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] for unknown distributions, unreadable
    /// `os-release`, or connection loss.
    pub fn plan<E: RemoteExecutor>(
        &self,
        executor: &E,
        strategy: Strategy,
    ) -> Result<ProvisionPlan, ProvisionError> {
        let family = host_family(executor, "probe.os_release")?;
        let manager = match family {
            PackageFamily::Debian => PackageManager::AptGet,
            PackageFamily::RedHat if probe(executor, "probe.dnf", &has_program("dnf"))? => {
                PackageManager::Dnf
            }
            PackageFamily::RedHat => PackageManager::Yum,
        };

        let docker_installed =
            probe(executor, "probe.docker", &Capability::ContainerRuntime.installed_probe())?;
        let docker_active = probe(executor, "probe.docker_active", &service_active("docker"))?;
        let compose = if strategy == Strategy::Compose {
            Some(detect_compose(executor)?)
        } else {
            None
        };
        let nginx_installed =
            probe(executor, "probe.nginx", &Capability::ReverseProxy.installed_probe())?;
        let nginx_active = probe(executor, "probe.nginx_active", &service_active("nginx"))?;

        let mut installs = Vec::new();
        if !docker_installed {
            installs.push(Capability::ContainerRuntime);
        }
        if compose == Some(None) {
            installs.push(Capability::ComposeTool);
        }
        if !nginx_installed {
            installs.push(Capability::ReverseProxy);
        }

        let mut actions = Vec::new();
        if !installs.is_empty() {
            actions.push(ProvisionAction::RefreshIndex);
        }
        actions.extend(installs.iter().map(|capability| ProvisionAction::Install {
            capability: *capability,
            packages: manager
                .packages(*capability)
                .iter()
                .map(|name| (*name).to_owned())
                .collect(),
        }));
        if !docker_active {
            actions.push(ProvisionAction::EnableService {
                service: String::from("docker"),
            });
        }
        if !nginx_active {
            actions.push(ProvisionAction::EnableService {
                service: String::from("nginx"),
            });
        }

        let plan = ProvisionPlan {
            family,
            manager,
            compose: compose.map(|found| found.unwrap_or(ComposeTool::Standalone)),
            actions,
        };
        info!(
            family = ?plan.family,
            manager = plan.manager.program(),
            actions = plan.actions.len(),
            "provisioning plan ready"
        );
        Ok(plan)
    }
}

fn probe<E: RemoteExecutor>(
    executor: &E,
    id: &str,
    command: &RemoteCommand,
) -> Result<bool, ConnectionError> {
    let present = executor.execute(id, command)?.is_success();
    debug!(probe = id, present, "capability probe");
    Ok(present)
}

fn detect_compose<E: RemoteExecutor>(
    executor: &E,
) -> Result<Option<ComposeTool>, ConnectionError> {
    for tool in [ComposeTool::Plugin, ComposeTool::Standalone] {
        if probe(executor, "probe.compose", &tool.version_probe())? {
            return Ok(Some(tool));
        }
    }
    Ok(None)
}

/// Reads `/etc/os-release` on the host and classifies it.
///
/// # Errors
///
/// Returns [`ProvisionError`] when the file cannot be read, the family is
/// unsupported or the host cannot be reached.
pub fn host_family<E: RemoteExecutor>(
    executor: &E,
    step_id: &str,
) -> Result<PackageFamily, ProvisionError> {
    let release = executor.execute(step_id, &Exec::new("cat").arg("/etc/os-release").into())?;
    if let Some(failure) = release.failure() {
        return Err(ProvisionError::OsRelease {
            stderr: failure.stderr,
        });
    }
    detect_family(&release.stdout)
}

/// Reads `ID` and `ID_LIKE` from `/etc/os-release` contents.
///
/// # Errors
///
/// Returns [`ProvisionError::UnsupportedPlatform`] when neither names a
/// supported family.
pub fn detect_family(os_release: &str) -> Result<PackageFamily, ProvisionError> {
    let mut id = String::new();
    let mut id_like = String::new();
    for line in os_release.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let cleaned = value.trim().trim_matches(['"', '\'']).to_lowercase();
        match key.trim() {
            "ID" => id = cleaned,
            "ID_LIKE" => id_like = cleaned,
            _ => {}
        }
    }

    let candidates = std::iter::once(id.as_str()).chain(id_like.split_whitespace());
    for candidate in candidates {
        if DEBIAN_IDS.contains(&candidate) {
            return Ok(PackageFamily::Debian);
        }
        if REDHAT_IDS.contains(&candidate) {
            return Ok(PackageFamily::RedHat);
        }
    }
    Err(ProvisionError::UnsupportedPlatform { id, id_like })
}
