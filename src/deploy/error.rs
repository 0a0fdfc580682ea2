//! Failure taxonomy for deploy and cleanup runs.

use thiserror::Error;

use super::state::InvalidTransition;
use crate::config::ConfigError;
use crate::executor::{CommandError, ConnectionError};
use crate::model::AppNameError;
use crate::plan::{Phase, PlanError};
use crate::provision::ProvisionError;
use crate::proxy::ProxyError;
use crate::run_log::RunLogError;
use crate::source::SourceError;
use crate::strategy::NoDeploymentDescriptor;
use crate::sync::SyncError;

/// Why a step in a phase did not succeed.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StepFailure {
    /// A remote command exited unsuccessfully.
    #[error("step {step_id}: {source}")]
    Command {
        /// Failing step.
        step_id: String,
        /// Command failure.
        source: CommandError,
    },
    /// Capability probing could not classify the host.
    #[error(transparent)]
    Probe(ProvisionError),
    /// The file transfer failed or could not be verified.
    #[error(transparent)]
    Transfer(SyncError),
    /// The proxy site could not be installed.
    #[error(transparent)]
    Proxy(ProxyError),
    /// One or more health checks did not pass.
    #[error("health checks failed: {}", .failed_checks.join(", "))]
    Unhealthy {
        /// Names of the failed checks.
        failed_checks: Vec<String>,
    },
}

impl StepFailure {
    /// Exit code of the failing command, when one was observed.
    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Command { source, .. } | Self::Proxy(ProxyError::Command { source, .. }) => {
                source.exit_code
            }
            Self::Transfer(SyncError::CommandFailure { status, .. }) => *status,
            _ => None,
        }
    }

    /// Whether the failing command hit the per-command timeout.
    #[must_use]
    pub const fn timed_out(&self) -> bool {
        match self {
            Self::Command { source, .. } | Self::Proxy(ProxyError::Command { source, .. }) => {
                source.timed_out
            }
            _ => false,
        }
    }

    /// Converts a failure in a non-fatal phase into a warning.
    #[must_use]
    pub fn into_warning(self, step_id: &str) -> DeployWarning {
        match self {
            Self::Unhealthy { failed_checks } => DeployWarning::Validation { failed_checks },
            other => DeployWarning::Proxy {
                step_id: step_id.to_owned(),
                message: other.to_string(),
            },
        }
    }
}

/// Fatal errors; each stops the run where it happened.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DeployError {
    /// Bad input detected before any remote call.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The application source could not be fetched locally.
    #[error("source fetch failed: {0}")]
    Source(#[from] SourceError),
    /// The host could not be reached.
    #[error("connectivity error: {0}")]
    Connectivity(#[from] ConnectionError),
    /// A prerequisite is missing and could not be installed.
    #[error("provisioning failed: {0}")]
    Provisioning(StepFailure),
    /// Application files are not present on the host.
    #[error("sync failed: {0}")]
    Sync(StepFailure),
    /// The application could not be built or started.
    #[error("build or run failed: {0}")]
    BuildOrRun(StepFailure),
    /// The run was cancelled before `step` started.
    #[error("interrupted before step {step}")]
    Interrupted {
        /// First step that was not issued.
        step: String,
    },
    /// A defect in hoist itself, such as an unwritable run log.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<NoDeploymentDescriptor> for DeployError {
    fn from(value: NoDeploymentDescriptor) -> Self {
        Self::Config(ConfigError::Invalid(value.to_string()))
    }
}

impl From<AppNameError> for DeployError {
    fn from(value: AppNameError) -> Self {
        Self::Config(ConfigError::Invalid(value.to_string()))
    }
}

impl From<InvalidTransition> for DeployError {
    fn from(value: InvalidTransition) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<PlanError> for DeployError {
    fn from(value: PlanError) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<RunLogError> for DeployError {
    fn from(value: RunLogError) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<ProvisionError> for DeployError {
    fn from(value: ProvisionError) -> Self {
        match value {
            ProvisionError::Connection(err) => Self::Connectivity(err),
            other => Self::Provisioning(StepFailure::Probe(other)),
        }
    }
}

impl DeployError {
    /// Wraps a step failure in the error of the fatal `phase`.
    #[must_use]
    pub fn in_phase(phase: Phase, failure: StepFailure) -> Self {
        match (phase, failure) {
            (_, StepFailure::Transfer(SyncError::Connection(err))) => Self::Connectivity(err),
            (Phase::Provisioning, failure) => Self::Provisioning(failure),
            (Phase::Syncing, failure) => Self::Sync(failure),
            (Phase::Deploying | Phase::ProxyConfiguring | Phase::Validating, failure) => {
                Self::BuildOrRun(failure)
            }
        }
    }
}

/// Non-fatal problems; the run still reaches `Done`.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DeployWarning {
    /// A proxy step failed; the application may still answer on its port.
    #[error("proxy step {step_id} failed: {message}")]
    Proxy {
        /// Failing step.
        step_id: String,
        /// Failure description.
        message: String,
    },
    /// One or more health checks failed.
    #[error("health checks failed: {}", .failed_checks.join(", "))]
    Validation {
        /// Names of the failed checks.
        failed_checks: Vec<String>,
    },
}

/// Process exit statuses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitStatus {
    /// Everything succeeded.
    Success,
    /// A defect in hoist.
    Internal,
    /// Bad configuration or input.
    Config,
    /// The host could not be reached.
    Connectivity,
    /// Provisioning failed.
    Provisioning,
    /// File transfer failed.
    Sync,
    /// Build or start failed.
    Deploy,
    /// Deployed, but the proxy could not be configured.
    ProxyWarning,
    /// Deployed, but health checks failed.
    ValidationWarning,
    /// Some cleanup steps failed.
    CleanupIncomplete,
    /// Cancelled by the user.
    Interrupted,
}

impl ExitStatus {
    /// Numeric process exit code.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Internal => 1,
            Self::Config => 2,
            Self::Connectivity => 3,
            Self::Provisioning => 4,
            Self::Sync => 5,
            Self::Deploy => 6,
            Self::ProxyWarning => 7,
            Self::ValidationWarning => 8,
            Self::CleanupIncomplete => 9,
            Self::Interrupted => 130,
        }
    }
}

impl From<&DeployError> for ExitStatus {
    fn from(value: &DeployError) -> Self {
        match value {
            DeployError::Config(_) | DeployError::Source(_) => Self::Config,
            DeployError::Connectivity(_) => Self::Connectivity,
            DeployError::Provisioning(_) => Self::Provisioning,
            DeployError::Sync(_) => Self::Sync,
            DeployError::BuildOrRun(_) => Self::Deploy,
            DeployError::Interrupted { .. } => Self::Interrupted,
            DeployError::Internal(_) => Self::Internal,
        }
    }
}

impl From<&DeployWarning> for ExitStatus {
    fn from(value: &DeployWarning) -> Self {
        match value {
            DeployWarning::Proxy { .. } => Self::ProxyWarning,
            DeployWarning::Validation { .. } => Self::ValidationWarning,
        }
    }
}
