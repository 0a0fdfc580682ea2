//! Core library for the `hoist` single-host deployment tool.
//!
//! A deploy probes a Linux host over SSH, installs what is missing, pushes
//! the project tree with rsync, builds and starts the application with
//! Docker (or Docker Compose), fronts it with an nginx site, and checks that
//! it answers. Every run is journaled to an append-only run log.

pub mod config;
pub mod deploy;
pub mod executor;
pub mod health;
pub mod logging;
pub mod model;
pub mod plan;
pub mod provision;
pub mod proxy;
pub mod run_log;
pub mod source;
pub mod strategy;
pub mod sync;
pub mod test_support;

pub use config::{ConfigError, DeploySettings, Operation, Overrides};
pub use deploy::{
    CancelFlag, CleanupReport, DeployError, DeployReport, DeployState, DeployWarning,
    DeploymentOrchestrator, ExitStatus, RunOutcome,
};
pub use executor::{
    CommandRunner, ConnectionError, ProcessCommandRunner, RemoteCommand, RemoteExecutor,
    SshExecutor, SshTransport,
};
pub use health::{HealthReport, HealthValidator};
pub use model::{AppName, Application, CredentialRef, DeploymentTarget, SourceRef};
pub use plan::{DeploymentPlan, Phase, Step, StepAction};
pub use provision::{ProvisionPlan, ProvisioningPlanner};
pub use proxy::{ProxySettings, ReverseProxyConfigurator, SiteLayout};
pub use run_log::{RunLog, RunLogError, StepResult, StepStatus};
pub use source::{SourceError, SourceFetcher};
pub use strategy::Strategy;
pub use sync::{FileSynchronizer, SyncError, SyncReport};
