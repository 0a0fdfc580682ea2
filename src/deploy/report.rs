//! Run results handed back to the caller.

use std::fmt;

use camino::Utf8PathBuf;
use uuid::Uuid;

use super::error::{DeployError, DeployWarning, ExitStatus};
use super::state::DeployState;
use crate::health::HealthReport;
use crate::plan::Phase;
use crate::provision::ProvisionPlan;
use crate::run_log::{StepResult, StepStatus};
use crate::strategy::Strategy;
use crate::sync::SyncReport;

/// Where a failed run stopped.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailedAt {
    /// Local checks or the connectivity check.
    Init,
    /// A deploy phase.
    Phase(Phase),
    /// The cleanup path.
    Cleanup,
}

/// Classification printed as the first word of the summary line.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunOutcome {
    /// Every step succeeded or was already satisfied.
    Success,
    /// The run reached `Done` with proxy or validation warnings.
    SuccessWithWarnings,
    /// The run stopped.
    Failed(FailedAt),
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("Success"),
            Self::SuccessWithWarnings => f.write_str("SuccessWithWarnings"),
            Self::Failed(FailedAt::Init) => f.write_str("Failed(Init)"),
            Self::Failed(FailedAt::Phase(phase)) => write!(f, "Failed({phase})"),
            Self::Failed(FailedAt::Cleanup) => f.write_str("Failed(Cleanup)"),
        }
    }
}

/// Result of [`super::DeploymentOrchestrator::deploy`].
#[derive(Clone, Debug)]
pub struct DeployReport {
    /// Identifier recorded in the run log.
    pub run_id: Uuid,
    /// Application name.
    pub app: String,
    /// Terminal state of the machine.
    pub state: DeployState,
    /// Strategy chosen from the project tree, when selection ran.
    pub strategy: Option<Strategy>,
    /// Capability probe result, when probing ran.
    pub provision: Option<ProvisionPlan>,
    /// Every finished step, in order.
    pub steps: Vec<StepResult>,
    /// Non-fatal problems.
    pub warnings: Vec<DeployWarning>,
    /// Fatal error, when the run failed.
    pub error: Option<DeployError>,
    /// Health check results, when validation ran.
    pub health: Option<HealthReport>,
    /// Transfer summary, when files were synced.
    pub sync: Option<SyncReport>,
    /// Rendered undo commands of completed steps, newest first. Only filled
    /// when the run failed.
    pub rollback_hints: Vec<String>,
    /// Run log location, when persisted.
    pub log_path: Option<Utf8PathBuf>,
    /// First failure to persist the run log.
    pub log_error: Option<String>,
}

impl DeployReport {
    /// Classifies the run.
    #[must_use]
    pub fn outcome(&self) -> RunOutcome {
        match self.state {
            DeployState::Done if self.error.is_none() && self.warnings.is_empty() => {
                RunOutcome::Success
            }
            DeployState::Done if self.error.is_none() => RunOutcome::SuccessWithWarnings,
            DeployState::Failed(Some(phase)) => RunOutcome::Failed(FailedAt::Phase(phase)),
            state => RunOutcome::Failed(state.phase().map_or(FailedAt::Init, FailedAt::Phase)),
        }
    }

    /// Process exit status for the run.
    #[must_use]
    pub fn exit_status(&self) -> ExitStatus {
        if let Some(err) = &self.error {
            return ExitStatus::from(err);
        }
        if self.state != DeployState::Done {
            return ExitStatus::Internal;
        }
        if let Some(warning) = self
            .warnings
            .iter()
            .find(|warning| matches!(warning, DeployWarning::Proxy { .. }))
            .or_else(|| self.warnings.first())
        {
            return ExitStatus::from(warning);
        }
        if self.log_error.is_some() {
            return ExitStatus::Internal;
        }
        ExitStatus::Success
    }

    /// Steps that ended with `status`.
    pub fn steps_with(&self, status: StepStatus) -> impl Iterator<Item = &StepResult> {
        self.steps.iter().filter(move |step| step.status == status)
    }

    /// The single line printed when the run ends.
    #[must_use]
    pub fn summary_line(&self) -> String {
        let detail = match (&self.error, self.warnings.as_slice()) {
            (Some(err), _) => err.to_string(),
            (None, []) => format!("{} deployed", self.app),
            (None, warnings) => warnings
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        };
        finish_line(
            self.outcome(),
            &detail,
            self.log_path.as_ref(),
            self.log_error.as_deref(),
        )
    }
}

/// A cleanup step that did not succeed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CleanupFailure {
    /// Failing step.
    pub step_id: String,
    /// Failure description.
    pub message: String,
}

/// Result of [`super::DeploymentOrchestrator::cleanup`].
#[derive(Clone, Debug)]
pub struct CleanupReport {
    /// Identifier recorded in the run log.
    pub run_id: Uuid,
    /// Application name.
    pub app: String,
    /// Terminal state of the machine.
    pub state: DeployState,
    /// Every attempted step, in order.
    pub steps: Vec<StepResult>,
    /// Steps that failed; the others were still attempted.
    pub failures: Vec<CleanupFailure>,
    /// Error that stopped cleanup early.
    pub error: Option<DeployError>,
    /// Run log location, when persisted.
    pub log_path: Option<Utf8PathBuf>,
    /// First failure to persist the run log.
    pub log_error: Option<String>,
}

impl CleanupReport {
    /// Classifies the run.
    #[must_use]
    pub fn outcome(&self) -> RunOutcome {
        if self.error.is_none() && self.failures.is_empty() {
            RunOutcome::Success
        } else {
            RunOutcome::Failed(FailedAt::Cleanup)
        }
    }

    /// Process exit status for the run.
    #[must_use]
    pub fn exit_status(&self) -> ExitStatus {
        match (&self.error, self.failures.is_empty(), &self.log_error) {
            (Some(err), _, _) => ExitStatus::from(err),
            (None, false, _) => ExitStatus::CleanupIncomplete,
            (None, true, Some(_)) => ExitStatus::Internal,
            (None, true, None) => ExitStatus::Success,
        }
    }

    /// The single line printed when the run ends.
    #[must_use]
    pub fn summary_line(&self) -> String {
        let detail = match &self.error {
            Some(err) => err.to_string(),
            None if self.failures.is_empty() => format!("{} removed", self.app),
            None => self
                .failures
                .iter()
                .map(|failure| format!("{}: {}", failure.step_id, failure.message))
                .collect::<Vec<_>>()
                .join("; "),
        };
        finish_line(
            self.outcome(),
            &detail,
            self.log_path.as_ref(),
            self.log_error.as_deref(),
        )
    }
}

fn finish_line(
    outcome: RunOutcome,
    detail: &str,
    log_path: Option<&Utf8PathBuf>,
    log_error: Option<&str>,
) -> String {
    let mut line = format!("{outcome}: {}", detail.replace('\n', " "));
    if let Some(path) = log_path {
        line.push_str(&format!(" (log: {path})"));
    }
    if let Some(err) = log_error {
        line.push_str(&format!(" [run log incomplete: {err}]"));
    }
    line
}
