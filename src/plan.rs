//! Immutable deployment plan: ordered, typed steps grouped by phase.

use std::collections::HashSet;
use std::fmt;

use camino::Utf8PathBuf;
use serde::Serialize;
use thiserror::Error;

use crate::executor::RemoteCommand;

/// Deployment phases in execution order.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum Phase {
    /// Install and enable the container runtime, compose tool and proxy.
    Provisioning,
    /// Create the remote directory and transfer files.
    Syncing,
    /// Replace, build and start the application.
    Deploying,
    /// Install the reverse proxy site.
    ProxyConfiguring,
    /// Run post-deploy health checks.
    Validating,
}

impl Phase {
    /// Every phase, in order.
    pub const ALL: [Self; 5] = [
        Self::Provisioning,
        Self::Syncing,
        Self::Deploying,
        Self::ProxyConfiguring,
        Self::Validating,
    ];

    /// Whether a failed step in this phase aborts the run.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::Provisioning | Self::Syncing | Self::Deploying)
    }

    /// Name used in summaries and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Provisioning => "Provisioning",
            Self::Syncing => "Syncing",
            Self::Deploying => "Deploying",
            Self::ProxyConfiguring => "ProxyConfiguring",
            Self::Validating => "Validating",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a step does.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StepAction {
    /// Runs a command on the host, skipped when `satisfied_when` exits zero.
    Remote {
        /// Command producing the step's effect.
        command: RemoteCommand,
        /// Probe reporting whether the effect is already present.
        satisfied_when: Option<RemoteCommand>,
    },
    /// Transfers the local tree.
    Sync {
        /// Local project directory.
        local: Utf8PathBuf,
        /// Remote application directory.
        remote: String,
    },
    /// Renders, validates and activates the proxy site.
    ConfigureProxy,
    /// Runs the health checks.
    ValidateHealth,
}

/// One unit of work in a [`DeploymentPlan`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Step {
    /// Identifier, unique within the plan.
    pub id: String,
    /// Phase the step belongs to.
    pub phase: Phase,
    /// Identifies the effect the step produces.
    pub idempotency_key: String,
    /// Work to perform.
    pub action: StepAction,
    /// Command that would undo the step, offered as a recovery hint.
    pub rollback: Option<RemoteCommand>,
    /// Whether one automatic retry is allowed.
    pub retryable: bool,
}

impl Step {
    /// Builds a step with the given action; the idempotency key defaults to
    /// the id.
    #[must_use]
    pub fn new(id: impl Into<String>, phase: Phase, action: StepAction) -> Self {
        let id = id.into();
        Self {
            idempotency_key: id.clone(),
            id,
            phase,
            action,
            rollback: None,
            retryable: true,
        }
    }

    /// Remote command step.
    #[must_use]
    pub fn remote(id: impl Into<String>, phase: Phase, command: impl Into<RemoteCommand>) -> Self {
        Self::new(
            id,
            phase,
            StepAction::Remote {
                command: command.into(),
                satisfied_when: None,
            },
        )
    }

    /// Attaches a precondition probe to a remote step.
    #[must_use]
    pub fn satisfied_when(mut self, probe: impl Into<RemoteCommand>) -> Self {
        if let StepAction::Remote { satisfied_when, .. } = &mut self.action {
            *satisfied_when = Some(probe.into());
        }
        self
    }

    /// Sets the idempotency key.
    #[must_use]
    pub fn keyed(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = key.into();
        self
    }

    /// Attaches a rollback hint.
    #[must_use]
    pub fn rollback(mut self, command: impl Into<RemoteCommand>) -> Self {
        self.rollback = Some(command.into());
        self
    }

    /// Disables the automatic retry.
    #[must_use]
    pub const fn without_retry(mut self) -> Self {
        self.retryable = false;
        self
    }
}

/// Rejections raised while assembling a plan.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PlanError {
    /// Raised when a step belongs to an earlier phase than its predecessor.
    #[error("step {step} in phase {phase} follows a step in phase {previous}")]
    PhaseRegression {
        /// Offending step id.
        step: String,
        /// Its phase.
        phase: Phase,
        /// Phase of the preceding step.
        previous: Phase,
    },
    /// Raised when two steps share an id.
    #[error("duplicate step id {id}")]
    DuplicateStep {
        /// Repeated id.
        id: String,
    },
}

/// Ordered steps built once per run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeploymentPlan {
    steps: Vec<Step>,
}

impl DeploymentPlan {
    /// Validates ordering and uniqueness.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError`] when phases go backwards or ids repeat.
    pub fn new(steps: Vec<Step>) -> Result<Self, PlanError> {
        let mut seen = HashSet::new();
        let mut previous: Option<Phase> = None;
        for step in &steps {
            if !seen.insert(step.id.as_str()) {
                return Err(PlanError::DuplicateStep {
                    id: step.id.clone(),
                });
            }
            if let Some(prior) = previous
                && step.phase < prior
            {
                return Err(PlanError::PhaseRegression {
                    step: step.id.clone(),
                    phase: step.phase,
                    previous: prior,
                });
            }
            previous = Some(step.phase);
        }
        Ok(Self { steps })
    }

    /// All steps in order.
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Steps of one phase, in order.
    pub fn phase_steps(&self, phase: Phase) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(move |step| step.phase == phase)
    }

    /// Number of steps in `phase`.
    #[must_use]
    pub fn action_count(&self, phase: Phase) -> usize {
        self.phase_steps(phase).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Exec;
    use rstest::rstest;

    fn step(id: &str, phase: Phase) -> Step {
        Step::remote(id, phase, Exec::new("true"))
    }

    #[rstest]
    fn accepts_monotonic_phases() {
        let plan = DeploymentPlan::new(vec![
            step("a", Phase::Provisioning),
            step("b", Phase::Provisioning),
            step("c", Phase::Deploying),
            step("d", Phase::Validating),
        ])
        .expect("ordered plan");

        assert_eq!(plan.action_count(Phase::Provisioning), 2);
        assert_eq!(plan.action_count(Phase::Syncing), 0);
    }

    #[rstest]
    fn rejects_phase_regression() {
        let err = DeploymentPlan::new(vec![step("a", Phase::Deploying), step("b", Phase::Syncing)])
            .expect_err("regression must fail");

        assert_eq!(
            err,
            PlanError::PhaseRegression {
                step: String::from("b"),
                phase: Phase::Syncing,
                previous: Phase::Deploying,
            }
        );
    }

    #[rstest]
    fn rejects_duplicate_ids() {
        let err = DeploymentPlan::new(vec![step("a", Phase::Syncing), step("a", Phase::Deploying)])
            .expect_err("duplicate must fail");

        assert_eq!(err, PlanError::DuplicateStep { id: String::from("a") });
    }

    #[rstest]
    fn builder_attaches_probe_rollback_and_key() {
        let built = step("deploy.run", Phase::Deploying)
            .satisfied_when(Exec::new("false"))
            .rollback(Exec::new("docker").args(["rm", "-f", "demo"]))
            .keyed("container:demo")
            .without_retry();

        let StepAction::Remote { satisfied_when, .. } = &built.action else {
            panic!("expected remote action");
        };
        assert!(satisfied_when.is_some());
        assert!(built.rollback.is_some());
        assert_eq!(built.idempotency_key, "container:demo");
        assert!(!built.retryable);
    }

    #[rstest]
    #[case(Phase::Provisioning, true)]
    #[case(Phase::Syncing, true)]
    #[case(Phase::Deploying, true)]
    #[case(Phase::ProxyConfiguring, false)]
    #[case(Phase::Validating, false)]
    fn fatal_phases(#[case] phase: Phase, #[case] fatal: bool) {
        assert_eq!(phase.is_fatal(), fatal);
    }
}
