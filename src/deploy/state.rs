//! Run state machine.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::plan::Phase;

/// Where a run currently stands.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum DeployState {
    /// Local checks and connectivity, before any remote change.
    Init,
    /// Installing and enabling prerequisites.
    Provisioning,
    /// Transferring project files.
    Syncing,
    /// Replacing, building and starting the application.
    Deploying,
    /// Installing the proxy site.
    ProxyConfiguring,
    /// Running health checks.
    Validating,
    /// Deploy finished, possibly with warnings.
    Done,
    /// The run stopped; the phase is absent when it stopped in `Init`.
    Failed(Option<Phase>),
    /// Cleanup finished.
    CleanedUp,
}

impl DeployState {
    /// Phase this state executes, if any.
    #[must_use]
    pub const fn phase(self) -> Option<Phase> {
        match self {
            Self::Provisioning => Some(Phase::Provisioning),
            Self::Syncing => Some(Phase::Syncing),
            Self::Deploying => Some(Phase::Deploying),
            Self::ProxyConfiguring => Some(Phase::ProxyConfiguring),
            Self::Validating => Some(Phase::Validating),
            Self::Init | Self::Done | Self::Failed(_) | Self::CleanedUp => None,
        }
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed(_) | Self::CleanedUp)
    }
}

impl fmt::Display for DeployState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => f.write_str("Init"),
            Self::Done => f.write_str("Done"),
            Self::CleanedUp => f.write_str("CleanedUp"),
            Self::Failed(None) => f.write_str("Failed(Init)"),
            Self::Failed(Some(phase)) => write!(f, "Failed({phase})"),
            Self::Provisioning
            | Self::Syncing
            | Self::Deploying
            | Self::ProxyConfiguring
            | Self::Validating => {
                let phase = self.phase().map_or("", Phase::as_str);
                f.write_str(phase)
            }
        }
    }
}

/// Inputs driving the machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeployEvent {
    /// Local checks passed and the host answered.
    Begin,
    /// Every step of the current phase succeeded, was skipped, or was
    /// downgraded to a warning.
    PhaseComplete,
    /// A fatal error stopped the run.
    Abort,
    /// The cleanup path finished.
    CleanupFinished,
}

/// Raised for a transition the machine does not allow.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("invalid transition: {from} on {event:?}")]
pub struct InvalidTransition {
    /// State the event arrived in.
    pub from: DeployState,
    /// Rejected event.
    pub event: DeployEvent,
}

/// Tracks the state of one run.
#[derive(Clone, Debug)]
pub struct DeployStateMachine {
    state: DeployState,
    history: Vec<DeployState>,
}

impl Default for DeployStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl DeployStateMachine {
    /// Machine in [`DeployState::Init`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: DeployState::Init,
            history: vec![DeployState::Init],
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> DeployState {
        self.state
    }

    /// Every state visited, in order.
    #[must_use]
    pub fn history(&self) -> &[DeployState] {
        &self.history
    }

    /// Applies `event`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] when `event` is not allowed in the
    /// current state; the state is left unchanged.
    pub fn process(&mut self, event: DeployEvent) -> Result<DeployState, InvalidTransition> {
        let next = match (self.state, event) {
            (DeployState::Init, DeployEvent::Begin) => DeployState::Provisioning,
            (DeployState::Init, DeployEvent::CleanupFinished) => DeployState::CleanedUp,
            (DeployState::Provisioning, DeployEvent::PhaseComplete) => DeployState::Syncing,
            (DeployState::Syncing, DeployEvent::PhaseComplete) => DeployState::Deploying,
            (DeployState::Deploying, DeployEvent::PhaseComplete) => DeployState::ProxyConfiguring,
            (DeployState::ProxyConfiguring, DeployEvent::PhaseComplete) => DeployState::Validating,
            (DeployState::Validating, DeployEvent::PhaseComplete) => DeployState::Done,
            (state, DeployEvent::Abort) if !state.is_terminal() => DeployState::Failed(state.phase()),
            (from, rejected) => {
                return Err(InvalidTransition {
                    from,
                    event: rejected,
                });
            }
        };
        self.state = next;
        self.history.push(next);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn walks_every_phase_to_done() {
        let mut machine = DeployStateMachine::new();
        machine.process(DeployEvent::Begin).expect("begin");
        for _ in Phase::ALL {
            machine.process(DeployEvent::PhaseComplete).expect("advance");
        }

        assert_eq!(machine.state(), DeployState::Done);
        assert_eq!(
            machine.history(),
            &[
                DeployState::Init,
                DeployState::Provisioning,
                DeployState::Syncing,
                DeployState::Deploying,
                DeployState::ProxyConfiguring,
                DeployState::Validating,
                DeployState::Done,
            ]
        );
    }

    #[rstest]
    fn abort_records_phase() {
        let mut machine = DeployStateMachine::new();
        machine.process(DeployEvent::Begin).expect("begin");
        machine.process(DeployEvent::PhaseComplete).expect("advance");

        let state = machine.process(DeployEvent::Abort).expect("abort");

        assert_eq!(state, DeployState::Failed(Some(Phase::Syncing)));
        assert_eq!(state.to_string(), "Failed(Syncing)");
    }

    #[rstest]
    fn abort_in_init_has_no_phase() {
        let mut machine = DeployStateMachine::new();
        assert_eq!(
            machine.process(DeployEvent::Abort),
            Ok(DeployState::Failed(None))
        );
    }

    #[rstest]
    #[case(DeployEvent::Begin)]
    #[case(DeployEvent::CleanupFinished)]
    fn rejects_events_outside_their_state(#[case] event: DeployEvent) {
        let mut machine = DeployStateMachine::new();
        machine.process(DeployEvent::Begin).expect("begin");

        let err = machine.process(event).expect_err("transition is invalid");

        assert_eq!(err.from, DeployState::Provisioning);
        assert_eq!(machine.state(), DeployState::Provisioning);
    }

    #[rstest]
    fn terminal_states_reject_events() {
        let mut machine = DeployStateMachine::new();
        machine
            .process(DeployEvent::CleanupFinished)
            .expect("cleanup from init");

        assert!(machine.process(DeployEvent::Abort).is_err());
        assert!(machine.process(DeployEvent::Begin).is_err());
    }
}
