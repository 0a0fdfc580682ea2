//! Deployment state machine driving one target host.
//!
//! A run checks everything it can locally first (source checkout, strategy
//! selection), confirms the host answers, probes its capabilities, builds an
//! immutable [`crate::plan::DeploymentPlan`], and then executes the plan phase
//! by phase. Every step re-checks its own precondition, is retried at most
//! once, and ends in exactly one `StepFinished` record of the run log.
//!
//! Failures in Provisioning, Syncing and Deploying abort the run and leave the
//! host as it is; the report carries rollback hints for manual recovery.
//! Failures in ProxyConfiguring and Validating become warnings. A lost
//! connection is fatal everywhere.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{DeploySettings, Operation};
use crate::executor::{
    CommandRunner, ConnectionError, RemoteCommand, RemoteExecutor, SshExecutor,
};
use crate::health::{HealthReport, HealthValidator};
use crate::plan::{Phase, Step, StepAction};
use crate::provision::{self, PackageFamily, ProvisionError, ProvisionPlan, ProvisioningPlanner};
use crate::proxy::{ProxyError, ProxyOutcome, ReverseProxyConfigurator};
use crate::run_log::{RunLog, RunLogRecord, StepResult, StepStatus, output_tail};
use crate::source::SourceFetcher;
use crate::strategy::{self, Strategy};
use crate::sync::{FileSynchronizer, SyncError, SyncReport};

mod error;
mod report;
mod state;
mod steps;

pub use error::{DeployError, DeployWarning, ExitStatus, StepFailure};
pub use report::{CleanupFailure, CleanupReport, DeployReport, FailedAt, RunOutcome};
pub use state::{DeployEvent, DeployState, DeployStateMachine, InvalidTransition};
pub use steps::{cleanup_steps, deploy_plan, deploy_steps, image_tag, no_named_container};

/// Shared cancellation request, set from a signal handler.
///
/// The orchestrator checks it before issuing each step. In-flight commands
/// are never interrupted and nothing is undone.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Captured details of one attempt.
#[derive(Clone, Debug, Default)]
struct AttemptRecord {
    exit_code: Option<i32>,
    timed_out: bool,
    output: String,
}

impl AttemptRecord {
    fn note(text: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            timed_out: false,
            output: text.into(),
        }
    }
}

enum Attempt {
    Skipped,
    Succeeded(AttemptRecord),
    Failed(AttemptRecord, StepFailure),
}

impl Attempt {
    fn failed(failure: StepFailure) -> Self {
        let record = AttemptRecord {
            exit_code: failure.exit_code(),
            timed_out: failure.timed_out(),
            output: failure.to_string(),
        };
        Self::Failed(record, failure)
    }
}

/// Mutable bookkeeping of one run.
#[derive(Debug, Default)]
struct RunState {
    machine: DeployStateMachine,
    strategy: Option<Strategy>,
    provision: Option<ProvisionPlan>,
    steps: Vec<StepResult>,
    warnings: Vec<DeployWarning>,
    rollbacks: Vec<String>,
    failed_keys: HashSet<String>,
    sync: Option<SyncReport>,
    health: Option<HealthReport>,
    proxy: ReverseProxyConfigurator,
}

impl RunState {
    fn advance(&mut self, event: DeployEvent) -> Result<(), DeployError> {
        let next = self.machine.process(event)?;
        info!(state = %next, "state changed");
        Ok(())
    }

    fn abort(&mut self) {
        if let Err(err) = self.machine.process(DeployEvent::Abort) {
            warn!(error = %err, "run already finished");
        }
    }

    fn record(
        &mut self,
        log: &RunLog,
        step: &Step,
        status: StepStatus,
        attempt: AttemptRecord,
        started: Instant,
        attempts: u32,
    ) {
        let result = StepResult {
            step_id: step.id.clone(),
            status,
            exit_code: attempt.exit_code,
            timed_out: attempt.timed_out,
            output: output_tail(&attempt.output),
            duration: started.elapsed(),
            attempts,
        };
        log.step_finished(&result);
        debug!(step = %step.id, status = ?status, attempts, "step finished");
        self.steps.push(result);
    }
}

/// Drives deploy and cleanup runs against the configured target.
#[derive(Debug)]
pub struct DeploymentOrchestrator<R: CommandRunner + Clone> {
    settings: DeploySettings,
    runner: R,
    log: RunLog,
    health: HealthValidator,
    cancel: CancelFlag,
}

impl<R: CommandRunner + Clone> DeploymentOrchestrator<R> {
    /// Creates an orchestrator spawning `ssh`, `rsync` and `git` through
    /// `runner` and journaling to `log`.
    #[must_use]
    pub fn new(settings: DeploySettings, runner: R, log: RunLog) -> Self {
        Self {
            health: HealthValidator::new(settings.settle_delay),
            settings,
            runner,
            log,
            cancel: CancelFlag::default(),
        }
    }

    /// Uses `flag` to receive cancellation requests.
    #[must_use]
    pub fn with_cancel_flag(mut self, flag: CancelFlag) -> Self {
        self.cancel = flag;
        self
    }

    /// Flag observed before each step.
    #[must_use]
    pub const fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Settings of this run.
    #[must_use]
    pub const fn settings(&self) -> &DeploySettings {
        &self.settings
    }

    fn executor(&self) -> SshExecutor<R> {
        SshExecutor::new(
            self.settings.transport.clone(),
            self.runner.clone(),
            self.log.clone(),
        )
        .with_sudo(self.settings.use_sudo)
        .with_command_timeout(self.settings.command_timeout)
    }

    fn proxy_for(&self, family: PackageFamily) -> ReverseProxyConfigurator {
        let proxy = ReverseProxyConfigurator::new(&self.settings.proxy, family);
        debug!(?family, layout = ?proxy.layout(), "nginx site layout selected");
        proxy
    }

    fn synchronizer(&self) -> FileSynchronizer<R> {
        FileSynchronizer::new(
            self.settings.transport.clone(),
            self.settings.sync.clone(),
            self.runner.clone(),
            self.log.clone(),
        )
    }

    fn start(&self, operation: Operation) -> Uuid {
        let run_id = Uuid::new_v4();
        info!(
            %run_id,
            operation = operation.as_str(),
            app = %self.settings.app.name,
            host = %self.settings.target.host,
            "run started"
        );
        self.log.append(RunLogRecord::RunStarted {
            run_id,
            operation: operation.as_str().to_owned(),
            app: self.settings.app.name.to_string(),
            host: self.settings.target.host.clone(),
        });
        run_id
    }

    fn finish(&self, summary: String) {
        self.log.append(RunLogRecord::RunFinished { summary });
    }

    /// Deploys the application.
    ///
    /// Never fails as such: every outcome, including fatal errors, is
    /// described by the returned report.
    pub async fn deploy(&self) -> DeployReport {
        let run_id = self.start(Operation::Deploy);
        let executor = self.executor();
        let mut run = RunState::default();

        let error = match self.drive_deploy(&executor, &mut run).await {
            Ok(()) => None,
            Err(err) => {
                error!(error = %err, state = %run.machine.state(), "deploy failed");
                run.abort();
                Some(err)
            }
        };

        let rollback_hints = if error.is_some() {
            run.rollbacks.iter().rev().cloned().collect()
        } else {
            Vec::new()
        };
        let report = DeployReport {
            run_id,
            app: self.settings.app.name.to_string(),
            state: run.machine.state(),
            strategy: run.strategy,
            provision: run.provision,
            steps: run.steps,
            warnings: run.warnings,
            error,
            health: run.health,
            sync: run.sync,
            rollback_hints,
            log_path: self.log.path().map(ToOwned::to_owned),
            log_error: self.log.write_error(),
        };
        self.finish(report.summary_line());
        report
    }

    async fn drive_deploy(
        &self,
        executor: &SshExecutor<R>,
        run: &mut RunState,
    ) -> Result<(), DeployError> {
        let strategy = self.prepare_source()?;
        info!(%strategy, "deployment strategy selected");
        run.strategy = Some(strategy);

        executor.check_connectivity()?;
        run.advance(DeployEvent::Begin)?;

        let provision = ProvisioningPlanner.plan(executor, strategy)?;
        info!(
            family = ?provision.family,
            actions = provision.actions.len(),
            "provisioning planned"
        );
        run.proxy = self.proxy_for(provision.family);
        let plan = steps::deploy_plan(&self.settings, strategy, &provision, &run.proxy)?;
        run.provision = Some(provision);

        let synchronizer = self.synchronizer();
        for phase in Phase::ALL {
            for step in plan.phase_steps(phase) {
                self.ensure_not_cancelled(step)?;
                let Some(failure) = self.run_step(executor, &synchronizer, step, run).await?
                else {
                    continue;
                };
                if phase.is_fatal() {
                    return Err(DeployError::in_phase(phase, failure));
                }
                let warning = failure.into_warning(&step.id);
                warn!(step = %step.id, %phase, %warning, "skipping the rest of the phase");
                run.warnings.push(warning);
                break;
            }
            run.advance(DeployEvent::PhaseComplete)?;
        }
        Ok(())
    }

    fn prepare_source(&self) -> Result<Strategy, DeployError> {
        let app = &self.settings.app;
        if let (Some(source), Some(checkout)) = (&app.source, &self.settings.checkout_dir) {
            let token = std::env::var(&source.token_env).ok();
            SourceFetcher::new(self.settings.git_bin.clone(), self.runner.clone()).fetch(
                source,
                checkout,
                token.as_deref(),
            )?;
        }
        let strategy = strategy::select(&app.project_dir)?;
        if strategy == Strategy::Compose {
            app.name.check_compose_project()?;
        }
        Ok(strategy)
    }

    /// Removes everything a deploy of the application created.
    ///
    /// Every step is attempted even when an earlier one failed; failures are
    /// collected in the report. Losing the connection stops the sequence.
    pub async fn cleanup(&self) -> CleanupReport {
        let run_id = self.start(Operation::Cleanup);
        let executor = self.executor();
        let mut run = RunState::default();
        let mut failures = Vec::new();

        let error = self
            .drive_cleanup(&executor, &mut run, &mut failures)
            .await
            .err();
        if let Some(err) = &error {
            error!(error = %err, "cleanup stopped");
        }
        if error.is_none() && failures.is_empty() {
            if let Err(err) = run.advance(DeployEvent::CleanupFinished) {
                warn!(error = %err, "cleanup state not recorded");
            }
        } else {
            run.abort();
        }

        let report = CleanupReport {
            run_id,
            app: self.settings.app.name.to_string(),
            state: run.machine.state(),
            steps: run.steps,
            failures,
            error,
            log_path: self.log.path().map(ToOwned::to_owned),
            log_error: self.log.write_error(),
        };
        self.finish(report.summary_line());
        report
    }

    async fn drive_cleanup(
        &self,
        executor: &SshExecutor<R>,
        run: &mut RunState,
        failures: &mut Vec<CleanupFailure>,
    ) -> Result<(), DeployError> {
        executor.check_connectivity()?;
        let family = match provision::host_family(executor, "cleanup.os_release") {
            Ok(family) => family,
            Err(ProvisionError::Connection(err)) => return Err(err.into()),
            Err(err) => {
                warn!(error = %err, "package family unknown; assuming the Debian nginx layout");
                PackageFamily::Debian
            }
        };
        run.proxy = self.proxy_for(family);
        let synchronizer = self.synchronizer();
        for step in steps::cleanup_steps(&self.settings, &run.proxy) {
            self.ensure_not_cancelled(&step)?;
            if let Some(failure) = self.run_step(executor, &synchronizer, &step, run).await? {
                warn!(step = %step.id, error = %failure, "cleanup step failed; continuing");
                failures.push(CleanupFailure {
                    step_id: step.id.clone(),
                    message: failure.to_string(),
                });
            }
        }
        Ok(())
    }

    fn ensure_not_cancelled(&self, step: &Step) -> Result<(), DeployError> {
        if self.cancel.is_cancelled() {
            warn!(step = %step.id, "cancelled; no further steps will be issued");
            return Err(DeployError::Interrupted {
                step: step.id.clone(),
            });
        }
        Ok(())
    }

    /// Runs `step` with at most one retry and records its result.
    ///
    /// Returns the failure of the final attempt, if any. A connection error
    /// is recorded against the step and returned as an error.
    async fn run_step(
        &self,
        executor: &SshExecutor<R>,
        synchronizer: &FileSynchronizer<R>,
        step: &Step,
        run: &mut RunState,
    ) -> Result<Option<StepFailure>, DeployError> {
        let started = Instant::now();
        let may_retry = step.retryable && !run.failed_keys.contains(&step.idempotency_key);
        let mut attempts = 0_u32;
        debug!(step = %step.id, phase = %step.phase, "starting step");

        loop {
            attempts += 1;
            let attempt = match self.attempt(executor, synchronizer, step, run).await {
                Ok(attempt) => attempt,
                Err(err) => {
                    let record = AttemptRecord::note(err.to_string());
                    run.record(&self.log, step, StepStatus::Failed, record, started, attempts);
                    return Err(err.into());
                }
            };

            match attempt {
                Attempt::Failed(_, failure) if may_retry && attempts == 1 => {
                    warn!(step = %step.id, error = %failure, "step failed; retrying once");
                    pause(self.settings.retry_delay).await;
                }
                Attempt::Skipped => {
                    let record = AttemptRecord::note("already satisfied");
                    run.record(
                        &self.log,
                        step,
                        StepStatus::SkippedAlreadySatisfied,
                        record,
                        started,
                        attempts,
                    );
                    return Ok(None);
                }
                Attempt::Succeeded(record) => {
                    run.record(&self.log, step, StepStatus::Success, record, started, attempts);
                    if let Some(rollback) = &step.rollback {
                        run.rollbacks.push(executor.render(rollback));
                    }
                    return Ok(None);
                }
                Attempt::Failed(record, failure) => {
                    run.record(&self.log, step, StepStatus::Failed, record, started, attempts);
                    run.failed_keys.insert(step.idempotency_key.clone());
                    return Ok(Some(failure));
                }
            }
        }
    }

    async fn attempt(
        &self,
        executor: &SshExecutor<R>,
        synchronizer: &FileSynchronizer<R>,
        step: &Step,
        run: &mut RunState,
    ) -> Result<Attempt, ConnectionError> {
        let app = &self.settings.app;
        match &step.action {
            StepAction::Remote {
                command,
                satisfied_when,
            } => remote_attempt(executor, &step.id, command, satisfied_when.as_ref()),
            StepAction::Sync { local, remote } => {
                match synchronizer.sync(
                    executor,
                    &step.id,
                    local,
                    remote,
                    &self.settings.extra_excludes,
                ) {
                    Ok(report) => {
                        run.sync = Some(report);
                        Ok(Attempt::Succeeded(AttemptRecord::note(format!(
                            "{} files present, {} bytes transferred",
                            report.files_present, report.bytes_transferred
                        ))))
                    }
                    Err(SyncError::Connection(err)) => Err(err),
                    Err(err) => Ok(Attempt::failed(StepFailure::Transfer(err))),
                }
            }
            StepAction::ConfigureProxy => {
                match run
                    .proxy
                    .configure(executor, &step.id, &app.name, app.internal_port)
                {
                    Ok(ProxyOutcome::AlreadyCurrent) => Ok(Attempt::Skipped),
                    Ok(ProxyOutcome::Installed) => {
                        Ok(Attempt::Succeeded(AttemptRecord::note("site installed")))
                    }
                    Err(ProxyError::Connection(err)) => Err(err),
                    Err(err) => Ok(Attempt::failed(StepFailure::Proxy(err))),
                }
            }
            StepAction::ValidateHealth => {
                let strategy = run.strategy.unwrap_or(Strategy::SingleContainer);
                let report = self
                    .health
                    .validate(executor, &app.name, app.internal_port, strategy)
                    .await?;
                run.health = Some(report);
                if report.is_healthy() {
                    return Ok(Attempt::Succeeded(AttemptRecord::note("all checks passed")));
                }
                Ok(Attempt::failed(StepFailure::Unhealthy {
                    failed_checks: report
                        .failed_checks()
                        .into_iter()
                        .map(str::to_owned)
                        .collect(),
                }))
            }
        }
    }
}

fn remote_attempt<E: RemoteExecutor>(
    executor: &E,
    step_id: &str,
    command: &RemoteCommand,
    satisfied_when: Option<&RemoteCommand>,
) -> Result<Attempt, ConnectionError> {
    if let Some(probe) = satisfied_when
        && executor.execute(step_id, probe)?.is_success()
    {
        debug!(step = step_id, "precondition already satisfied");
        return Ok(Attempt::Skipped);
    }
    let outcome = executor.execute(step_id, command)?;
    let record = AttemptRecord {
        exit_code: outcome.exit_code,
        timed_out: outcome.timed_out,
        output: outcome.combined_output(),
    };
    match outcome.failure() {
        None => Ok(Attempt::Succeeded(record)),
        Some(source) => Ok(Attempt::Failed(
            record,
            StepFailure::Command {
                step_id: step_id.to_owned(),
                source,
            },
        )),
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
