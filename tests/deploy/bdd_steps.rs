//! BDD step definitions for deploy and cleanup runs.

use hoist::DeploymentOrchestrator;
use hoist::run_log::{RunLog, StepResult, StepStatus};
use hoist::test_support::{FakeHost, deploy_settings};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{DeployContext, DeployTestError, RunSummary, project_with};

fn status_name(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Success => "success",
        StepStatus::SkippedAlreadySatisfied => "skipped",
        StepStatus::Failed => "failed",
    }
}

fn statuses(steps: &[StepResult]) -> Vec<(String, String)> {
    steps
        .iter()
        .map(|step| (step.step_id.clone(), status_name(step.status).to_owned()))
        .collect()
}

fn orchestrator(
    deploy_context: &DeployContext,
    name: &str,
    port: u16,
) -> Result<DeploymentOrchestrator<FakeHost>, DeployTestError> {
    let project = deploy_context
        .project
        .as_ref()
        .ok_or_else(|| DeployTestError::Fixture(String::from("no project prepared")))?;
    let settings = deploy_settings(&project.root, name, port)
        .map_err(|err| DeployTestError::Fixture(err.to_string()))?;
    Ok(DeploymentOrchestrator::new(
        settings,
        deploy_context.host.clone(),
        RunLog::in_memory(),
    ))
}

fn last_run(deploy_context: &DeployContext) -> Result<&RunSummary, DeployTestError> {
    deploy_context
        .last_run
        .as_ref()
        .ok_or_else(|| DeployTestError::Assertion(String::from("no run recorded")))
}

#[given("a fresh Debian host")]
fn fresh_host(mut deploy_context: DeployContext) -> DeployContext {
    deploy_context.host = FakeHost::new();
    deploy_context
}

#[given("a provisioned host")]
fn provisioned_host(mut deploy_context: DeployContext) -> DeployContext {
    deploy_context.host = FakeHost::provisioned();
    deploy_context
}

#[given("rsync fails with exit code \"{code}\"")]
fn rsync_fails(mut deploy_context: DeployContext, code: i32) -> DeployContext {
    deploy_context.host = deploy_context.host.fail_on("--stats", code);
    deploy_context
}

#[given("remote commands containing \"{pattern}\" fail")]
fn remote_commands_fail(mut deploy_context: DeployContext, pattern: String) -> DeployContext {
    deploy_context.host = deploy_context.host.fail_on(&pattern, 1);
    deploy_context
}

#[given("a project with a \"{descriptor}\"")]
fn project_with_descriptor(
    mut deploy_context: DeployContext,
    descriptor: String,
) -> Result<DeployContext, DeployTestError> {
    deploy_context.project = Some(project_with(&[descriptor.as_str()])?);
    Ok(deploy_context)
}

#[given("an empty project")]
fn empty_project(mut deploy_context: DeployContext) -> Result<DeployContext, DeployTestError> {
    deploy_context.project = Some(project_with(&[])?);
    Ok(deploy_context)
}

#[when("I deploy \"{name}\" on port \"{port}\"")]
fn deploy(
    mut deploy_context: DeployContext,
    name: String,
    port: u16,
) -> Result<DeployContext, DeployTestError> {
    let runtime = Runtime::new().map_err(|err| DeployTestError::Fixture(err.to_string()))?;
    let orchestrator = orchestrator(&deploy_context, &name, port)?;
    let report = runtime.block_on(orchestrator.deploy());
    deploy_context.last_run = Some(RunSummary {
        state: report.state.to_string(),
        exit_code: report.exit_status().code(),
        healthy: report.health.is_some_and(|health| health.is_healthy()),
        step_statuses: statuses(&report.steps),
    });
    Ok(deploy_context)
}

#[when("I clean up \"{name}\"")]
fn clean_up(
    mut deploy_context: DeployContext,
    name: String,
) -> Result<DeployContext, DeployTestError> {
    let runtime = Runtime::new().map_err(|err| DeployTestError::Fixture(err.to_string()))?;
    let orchestrator = orchestrator(&deploy_context, &name, 0)?;
    let report = runtime.block_on(orchestrator.cleanup());
    deploy_context.last_run = Some(RunSummary {
        state: report.state.to_string(),
        exit_code: report.exit_status().code(),
        healthy: false,
        step_statuses: statuses(&report.steps),
    });
    Ok(deploy_context)
}

#[then("the run ends in state \"{state}\"")]
fn run_ends_in_state(deploy_context: &DeployContext, state: String) -> Result<(), DeployTestError> {
    let run = last_run(deploy_context)?;
    if run.state == state {
        Ok(())
    } else {
        Err(DeployTestError::Assertion(format!(
            "expected state {state}, got {}",
            run.state
        )))
    }
}

#[then("the exit code is \"{code}\"")]
fn exit_code_is(deploy_context: &DeployContext, code: i32) -> Result<(), DeployTestError> {
    let run = last_run(deploy_context)?;
    if run.exit_code == code {
        Ok(())
    } else {
        Err(DeployTestError::Assertion(format!(
            "expected exit code {code}, got {} after steps {:?}",
            run.exit_code, run.step_statuses
        )))
    }
}

#[then("container \"{name}\" is running on port \"{port}\"")]
fn container_running(
    deploy_context: &DeployContext,
    name: String,
    port: u16,
) -> Result<(), DeployTestError> {
    let state = deploy_context.host.state();
    let running = state.containers.get(&name).copied().unwrap_or(false);
    let published = state.published_ports.get(&name).copied();
    if running && published == Some(port) {
        Ok(())
    } else {
        Err(DeployTestError::Assertion(format!(
            "container {name}: running={running}, published={published:?}"
        )))
    }
}

#[then("every health check passed")]
fn every_health_check_passed(deploy_context: &DeployContext) -> Result<(), DeployTestError> {
    if last_run(deploy_context)?.healthy {
        Ok(())
    } else {
        Err(DeployTestError::Assertion(String::from(
            "expected a healthy deployment",
        )))
    }
}

#[then("no packages were installed")]
fn no_packages_installed(deploy_context: &DeployContext) -> Result<(), DeployTestError> {
    let installed = deploy_context.host.state().installed_packages;
    if installed.is_empty() {
        Ok(())
    } else {
        Err(DeployTestError::Assertion(format!(
            "unexpected installs: {installed:?}"
        )))
    }
}

#[then("exactly \"{count}\" container exists")]
fn container_count(deploy_context: &DeployContext, count: usize) -> Result<(), DeployTestError> {
    let actual = deploy_context.host.state().containers.len();
    if actual == count {
        Ok(())
    } else {
        Err(DeployTestError::Assertion(format!(
            "expected {count} containers, found {actual}"
        )))
    }
}

#[then("step \"{step_id}\" finished as \"{status}\"")]
fn step_finished_as(
    deploy_context: &DeployContext,
    step_id: String,
    status: String,
) -> Result<(), DeployTestError> {
    let run = last_run(deploy_context)?;
    let found = run
        .step_statuses
        .iter()
        .find(|(id, _)| *id == step_id)
        .map(|(_, recorded)| recorded.as_str());
    if found == Some(status.as_str()) {
        Ok(())
    } else {
        Err(DeployTestError::Assertion(format!(
            "expected {step_id} to finish as {status}, got {found:?}"
        )))
    }
}

#[then("compose project \"{name}\" is up")]
fn compose_project_up(deploy_context: &DeployContext, name: String) -> Result<(), DeployTestError> {
    if deploy_context.host.state().compose_projects.contains(&name) {
        Ok(())
    } else {
        Err(DeployTestError::Assertion(format!(
            "compose project {name} is not up"
        )))
    }
}

#[then("no remote command was issued")]
fn no_remote_command(deploy_context: &DeployContext) -> Result<(), DeployTestError> {
    let commands = deploy_context.host.remote_commands();
    if commands.is_empty() {
        Ok(())
    } else {
        Err(DeployTestError::Assertion(format!(
            "unexpected remote commands: {commands:?}"
        )))
    }
}

#[then("no remote command contains \"{needle}\"")]
fn no_remote_command_contains(
    deploy_context: &DeployContext,
    needle: String,
) -> Result<(), DeployTestError> {
    let matching = deploy_context.host.commands_containing(&needle);
    if matching.is_empty() {
        Ok(())
    } else {
        Err(DeployTestError::Assertion(format!(
            "unexpected commands: {matching:?}"
        )))
    }
}
