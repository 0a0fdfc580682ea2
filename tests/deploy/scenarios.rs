use rstest_bdd_macros::scenario;

use super::test_helpers::{DeployContext, deploy_context};

#[scenario(
    path = "tests/features/deploy.feature",
    name = "Deploy a Dockerfile project to a fresh host"
)]
fn scenario_fresh_host(deploy_context: DeployContext) {
    let _ = deploy_context;
}

#[scenario(
    path = "tests/features/deploy.feature",
    name = "Redeploy replaces the running instance"
)]
fn scenario_redeploy(deploy_context: DeployContext) {
    let _ = deploy_context;
}

#[scenario(path = "tests/features/deploy.feature", name = "Deploy a compose project")]
fn scenario_compose(deploy_context: DeployContext) {
    let _ = deploy_context;
}

#[scenario(
    path = "tests/features/deploy.feature",
    name = "Refuse a project without a deployment descriptor"
)]
fn scenario_missing_descriptor(deploy_context: DeployContext) {
    let _ = deploy_context;
}

#[scenario(
    path = "tests/features/deploy.feature",
    name = "Halt when file transfer fails"
)]
fn scenario_sync_failure(deploy_context: DeployContext) {
    let _ = deploy_context;
}

#[scenario(
    path = "tests/features/deploy.feature",
    name = "Keep the application running when the proxy is rejected"
)]
fn scenario_proxy_rejected(deploy_context: DeployContext) {
    let _ = deploy_context;
}

#[scenario(
    path = "tests/features/deploy.feature",
    name = "Clean up a deployed application"
)]
fn scenario_cleanup(deploy_context: DeployContext) {
    let _ = deploy_context;
}
