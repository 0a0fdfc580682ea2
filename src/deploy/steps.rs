//! Step builders for the deploy plan and the cleanup sequence.
//!
//! Pure functions of the run's settings; nothing here touches the host.

use crate::config::DeploySettings;
use crate::executor::{Exec, RemoteCommand, prints_anything, test_path};
use crate::model::AppName;
use crate::plan::{DeploymentPlan, Phase, PlanError, Step, StepAction};
use crate::provision::{ComposeTool, ProvisionPlan, service_active};
use crate::proxy::{ReverseProxyConfigurator, reload_command};
use crate::strategy::Strategy;

/// Image tag built for single-container deploys.
#[must_use]
pub fn image_tag(app: &AppName) -> String {
    format!("{app}:latest")
}

fn compose_label(app: &AppName) -> String {
    format!("label=com.docker.compose.project={app}")
}

fn docker() -> Exec {
    Exec::new("docker").privileged()
}

/// Succeeds when no container, running or stopped, carries `app`'s name.
#[must_use]
pub fn no_named_container(app: &AppName) -> RemoteCommand {
    RemoteCommand::not(prints_anything(
        docker().args(["ps", "-aq", "--filter"]).arg(format!("name=^{app}$")),
    ))
}

fn no_compose_containers(app: &AppName) -> RemoteCommand {
    RemoteCommand::not(prints_anything(
        docker().args(["ps", "-aq", "--filter"]).arg(compose_label(app)),
    ))
}

fn compose_down(tool: ComposeTool, app: &AppName) -> Exec {
    tool.command()
        .privileged()
        .args(["-p", app.as_str(), "down", "--remove-orphans"])
}

/// Assembles the full deploy plan.
///
/// # Errors
///
/// Returns [`PlanError`] if the assembled steps violate phase order or
/// repeat an id.
pub fn deploy_plan(
    settings: &DeploySettings,
    strategy: Strategy,
    provision: &ProvisionPlan,
    proxy: &ReverseProxyConfigurator,
) -> Result<DeploymentPlan, PlanError> {
    let app = &settings.app.name;
    let app_dir = settings.target.app_dir(app);

    let mut steps = provision.steps();
    steps.extend(sync_steps(settings, &app_dir));
    steps.extend(deploy_steps(
        app,
        &app_dir,
        settings.app.internal_port,
        strategy,
        provision.compose.unwrap_or(ComposeTool::Plugin),
    ));
    steps.extend(proxy_steps(app, proxy));
    steps.push(
        Step::new("validate.health", Phase::Validating, StepAction::ValidateHealth)
            .without_retry(),
    );
    DeploymentPlan::new(steps)
}

fn sync_steps(settings: &DeploySettings, app_dir: &str) -> [Step; 2] {
    [
        Step::remote(
            "sync.prepare_dir",
            Phase::Syncing,
            Exec::new("mkdir").args(["-p", app_dir]),
        )
        .satisfied_when(test_path("-d", app_dir))
        .keyed(format!("dir:{app_dir}"))
        .rollback(Exec::new("rm").args(["-rf", app_dir]).privileged()),
        Step::new(
            "sync.files",
            Phase::Syncing,
            StepAction::Sync {
                local: settings.app.project_dir.clone(),
                remote: app_dir.to_owned(),
            },
        )
        .keyed(format!("files:{app_dir}")),
    ]
}

/// Deploy-phase steps. The previous instance is always removed first so a
/// re-deploy replaces rather than stacks.
#[must_use]
pub fn deploy_steps(
    app: &AppName,
    app_dir: &str,
    port: u16,
    strategy: Strategy,
    compose: ComposeTool,
) -> Vec<Step> {
    let remove_container = docker().args(["rm", "-f", app.as_str()]);
    let mut steps = vec![
        Step::remote("deploy.remove_previous", Phase::Deploying, remove_container.clone())
            .satisfied_when(no_named_container(app))
            .keyed(format!("container-absent:{app}")),
    ];

    match strategy {
        Strategy::SingleContainer => {
            let image = image_tag(app);
            steps.push(
                Step::remote(
                    "deploy.build",
                    Phase::Deploying,
                    docker().args(["build", "-t", image.as_str(), app_dir]),
                )
                .keyed(format!("image:{image}")),
            );
            steps.push(
                Step::remote(
                    "deploy.run",
                    Phase::Deploying,
                    docker()
                        .args(["run", "-d", "--name", app.as_str()])
                        .args(["--restart", "unless-stopped", "-p"])
                        .arg(format!("{port}:{port}"))
                        .arg(image),
                )
                .keyed(format!("container:{app}"))
                .rollback(remove_container),
            );
        }
        Strategy::Compose => {
            steps.push(
                Step::remote(
                    "deploy.compose_down",
                    Phase::Deploying,
                    RemoteCommand::in_dir(app_dir, compose_down(compose, app)),
                )
                .satisfied_when(no_compose_containers(app))
                .keyed(format!("compose-absent:{app}")),
            );
            steps.push(
                Step::remote(
                    "deploy.compose_up",
                    Phase::Deploying,
                    RemoteCommand::in_dir(
                        app_dir,
                        compose
                            .command()
                            .privileged()
                            .args(["-p", app.as_str(), "up", "-d", "--build"]),
                    ),
                )
                .keyed(format!("compose:{app}"))
                .rollback(RemoteCommand::in_dir(app_dir, compose_down(compose, app))),
            );
        }
    }
    steps
}

fn proxy_steps(app: &AppName, proxy: &ReverseProxyConfigurator) -> Vec<Step> {
    let mut steps = vec![
        Step::new("proxy.site", Phase::ProxyConfiguring, StepAction::ConfigureProxy)
            .keyed(format!("site:{app}"))
            .rollback(proxy.remove_site(app)),
    ];
    if let Some((command, probe)) = proxy.disable_default_site() {
        steps.push(
            Step::remote("proxy.disable_default", Phase::ProxyConfiguring, command)
                .satisfied_when(probe),
        );
    }
    steps.push(Step::remote(
        "proxy.reload",
        Phase::ProxyConfiguring,
        reload_command(),
    ));
    steps
}

/// Cleanup steps in execution order, each skipped when its target is
/// already gone. The phase names the deploy phase whose effect is undone.
#[must_use]
pub fn cleanup_steps(settings: &DeploySettings, proxy: &ReverseProxyConfigurator) -> Vec<Step> {
    let app = &settings.app.name;
    let app_dir = settings.target.app_dir(app);
    let image = image_tag(app);
    let down_with_images = |tool: ComposeTool| -> RemoteCommand {
        compose_down(tool, app).args(["--rmi", "local"]).into()
    };

    vec![
        Step::remote(
            "cleanup.compose_down",
            Phase::Deploying,
            RemoteCommand::Or(vec![
                down_with_images(ComposeTool::Plugin),
                down_with_images(ComposeTool::Standalone),
            ]),
        )
        .satisfied_when(no_compose_containers(app)),
        Step::remote(
            "cleanup.remove_container",
            Phase::Deploying,
            docker().args(["rm", "-f", app.as_str()]),
        )
        .satisfied_when(no_named_container(app)),
        Step::remote(
            "cleanup.remove_image",
            Phase::Deploying,
            docker().args(["image", "rm", "-f", image.as_str()]),
        )
        .satisfied_when(RemoteCommand::not(
            docker().args(["image", "inspect", image.as_str()]).quiet(),
        )),
        Step::remote("cleanup.remove_site", Phase::ProxyConfiguring, proxy.remove_site(app))
            .satisfied_when(proxy.site_absent(app)),
        Step::remote("cleanup.reload_proxy", Phase::ProxyConfiguring, reload_command())
            .satisfied_when(RemoteCommand::not(service_active("nginx"))),
        Step::remote(
            "cleanup.remove_dir",
            Phase::Syncing,
            Exec::new("rm").args(["-rf", app_dir.as_str()]).privileged(),
        )
        .satisfied_when(RemoteCommand::not(test_path("-d", &app_dir))),
    ]
}
