//! Post-deploy health checks.
//!
//! Each check runs once after the settle delay. Failures are reported, never
//! retried.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::executor::{ConnectionError, Exec, RemoteCommand, RemoteExecutor, prints_anything};
use crate::model::AppName;
use crate::strategy::Strategy;

/// Port the reverse proxy listens on.
pub const PROXY_PORT: u16 = 80;

/// Independent results of the three checks.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct HealthReport {
    /// A container for the application is running.
    pub container_running: bool,
    /// The application answers on its internal port.
    pub internal_port_responds: bool,
    /// nginx answers on port 80.
    pub proxy_responds: bool,
}

impl HealthReport {
    /// Whether every check passed.
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.container_running && self.internal_port_responds && self.proxy_responds
    }

    /// Names of the checks that failed.
    #[must_use]
    pub fn failed_checks(&self) -> Vec<&'static str> {
        [
            (self.container_running, "container_running"),
            (self.internal_port_responds, "internal_port_responds"),
            (self.proxy_responds, "proxy_responds"),
        ]
        .into_iter()
        .filter_map(|(passed, name)| (!passed).then_some(name))
        .collect()
    }
}

/// Runs the health checks.
#[derive(Clone, Copy, Debug)]
pub struct HealthValidator {
    settle_delay: Duration,
}

impl HealthValidator {
    /// Validator waiting `settle_delay` before the first probe.
    #[must_use]
    pub const fn new(settle_delay: Duration) -> Self {
        Self { settle_delay }
    }

    /// Waits for the settle delay, then runs every check once.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] when the host cannot be reached; failed
    /// checks are reported in the [`HealthReport`].
    pub async fn validate<E: RemoteExecutor>(
        &self,
        executor: &E,
        app: &AppName,
        internal_port: u16,
        strategy: Strategy,
    ) -> Result<HealthReport, ConnectionError> {
        if !self.settle_delay.is_zero() {
            debug!(delay = ?self.settle_delay, "waiting before health probes");
            tokio::time::sleep(self.settle_delay).await;
        }

        let report = HealthReport {
            container_running: executor
                .execute("validate.container", &container_probe(app, strategy))?
                .is_success(),
            internal_port_responds: executor
                .execute("validate.internal_port", &http_probe(internal_port))?
                .is_success(),
            proxy_responds: executor
                .execute("validate.proxy", &http_probe(PROXY_PORT))?
                .is_success(),
        };
        info!(
            container_running = report.container_running,
            internal_port_responds = report.internal_port_responds,
            proxy_responds = report.proxy_responds,
            "health checks finished"
        );
        Ok(report)
    }
}

/// Succeeds when a running container belongs to `app`.
#[must_use]
pub fn container_probe(app: &AppName, strategy: Strategy) -> RemoteCommand {
    let selector = match strategy {
        Strategy::SingleContainer => format!("name=^{app}$"),
        Strategy::Compose => format!("label=com.docker.compose.project={app}"),
    };
    prints_anything(
        Exec::new("docker")
            .args(["ps", "-q", "--filter", selector.as_str()])
            .args(["--filter", "status=running"])
            .privileged(),
    )
}

/// Succeeds when anything answers HTTP on `127.0.0.1:<port>`.
#[must_use]
pub fn http_probe(port: u16) -> RemoteCommand {
    Exec::new("curl")
        .args(["-sS", "-o", "/dev/null", "--max-time", "5"])
        .arg(format!("http://127.0.0.1:{port}/"))
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{RenderOptions, SshExecutor, SshTransport};
    use crate::model::{CredentialRef, DeploymentTarget};
    use crate::run_log::RunLog;
    use crate::test_support::FakeHost;
    use rstest::rstest;

    fn executor(host: &FakeHost) -> SshExecutor<FakeHost> {
        let target = DeploymentTarget {
            host: String::from("192.0.2.40"),
            user: String::from("root"),
            port: 22,
            credential: CredentialRef::Agent,
            base_dir: String::from("/opt/hoist"),
        };
        SshExecutor::new(
            SshTransport::for_target(&target, "ssh"),
            host.clone(),
            RunLog::in_memory(),
        )
    }

    fn demo() -> AppName {
        AppName::parse("demo").expect("valid name")
    }

    #[rstest]
    #[case(Strategy::SingleContainer, "'name=^demo$'")]
    #[case(Strategy::Compose, "label=com.docker.compose.project=demo")]
    fn container_probe_filters_by_strategy(#[case] strategy: Strategy, #[case] filter: &str) {
        let rendered = container_probe(&demo(), strategy).render(RenderOptions::default());
        assert_eq!(
            rendered,
            format!("docker ps -q --filter {filter} --filter status=running | grep -q .")
        );
    }

    #[tokio::test]
    async fn reports_each_check_independently() {
        let host = FakeHost::provisioned();
        let mut state = host.state();
        state.containers.insert(String::from("demo"), true);
        state.published_ports.insert(String::from("demo"), 8080);
        host.set_state(state);

        let report = HealthValidator::new(Duration::ZERO)
            .validate(&executor(&host), &demo(), 8080, Strategy::SingleContainer)
            .await
            .expect("checks run");

        assert_eq!(
            report,
            HealthReport {
                container_running: true,
                internal_port_responds: true,
                proxy_responds: false,
            }
        );
        assert_eq!(report.failed_checks(), vec!["proxy_responds"]);
        assert!(!report.is_healthy());
    }

    #[tokio::test]
    async fn probes_are_not_retried() {
        let host = FakeHost::provisioned();

        let report = HealthValidator::new(Duration::ZERO)
            .validate(&executor(&host), &demo(), 8080, Strategy::SingleContainer)
            .await
            .expect("checks run");

        assert_eq!(report.failed_checks().len(), 3);
        assert_eq!(host.commands_containing("curl").len(), 2);
        assert_eq!(host.commands_containing("docker ps").len(), 1);
    }

    #[tokio::test]
    async fn connection_loss_is_an_error() {
        let host = FakeHost::provisioned().disconnect_on("curl");

        let err = HealthValidator::new(Duration::ZERO)
            .validate(&executor(&host), &demo(), 8080, Strategy::Compose)
            .await
            .expect_err("unreachable host must fail");

        assert!(matches!(err, ConnectionError::Unreachable { .. }));
    }
}
