//! Unit tests for remote command rendering and execution.

use super::*;
use crate::model::{CredentialRef, DeploymentTarget};
use crate::run_log::{RunLog, RunLogRecord};
use crate::test_support::ScriptedRunner;
use rstest::{fixture, rstest};

#[fixture]
fn target() -> DeploymentTarget {
    DeploymentTarget {
        host: String::from("203.0.113.10"),
        user: String::from("deploy"),
        port: 2222,
        credential: CredentialRef::IdentityFile(String::from("/keys/id_ed25519")),
        base_dir: String::from("/opt/hoist"),
    }
}

#[fixture]
fn transport(target: DeploymentTarget) -> SshTransport {
    SshTransport::for_target(&target, "ssh")
}

fn args_as_strings(args: &[OsString]) -> Vec<String> {
    args.iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect()
}

#[rstest]
fn render_quotes_arguments_and_prefixes_sudo() {
    let command: RemoteCommand = Exec::new("docker")
        .args(["run", "-p", "8080:8080"])
        .privileged()
        .into();

    assert_eq!(
        command.render(RenderOptions { use_sudo: true }),
        "sudo docker run -p '8080:8080'"
    );
    assert_eq!(
        command.render(RenderOptions { use_sudo: false }),
        "docker run -p '8080:8080'"
    );
}

#[rstest]
fn render_groups_nested_operators() {
    let command = RemoteCommand::And(vec![
        has_program("docker"),
        RemoteCommand::Or(vec![
            Exec::new("systemctl").args(["is-active", "--quiet", "docker"]).into(),
            Exec::new("false").into(),
        ]),
        RemoteCommand::not(prints_anything(Exec::new("docker").args(["ps", "-q"]))),
    ]);

    assert_eq!(
        command.render(RenderOptions::default()),
        "command -v docker >/dev/null && ( systemctl is-active --quiet docker || false ) && ! ( docker ps -q | grep -q . )"
    );
}

#[rstest]
fn render_in_dir_uses_subshell() {
    let command = RemoteCommand::in_dir(
        "/opt/hoist/my app",
        Exec::new("docker").args(["compose", "up", "-d"]),
    );
    assert_eq!(
        command.render(RenderOptions::default()),
        "(cd '/opt/hoist/my app' && docker compose up -d)"
    );
}

#[rstest]
fn write_file_pipes_contents_through_tee() {
    let command = write_file("/etc/nginx/sites-available/demo", "a b", true);
    assert_eq!(
        command.render(RenderOptions { use_sudo: true }),
        "printf '%s' 'a b' | sudo tee /etc/nginx/sites-available/demo >/dev/null"
    );
}

#[rstest]
fn transport_options_cover_identity_and_timeouts(transport: SshTransport) {
    let args = args_as_strings(&transport.command_args("true"));
    assert_eq!(
        args,
        vec![
            "-p",
            "2222",
            "-i",
            "/keys/id_ed25519",
            "-o",
            "BatchMode=yes",
            "-o",
            "ConnectTimeout=10",
            "deploy@203.0.113.10",
            "true",
        ]
    );
}

#[rstest]
fn transport_relaxes_host_key_checking_when_disabled(mut transport: SshTransport) {
    transport.strict_host_key_checking = false;
    transport.known_hosts_file = String::from("/dev/null");
    transport.batch_mode = false;

    let shell = transport.remote_shell();
    assert!(shell.starts_with("ssh -p 2222"));
    assert!(shell.contains("-o StrictHostKeyChecking=no"));
    assert!(shell.contains("-o UserKnownHostsFile=/dev/null"));
    assert!(!shell.contains("BatchMode"));
}

#[rstest]
fn remote_shell_keeps_paths_with_spaces_intact(mut transport: SshTransport) {
    transport.ssh_bin = String::from("/opt/open ssh/bin/ssh");
    transport.credential = CredentialRef::IdentityFile(String::from("/keys/deploy key"));
    transport.known_hosts_file = String::from("/tmp/known hosts");

    assert_eq!(
        transport.remote_shell(),
        "'/opt/open ssh/bin/ssh' -p 2222 -i '/keys/deploy key' -o BatchMode=yes \
         -o 'UserKnownHostsFile=/tmp/known hosts' -o ConnectTimeout=10"
    );
}

#[rstest]
fn execute_logs_command_before_sending(transport: SshTransport) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(0), "ok\n", "");
    let log = RunLog::in_memory();
    let executor = SshExecutor::new(transport, runner.clone(), log.clone()).with_sudo(true);

    let outcome = executor
        .execute(
            "provision.install",
            &Exec::new("apt-get").args(["install", "-y", "nginx"]).privileged().into(),
        )
        .expect("command runs");

    assert!(outcome.is_success());
    assert_eq!(outcome.stdout, "ok\n");
    let entries = log.entries();
    let Some(RunLogRecord::CommandIssued { step_id, command }) =
        entries.first().map(|entry| entry.record.clone())
    else {
        panic!("expected a command_issued record, got {entries:?}");
    };
    assert_eq!(step_id, "provision.install");
    assert_eq!(command, "sudo apt-get install -y nginx");
    let invocations = runner.invocations();
    assert_eq!(invocations.len(), 1);
    assert_eq!(
        invocations.first().map(|call| call.last_arg()),
        Some(String::from("sudo apt-get install -y nginx"))
    );
}

#[rstest]
fn execute_wraps_commands_in_timeout(transport: SshTransport) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(TIMEOUT_EXIT_CODE), "", "");
    let executor = SshExecutor::new(transport, runner.clone(), RunLog::in_memory())
        .with_command_timeout(Some(Duration::from_secs(30)));

    let outcome = executor
        .execute("deploy.build", &Exec::new("docker").args(["build", "."]).into())
        .expect("command runs");

    assert!(outcome.timed_out);
    let failure = outcome.failure().expect("timeout is a failure");
    assert_eq!(failure.exit_code, Some(TIMEOUT_EXIT_CODE));
    assert!(failure.to_string().contains("timed out"));
    assert_eq!(
        runner.invocations().first().map(|call| call.last_arg()),
        Some(String::from("timeout 30 sh -c 'docker build .'"))
    );
}

#[rstest]
fn zero_timeout_disables_wrapping(transport: SshTransport) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(TIMEOUT_EXIT_CODE), "", "");
    let executor = SshExecutor::new(transport, runner.clone(), RunLog::in_memory())
        .with_command_timeout(Some(Duration::ZERO));

    let outcome = executor
        .execute("probe", &Exec::new("true").into())
        .expect("command runs");

    assert!(!outcome.timed_out);
    assert_eq!(
        runner.invocations().first().map(|call| call.last_arg()),
        Some(String::from("true"))
    );
}

#[rstest]
fn non_zero_exit_is_a_value_not_an_error(transport: SshTransport) {
    let runner = ScriptedRunner::new();
    runner.push_failure(3);
    let executor = SshExecutor::new(transport, runner, RunLog::in_memory());

    let outcome = executor
        .execute("probe", &Exec::new("false").into())
        .expect("non-zero exit is returned");

    assert_eq!(outcome.exit_code, Some(3));
    assert_eq!(
        outcome.failure().map(|err| err.stderr),
        Some(String::from("simulated failure"))
    );
}

#[rstest]
fn ssh_exit_255_is_a_connection_error(transport: SshTransport) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(SSH_CONNECTION_FAILURE), "", "Connection refused\n");
    let executor = SshExecutor::new(transport, runner, RunLog::in_memory());

    let err = executor
        .check_connectivity()
        .expect_err("unreachable host must fail");

    assert_eq!(
        err,
        ConnectionError::Unreachable {
            login: String::from("deploy@203.0.113.10"),
            stderr: String::from("Connection refused"),
        }
    );
}

#[rstest]
fn refused_no_op_names_the_login(transport: SshTransport) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(1), "", "This account is currently not available.\n");
    let executor = SshExecutor::new(transport, runner, RunLog::in_memory());

    let err = executor
        .check_connectivity()
        .expect_err("a failing no-op must fail");

    assert_eq!(
        err,
        ConnectionError::Unreachable {
            login: String::from("deploy@203.0.113.10"),
            stderr: String::from("This account is currently not available."),
        }
    );
}

#[rstest]
fn spawn_failure_is_a_connection_error(transport: SshTransport) {
    let runner = ScriptedRunner::new();
    let executor = SshExecutor::new(transport, runner, RunLog::in_memory());

    let err = executor
        .execute("probe", &Exec::new("true").into())
        .expect_err("missing ssh binary must fail");

    assert!(matches!(err, ConnectionError::Spawn(_)));
}

#[rstest]
fn combined_output_joins_streams() {
    let outcome = ExecOutcome {
        exit_code: Some(1),
        stdout: String::from("building\n"),
        stderr: String::from("error: boom\n"),
        timed_out: false,
    };
    assert_eq!(outcome.combined_output(), "building\nerror: boom\n");
}
