//! Test support utilities shared across unit and integration tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::rc::Rc;

use std::time::Duration;

use camino::Utf8Path;
use tokio::sync::{Mutex, MutexGuard};

use crate::config::DeploySettings;
use crate::executor::{CommandOutput, CommandRunner, SpawnError, SshTransport};
use crate::model::{AppName, AppNameError, Application, CredentialRef, DeploymentTarget};
use crate::provision::{PackageFamily, detect_family};
use crate::proxy::ProxySettings;
use crate::sync::SyncSettings;

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Rc<RefCell<VecDeque<CommandOutput>>>,
    invocations: Rc<RefCell<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through a test runner.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }

    /// Final argument, which for `ssh` is the remote command.
    #[must_use]
    pub fn last_arg(&self) -> String {
        self.args
            .last()
            .map(|arg| arg.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.borrow().clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses.borrow_mut().push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, SpawnError> {
        self.invocations.borrow_mut().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| SpawnError {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Settings for deploying `name` from `project_dir` to `root@203.0.113.10`
/// with every delay and timeout disabled.
///
/// # Errors
///
/// Returns [`AppNameError`] when `name` is not a valid application name.
pub fn deploy_settings(
    project_dir: &Utf8Path,
    name: &str,
    internal_port: u16,
) -> Result<DeploySettings, AppNameError> {
    let target = DeploymentTarget {
        host: String::from("203.0.113.10"),
        user: String::from("root"),
        port: 22,
        credential: CredentialRef::Agent,
        base_dir: String::from("/opt/hoist"),
    };
    Ok(DeploySettings {
        app: Application {
            name: AppName::parse(name)?,
            source: None,
            internal_port,
            project_dir: project_dir.to_path_buf(),
        },
        transport: SshTransport::for_target(&target, "ssh"),
        target,
        sync: SyncSettings::default(),
        extra_excludes: Vec::new(),
        proxy: ProxySettings::default(),
        use_sudo: true,
        command_timeout: None,
        checkout_dir: None,
        git_bin: String::from("git"),
        log_dir: project_dir.join(".hoist/runs"),
        settle_delay: Duration::ZERO,
        retry_delay: Duration::ZERO,
    })
}

/// Failure injected into a [`FakeHost`] for commands containing a pattern.
#[derive(Clone, Debug)]
struct Fault {
    pattern: String,
    code: i32,
    stderr: String,
    remaining: Option<usize>,
}

/// Simulated remote host state.
#[derive(Clone, Debug)]
pub struct HostState {
    /// Contents of `/etc/os-release`.
    pub os_release: String,
    /// Programs resolvable through `command -v`.
    pub programs: BTreeSet<String>,
    /// Services reported active by `systemctl`.
    pub active_services: BTreeSet<String>,
    /// Whether `docker compose` (plugin form) is available.
    pub compose_plugin: bool,
    /// Existing directories.
    pub dirs: BTreeSet<String>,
    /// Regular files and their contents.
    pub files: BTreeMap<String, String>,
    /// Symlinks and their targets.
    pub symlinks: BTreeMap<String, String>,
    /// Containers by name, with their running flag.
    pub containers: BTreeMap<String, bool>,
    /// Published host port per container.
    pub published_ports: BTreeMap<String, u16>,
    /// Compose projects currently up.
    pub compose_projects: BTreeSet<String>,
    /// Built images.
    pub images: BTreeSet<String>,
    /// Number of regular files under synced directories.
    pub remote_file_count: usize,
    /// Package installs performed, in order.
    pub installed_packages: Vec<String>,
    /// Number of `systemctl reload nginx` calls.
    pub nginx_reloads: usize,
}

const DEBIAN_OS_RELEASE: &str = "PRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\nNAME=\"Debian GNU/Linux\"\nID=debian\n";

/// `/etc/os-release` of a Fedora host.
pub const FEDORA_OS_RELEASE: &str = "NAME=\"Fedora Linux\"\nVERSION_ID=40\nID=fedora\n";

const RED_HAT_NGINX_CONF: &str = "http {\n    include /etc/nginx/conf.d/*.conf;\n    server {\n        listen 80 default_server;\n        server_name _;\n        root /usr/share/nginx/html;\n    }\n}\n";

impl Default for HostState {
    fn default() -> Self {
        Self {
            os_release: String::from(DEBIAN_OS_RELEASE),
            programs: ["sh", "apt-get", "curl", "find"]
                .into_iter()
                .map(String::from)
                .collect(),
            active_services: BTreeSet::new(),
            compose_plugin: false,
            dirs: BTreeSet::new(),
            files: BTreeMap::new(),
            symlinks: BTreeMap::new(),
            containers: BTreeMap::new(),
            published_ports: BTreeMap::new(),
            compose_projects: BTreeSet::new(),
            images: BTreeSet::new(),
            remote_file_count: 0,
            installed_packages: Vec::new(),
            nginx_reloads: 0,
        }
    }
}

#[derive(Debug, Default)]
struct FakeHostInner {
    state: HostState,
    faults: Vec<Fault>,
    disconnects: Vec<Fault>,
    local_file_count: usize,
    remote_commands: Vec<String>,
    invocations: Vec<CommandInvocation>,
}

/// Command runner simulating a single Linux host reached over `ssh`, plus
/// local `rsync` and `git`.
///
/// Remote command strings are interpreted with a small evaluator that
/// understands the operators the command tree renders (`&&`, `||`, `|`, `!`,
/// subshells and `cd`), so repeated runs observe the effects of earlier ones.
#[derive(Clone, Debug, Default)]
pub struct FakeHost {
    inner: Rc<RefCell<FakeHostInner>>,
}

impl FakeHost {
    /// Fresh Debian host with nothing installed and two local files to sync.
    #[must_use]
    pub fn new() -> Self {
        let host = Self::default();
        host.inner.borrow_mut().local_file_count = 2;
        host
    }

    /// Replaces `/etc/os-release`.
    #[must_use]
    pub fn with_os_release(self, contents: &str) -> Self {
        self.inner.borrow_mut().state.os_release = contents.to_owned();
        self
    }

    /// Turns the host into a Fedora host using `dnf`, whose stock
    /// `nginx.conf` includes only `conf.d/*.conf` and declares its own
    /// default server.
    #[must_use]
    pub fn on_red_hat(self) -> Self {
        {
            let mut inner = self.inner.borrow_mut();
            let state = &mut inner.state;
            state.os_release = String::from(FEDORA_OS_RELEASE);
            state.programs.remove("apt-get");
            state.programs.insert(String::from("dnf"));
            state.files.insert(
                String::from("/etc/nginx/nginx.conf"),
                String::from(RED_HAT_NGINX_CONF),
            );
        }
        self
    }

    /// Marks `program` as installed.
    #[must_use]
    pub fn with_program(self, program: &str) -> Self {
        self.inner
            .borrow_mut()
            .state
            .programs
            .insert(program.to_owned());
        self
    }

    /// Host with docker, the compose plugin and nginx installed and active.
    #[must_use]
    pub fn provisioned() -> Self {
        let host = Self::new();
        {
            let mut inner = host.inner.borrow_mut();
            for program in ["docker", "nginx"] {
                inner.state.programs.insert(program.to_owned());
                inner.state.active_services.insert(program.to_owned());
            }
            inner.state.compose_plugin = true;
        }
        host
    }

    /// Fails every remote command containing `pattern` with `code`.
    #[must_use]
    pub fn fail_on(self, pattern: &str, code: i32) -> Self {
        self.push_fault(pattern, code, None);
        self
    }

    /// Fails the next `times` remote commands containing `pattern`.
    #[must_use]
    pub fn fail_times(self, pattern: &str, code: i32, times: usize) -> Self {
        self.push_fault(pattern, code, Some(times));
        self
    }

    /// Makes `ssh` report a connection failure for commands containing
    /// `pattern`.
    #[must_use]
    pub fn disconnect_on(self, pattern: &str) -> Self {
        self.inner.borrow_mut().disconnects.push(Fault {
            pattern: pattern.to_owned(),
            code: 255,
            stderr: String::from("ssh: connect to host: Connection refused"),
            remaining: None,
        });
        self
    }

    /// Number of regular files `rsync` reports sending.
    #[must_use]
    pub fn with_local_file_count(self, count: usize) -> Self {
        self.inner.borrow_mut().local_file_count = count;
        self
    }

    fn push_fault(&self, pattern: &str, code: i32, remaining: Option<usize>) {
        self.inner.borrow_mut().faults.push(Fault {
            pattern: pattern.to_owned(),
            code,
            stderr: format!("simulated failure for {pattern}"),
            remaining,
        });
    }

    /// Snapshot of the simulated host.
    #[must_use]
    pub fn state(&self) -> HostState {
        self.inner.borrow().state.clone()
    }

    /// Overrides the simulated host.
    pub fn set_state(&self, state: HostState) {
        self.inner.borrow_mut().state = state;
    }

    /// Remote command strings received over `ssh`, timeout wrapper removed.
    #[must_use]
    pub fn remote_commands(&self) -> Vec<String> {
        self.inner.borrow().remote_commands.clone()
    }

    /// Every local invocation.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.inner.borrow().invocations.clone()
    }

    /// Remote commands whose text contains `needle`.
    #[must_use]
    pub fn commands_containing(&self, needle: &str) -> Vec<String> {
        self.remote_commands()
            .into_iter()
            .filter(|command| command.contains(needle))
            .collect()
    }

    fn take_fault(faults: &mut [Fault], command: &str) -> Option<Fault> {
        let fault = faults.iter_mut().find(|fault| {
            command.contains(&fault.pattern) && fault.remaining.is_none_or(|left| left > 0)
        })?;
        if let Some(left) = fault.remaining.as_mut() {
            *left -= 1;
        }
        Some(fault.clone())
    }

    fn run_ssh(&self, args: &[OsString]) -> CommandOutput {
        let raw = args
            .last()
            .map(|arg| arg.to_string_lossy().into_owned())
            .unwrap_or_default();
        let command = strip_timeout(&raw);
        let mut inner = self.inner.borrow_mut();
        inner.remote_commands.push(command.clone());

        if let Some(fault) = Self::take_fault(&mut inner.disconnects, &command) {
            return output(fault.code, "", &fault.stderr);
        }
        let mut shell = Shell { inner: &mut *inner };
        shell.eval(&command)
    }

    fn run_rsync(&self, args: &[OsString]) -> CommandOutput {
        let joined = args
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        let mut inner = self.inner.borrow_mut();
        if let Some(fault) = Self::take_fault(&mut inner.disconnects, &joined) {
            return output(fault.code, "", &fault.stderr);
        }
        if let Some(fault) = Self::take_fault(&mut inner.faults, &joined) {
            return output(fault.code, "", &fault.stderr);
        }
        let count = inner.local_file_count;
        inner.state.remote_file_count = count;
        let stats = format!(
            "\nNumber of files: {} (reg: {count}, dir: 1)\nNumber of regular files transferred: {count}\nTotal file size: 1,024 bytes\nTotal transferred file size: 1,024 bytes\n",
            count + 1
        );
        output(0, &stats, "")
    }
}

impl CommandRunner for FakeHost {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, SpawnError> {
        self.inner.borrow_mut().invocations.push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        match program.rsplit('/').next().unwrap_or(program) {
            "ssh" => Ok(self.run_ssh(args)),
            "rsync" => Ok(self.run_rsync(args)),
            "git" => Ok(output(0, "", "")),
            other => Err(SpawnError {
                program: other.to_owned(),
                message: String::from("not simulated"),
            }),
        }
    }
}

fn output(code: i32, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        code: Some(code),
        stdout: stdout.to_owned(),
        stderr: stderr.to_owned(),
    }
}

/// Removes a `timeout <secs> sh -c '<cmd>'` wrapper.
fn strip_timeout(command: &str) -> String {
    let words = split_words(command);
    match words.as_slice() {
        [timeout, _, sh, flag, inner] if timeout == "timeout" && sh == "sh" && flag == "-c" => {
            inner.clone()
        }
        _ => command.to_owned(),
    }
}

/// Splits a shell string into unquoted words, honouring single quotes and
/// backslash escapes.
fn split_words(command: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = command.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                in_word = true;
                for quoted in chars.by_ref() {
                    if quoted == '\'' {
                        break;
                    }
                    current.push(quoted);
                }
            }
            '\\' => {
                in_word = true;
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ch if ch.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            other => {
                in_word = true;
                current.push(other);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

/// Splits `command` on a top-level operator, ignoring quoted text and
/// parenthesised groups.
fn split_top_level<'a>(command: &'a str, operator: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut depth = 0_usize;
    let mut quoted = false;
    let mut start = 0;
    let bytes = command.as_bytes();
    let mut index = 0;
    while index < bytes.len() {
        let byte = bytes.get(index).copied().unwrap_or_default();
        match byte {
            b'\'' => quoted = !quoted,
            b'(' if !quoted => depth += 1,
            b')' if !quoted => depth = depth.saturating_sub(1),
            _ => {}
        }
        if !quoted && depth == 0 && command.get(index..).is_some_and(|rest| rest.starts_with(operator)) {
            parts.push(command.get(start..index).unwrap_or_default());
            index += operator.len();
            start = index;
            continue;
        }
        index += 1;
    }
    parts.push(command.get(start..).unwrap_or_default());
    parts
}

struct Shell<'a> {
    inner: &'a mut FakeHostInner,
}

impl Shell<'_> {
    fn eval(&mut self, command: &str) -> CommandOutput {
        let command = command.trim();

        let alternatives = split_top_level(command, " || ");
        if alternatives.len() > 1 {
            let mut last = output(1, "", "");
            for part in alternatives {
                last = self.eval(part);
                if last.is_success() {
                    return last;
                }
            }
            return last;
        }

        let sequence = split_top_level(command, " && ");
        if sequence.len() > 1 {
            let mut combined = output(0, "", "");
            for part in sequence {
                let step = self.eval(part);
                combined.stdout.push_str(&step.stdout);
                combined.stderr.push_str(&step.stderr);
                combined.code = step.code;
                if !step.is_success() {
                    return combined;
                }
            }
            return combined;
        }

        let stages = split_top_level(command, " | ");
        if let [producer, consumer] = stages.as_slice() {
            return self.eval_pipe(producer, consumer);
        }

        if let Some(rest) = command.strip_prefix("! ") {
            let inner = self.eval(rest);
            return output(i32::from(inner.is_success()), "", "");
        }

        if let Some(group) = command.strip_prefix('(').and_then(|rest| rest.strip_suffix(')')) {
            let group = group.trim();
            if let Some(rest) = group.strip_prefix("cd ") {
                let parts = split_top_level(rest, " && ");
                return match parts.as_slice() {
                    [_, tail @ ..] => self.eval(&tail.join(" && ")),
                    [] => output(0, "", ""),
                };
            }
            return self.eval(group);
        }

        let mut words = split_words(command);
        if words.last().is_some_and(|word| word == ">/dev/null") {
            words.pop();
        }
        if words.first().is_some_and(|word| word == "sudo") {
            words.remove(0);
        }
        if let Some(fault) = FakeHost::take_fault(&mut self.inner.faults, command) {
            return output(fault.code, "", &fault.stderr);
        }
        self.atom(&words)
    }

    fn eval_pipe(&mut self, producer: &str, consumer: &str) -> CommandOutput {
        let words = split_words(consumer);
        let upstream = self.eval(producer);
        match words.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
            ["grep", "-q", "."] => output(i32::from(upstream.stdout.trim().is_empty()), "", ""),
            ["grep", "-qF", needle] => output(i32::from(!upstream.stdout.contains(needle)), "", ""),
            ["wc", "-l"] => output(0, &format!("{}\n", upstream.stdout.lines().count()), ""),
            [.., "tee", path, ">/dev/null"] | [.., "tee", path] => {
                if let Some(fault) = FakeHost::take_fault(&mut self.inner.faults, consumer) {
                    return output(fault.code, "", &fault.stderr);
                }
                self.inner
                    .state
                    .files
                    .insert((*path).to_owned(), upstream.stdout);
                output(0, "", "")
            }
            _ => output(127, "", "unsupported pipeline"),
        }
    }

    fn atom(&mut self, words: &[String]) -> CommandOutput {
        let argv: Vec<&str> = words.iter().map(String::as_str).collect();
        let state = &mut self.inner.state;
        let ok = || output(0, "", "");
        let fail = |code: i32, stderr: &str| output(code, "", stderr);
        match argv.as_slice() {
            ["true"] => ok(),
            ["cat", "/etc/os-release"] => output(0, &state.os_release, ""),
            ["cat", path] => state
                .files
                .get(*path)
                .map_or_else(|| fail(1, "No such file or directory"), |body| output(0, body, "")),
            ["printf", "%s", contents] => output(0, contents, ""),
            ["command", "-v", program] => {
                output(i32::from(!state.programs.contains(*program)), "", "")
            }
            ["systemctl", "is-active", "--quiet", service] => {
                output(i32::from(!state.active_services.contains(*service)), "", "")
            }
            ["systemctl", "enable", "--now", service] => {
                if state.programs.contains(*service) {
                    state.active_services.insert((*service).to_owned());
                    ok()
                } else {
                    fail(5, "Unit not found")
                }
            }
            ["systemctl", "reload", "nginx"] => {
                if state.active_services.contains("nginx") {
                    state.nginx_reloads += 1;
                    ok()
                } else {
                    fail(1, "nginx.service is not active")
                }
            }
            ["docker", "compose", "version"] => output(i32::from(!state.compose_plugin), "", ""),
            ["docker-compose", "version"] => {
                output(i32::from(!state.programs.contains("docker-compose")), "", "")
            }
            ["apt-get" | "dnf" | "yum", "update" | "makecache" | "-qq" | "-q", ..] => ok(),
            ["apt-get" | "dnf" | "yum", "install", "-y", packages @ ..] => {
                for package in packages {
                    state.installed_packages.push((*package).to_owned());
                    match *package {
                        "docker.io" | "docker" | "moby-engine" => {
                            state.programs.insert(String::from("docker"));
                        }
                        "docker-compose-plugin" | "docker-compose-v2" => {
                            state.compose_plugin = true;
                        }
                        other => {
                            state.programs.insert(other.to_owned());
                        }
                    }
                }
                ok()
            }
            ["mkdir", "-p", paths @ ..] => {
                state.dirs.extend(paths.iter().map(|path| (*path).to_owned()));
                ok()
            }
            ["test", "-d", path] => output(i32::from(!state.dirs.contains(*path)), "", ""),
            ["test", "-f", path] => output(i32::from(!state.files.contains_key(*path)), "", ""),
            ["test", "-L", path] => output(i32::from(!state.symlinks.contains_key(*path)), "", ""),
            ["test", "-e", path] => output(
                i32::from(
                    !(state.files.contains_key(*path)
                        || state.symlinks.contains_key(*path)
                        || state.dirs.contains(*path)),
                ),
                "",
                "",
            ),
            ["find", _, "-type", "f"] => {
                let listing = (0..state.remote_file_count)
                    .map(|index| format!("file-{index}\n"))
                    .collect::<String>();
                output(0, &listing, "")
            }
            ["mv", "-f", from, to] | ["mv", from, to] => match state.files.remove(*from) {
                Some(body) => {
                    state.files.insert((*to).to_owned(), body);
                    ok()
                }
                None => fail(1, "cannot stat source"),
            },
            ["ln", "-sfn", target, link] => {
                state
                    .symlinks
                    .insert((*link).to_owned(), (*target).to_owned());
                ok()
            }
            ["rm", "-f", paths @ ..] => {
                for path in paths {
                    state.files.remove(*path);
                    state.symlinks.remove(*path);
                }
                ok()
            }
            ["rm", "-rf", path] => {
                let prefix = format!("{path}/");
                state
                    .dirs
                    .retain(|dir| dir.as_str() != *path && !dir.starts_with(&prefix));
                state.files.retain(|file, _| !file.starts_with(&prefix));
                state.remote_file_count = 0;
                ok()
            }
            ["nginx", "-T"] => {
                if !state.programs.contains("nginx") {
                    return fail(127, "nginx: command not found");
                }
                let dump = std::iter::once(String::from("/etc/nginx/nginx.conf"))
                    .chain(loaded_sites(state))
                    .map(|path| format!("# configuration file {path}:\n"))
                    .collect::<String>();
                output(0, &dump, "nginx: configuration file /etc/nginx/nginx.conf test is successful")
            }
            ["grep", "-q", pattern, path] => output(
                i32::from(!state.files.get(*path).is_some_and(|body| body.contains(pattern))),
                "",
                "",
            ),
            ["sed", "-i", expression, path] => {
                let Some(removed) = expression
                    .strip_prefix("s/")
                    .and_then(|rest| rest.strip_suffix("//g"))
                else {
                    return fail(1, "sed expression not simulated");
                };
                if let Some(body) = state.files.get_mut(*path) {
                    *body = body.replace(removed, "");
                }
                ok()
            }
            ["nginx", "-t", ..] => {
                if state.programs.contains("nginx") {
                    ok()
                } else {
                    fail(127, "nginx: command not found")
                }
            }
            ["curl", .., url] => curl(state, url),
            ["docker", rest @ ..] => docker(state, rest),
            ["docker-compose", rest @ ..] => compose(state, rest),
            _ => fail(127, "command not simulated"),
        }
    }
}

fn curl(state: &HostState, url: &str) -> CommandOutput {
    let port = url
        .rsplit(':')
        .next()
        .and_then(|tail| tail.trim_end_matches('/').parse::<u16>().ok());
    let answered = match port {
        Some(80) => state.active_services.contains("nginx") && !loaded_sites(state).is_empty(),
        Some(port) => {
            state
                .published_ports
                .iter()
                .any(|(name, published)| {
                    *published == port && state.containers.get(name).copied().unwrap_or(false)
                })
                || !state.compose_projects.is_empty()
        }
        None => false,
    };
    if answered {
        output(0, "", "")
    } else {
        output(7, "", "curl: (7) Failed to connect")
    }
}

/// Site definitions the stock `nginx.conf` of the host's family includes.
fn loaded_sites(state: &HostState) -> Vec<String> {
    let included = state
        .files
        .keys()
        .filter(|path| {
            path.strip_prefix("/etc/nginx/conf.d/")
                .is_some_and(|name| !name.contains('/') && name.ends_with(".conf"))
        })
        .cloned();
    match detect_family(&state.os_release) {
        Ok(PackageFamily::Debian) => state
            .symlinks
            .keys()
            .filter(|link| link.starts_with("/etc/nginx/sites-enabled/"))
            .cloned()
            .chain(included)
            .collect(),
        Ok(PackageFamily::RedHat) => included.collect(),
        Err(_) => Vec::new(),
    }
}

fn filter_value<'a>(args: &[&'a str], key: &str) -> Option<&'a str> {
    args.windows(2).find_map(|pair| match pair {
        ["--filter", filter] => (*filter).strip_prefix(key),
        _ => None,
    })
}

fn docker(state: &mut HostState, args: &[&str]) -> CommandOutput {
    if !state.programs.contains("docker") {
        return output(127, "", "docker: command not found");
    }
    match args {
        ["compose", rest @ ..] if state.compose_plugin => compose(state, rest),
        ["ps", flags @ ..] => {
            let running_only = flags.contains(&"status=running");
            let listing = if let Some(project) = filter_value(flags, "label=com.docker.compose.project=") {
                if state.compose_projects.contains(project) {
                    format!("{project}-web-1\n")
                } else {
                    String::new()
                }
            } else if let Some(pattern) = filter_value(flags, "name=") {
                let name = pattern.trim_start_matches('^').trim_end_matches('$');
                match state.containers.get(name) {
                    Some(running) if *running || !running_only => format!("{name}\n"),
                    _ => String::new(),
                }
            } else {
                String::new()
            };
            output(0, &listing, "")
        }
        ["rm", "-f", name] => {
            state.published_ports.remove(*name);
            if state.containers.remove(*name).is_some() {
                output(0, name, "")
            } else {
                output(1, "", "Error: No such container")
            }
        }
        ["build", "-t", image, _dir] => {
            state.images.insert((*image).to_owned());
            output(0, "", "")
        }
        ["image", "inspect", image] => output(i32::from(!state.images.contains(*image)), "", ""),
        ["image", "rm", "-f", image] => {
            state.images.remove(*image);
            output(0, "", "")
        }
        ["run", "-d", "--name", name, rest @ ..] => {
            if state.containers.contains_key(*name) {
                return output(125, "", "Conflict. The container name is already in use");
            }
            let image = rest.last().copied().unwrap_or_default();
            if !state.images.contains(image) {
                return output(125, "", "Unable to find image");
            }
            let port = rest.windows(2).find_map(|pair| match pair {
                ["-p", mapping] => mapping.split(':').next().and_then(|p| p.parse().ok()),
                _ => None,
            });
            state.containers.insert((*name).to_owned(), true);
            if let Some(port) = port {
                state.published_ports.insert((*name).to_owned(), port);
            }
            output(0, "0123456789ab\n", "")
        }
        _ => output(127, "", "docker subcommand not simulated"),
    }
}

fn compose(state: &mut HostState, args: &[&str]) -> CommandOutput {
    match args {
        ["-p", project, "down", ..] => {
            state.compose_projects.remove(*project);
            output(0, "", "")
        }
        ["-p", project, "up", "-d", "--build"] => {
            state.compose_projects.insert((*project).to_owned());
            output(0, "", "")
        }
        _ => output(127, "", "compose subcommand not simulated"),
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
