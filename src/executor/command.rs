//! Parameterised remote commands.
//!
//! Steps describe what to run as a small command tree of argv vectors. The
//! tree is rendered into a shell string only when it reaches the executor, so
//! every argument passes through `shell_escape` exactly once and orchestration
//! code never interpolates strings into shell syntax.

use std::borrow::Cow;

use shell_escape::unix::escape;

/// A single program invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Exec {
    argv: Vec<String>,
    privileged: bool,
    discard_stdout: bool,
}

impl Exec {
    /// Starts an invocation of `program`.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            argv: vec![program.into()],
            privileged: false,
            discard_stdout: false,
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.argv.push(value.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(values.into_iter().map(Into::into));
        self
    }

    /// Marks the invocation as requiring root privileges.
    #[must_use]
    pub const fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    /// Redirects standard output to `/dev/null`.
    #[must_use]
    pub const fn quiet(mut self) -> Self {
        self.discard_stdout = true;
        self
    }

    /// Returns the argument vector, program first.
    #[must_use]
    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

/// Options applied while rendering a command tree.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RenderOptions {
    /// Prefix privileged invocations with `sudo`.
    pub use_sudo: bool,
}

/// Command tree executed on the remote host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RemoteCommand {
    /// Runs one program.
    Exec(Exec),
    /// Pipes the left command's stdout into the right command.
    Pipe(Box<Self>, Box<Self>),
    /// Runs each command while the previous one succeeds.
    And(Vec<Self>),
    /// Runs each command until one succeeds.
    Or(Vec<Self>),
    /// Inverts the exit status.
    Not(Box<Self>),
    /// Runs the command from inside `dir`.
    InDir {
        /// Working directory on the remote host.
        dir: String,
        /// Command to run there.
        command: Box<Self>,
    },
}

impl From<Exec> for RemoteCommand {
    fn from(value: Exec) -> Self {
        Self::Exec(value)
    }
}

impl RemoteCommand {
    /// Builds a pipeline `left | right`.
    #[must_use]
    pub fn pipe(left: impl Into<Self>, right: impl Into<Self>) -> Self {
        Self::Pipe(Box::new(left.into()), Box::new(right.into()))
    }

    /// Builds `! command`.
    #[must_use]
    pub fn not(command: impl Into<Self>) -> Self {
        Self::Not(Box::new(command.into()))
    }

    /// Builds `cd dir && command` in a subshell.
    #[must_use]
    pub fn in_dir(dir: impl Into<String>, command: impl Into<Self>) -> Self {
        Self::InDir {
            dir: dir.into(),
            command: Box::new(command.into()),
        }
    }

    /// Renders the tree to a POSIX shell string.
    #[must_use]
    pub fn render(&self, options: RenderOptions) -> String {
        match self {
            Self::Exec(exec) => render_exec(exec, options),
            Self::Pipe(left, right) => format!(
                "{} | {}",
                left.render_operand(options),
                right.render_operand(options)
            ),
            Self::And(parts) => join(parts, " && ", options),
            Self::Or(parts) => join(parts, " || ", options),
            Self::Not(inner) => format!("! {}", inner.render_operand(options)),
            Self::InDir { dir, command } => {
                format!("(cd {} && {})", quote(dir), command.render_operand(options))
            }
        }
    }

    fn render_operand(&self, options: RenderOptions) -> String {
        match self {
            Self::Exec(_) | Self::InDir { .. } => self.render(options),
            _ => format!("( {} )", self.render(options)),
        }
    }
}

fn join(parts: &[RemoteCommand], separator: &str, options: RenderOptions) -> String {
    parts
        .iter()
        .map(|part| match part {
            RemoteCommand::Pipe(..) | RemoteCommand::Not(_) => part.render(options),
            _ => part.render_operand(options),
        })
        .collect::<Vec<_>>()
        .join(separator)
}

fn render_exec(exec: &Exec, options: RenderOptions) -> String {
    let mut rendered = String::new();
    if exec.privileged && options.use_sudo {
        rendered.push_str("sudo ");
    }
    let words = exec
        .argv
        .iter()
        .map(|word| quote(word).into_owned())
        .collect::<Vec<_>>();
    rendered.push_str(&words.join(" "));
    if exec.discard_stdout {
        rendered.push_str(" >/dev/null");
    }
    rendered
}

/// Shell-escapes a single word.
pub(crate) fn quote(word: &str) -> Cow<'_, str> {
    escape(Cow::Borrowed(word))
}

/// Writes `contents` to `path` through `tee`, optionally with privileges.
#[must_use]
pub fn write_file(path: &str, contents: &str, privileged: bool) -> RemoteCommand {
    let tee = Exec::new("tee").arg(path).quiet();
    let tee = if privileged { tee.privileged() } else { tee };
    RemoteCommand::pipe(Exec::new("printf").arg("%s").arg(contents), tee)
}

/// `test <flag> <path>`.
#[must_use]
pub fn test_path(flag: &str, path: &str) -> RemoteCommand {
    Exec::new("test").arg(flag).arg(path).into()
}

/// `command -v <program>`, silenced.
#[must_use]
pub fn has_program(program: &str) -> RemoteCommand {
    Exec::new("command").arg("-v").arg(program).quiet().into()
}

/// Succeeds when `producer` prints at least one line.
#[must_use]
pub fn prints_anything(producer: impl Into<RemoteCommand>) -> RemoteCommand {
    RemoteCommand::pipe(producer, Exec::new("grep").arg("-q").arg("."))
}
