//! Binary entry point for the hoist CLI.

use std::io::{self, Write};
use std::process;

use chrono::Utc;
use clap::Parser;
use thiserror::Error;
use tracing::warn;

use hoist::{
    CancelFlag, ConfigError, DeploySettings, DeploymentOrchestrator, ExitStatus, Operation,
    Overrides, ProcessCommandRunner, RunLog, RunLogError,
};

mod cli;

use cli::{Cli, Command};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("cannot start run log: {0}")]
    RunLog(#[from] RunLogError),
}

impl CliError {
    const fn exit_status(&self) -> ExitStatus {
        match self {
            Self::Config(_) => ExitStatus::Config,
            Self::RunLog(_) => ExitStatus::Internal,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    hoist::logging::init(cli.verbose);

    let exit_code = match dispatch(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            err.exit_status().code()
        }
    };

    process::exit(exit_code);
}

async fn dispatch(command: Command) -> Result<i32, CliError> {
    let (operation, overrides) = match command {
        Command::Deploy {
            project_dir,
            name,
            port,
            exclude,
        } => (
            Operation::Deploy,
            Overrides {
                project_dir,
                name,
                port,
                excludes: exclude,
            },
        ),
        Command::Cleanup { project_dir, name } => (
            Operation::Cleanup,
            Overrides {
                project_dir,
                name,
                ..Overrides::default()
            },
        ),
    };

    let settings = DeploySettings::load(operation, &overrides)?;
    let log = RunLog::create(&settings.log_dir, Utc::now())?;
    let orchestrator = DeploymentOrchestrator::new(settings, ProcessCommandRunner, log)
        .with_cancel_flag(interrupt_flag());

    let (summary, status) = match operation {
        Operation::Deploy => {
            let report = orchestrator.deploy().await;
            for hint in &report.rollback_hints {
                warn!(command = %hint, "manual rollback hint");
            }
            (report.summary_line(), report.exit_status())
        }
        Operation::Cleanup => {
            let report = orchestrator.cleanup().await;
            (report.summary_line(), report.exit_status())
        }
    };
    writeln!(io::stdout(), "{summary}").ok();
    Ok(status.code())
}

/// Flag raised on the first Ctrl-C; the run stops before its next step.
fn interrupt_flag() -> CancelFlag {
    let flag = CancelFlag::new();
    let handler_flag = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handler_flag.cancel();
        }
    });
    flag
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
