//! Command-line interface definitions for the `hoist` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Parser, Subcommand};

/// Top-level CLI for the `hoist` binary.
#[derive(Debug, Parser)]
#[command(
    name = "hoist",
    about = "Deploy a containerised application to a single Linux host over SSH",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Log step-level detail to stderr.
    #[arg(short, long, global = true)]
    pub(crate) verbose: bool,
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Operations `hoist` performs against the configured target.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Provision the host, sync the project, and start the application.
    #[command(name = "deploy")]
    Deploy {
        /// Local project directory holding a compose file or Dockerfile.
        #[arg(long, value_name = "DIR")]
        project_dir: Option<String>,
        /// Application name; defaults to the repository or directory name.
        #[arg(long, value_name = "NAME")]
        name: Option<String>,
        /// Port the application listens on inside the host.
        #[arg(long, value_name = "PORT")]
        port: Option<u16>,
        /// Extra rsync exclude pattern; may be repeated.
        #[arg(long = "exclude", value_name = "PATTERN")]
        exclude: Vec<String>,
    },
    /// Remove the application's containers, image, proxy site and files.
    #[command(name = "cleanup")]
    Cleanup {
        /// Local project directory, used only to derive the name.
        #[arg(long, value_name = "DIR")]
        project_dir: Option<String>,
        /// Application name to remove.
        #[arg(long, value_name = "NAME")]
        name: Option<String>,
    },
}
