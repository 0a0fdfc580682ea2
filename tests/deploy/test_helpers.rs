//! Shared fixtures for deploy BDD scenarios.

use std::sync::Arc;

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use hoist::test_support::FakeHost;
use rstest::fixture;
use tempfile::TempDir;
use thiserror::Error;

/// Local project tree handed to the orchestrator.
#[derive(Clone, Debug)]
pub struct Project {
    pub root: Utf8PathBuf,
    _tmp: Arc<TempDir>,
}

/// What the last run reported.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunSummary {
    pub state: String,
    pub exit_code: i32,
    pub healthy: bool,
    pub step_statuses: Vec<(String, String)>,
}

#[derive(Clone, Debug)]
pub struct DeployContext {
    pub host: FakeHost,
    pub project: Option<Project>,
    pub last_run: Option<RunSummary>,
}

#[derive(Clone, Debug, Error)]
pub enum DeployTestError {
    #[error("invalid deploy fixture: {0}")]
    Fixture(String),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[fixture]
pub fn deploy_context() -> DeployContext {
    DeployContext {
        host: FakeHost::new(),
        project: None,
        last_run: None,
    }
}

/// Creates a project directory holding `files`.
pub fn project_with(files: &[&str]) -> Result<Project, DeployTestError> {
    let tmp = TempDir::new().map_err(|err| DeployTestError::Fixture(err.to_string()))?;
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .map_err(|path| DeployTestError::Fixture(path.display().to_string()))?;
    let dir = Dir::open_ambient_dir(&root, ambient_authority())
        .map_err(|err| DeployTestError::Fixture(err.to_string()))?;
    dir.write("index.html", "<h1>hello</h1>\n")
        .map_err(|err| DeployTestError::Fixture(err.to_string()))?;
    for name in files {
        dir.write(name, "# descriptor\n")
            .map_err(|err| DeployTestError::Fixture(err.to_string()))?;
    }
    Ok(Project {
        root,
        _tmp: Arc::new(tmp),
    })
}
