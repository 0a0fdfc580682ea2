//! Chooses how the application is built and run from the files at the
//! project root.

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

/// Compose definition file names, in lookup order.
pub const COMPOSE_FILES: [&str; 4] = [
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Single-container build descriptor.
pub const DOCKERFILE: &str = "Dockerfile";

/// Build and run mechanism.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Strategy {
    /// `docker compose` driven by a compose file.
    Compose,
    /// `docker build` plus `docker run`.
    SingleContainer,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Compose => "compose",
            Self::SingleContainer => "single-container",
        })
    }
}

/// Raised when the project root holds neither descriptor.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("no compose file or Dockerfile found in {root}")]
pub struct NoDeploymentDescriptor {
    /// Directory that was inspected.
    pub root: Utf8PathBuf,
}

/// Inspects `project_root`; a compose file wins over a `Dockerfile`.
///
/// # Errors
///
/// Returns [`NoDeploymentDescriptor`] when neither is present.
pub fn select(project_root: &Utf8Path) -> Result<Strategy, NoDeploymentDescriptor> {
    if COMPOSE_FILES
        .iter()
        .any(|name| project_root.join(name).is_file())
    {
        return Ok(Strategy::Compose);
    }
    if project_root.join(DOCKERFILE).is_file() {
        return Ok(Strategy::SingleContainer);
    }
    Err(NoDeploymentDescriptor {
        root: project_root.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    fn project(files: &[&str]) -> (TempDir, Utf8PathBuf) {
        let tmp = TempDir::new().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 path");
        for file in files {
            std::fs::write(root.join(file), "").expect("write descriptor");
        }
        (tmp, root)
    }

    #[rstest]
    #[case(&["compose.yaml"])]
    #[case(&["docker-compose.yml", "Dockerfile"])]
    #[case(&["compose.yml", "Dockerfile"])]
    fn compose_file_wins(#[case] files: &[&str]) {
        let (_tmp, root) = project(files);
        assert_eq!(select(&root), Ok(Strategy::Compose));
    }

    #[rstest]
    fn dockerfile_alone_selects_single_container() {
        let (_tmp, root) = project(&["Dockerfile"]);
        assert_eq!(select(&root), Ok(Strategy::SingleContainer));
    }

    #[rstest]
    fn missing_descriptors_are_reported() {
        let (_tmp, root) = project(&["README.md"]);
        assert_eq!(
            select(&root),
            Err(NoDeploymentDescriptor { root: root.clone() })
        );
    }

    #[rstest]
    fn directory_named_like_descriptor_is_ignored() {
        let (_tmp, root) = project(&[]);
        std::fs::create_dir(root.join("Dockerfile")).expect("create dir");
        assert!(select(&root).is_err());
    }
}
