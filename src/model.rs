//! Domain values fixed for the lifetime of one run.

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

const MAX_APP_NAME_LEN: usize = 63;

/// Raised when an application name cannot be used on the remote host.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum AppNameError {
    /// Raised when no name could be derived from any source.
    #[error("application name is empty")]
    Empty,
    /// Raised when the name is longer than container and nginx names allow.
    #[error("application name '{name}' exceeds {MAX_APP_NAME_LEN} characters")]
    TooLong {
        /// Rejected name.
        name: String,
    },
    /// Raised when the name starts with a character other than `[a-z0-9]`.
    #[error("application name '{name}' must start with a lowercase letter or digit")]
    InvalidStart {
        /// Rejected name.
        name: String,
    },
    /// Raised when the name contains a character outside `[a-z0-9_.-]`.
    #[error("application name '{name}' contains invalid character '{character}'")]
    InvalidCharacter {
        /// Rejected name.
        name: String,
        /// First offending character.
        character: char,
    },
    /// Raised when `.`, `_` or `-` ends the name or follows another of them.
    #[error("application name '{name}' must use '.', '_' and '-' only between letters or digits")]
    MisplacedSeparator {
        /// Rejected name.
        name: String,
    },
    /// Raised when a Compose deployment uses a name Compose rejects.
    #[error("application name '{name}' cannot be a Compose project name; '.' is not allowed")]
    InvalidComposeProject {
        /// Rejected name.
        name: String,
    },
}

/// Validated application name, used for container, image, compose project,
/// proxy site and remote directory names.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct AppName(String);

impl AppName {
    /// Lower-cases and validates `raw`.
    ///
    /// # Errors
    ///
    /// Returns [`AppNameError`] when the lower-cased value does not match
    /// `[a-z0-9]+([._-][a-z0-9]+)*` within 63 characters. Offending
    /// characters are reported, not stripped.
    pub fn parse(raw: &str) -> Result<Self, AppNameError> {
        let name = raw.trim().to_lowercase();
        let mut chars = name.chars();
        let Some(first) = chars.next() else {
            return Err(AppNameError::Empty);
        };
        if name.chars().count() > MAX_APP_NAME_LEN {
            return Err(AppNameError::TooLong { name });
        }
        if !(first.is_ascii_lowercase() || first.is_ascii_digit()) {
            return Err(AppNameError::InvalidStart { name });
        }
        if let Some(character) = chars.find(|ch| !is_name_char(*ch)) {
            return Err(AppNameError::InvalidCharacter { name, character });
        }
        let doubled = name
            .as_bytes()
            .windows(2)
            .any(|pair| pair.iter().all(|byte| is_separator(char::from(*byte))));
        if doubled || name.ends_with(is_separator) {
            return Err(AppNameError::MisplacedSeparator { name });
        }
        Ok(Self(name))
    }

    /// Confirms the name is also usable as a Compose project name, which
    /// allows `_` and `-` but not `.`.
    ///
    /// # Errors
    ///
    /// Returns [`AppNameError::InvalidComposeProject`] when the name contains `.`.
    pub fn check_compose_project(&self) -> Result<(), AppNameError> {
        if self.0.contains('.') {
            return Err(AppNameError::InvalidComposeProject {
                name: self.0.clone(),
            });
        }
        Ok(())
    }

    /// Picks the explicit name, else the repository basename without `.git`,
    /// else the project directory's final component.
    ///
    /// # Errors
    ///
    /// Returns [`AppNameError`] when the chosen candidate is invalid.
    pub fn derive(
        explicit: Option<&str>,
        repo_url: Option<&str>,
        project_dir: &Utf8Path,
    ) -> Result<Self, AppNameError> {
        if let Some(name) = explicit.filter(|value| !value.trim().is_empty()) {
            return Self::parse(name);
        }
        if let Some(base) = repo_url.and_then(repo_basename) {
            return Self::parse(base);
        }
        let dir_name = project_dir
            .canonicalize_utf8()
            .ok()
            .and_then(|path| path.file_name().map(str::to_owned))
            .or_else(|| project_dir.file_name().map(str::to_owned))
            .unwrap_or_default();
        Self::parse(&dir_name)
    }

    /// Borrowed form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

const fn is_name_char(ch: char) -> bool {
    ch.is_ascii_lowercase() || ch.is_ascii_digit() || is_separator(ch)
}

const fn is_separator(ch: char) -> bool {
    matches!(ch, '_' | '.' | '-')
}

/// Final path segment of a git URL, without a trailing `.git`.
#[must_use]
pub fn repo_basename(url: &str) -> Option<&str> {
    let trimmed = url.trim().trim_end_matches('/');
    let last = trimmed.rsplit(['/', ':']).next()?;
    let base = last.strip_suffix(".git").unwrap_or(last);
    (!base.is_empty()).then_some(base)
}

/// How the SSH client authenticates.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CredentialRef {
    /// Agent or the client's default keys.
    Agent,
    /// Explicit private key path.
    IdentityFile(String),
}

/// The remote host a run targets.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeploymentTarget {
    /// Host name or address.
    pub host: String,
    /// Login user.
    pub user: String,
    /// SSH port.
    pub port: u16,
    /// Authentication method.
    pub credential: CredentialRef,
    /// Parent directory of every application directory on the host.
    pub base_dir: String,
}

impl DeploymentTarget {
    /// Remote directory holding `app`'s files.
    #[must_use]
    pub fn app_dir(&self, app: &AppName) -> String {
        format!("{}/{}", self.base_dir.trim_end_matches('/'), app)
    }
}

/// Git repository the application is fetched from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SourceRef {
    /// Clone URL without credentials.
    pub repo_url: String,
    /// Branch to deploy.
    pub branch: String,
    /// Environment variable holding the access token, if any.
    pub token_env: String,
}

/// The application being deployed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Application {
    /// Validated name.
    pub name: AppName,
    /// Optional git source fetched before syncing.
    pub source: Option<SourceRef>,
    /// Port the application listens on inside the container.
    pub internal_port: u16,
    /// Local directory pushed to the host.
    pub project_dir: Utf8PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("demo", "demo")]
    #[case("My-App", "my-app")]
    #[case("api_v2.service", "api_v2.service")]
    #[case("9lives", "9lives")]
    fn parse_accepts_valid_names(#[case] raw: &str, #[case] expected: &str) {
        let name = AppName::parse(raw).expect("valid name");
        assert_eq!(name.as_str(), expected);
    }

    #[rstest]
    fn parse_reports_invalid_characters_instead_of_stripping() {
        let err = AppName::parse("my app").expect_err("space must be rejected");
        assert_eq!(
            err,
            AppNameError::InvalidCharacter {
                name: String::from("my app"),
                character: ' ',
            }
        );
    }

    #[rstest]
    #[case("-leading")]
    #[case(".hidden")]
    fn parse_rejects_bad_first_character(#[case] raw: &str) {
        assert!(matches!(
            AppName::parse(raw),
            Err(AppNameError::InvalidStart { .. })
        ));
    }

    #[rstest]
    #[case("demo-")]
    #[case("x_")]
    #[case("a..b")]
    #[case("a-_b")]
    fn parse_rejects_separators_outside_words(#[case] raw: &str) {
        assert_eq!(
            AppName::parse(raw),
            Err(AppNameError::MisplacedSeparator {
                name: String::from(raw),
            })
        );
    }

    #[rstest]
    #[case("shop", true)]
    #[case("shop_api-2", true)]
    #[case("api.v1", false)]
    fn compose_projects_reject_dots(#[case] raw: &str, #[case] allowed: bool) {
        let name = AppName::parse(raw).expect("valid name");
        assert_eq!(name.check_compose_project().is_ok(), allowed);
    }

    #[rstest]
    fn parse_rejects_overlong_names() {
        let raw = "a".repeat(MAX_APP_NAME_LEN + 1);
        assert!(matches!(
            AppName::parse(&raw),
            Err(AppNameError::TooLong { .. })
        ));
    }

    #[rstest]
    #[case("https://github.com/acme/Shop.git", Some("Shop"))]
    #[case("git@github.com:acme/blog.git", Some("blog"))]
    #[case("https://example.com/acme/site/", Some("site"))]
    #[case("", None)]
    fn repo_basename_strips_suffix(#[case] url: &str, #[case] expected: Option<&str>) {
        assert_eq!(repo_basename(url), expected);
    }

    #[rstest]
    fn derive_prefers_explicit_then_repo_then_directory() {
        let dir = Utf8Path::new("/nonexistent/Project-Dir");

        let explicit = AppName::derive(Some("named"), Some("https://x/y/repo.git"), dir)
            .expect("explicit name");
        let from_repo = AppName::derive(None, Some("https://x/y/repo.git"), dir)
            .expect("repo name");
        let from_dir = AppName::derive(Some("  "), None, dir).expect("dir name");

        assert_eq!(explicit.as_str(), "named");
        assert_eq!(from_repo.as_str(), "repo");
        assert_eq!(from_dir.as_str(), "project-dir");
    }

    #[rstest]
    fn app_dir_joins_base_without_double_slash() {
        let target = DeploymentTarget {
            host: String::from("203.0.113.5"),
            user: String::from("root"),
            port: 22,
            credential: CredentialRef::Agent,
            base_dir: String::from("/opt/hoist/"),
        };
        let name = AppName::parse("demo").expect("valid name");
        assert_eq!(target.app_dir(&name), "/opt/hoist/demo");
    }
}
