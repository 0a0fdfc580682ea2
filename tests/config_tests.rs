//! Layered configuration loading from `hoist.toml` and the environment.

use std::time::Duration;

use camino::Utf8PathBuf;
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use hoist::config::{ConfigError, DeploySettings, Operation, Overrides};
use hoist::model::CredentialRef;
use hoist::test_support::EnvGuard;
use rstest::{fixture, rstest};
use tempfile::TempDir;

#[fixture]
fn project_dir() -> TempDir {
    TempDir::new().expect("temp dir")
}

fn path_of(dir: &TempDir) -> String {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .expect("utf8 temp path")
        .into_string()
}

/// Writes `contents` as `hoist.toml` inside `dir` and returns its path.
fn write_config(dir: &TempDir, contents: &str) -> String {
    let root = path_of(dir);
    let handle = Dir::open_ambient_dir(&root, ambient_authority()).expect("open config dir");
    handle.write("hoist.toml", contents).expect("write hoist.toml");
    format!("{root}/hoist.toml")
}

#[rstest]
#[tokio::test]
async fn sectioned_file_supplies_each_table(project_dir: TempDir) {
    let config_dir = TempDir::new().expect("config dir");
    let config = write_config(
        &config_dir,
        &format!(
            "[target]\nhost = \"198.51.100.7\"\nssh_user = \"deploy\"\nproxy_conf_dir = \"/etc/nginx/hoist.d\"\n\n\
             [app]\nname = \"shop\"\ninternal_port = 3000\nproject_dir = \"{}\"\n\n\
             [run]\nsettle_delay_secs = 1\n",
            path_of(&project_dir)
        ),
    );
    let _guard = EnvGuard::set_vars(&[("HOIST_CONFIG_PATH", config.as_str())]).await;

    let settings =
        DeploySettings::load(Operation::Deploy, &Overrides::default()).expect("settings load");

    assert_eq!(settings.target.host, "198.51.100.7");
    assert_eq!(settings.target.user, "deploy");
    assert_eq!(settings.app.name.as_str(), "shop");
    assert_eq!(settings.app.internal_port, 3000);
    assert_eq!(settings.settle_delay, Duration::from_secs(1));
    assert_eq!(settings.proxy.conf_dir.as_deref(), Some("/etc/nginx/hoist.d"));
}

#[rstest]
#[tokio::test]
async fn environment_overrides_the_file(project_dir: TempDir) {
    let config_dir = TempDir::new().expect("config dir");
    let config = write_config(
        &config_dir,
        &format!(
            "[target]\nhost = \"198.51.100.7\"\n\n[app]\nname = \"shop\"\ninternal_port = 3000\nproject_dir = \"{}\"\n",
            path_of(&project_dir)
        ),
    );
    let _guard = EnvGuard::set_vars(&[
        ("HOIST_CONFIG_PATH", config.as_str()),
        ("HOIST_TARGET_HOST", "203.0.113.9"),
        ("HOIST_APP_INTERNAL_PORT", "4000"),
    ])
    .await;

    let settings =
        DeploySettings::load(Operation::Deploy, &Overrides::default()).expect("settings load");

    assert_eq!(settings.target.host, "203.0.113.9");
    assert_eq!(settings.app.internal_port, 4000);
    assert_eq!(settings.app.name.as_str(), "shop");
}

#[rstest]
#[tokio::test]
async fn top_level_keys_are_rejected() {
    let config_dir = TempDir::new().expect("config dir");
    let config = write_config(&config_dir, "host = \"198.51.100.7\"\n");
    let _guard = EnvGuard::set_vars(&[("HOIST_CONFIG_PATH", config.as_str())]).await;

    let err = DeploySettings::load(Operation::Deploy, &Overrides::default())
        .expect_err("a flat key has no table");

    let ConfigError::Invalid(message) = err else {
        panic!("expected Invalid, got {err:?}");
    };
    assert!(message.contains("'host'"), "{message}");
    assert!(message.contains("[target]"), "{message}");
}

#[rstest]
#[tokio::test]
async fn environment_supplies_every_layer(project_dir: TempDir) {
    let path = path_of(&project_dir);
    let _guard = EnvGuard::set_vars(&[
        ("HOIST_TARGET_HOST", "198.51.100.7"),
        ("HOIST_TARGET_SSH_USER", "deploy"),
        ("HOIST_TARGET_SSH_IDENTITY_FILE", "/keys/deploy"),
        ("HOIST_TARGET_COMMAND_TIMEOUT_SECS", "60"),
        ("HOIST_APP_NAME", "shop"),
        ("HOIST_APP_INTERNAL_PORT", "3000"),
        ("HOIST_APP_PROJECT_DIR", path.as_str()),
        ("HOIST_RUN_SETTLE_DELAY_SECS", "1"),
    ])
    .await;

    let settings =
        DeploySettings::load(Operation::Deploy, &Overrides::default()).expect("settings load");

    assert_eq!(settings.target.host, "198.51.100.7");
    assert_eq!(settings.target.user, "deploy");
    assert_eq!(
        settings.target.credential,
        CredentialRef::IdentityFile(String::from("/keys/deploy"))
    );
    assert_eq!(settings.app.name.as_str(), "shop");
    assert_eq!(settings.app.internal_port, 3000);
    assert_eq!(settings.command_timeout, Some(Duration::from_secs(60)));
    assert_eq!(settings.settle_delay, Duration::from_secs(1));
    assert_eq!(settings.target.app_dir(&settings.app.name), "/opt/hoist/shop");
}

#[rstest]
#[tokio::test]
async fn command_line_overrides_win(project_dir: TempDir) {
    let path = path_of(&project_dir);
    let _guard = EnvGuard::set_vars(&[
        ("HOIST_TARGET_HOST", "198.51.100.7"),
        ("HOIST_APP_NAME", "shop"),
        ("HOIST_APP_INTERNAL_PORT", "3000"),
        ("HOIST_APP_PROJECT_DIR", path.as_str()),
        ("HOIST_APP_EXTRA_EXCLUDES", "node_modules/"),
    ])
    .await;

    let settings = DeploySettings::load(
        Operation::Deploy,
        &Overrides {
            name: Some(String::from("storefront")),
            port: Some(8081),
            excludes: vec![String::from("*.log")],
            ..Overrides::default()
        },
    )
    .expect("settings load");

    assert_eq!(settings.app.name.as_str(), "storefront");
    assert_eq!(settings.app.internal_port, 8081);
    assert_eq!(settings.extra_excludes, vec!["node_modules/", "*.log"]);
}

#[rstest]
#[tokio::test]
async fn missing_host_is_actionable(project_dir: TempDir) {
    let path = path_of(&project_dir);
    let _guard = EnvGuard::set_vars(&[
        ("HOIST_TARGET_HOST", ""),
        ("HOIST_APP_NAME", "shop"),
        ("HOIST_APP_INTERNAL_PORT", "3000"),
        ("HOIST_APP_PROJECT_DIR", path.as_str()),
    ])
    .await;

    let err = DeploySettings::load(Operation::Deploy, &Overrides::default())
        .expect_err("host is required");

    let ConfigError::MissingField(message) = err else {
        panic!("expected MissingField, got {err:?}");
    };
    assert!(message.contains("HOIST_TARGET_HOST"), "{message}");
    assert!(message.contains("hoist.toml"), "{message}");
    assert!(message.contains("[target]"), "{message}");
}

#[rstest]
#[tokio::test]
async fn cleanup_does_not_need_a_port(project_dir: TempDir) {
    let path = path_of(&project_dir);
    let _guard = EnvGuard::set_vars(&[
        ("HOIST_TARGET_HOST", "198.51.100.7"),
        ("HOIST_APP_NAME", "shop"),
        ("HOIST_APP_PROJECT_DIR", path.as_str()),
    ])
    .await;

    let settings =
        DeploySettings::load(Operation::Cleanup, &Overrides::default()).expect("settings load");

    assert_eq!(settings.app.internal_port, 0);
}
