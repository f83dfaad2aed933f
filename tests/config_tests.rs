//! Tests for configuration validation and the values derived from it.

use std::time::Duration;

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use rstest::*;
use spotkeep::config::ConfigError;
use spotkeep::{LifecycleConfig, SaveOrdering, ScalewayConfig, SpecSource, SpecStore};
use tempfile::TempDir;

#[fixture]
fn valid_config() -> ScalewayConfig {
    ScalewayConfig {
        access_key: Some(String::from("SCWACCESSKEYEXAMPLE")),
        secret_key: String::from("SCWSECRETKEYEXAMPLE"),
        default_organization_id: None,
        default_project_id: String::from("11111111-2222-3333-4444-555555555555"),
        default_zone: String::from("fr-par-1"),
        default_instance_type: String::from("DEV1-S"),
        default_image: String::from("Ubuntu 24.04 Noble Numbat"),
        default_architecture: String::from("x86_64"),
        default_security_group: None,
    }
}

#[rstest]
fn config_validation_rejects_missing_secret_with_actionable_error(valid_config: ScalewayConfig) {
    let cfg = ScalewayConfig {
        secret_key: String::new(),
        ..valid_config
    };

    let error = cfg.validate().expect_err("secret is required");
    let ConfigError::MissingField(ref message) = error else {
        panic!("expected MissingField error");
    };
    assert!(message.contains("SCW_SECRET_KEY"), "{message}");
    assert!(message.contains("spotkeep.toml"), "{message}");
    assert!(message.contains("secret_key"), "{message}");
}

#[rstest]
#[case::project(
    |cfg: &mut ScalewayConfig| cfg.default_project_id.clear(),
    "SCW_DEFAULT_PROJECT_ID",
    "default_project_id"
)]
#[case::image(
    |cfg: &mut ScalewayConfig| cfg.default_image.clear(),
    "SCW_DEFAULT_IMAGE",
    "default_image"
)]
#[case::instance_type(
    |cfg: &mut ScalewayConfig| cfg.default_instance_type.clear(),
    "SCW_DEFAULT_INSTANCE_TYPE",
    "default_instance_type"
)]
#[case::zone(
    |cfg: &mut ScalewayConfig| cfg.default_zone.clear(),
    "SCW_DEFAULT_ZONE",
    "default_zone"
)]
#[case::architecture(
    |cfg: &mut ScalewayConfig| cfg.default_architecture.clear(),
    "SCW_DEFAULT_ARCHITECTURE",
    "default_architecture"
)]
fn config_validation_names_env_var_and_key(
    valid_config: ScalewayConfig,
    #[case] mutate: fn(&mut ScalewayConfig),
    #[case] env_var: &str,
    #[case] toml_key: &str,
) {
    let mut cfg = valid_config;
    mutate(&mut cfg);

    let message = cfg.validate().expect_err("validation should fail").to_string();

    assert!(message.contains(env_var), "{message}");
    assert!(message.contains(toml_key), "{message}");
}

#[rstest]
fn launch_defaults_follow_provider_config(valid_config: ScalewayConfig) {
    let defaults = valid_config.launch_defaults("ubuntu");

    assert_eq!(defaults.image, valid_config.default_image);
    assert_eq!(defaults.instance_type, "DEV1-S");
    assert_eq!(defaults.zone, "fr-par-1");
    assert_eq!(defaults.project_id, valid_config.default_project_id);
    assert_eq!(defaults.user, "ubuntu");
}

#[rstest]
fn lifecycle_defaults_validate() {
    let settings = LifecycleConfig::default();

    settings.validate().expect("defaults are valid");
    assert_eq!(settings.save_ordering(), Ok(SaveOrdering::TerminateFirst));
    assert_eq!(settings.poll_interval(), Duration::from_secs(5));
}

#[rstest]
fn service_waits_poll_at_the_provider_interval() {
    let settings = LifecycleConfig {
        poll_interval_secs: 7,
        shell_retry_secs: 1,
        ..LifecycleConfig::default()
    };

    let service = settings.service_waiter();
    assert_eq!(service.interval(), Duration::from_secs(7));
    assert_eq!(service.max_attempts(), None);
    assert_eq!(settings.shell_waiter().interval(), Duration::from_secs(1));
}

#[rstest]
fn lifecycle_rejects_zero_poll_interval() {
    let settings = LifecycleConfig {
        poll_interval_secs: 0,
        ..LifecycleConfig::default()
    };

    let err = settings.validate().expect_err("zero interval stalls polling");
    assert!(
        matches!(err, ConfigError::Invalid { ref field, .. } if field == "poll_interval_secs"),
        "{err}"
    );
}

#[rstest]
#[case("save-first", Some(SaveOrdering::SaveFirst))]
#[case(" TERMINATE-FIRST ", Some(SaveOrdering::TerminateFirst))]
#[case("whenever", None)]
fn lifecycle_parses_save_ordering(#[case] raw: &str, #[case] expected: Option<SaveOrdering>) {
    let settings = LifecycleConfig {
        save_ordering: raw.to_owned(),
        ..LifecycleConfig::default()
    };

    assert_eq!(settings.save_ordering().ok(), expected);
    assert_eq!(settings.validate().is_ok(), expected.is_some());
}

#[tokio::test]
async fn spec_store_expands_tilde_in_spec_dir() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let home = tmp.path().to_string_lossy().to_string();
    let _guard = spotkeep::test_support::EnvGuard::set_vars(&[("HOME", home.as_str())]).await;

    let tmp_root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("temp home dir should be utf8: {}", path.display()));
    let fs = Dir::open_ambient_dir(&tmp_root, ambient_authority())
        .unwrap_or_else(|err| panic!("open temp home dir: {err}"));
    fs.create_dir_all("specs")
        .unwrap_or_else(|err| panic!("create specs dir: {err}"));
    fs.write("specs/dev.toml", "instance_type = \"GP1-S\"\ndisk_size_gb = 40\n")
        .unwrap_or_else(|err| panic!("write template: {err}"));

    let store = SpecStore::new("~/specs");
    let template = store
        .load("dev")
        .unwrap_or_else(|err| panic!("template loads: {err}"));

    assert_eq!(store.dir(), tmp_root.join("specs"));
    assert_eq!(template.instance_type.as_deref(), Some("GP1-S"));
    assert_eq!(template.disk_size_gb, Some(40));
}
