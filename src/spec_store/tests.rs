use super::*;
use rstest::{fixture, rstest};
use tempfile::TempDir;

#[fixture]
fn defaults() -> LaunchDefaults {
    LaunchDefaults {
        image: String::from("Ubuntu 24.04 Noble Numbat"),
        instance_type: String::from("DEV1-S"),
        zone: String::from("fr-par-1"),
        project_id: String::from("proj"),
        architecture: String::from("x86_64"),
        security_group: None,
        user: String::from("root"),
    }
}

fn store_with(files: &[(&str, &str)]) -> (TempDir, SpecStore) {
    let tmp = TempDir::new().expect("tempdir");
    for (file, contents) in files {
        std::fs::write(tmp.path().join(file), contents).expect("write template");
    }
    let dir = tmp.path().to_str().expect("utf8 temp path").to_owned();
    (tmp, SpecStore::new(&dir))
}

#[test]
fn per_name_template_wins_over_default() {
    let (_tmp, store) = store_with(&[
        ("gpu.toml", "instance_type = \"GPU-3070-S\"\n"),
        ("default.toml", "instance_type = \"DEV1-M\"\n"),
    ]);

    let template = store.load("gpu").expect("template loads");
    assert_eq!(template.instance_type.as_deref(), Some("GPU-3070-S"));
}

#[test]
fn default_template_used_when_name_missing() {
    let (_tmp, store) = store_with(&[("default.toml", "zone = \"nl-ams-1\"\n")]);

    let template = store.load("other").expect("template loads");
    assert_eq!(template.zone.as_deref(), Some("nl-ams-1"));
}

#[test]
fn missing_directory_yields_empty_template() {
    let store = SpecStore::new("/nonexistent/spotkeep/specs");
    assert_eq!(store.load("box"), Ok(SpecTemplate::default()));
}

#[rstest]
#[case("../etc/passwd")]
#[case(".hidden")]
#[case("")]
fn unsafe_names_are_rejected(#[case] name: &str) {
    let (_tmp, store) = store_with(&[]);
    let err = store.load(name).expect_err("name should be rejected");
    assert!(matches!(err, SpecError::InvalidName { .. }));
}

#[test]
fn unknown_keys_are_parse_errors() {
    let (_tmp, store) = store_with(&[("box.toml", "colour = \"blue\"\n")]);
    let err = store.load("box").expect_err("unknown key should fail");
    assert!(matches!(err, SpecError::Parse { .. }));
}

#[rstest]
fn layer_prefers_template_values(defaults: LaunchDefaults) {
    let template = SpecTemplate {
        instance_type: Some(String::from("PRO2-S")),
        disk_size_gb: Some(40),
        ..SpecTemplate::default()
    };

    let spec = template.layer(&defaults, "box");

    assert_eq!(spec.name, "box");
    assert_eq!(spec.instance_type, "PRO2-S");
    assert_eq!(spec.image, "Ubuntu 24.04 Noble Numbat");
    assert_eq!(spec.disk_size_gb, Some(40));
    assert_eq!(spec.user, "root");
}
