use super::*;
use crate::provider::{NAME_TAG, USER_TAG, state};
use reqwest::StatusCode;
use rstest::{fixture, rstest};
use scaleway_rs::ScalewayImage;
use std::collections::HashMap;
use types::{ServerEnvelope, VolumeEnvelope, decode_tags, encode_tags, merge_tags};

fn image(id: &str, arch: &str, state: &str, creation_date: &str) -> ScalewayImage {
    ScalewayImage {
        id: id.to_owned(),
        name: String::new(),
        arch: arch.to_owned(),
        creation_date: creation_date.to_owned(),
        modification_date: String::new(),
        from_server: None,
        organization: String::new(),
        public: true,
        state: state.to_owned(),
        project: String::new(),
        tags: vec![],
        zone: String::new(),
        root_volume: scaleway_rs::ScalewayImageRootVolume {
            id: String::new(),
            name: String::new(),
            size: 0,
            volume_type: String::new(),
        },
        default_bootscript: None,
        extra_volumes: scaleway_rs::ScalewayImageExtraVolumes {
            volumes: HashMap::new(),
        },
    }
}

#[fixture]
fn spec() -> LaunchSpec {
    LaunchSpec {
        name: String::from("box"),
        image: String::from("ubuntu-noble"),
        instance_type: String::from("GP1-XS"),
        zone: String::from("fr-par-1"),
        project_id: String::from("proj"),
        architecture: String::from("x86_64"),
        disk_size_gb: None,
        security_group: None,
        user: String::from("ubuntu"),
    }
}

fn dummy_config() -> ScalewayConfig {
    ScalewayConfig {
        access_key: None,
        secret_key: String::from("dummy"),
        default_organization_id: None,
        default_project_id: String::from("proj"),
        default_zone: String::from("fr-par-1"),
        default_instance_type: String::from("DEV1-S"),
        default_image: String::from("img"),
        default_architecture: String::from("x86_64"),
        default_security_group: None,
    }
}

#[rstest]
fn tags_round_trip_through_scaleway_strings() {
    let raw = vec![String::from("Name=box"), String::from("spotkeep")];
    let decoded = decode_tags(&raw);

    assert_eq!(decoded.get(NAME_TAG).map(String::as_str), Some("box"));
    assert_eq!(decoded.get("spotkeep").map(String::as_str), Some(""));
    assert_eq!(encode_tags(&decoded), vec!["Name=box", "spotkeep"]);
}

#[rstest]
fn merge_removes_keys_with_empty_values() {
    let current = decode_tags(&[String::from("Name=box"), String::from("user=root")]);
    let update = Tags::from([
        (NAME_TAG.to_owned(), String::new()),
        (String::from("role"), String::from("gpu")),
    ]);

    let merged = merge_tags(&current, &update);

    assert!(!merged.contains_key(NAME_TAG));
    assert_eq!(merged.get(USER_TAG).map(String::as_str), Some("root"));
    assert_eq!(merged.get("role").map(String::as_str), Some("gpu"));
}

#[rstest]
#[case("starting", state::PENDING, SpotStatus::Fulfilled)]
#[case("running", state::RUNNING, SpotStatus::Fulfilled)]
#[case("stopped in place", state::STOPPED, SpotStatus::TerminatedByUser)]
#[case("locked", state::ERROR, SpotStatus::Other(String::from("locked")))]
fn server_states_map_to_neutral_states(
    #[case] raw: &str,
    #[case] neutral: &str,
    #[case] spot: SpotStatus,
) {
    let server_state = types::ServerState::from(raw);
    assert_eq!(server_state.neutral(), neutral);
    assert_eq!(server_state.spot_status(), spot);
}

#[rstest]
fn server_body_becomes_instance_record() {
    let body = r#"{"server": {
        "id": "srv-1",
        "state": "running",
        "commercial_type": "GP1-XS",
        "creation_date": "2026-01-02T03:04:05Z",
        "tags": ["Name=box", "user=ubuntu"],
        "public_ip": {"address": "51.15.0.7"},
        "volumes": {"1": {"id": "vol-b"}, "0": {"id": "vol-a"}}
    }}"#;
    let envelope: ServerEnvelope = serde_json::from_str(body).expect("valid fixture");

    assert_eq!(envelope.server.volume_ids(), vec!["vol-a", "vol-b"]);
    let record = envelope.server.into_record();
    assert_eq!(record.kind, ResourceKind::Instance);
    assert_eq!(record.name(), "box");
    assert_eq!(record.state, state::RUNNING);
    assert_eq!(record.instance_type.as_deref(), Some("GP1-XS"));
    assert_eq!(record.public_ip, "51.15.0.7".parse().ok());
}

#[rstest]
#[case(
    r#"{"volume": {"id": "v", "state": "available", "server": {"id": "srv"}}}"#,
    state::IN_USE,
    Some("srv")
)]
#[case(r#"{"volume": {"id": "v", "state": "available", "server": null}}"#, state::AVAILABLE, None)]
fn volume_attachment_drives_disk_state(
    #[case] body: &str,
    #[case] expected: &str,
    #[case] attached: Option<&str>,
) {
    let envelope: VolumeEnvelope = serde_json::from_str(body).expect("valid fixture");
    let record = envelope.volume.into_record();
    assert_eq!(record.state, expected);
    assert_eq!(record.attached_to.as_deref(), attached);
}

#[rstest]
fn products_expose_selector_attributes() {
    let body = r#"{"servers": {"GPU-3070-S": {
        "ncpus": 8, "ram": 17179869184, "gpu": 1, "hourly_price": 0.98
    }}}"#;
    let envelope: ProductsEnvelope = serde_json::from_str(body).expect("valid fixture");
    let product = envelope.servers.get("GPU-3070-S").expect("product present");

    let attributes = product.attributes();
    assert_eq!(attributes.get(crate::selector::VCPU), Some(&8.0));
    assert_eq!(attributes.get(types::MEMORY_GIB), Some(&16.0));
    assert_eq!(attributes.get(types::GPU), Some(&1.0));
}

#[rstest]
fn api_errors_prefer_the_api_message() {
    let body = br#"{"type": "invalid_arguments", "message": "commercial_type is invalid"}"#;
    let err = rest::api_error(StatusCode::BAD_REQUEST, body);
    assert_eq!(
        err,
        ScalewayProviderError::Api {
            status: 400,
            message: String::from("commercial_type is invalid"),
        }
    );

    let plain = rest::api_error(StatusCode::BAD_GATEWAY, b"upstream down");
    assert!(plain.to_string().contains("upstream down"));
}

#[rstest]
fn selects_newest_available_image_for_architecture(spec: LaunchSpec) {
    let candidates = vec![
        image("old", "x86_64", "available", "2025-01-01"),
        image("new", "x86_64", "available", "2026-01-01"),
        image("arm", "arm64", "available", "2026-06-01"),
        image("busy", "x86_64", "creating", "2026-09-01"),
    ];

    let chosen = ScalewayProvider::select_image_id(candidates, &spec).expect("image found");
    assert_eq!(chosen, "new");
}

#[rstest]
fn missing_image_reports_label_and_zone(spec: LaunchSpec) {
    let err = ScalewayProvider::select_image_id(Vec::new(), &spec).expect_err("no image");
    assert_eq!(
        err,
        ScalewayProviderError::ImageNotFound {
            label: String::from("ubuntu-noble"),
            arch: String::from("x86_64"),
            zone: String::from("fr-par-1"),
        }
    );
}

#[rstest]
fn server_payload_carries_name_tags_and_disk_size(mut spec: LaunchSpec) {
    spec.disk_size_gb = Some(40);
    let payload = ScalewayProvider::server_payload(&spec, String::from("img-id"));

    assert_eq!(payload.name, "box");
    assert_eq!(payload.tags, vec!["Name=box", "user=ubuntu"]);
    let root = payload
        .volumes
        .as_ref()
        .and_then(|volumes| volumes.get("0"))
        .expect("root volume template");
    assert_eq!(root.size, 40_000_000_000);
}

#[rstest]
#[tokio::test]
async fn launches_outside_the_configured_zone_are_rejected(mut spec: LaunchSpec) {
    spec.zone = String::from("nl-ams-1");
    let provider = ScalewayProvider::new(dummy_config()).expect("valid config");

    let err = provider
        .create_instance(&spec)
        .await
        .expect_err("zone mismatch");

    assert!(matches!(err, ScalewayProviderError::ZoneMismatch { .. }));
}

#[rstest]
fn collections_follow_api_paths() {
    assert_eq!(collection(ResourceKind::Instance), "servers");
    assert_eq!(collection(ResourceKind::Disk), "volumes");
    assert_eq!(collection(ResourceKind::Snapshot), "snapshots");
    assert_eq!(collection(ResourceKind::Image), "images");
}
