use super::*;
use crate::provider::ResourceKind;
use crate::spec_store::SpecTemplate;
use crate::test_support::{FakeProvider, ScriptedShell, StaticSpecs};
use rstest::{fixture, rstest};
use std::net::Ipv4Addr;

#[fixture]
fn defaults() -> LaunchDefaults {
    LaunchDefaults {
        image: String::from("ubuntu-noble"),
        instance_type: String::from("DEV1-S"),
        zone: String::from("fr-par-1"),
        project_id: String::from("project"),
        architecture: String::from("x86_64"),
        security_group: None,
        user: String::from("root"),
    }
}

fn controller(
    provider: &FakeProvider,
    shell: &ScriptedShell,
    specs: StaticSpecs,
    defaults: LaunchDefaults,
) -> InstanceController<FakeProvider, ScriptedShell> {
    InstanceController::new(Context {
        provider: Arc::new(provider.clone()),
        shell: Arc::new(shell.clone()),
        specs: Arc::new(specs),
        defaults,
        settings: LifecycleConfig::default(),
    })
}

#[rstest]
#[tokio::test]
async fn resolve_spec_uses_newest_available_image(defaults: LaunchDefaults) {
    let provider = FakeProvider::new();
    let _older = provider.seed(ResourceKind::Image, "box", state::AVAILABLE);
    let newest = provider.seed(ResourceKind::Image, "box", state::AVAILABLE);
    let _in_progress = provider.seed(ResourceKind::Image, "box", state::CREATING);
    let specs = StaticSpecs::new().with(
        "box",
        SpecTemplate {
            instance_type: Some(String::from("GP1-XS")),
            ..SpecTemplate::default()
        },
    );
    let instances = controller(&provider, &ScriptedShell::new(), specs, defaults);

    let spec = instances
        .resolve_spec("box", None)
        .await
        .expect("spec resolves");

    assert_eq!(spec.image, newest);
    assert_eq!(spec.instance_type, "GP1-XS");
    assert_eq!(spec.zone, "fr-par-1");
}

#[rstest]
#[tokio::test]
async fn resolve_spec_applies_override_and_template_image(defaults: LaunchDefaults) {
    let provider = FakeProvider::new();
    let instances = controller(&provider, &ScriptedShell::new(), StaticSpecs::new(), defaults);

    let spec = instances
        .resolve_spec("fresh", Some("RENDER-S"))
        .await
        .expect("spec resolves");

    assert_eq!(spec.image, "ubuntu-noble");
    assert_eq!(spec.instance_type, "RENDER-S");
    assert_eq!(spec.name, "fresh");
}

#[rstest]
#[tokio::test]
async fn resolve_spec_rejects_blank_name(defaults: LaunchDefaults) {
    let provider = FakeProvider::new();
    let instances = controller(&provider, &ScriptedShell::new(), StaticSpecs::new(), defaults);

    let err = instances
        .resolve_spec(" ", None)
        .await
        .expect_err("blank name");

    assert!(matches!(err, LifecycleError::EmptyName));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn create_binds_name_and_user(defaults: LaunchDefaults) {
    let provider = FakeProvider::new();
    let instances = controller(&provider, &ScriptedShell::new(), StaticSpecs::new(), defaults);
    let spec = instances
        .resolve_spec("box", None)
        .await
        .expect("spec resolves");

    let handle = instances.create(&spec).await.expect("create succeeds");

    let record = handle.record(&provider).await.expect("instance exists");
    assert_eq!(record.name(), "box");
    assert_eq!(record.tags.get(USER_TAG).map(String::as_str), Some("root"));
    assert_eq!(record.state, state::RUNNING);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn post_launch_waits_for_shell_then_configures(defaults: LaunchDefaults) {
    let provider = FakeProvider::new();
    let shell = ScriptedShell::new();
    shell.unreachable_for(2);
    shell.push_exit_code(0);
    let instances = controller(&provider, &shell, StaticSpecs::new(), defaults);
    let spec = instances
        .resolve_spec("box", Some("RENDER-S"))
        .await
        .expect("spec resolves");
    let handle = instances.create(&spec).await.expect("create succeeds");

    instances
        .post_launch(&handle)
        .await
        .expect("post launch succeeds");

    let commands = shell.commands();
    assert_eq!(
        commands.iter().filter(|c| c.as_str() == "runlevel").count(),
        3
    );
    assert!(commands.contains(&String::from(
        "sudo sh -c 'ln -sf /usr/share/zoneinfo/Europe/London /etc/localtime'"
    )));
    assert!(commands.contains(&String::from("sudo sh -c 'nvidia-smi -pm 1'")));
    assert_eq!(provider.named(ResourceKind::Disk, "box").len(), 1);
}

#[rstest]
#[case("RENDER-S", 3)]
#[case("render-s", 3)]
#[case("H100-1-80G", 1)]
#[case("DEV1-S", 0)]
fn tuning_is_keyed_by_class_prefix(#[case] instance_type: &str, #[case] expected: usize) {
    assert_eq!(tuning_commands(instance_type).len(), expected);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn terminate_is_idempotent(defaults: LaunchDefaults) {
    let provider = FakeProvider::new();
    let instances = controller(&provider, &ScriptedShell::new(), StaticSpecs::new(), defaults);
    let spec = instances
        .resolve_spec("box", None)
        .await
        .expect("spec resolves");
    let mut handle = instances.create(&spec).await.expect("create succeeds");
    let id = handle.id().map(str::to_owned).expect("bound");

    instances
        .terminate(&mut handle, true)
        .await
        .expect("first terminate");
    instances
        .terminate(&mut handle, true)
        .await
        .expect("second terminate is soft");

    let terminations = provider
        .calls()
        .into_iter()
        .filter(|call| call == &format!("terminate instance {id}"))
        .count();
    assert_eq!(terminations, 1);
    assert!(provider.records(ResourceKind::Disk).is_empty());
    assert!(provider.named(ResourceKind::Instance, "box").is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn stop_enables_feature_once_stopped(defaults: LaunchDefaults) {
    let provider = FakeProvider::new();
    let instances = controller(&provider, &ScriptedShell::new(), StaticSpecs::new(), defaults);
    let spec = instances
        .resolve_spec("box", None)
        .await
        .expect("spec resolves");
    let mut handle = instances.create(&spec).await.expect("create succeeds");
    let id = handle.id().map(str::to_owned).expect("bound");

    let saved = instances
        .stop(&mut handle, false, Some("ena"))
        .await
        .expect("stop succeeds");

    assert!(saved.is_none());
    assert_eq!(provider.features(), vec![(id, String::from("ena"))]);
    assert_eq!(
        handle.state(&provider).await.expect("still exists"),
        state::STOPPED
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn stop_with_save_terminates_after_saving(defaults: LaunchDefaults) {
    let provider = FakeProvider::new();
    let instances = controller(&provider, &ScriptedShell::new(), StaticSpecs::new(), defaults);
    let spec = instances
        .resolve_spec("box", None)
        .await
        .expect("spec resolves");
    let mut handle = instances.create(&spec).await.expect("create succeeds");

    let saved = instances
        .stop(&mut handle, true, None)
        .await
        .expect("stop succeeds")
        .expect("artefacts returned");

    assert_eq!(provider.named(ResourceKind::Image, "box").len(), 1);
    assert_eq!(provider.named(ResourceKind::Snapshot, "box").len(), 1);
    assert!(provider.records(ResourceKind::Disk).is_empty());
    assert!(saved.image.is_bound());
    assert_eq!(
        handle.state(&provider).await.expect("record kept"),
        state::TERMINATED
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn set_address_by_index(defaults: LaunchDefaults) {
    let provider = FakeProvider::new();
    let reserved = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
    provider.set_addresses(vec![reserved]);
    let instances = controller(&provider, &ScriptedShell::new(), StaticSpecs::new(), defaults);
    let spec = instances
        .resolve_spec("box", None)
        .await
        .expect("spec resolves");
    let handle = instances.create(&spec).await.expect("create succeeds");

    let err = instances
        .set_address(&handle, AddressChoice::Index(1))
        .await
        .expect_err("index out of range");
    assert!(matches!(
        err,
        LifecycleError::AddressIndex {
            index: 1,
            available: 1
        }
    ));

    let address = instances
        .set_address(&handle, AddressChoice::Index(0))
        .await
        .expect("associate succeeds");
    assert_eq!(address, reserved);
    assert_eq!(provider.associations().len(), 1);
}

#[rstest]
#[case("203.0.113.7", AddressChoice::Address(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))))]
#[case(" 2 ", AddressChoice::Index(2))]
fn address_choice_parses(#[case] input: &str, #[case] expected: AddressChoice) {
    assert_eq!(input.parse::<AddressChoice>(), Ok(expected));
}

#[rstest]
fn address_choice_rejects_garbage() {
    assert!("eth0".parse::<AddressChoice>().is_err());
}
