use super::*;
use crate::test_support::FakeProvider;
use rstest::{fixture, rstest};

#[fixture]
fn settings() -> LifecycleConfig {
    LifecycleConfig::default()
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn create_copy_waits_and_names_snapshot(settings: LifecycleConfig) {
    let provider = FakeProvider::new();
    let disk_id = provider.seed(ResourceKind::Disk, "box", state::AVAILABLE);
    let disk = ResourceHandle::<Disk>::bound(disk_id);
    let chain = DiskChain::new(&provider, &settings);

    let snapshot = chain
        .create_copy(&disk, "box")
        .await
        .expect("snapshot should complete");

    let record = snapshot.record(&provider).await.expect("snapshot exists");
    assert_eq!(record.name(), "box");
    assert_eq!(record.state, state::AVAILABLE);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn promote_uses_throwaway_label(settings: LifecycleConfig) {
    let provider = FakeProvider::new();
    let snapshot_id = provider.seed(ResourceKind::Snapshot, "box", state::AVAILABLE);
    let chain = DiskChain::new(&provider, &settings);

    let image = chain
        .promote_to_image(&ResourceHandle::bound(snapshot_id), "box")
        .await
        .expect("image should register");

    let id = image.id().expect("image is bound");
    let label = provider.image_label(id).expect("label recorded");
    assert!(label.starts_with("spotkeep-"), "unexpected label {label}");
    assert_ne!(label, "box");
    assert_eq!(image.name(&provider).await.expect("name readable"), "box");
}

#[rstest]
#[tokio::test]
async fn retire_keeps_only_newest(settings: LifecycleConfig) {
    let provider = FakeProvider::new();
    let _oldest = provider.seed(ResourceKind::Image, "box", state::AVAILABLE);
    let _older = provider.seed(ResourceKind::Image, "box", state::AVAILABLE);
    let newest = provider.seed(ResourceKind::Image, "box", state::AVAILABLE);
    let _unrelated = provider.seed(ResourceKind::Image, "other", state::AVAILABLE);
    let chain = DiskChain::new(&provider, &settings);

    let retired = chain
        .retire_superseded::<Image>("box")
        .await
        .expect("retire should succeed");

    assert_eq!(retired, 2);
    let remaining = provider.named(ResourceKind::Image, "box");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining.first().map(|r| r.id.as_str()), Some(newest.as_str()));
    assert_eq!(provider.named(ResourceKind::Image, "other").len(), 1);
}

#[rstest]
#[tokio::test]
async fn retire_waits_for_newest_to_be_usable(settings: LifecycleConfig) {
    let provider = FakeProvider::new();
    let _usable = provider.seed(ResourceKind::Image, "box", state::AVAILABLE);
    let _in_progress = provider.seed(ResourceKind::Image, "box", state::CREATING);
    let chain = DiskChain::new(&provider, &settings);

    let retired = chain
        .retire_superseded::<Image>("box")
        .await
        .expect("retire should succeed");

    assert_eq!(retired, 0);
    assert_eq!(provider.named(ResourceKind::Image, "box").len(), 2);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn save_keeps_one_image_and_adds_a_snapshot(settings: LifecycleConfig) {
    let provider = FakeProvider::new();
    let old_snapshot = provider.seed(ResourceKind::Snapshot, "box", state::AVAILABLE);
    let _old_image = provider.seed(ResourceKind::Image, "box", state::AVAILABLE);
    let disk_id = provider.seed(ResourceKind::Disk, "box", state::AVAILABLE);
    let disk = ResourceHandle::<Disk>::bound(disk_id);
    let chain = DiskChain::new(&provider, &settings);

    let saved = chain.save(&disk, "box").await.expect("save should succeed");

    let images = provider.named(ResourceKind::Image, "box");
    let snapshots = provider.named(ResourceKind::Snapshot, "box");
    assert_eq!(images.len(), 1);
    assert_eq!(images.first().map(|r| r.id.as_str()), saved.image.id());
    let snapshot_ids: Vec<&str> = snapshots.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(snapshot_ids.len(), 2);
    assert_eq!(snapshot_ids.first().copied(), Some(old_snapshot.as_str()));
    assert_eq!(snapshot_ids.last().copied(), saved.snapshot.id());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn repeated_saves_accumulate_snapshots(settings: LifecycleConfig) {
    let provider = FakeProvider::new();
    let chain = DiskChain::new(&provider, &settings);

    for _ in 0..2 {
        let disk_id = provider.seed(ResourceKind::Disk, "box", state::AVAILABLE);
        chain
            .save(&ResourceHandle::bound(disk_id), "box")
            .await
            .expect("save should succeed");
    }

    assert_eq!(provider.named(ResourceKind::Snapshot, "box").len(), 2);
    assert_eq!(provider.named(ResourceKind::Image, "box").len(), 1);
}

#[rstest]
#[tokio::test]
async fn save_failure_keeps_disk_named(settings: LifecycleConfig) {
    let provider = FakeProvider::new();
    provider.fail_snapshots(true);
    let disk_id = provider.seed(ResourceKind::Disk, "box", state::AVAILABLE);
    let disk = ResourceHandle::<Disk>::bound(disk_id);
    let chain = DiskChain::new(&provider, &settings);

    let err = chain.save(&disk, "box").await.expect_err("snapshot fails");

    assert!(matches!(err, LifecycleError::Provider(_)));
    assert_eq!(provider.named(ResourceKind::Disk, "box").len(), 1);
}

#[rstest]
#[tokio::test]
async fn delete_disk_releases_name_then_deletes(settings: LifecycleConfig) {
    let provider = FakeProvider::new();
    let id = provider.seed(ResourceKind::Disk, "box", state::AVAILABLE);
    let mut disk = ResourceHandle::<Disk>::bound(id.clone());
    let chain = DiskChain::new(&provider, &settings);

    chain.delete_disk(&mut disk).await.expect("delete should succeed");

    assert!(provider.record(ResourceKind::Disk, &id).is_none());
    let calls = provider.calls();
    let tag_at = calls.iter().position(|c| c == &format!("tag disk {id}"));
    let delete_at = calls.iter().position(|c| c == &format!("delete disk {id}"));
    assert!(tag_at < delete_at, "name must be released before delete: {calls:?}");

    chain
        .delete_disk(&mut disk)
        .await
        .expect("second delete is a soft no-op");
}
