//! Volumes, snapshots, images, and the tag operations shared by every kind.

use reqwest::Method;
use uuid::Uuid;

use crate::provider::{ResourceKind, ResourceRecord, TagFilter, Tags};

use super::rest::PAGE_SIZE;
use super::types::{
    CreateImageRequest, CreateSnapshotRequest, ImageEnvelope, ImagesEnvelope, ServerBody,
    ServerEnvelope, ServersEnvelope, SnapshotEnvelope, SnapshotsEnvelope, TagsPatch, VolumeBody,
    VolumeEnvelope, VolumesEnvelope, encode_tags, merge_tags,
};
use super::{ScalewayProvider, ScalewayProviderError};

/// Path segment of the collection holding `kind`.
pub(super) const fn collection(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Instance => "servers",
        ResourceKind::Disk => "volumes",
        ResourceKind::Snapshot => "snapshots",
        ResourceKind::Image => "images",
    }
}

impl ScalewayProvider {
    // TODO: follow `X-Total-Count` past the first page once projects hold
    // more than PAGE_SIZE resources of one kind.
    pub(super) async fn list_records(
        &self,
        kind: ResourceKind,
        filter: &TagFilter,
    ) -> Result<Vec<ResourceRecord>, ScalewayProviderError> {
        let mut query = vec![
            ("per_page", PAGE_SIZE.to_owned()),
            ("project", self.config.default_project_id.clone()),
        ];
        if !filter.tags.is_empty() {
            query.push(("tags", encode_tags(&filter.tags).join(",")));
        }
        let path = collection(kind);
        let mut records: Vec<ResourceRecord> = match kind {
            ResourceKind::Instance => self
                .list_json::<ServersEnvelope>(path, &query)
                .await?
                .servers
                .into_iter()
                .map(ServerBody::into_record)
                .collect(),
            ResourceKind::Disk => self
                .list_json::<VolumesEnvelope>(path, &query)
                .await?
                .volumes
                .into_iter()
                .map(VolumeBody::into_record)
                .collect(),
            ResourceKind::Snapshot => self
                .list_json::<SnapshotsEnvelope>(path, &query)
                .await?
                .snapshots
                .into_iter()
                .map(|body| body.into_record(kind))
                .collect(),
            ResourceKind::Image => self
                .list_json::<ImagesEnvelope>(path, &query)
                .await?
                .images
                .into_iter()
                .map(|body| body.into_record(kind))
                .collect(),
        };
        records.retain(|record| filter.matches(&record.tags));
        records.sort_by(|lhs, rhs| lhs.created_at.cmp(&rhs.created_at));
        Ok(records)
    }

    pub(super) async fn describe_record(
        &self,
        kind: ResourceKind,
        id: &str,
    ) -> Result<Option<ResourceRecord>, ScalewayProviderError> {
        let path = format!("{}/{id}", collection(kind));
        let record = match kind {
            ResourceKind::Instance => self
                .get_json::<ServerEnvelope>(&path)
                .await?
                .map(|envelope| envelope.server.into_record()),
            ResourceKind::Disk => self
                .get_json::<VolumeEnvelope>(&path)
                .await?
                .map(|envelope| envelope.volume.into_record()),
            ResourceKind::Snapshot => self
                .get_json::<SnapshotEnvelope>(&path)
                .await?
                .map(|envelope| envelope.snapshot.into_record(kind)),
            ResourceKind::Image => self
                .get_json::<ImageEnvelope>(&path)
                .await?
                .map(|envelope| envelope.image.into_record(kind)),
        };
        Ok(record)
    }

    pub(super) async fn merge_record_tags(
        &self,
        kind: ResourceKind,
        id: &str,
        update: &Tags,
    ) -> Result<(), ScalewayProviderError> {
        let current = self
            .describe_record(kind, id)
            .await?
            .ok_or_else(|| ScalewayProviderError::NotFound {
                kind,
                id: id.to_owned(),
            })?;
        let merged = merge_tags(&current.tags, update);
        let body = TagsPatch {
            tags: encode_tags(&merged),
        };
        self.patch(&format!("{}/{id}", collection(kind)), &body).await
    }

    pub(super) async fn snapshot_volume(
        &self,
        volume_id: &str,
    ) -> Result<ResourceRecord, ScalewayProviderError> {
        let body = CreateSnapshotRequest {
            name: format!("spotkeep-{}", Uuid::new_v4()),
            volume_id: volume_id.to_owned(),
            project: self.config.default_project_id.clone(),
        };
        let created: SnapshotEnvelope = self
            .send_json(Method::POST, collection(ResourceKind::Snapshot), &body)
            .await?;
        tracing::debug!(volume = volume_id, snapshot = %created.snapshot.id, "snapshot started");
        Ok(created.snapshot.into_record(ResourceKind::Snapshot))
    }

    pub(super) async fn image_from_snapshot(
        &self,
        snapshot_id: &str,
        label: &str,
    ) -> Result<ResourceRecord, ScalewayProviderError> {
        let body = CreateImageRequest {
            name: label.to_owned(),
            root_volume: snapshot_id.to_owned(),
            arch: self.config.default_architecture.clone(),
            project: self.config.default_project_id.clone(),
        };
        let created: ImageEnvelope = self
            .send_json(Method::POST, collection(ResourceKind::Image), &body)
            .await?;
        Ok(created.image.into_record(ResourceKind::Image))
    }

    pub(super) async fn volume_records(
        &self,
        instance_id: &str,
    ) -> Result<Vec<ResourceRecord>, ScalewayProviderError> {
        let mut disks = Vec::new();
        for volume_id in self.server_volumes(instance_id).await? {
            if let Some(disk) = self.describe_record(ResourceKind::Disk, &volume_id).await? {
                disks.push(disk);
            }
        }
        Ok(disks)
    }
}
