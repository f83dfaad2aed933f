//! Server creation, power, and teardown.
//!
//! Servers are created stopped and powered on explicitly. Termination powers
//! a server off and deletes it without the `terminate` action, so its
//! volumes survive detached for the save chain.

use std::time::Instant;

use reqwest::Method;
use scaleway_rs::{ScalewayImage, ScalewayListInstanceImagesBuilder};
use tokio::time::sleep;
use uuid::Uuid;

use crate::provider::{LaunchSpec, NAME_TAG, ResourceKind, ResourceRecord, Tags, USER_TAG};

use super::types::{
    CreateServerRequest, RootVolumeTemplate, ServerBody, ServerEnvelope, encode_tags,
};
use super::{ScalewayProvider, ScalewayProviderError};

const BYTES_PER_GB: u64 = 1_000_000_000;

impl ScalewayProvider {
    pub(super) async fn fetch_server(
        &self,
        id: &str,
    ) -> Result<Option<ServerBody>, ScalewayProviderError> {
        Ok(self
            .get_json::<ServerEnvelope>(&format!("servers/{id}"))
            .await?
            .map(|envelope| envelope.server))
    }

    async fn require_server(&self, id: &str) -> Result<ServerBody, ScalewayProviderError> {
        self.fetch_server(id)
            .await?
            .ok_or_else(|| ScalewayProviderError::NotFound {
                kind: ResourceKind::Instance,
                id: id.to_owned(),
            })
    }

    /// Accepts an image id as-is; resolves anything else as a label.
    pub(super) async fn resolve_image_id(
        &self,
        spec: &LaunchSpec,
    ) -> Result<String, ScalewayProviderError> {
        if Uuid::parse_str(&spec.image).is_ok() {
            return Ok(spec.image.clone());
        }
        let project_images =
            ScalewayListInstanceImagesBuilder::new(self.api.clone(), self.zone.as_str())
                .public(false)
                .project(&spec.project_id)
                .name(&spec.image)
                .arch(&spec.architecture)
                .run_async()
                .await?;
        let candidates = if project_images.is_empty() {
            ScalewayListInstanceImagesBuilder::new(self.api.clone(), self.zone.as_str())
                .public(true)
                .name(&spec.image)
                .arch(&spec.architecture)
                .run_async()
                .await?
        } else {
            project_images
        };
        Self::select_image_id(candidates, spec)
    }

    pub(super) fn select_image_id(
        candidates: Vec<ScalewayImage>,
        spec: &LaunchSpec,
    ) -> Result<String, ScalewayProviderError> {
        candidates
            .into_iter()
            .filter(|image| image.arch == spec.architecture && image.state == "available")
            .max_by(|lhs, rhs| lhs.creation_date.cmp(&rhs.creation_date))
            .map(|image| image.id)
            .ok_or_else(|| ScalewayProviderError::ImageNotFound {
                label: spec.image.clone(),
                arch: spec.architecture.clone(),
                zone: spec.zone.clone(),
            })
    }

    pub(super) fn server_payload(spec: &LaunchSpec, image_id: String) -> CreateServerRequest {
        let mut tags = Tags::new();
        tags.insert(NAME_TAG.to_owned(), spec.name.clone());
        tags.insert(USER_TAG.to_owned(), spec.user.clone());
        let volumes = spec.disk_size_gb.map(|size| {
            [(
                String::from("0"),
                RootVolumeTemplate {
                    size: size.saturating_mul(BYTES_PER_GB),
                    volume_type: "l_ssd",
                },
            )]
            .into_iter()
            .collect()
        });
        CreateServerRequest {
            name: spec.name.clone(),
            commercial_type: spec.instance_type.clone(),
            image: image_id,
            project: spec.project_id.clone(),
            routed_ip_enabled: true,
            dynamic_ip_required: true,
            tags: encode_tags(&tags),
            volumes,
            security_group: spec.security_group.clone(),
        }
    }

    fn is_instance_type_error(message: &str, spec: &LaunchSpec) -> bool {
        let lowered = message.to_ascii_lowercase();
        lowered.contains("commercial_type")
            || lowered.contains(&spec.instance_type.to_ascii_lowercase())
    }

    /// Creates a server for `spec` and powers it on.
    pub(super) async fn create_server(
        &self,
        spec: &LaunchSpec,
    ) -> Result<ResourceRecord, ScalewayProviderError> {
        if spec.zone != self.zone.as_str() {
            return Err(ScalewayProviderError::ZoneMismatch {
                requested: spec.zone.clone(),
                configured: self.zone.as_str().to_owned(),
            });
        }
        let image_id = self.resolve_image_id(spec).await?;
        let payload = Self::server_payload(spec, image_id);
        let created = match self
            .send_json::<_, ServerEnvelope>(Method::POST, "servers", &payload)
            .await
        {
            Ok(envelope) => envelope.server,
            Err(ScalewayProviderError::Api { message, .. })
                if Self::is_instance_type_error(&message, spec) =>
            {
                return Err(ScalewayProviderError::InstanceTypeUnavailable {
                    instance_type: spec.instance_type.clone(),
                    zone: spec.zone.clone(),
                });
            }
            Err(other) => return Err(other),
        };

        self.api
            .perform_instance_action_async(self.zone.as_str(), &created.id, "poweron")
            .await?;
        tracing::debug!(instance = %created.id, name = %spec.name, "server powered on");
        Ok(created.into_record())
    }

    /// Powers off if needed, waits for `stopped`, then deletes the server.
    pub(super) async fn terminate_server(&self, id: &str) -> Result<(), ScalewayProviderError> {
        let server = self.require_server(id).await?;
        if matches!(server.state.as_str(), "running" | "starting") {
            self.api
                .perform_instance_action_async(self.zone.as_str(), id, "poweroff")
                .await?;
        }
        self.wait_until_stopped(id).await?;
        self.api.delete_instance_async(self.zone.as_str(), id).await?;
        Ok(())
    }

    async fn wait_until_stopped(&self, id: &str) -> Result<(), ScalewayProviderError> {
        let deadline = Instant::now() + self.wait_timeout;
        while Instant::now() <= deadline {
            match self.fetch_server(id).await? {
                None => {
                    return Err(ScalewayProviderError::NotFound {
                        kind: ResourceKind::Instance,
                        id: id.to_owned(),
                    });
                }
                Some(server) if server.state.starts_with("stopped") => return Ok(()),
                Some(_) => sleep(self.poll_interval).await,
            }
        }
        Err(ScalewayProviderError::Timeout {
            action: String::from("poweroff"),
            instance_id: id.to_owned(),
        })
    }

    pub(super) async fn server_volumes(
        &self,
        id: &str,
    ) -> Result<Vec<String>, ScalewayProviderError> {
        Ok(self.require_server(id).await?.volume_ids())
    }
}
