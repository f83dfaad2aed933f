//! Scaleway implementation of the [`Provider`] contract.
//!
//! The provider is bound to one zone. Spot capacity is not a separate market
//! on Scaleway, so a spot request is backed by an ordinary server and its
//! status is derived from the server state.

mod error;
mod rest;
mod servers;
mod storage;
mod types;

use std::net::IpAddr;
use std::time::Duration;

use scaleway_rs::ScalewayApi;

use crate::config::ScalewayConfig;
use crate::provider::{
    InstanceAction, InstanceTypeInfo, LaunchSpec, MarketPrice, Provider, ProviderFuture,
    ResourceKind, ResourceRecord, SpotRequestRecord, SpotStatus, TagFilter, Tags,
};
use rest::PAGE_SIZE;
use storage::collection;
use types::{AttachIpPatch, IpsEnvelope, ProductsEnvelope, Zone};

pub use error::ScalewayProviderError;

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Provider that manages resources through the Scaleway Instances API.
#[derive(Clone)]
pub struct ScalewayProvider {
    api: ScalewayApi,
    config: ScalewayConfig,
    zone: Zone,
    poll_interval: Duration,
    wait_timeout: Duration,
}

impl ScalewayProvider {
    /// Constructs a provider from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayProviderError::Config`] when the provided
    /// configuration fails validation.
    pub fn new(config: ScalewayConfig) -> Result<Self, ScalewayProviderError> {
        config.validate()?;
        Ok(Self {
            api: ScalewayApi::new(&config.secret_key),
            zone: Zone::from(config.default_zone.as_str()),
            config,
            poll_interval: POLL_INTERVAL,
            wait_timeout: WAIT_TIMEOUT,
        })
    }

    /// Overrides the interval between state polls during termination.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Zone every call is scoped to.
    #[must_use]
    pub const fn zone(&self) -> &str {
        self.zone.as_str()
    }

    async fn catalogue(&self) -> Result<ProductsEnvelope, ScalewayProviderError> {
        self.list_json("products/servers", &[("per_page", PAGE_SIZE.to_owned())])
            .await
    }

    async fn spot_record(
        &self,
        request_id: &str,
    ) -> Result<Option<SpotRequestRecord>, ScalewayProviderError> {
        let record = self.fetch_server(request_id).await?.map_or_else(
            || SpotRequestRecord {
                id: request_id.to_owned(),
                status: SpotStatus::NotFound,
                instance_id: None,
            },
            |server| SpotRequestRecord {
                id: request_id.to_owned(),
                status: server.server_state().spot_status(),
                instance_id: Some(server.id),
            },
        );
        Ok(Some(record))
    }

    async fn attach_address(
        &self,
        instance_id: &str,
        address: IpAddr,
    ) -> Result<(), ScalewayProviderError> {
        let wanted = address.to_string();
        let ips: IpsEnvelope = self
            .list_json("ips", &[("project", self.config.default_project_id.clone())])
            .await?;
        let flexible = ips
            .ips
            .into_iter()
            .find(|ip| ip.address == wanted)
            .ok_or(ScalewayProviderError::UnknownAddress { address: wanted })?;
        let body = AttachIpPatch {
            server: instance_id.to_owned(),
        };
        self.patch(&format!("ips/{}", flexible.id), &body).await
    }
}

impl Provider for ScalewayProvider {
    type Error = ScalewayProviderError;

    fn list<'a>(
        &'a self,
        kind: ResourceKind,
        filter: &'a TagFilter,
    ) -> ProviderFuture<'a, Vec<ResourceRecord>, Self::Error> {
        Box::pin(async move { self.list_records(kind, filter).await })
    }

    fn describe<'a>(
        &'a self,
        kind: ResourceKind,
        id: &'a str,
    ) -> ProviderFuture<'a, Option<ResourceRecord>, Self::Error> {
        Box::pin(async move { self.describe_record(kind, id).await })
    }

    fn set_tags<'a>(
        &'a self,
        kind: ResourceKind,
        id: &'a str,
        tags: &'a Tags,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move { self.merge_record_tags(kind, id, tags).await })
    }

    fn delete<'a>(
        &'a self,
        kind: ResourceKind,
        id: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.delete_path(&format!("{}/{id}", collection(kind)))
                .await
        })
    }

    fn create_instance<'a>(
        &'a self,
        spec: &'a LaunchSpec,
    ) -> ProviderFuture<'a, ResourceRecord, Self::Error> {
        Box::pin(async move { self.create_server(spec).await })
    }

    fn instance_action<'a>(
        &'a self,
        id: &'a str,
        action: InstanceAction,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            match action {
                InstanceAction::Start => {
                    self.api
                        .perform_instance_action_async(self.zone.as_str(), id, "poweron")
                        .await?;
                }
                InstanceAction::Stop => {
                    self.api
                        .perform_instance_action_async(self.zone.as_str(), id, "poweroff")
                        .await?;
                }
                InstanceAction::Terminate => self.terminate_server(id).await?,
            }
            Ok(())
        })
    }

    fn enable_feature<'a>(
        &'a self,
        id: &'a str,
        feature: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let mut body = serde_json::Map::new();
            body.insert(feature.to_owned(), serde_json::Value::Bool(true));
            self.patch(&format!("servers/{id}"), &body).await
        })
    }

    fn attached_disks<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, Vec<ResourceRecord>, Self::Error> {
        Box::pin(async move { self.volume_records(instance_id).await })
    }

    fn create_snapshot<'a>(
        &'a self,
        disk_id: &'a str,
    ) -> ProviderFuture<'a, ResourceRecord, Self::Error> {
        Box::pin(async move { self.snapshot_volume(disk_id).await })
    }

    fn register_image<'a>(
        &'a self,
        snapshot_id: &'a str,
        label: &'a str,
    ) -> ProviderFuture<'a, ResourceRecord, Self::Error> {
        Box::pin(async move { self.image_from_snapshot(snapshot_id, label).await })
    }

    fn request_spot<'a>(&'a self, spec: &'a LaunchSpec) -> ProviderFuture<'a, String, Self::Error> {
        Box::pin(async move {
            let server = self.create_server(spec).await?;
            tracing::info!(
                name = %spec.name,
                server = %server.id,
                "spot capacity is backed by an on-demand server in this zone"
            );
            Ok(server.id)
        })
    }

    fn describe_spot_request<'a>(
        &'a self,
        request_id: &'a str,
    ) -> ProviderFuture<'a, Option<SpotRequestRecord>, Self::Error> {
        Box::pin(async move { self.spot_record(request_id).await })
    }

    fn instance_types(&self) -> ProviderFuture<'_, Vec<InstanceTypeInfo>, Self::Error> {
        Box::pin(async move {
            Ok(self
                .catalogue()
                .await?
                .servers
                .into_iter()
                .map(|(instance_type, product)| InstanceTypeInfo {
                    attributes: product.attributes(),
                    instance_type,
                })
                .collect())
        })
    }

    fn market_prices(&self) -> ProviderFuture<'_, Vec<MarketPrice>, Self::Error> {
        Box::pin(async move {
            Ok(self
                .catalogue()
                .await?
                .servers
                .into_iter()
                .map(|(instance_type, product)| MarketPrice {
                    instance_type,
                    zone: self.zone.as_str().to_owned(),
                    price: product.hourly_price,
                })
                .collect())
        })
    }

    fn addresses(&self) -> ProviderFuture<'_, Vec<IpAddr>, Self::Error> {
        Box::pin(async move {
            let ips: IpsEnvelope = self
                .list_json("ips", &[("project", self.config.default_project_id.clone())])
                .await?;
            Ok(ips
                .ips
                .into_iter()
                .filter_map(|ip| ip.address.parse().ok())
                .collect())
        })
    }

    fn associate_address<'a>(
        &'a self,
        instance_id: &'a str,
        address: IpAddr,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move { self.attach_address(instance_id, address).await })
    }
}

#[cfg(test)]
mod tests;
