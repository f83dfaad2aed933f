//! Provider abstraction for the resources `spotkeep` manages.
//!
//! The provider owns instances, disks, snapshots, and images, and offers spot
//! requests, catalogue and price discovery, and address association. State
//! changing calls resolve once the provider has accepted the request; callers
//! layer "block until confirmed" on top with [`crate::wait::Waiter`].

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use thiserror::Error;

/// Tag key holding the human-chosen name of a resource.
pub const NAME_TAG: &str = "Name";

/// Tag key holding the remote shell login for an instance.
pub const USER_TAG: &str = "user";

/// Provider-neutral lifecycle states reported in [`ResourceRecord::state`].
pub mod state {
    /// Instance is booting.
    pub const PENDING: &str = "pending";
    /// Instance is running.
    pub const RUNNING: &str = "running";
    /// Instance is shutting down.
    pub const STOPPING: &str = "stopping";
    /// Instance is stopped and may be restarted.
    pub const STOPPED: &str = "stopped";
    /// Instance has been terminated.
    pub const TERMINATED: &str = "terminated";
    /// Disk, snapshot, or image is usable.
    pub const AVAILABLE: &str = "available";
    /// Disk is attached to an instance.
    pub const IN_USE: &str = "in_use";
    /// Snapshot or image is still being written.
    pub const CREATING: &str = "creating";
    /// Provider reported an unrecoverable failure.
    pub const ERROR: &str = "error";
}

/// Future returned by provider operations.
pub type ProviderFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Key/value tags attached to a resource.
pub type Tags = BTreeMap<String, String>;

/// The kinds of resource sharing one name across a machine's history.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ResourceKind {
    /// Compute instance.
    Instance,
    /// Block disk attached to an instance.
    Disk,
    /// Point-in-time durable copy of a disk.
    Snapshot,
    /// Bootable image referencing a snapshot.
    Image,
}

impl ResourceKind {
    /// Returns the lower-case label used in logs and errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Instance => "instance",
            Self::Disk => "disk",
            Self::Snapshot => "snapshot",
            Self::Image => "image",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authoritative view of a provider resource at the time it was read.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResourceRecord {
    /// Kind of the resource.
    pub kind: ResourceKind,
    /// Provider identifier.
    pub id: String,
    /// Provider-neutral state, see [`state`].
    pub state: String,
    /// Creation timestamp. Lexical order must match chronological order.
    pub created_at: String,
    /// Tags currently applied to the resource.
    pub tags: Tags,
    /// Public address of an instance, when it has one.
    pub public_ip: Option<IpAddr>,
    /// Instance class of an instance.
    pub instance_type: Option<String>,
    /// Instance a disk is attached to.
    pub attached_to: Option<String>,
}

impl ResourceRecord {
    /// Creates a record with no tags, address, or attachment.
    #[must_use]
    pub fn new(
        kind: ResourceKind,
        id: impl Into<String>,
        state: impl Into<String>,
        created_at: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            id: id.into(),
            state: state.into(),
            created_at: created_at.into(),
            tags: Tags::new(),
            public_ip: None,
            instance_type: None,
            attached_to: None,
        }
    }

    /// Returns the value of the name tag, or an empty string when unnamed.
    #[must_use]
    pub fn name(&self) -> &str {
        self.tags.get(NAME_TAG).map_or("", String::as_str)
    }

    /// Returns `true` while the resource still counts towards name
    /// uniqueness (anything but a terminated instance).
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state != state::TERMINATED
    }

    /// Returns `true` when the record reports `expected` as its state.
    #[must_use]
    pub fn is_in_state(&self, expected: &str) -> bool {
        self.state == expected
    }
}

/// Tag predicate used when listing resources.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TagFilter {
    /// Tags that must all be present with the given values.
    pub tags: Tags,
}

impl TagFilter {
    /// Matches every resource.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Matches resources whose name tag equals `name`.
    #[must_use]
    pub fn name(name: &str) -> Self {
        let mut tags = Tags::new();
        tags.insert(NAME_TAG.to_owned(), name.to_owned());
        Self { tags }
    }

    /// Returns `true` when `tags` satisfies the filter.
    #[must_use]
    pub fn matches(&self, tags: &Tags) -> bool {
        self.tags
            .iter()
            .all(|(key, value)| tags.get(key).is_some_and(|actual| actual == value))
    }
}

/// Immutable description of how to create one instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchSpec {
    /// Name the instance will carry once created.
    pub name: String,
    /// Image identifier or label to boot from.
    pub image: String,
    /// Instance class to request.
    pub instance_type: String,
    /// Placement zone.
    pub zone: String,
    /// Project used for billing and ownership.
    pub project_id: String,
    /// CPU architecture of the image.
    pub architecture: String,
    /// Root disk size in gigabytes; the image default applies when absent.
    pub disk_size_gb: Option<u64>,
    /// Security group reference.
    pub security_group: Option<String>,
    /// Remote shell login.
    pub user: String,
}

/// Raised when a launch specification is incomplete.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("launch spec for '{name}' is missing {field}")]
pub struct LaunchSpecError {
    /// Name of the machine being launched.
    pub name: String,
    /// Field that was empty.
    pub field: String,
}

impl LaunchSpec {
    /// Checks that every required field is non-empty.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchSpecError`] naming the first empty field.
    pub fn validate(&self) -> Result<(), LaunchSpecError> {
        let required = [
            ("name", &self.name),
            ("image", &self.image),
            ("instance_type", &self.instance_type),
            ("zone", &self.zone),
            ("project_id", &self.project_id),
            ("architecture", &self.architecture),
            ("user", &self.user),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(LaunchSpecError {
                    name: self.name.clone(),
                    field: field.to_owned(),
                });
            }
        }
        Ok(())
    }
}

/// Instance power actions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InstanceAction {
    /// Boot a stopped instance.
    Start,
    /// Stop a running instance, keeping its disks.
    Stop,
    /// Destroy the instance. Disks survive detached.
    Terminate,
}

/// Status code of a spot request as reported by the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SpotStatus {
    /// Request is being evaluated.
    PendingEvaluation,
    /// Request is waiting for capacity.
    PendingFulfillment,
    /// Request is fulfilled and the instance is live.
    Fulfilled,
    /// The provider will reclaim the instance imminently.
    MarkedForTermination,
    /// The operator terminated the instance.
    TerminatedByUser,
    /// The request can no longer be found.
    NotFound,
    /// Any other provider status code.
    Other(String),
}

impl SpotStatus {
    /// Parses a provider status code.
    #[must_use]
    pub fn from_code(code: &str) -> Self {
        match code {
            "pending-evaluation" => Self::PendingEvaluation,
            "pending-fulfillment" => Self::PendingFulfillment,
            "fulfilled" => Self::Fulfilled,
            "marked-for-termination" => Self::MarkedForTermination,
            "instance-terminated-by-user" | "terminated-by-user" => Self::TerminatedByUser,
            "not-found" => Self::NotFound,
            other => Self::Other(other.to_owned()),
        }
    }

    /// Returns the provider status code.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::PendingEvaluation => "pending-evaluation",
            Self::PendingFulfillment => "pending-fulfillment",
            Self::Fulfilled => "fulfilled",
            Self::MarkedForTermination => "marked-for-termination",
            Self::TerminatedByUser => "terminated-by-user",
            Self::NotFound => "not-found",
            Self::Other(code) => code.as_str(),
        }
    }
}

impl fmt::Display for SpotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider view of a spot request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpotRequestRecord {
    /// Request identifier.
    pub id: String,
    /// Current status code.
    pub status: SpotStatus,
    /// Instance that fulfilled the request, once known.
    pub instance_id: Option<String>,
}

/// Hardware attributes of one instance class.
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceTypeInfo {
    /// Instance class name.
    pub instance_type: String,
    /// Numeric attributes such as `vcpu`, `memory`, or `gpu`.
    pub attributes: BTreeMap<String, f64>,
}

/// Current market price of one instance class in one zone.
#[derive(Clone, Debug, PartialEq)]
pub struct MarketPrice {
    /// Instance class name.
    pub instance_type: String,
    /// Zone the price applies to.
    pub zone: String,
    /// Hourly price.
    pub price: f64,
}

/// Narrow contract over the cloud provider.
///
/// `list` returns matches ordered oldest first. `describe` returns `None`
/// when the resource no longer exists.
pub trait Provider: Send + Sync {
    /// Provider specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Lists resources of `kind` matching `filter`, oldest first.
    fn list<'a>(
        &'a self,
        kind: ResourceKind,
        filter: &'a TagFilter,
    ) -> ProviderFuture<'a, Vec<ResourceRecord>, Self::Error>;

    /// Reads the live state of one resource.
    fn describe<'a>(
        &'a self,
        kind: ResourceKind,
        id: &'a str,
    ) -> ProviderFuture<'a, Option<ResourceRecord>, Self::Error>;

    /// Merges `tags` into the resource's tags. An empty value removes the key.
    fn set_tags<'a>(
        &'a self,
        kind: ResourceKind,
        id: &'a str,
        tags: &'a Tags,
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Deletes a disk, snapshot, or image.
    fn delete<'a>(&'a self, kind: ResourceKind, id: &'a str) -> ProviderFuture<'a, (), Self::Error>;

    /// Submits an on-demand instance creation request.
    fn create_instance<'a>(
        &'a self,
        spec: &'a LaunchSpec,
    ) -> ProviderFuture<'a, ResourceRecord, Self::Error>;

    /// Applies a power action to an instance.
    fn instance_action<'a>(
        &'a self,
        id: &'a str,
        action: InstanceAction,
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Enables a capability flag. Only valid while the instance is stopped.
    fn enable_feature<'a>(
        &'a self,
        id: &'a str,
        feature: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Lists the disks attached to an instance, boot disk first.
    fn attached_disks<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, Vec<ResourceRecord>, Self::Error>;

    /// Starts a point-in-time copy of a disk.
    fn create_snapshot<'a>(
        &'a self,
        disk_id: &'a str,
    ) -> ProviderFuture<'a, ResourceRecord, Self::Error>;

    /// Registers a bootable image over a snapshot under a provider label.
    fn register_image<'a>(
        &'a self,
        snapshot_id: &'a str,
        label: &'a str,
    ) -> ProviderFuture<'a, ResourceRecord, Self::Error>;

    /// Submits a spot request and returns its identifier.
    fn request_spot<'a>(&'a self, spec: &'a LaunchSpec) -> ProviderFuture<'a, String, Self::Error>;

    /// Reads the status of a spot request.
    fn describe_spot_request<'a>(
        &'a self,
        request_id: &'a str,
    ) -> ProviderFuture<'a, Option<SpotRequestRecord>, Self::Error>;

    /// Lists instance classes with their hardware attributes.
    fn instance_types(&self) -> ProviderFuture<'_, Vec<InstanceTypeInfo>, Self::Error>;

    /// Lists current market prices.
    fn market_prices(&self) -> ProviderFuture<'_, Vec<MarketPrice>, Self::Error>;

    /// Lists the account's reserved public addresses.
    fn addresses(&self) -> ProviderFuture<'_, Vec<IpAddr>, Self::Error>;

    /// Moves a reserved public address onto an instance.
    fn associate_address<'a>(
        &'a self,
        instance_id: &'a str,
        address: IpAddr,
    ) -> ProviderFuture<'a, (), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("fulfilled", SpotStatus::Fulfilled)]
    #[case("marked-for-termination", SpotStatus::MarkedForTermination)]
    #[case("instance-terminated-by-user", SpotStatus::TerminatedByUser)]
    #[case("capacity-not-available", SpotStatus::Other(String::from("capacity-not-available")))]
    fn spot_status_parses_provider_codes(#[case] code: &str, #[case] expected: SpotStatus) {
        assert_eq!(SpotStatus::from_code(code), expected);
    }

    #[test]
    fn tag_filter_requires_every_tag() {
        let mut tags = Tags::new();
        tags.insert(NAME_TAG.to_owned(), String::from("box"));
        tags.insert(USER_TAG.to_owned(), String::from("root"));

        assert!(TagFilter::name("box").matches(&tags));
        assert!(!TagFilter::name("other").matches(&tags));
        assert!(TagFilter::any().matches(&Tags::new()));
    }

    #[test]
    fn launch_spec_validation_names_empty_field() {
        let spec = LaunchSpec {
            name: String::from("box"),
            image: String::from("img"),
            instance_type: String::from(" "),
            zone: String::from("fr-par-1"),
            project_id: String::from("proj"),
            architecture: String::from("x86_64"),
            disk_size_gb: None,
            security_group: None,
            user: String::from("root"),
        };
        let err = spec.validate().expect_err("blank type should fail");
        assert_eq!(err.field, "instance_type");
    }
}
