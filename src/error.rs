//! Error taxonomy for lifecycle operations.

use thiserror::Error;

use crate::provider::{LaunchSpecError, ResourceKind};
use crate::remote::ShellError;
use crate::selector::SelectionError;
use crate::spec_store::SpecError;
use crate::wait::WaitError;

/// Errors surfaced by handles, controllers, and the save chain.
#[derive(Debug, Error)]
pub enum LifecycleError<ProviderError>
where
    ProviderError: std::error::Error + 'static,
{
    /// Raised when the provider rejects a call.
    #[error("provider call failed: {0}")]
    Provider(#[source] ProviderError),
    /// Raised when a lookup is attempted with an empty name.
    #[error("resource name must not be empty")]
    EmptyName,
    /// Raised when a record of one kind is resolved as another.
    #[error("expected a {expected} but got a {actual} ({id})")]
    KindMismatch {
        /// Kind the caller asked for.
        expected: ResourceKind,
        /// Kind of the supplied record.
        actual: ResourceKind,
        /// Identifier of the supplied record.
        id: String,
    },
    /// Raised when a bound resource no longer exists.
    #[error("{kind} {id} no longer exists")]
    Gone {
        /// Kind of the missing resource.
        kind: ResourceKind,
        /// Identifier of the missing resource.
        id: String,
    },
    /// Raised when a pending handle is asked for provider state.
    #[error("{kind} '{name}' has not been created yet")]
    NotCreated {
        /// Kind of the pending resource.
        kind: ResourceKind,
        /// Pending name.
        name: String,
    },
    /// Raised when a launch would reuse a name bound to a live resource.
    #[error("name '{name}' is already bound to {kind} {id}")]
    NameCollision {
        /// Requested name.
        name: String,
        /// Kind of the resource holding the name.
        kind: ResourceKind,
        /// Identifier of the resource holding the name.
        id: String,
    },
    /// Raised when a launch spec is incomplete.
    #[error(transparent)]
    InvalidSpec(#[from] LaunchSpecError),
    /// Raised when a spot request or instance never comes up.
    #[error("provisioning '{name}' failed: {message}")]
    Provisioning {
        /// Name of the machine being launched.
        name: String,
        /// Human-readable description of the failure.
        message: String,
    },
    /// Raised when a bounded wait gives up or observes a failure state.
    #[error(transparent)]
    Wait(#[from] WaitError),
    /// Raised when a remote command cannot be executed.
    #[error(transparent)]
    Shell(#[from] ShellError),
    /// Raised when a launch template cannot be loaded.
    #[error(transparent)]
    Spec(#[from] SpecError),
    /// Raised when no catalogue row satisfies the operator's filter.
    #[error(transparent)]
    Selection(#[from] SelectionError),
    /// Raised when an instance has no attached disk to capture.
    #[error("instance {instance_id} has no attached disk")]
    NoDisk {
        /// Instance identifier.
        instance_id: String,
    },
    /// Raised when an instance has no public address.
    #[error("instance {instance_id} has no public address")]
    NoAddress {
        /// Instance identifier.
        instance_id: String,
    },
    /// Raised when an address index is outside the reserved list.
    #[error("address index {index} out of range ({available} reserved)")]
    AddressIndex {
        /// Requested index.
        index: usize,
        /// Number of reserved addresses.
        available: usize,
    },
    /// Raised when a service endpoint check cannot be issued.
    #[error("endpoint check for {url} failed: {message}")]
    Endpoint {
        /// URL being probed.
        url: String,
        /// Human-readable description of the failure.
        message: String,
    },
    /// Raised when the save chain fails after the disk was captured. The
    /// disk keeps its name tag so the save can be resumed manually.
    #[error("saving '{name}' from disk {disk_id} did not complete: {message}")]
    SaveIncomplete {
        /// Name being saved.
        name: String,
        /// Disk left in place.
        disk_id: String,
        /// Description of the failing step.
        message: String,
    },
}
