//! Core library for `spotkeep`, a lifecycle manager for named spot instances.
//!
//! A machine is known by a name that moves between provider resources over
//! its history: the running instance, then its root disk, then the snapshot
//! and image that preserve it. The crate launches instances on the spot
//! market, watches each one for an interruption notice, and on termination
//! saves the root disk as an image so the next launch under the same name
//! boots from it.

pub mod chain;
pub mod config;
pub mod error;
pub mod instance;
pub mod monitor;
pub mod provider;
pub mod remote;
pub mod resource;
pub mod scaleway;
pub mod selector;
pub mod spec_store;
pub mod spot;
pub mod test_support;
pub mod wait;

pub use chain::{DiskChain, SavedArtifacts};
pub use config::{ConfigError, LifecycleConfig, ScalewayConfig, ShellConfig};
pub use error::LifecycleError;
pub use instance::{AddressChoice, Context, InstanceController, InstanceResult};
pub use monitor::{InterruptionMonitor, MonitorExit, MonitorHandle, MonitorState};
pub use provider::{
    LaunchSpec, Provider, ResourceKind, ResourceRecord, SpotRequestRecord, SpotStatus, TagFilter,
};
pub use remote::{ProcessCommandRunner, RemoteShell, Session, ShellError, SshShell};
pub use resource::{Lookup, ResourceHandle};
pub use scaleway::{ScalewayProvider, ScalewayProviderError};
pub use selector::{CatalogRow, Selection, SelectionError, SortKey};
pub use spec_store::{LaunchDefaults, SpecError, SpecSource, SpecStore, SpecTemplate};
pub use spot::{LaunchOptions, LaunchedInstance, SaveOrdering, SpotController, StopOptions};
pub use wait::{Probe, WaitError, Waiter};
