//! Test support utilities shared across unit and integration tests.
//!
//! [`FakeProvider`] is an in-memory provider whose slow operations complete
//! on the first poll after they start, so lifecycle flows run end to end
//! without a cloud account. [`ScriptedShell`] and [`ScriptedRunner`] stand in
//! for SSH.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::env;
use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::provider::{
    InstanceAction, InstanceTypeInfo, LaunchSpec, MarketPrice, NAME_TAG, Provider,
    ProviderFuture, ResourceKind, ResourceRecord, SpotRequestRecord, SpotStatus, TagFilter, Tags,
    state,
};
use crate::remote::{
    CommandOutput, CommandRunner, RemoteCommandOutput, RemoteShell, ShellError, ShellFuture,
    ShellTarget,
};
use crate::spec_store::{SpecError, SpecSource, SpecTemplate};

/// Errors raised by [`FakeProvider`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FakeProviderError {
    /// Raised when an identifier is unknown.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Kind looked up.
        kind: ResourceKind,
        /// Identifier looked up.
        id: String,
    },
    /// Raised when terminating an instance twice.
    #[error("instance {id} is already terminated")]
    AlreadyTerminated {
        /// Instance identifier.
        id: String,
    },
    /// Raised when deleting a disk that is still attached.
    #[error("disk {id} is attached")]
    InUse {
        /// Disk identifier.
        id: String,
    },
    /// Raised when toggling a feature on an instance that is not stopped.
    #[error("instance {id} must be stopped")]
    NotStopped {
        /// Instance identifier.
        id: String,
    },
    /// Raised when snapshot creation is configured to fail.
    #[error("snapshot of disk {disk_id} failed")]
    SnapshotFailed {
        /// Disk identifier.
        disk_id: String,
    },
    /// Raised for injected transient read failures.
    #[error("service temporarily unavailable")]
    Unavailable,
}

#[derive(Debug)]
struct SpotEntry {
    instance_id: String,
    scripted: VecDeque<SpotStatus>,
    sticky: Option<SpotStatus>,
}

#[derive(Debug, Default)]
struct FakeState {
    sequence: u64,
    resources: Vec<ResourceRecord>,
    image_labels: HashMap<String, String>,
    spot_requests: HashMap<String, SpotEntry>,
    next_spot_script: VecDeque<SpotStatus>,
    spot_read_failures: u32,
    spot_polls: u32,
    fail_snapshots: bool,
    catalog: Vec<InstanceTypeInfo>,
    prices: Vec<MarketPrice>,
    addresses: Vec<IpAddr>,
    associations: Vec<(String, IpAddr)>,
    features: Vec<(String, String)>,
    launches: Vec<LaunchSpec>,
    calls: Vec<String>,
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> (String, String) {
        self.sequence += 1;
        (
            format!("{prefix}-{}", self.sequence),
            format!("2024-01-01T00:00:00.{:06}Z", self.sequence),
        )
    }

    fn insert(&mut self, kind: ResourceKind, prefix: &str, state: &str) -> ResourceRecord {
        let (id, created_at) = self.next_id(prefix);
        let record = ResourceRecord::new(kind, id, state, created_at);
        self.resources.push(record.clone());
        record
    }

    fn find_mut(&mut self, kind: ResourceKind, id: &str) -> Option<&mut ResourceRecord> {
        self.resources
            .iter_mut()
            .find(|record| record.kind == kind && record.id == id)
    }

    fn find(&self, kind: ResourceKind, id: &str) -> Option<&ResourceRecord> {
        self.resources
            .iter()
            .find(|record| record.kind == kind && record.id == id)
    }

    fn launch(&mut self, spec: &LaunchSpec) -> ResourceRecord {
        self.launches.push(spec.clone());
        let octet = u8::try_from(self.sequence % 250).unwrap_or(1) + 1;
        let mut instance = self.insert(ResourceKind::Instance, "srv", state::PENDING);
        instance.instance_type = Some(spec.instance_type.clone());
        instance.public_ip = Some(IpAddr::V4(Ipv4Addr::new(198, 51, 100, octet)));
        let disk = self.insert(ResourceKind::Disk, "vol", state::IN_USE);
        let instance_id = instance.id.clone();
        if let Some(stored) = self.find_mut(ResourceKind::Instance, &instance_id) {
            stored.clone_from(&instance);
        }
        if let Some(stored) = self.find_mut(ResourceKind::Disk, &disk.id) {
            stored.attached_to = Some(instance_id);
        }
        instance
    }

    fn apply_action(&mut self, id: &str, action: InstanceAction) {
        let next = match action {
            InstanceAction::Start => state::PENDING,
            InstanceAction::Stop => state::STOPPING,
            InstanceAction::Terminate => state::TERMINATED,
        };
        if let Some(record) = self.find_mut(ResourceKind::Instance, id) {
            next.clone_into(&mut record.state);
        }
        if action == InstanceAction::Terminate {
            for disk in self.resources.iter_mut().filter(|record| {
                record.kind == ResourceKind::Disk && record.attached_to.as_deref() == Some(id)
            }) {
                disk.attached_to = None;
                state::AVAILABLE.clone_into(&mut disk.state);
            }
        }
    }

    fn spot_status(&mut self, request_id: &str) -> Option<SpotRequestRecord> {
        let entry = self.spot_requests.get_mut(request_id)?;
        let instance_id = entry.instance_id.clone();
        let status = if let Some(next) = entry.scripted.pop_front() {
            next
        } else if let Some(sticky) = entry.sticky.clone() {
            sticky
        } else {
            match self
                .resources
                .iter()
                .find(|r| r.kind == ResourceKind::Instance && r.id == instance_id)
            {
                None => SpotStatus::NotFound,
                Some(record) if record.is_in_state(state::TERMINATED) => {
                    SpotStatus::TerminatedByUser
                }
                Some(_) => SpotStatus::Fulfilled,
            }
        };
        Some(SpotRequestRecord {
            id: request_id.to_owned(),
            status,
            instance_id: Some(instance_id),
        })
    }
}

/// In-memory provider used by tests.
#[derive(Clone, Debug, Default)]
pub struct FakeProvider {
    state: Arc<Mutex<FakeState>>,
}

impl FakeProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log(&self, call: String) {
        self.lock().calls.push(call);
    }

    /// Adds a resource carrying `name` in `state` and returns its id.
    #[must_use]
    pub fn seed(&self, kind: ResourceKind, name: &str, record_state: &str) -> String {
        let mut guard = self.lock();
        let prefix = match kind {
            ResourceKind::Instance => "srv",
            ResourceKind::Disk => "vol",
            ResourceKind::Snapshot => "snap",
            ResourceKind::Image => "img",
        };
        let record = guard.insert(kind, prefix, record_state);
        if let Some(stored) = guard.find_mut(kind, &record.id) {
            stored.tags.insert(NAME_TAG.to_owned(), name.to_owned());
        }
        record.id
    }

    /// Replaces the instance catalogue.
    pub fn set_catalog(&self, catalog: Vec<InstanceTypeInfo>, prices: Vec<MarketPrice>) {
        let mut guard = self.lock();
        guard.catalog = catalog;
        guard.prices = prices;
    }

    /// Replaces the reserved address list.
    pub fn set_addresses(&self, addresses: Vec<IpAddr>) {
        self.lock().addresses = addresses;
    }

    /// Makes snapshot creation fail until reset.
    pub fn fail_snapshots(&self, fail: bool) {
        self.lock().fail_snapshots = fail;
    }

    /// Fails the next `count` spot status reads.
    pub fn fail_spot_reads(&self, count: u32) {
        self.lock().spot_read_failures = count;
    }

    /// Queues statuses for the next spot request, reported before the
    /// derived status.
    pub fn script_next_spot(&self, statuses: impl IntoIterator<Item = SpotStatus>) {
        self.lock().next_spot_script = statuses.into_iter().collect();
    }

    /// Registers a spot request with scripted statuses. Once the script is
    /// exhausted the request reports `not-found`.
    pub fn seed_spot_request(
        &self,
        request_id: &str,
        statuses: impl IntoIterator<Item = SpotStatus>,
    ) {
        self.lock().spot_requests.insert(
            request_id.to_owned(),
            SpotEntry {
                instance_id: String::new(),
                scripted: statuses.into_iter().collect(),
                sticky: Some(SpotStatus::NotFound),
            },
        );
    }

    /// Forces a spot request to report `status` from now on.
    pub fn set_spot_status(&self, request_id: &str, status: SpotStatus) {
        if let Some(entry) = self.lock().spot_requests.get_mut(request_id) {
            entry.scripted.clear();
            entry.sticky = Some(status);
        }
    }

    /// Number of spot status reads so far.
    #[must_use]
    pub fn spot_polls(&self) -> u32 {
        self.lock().spot_polls
    }

    /// All records of `kind`, oldest first.
    #[must_use]
    pub fn records(&self, kind: ResourceKind) -> Vec<ResourceRecord> {
        self.lock()
            .resources
            .iter()
            .filter(|record| record.kind == kind)
            .cloned()
            .collect()
    }

    /// Records of `kind` currently carrying `name`.
    #[must_use]
    pub fn named(&self, kind: ResourceKind, name: &str) -> Vec<ResourceRecord> {
        self.records(kind)
            .into_iter()
            .filter(|record| record.name() == name)
            .collect()
    }

    /// Looks up one record.
    #[must_use]
    pub fn record(&self, kind: ResourceKind, id: &str) -> Option<ResourceRecord> {
        self.lock().find(kind, id).cloned()
    }

    /// Provider label an image was registered under.
    #[must_use]
    pub fn image_label(&self, id: &str) -> Option<String> {
        self.lock().image_labels.get(id).cloned()
    }

    /// Feature toggles applied so far as `(instance_id, feature)`.
    #[must_use]
    pub fn features(&self) -> Vec<(String, String)> {
        self.lock().features.clone()
    }

    /// Address associations so far as `(instance_id, address)`.
    #[must_use]
    pub fn associations(&self) -> Vec<(String, IpAddr)> {
        self.lock().associations.clone()
    }

    /// Launch specs submitted so far.
    #[must_use]
    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.lock().launches.clone()
    }

    /// State-changing calls so far, formatted as `op kind id`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    fn ready<'a, T: Send + 'a>(
        result: Result<T, FakeProviderError>,
    ) -> ProviderFuture<'a, T, FakeProviderError> {
        Box::pin(async move { result })
    }
}

fn advance(record: &mut ResourceRecord) {
    let next = match record.state.as_str() {
        state::PENDING => state::RUNNING,
        state::STOPPING => state::STOPPED,
        state::CREATING => state::AVAILABLE,
        _ => return,
    };
    next.clone_into(&mut record.state);
}

impl Provider for FakeProvider {
    type Error = FakeProviderError;

    fn list<'a>(
        &'a self,
        kind: ResourceKind,
        filter: &'a TagFilter,
    ) -> ProviderFuture<'a, Vec<ResourceRecord>, Self::Error> {
        let mut matches: Vec<ResourceRecord> = self
            .records(kind)
            .into_iter()
            .filter(|record| filter.matches(&record.tags))
            .collect();
        matches.sort_by(|lhs, rhs| lhs.created_at.cmp(&rhs.created_at));
        Self::ready(Ok(matches))
    }

    fn describe<'a>(
        &'a self,
        kind: ResourceKind,
        id: &'a str,
    ) -> ProviderFuture<'a, Option<ResourceRecord>, Self::Error> {
        let mut guard = self.lock();
        let current = guard.find_mut(kind, id).map(|record| {
            let observed = record.clone();
            advance(record);
            observed
        });
        drop(guard);
        Self::ready(Ok(current))
    }

    fn set_tags<'a>(
        &'a self,
        kind: ResourceKind,
        id: &'a str,
        tags: &'a Tags,
    ) -> ProviderFuture<'a, (), Self::Error> {
        self.log(format!("tag {kind} {id}"));
        let mut guard = self.lock();
        let result = guard.find_mut(kind, id).map_or_else(
            || {
                Err(FakeProviderError::NotFound {
                    kind,
                    id: id.to_owned(),
                })
            },
            |record| {
                for (key, value) in tags {
                    if value.is_empty() {
                        record.tags.remove(key);
                    } else {
                        record.tags.insert(key.clone(), value.clone());
                    }
                }
                Ok(())
            },
        );
        drop(guard);
        Self::ready(result)
    }

    fn delete<'a>(
        &'a self,
        kind: ResourceKind,
        id: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error> {
        self.log(format!("delete {kind} {id}"));
        let mut guard = self.lock();
        let attached = guard
            .find(kind, id)
            .map(|record| record.attached_to.is_some());
        let result = match attached {
            None => Err(FakeProviderError::NotFound {
                kind,
                id: id.to_owned(),
            }),
            Some(true) => Err(FakeProviderError::InUse { id: id.to_owned() }),
            Some(false) => {
                guard
                    .resources
                    .retain(|record| !(record.kind == kind && record.id == id));
                Ok(())
            }
        };
        drop(guard);
        Self::ready(result)
    }

    fn create_instance<'a>(
        &'a self,
        spec: &'a LaunchSpec,
    ) -> ProviderFuture<'a, ResourceRecord, Self::Error> {
        self.log(format!("create instance {}", spec.name));
        let record = self.lock().launch(spec);
        Self::ready(Ok(record))
    }

    fn instance_action<'a>(
        &'a self,
        id: &'a str,
        action: InstanceAction,
    ) -> ProviderFuture<'a, (), Self::Error> {
        self.log(format!("{action:?} instance {id}").to_lowercase());
        let mut guard = self.lock();
        let terminated = guard
            .find(ResourceKind::Instance, id)
            .map(|record| record.is_in_state(state::TERMINATED));
        let result = match terminated {
            None => Err(FakeProviderError::NotFound {
                kind: ResourceKind::Instance,
                id: id.to_owned(),
            }),
            Some(true) => Err(FakeProviderError::AlreadyTerminated { id: id.to_owned() }),
            Some(false) => {
                guard.apply_action(id, action);
                Ok(())
            }
        };
        drop(guard);
        Self::ready(result)
    }

    fn enable_feature<'a>(
        &'a self,
        id: &'a str,
        feature: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error> {
        let mut guard = self.lock();
        let stopped = guard
            .find(ResourceKind::Instance, id)
            .map(|record| record.is_in_state(state::STOPPED));
        let result = match stopped {
            None => Err(FakeProviderError::NotFound {
                kind: ResourceKind::Instance,
                id: id.to_owned(),
            }),
            Some(false) => Err(FakeProviderError::NotStopped { id: id.to_owned() }),
            Some(true) => {
                guard.features.push((id.to_owned(), feature.to_owned()));
                Ok(())
            }
        };
        drop(guard);
        Self::ready(result)
    }

    fn attached_disks<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, Vec<ResourceRecord>, Self::Error> {
        let disks = self
            .records(ResourceKind::Disk)
            .into_iter()
            .filter(|disk| disk.attached_to.as_deref() == Some(instance_id))
            .collect();
        Self::ready(Ok(disks))
    }

    fn create_snapshot<'a>(
        &'a self,
        disk_id: &'a str,
    ) -> ProviderFuture<'a, ResourceRecord, Self::Error> {
        self.log(format!("snapshot disk {disk_id}"));
        let mut guard = self.lock();
        let result = if guard.fail_snapshots {
            Err(FakeProviderError::SnapshotFailed {
                disk_id: disk_id.to_owned(),
            })
        } else if guard.find(ResourceKind::Disk, disk_id).is_none() {
            Err(FakeProviderError::NotFound {
                kind: ResourceKind::Disk,
                id: disk_id.to_owned(),
            })
        } else {
            Ok(guard.insert(ResourceKind::Snapshot, "snap", state::CREATING))
        };
        drop(guard);
        Self::ready(result)
    }

    fn register_image<'a>(
        &'a self,
        snapshot_id: &'a str,
        label: &'a str,
    ) -> ProviderFuture<'a, ResourceRecord, Self::Error> {
        self.log(format!("register snapshot {snapshot_id}"));
        let mut guard = self.lock();
        let result = if guard.find(ResourceKind::Snapshot, snapshot_id).is_none() {
            Err(FakeProviderError::NotFound {
                kind: ResourceKind::Snapshot,
                id: snapshot_id.to_owned(),
            })
        } else {
            let record = guard.insert(ResourceKind::Image, "img", state::CREATING);
            guard
                .image_labels
                .insert(record.id.clone(), label.to_owned());
            Ok(record)
        };
        drop(guard);
        Self::ready(result)
    }

    fn request_spot<'a>(&'a self, spec: &'a LaunchSpec) -> ProviderFuture<'a, String, Self::Error> {
        self.log(format!("request spot {}", spec.name));
        let mut guard = self.lock();
        let instance = guard.launch(spec);
        let (request_id, _) = guard.next_id("sir");
        let scripted = std::mem::take(&mut guard.next_spot_script);
        guard.spot_requests.insert(
            request_id.clone(),
            SpotEntry {
                instance_id: instance.id,
                scripted,
                sticky: None,
            },
        );
        drop(guard);
        Self::ready(Ok(request_id))
    }

    fn describe_spot_request<'a>(
        &'a self,
        request_id: &'a str,
    ) -> ProviderFuture<'a, Option<SpotRequestRecord>, Self::Error> {
        let mut guard = self.lock();
        guard.spot_polls += 1;
        let result = if guard.spot_read_failures > 0 {
            guard.spot_read_failures -= 1;
            Err(FakeProviderError::Unavailable)
        } else {
            Ok(guard.spot_status(request_id))
        };
        drop(guard);
        Self::ready(result)
    }

    fn instance_types(&self) -> ProviderFuture<'_, Vec<InstanceTypeInfo>, Self::Error> {
        let catalog = self.lock().catalog.clone();
        Self::ready(Ok(catalog))
    }

    fn market_prices(&self) -> ProviderFuture<'_, Vec<MarketPrice>, Self::Error> {
        let prices = self.lock().prices.clone();
        Self::ready(Ok(prices))
    }

    fn addresses(&self) -> ProviderFuture<'_, Vec<IpAddr>, Self::Error> {
        let addresses = self.lock().addresses.clone();
        Self::ready(Ok(addresses))
    }

    fn associate_address<'a>(
        &'a self,
        instance_id: &'a str,
        address: IpAddr,
    ) -> ProviderFuture<'a, (), Self::Error> {
        let mut guard = self.lock();
        let result = guard
            .find_mut(ResourceKind::Instance, instance_id)
            .map_or_else(
                || {
                    Err(FakeProviderError::NotFound {
                        kind: ResourceKind::Instance,
                        id: instance_id.to_owned(),
                    })
                },
                |record| {
                    record.public_ip = Some(address);
                    Ok(())
                },
            );
        if result.is_ok() {
            guard.associations.push((instance_id.to_owned(), address));
        }
        drop(guard);
        Self::ready(result)
    }
}

#[derive(Debug, Default)]
struct ShellScript {
    unreachable_remaining: u32,
    responses: VecDeque<RemoteCommandOutput>,
    commands: Vec<String>,
}

/// Remote shell that records commands and replays scripted outcomes.
///
/// Commands succeed with exit code zero once the queue is empty.
#[derive(Clone, Debug, Default)]
pub struct ScriptedShell {
    script: Arc<Mutex<ShellScript>>,
}

impl ScriptedShell {
    /// Creates a shell that is reachable immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ShellScript> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails the next `count` commands as if the host were unreachable.
    pub fn unreachable_for(&self, count: u32) {
        self.lock().unreachable_remaining = count;
    }

    /// Queues a response for the next reachable command.
    pub fn push_exit_code(&self, code: i32) {
        self.lock().responses.push_back(RemoteCommandOutput {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: String::new(),
        });
    }

    /// Commands issued so far, including unreachable attempts.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }
}

impl RemoteShell for ScriptedShell {
    fn run<'a>(
        &'a self,
        target: &'a ShellTarget,
        command: &'a str,
    ) -> ShellFuture<'a, RemoteCommandOutput> {
        let mut script = self.lock();
        script.commands.push(command.to_owned());
        let result = if script.unreachable_remaining > 0 {
            script.unreachable_remaining -= 1;
            Err(ShellError::Spawn {
                program: String::from("ssh"),
                message: format!(
                    "connect to host {} port {}: Connection refused",
                    target.host, target.port
                ),
            })
        } else {
            Ok(script
                .responses
                .pop_front()
                .unwrap_or_else(|| RemoteCommandOutput {
                    exit_code: Some(0),
                    ..RemoteCommandOutput::default()
                }))
        };
        drop(script);
        Box::pin(async move { result })
    }
}

/// Launch templates held in memory.
#[derive(Clone, Debug, Default)]
pub struct StaticSpecs {
    templates: HashMap<String, SpecTemplate>,
    fallback: Option<SpecTemplate>,
}

impl StaticSpecs {
    /// Creates a source with no templates.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a per-name template.
    #[must_use]
    pub fn with(mut self, name: &str, template: SpecTemplate) -> Self {
        self.templates.insert(name.to_owned(), template);
        self
    }

    /// Sets the default template.
    #[must_use]
    pub fn with_default(mut self, template: SpecTemplate) -> Self {
        self.fallback = Some(template);
        self
    }
}

impl SpecSource for StaticSpecs {
    fn load(&self, name: &str) -> Result<SpecTemplate, SpecError> {
        Ok(self
            .templates
            .get(name)
            .or(self.fallback.as_ref())
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug, Default)]
struct RunnerScript {
    responses: VecDeque<CommandOutput>,
    invocations: Vec<CommandInvocation>,
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    script: Arc<Mutex<RunnerScript>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RunnerScript> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.lock().invocations.clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.lock().responses.push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ShellError> {
        let mut script = self.lock();
        script.invocations.push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        script
            .responses
            .pop_front()
            .ok_or_else(|| ShellError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
