//! Single-instance lifecycle.
//!
//! [`InstanceController`] resolves launch parameters, creates and prepares
//! instances, and stops or terminates them. It never caches provider state:
//! every decision re-reads the instance through its handle.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use reqwest::StatusCode;

use crate::chain::{DiskChain, SavedArtifacts};
use crate::config::LifecycleConfig;
use crate::error::LifecycleError;
use crate::provider::{
    InstanceAction, LaunchSpec, Provider, ResourceRecord, TagFilter, Tags, USER_TAG, state,
};
use crate::remote::{RemoteShell, Session, ShellError};
use crate::resource::{Disk, Image, Instance, Kind, ResourceHandle};
use crate::spec_store::{LaunchDefaults, SpecSource};
use crate::wait::Probe;

mod tuning;

pub use tuning::commands_for as tuning_commands;

const SERVICE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

static SERVICE_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(SERVICE_PROBE_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Result alias for controller operations.
pub type InstanceResult<T, P> = Result<T, LifecycleError<<P as Provider>::Error>>;

/// Dependencies injected into the controllers.
pub struct Context<P, S> {
    /// Cloud provider client.
    pub provider: Arc<P>,
    /// Remote shell used for post-launch setup.
    pub shell: Arc<S>,
    /// Source of per-name launch templates.
    pub specs: Arc<dyn SpecSource>,
    /// Values used where a template is silent.
    pub defaults: LaunchDefaults,
    /// Wait and save tunables.
    pub settings: LifecycleConfig,
}

/// Address to attach to an instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddressChoice {
    /// A specific reserved address.
    Address(IpAddr),
    /// Position in the provider's reserved address list.
    Index(usize),
}

impl FromStr for AddressChoice {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if let Ok(address) = trimmed.parse::<IpAddr>() {
            return Ok(Self::Address(address));
        }
        trimmed
            .parse::<usize>()
            .map(Self::Index)
            .map_err(|_| format!("'{value}' is neither an IP address nor an address index"))
    }
}

impl fmt::Display for AddressChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(address) => write!(f, "{address}"),
            Self::Index(index) => write!(f, "#{index}"),
        }
    }
}

/// Controls one instance at a time on behalf of a named machine.
pub struct InstanceController<P, S> {
    provider: Arc<P>,
    shell: Arc<S>,
    specs: Arc<dyn SpecSource>,
    defaults: LaunchDefaults,
    settings: LifecycleConfig,
}

impl<P, S> Clone for InstanceController<P, S> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            shell: Arc::clone(&self.shell),
            specs: Arc::clone(&self.specs),
            defaults: self.defaults.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<P: Provider, S: RemoteShell> InstanceController<P, S> {
    /// Builds a controller from injected dependencies.
    #[must_use]
    pub fn new(context: Context<P, S>) -> Self {
        Self {
            provider: context.provider,
            shell: context.shell,
            specs: context.specs,
            defaults: context.defaults,
            settings: context.settings,
        }
    }

    /// Provider client.
    #[must_use]
    pub const fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// Wait and save tunables.
    #[must_use]
    pub const fn settings(&self) -> &LifecycleConfig {
        &self.settings
    }

    /// Save chain bound to this controller's provider.
    #[must_use]
    pub fn chain(&self) -> DiskChain<'_, P> {
        DiskChain::new(self.provider.as_ref(), &self.settings)
    }

    /// Resolves the launch parameters for `name`.
    ///
    /// The per-name template (or the default template) is layered over the
    /// configured defaults, `instance_type` overrides the class, and the
    /// newest available image saved under `name` replaces the template image.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::EmptyName`] for a blank name and
    /// [`LifecycleError::Spec`] when the template cannot be read.
    pub async fn resolve_spec(
        &self,
        name: &str,
        instance_type: Option<&str>,
    ) -> InstanceResult<LaunchSpec, P> {
        if name.trim().is_empty() {
            return Err(LifecycleError::EmptyName);
        }
        let template = self.specs.load(name)?;
        let mut spec = template.layer(&self.defaults, name);
        if let Some(class) = instance_type {
            class.clone_into(&mut spec.instance_type);
        }

        match self.provider.list(Image::KIND, &TagFilter::name(name)).await {
            Ok(images) => {
                if let Some(newest) = images
                    .iter()
                    .rev()
                    .find(|image| image.is_in_state(state::AVAILABLE))
                {
                    tracing::info!(name, image = %newest.id, "launching from saved image");
                    spec.image.clone_from(&newest.id);
                }
            }
            Err(err) => {
                tracing::warn!(
                    name,
                    error = %err,
                    "saved image lookup failed; using template image"
                );
            }
        }
        Ok(spec)
    }

    /// Submits an on-demand launch and waits until the instance runs.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidSpec`] for an incomplete spec, or the
    /// provider or wait failure.
    pub async fn create(&self, spec: &LaunchSpec) -> InstanceResult<ResourceHandle<Instance>, P> {
        spec.validate()?;
        let record = self
            .provider
            .create_instance(spec)
            .await
            .map_err(LifecycleError::Provider)?;
        tracing::info!(
            name = %spec.name,
            instance = %record.id,
            instance_type = %spec.instance_type,
            "instance created"
        );
        self.adopt(spec, &record.id).await
    }

    /// Binds a freshly created instance to `spec.name`, records the login
    /// user, and waits until it runs.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when tagging or the wait fails.
    pub async fn adopt(
        &self,
        spec: &LaunchSpec,
        instance_id: &str,
    ) -> InstanceResult<ResourceHandle<Instance>, P> {
        let mut handle = ResourceHandle::<Instance>::pending(spec.name.clone());
        let mut tags = Tags::new();
        tags.insert(USER_TAG.to_owned(), spec.user.clone());
        handle.set_tags(self.provider.as_ref(), &tags).await?;
        handle.bind(self.provider.as_ref(), instance_id).await?;
        self.wait_running(instance_id).await?;
        Ok(handle)
    }

    /// Blocks until instance `id` reports `running`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Wait`] when the instance terminates first.
    pub async fn wait_running(&self, id: &str) -> InstanceResult<ResourceRecord, P> {
        self.wait_for_state(id, state::RUNNING).await
    }

    /// Blocks until instance `id` reports `stopped`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Wait`] when the instance terminates first.
    pub async fn wait_stopped(&self, id: &str) -> InstanceResult<ResourceRecord, P> {
        self.wait_for_state(id, state::STOPPED).await
    }

    async fn wait_for_state(&self, id: &str, target: &str) -> InstanceResult<ResourceRecord, P> {
        let provider = self.provider.as_ref();
        let what = format!("instance {id} to be {target}");
        let record = self
            .settings
            .state_waiter()
            .until(&what, || async move {
                let probe = match provider.describe(Instance::KIND, id).await? {
                    Some(record) if record.is_in_state(target) => Probe::Ready(record),
                    Some(record)
                        if record.is_in_state(state::TERMINATED)
                            || record.is_in_state(state::ERROR) =>
                    {
                        Probe::Failed(format!("instance {id} is {}", record.state))
                    }
                    Some(_) => Probe::Pending,
                    None => Probe::Failed(format!("instance {id} no longer exists")),
                };
                Ok::<_, P::Error>(probe)
            })
            .await?;
        Ok(record)
    }

    /// Prepares a running instance: names its root disk, waits for the
    /// remote shell, sets the time zone, and applies accelerator tuning.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NoAddress`] when the instance has no public
    /// address, or the first failing remote command.
    pub async fn post_launch(&self, handle: &ResourceHandle<Instance>) -> InstanceResult<(), P> {
        let record = handle.record(self.provider.as_ref()).await?;
        let name = record.name();
        self.name_root_disk(&record.id, name).await?;

        let host = record.public_ip.ok_or_else(|| LifecycleError::NoAddress {
            instance_id: record.id.clone(),
        })?;
        let user = record
            .tags
            .get(USER_TAG)
            .map_or(self.defaults.user.as_str(), String::as_str);
        let session = Session::new(self.shell.as_ref(), self.shell.target(host, user));
        self.wait_for_shell(&session).await?;

        let timezone = &self.settings.timezone;
        session
            .sudo(&format!("ln -sf /usr/share/zoneinfo/{timezone} /etc/localtime"))
            .await?;
        if let Some(instance_type) = record.instance_type.as_deref() {
            Self::tune(&session, instance_type).await?;
        }
        tracing::info!(name, instance = %record.id, %host, "instance ready");
        Ok(())
    }

    async fn name_root_disk(&self, instance_id: &str, name: &str) -> InstanceResult<(), P> {
        let disks = self
            .provider
            .attached_disks(instance_id)
            .await
            .map_err(LifecycleError::Provider)?;
        let Some(root) = disks.first() else {
            tracing::warn!(name, instance = %instance_id, "no attached disk to name");
            return Ok(());
        };
        ResourceHandle::<Disk>::bound(root.id.clone())
            .set_name(self.provider.as_ref(), name)
            .await
    }

    async fn wait_for_shell(&self, session: &Session<'_, S>) -> InstanceResult<(), P> {
        let what = format!("ssh on {}", session.target().host);
        self.settings
            .shell_waiter()
            .until(&what, || async move {
                let output = session.run("runlevel").await?;
                let probe = if output.is_success() {
                    Probe::Ready(())
                } else {
                    Probe::Pending
                };
                Ok::<_, ShellError>(probe)
            })
            .await?;
        Ok(())
    }

    async fn tune(session: &Session<'_, S>, instance_type: &str) -> InstanceResult<(), P> {
        let commands = tuning::commands_for(instance_type);
        for command in commands {
            session.sudo(command).await?;
        }
        if !commands.is_empty() {
            tracing::info!(instance_type, count = commands.len(), "accelerator tuned");
        }
        Ok(())
    }

    /// Stops the instance. When `enable_feature` is set the feature is
    /// enabled once the instance has stopped. When `save` is set the root
    /// disk is saved while stopped, then the instance is terminated and the
    /// disk deleted.
    ///
    /// A vanished or terminated instance is logged and left alone.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::SaveIncomplete`] when the save chain fails;
    /// the instance and disk are then left in place.
    pub async fn stop(
        &self,
        handle: &mut ResourceHandle<Instance>,
        save: bool,
        enable_feature: Option<&str>,
    ) -> InstanceResult<Option<SavedArtifacts>, P> {
        let Some(record) = self.live_record(handle).await? else {
            return Ok(None);
        };
        let id = record.id.as_str();
        if !record.is_in_state(state::STOPPED) && !record.is_in_state(state::STOPPING) {
            self.provider
                .instance_action(id, InstanceAction::Stop)
                .await
                .map_err(LifecycleError::Provider)?;
            tracing::info!(instance = %id, "stop requested");
        }
        if save || enable_feature.is_some() {
            self.wait_stopped(id).await?;
        }
        if let Some(feature) = enable_feature {
            self.provider
                .enable_feature(id, feature)
                .await
                .map_err(LifecycleError::Provider)?;
            tracing::info!(instance = %id, feature, "feature enabled");
        }
        if !save {
            return Ok(None);
        }

        let name = record.name().to_owned();
        let disks = self
            .provider
            .attached_disks(id)
            .await
            .map_err(LifecycleError::Provider)?;
        let Some(root) = disks.first() else {
            return Err(LifecycleError::NoDisk {
                instance_id: id.to_owned(),
            });
        };
        let mut disk = ResourceHandle::<Disk>::bound(root.id.clone());
        let saved = self
            .chain()
            .save(&disk, &name)
            .await
            .map_err(|err| LifecycleError::SaveIncomplete {
                name: name.clone(),
                disk_id: root.id.clone(),
                message: err.to_string(),
            })?;
        self.terminate(handle, false).await?;
        self.chain().delete_disk(&mut disk).await?;
        Ok(Some(saved))
    }

    /// Releases the instance's name and terminates it, optionally deleting
    /// the disks that were attached. Terminating an instance that is already
    /// gone or terminated is logged and succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the instance still exists but cannot
    /// be untagged or terminated.
    pub async fn terminate(
        &self,
        handle: &mut ResourceHandle<Instance>,
        delete_disks: bool,
    ) -> InstanceResult<(), P> {
        let Some(record) = self.live_record(handle).await? else {
            return Ok(());
        };
        let disks = if delete_disks {
            self.provider
                .attached_disks(&record.id)
                .await
                .map_err(LifecycleError::Provider)?
        } else {
            Vec::new()
        };

        handle.release_name(self.provider.as_ref()).await?;
        if let Err(err) = self
            .provider
            .instance_action(&record.id, InstanceAction::Terminate)
            .await
        {
            let current = self
                .provider
                .describe(Instance::KIND, &record.id)
                .await
                .map_err(LifecycleError::Provider)?;
            if current.is_some_and(|after| !after.is_in_state(state::TERMINATED)) {
                return Err(LifecycleError::Provider(err));
            }
            tracing::warn!(
                instance = %record.id,
                error = %err,
                "instance was terminated concurrently"
            );
        } else {
            tracing::info!(instance = %record.id, "instance terminated");
        }

        let chain = self.chain();
        for disk in disks {
            chain.delete_disk(&mut ResourceHandle::bound(disk.id)).await?;
        }
        Ok(())
    }

    /// Reads the instance, returning `None` (and logging) when it is gone or
    /// already terminated.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] for pending handles and provider failures.
    pub async fn live_record(
        &self,
        handle: &ResourceHandle<Instance>,
    ) -> InstanceResult<Option<ResourceRecord>, P> {
        match handle.record(self.provider.as_ref()).await {
            Ok(record) if record.is_in_state(state::TERMINATED) => {
                tracing::warn!(instance = %record.id, "instance already terminated");
                Ok(None)
            }
            Ok(record) => Ok(Some(record)),
            Err(LifecycleError::Gone { id, .. }) => {
                tracing::warn!(instance = %id, "instance no longer exists");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Attaches a reserved address to the instance and returns it.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::AddressIndex`] when an index is outside the
    /// reserved list, or the provider failure.
    pub async fn set_address(
        &self,
        handle: &ResourceHandle<Instance>,
        choice: AddressChoice,
    ) -> InstanceResult<IpAddr, P> {
        let record = handle.record(self.provider.as_ref()).await?;
        let address = match choice {
            AddressChoice::Address(address) => address,
            AddressChoice::Index(index) => {
                let reserved = self
                    .provider
                    .addresses()
                    .await
                    .map_err(LifecycleError::Provider)?;
                reserved
                    .get(index)
                    .copied()
                    .ok_or_else(|| LifecycleError::AddressIndex {
                        index,
                        available: reserved.len(),
                    })?
            }
        };
        self.provider
            .associate_address(&record.id, address)
            .await
            .map_err(LifecycleError::Provider)?;
        tracing::info!(instance = %record.id, %address, "address associated");
        Ok(address)
    }

    /// Polls `http://<public address>:<port>` until it answers 200 and
    /// returns the URL.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Endpoint`] when the wait gives up.
    pub async fn wait_for_service(
        &self,
        handle: &ResourceHandle<Instance>,
        port: u16,
    ) -> InstanceResult<String, P> {
        let record = handle.record(self.provider.as_ref()).await?;
        let host = record.public_ip.ok_or_else(|| LifecycleError::NoAddress {
            instance_id: record.id.clone(),
        })?;
        let url = format!("http://{}", SocketAddr::new(host, port));
        let target = url.as_str();
        self.settings
            .service_waiter()
            .until(&format!("service at {url}"), || async move {
                let response = SERVICE_CLIENT.get(target).send().await?;
                let probe = if response.status() == StatusCode::OK {
                    Probe::Ready(())
                } else {
                    Probe::Pending
                };
                Ok::<_, reqwest::Error>(probe)
            })
            .await
            .map_err(|err| LifecycleError::Endpoint {
                url: url.clone(),
                message: err.to_string(),
            })?;
        tracing::info!(instance = %record.id, %url, "service answering");
        Ok(url)
    }
}

#[cfg(test)]
mod tests;
