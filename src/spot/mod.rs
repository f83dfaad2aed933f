//! Spot launch and the termination/save orchestrator.
//!
//! [`SpotController`] enforces name uniqueness before provisioning, picks an
//! instance class, provisions on the spot market, and starts one
//! [`InterruptionMonitor`] per live instance. [`SpotController::stop`] is
//! the single path both the operator and the monitor use to retire an
//! instance, so a double stop converges on the same provider state.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::chain::SavedArtifacts;
use crate::error::LifecycleError;
use crate::instance::{AddressChoice, InstanceController, InstanceResult};
use crate::monitor::{InterruptionMonitor, MonitorHandle};
use crate::provider::{LaunchSpec, Provider, ResourceRecord, SpotStatus, TagFilter};
use crate::remote::RemoteShell;
use crate::resource::{Disk, Instance, Kind, Lookup, ResourceHandle};
use crate::selector::{CatalogRow, Selection, SortKey, join_prices, select};
use crate::wait::Probe;

/// Order of the terminate and save steps when stopping with a save.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SaveOrdering {
    /// Terminate first, then snapshot the detached disk.
    #[default]
    TerminateFirst,
    /// Snapshot the attached disk, then terminate.
    SaveFirst,
}

impl FromStr for SaveOrdering {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "terminate-first" => Ok(Self::TerminateFirst),
            "save-first" => Ok(Self::SaveFirst),
            other => Err(format!(
                "unknown save ordering '{other}'; expected terminate-first or save-first"
            )),
        }
    }
}

impl fmt::Display for SaveOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TerminateFirst => "terminate-first",
            Self::SaveFirst => "save-first",
        })
    }
}

/// How to stop an instance.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StopOptions {
    /// Save the root disk as an image before it is deleted.
    pub save: bool,
    /// Order of the terminate and save steps.
    pub ordering: SaveOrdering,
    /// Capability to enable, applied through an on-demand relaunch.
    pub enable_feature: Option<String>,
}

/// How to launch an instance.
#[derive(Clone, Debug, Default)]
pub struct LaunchOptions {
    /// Catalog filter choosing the instance class.
    pub select: Option<Selection>,
    /// Operator sort keys applied before price.
    pub sort: Vec<SortKey>,
    /// Address to attach after launch.
    pub address: Option<AddressChoice>,
    /// Root disk size override in gigabytes.
    pub volume_size_gb: Option<u64>,
    /// Provision on the spot market and watch for interruption.
    pub spot: bool,
}

/// A launched and prepared instance.
#[derive(Debug)]
pub struct LaunchedInstance {
    /// Handle bound to the new instance.
    pub handle: ResourceHandle<Instance>,
    /// Machine name.
    pub name: String,
    /// Spot request identifier, for spot launches.
    pub request_id: Option<String>,
    /// Interruption monitor, for spot launches.
    pub monitor: Option<MonitorHandle>,
    /// Catalog row chosen by the selector, when one was requested.
    pub selected: Option<CatalogRow>,
    /// Address attached after launch.
    pub address: Option<IpAddr>,
}

/// Cancellation tokens of the running monitors, keyed by machine name.
/// Each registration gets a fresh generation so a finished monitor only
/// removes its own entry.
#[derive(Debug, Default)]
struct MonitorRegistry {
    next_generation: u64,
    active: HashMap<String, (u64, CancellationToken)>,
}

impl MonitorRegistry {
    fn register(
        &mut self,
        name: &str,
        token: CancellationToken,
    ) -> (u64, Option<CancellationToken>) {
        self.next_generation = self.next_generation.wrapping_add(1);
        let generation = self.next_generation;
        let replaced = self
            .active
            .insert(name.to_owned(), (generation, token))
            .map(|(_, previous)| previous);
        (generation, replaced)
    }

    fn release(&mut self, name: &str, generation: u64) {
        if self
            .active
            .get(name)
            .is_some_and(|(current, _)| *current == generation)
        {
            self.active.remove(name);
        }
    }
}

/// Launches and retires named machines.
pub struct SpotController<P, S> {
    instances: InstanceController<P, S>,
    monitors: Arc<Mutex<MonitorRegistry>>,
}

impl<P, S> Clone for SpotController<P, S> {
    fn clone(&self) -> Self {
        Self {
            instances: self.instances.clone(),
            monitors: Arc::clone(&self.monitors),
        }
    }
}

impl<P: Provider + 'static, S: RemoteShell + 'static> SpotController<P, S> {
    /// Wraps an instance controller.
    #[must_use]
    pub fn new(instances: InstanceController<P, S>) -> Self {
        Self {
            instances,
            monitors: Arc::new(Mutex::new(MonitorRegistry::default())),
        }
    }

    /// The underlying instance controller.
    #[must_use]
    pub const fn instances(&self) -> &InstanceController<P, S> {
        &self.instances
    }

    fn provider(&self) -> &P {
        self.instances.provider().as_ref()
    }

    fn monitors(&self) -> MutexGuard<'_, MonitorRegistry> {
        self.monitors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` while a monitor is registered for `name`.
    #[must_use]
    pub fn is_watching(&self, name: &str) -> bool {
        self.monitors().active.contains_key(name)
    }

    /// Fails when `name` is held by a live instance or by any disk.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NameCollision`] naming the holder.
    pub async fn ensure_name_free(&self, name: &str) -> InstanceResult<(), P> {
        let filter = TagFilter::name(name);
        let instances = self
            .provider()
            .list(Instance::KIND, &filter)
            .await
            .map_err(LifecycleError::Provider)?;
        if let Some(live) = instances.iter().find(|record| record.is_live()) {
            return Err(LifecycleError::NameCollision {
                name: name.to_owned(),
                kind: Instance::KIND,
                id: live.id.clone(),
            });
        }
        let disks = self
            .provider()
            .list(Disk::KIND, &filter)
            .await
            .map_err(LifecycleError::Provider)?;
        if let Some(disk) = disks.first() {
            return Err(LifecycleError::NameCollision {
                name: name.to_owned(),
                kind: Disk::KIND,
                id: disk.id.clone(),
            });
        }
        Ok(())
    }

    /// Joins the catalog with market prices and picks one class.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Selection`] when no class matches.
    pub async fn select_type(
        &self,
        selection: &Selection,
        sort: &[SortKey],
    ) -> InstanceResult<CatalogRow, P> {
        let catalog = self
            .provider()
            .instance_types()
            .await
            .map_err(LifecycleError::Provider)?;
        let prices = self
            .provider()
            .market_prices()
            .await
            .map_err(LifecycleError::Provider)?;
        let rows = join_prices(&catalog, &prices);
        let chosen = select(&rows, selection, sort)?;
        tracing::info!(
            %selection,
            instance_type = %chosen.instance_type,
            zone = %chosen.zone,
            price = chosen.price,
            "instance class selected"
        );
        Ok(chosen)
    }

    /// Launches the machine `name` and prepares it for use.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NameCollision`] when the name is taken,
    /// [`LifecycleError::Provisioning`] when the spot request is not
    /// fulfilled, or the first failing setup step.
    pub async fn launch(
        &self,
        name: &str,
        options: &LaunchOptions,
    ) -> InstanceResult<LaunchedInstance, P> {
        self.ensure_name_free(name).await?;
        let selected = match options.select.as_ref() {
            Some(selection) => Some(self.select_type(selection, &options.sort).await?),
            None => None,
        };
        let mut spec = self
            .instances
            .resolve_spec(name, selected.as_ref().map(|row| row.instance_type.as_str()))
            .await?;
        if let Some(row) = selected.as_ref() {
            spec.zone.clone_from(&row.zone);
        }
        if let Some(size) = options.volume_size_gb {
            spec.disk_size_gb = Some(size);
        }

        let (handle, request_id) = if options.spot {
            let (spot_handle, request) = self.provision_spot(&spec).await?;
            (spot_handle, Some(request))
        } else {
            (self.instances.create(&spec).await?, None)
        };
        let monitor = request_id
            .as_deref()
            .map(|request| self.watch(request, name));

        self.instances.post_launch(&handle).await?;
        let address = match options.address {
            Some(choice) => Some(self.instances.set_address(&handle, choice).await?),
            None => None,
        };
        Ok(LaunchedInstance {
            handle,
            name: name.to_owned(),
            request_id,
            monitor,
            selected,
            address,
        })
    }

    async fn provision_spot(
        &self,
        spec: &LaunchSpec,
    ) -> InstanceResult<(ResourceHandle<Instance>, String), P> {
        spec.validate()?;
        let name = spec.name.as_str();
        tracing::info!(
            name,
            instance_type = %spec.instance_type,
            zone = %spec.zone,
            "requesting spot instance"
        );
        let request_id = self
            .provider()
            .request_spot(spec)
            .await
            .map_err(LifecycleError::Provider)?;

        let provider = self.provider();
        let request = request_id.as_str();
        let instance_id = self
            .instances
            .settings()
            .state_waiter()
            .until(&format!("spot request {request_id}"), || async move {
                let probe = match provider.describe_spot_request(request).await? {
                    Some(record) => match (record.status, record.instance_id) {
                        (SpotStatus::Fulfilled, Some(instance_id)) => Probe::Ready(instance_id),
                        (
                            SpotStatus::Fulfilled
                            | SpotStatus::PendingEvaluation
                            | SpotStatus::PendingFulfillment,
                            _,
                        ) => Probe::Pending,
                        (status, _) => Probe::Failed(format!("request ended as {status}")),
                    },
                    None => Probe::Pending,
                };
                Ok::<_, P::Error>(probe)
            })
            .await
            .map_err(|err| LifecycleError::Provisioning {
                name: name.to_owned(),
                message: err.to_string(),
            })?;
        tracing::info!(
            name,
            request = %request_id,
            instance = %instance_id,
            "spot request fulfilled"
        );

        let handle = self.instances.adopt(spec, &instance_id).await?;
        Ok((handle, request_id))
    }

    /// Starts the interruption monitor for `name`, replacing any earlier
    /// monitor registered under the same name. The registration is dropped
    /// once the monitor exits, however it ends.
    #[must_use]
    pub fn watch(&self, request_id: &str, name: &str) -> MonitorHandle {
        let settings = self.instances.settings();
        let ordering = settings.save_ordering().unwrap_or_default();
        let controller = self.clone();
        let monitor = InterruptionMonitor::new(
            Arc::clone(self.instances.provider()),
            request_id,
            name,
        )
        .with_poll_interval(settings.poll_interval())
        .with_max_read_failures(settings.monitor_max_read_failures);
        let handle = monitor.spawn(move |machine| async move {
            let options = StopOptions {
                save: true,
                ordering,
                enable_feature: None,
            };
            controller.stop_by_name(&machine, &options).await.map(drop)
        });
        let (generation, replaced) = self.monitors().register(name, handle.cancellation_token());
        if let Some(token) = replaced {
            token.cancel();
        }

        let registry = Arc::clone(&self.monitors);
        let finished = handle.cancellation_token();
        let machine = name.to_owned();
        tokio::spawn(async move {
            finished.cancelled().await;
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .release(&machine, generation);
        });
        handle
    }

    fn cancel_monitor(&self, name: &str) {
        let token = self.monitors().active.remove(name);
        if let Some((_, existing)) = token {
            existing.cancel();
            tracing::debug!(name, "interruption monitor cancelled");
        }
    }

    /// Resolves `name` and stops the instance it names.
    ///
    /// # Errors
    ///
    /// See [`SpotController::stop`].
    pub async fn stop_by_name(
        &self,
        name: &str,
        options: &StopOptions,
    ) -> InstanceResult<Option<SavedArtifacts>, P> {
        let mut handle =
            ResourceHandle::<Instance>::resolve(self.provider(), Lookup::Text(name)).await?;
        if !handle.is_bound() {
            tracing::warn!(name, "no instance carries this name");
            return Ok(None);
        }
        self.stop(&mut handle, options).await
    }

    /// Stops an instance, leaving exactly one of: the name released with a
    /// fresh image and snapshot and the disk deleted; the name released with
    /// the disk deleted and nothing saved; or, when the save chain fails,
    /// the instance terminated and the disk kept under its name.
    ///
    /// A vanished, terminated, or already-released instance is logged and
    /// left alone, so a concurrent second stop is harmless.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::SaveIncomplete`] when the save chain fails,
    /// or the failing provider call.
    pub async fn stop(
        &self,
        handle: &mut ResourceHandle<Instance>,
        options: &StopOptions,
    ) -> InstanceResult<Option<SavedArtifacts>, P> {
        let Some(record) = self.instances.live_record(handle).await? else {
            return Ok(None);
        };
        let name = record.name().to_owned();
        if name.is_empty() {
            tracing::warn!(
                instance = %record.id,
                "instance name already released; stop in progress elsewhere"
            );
            return Ok(None);
        }
        self.cancel_monitor(&name);

        if let Some(feature) = options.enable_feature.as_deref() {
            return self
                .apply_feature_via_relaunch(handle, &record, &name, feature)
                .await;
        }
        self.retire(handle, &record, &name, options.save, options.ordering)
            .await
    }

    async fn retire(
        &self,
        handle: &mut ResourceHandle<Instance>,
        record: &ResourceRecord,
        name: &str,
        save: bool,
        ordering: SaveOrdering,
    ) -> InstanceResult<Option<SavedArtifacts>, P> {
        let disks = self
            .provider()
            .attached_disks(&record.id)
            .await
            .map_err(LifecycleError::Provider)?;
        let mut disk = disks
            .first()
            .map(|first| ResourceHandle::<Disk>::bound(first.id.clone()));
        let chain = self.instances.chain();

        let Some(captured) = disk.as_mut() else {
            if save {
                return Err(LifecycleError::NoDisk {
                    instance_id: record.id.clone(),
                });
            }
            self.instances.terminate(handle, false).await?;
            return Ok(None);
        };

        if !save {
            tracing::info!(name, instance = %record.id, "stopping without save");
            self.instances.terminate(handle, false).await?;
            chain.delete_disk(captured).await?;
            return Ok(None);
        }

        tracing::info!(name, instance = %record.id, %ordering, "stopping with save");
        let saved = match ordering {
            SaveOrdering::TerminateFirst => {
                self.instances.terminate(handle, false).await?;
                self.save(captured, name).await?
            }
            SaveOrdering::SaveFirst => {
                let artifacts = self.save(captured, name).await?;
                self.instances.terminate(handle, false).await?;
                artifacts
            }
        };
        chain.delete_disk(captured).await?;
        Ok(Some(saved))
    }

    async fn save(
        &self,
        disk: &ResourceHandle<Disk>,
        name: &str,
    ) -> InstanceResult<SavedArtifacts, P> {
        self.instances
            .chain()
            .save(disk, name)
            .await
            .map_err(|err| {
                let disk_id = disk.id().unwrap_or_default().to_owned();
                tracing::error!(
                    name,
                    disk = %disk_id,
                    error = %err,
                    "save failed; disk kept under its name"
                );
                LifecycleError::SaveIncomplete {
                    name: name.to_owned(),
                    disk_id,
                    message: err.to_string(),
                }
            })
    }

    /// Spot instances cannot be stopped, so the feature is applied to an
    /// on-demand relaunch of a fresh image, which is then saved again.
    async fn apply_feature_via_relaunch(
        &self,
        handle: &mut ResourceHandle<Instance>,
        record: &ResourceRecord,
        name: &str,
        feature: &str,
    ) -> InstanceResult<Option<SavedArtifacts>, P> {
        tracing::info!(name, feature, "saving before relaunch to enable feature");
        self.retire(handle, record, name, true, SaveOrdering::SaveFirst)
            .await?;

        let spec = self
            .instances
            .resolve_spec(name, record.instance_type.as_deref())
            .await?;
        let mut relaunched = self.instances.create(&spec).await?;
        tracing::info!(name, instance = ?relaunched.id(), feature, "relaunched on demand");
        self.instances
            .stop(&mut relaunched, true, Some(feature))
            .await
    }

    /// Releases the instance's name and terminates it, stopping its monitor.
    ///
    /// # Errors
    ///
    /// See [`InstanceController::terminate`].
    pub async fn terminate(
        &self,
        handle: &mut ResourceHandle<Instance>,
        delete_disks: bool,
    ) -> InstanceResult<(), P> {
        if let Ok(record) = handle.record(self.provider()).await {
            self.cancel_monitor(record.name());
        }
        self.instances.terminate(handle, delete_disks).await
    }
}
