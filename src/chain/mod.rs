//! Disk to snapshot to image save chain.
//!
//! Every step blocks until the provider confirms completion. Superseded
//! images are only retired once the newest one is available, so a name
//! that had an image before a save never ends up with none. Snapshots are
//! kept as rollback versions.

use uuid::Uuid;

use crate::config::LifecycleConfig;
use crate::error::LifecycleError;
use crate::provider::{Provider, ResourceKind, ResourceRecord, TagFilter, state};
use crate::resource::{Disk, Image, Kind, ResourceHandle, Snapshot};
use crate::wait::{Probe, Waiter};

type ChainResult<T, P> = Result<T, LifecycleError<<P as Provider>::Error>>;

/// Durable artefacts produced by [`DiskChain::save`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SavedArtifacts {
    /// Snapshot of the saved disk.
    pub snapshot: ResourceHandle<Snapshot>,
    /// Image registered over the snapshot.
    pub image: ResourceHandle<Image>,
}

/// Runs the save chain against one provider.
#[derive(Debug)]
pub struct DiskChain<'a, P: Provider> {
    provider: &'a P,
    state_waiter: Waiter,
    snapshot_waiter: Waiter,
    image_waiter: Waiter,
}

impl<'a, P: Provider> DiskChain<'a, P> {
    /// Builds a chain using the configured waiters.
    #[must_use]
    pub const fn new(provider: &'a P, settings: &LifecycleConfig) -> Self {
        Self {
            provider,
            state_waiter: settings.state_waiter(),
            snapshot_waiter: settings.snapshot_waiter(),
            image_waiter: settings.image_waiter(),
        }
    }

    async fn wait_available(
        &self,
        waiter: Waiter,
        kind: ResourceKind,
        id: &str,
    ) -> ChainResult<ResourceRecord, P> {
        let provider = self.provider;
        let what = format!("{kind} {id} to become available");
        let record = waiter
            .until(&what, || async move {
                let probe = match provider.describe(kind, id).await? {
                    Some(record) if record.is_in_state(state::AVAILABLE) => Probe::Ready(record),
                    Some(record) if record.is_in_state(state::ERROR) => {
                        Probe::Failed(format!("{kind} {id} entered the error state"))
                    }
                    Some(_) | None => Probe::Pending,
                };
                Ok::<_, P::Error>(probe)
            })
            .await?;
        Ok(record)
    }

    /// Snapshots `disk`, waits for completion, and names the snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the snapshot request, the wait, or the
    /// tag write fails.
    pub async fn create_copy(
        &self,
        disk: &ResourceHandle<Disk>,
        name: &str,
    ) -> ChainResult<ResourceHandle<Snapshot>, P> {
        let disk_record = disk.record(self.provider).await?;
        let created = self
            .provider
            .create_snapshot(&disk_record.id)
            .await
            .map_err(LifecycleError::Provider)?;
        tracing::info!(name, disk = %disk_record.id, snapshot = %created.id, "snapshot started");
        self.wait_available(self.snapshot_waiter, Snapshot::KIND, &created.id)
            .await?;

        let mut snapshot = ResourceHandle::bound(created.id);
        snapshot.set_name(self.provider, name).await?;

        let count = self
            .provider
            .list(Snapshot::KIND, &TagFilter::name(name))
            .await
            .map_err(LifecycleError::Provider)?
            .len();
        tracing::info!(name, count, "you now have {count} {name} snapshots");
        Ok(snapshot)
    }

    /// Registers an image over `copy` under a throwaway label, waits for it
    /// to become available, then names it.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when registration, the wait, or the tag
    /// write fails.
    pub async fn promote_to_image(
        &self,
        copy: &ResourceHandle<Snapshot>,
        name: &str,
    ) -> ChainResult<ResourceHandle<Image>, P> {
        let copy_record = copy.record(self.provider).await?;
        let label = format!("spotkeep-{}", Uuid::new_v4().simple());
        let registered = self
            .provider
            .register_image(&copy_record.id, &label)
            .await
            .map_err(LifecycleError::Provider)?;
        tracing::info!(name, image = %registered.id, %label, "image registered");
        self.wait_available(self.image_waiter, Image::KIND, &registered.id)
            .await?;

        let mut image = ResourceHandle::bound(registered.id);
        image.set_name(self.provider, name).await?;
        Ok(image)
    }

    /// Deletes every version of `K` named `name` except the newest, provided
    /// the newest is available. Returns how many versions were deleted.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Provider`] when listing or deleting fails.
    pub async fn retire_superseded<K: Kind>(&self, name: &str) -> ChainResult<usize, P> {
        let versions = self
            .provider
            .list(K::KIND, &TagFilter::name(name))
            .await
            .map_err(LifecycleError::Provider)?;
        let Some((newest, older)) = versions.split_last() else {
            return Ok(0);
        };
        if !newest.is_in_state(state::AVAILABLE) {
            tracing::warn!(
                name,
                kind = %K::KIND,
                newest = %newest.id,
                state = %newest.state,
                "newest version not available; keeping older versions"
            );
            return Ok(0);
        }
        for record in older {
            self.provider
                .delete(K::KIND, &record.id)
                .await
                .map_err(LifecycleError::Provider)?;
            tracing::info!(name, kind = %K::KIND, id = %record.id, "retired superseded version");
        }
        Ok(older.len())
    }

    /// Snapshots `disk`, promotes the snapshot, and retires older images
    /// carrying `name`. Earlier snapshots accumulate; delete one to roll
    /// back past it.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's [`LifecycleError`].
    pub async fn save(
        &self,
        disk: &ResourceHandle<Disk>,
        name: &str,
    ) -> ChainResult<SavedArtifacts, P> {
        let snapshot = self.create_copy(disk, name).await?;
        let image = self.promote_to_image(&snapshot, name).await?;
        self.retire_superseded::<Image>(name).await?;
        let snapshots = self
            .provider
            .list(Snapshot::KIND, &TagFilter::name(name))
            .await
            .map_err(LifecycleError::Provider)?;
        tracing::info!(name, snapshots = snapshots.len(), "save complete");
        Ok(SavedArtifacts { snapshot, image })
    }

    /// Releases the disk's name, waits for it to detach, and deletes it.
    /// A disk that is already gone is logged and treated as deleted.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the disk still exists but cannot be
    /// untagged or deleted.
    pub async fn delete_disk(&self, disk: &mut ResourceHandle<Disk>) -> ChainResult<(), P> {
        let Some(id) = disk.id().map(str::to_owned) else {
            return Ok(());
        };
        if self.is_gone(&id).await? {
            tracing::warn!(disk = %id, "disk already deleted");
            return Ok(());
        }
        disk.release_name(self.provider).await?;

        let provider = self.provider;
        let detached = self
            .state_waiter
            .until(&format!("disk {id} to detach"), || {
                let disk_id = id.as_str();
                async move {
                    let probe = match provider.describe(Disk::KIND, disk_id).await? {
                        None => Probe::Ready(false),
                        Some(record)
                            if record.attached_to.is_none()
                                && !record.is_in_state(state::IN_USE) =>
                        {
                            Probe::Ready(true)
                        }
                        Some(_) => Probe::Pending,
                    };
                    Ok::<_, P::Error>(probe)
                }
            })
            .await?;
        if !detached {
            tracing::warn!(disk = %id, "disk vanished while detaching");
            return Ok(());
        }

        if let Err(err) = self.provider.delete(Disk::KIND, &id).await {
            if !self.is_gone(&id).await? {
                return Err(LifecycleError::Provider(err));
            }
            tracing::warn!(disk = %id, error = %err, "disk delete raced with another delete");
            return Ok(());
        }
        tracing::info!(disk = %id, "disk deleted");
        Ok(())
    }

    async fn is_gone(&self, id: &str) -> ChainResult<bool, P> {
        Ok(self
            .provider
            .describe(Disk::KIND, id)
            .await
            .map_err(LifecycleError::Provider)?
            .is_none())
    }
}

#[cfg(test)]
mod tests;
