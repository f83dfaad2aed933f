//! Name-addressed handles over provider resources.
//!
//! A [`ResourceHandle`] is either bound to a concrete provider identifier or
//! pending under a name with no backing object yet. Bound handles never cache
//! provider state: every attribute read re-describes the resource.

use std::fmt;
use std::marker::PhantomData;

use crate::error::LifecycleError;
use crate::provider::{NAME_TAG, Provider, ResourceKind, ResourceRecord, TagFilter, Tags};

/// Marker describing which provider resource kind a handle addresses.
pub trait Kind: Clone + fmt::Debug + Send + Sync + 'static {
    /// Provider resource kind.
    const KIND: ResourceKind;
}

macro_rules! kind_marker {
    ($(#[$meta:meta])* $name:ident => $kind:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
        pub struct $name;

        impl Kind for $name {
            const KIND: ResourceKind = ResourceKind::$kind;
        }
    };
}

kind_marker!(
    /// Compute instance marker.
    Instance => Instance
);
kind_marker!(
    /// Block disk marker.
    Disk => Disk
);
kind_marker!(
    /// Durable copy marker.
    Snapshot => Snapshot
);
kind_marker!(
    /// Bootable image marker.
    Image => Image
);

/// Identity behind a handle.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Binding {
    /// No provider object exists yet; the name will be applied on creation.
    Pending {
        /// Name the resource will carry.
        name: String,
    },
    /// Backed by a provider object.
    Bound {
        /// Provider identifier.
        id: String,
    },
}

/// Input accepted by [`ResourceHandle::resolve`].
#[derive(Clone, Copy, Debug)]
pub enum Lookup<'a, K: Kind> {
    /// An existing handle of the same kind.
    Handle(&'a ResourceHandle<K>),
    /// A record already fetched from the provider.
    Record(&'a ResourceRecord),
    /// A name or a provider identifier.
    Text(&'a str),
}

/// Handle over one instance, disk, snapshot, or image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResourceHandle<K: Kind> {
    binding: Binding,
    pending_tags: Tags,
    kind: PhantomData<K>,
}

type HandleResult<T, P> = Result<T, LifecycleError<<P as Provider>::Error>>;

impl<K: Kind> ResourceHandle<K> {
    /// Creates a placeholder for a resource that does not exist yet.
    #[must_use]
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            binding: Binding::Pending { name: name.into() },
            pending_tags: Tags::new(),
            kind: PhantomData,
        }
    }

    /// Creates a handle bound to a provider identifier.
    #[must_use]
    pub fn bound(id: impl Into<String>) -> Self {
        Self {
            binding: Binding::Bound { id: id.into() },
            pending_tags: Tags::new(),
            kind: PhantomData,
        }
    }

    /// Resolves a handle, a record, an id, or a name into a handle.
    ///
    /// Text is matched against the name tag first, taking the most recently
    /// created match, then against provider identifiers. Anything else is
    /// treated as the name of a resource still to be created.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::EmptyName`] for blank text,
    /// [`LifecycleError::KindMismatch`] for a record of another kind, and
    /// [`LifecycleError::Provider`] when a lookup call fails.
    pub async fn resolve<P: Provider>(
        provider: &P,
        lookup: Lookup<'_, K>,
    ) -> HandleResult<Self, P> {
        match lookup {
            Lookup::Handle(handle) => Ok(handle.clone()),
            Lookup::Record(record) => {
                if record.kind != K::KIND {
                    return Err(LifecycleError::KindMismatch {
                        expected: K::KIND,
                        actual: record.kind,
                        id: record.id.clone(),
                    });
                }
                Ok(Self::bound(record.id.clone()))
            }
            Lookup::Text(text) => Self::resolve_text(provider, text).await,
        }
    }

    async fn resolve_text<P: Provider>(provider: &P, text: &str) -> HandleResult<Self, P> {
        if text.trim().is_empty() {
            return Err(LifecycleError::EmptyName);
        }
        let filter = TagFilter::name(text);
        let by_name = provider
            .list(K::KIND, &filter)
            .await
            .map_err(LifecycleError::Provider)?;
        if let Some(newest) = by_name.last() {
            return Ok(Self::bound(newest.id.clone()));
        }
        let by_id = provider
            .describe(K::KIND, text)
            .await
            .map_err(LifecycleError::Provider)?;
        Ok(by_id.map_or_else(|| Self::pending(text), |record| Self::bound(record.id)))
    }

    /// Returns the identity behind the handle.
    #[must_use]
    pub const fn binding(&self) -> &Binding {
        &self.binding
    }

    /// Returns the provider identifier once bound.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        match &self.binding {
            Binding::Bound { id } => Some(id.as_str()),
            Binding::Pending { .. } => None,
        }
    }

    /// Returns `true` when a provider object backs the handle.
    #[must_use]
    pub const fn is_bound(&self) -> bool {
        matches!(self.binding, Binding::Bound { .. })
    }

    /// Returns the kind addressed by the handle.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        K::KIND
    }

    /// Re-reads the resource from the provider.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotCreated`] for a pending handle and
    /// [`LifecycleError::Gone`] when the resource no longer exists.
    pub async fn record<P: Provider>(&self, provider: &P) -> HandleResult<ResourceRecord, P> {
        match &self.binding {
            Binding::Pending { name } => Err(LifecycleError::NotCreated {
                kind: K::KIND,
                name: name.clone(),
            }),
            Binding::Bound { id } => provider
                .describe(K::KIND, id)
                .await
                .map_err(LifecycleError::Provider)?
                .ok_or_else(|| LifecycleError::Gone {
                    kind: K::KIND,
                    id: id.clone(),
                }),
        }
    }

    /// Returns the current name. Bound handles read it from the provider.
    ///
    /// # Errors
    ///
    /// Propagates [`ResourceHandle::record`] failures.
    pub async fn name<P: Provider>(&self, provider: &P) -> HandleResult<String, P> {
        match &self.binding {
            Binding::Pending { name } => Ok(name.clone()),
            Binding::Bound { .. } => Ok(self.record(provider).await?.name().to_owned()),
        }
    }

    /// Returns the current provider state.
    ///
    /// # Errors
    ///
    /// Propagates [`ResourceHandle::record`] failures.
    pub async fn state<P: Provider>(&self, provider: &P) -> HandleResult<String, P> {
        Ok(self.record(provider).await?.state)
    }

    /// Returns the tags, including tags staged on a pending handle.
    ///
    /// # Errors
    ///
    /// Propagates [`ResourceHandle::record`] failures.
    pub async fn tags<P: Provider>(&self, provider: &P) -> HandleResult<Tags, P> {
        match &self.binding {
            Binding::Pending { name } => {
                let mut tags = self.pending_tags.clone();
                tags.insert(NAME_TAG.to_owned(), name.clone());
                Ok(tags)
            }
            Binding::Bound { .. } => Ok(self.record(provider).await?.tags),
        }
    }

    /// Merges tags. Bound handles write through immediately; pending
    /// handles stage the tags until [`ResourceHandle::bind`].
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Provider`] when the remote write fails.
    pub async fn set_tags<P: Provider>(
        &mut self,
        provider: &P,
        tags: &Tags,
    ) -> HandleResult<(), P> {
        match &mut self.binding {
            Binding::Bound { id } => provider
                .set_tags(K::KIND, id, tags)
                .await
                .map_err(LifecycleError::Provider),
            Binding::Pending { name } => {
                for (key, value) in tags {
                    if key == NAME_TAG {
                        value.clone_into(name);
                    } else if value.is_empty() {
                        self.pending_tags.remove(key);
                    } else {
                        self.pending_tags.insert(key.clone(), value.clone());
                    }
                }
                Ok(())
            }
        }
    }

    /// Sets the name tag.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Provider`] when the remote write fails.
    pub async fn set_name<P: Provider>(&mut self, provider: &P, name: &str) -> HandleResult<(), P> {
        let mut tags = Tags::new();
        tags.insert(NAME_TAG.to_owned(), name.to_owned());
        self.set_tags(provider, &tags).await
    }

    /// Clears the name tag so the name can be reused.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Provider`] when the remote write fails.
    pub async fn release_name<P: Provider>(&mut self, provider: &P) -> HandleResult<(), P> {
        self.set_name(provider, "").await
    }

    /// Binds a pending handle to a freshly created object and applies the
    /// staged name and tags to it.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Provider`] when the tag write fails.
    pub async fn bind<P: Provider>(&mut self, provider: &P, id: &str) -> HandleResult<(), P> {
        let Binding::Pending { name } = &self.binding else {
            self.binding = Binding::Bound { id: id.to_owned() };
            return Ok(());
        };
        let mut staged = std::mem::take(&mut self.pending_tags);
        if !name.is_empty() {
            staged.insert(NAME_TAG.to_owned(), name.clone());
        }
        self.binding = Binding::Bound { id: id.to_owned() };
        if staged.is_empty() {
            return Ok(());
        }
        self.set_tags(provider, &staged).await
    }
}

impl<K: Kind> fmt::Display for ResourceHandle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.binding {
            Binding::Pending { name } => write!(f, "{} '{name}' (pending)", K::KIND),
            Binding::Bound { id } => write!(f, "{} {id}", K::KIND),
        }
    }
}
