//! Wire types for the Scaleway Instances API and their mapping onto
//! provider-neutral records.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::provider::{ResourceKind, ResourceRecord, SpotStatus, Tags, state};
use crate::selector::VCPU;

/// Catalogue attribute holding memory in GiB.
pub(crate) const MEMORY_GIB: &str = "mem";
/// Catalogue attribute holding the GPU count.
pub(crate) const GPU: &str = "gpu";

macro_rules! newtype {
    ($name:ident) => {
        #[derive(Clone, Debug, Eq, PartialEq)]
        pub(crate) struct $name(String);

        impl $name {
            pub(crate) const fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }
    };
}

newtype!(Zone);
newtype!(ServerState);

impl ServerState {
    /// Maps a Scaleway server state onto the neutral instance states.
    pub(crate) fn neutral(&self) -> &str {
        match self.as_str() {
            "starting" => state::PENDING,
            "running" => state::RUNNING,
            "stopping" => state::STOPPING,
            "stopped" | "stopped in place" => state::STOPPED,
            "locked" => state::ERROR,
            other => other,
        }
    }

    /// Status a spot request backed by this server reports.
    pub(crate) fn spot_status(&self) -> SpotStatus {
        match self.as_str() {
            "starting" | "running" => SpotStatus::Fulfilled,
            "stopping" | "stopped" | "stopped in place" => SpotStatus::TerminatedByUser,
            other => SpotStatus::Other(other.to_owned()),
        }
    }
}

/// Encodes tags as Scaleway `key=value` strings.
pub(crate) fn encode_tags(tags: &Tags) -> Vec<String> {
    tags.iter()
        .map(|(key, value)| {
            if value.is_empty() {
                key.clone()
            } else {
                format!("{key}={value}")
            }
        })
        .collect()
}

/// Decodes Scaleway tag strings. A tag without `=` maps to an empty value.
pub(crate) fn decode_tags(raw: &[String]) -> Tags {
    raw.iter()
        .map(|tag| {
            tag.split_once('=').map_or_else(
                || (tag.clone(), String::new()),
                |(key, value)| (key.to_owned(), value.to_owned()),
            )
        })
        .collect()
}

/// Merges `update` into `current`; empty values remove keys.
pub(crate) fn merge_tags(current: &Tags, update: &Tags) -> Tags {
    let mut merged = current.clone();
    for (key, value) in update {
        if value.is_empty() {
            merged.remove(key);
        } else {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct AddressBody {
    pub(crate) address: String,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct IdRef {
    pub(crate) id: String,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ServerBody {
    pub(crate) id: String,
    pub(crate) state: String,
    pub(crate) commercial_type: String,
    #[serde(default)]
    pub(crate) creation_date: String,
    #[serde(default)]
    pub(crate) tags: Vec<String>,
    pub(crate) public_ip: Option<AddressBody>,
    #[serde(default)]
    pub(crate) volumes: BTreeMap<String, IdRef>,
}

impl ServerBody {
    pub(crate) fn server_state(&self) -> ServerState {
        ServerState::from(self.state.as_str())
    }

    /// Attached volume ids, boot volume first.
    pub(crate) fn volume_ids(&self) -> Vec<String> {
        let mut slots: Vec<(u32, &str)> = self
            .volumes
            .iter()
            .map(|(slot, volume)| (slot.parse().unwrap_or(u32::MAX), volume.id.as_str()))
            .collect();
        slots.sort_unstable();
        slots.into_iter().map(|(_, id)| id.to_owned()).collect()
    }

    pub(crate) fn into_record(self) -> ResourceRecord {
        let neutral = self.server_state().neutral().to_owned();
        let mut record =
            ResourceRecord::new(ResourceKind::Instance, self.id, neutral, self.creation_date);
        record.tags = decode_tags(&self.tags);
        record.public_ip = self
            .public_ip
            .and_then(|ip| ip.address.parse::<IpAddr>().ok());
        record.instance_type = Some(self.commercial_type);
        record
    }
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct VolumeBody {
    pub(crate) id: String,
    pub(crate) state: String,
    #[serde(default)]
    pub(crate) creation_date: String,
    #[serde(default)]
    pub(crate) tags: Vec<String>,
    pub(crate) server: Option<IdRef>,
}

impl VolumeBody {
    pub(crate) fn into_record(self) -> ResourceRecord {
        let neutral = if self.server.is_some() {
            state::IN_USE.to_owned()
        } else {
            self.state
        };
        let mut record =
            ResourceRecord::new(ResourceKind::Disk, self.id, neutral, self.creation_date);
        record.tags = decode_tags(&self.tags);
        record.attached_to = self.server.map(|server| server.id);
        record
    }
}

/// Snapshot or image: both expose the same fields the records need.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ArtifactBody {
    pub(crate) id: String,
    pub(crate) state: String,
    #[serde(default)]
    pub(crate) creation_date: String,
    #[serde(default)]
    pub(crate) tags: Vec<String>,
}

impl ArtifactBody {
    pub(crate) fn into_record(self, kind: ResourceKind) -> ResourceRecord {
        let neutral = match self.state.as_str() {
            "snapshotting" | "creating" => state::CREATING.to_owned(),
            _ => self.state,
        };
        let mut record = ResourceRecord::new(kind, self.id, neutral, self.creation_date);
        record.tags = decode_tags(&self.tags);
        record
    }
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct FlexibleIpBody {
    pub(crate) id: String,
    pub(crate) address: String,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ProductBody {
    pub(crate) ncpus: u32,
    pub(crate) ram: u64,
    #[serde(default)]
    pub(crate) gpu: Option<u32>,
    pub(crate) hourly_price: f64,
}

impl ProductBody {
    /// Hardware attributes: vCPU count, memory in GiB, GPU count.
    pub(crate) fn attributes(&self) -> BTreeMap<String, f64> {
        let gib = u32::try_from(self.ram >> 30).unwrap_or(u32::MAX);
        BTreeMap::from([
            (VCPU.to_owned(), f64::from(self.ncpus)),
            (MEMORY_GIB.to_owned(), f64::from(gib)),
            (GPU.to_owned(), f64::from(self.gpu.unwrap_or(0))),
        ])
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerEnvelope {
    pub(crate) server: ServerBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServersEnvelope {
    #[serde(default)]
    pub(crate) servers: Vec<ServerBody>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct VolumeEnvelope {
    pub(crate) volume: VolumeBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct VolumesEnvelope {
    #[serde(default)]
    pub(crate) volumes: Vec<VolumeBody>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SnapshotEnvelope {
    pub(crate) snapshot: ArtifactBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SnapshotsEnvelope {
    #[serde(default)]
    pub(crate) snapshots: Vec<ArtifactBody>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ImageEnvelope {
    pub(crate) image: ArtifactBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ImagesEnvelope {
    #[serde(default)]
    pub(crate) images: Vec<ArtifactBody>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct IpsEnvelope {
    #[serde(default)]
    pub(crate) ips: Vec<FlexibleIpBody>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ProductsEnvelope {
    #[serde(default)]
    pub(crate) servers: BTreeMap<String, ProductBody>,
}

#[derive(Debug, Serialize)]
pub(crate) struct RootVolumeTemplate {
    pub(crate) size: u64,
    pub(crate) volume_type: &'static str,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateServerRequest {
    pub(crate) name: String,
    pub(crate) commercial_type: String,
    pub(crate) image: String,
    pub(crate) project: String,
    pub(crate) routed_ip_enabled: bool,
    pub(crate) dynamic_ip_required: bool,
    pub(crate) tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) volumes: Option<BTreeMap<String, RootVolumeTemplate>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) security_group: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateSnapshotRequest {
    pub(crate) name: String,
    pub(crate) volume_id: String,
    pub(crate) project: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateImageRequest {
    pub(crate) name: String,
    pub(crate) root_volume: String,
    pub(crate) arch: String,
    pub(crate) project: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct TagsPatch {
    pub(crate) tags: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct AttachIpPatch {
    pub(crate) server: String,
}
