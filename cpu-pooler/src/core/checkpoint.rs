//! Reader for the kubelet device-manager checkpoint file.
//!
//! The checkpoint is the source of truth for which device IDs (core IDs in
//! our case) the kubelet granted to which container. Two on-disk schemas
//! exist: until K8s 1.20 `DeviceIDs` was a flat list, from 1.21 onward it is
//! a map keyed by NUMA node. The reader tries the old schema first and falls
//! back to the new one, merging the NUMA buckets.
//!
//! The kubelet rewrites the file atomically, so it is re-read on every
//! lookup and never cached.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::Deserialize;

/// Where the kubelet keeps its device-manager state.
pub const DEFAULT_CHECKPOINT_PATH: &str =
    "/var/lib/kubelet/device-plugins/kubelet_internal_checkpoint";

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("could not read checkpoint file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("checkpoint file could not be parsed under either known schema: {source}")]
    Parse { source: serde_json::Error },
}

/// One pod-device assignment, normalized to the pre-1.21 flat form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodDevicesEntry {
    pub pod_uid: String,
    pub container_name: String,
    pub resource_name: String,
    pub device_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawFile<E> {
    #[serde(rename = "Data")]
    data: RawData<E>,
}

#[derive(Debug, Deserialize)]
struct RawData<E> {
    #[serde(rename = "PodDeviceEntries", default = "Vec::new")]
    pod_device_entries: Vec<E>,
}

#[derive(Debug, Deserialize)]
struct LegacyEntry {
    #[serde(rename = "PodUID")]
    pod_uid: String,
    #[serde(rename = "ContainerName")]
    container_name: String,
    #[serde(rename = "ResourceName", default)]
    resource_name: String,
    #[serde(rename = "DeviceIDs", default)]
    device_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct NumaEntry {
    #[serde(rename = "PodUID")]
    pod_uid: String,
    #[serde(rename = "ContainerName")]
    container_name: String,
    #[serde(rename = "ResourceName", default)]
    resource_name: String,
    /// NUMA node ID (as a decimal string key) to granted device IDs.
    #[serde(rename = "DeviceIDs", default)]
    device_ids: BTreeMap<String, Vec<String>>,
}

/// Access to the device-manager checkpoint at a fixed path.
#[derive(Clone, Debug)]
pub struct CheckpointReader {
    path: PathBuf,
}

impl Default for CheckpointReader {
    fn default() -> Self {
        Self::new(DEFAULT_CHECKPOINT_PATH)
    }
}

impl CheckpointReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads and normalizes every pod-device entry in the checkpoint.
    pub fn read(&self) -> Result<Vec<PodDevicesEntry>, CheckpointError> {
        let contents =
            std::fs::read_to_string(&self.path).map_err(|source| CheckpointError::Read {
                path: self.path.clone(),
                source,
            })?;
        parse_checkpoint(&contents)
    }

    /// Returns the union of device IDs granted to `(pod_uid, container,
    /// resource)` across all matching entries. A missing entry yields an
    /// empty list: the container then keeps the platform default cpuset.
    pub fn device_ids(
        &self,
        pod_uid: &str,
        container_name: &str,
        resource_name: &str,
    ) -> Result<Vec<String>, CheckpointError> {
        let mut ids = Vec::new();
        for entry in self.read()? {
            if entry.pod_uid == pod_uid
                && entry.container_name == container_name
                && entry.resource_name == resource_name
            {
                ids.extend(entry.device_ids);
            }
        }
        if ids.is_empty() {
            log::warn!(
                "no device IDs recorded in checkpoint for pod {pod_uid} container {container_name} resource {resource_name}"
            );
        }
        Ok(ids)
    }
}

/// Parses the checkpoint contents, trying the legacy flat schema first and
/// the NUMA-keyed schema second.
fn parse_checkpoint(contents: &str) -> Result<Vec<PodDevicesEntry>, CheckpointError> {
    match serde_json::from_str::<RawFile<LegacyEntry>>(contents) {
        Ok(file) => Ok(file
            .data
            .pod_device_entries
            .into_iter()
            .map(|entry| PodDevicesEntry {
                pod_uid: entry.pod_uid,
                container_name: entry.container_name,
                resource_name: entry.resource_name,
                device_ids: entry.device_ids,
            })
            .collect()),
        Err(_) => {
            let file: RawFile<NumaEntry> = serde_json::from_str(contents)
                .map_err(|source| CheckpointError::Parse { source })?;
            Ok(file
                .data
                .pod_device_entries
                .into_iter()
                .map(|entry| PodDevicesEntry {
                    pod_uid: entry.pod_uid,
                    container_name: entry.container_name,
                    resource_name: entry.resource_name,
                    device_ids: entry.device_ids.into_values().flatten().collect(),
                })
                .collect())
        }
    }
}
