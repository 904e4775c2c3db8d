//! The cpuset controller: watches pods scheduled to this node, computes the
//! cpuset every container should run on, and writes it into the container's
//! cpuset cgroup before the workload's main process starts.

use std::{path::PathBuf, time::Duration};

use crate::{core::checkpoint::CheckpointError, k8s::K8sError};

pub mod applier;
pub mod cgroup;
pub mod controller;

pub use applier::CpusetApplier;
pub use controller::SetHandler;

/// How many times a failing per-container operation (cgroup lookup, write,
/// checkpoint read, annotation patch) is retried before the pod is abandoned.
pub const MAX_RETRY: u32 = 150;

/// Delay between retry attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// How many times a pod is re-fetched while waiting for the runtime to fill
/// in its container IDs.
pub const POD_READY_RETRIES: u32 = 30;

/// Interval of the periodic reconciliation pass. Shares its value with the
/// `ListAndWatch` keep-alive interval by coincidence, not by design.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Depth of the pod work queue between the watch and the workers.
pub const WORK_QUEUE_DEPTH: usize = 100;

/// Number of worker tasks draining the pod work queue.
pub const NUM_WORKERS: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum SetterError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("device ID '{id}' recorded in the checkpoint is not a core number")]
    BadDeviceId { id: String },
    #[error("no cgroup directory under {root} matches container {container_id}")]
    CgroupNotFound { root: PathBuf, container_id: String },
    #[error("could not read cgroup file {path}: {source}")]
    CgroupRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not write cgroup file {path}: {source}")]
    CgroupWrite {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("pod reports no container ID for container '{container}'")]
    MissingContainerId { container: String },
    #[error(transparent)]
    K8s(#[from] K8sError),
    #[error("{failed} of {total} containers could not be pinned")]
    PodAbandoned { failed: usize, total: usize },
    #[error("pod watch ended with a non-recoverable error: {0}")]
    WatchFailed(#[source] kube::Error),
    #[error("controller stopped unexpectedly")]
    ControllerStopped,
}
