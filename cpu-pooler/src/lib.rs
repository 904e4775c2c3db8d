#![deny(missing_debug_implementations)]

//! Node-local CPU pool management for Kubernetes workers.
//!
//! A worker node advertises named pools of CPU cores (shared, exclusive,
//! default) as schedulable resources through the kubelet device-plugin API.
//! Once the scheduler places a pod that requests cores from those pools, the
//! cpusetter controller looks up the exact core IDs the kubelet granted and
//! rewrites the container's cpuset cgroup so the workload runs only on the
//! intended cores.
//!
//! The crate ships two binaries:
//!
//! - `cpu-device-plugin` runs one device-plugin gRPC server per non-default
//!   pool and keeps them registered with the kubelet.
//! - `cpusetter` watches pods scheduled to this node and applies the computed
//!   cpusets to the container cgroup files.
//!
//! The companion `process-starter` binary (its own crate in this workspace)
//! runs inside workload containers and defers process start until the
//! cpusetter has pinned the container.

pub mod core;
pub mod deviceplugin;
pub mod k8s;
pub mod plugin;
pub mod setter;

pub use crate::core::{
    annotation::{ContainerSpec, CpuAnnotation, Process},
    cpuset::CpuSet,
    error::{Error, Result},
    pool::{CpuPools, HtPolicy, Pool, PoolConfig, PoolType},
};
