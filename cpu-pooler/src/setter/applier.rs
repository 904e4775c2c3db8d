//! Computes the target cpuset of each container and applies it to the
//! cgroup tree. Everything in here is synchronous and free of API-server
//! dependencies so the whole decision table is testable against a fake
//! cgroup filesystem.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use k8s_openapi::api::core::v1::{Container, Pod};

use crate::{
    core::{
        checkpoint::CheckpointReader,
        cpuset::CpuSet,
        pool::{HtPolicy, PoolConfig, PoolType, DEFAULT_POOL_PREFIX, SHARED_POOL_PREFIX},
        topology,
    },
    deviceplugin::pool_of_resource,
    setter::{
        cgroup::{self, strip_runtime_prefix},
        SetterError,
    },
};

/// Applies computed cpusets to the cgroup tree of one node.
#[derive(Debug)]
pub struct CpusetApplier {
    pool_config: PoolConfig,
    cpuset_root: PathBuf,
    checkpoint: CheckpointReader,
    ht_topology: HashMap<u32, CpuSet>,
}

impl CpusetApplier {
    pub fn new(
        pool_config: PoolConfig,
        cpuset_root: impl Into<PathBuf>,
        checkpoint: CheckpointReader,
        ht_topology: HashMap<u32, CpuSet>,
    ) -> Self {
        Self {
            pool_config,
            cpuset_root: cpuset_root.into(),
            checkpoint,
            ht_topology,
        }
    }

    pub fn pool_config(&self) -> &PoolConfig {
        &self.pool_config
    }

    pub fn cpuset_root(&self) -> &Path {
        &self.cpuset_root
    }

    /// Decides which cores a container must be confined to.
    ///
    /// Shared requests contribute the node's shared pool, exclusive requests
    /// the checkpoint-granted cores (HT-expanded for multi-threaded pools);
    /// both present means their union. A container with no recognized pool
    /// request falls back to the default pool. An empty result means "leave
    /// the container untouched".
    pub fn determine_correct_cpuset(
        &self,
        pod: &Pod,
        container: &Container,
    ) -> Result<CpuSet, SetterError> {
        let mut target = CpuSet::new();
        let mut matched = false;
        let requests = container
            .resources
            .as_ref()
            .and_then(|resources| resources.requests.as_ref());
        if let Some(requests) = requests {
            for resource in requests.keys() {
                let Some(pool_name) = pool_of_resource(resource) else {
                    continue;
                };
                match PoolType::of(pool_name) {
                    PoolType::Shared => {
                        target = target.union(&self.pool_config.select_pool(SHARED_POOL_PREFIX).cpus);
                        matched = true;
                    }
                    PoolType::Exclusive => {
                        let exclusive =
                            self.exclusive_cpus(pod, &container.name, resource, pool_name)?;
                        if exclusive.is_empty() {
                            // No grant recorded: never pin the container to
                            // the machine-wide default in that case.
                            log::warn!(
                                "checkpoint holds no devices for container {} of pod {} on {resource}",
                                container.name,
                                pod_name(pod),
                            );
                        } else {
                            target = target.union(&exclusive);
                            matched = true;
                        }
                    }
                    PoolType::Default => {}
                }
            }
        }
        if !matched {
            target = self.pool_config.select_pool(DEFAULT_POOL_PREFIX).cpus;
        }
        Ok(target)
    }

    /// Computes and writes one container's cpuset.
    ///
    /// Returns the cgroup directory written to, or `None` when the computed
    /// set was empty and the container was left untouched.
    pub fn apply_container(
        &self,
        pod: &Pod,
        container: &Container,
    ) -> Result<Option<PathBuf>, SetterError> {
        let container_id =
            container_id_of(pod, &container.name).ok_or_else(|| SetterError::MissingContainerId {
                container: container.name.clone(),
            })?;
        let target = self.determine_correct_cpuset(pod, container)?;
        if target.is_empty() {
            log::info!(
                "no cpuset to apply for container {} of pod {}; leaving it untouched",
                container.name,
                pod_name(pod),
            );
            return Ok(None);
        }
        let dir = cgroup::find_container_cgroup(&self.cpuset_root, &container_id)?;
        cgroup::write_cpuset(&dir, &target)?;
        log::info!(
            "cpuset of container {} in pod {} set to {target}",
            container.name,
            pod_name(pod),
        );
        Ok(Some(dir))
    }

    /// Pins the pod's infrastructure ("pause") container to the default
    /// pool: it is the sibling directory under the pod cgroup that matches
    /// none of the pod's container IDs.
    pub fn apply_infra_container(
        &self,
        pod_dir: &Path,
        container_ids: &[String],
    ) -> Result<(), SetterError> {
        let default_cpus = self.pool_config.select_pool(DEFAULT_POOL_PREFIX).cpus;
        if default_cpus.is_empty() {
            log::info!(
                "no default pool configured; leaving the infra container of {} untouched",
                pod_dir.display()
            );
            return Ok(());
        }
        let entries = std::fs::read_dir(pod_dir).map_err(|source| SetterError::CgroupRead {
            path: pod_dir.to_owned(),
            source,
        })?;
        for entry in entries.filter_map(|entry| entry.ok()) {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let belongs_to_container = container_ids
                .iter()
                .any(|id| !id.is_empty() && name.contains(id.as_str()));
            if !belongs_to_container {
                cgroup::write_cpuset(&path, &default_cpus)?;
                log::info!(
                    "cpuset of infra container cgroup {} set to {default_cpus}",
                    path.display()
                );
            }
        }
        Ok(())
    }

    /// One periodic reconciliation pass.
    ///
    /// Container restarts make the runtime re-impose the machine-wide
    /// cpuset; any leaf cgroup found back at "all cores" is re-derived from
    /// the live pod list and rewritten.
    pub fn reconcile_tree(&self, pods: &[Pod]) -> Result<(), SetterError> {
        let all_cores = match cgroup::read_cpuset(&self.cpuset_root) {
            Ok(set) if !set.is_empty() => set,
            _ => return Ok(()),
        };
        for leaf in cgroup::leaf_cgroup_dirs(&self.cpuset_root) {
            let Ok(current) = cgroup::read_cpuset(&leaf) else {
                continue;
            };
            if current != all_cores {
                continue;
            }
            let leaf_name = leaf
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            match find_owner(pods, &leaf_name) {
                Some((pod, container)) => {
                    let target = match self.determine_correct_cpuset(pod, container) {
                        Ok(target) => target,
                        Err(err) => {
                            log::warn!(
                                "could not re-derive cpuset for {}: {err}",
                                leaf.display()
                            );
                            continue;
                        }
                    };
                    if !target.is_empty() {
                        cgroup::write_cpuset(&leaf, &target)?;
                        log::info!(
                            "reconciled cpuset of {} back to {target}",
                            leaf.display()
                        );
                    }
                }
                None => {
                    // An unmatched leaf next to known containers is a pod's
                    // infra cgroup; everything else is not ours to touch.
                    if let Some(parent) = leaf.parent() {
                        if sibling_belongs_to_pod(pods, parent, &leaf_name) {
                            let default_cpus =
                                self.pool_config.select_pool(DEFAULT_POOL_PREFIX).cpus;
                            if !default_cpus.is_empty() {
                                cgroup::write_cpuset(&leaf, &default_cpus)?;
                                log::info!(
                                    "reconciled infra cpuset of {} back to {default_cpus}",
                                    leaf.display()
                                );
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn exclusive_cpus(
        &self,
        pod: &Pod,
        container_name: &str,
        resource: &str,
        pool_name: &str,
    ) -> Result<CpuSet, SetterError> {
        let pod_uid = pod.metadata.uid.as_deref().unwrap_or_default();
        let ids = self.checkpoint.device_ids(pod_uid, container_name, resource)?;
        let mut cpus = CpuSet::new();
        for id in ids {
            let core = id
                .trim()
                .parse::<u32>()
                .map_err(|_| SetterError::BadDeviceId { id: id.clone() })?;
            cpus.insert(core);
        }
        let multi_threaded = self
            .pool_config
            .pool(pool_name)
            .map(|pool| pool.ht_policy == HtPolicy::MultiThreaded)
            .unwrap_or(false);
        if multi_threaded {
            cpus = topology::expand_ht_siblings(&cpus, &self.ht_topology);
        }
        Ok(cpus)
    }
}

/// The stripped container ID the pod status reports for `container_name`,
/// when the runtime has filled it in.
pub fn container_id_of(pod: &Pod, container_name: &str) -> Option<String> {
    pod.status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
        .and_then(|statuses| {
            statuses
                .iter()
                .find(|status| status.name == container_name)
        })
        .and_then(|status| status.container_id.as_deref())
        .map(strip_runtime_prefix)
        .filter(|id| !id.is_empty())
        .map(ToOwned::to_owned)
}

fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or("<unnamed>")
}

fn find_owner<'p>(pods: &'p [Pod], leaf_name: &str) -> Option<(&'p Pod, &'p Container)> {
    for pod in pods {
        let Some(spec) = pod.spec.as_ref() else {
            continue;
        };
        for container in &spec.containers {
            if let Some(id) = container_id_of(pod, &container.name) {
                if leaf_name.contains(&id) {
                    return Some((pod, container));
                }
            }
        }
    }
    None
}

fn sibling_belongs_to_pod(pods: &[Pod], pod_dir: &Path, leaf_name: &str) -> bool {
    let Ok(entries) = std::fs::read_dir(pod_dir) else {
        return false;
    };
    for entry in entries.filter_map(|entry| entry.ok()) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == leaf_name {
            continue;
        }
        if find_owner(pods, &name).is_some() {
            return true;
        }
    }
    false
}
