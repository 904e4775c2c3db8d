//! Lifecycle management for the set of pool servers on one node.
//!
//! The supervisor owns the running [`CpuDeviceManager`]s. On a kubelet
//! restart (observed as a filesystem event on the kubelet socket) the whole
//! set is torn down and a fresh one built, so the list is only ever swapped
//! wholesale, never mutated while serving.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
};

use crate::{
    core::{
        cpuset::CpuSet,
        pool::{PoolConfig, PoolType},
        topology,
    },
    deviceplugin::DEVICE_PLUGIN_PATH,
    plugin::{CpuDeviceManager, PluginError},
};

/// Starts, tracks, and stops one device-plugin server per non-default pool.
#[derive(Debug)]
pub struct PluginSupervisor {
    plugin_dir: PathBuf,
    cdms: Vec<CpuDeviceManager>,
}

impl Default for PluginSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginSupervisor {
    pub fn new() -> Self {
        Self::with_plugin_dir(DEVICE_PLUGIN_PATH)
    }

    /// Uses a non-default device-plugin directory; test hook.
    pub fn with_plugin_dir(plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            cdms: Vec::new(),
        }
    }

    /// Number of pool servers currently running.
    pub fn len(&self) -> usize {
        self.cdms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cdms.is_empty()
    }

    /// Builds and starts one server per shared/exclusive pool.
    ///
    /// A pool whose socket cannot be bound is logged and skipped so the
    /// remaining pools still come up; a pool that cannot register with the
    /// kubelet aborts the whole startup, since without registration nothing
    /// is schedulable.
    pub async fn start(&mut self, pool_config: &PoolConfig) -> Result<(), PluginError> {
        self.remove_stale_sockets()?;
        let shared_pool_cpus = pool_config.validate()?;
        let numa_topology = Arc::new(topology::numa_topology());
        let ht_topology: Arc<HashMap<u32, CpuSet>> = Arc::new(topology::ht_topology());

        for (pool_name, pool) in &pool_config.pools {
            // Default and unrecognized pools are not schedulable devices.
            if PoolType::of(pool_name) == PoolType::Default {
                continue;
            }
            let mut cdm = CpuDeviceManager::new(
                pool_name,
                pool.clone(),
                shared_pool_cpus.clone(),
                Arc::clone(&numa_topology),
                Arc::clone(&ht_topology),
                &self.plugin_dir,
            );
            if let Err(err) = cdm.serve().await {
                log::error!("starting device plugin server for pool {pool_name} failed: {err}");
                continue;
            }
            if let Err(err) = cdm.register().await {
                cdm.stop().await;
                self.stop().await;
                return Err(err);
            }
            log::info!(
                "CPU device plugin of pool {pool_name} registered with the kubelet as {}",
                cdm.resource_name()
            );
            self.cdms.push(cdm);
        }
        Ok(())
    }

    /// Stops every running server and removes its socket.
    pub async fn stop(&mut self) {
        for cdm in &mut self.cdms {
            cdm.stop().await;
        }
        self.cdms.clear();
    }

    /// Removes leftover `cpudp*` sockets from a previous instance so stale
    /// endpoints never shadow the fresh servers.
    fn remove_stale_sockets(&self) -> Result<(), PluginError> {
        let entries = match std::fs::read_dir(&self.plugin_dir) {
            Ok(entries) => entries,
            Err(source) => {
                return Err(PluginError::Cleanup {
                    path: self.plugin_dir.clone(),
                    source,
                })
            }
        };
        for entry in entries.filter_map(|entry| entry.ok()) {
            let path = entry.path();
            let is_plugin_socket = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("cpudp"));
            if is_plugin_socket {
                std::fs::remove_file(&path)
                    .map_err(|source| PluginError::Cleanup { path, source })?;
            }
        }
        Ok(())
    }
}
