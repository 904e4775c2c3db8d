//! One device-plugin gRPC server per non-default pool.
//!
//! Each server binds its own unix socket under the kubelet's device-plugin
//! directory, registers itself with the kubelet, and then answers the
//! device-plugin API: `ListAndWatch` advertises the pool's cores (1000x
//! expanded for shared pools), `Allocate` translates granted device IDs into
//! the environment variables the workload sees.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use hyper_util::rt::TokioIo;
use tokio::{
    net::{UnixListener, UnixStream},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_stream::wrappers::{ReceiverStream, UnixListenerStream};
use tonic::{
    transport::{Endpoint, Server, Uri},
    Request, Response, Status,
};
use tower::service_fn;

use crate::{
    core::{
        cpuset::CpuSet,
        pool::{HtPolicy, Pool, PoolType},
        topology,
    },
    deviceplugin::{
        resource_name,
        v1beta1::{
            device_plugin_server::{DevicePlugin, DevicePluginServer},
            registration_client::RegistrationClient,
            AllocateRequest, AllocateResponse, ContainerAllocateResponse, Device,
            DevicePluginOptions, Empty, ListAndWatchResponse, NumaNode, PreStartContainerRequest,
            PreStartContainerResponse, RegisterRequest, TopologyInfo,
        },
        API_VERSION, EXCLUSIVE_CPUS_ENV, HEALTHY, KUBELET_SOCKET, SHARED_CPUS_ENV,
        SHARED_POOL_DEVICE_MULTIPLIER,
    },
    plugin::{PluginError, LIST_AND_WATCH_INTERVAL},
};

const SERVER_READY_PROBES: u32 = 50;
const SERVER_READY_PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// The gRPC-facing state of one pool server.
#[derive(Clone, Debug)]
struct PluginService {
    pool_name: String,
    pool: Pool,
    pool_type: PoolType,
    shared_pool_cpus: String,
    numa_topology: Arc<HashMap<u32, u32>>,
    ht_topology: Arc<HashMap<u32, CpuSet>>,
}

impl PluginService {
    /// The full device list this pool advertises.
    ///
    /// Shared pools are expanded 1000x with synthetic IDs; exclusive pools
    /// advertise one device per core, tagged with its NUMA node when the
    /// topology probe knows it.
    fn devices(&self) -> Vec<Device> {
        match self.pool_type {
            PoolType::Shared => (0..self.pool.cpus.len() * SHARED_POOL_DEVICE_MULTIPLIER)
                .map(|id| Device {
                    id: id.to_string(),
                    health: HEALTHY.to_owned(),
                    topology: None,
                })
                .collect(),
            _ => self
                .pool
                .cpus
                .iter()
                .map(|core| Device {
                    id: core.to_string(),
                    health: HEALTHY.to_owned(),
                    topology: self.numa_topology.get(&core).map(|node| TopologyInfo {
                        nodes: vec![NumaNode { id: *node as i64 }],
                    }),
                })
                .collect(),
        }
    }

    /// Environment variables for one container allocation.
    fn container_envs(&self, device_ids: &[String]) -> Result<HashMap<String, String>, Status> {
        let mut envs = HashMap::new();
        if self.pool_type == PoolType::Shared {
            // The synthetic IDs the kubelet hands back carry no allocation
            // meaning; only the pool identity matters.
            envs.insert(SHARED_CPUS_ENV.to_owned(), self.shared_pool_cpus.clone());
            return Ok(envs);
        }
        let mut allocated = CpuSet::new();
        for id in device_ids {
            let core = id.trim().parse::<u32>().map_err(|_| {
                Status::invalid_argument(format!("'{id}' is not a CPU core device ID"))
            })?;
            allocated.insert(core);
        }
        if self.pool.ht_policy == HtPolicy::MultiThreaded {
            allocated = topology::expand_ht_siblings(&allocated, &self.ht_topology);
        }
        log::info!(
            "pool {}: allocated CPUs {} ({} cores)",
            self.pool_name,
            allocated,
            allocated.len()
        );
        envs.insert(EXCLUSIVE_CPUS_ENV.to_owned(), allocated.to_string());
        Ok(envs)
    }
}

#[tonic::async_trait]
impl DevicePlugin for PluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(DevicePluginOptions::default()))
    }

    type ListAndWatchStream = ReceiverStream<Result<ListAndWatchResponse, Status>>;

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListAndWatchStream>, Status> {
        let (tx, rx) = mpsc::channel(1);
        let devices = self.devices();
        let pool_name = self.pool_name.clone();
        tokio::spawn(async move {
            loop {
                let update = ListAndWatchResponse {
                    devices: devices.clone(),
                };
                if tx.send(Ok(update)).await.is_err() {
                    log::debug!("ListAndWatch stream of pool {pool_name} closed by the kubelet");
                    break;
                }
                tokio::time::sleep(LIST_AND_WATCH_INTERVAL).await;
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> Result<Response<AllocateResponse>, Status> {
        let mut container_responses = Vec::new();
        for container in request.into_inner().container_requests {
            container_responses.push(ContainerAllocateResponse {
                envs: self.container_envs(&container.devices_ids)?,
                ..Default::default()
            });
        }
        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> Result<Response<PreStartContainerResponse>, Status> {
        Ok(Response::new(PreStartContainerResponse::default()))
    }
}

/// A running (or startable) device-plugin server for one pool.
#[derive(Debug)]
pub struct CpuDeviceManager {
    service: PluginService,
    plugin_dir: PathBuf,
    socket_path: PathBuf,
    server: Option<JoinHandle<Result<(), tonic::transport::Error>>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl CpuDeviceManager {
    pub fn new(
        pool_name: impl Into<String>,
        pool: Pool,
        shared_pool_cpus: impl Into<String>,
        numa_topology: Arc<HashMap<u32, u32>>,
        ht_topology: Arc<HashMap<u32, CpuSet>>,
        plugin_dir: impl Into<PathBuf>,
    ) -> Self {
        let pool_name = pool_name.into();
        let plugin_dir = plugin_dir.into();
        let socket_path = plugin_dir.join(format!("cpudp_{pool_name}.sock"));
        Self {
            service: PluginService {
                pool_type: PoolType::of(&pool_name),
                pool_name,
                pool,
                shared_pool_cpus: shared_pool_cpus.into(),
                numa_topology,
                ht_topology,
            },
            plugin_dir,
            socket_path,
            server: None,
            shutdown: None,
        }
    }

    pub fn pool_name(&self) -> &str {
        &self.service.pool_name
    }

    /// The resource name this server advertises to the kubelet.
    pub fn resource_name(&self) -> String {
        resource_name(&self.service.pool_name)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Binds the pool socket and starts serving the device-plugin API.
    ///
    /// Returns once the server answers on its own socket, so that the
    /// follow-up registration cannot race the bind.
    pub async fn serve(&mut self) -> Result<(), PluginError> {
        log::info!(
            "starting CPU device plugin server for pool {} at {}",
            self.service.pool_name,
            self.socket_path.display()
        );
        match tokio::fs::remove_file(&self.socket_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(PluginError::Cleanup {
                    path: self.socket_path.clone(),
                    source,
                })
            }
        }
        let listener =
            UnixListener::bind(&self.socket_path).map_err(|source| PluginError::Bind {
                path: self.socket_path.clone(),
                source,
            })?;
        let incoming = UnixListenerStream::new(listener);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let service = self.service.clone();
        let server = tokio::spawn(async move {
            Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(incoming, async {
                    shutdown_rx.await.ok();
                })
                .await
        });
        self.server = Some(server);
        self.shutdown = Some(shutdown_tx);

        for _ in 0..SERVER_READY_PROBES {
            if UnixStream::connect(&self.socket_path).await.is_ok() {
                log::info!(
                    "CPU device plugin server of pool {} started serving",
                    self.service.pool_name
                );
                return Ok(());
            }
            tokio::time::sleep(SERVER_READY_PROBE_INTERVAL).await;
        }
        self.stop().await;
        Err(PluginError::NotReady {
            path: self.socket_path.clone(),
        })
    }

    /// Announces this pool's socket and resource name on the kubelet's
    /// registration socket.
    pub async fn register(&self) -> Result<(), PluginError> {
        let kubelet_socket = self.plugin_dir.join(KUBELET_SOCKET);
        let channel = Endpoint::try_from("http://[::1]:0")?
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = kubelet_socket.clone();
                async move {
                    Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?))
                }
            }))
            .await?;
        let mut client = RegistrationClient::new(channel);
        let endpoint = self
            .socket_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        client
            .register(RegisterRequest {
                version: API_VERSION.to_owned(),
                endpoint,
                resource_name: self.resource_name(),
                options: None,
            })
            .await?;
        Ok(())
    }

    /// Stops the server and removes its socket file.
    pub async fn stop(&mut self) {
        log::info!(
            "stopping CPU device plugin server of pool {}",
            self.service.pool_name
        );
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(server) = self.server.take() {
            match server.await {
                Ok(Err(err)) => log::warn!(
                    "device plugin server of pool {} exited with: {err}",
                    self.service.pool_name
                ),
                Err(err) => log::warn!(
                    "device plugin server task of pool {} panicked: {err}",
                    self.service.pool_name
                ),
                Ok(Ok(())) => {}
            }
        }
        if let Err(err) = std::fs::remove_file(&self.socket_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::warn!(
                    "could not remove socket {}: {err}",
                    self.socket_path.display()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pool::HtPolicy;

    fn service(pool_name: &str, cpus: &str, ht_policy: HtPolicy) -> PluginService {
        PluginService {
            pool_name: pool_name.to_owned(),
            pool: Pool {
                cpus: CpuSet::parse(cpus).unwrap(),
                ht_policy,
            },
            pool_type: PoolType::of(pool_name),
            shared_pool_cpus: "5,9-12,15,17".to_owned(),
            numa_topology: Arc::new(HashMap::from([(3, 0), (4, 1)])),
            ht_topology: Arc::new(HashMap::from([
                (22, CpuSet::parse("62").unwrap()),
                (35, CpuSet::parse("75").unwrap()),
            ])),
        }
    }

    #[test]
    fn shared_pool_advertises_thousandfold_synthetic_devices() {
        let devices = service("shared_caas", "5,9-12,15,17", HtPolicy::SingleThreaded).devices();
        assert_eq!(devices.len(), 7 * 1000);
        assert_eq!(devices[0].id, "0");
        assert_eq!(devices[6999].id, "6999");
        assert!(devices.iter().all(|d| d.health == HEALTHY));
        assert!(devices.iter().all(|d| d.topology.is_none()));
    }

    #[test]
    fn exclusive_pool_advertises_one_device_per_core_with_numa_hints() {
        let devices = service("exclusive_caas", "3-5", HtPolicy::SingleThreaded).devices();
        assert_eq!(devices.len(), 3);
        let by_id: HashMap<_, _> = devices.iter().map(|d| (d.id.as_str(), d)).collect();
        assert_eq!(
            by_id["3"].topology.as_ref().unwrap().nodes[0].id,
            0,
            "core 3 is on NUMA node 0"
        );
        assert_eq!(by_id["4"].topology.as_ref().unwrap().nodes[0].id, 1);
        assert!(by_id["5"].topology.is_none(), "unknown cores get no hint");
    }

    #[test]
    fn exclusive_allocation_renders_sorted_core_list() {
        let svc = service("exclusive_caas", "3-8", HtPolicy::SingleThreaded);
        let envs = svc
            .container_envs(&["4".to_owned(), "3".to_owned()])
            .unwrap();
        assert_eq!(envs[EXCLUSIVE_CPUS_ENV], "3-4");
        assert!(!envs.contains_key(SHARED_CPUS_ENV));
    }

    #[test]
    fn multi_threaded_allocation_includes_ht_siblings() {
        let svc = service("exclusive_caas", "22,35", HtPolicy::MultiThreaded);
        let envs = svc
            .container_envs(&["22".to_owned(), "35".to_owned()])
            .unwrap();
        assert_eq!(envs[EXCLUSIVE_CPUS_ENV], "22,35,62,75");
    }

    #[test]
    fn shared_allocation_reports_the_whole_pool() {
        let svc = service("shared_caas", "5,9-12,15,17", HtPolicy::SingleThreaded);
        let envs = svc.container_envs(&["124".to_owned()]).unwrap();
        assert_eq!(envs[SHARED_CPUS_ENV], "5,9-12,15,17");
        assert!(!envs.contains_key(EXCLUSIVE_CPUS_ENV));
    }

    #[test]
    fn bogus_device_ids_are_rejected() {
        let svc = service("exclusive_caas", "3-8", HtPolicy::SingleThreaded);
        assert!(svc.container_envs(&["a".to_owned()]).is_err());
    }
}
