//! The pool device-plugin server against real unix sockets: serving,
//! kubelet registration, and teardown.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use hyper_util::rt::TokioIo;
use tokio::net::{UnixListener, UnixStream};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::{
    transport::{Channel, Endpoint, Server, Uri},
    Request, Response, Status,
};
use tower::service_fn;

use cpu_pooler::{
    core::pool::{HtPolicy, Pool},
    deviceplugin::{
        v1beta1::{
            device_plugin_client::DevicePluginClient,
            registration_server::{Registration, RegistrationServer},
            AllocateRequest, ContainerAllocateRequest, Empty, RegisterRequest,
        },
        API_VERSION, EXCLUSIVE_CPUS_ENV, SHARED_CPUS_ENV,
    },
    plugin::CpuDeviceManager,
    CpuSet,
};

/// Records every registration request it receives.
struct FakeKubelet {
    requests: Arc<Mutex<Vec<RegisterRequest>>>,
}

#[tonic::async_trait]
impl Registration for FakeKubelet {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<Empty>, Status> {
        self.requests.lock().unwrap().push(request.into_inner());
        Ok(Response::new(Empty {}))
    }
}

async fn uds_channel(path: PathBuf) -> Channel {
    Endpoint::try_from("http://[::1]:0")
        .unwrap()
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
        }))
        .await
        .unwrap()
}

fn manager(plugin_dir: &Path, pool_name: &str, cpus: &str, shared_cpus: &str) -> CpuDeviceManager {
    CpuDeviceManager::new(
        pool_name,
        Pool {
            cpus: CpuSet::parse(cpus).unwrap(),
            ht_policy: HtPolicy::SingleThreaded,
        },
        shared_cpus,
        Arc::new(HashMap::new()),
        Arc::new(HashMap::new()),
        plugin_dir,
    )
}

#[tokio::test]
async fn shared_pool_serves_devices_and_allocations_over_its_socket() {
    let dir = tempfile::tempdir().unwrap();
    let mut cdm = manager(dir.path(), "shared_caas", "5,9-12,15,17", "5,9-12,15,17");
    cdm.serve().await.unwrap();

    let mut client = DevicePluginClient::new(uds_channel(cdm.socket_path().to_owned()).await);

    let mut stream = client
        .list_and_watch(Empty {})
        .await
        .unwrap()
        .into_inner();
    let first = stream.message().await.unwrap().unwrap();
    assert_eq!(first.devices.len(), 7 * 1000);

    let response = client
        .allocate(AllocateRequest {
            container_requests: vec![ContainerAllocateRequest {
                devices_ids: vec!["12".to_owned(), "4711".to_owned()],
            }],
        })
        .await
        .unwrap()
        .into_inner();
    let envs = &response.container_responses[0].envs;
    assert_eq!(envs[SHARED_CPUS_ENV], "5,9-12,15,17");
    assert!(!envs.contains_key(EXCLUSIVE_CPUS_ENV));

    let socket = cdm.socket_path().to_owned();
    assert!(socket.exists());
    cdm.stop().await;
    assert!(!socket.exists(), "stop removes the socket file");
}

#[tokio::test]
async fn exclusive_pool_reports_granted_cores_per_container() {
    let dir = tempfile::tempdir().unwrap();
    let mut cdm = manager(dir.path(), "exclusive_caas", "3-8", "");
    eprintln!("DEBUG before serve");
    cdm.serve().await.unwrap();
    eprintln!("DEBUG after serve");

    let mut client = DevicePluginClient::new(uds_channel(cdm.socket_path().to_owned()).await);
    eprintln!("DEBUG after client connect");

    let mut stream = client
        .list_and_watch(Empty {})
        .await
        .unwrap()
        .into_inner();
    eprintln!("DEBUG after list_and_watch call");
    let first = stream.message().await.unwrap().unwrap();
    eprintln!("DEBUG after first message");
    assert_eq!(first.devices.len(), 6);

    eprintln!("DEBUG before allocate");
    let response = client
        .allocate(AllocateRequest {
            container_requests: vec![
                ContainerAllocateRequest {
                    devices_ids: vec!["4".to_owned(), "3".to_owned()],
                },
                ContainerAllocateRequest {
                    devices_ids: vec!["7".to_owned()],
                },
            ],
        })
        .await
        .unwrap()
        .into_inner();
    eprintln!("DEBUG after allocate");
    assert_eq!(response.container_responses.len(), 2);
    assert_eq!(response.container_responses[0].envs[EXCLUSIVE_CPUS_ENV], "3-4");
    assert_eq!(response.container_responses[1].envs[EXCLUSIVE_CPUS_ENV], "7");

    cdm.stop().await;
}

#[tokio::test]
async fn registers_its_socket_and_resource_name_with_the_kubelet() {
    let dir = tempfile::tempdir().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let kubelet = FakeKubelet {
        requests: Arc::clone(&requests),
    };
    let listener = UnixListener::bind(dir.path().join("kubelet.sock")).unwrap();
    let kubelet_server = tokio::spawn(
        Server::builder()
            .add_service(RegistrationServer::new(kubelet))
            .serve_with_incoming(UnixListenerStream::new(listener)),
    );

    let mut cdm = manager(dir.path(), "exclusive_caas", "3-4", "");
    cdm.serve().await.unwrap();
    cdm.register().await.unwrap();

    let recorded = requests.lock().unwrap().clone();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].version, API_VERSION);
    assert_eq!(recorded[0].endpoint, "cpudp_exclusive_caas.sock");
    assert_eq!(recorded[0].resource_name, "nokia.k8s.io/exclusive_caas");

    cdm.stop().await;
    kubelet_server.abort();
}

#[tokio::test]
async fn registration_without_a_kubelet_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut cdm = manager(dir.path(), "exclusive_caas", "3-4", "");
    cdm.serve().await.unwrap();
    assert!(cdm.register().await.is_err());
    cdm.stop().await;
}
