//! The event-driven half of the cpusetter: pod watch, work queue, worker
//! pool, readiness retries, completion annotation, and the periodic
//! reconciler driving [`CpusetApplier`].

use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams, WatchEvent, WatchParams},
    Client,
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinSet,
};

use crate::{
    core::{checkpoint::CheckpointReader, pool::PoolConfig, topology},
    deviceplugin::CPUSETS_CONFIGURED_ANNOTATION,
    k8s,
    setter::{
        applier::{container_id_of, CpusetApplier},
        SetterError, MAX_RETRY, NUM_WORKERS, POD_READY_RETRIES, RECONCILE_INTERVAL,
        RETRY_INTERVAL, WORK_QUEUE_DEPTH,
    },
};

/// The cpuset controller of one node.
pub struct SetHandler {
    client: Client,
    node_name: String,
    applier: CpusetApplier,
}

impl std::fmt::Debug for SetHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetHandler")
            .field("node_name", &self.node_name)
            .field("applier", &self.applier)
            .finish_non_exhaustive()
    }
}

impl SetHandler {
    /// Creates a controller scoped to the node named by `NODE_NAME`.
    pub fn new(
        client: Client,
        pool_config: PoolConfig,
        cpuset_root: impl Into<std::path::PathBuf>,
    ) -> Result<Self, SetterError> {
        Ok(Self {
            client,
            node_name: k8s::node_name()?,
            applier: CpusetApplier::new(
                pool_config,
                cpuset_root,
                CheckpointReader::default(),
                topology::ht_topology(),
            ),
        })
    }

    /// Test hook: bypasses the environment and the topology probe.
    pub fn with_applier(client: Client, node_name: impl Into<String>, applier: CpusetApplier) -> Self {
        Self {
            client,
            node_name: node_name.into(),
            applier,
        }
    }

    pub fn applier(&self) -> &CpusetApplier {
        &self.applier
    }

    /// Runs the controller until the pod watch fails non-recoverably.
    ///
    /// One producer (the watch) feeds a bounded queue of ADD events; a fixed
    /// pool of workers drains it, each owning its pod end-to-end. Update
    /// events are intentionally absorbed: the readiness retry inside the
    /// worker re-fetches the pod until it is actionable.
    pub async fn run(self: Arc<Self>) -> Result<(), SetterError> {
        let (queue_tx, queue_rx) = mpsc::channel::<Pod>(WORK_QUEUE_DEPTH);
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        let mut workers = JoinSet::new();
        for _ in 0..NUM_WORKERS {
            let handler = Arc::clone(&self);
            let queue_rx = Arc::clone(&queue_rx);
            workers.spawn(async move {
                loop {
                    let pod = { queue_rx.lock().await.recv().await };
                    let Some(pod) = pod else { break };
                    let name = pod.metadata.name.clone().unwrap_or_default();
                    if let Err(err) = handler.pod_added(pod).await {
                        log::error!("pod {name} abandoned: {err}");
                    }
                }
            });
        }

        let reconciler = {
            let handler = Arc::clone(&self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if let Err(err) = handler.reconcile().await {
                        log::warn!("periodic cpuset reconciliation failed: {err}");
                    }
                }
            })
        };

        let result = self.watch_pods(queue_tx).await;
        reconciler.abort();
        workers.shutdown().await;
        result
    }

    /// Feeds pod ADD events into the work queue, re-establishing the watch
    /// after transient closes.
    async fn watch_pods(&self, queue_tx: mpsc::Sender<Pod>) -> Result<(), SetterError> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        loop {
            let stream = pods
                .watch(&WatchParams::default(), "0")
                .await
                .map_err(SetterError::WatchFailed)?;
            let mut stream = stream.boxed();
            loop {
                match stream.try_next().await {
                    Ok(Some(WatchEvent::Added(pod))) => {
                        if queue_tx.send(pod).await.is_err() {
                            // every worker is gone; nothing left to do
                            return Ok(());
                        }
                    }
                    Ok(Some(WatchEvent::Error(err))) => {
                        log::warn!("pod watch reported an error, re-establishing: {err:?}");
                        break;
                    }
                    // MODIFIED/DELETED/BOOKMARK are absorbed by design
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        log::debug!("pod watch closed gracefully, re-establishing");
                        break;
                    }
                    Err(err) => {
                        log::warn!("transient pod watch error, re-establishing: {err}");
                        break;
                    }
                }
            }
        }
    }

    /// Handles one pod ADD event end-to-end.
    async fn pod_added(&self, pod: Pod) -> Result<(), SetterError> {
        if !self.should_handle(&pod) {
            return Ok(());
        }
        let Some(pod) = self.wait_until_ready(pod).await else {
            return Ok(());
        };
        self.adjust_container_sets(&pod).await
    }

    /// A pod is this controller's business when it is scheduled here and not
    /// already finished.
    fn should_handle(&self, pod: &Pod) -> bool {
        let scheduled_here = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.node_name.as_deref())
            .is_some_and(|node| node == self.node_name);
        if !scheduled_here {
            return false;
        }
        let phase = pod
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            .unwrap_or_default();
        !matches!(phase, "Succeeded" | "Failed")
    }

    /// Re-fetches the pod until the runtime has filled in every container
    /// ID, or gives up after the bounded retry budget.
    async fn wait_until_ready(&self, mut pod: Pod) -> Option<Pod> {
        for _ in 0..POD_READY_RETRIES {
            if containers_ready(&pod) {
                return Some(pod);
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
            let namespace = pod
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_owned());
            let Some(name) = pod.metadata.name.clone() else {
                break;
            };
            match k8s::get_pod(&self.client, &namespace, &name).await {
                Ok(refreshed) => pod = refreshed,
                Err(err) => log::debug!("re-fetching pod {name} failed: {err}"),
            }
        }
        log::warn!(
            "giving up on pod {}: container IDs never became available",
            pod.metadata.name.as_deref().unwrap_or("<unnamed>")
        );
        None
    }

    /// Applies the computed cpuset of every container, then the infra
    /// container, then marks the pod as configured.
    async fn adjust_container_sets(&self, pod: &Pod) -> Result<(), SetterError> {
        let containers = pod
            .spec
            .as_ref()
            .map(|spec| spec.containers.as_slice())
            .unwrap_or_default();
        let mut pod_dir = None;
        let mut container_ids = Vec::new();
        let mut failed = 0;
        for container in containers {
            if let Some(id) = container_id_of(pod, &container.name) {
                container_ids.push(id);
            }
            match self
                .with_retry(|| self.applier.apply_container(pod, container))
                .await
            {
                Ok(Some(dir)) => pod_dir = dir.parent().map(ToOwned::to_owned).or(pod_dir),
                Ok(None) => {}
                Err(err) => {
                    failed += 1;
                    log::error!(
                        "could not apply cpuset of container {} in pod {}: {err}",
                        container.name,
                        pod.metadata.name.as_deref().unwrap_or("<unnamed>"),
                    );
                }
            }
        }
        if failed > 0 {
            return Err(SetterError::PodAbandoned {
                failed,
                total: containers.len(),
            });
        }
        if let Some(pod_dir) = pod_dir {
            self.with_retry(|| self.applier.apply_infra_container(&pod_dir, &container_ids))
                .await?;
        }
        self.mark_configured(pod).await
    }

    /// Sets the completion annotation the process-starter's handshake hangs
    /// off, with the same retry budget as the cgroup writes.
    async fn mark_configured(&self, pod: &Pod) -> Result<(), SetterError> {
        let namespace = pod
            .metadata
            .namespace
            .as_deref()
            .unwrap_or("default")
            .to_owned();
        let Some(name) = pod.metadata.name.as_deref() else {
            return Ok(());
        };
        let mut attempt = 0;
        loop {
            match k8s::patch_pod_annotation(
                &self.client,
                &namespace,
                name,
                CPUSETS_CONFIGURED_ANNOTATION,
                "true",
            )
            .await
            {
                Ok(()) => return Ok(()),
                Err(err) if attempt + 1 < MAX_RETRY => {
                    attempt += 1;
                    log::debug!("annotating pod {name} failed (attempt {attempt}): {err}");
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// One reconciliation pass over the live pod list of this node.
    async fn reconcile(&self) -> Result<(), SetterError> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let field_selector = format!("spec.nodeName={}", self.node_name);
        let list = pods
            .list(&ListParams::default().fields(&field_selector))
            .await
            .map_err(k8s::K8sError::from)?;
        self.applier.reconcile_tree(&list.items)
    }

    async fn with_retry<T>(
        &self,
        mut op: impl FnMut() -> Result<T, SetterError>,
    ) -> Result<T, SetterError> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 < MAX_RETRY => {
                    attempt += 1;
                    log::debug!("retrying after: {err} (attempt {attempt})");
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Every container in the pod spec has a status entry with a non-empty
/// container ID.
fn containers_ready(pod: &Pod) -> bool {
    let Some(containers) = pod.spec.as_ref().map(|spec| &spec.containers) else {
        return false;
    };
    containers
        .iter()
        .all(|container| container_id_of(pod, &container.name).is_some())
}
