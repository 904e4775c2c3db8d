//! Thin wrappers around the Kubernetes API client.

use std::{collections::BTreeMap, path::Path};

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{
    api::{Api, Patch, PatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};

/// Environment variable naming the node this process runs on.
pub const NODE_NAME_ENV: &str = "NODE_NAME";

#[derive(Debug, thiserror::Error)]
pub enum K8sError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("could not load kubeconfig: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),
    #[error("could not infer in-cluster configuration: {0}")]
    InferConfig(#[from] kube::config::InferConfigError),
    #[error("NODE_NAME environment variable missing")]
    MissingNodeName,
}

/// Name of the node this process is scoped to, from `NODE_NAME`.
pub fn node_name() -> Result<String, K8sError> {
    std::env::var(NODE_NAME_ENV)
        .ok()
        .filter(|name| !name.is_empty())
        .ok_or(K8sError::MissingNodeName)
}

/// Builds an API client, either from an explicit kubeconfig (out-of-cluster
/// mode) or from the in-cluster service account.
pub async fn client(kubeconfig: Option<&Path>) -> Result<Client, K8sError> {
    let config = match kubeconfig {
        Some(path) => {
            Config::from_custom_kubeconfig(
                Kubeconfig::read_from(path)?,
                &KubeConfigOptions::default(),
            )
            .await?
        }
        None => Config::infer().await?,
    };
    Ok(Client::try_from(config)?)
}

/// Labels of the node named by `NODE_NAME`, or `None` when the node carries
/// no labels.
pub async fn node_labels(client: &Client) -> Result<Option<BTreeMap<String, String>>, K8sError> {
    let nodes: Api<Node> = Api::all(client.clone());
    let node = nodes.get(&node_name()?).await?;
    Ok(node.metadata.labels)
}

/// Re-fetches a pod from the API server.
pub async fn get_pod(client: &Client, namespace: &str, name: &str) -> Result<Pod, K8sError> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    Ok(pods.get(name).await?)
}

/// Sets one metadata annotation on a pod via a JSON merge patch.
pub async fn patch_pod_annotation(
    client: &Client,
    namespace: &str,
    name: &str,
    key: &str,
    value: &str,
) -> Result<(), K8sError> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({
        "metadata": {
            "annotations": { key: value }
        }
    });
    pods.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
