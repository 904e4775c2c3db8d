//! The per-pod CPU annotation.
//!
//! Workloads that want their processes pinned individually attach a JSON
//! annotation (key `nokia.k8s.io/cpus`) describing, per container, the
//! processes to start and the pool plus CPU count each one needs. The
//! admission webhook validates it against the container resources; the
//! process-starter replays it inside the container.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::core::pool::{EXCLUSIVE_POOL_PREFIX, SHARED_POOL_PREFIX};

#[derive(Debug, thiserror::Error)]
pub enum AnnotationError {
    #[error("CPU annotation is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("'container' is mandatory in annotation")]
    MissingContainerName,
    #[error("'processes' is mandatory in annotation for container '{0}'")]
    NoProcesses(String),
    #[error("'process' (name) is mandatory in annotation for container '{0}'")]
    MissingProcessName(String),
    #[error("'cpus' field is mandatory in annotation for container '{0}'")]
    MissingCpus(String),
}

/// One process to be started by the process-starter inside a container.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Process {
    #[serde(rename = "process")]
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Exclusive pools: number of cores. Shared pools: milli-CPUs.
    #[serde(default)]
    pub cpus: u32,
    #[serde(rename = "pool")]
    pub pool_name: String,
}

/// One container entry of the annotation.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ContainerSpec {
    #[serde(rename = "container", default)]
    pub name: String,
    #[serde(default)]
    pub processes: Vec<Process>,
}

/// The decoded pod CPU annotation, keyed by container name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuAnnotation {
    containers: BTreeMap<String, ContainerSpec>,
}

impl CpuAnnotation {
    /// Decodes and validates the JSON annotation value.
    ///
    /// The value is an array for backwards compatibility with older chart
    /// versions even though it is conceptually a map.
    pub fn decode(annotation: &str) -> Result<Self, AnnotationError> {
        let containers: Vec<ContainerSpec> = serde_json::from_str(annotation)?;
        let mut decoded = BTreeMap::new();
        for container in containers {
            if container.name.is_empty() {
                return Err(AnnotationError::MissingContainerName);
            }
            if container.processes.is_empty() {
                return Err(AnnotationError::NoProcesses(container.name));
            }
            for process in &container.processes {
                if process.name.is_empty() {
                    return Err(AnnotationError::MissingProcessName(container.name));
                }
                if process.cpus == 0 {
                    return Err(AnnotationError::MissingCpus(container.name));
                }
            }
            decoded.insert(container.name.clone(), container);
        }
        Ok(Self { containers: decoded })
    }

    /// Names of the containers present in the annotation.
    pub fn container_names(&self) -> Vec<&str> {
        self.containers.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, container: &str) -> bool {
        self.containers.contains_key(container)
    }

    /// The container's entry, if any.
    pub fn container(&self, container: &str) -> Option<&ContainerSpec> {
        self.containers.get(container)
    }

    /// Sum of milli-CPU time the container requests from shared pools.
    pub fn shared_cpu_time(&self, container: &str) -> u32 {
        self.sum_cpus(container, |p| p.pool_name.starts_with(SHARED_POOL_PREFIX))
    }

    /// Sum of cores the container requests from exclusive pools.
    pub fn exclusive_cpus(&self, container: &str) -> u32 {
        self.sum_cpus(container, |p| {
            p.pool_name.starts_with(EXCLUSIVE_POOL_PREFIX)
        })
    }

    /// Distinct pools referenced by the container, in declaration order.
    pub fn pools(&self, container: &str) -> Vec<&str> {
        let mut pools = Vec::new();
        if let Some(spec) = self.containers.get(container) {
            for process in &spec.processes {
                if !pools.contains(&process.pool_name.as_str()) {
                    pools.push(process.pool_name.as_str());
                }
            }
        }
        pools
    }

    /// Total CPU count the container requests from one specific pool.
    pub fn cpu_requests(&self, pool: &str, container: &str) -> u32 {
        self.sum_cpus(container, |p| p.pool_name == pool)
    }

    fn sum_cpus(&self, container: &str, matches: impl Fn(&Process) -> bool) -> u32 {
        self.containers
            .get(container)
            .map(|spec| {
                spec.processes
                    .iter()
                    .filter(|p| matches(p))
                    .map(|p| p.cpus)
                    .sum()
            })
            .unwrap_or(0)
    }
}
