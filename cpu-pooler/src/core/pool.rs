//! Pool definitions and the per-node pool configuration files.
//!
//! A node's pools live in YAML files named `poolconfig-*` under a common
//! configuration directory. Each file carries a `nodeSelector`; the first
//! file whose selector is a subset of the node's labels wins.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::core::cpuset::{CpuSet, ParseCpuSetError};

/// Name prefix marking a pool whose cores are time-shared across containers.
pub const SHARED_POOL_PREFIX: &str = "shared";
/// Name prefix marking a pool whose cores are granted one-to-one.
pub const EXCLUSIVE_POOL_PREFIX: &str = "exclusive";
/// Name prefix of the pool backing containers without an explicit request.
pub const DEFAULT_POOL_PREFIX: &str = "default";

/// Default location of the `poolconfig-*` files.
pub const POOL_CONFIG_DIR: &str = "/etc/cpu-pooler";

#[derive(Debug, thiserror::Error)]
pub enum PoolConfigError {
    #[error("could not read poolconfig file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not list pool configuration directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("poolconfig file {path} could not be parsed: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("CPUs of pool '{pool}' could not be parsed: {source}")]
    BadCpus {
        pool: String,
        source: ParseCpuSetError,
    },
    #[error("no matching pool configuration file found for the provided node labels")]
    NoMatchingConfig,
    #[error("only one shared pool is allowed per node configuration")]
    MultipleSharedPools,
}

/// The type of a CPU pool, derived from the constant prefix of its name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, parse_display::Display)]
#[display(style = "lowercase")]
pub enum PoolType {
    Shared,
    Exclusive,
    Default,
}

impl PoolType {
    /// Classifies a pool by its name prefix. Anything that is neither
    /// shared nor exclusive is treated as a default pool, matching how the
    /// resource advertisement skips it.
    pub fn of(pool_name: &str) -> Self {
        if pool_name.starts_with(SHARED_POOL_PREFIX) {
            PoolType::Shared
        } else if pool_name.starts_with(EXCLUSIVE_POOL_PREFIX) {
            PoolType::Exclusive
        } else {
            PoolType::Default
        }
    }
}

/// Hyper-threading policy of a pool.
///
/// Under `MultiThreaded` an exclusive allocation is expanded with the
/// hyper-thread siblings of every granted core before it reaches the
/// container.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub enum HtPolicy {
    #[default]
    #[serde(rename = "singleThreaded")]
    SingleThreaded,
    #[serde(rename = "multiThreaded")]
    MultiThreaded,
}

/// A named subset of the host's CPU cores.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pool {
    pub cpus: CpuSet,
    pub ht_policy: HtPolicy,
}

/// The pool-type category (or categories) a workload draws from, as exposed
/// to it through the `CPU_POOLS` environment variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, parse_display::Display, parse_display::FromStr)]
pub enum CpuPools {
    #[display("shared")]
    Shared,
    #[display("exclusive")]
    Exclusive,
    #[display("exclusive&shared")]
    ExclusiveAndShared,
    #[display("default")]
    Default,
}

/// Pool configuration of one node: the pools plus the node selector that
/// decides which nodes the file applies to.
#[derive(Clone, Debug, Default)]
pub struct PoolConfig {
    pub pools: BTreeMap<String, Pool>,
    pub node_selector: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawPoolConfig {
    #[serde(default)]
    pools: BTreeMap<String, RawPool>,
    #[serde(rename = "nodeSelector", default)]
    node_selector: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawPool {
    cpus: String,
    #[serde(rename = "hyperThreadingPolicy", default)]
    hyper_threading_policy: Option<HtPolicy>,
}

impl PoolConfig {
    /// Reads and validates a single pool configuration file. A malformed
    /// CPU range in any pool rejects the whole file.
    pub fn read_file(path: impl AsRef<Path>) -> Result<Self, PoolConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| PoolConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let raw: RawPoolConfig =
            serde_yaml::from_str(&contents).map_err(|source| PoolConfigError::Parse {
                path: path.to_owned(),
                source,
            })?;

        let mut pools = BTreeMap::new();
        for (name, raw_pool) in raw.pools {
            let cpus = CpuSet::parse(&raw_pool.cpus)
                .map_err(|source| PoolConfigError::BadCpus {
                    pool: name.clone(),
                    source,
                })?;
            pools.insert(
                name,
                Pool {
                    cpus,
                    ht_policy: raw_pool.hyper_threading_policy.unwrap_or_default(),
                },
            );
        }
        Ok(Self {
            pools,
            node_selector: raw.node_selector,
        })
    }

    /// Returns the first pool whose name starts with the given type prefix,
    /// or an empty pool when the configuration has none of that type.
    pub fn select_pool(&self, prefix: &str) -> Pool {
        self.pools
            .iter()
            .find(|(name, _)| name.starts_with(prefix))
            .map(|(_, pool)| pool.clone())
            .unwrap_or_default()
    }

    /// Looks up a pool by its exact name.
    pub fn pool(&self, name: &str) -> Option<&Pool> {
        self.pools.get(name)
    }

    /// Checks the single-shared-pool invariant and returns the shared
    /// pool's canonical CPU list (empty when the node has no shared pool).
    pub fn validate(&self) -> Result<String, PoolConfigError> {
        let mut shared_cpus = String::new();
        for (name, pool) in &self.pools {
            if PoolType::of(name) == PoolType::Shared {
                if !shared_cpus.is_empty() {
                    return Err(PoolConfigError::MultipleSharedPools);
                }
                shared_cpus = pool.cpus.to_string();
            }
        }
        Ok(shared_cpus)
    }

    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.node_selector
            .iter()
            .all(|(label, value)| labels.get(label) == Some(value))
    }
}

/// Scans `dir` for `poolconfig-*` files and picks the one applying to a
/// node with the given labels.
///
/// Files are visited in name order. When no label information is available
/// the first file wins; otherwise the first file whose `nodeSelector` is a
/// subset of the labels is selected.
pub fn read_pool_config(
    dir: impl AsRef<Path>,
    labels: Option<&BTreeMap<String, String>>,
) -> Result<(PoolConfig, PathBuf), PoolConfigError> {
    let dir = dir.as_ref();
    let mut candidates: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|source| PoolConfigError::ReadDir {
            path: dir.to_owned(),
            source,
        })?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("poolconfig-"))
        })
        .collect();
    candidates.sort();

    for path in candidates {
        let config = PoolConfig::read_file(&path)?;
        match labels {
            None => {
                log::info!(
                    "using first configuration file {} as pool config in lieu of node label information",
                    path.display()
                );
                return Ok((config, path));
            }
            Some(labels) if config.matches(labels) => {
                log::info!("using configuration file {} for pool config", path.display());
                return Ok((config, path));
            }
            Some(_) => {}
        }
    }
    Err(PoolConfigError::NoMatchingConfig)
}
