//! The per-pool device-plugin servers and their supervisor.

use std::{path::PathBuf, time::Duration};

use crate::core::pool::PoolConfigError;

pub mod server;
pub mod supervisor;

pub use server::CpuDeviceManager;
pub use supervisor::PluginSupervisor;

/// How often an established `ListAndWatch` stream re-sends the (unchanged)
/// device list. The upstream design re-emits on a fixed interval as a
/// keep-alive; preserved here behind this constant.
pub const LIST_AND_WATCH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("could not clean up stale socket {path}: {source}")]
    Cleanup {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not bind device plugin socket {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("device plugin server did not become ready at {path}")]
    NotReady { path: PathBuf },
    #[error("device plugin transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("registration with the kubelet failed: {0}")]
    Registration(#[from] tonic::Status),
    #[error(transparent)]
    PoolConfig(#[from] PoolConfigError),
    #[error("filesystem watcher error: {0}")]
    Watcher(#[from] notify::Error),
}
