pub use crate::core::{
    annotation::AnnotationError, checkpoint::CheckpointError, cpuset::ParseCpuSetError,
    pool::PoolConfigError,
};
pub use crate::k8s::K8sError;
pub use crate::plugin::PluginError;
pub use crate::setter::SetterError;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-level error, aggregating the per-subsystem error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    PoolConfig(#[from] PoolConfigError),
    #[error(transparent)]
    CpuSet(#[from] ParseCpuSetError),
    #[error(transparent)]
    Annotation(#[from] AnnotationError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    K8s(#[from] K8sError),
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error(transparent)]
    Setter(#[from] SetterError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
