//! Generated device-plugin API types and the protocol constants shared by
//! the pool servers and the cpusetter controller.

/// Kubelet device-plugin API, generated from `proto/deviceplugin.proto`.
#[allow(missing_debug_implementations)]
pub mod v1beta1 {
    tonic::include_proto!("v1beta1");
}

/// Device-plugin API version announced at registration.
pub const API_VERSION: &str = "v1beta1";

/// Directory the kubelet expects device-plugin sockets in.
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins";

/// Name of the kubelet's own registration socket inside
/// [`DEVICE_PLUGIN_PATH`].
pub const KUBELET_SOCKET: &str = "kubelet.sock";

/// Health value reported for every advertised CPU device.
pub const HEALTHY: &str = "Healthy";

/// Base of every resource name this plugin advertises
/// (`<base>/<pool-name>`).
pub const RESOURCE_BASE_NAME: &str = "nokia.k8s.io";

/// Pod annotation carrying the per-process CPU plan.
pub const CPU_ANNOTATION: &str = "nokia.k8s.io/cpus";

/// Pod annotation the cpusetter sets once every container cgroup has been
/// written; the process-starter's readiness handshake hangs off it.
pub const CPUSETS_CONFIGURED_ANNOTATION: &str = "nokia.k8s.io/cpusets-configured";

/// A shared pool's cores are advertised this many times over, so the
/// scheduler can dispense milli-CPU units from it.
pub const SHARED_POOL_DEVICE_MULTIPLIER: usize = 1000;

/// Environment variable carrying a container's exclusive cores in canonical
/// range encoding.
pub const EXCLUSIVE_CPUS_ENV: &str = "EXCLUSIVE_CPUS";

/// Environment variable carrying the full CPU set of the node's shared pool.
pub const SHARED_CPUS_ENV: &str = "SHARED_CPUS";

/// Environment variable naming the pool categories a container draws from;
/// see [`crate::core::pool::CpuPools`].
pub const CPU_POOLS_ENV: &str = "CPU_POOLS";

/// Environment variable telling the process-starter which container of the
/// pod it runs in.
pub const CONTAINER_NAME_ENV: &str = "CONTAINER_NAME";

/// Returns the advertised resource name of a pool.
pub fn resource_name(pool_name: &str) -> String {
    format!("{RESOURCE_BASE_NAME}/{pool_name}")
}

/// The pool name of an advertised resource, when it is one of ours.
pub fn pool_of_resource(resource: &str) -> Option<&str> {
    resource
        .strip_prefix(RESOURCE_BASE_NAME)
        .and_then(|rest| rest.strip_prefix('/'))
}
