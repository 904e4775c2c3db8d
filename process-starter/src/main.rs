//! Entry point injected into pinned workload containers.
//!
//! Before the actual workload starts, this helper waits until the cpusetter
//! has written the expected cpuset into the container's cgroup, sets the
//! thread affinity per process according to the pod's CPU annotation, and
//! then hands control over: every process but the last is spawned as a
//! child, the last one replaces this binary via exec.

use std::{
    fs::File,
    io::{BufRead, BufReader},
    os::unix::process::CommandExt,
    process::{Command, ExitCode},
    time::Duration,
};

use nix::{sched::sched_setaffinity, unistd::Pid};

use cpu_pooler::{
    core::{
        annotation::AnnotationError,
        pool::{CpuPools, EXCLUSIVE_POOL_PREFIX},
    },
    deviceplugin::{CONTAINER_NAME_ENV, CPU_ANNOTATION, CPU_POOLS_ENV, EXCLUSIVE_CPUS_ENV, SHARED_CPUS_ENV},
    CpuAnnotation, CpuSet,
};

/// Downward-API file carrying the pod annotations.
const PODINFO_ANNOTATIONS: &str = "/etc/podinfo/annotations";

/// The container's own view of its cpuset cgroup.
const CGROUP_CPUSET_FILE: &str = "/sys/fs/cgroup/cpuset/cpuset.cpus";

const CPUSET_POLLS: u32 = 10;
const CPUSET_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
enum StarterError {
    #[error("could not read pod annotations from {PODINFO_ANNOTATIONS}: {0}")]
    ReadAnnotations(std::io::Error),
    #[error("pod CPU annotation is malformed: {0}")]
    Annotation(#[from] AnnotationError),
    #[error("pod CPU annotation is not a valid downward-API value: {0}")]
    AnnotationEncoding(#[from] serde_json::Error),
    #[error("{CONTAINER_NAME_ENV} environment variable not found")]
    MissingContainerName,
    #[error("could not read cgroup cpuset {CGROUP_CPUSET_FILE}: {0}")]
    ReadCgroup(std::io::Error),
    #[error("cgroup cpuset ({actual}) never reached the expected cpuset ({expected})")]
    CpusetMismatch { expected: CpuSet, actual: CpuSet },
    #[error("not enough CPUs free to pin {needed} (have {available})")]
    NotEnoughCpus { needed: usize, available: usize },
    #[error("could not set CPU affinity: {0}")]
    Affinity(#[from] nix::errno::Errno),
    #[error("could not exec '{program}': {source}")]
    Exec {
        program: String,
        source: std::io::Error,
    },
    #[error("no command line to fall back to")]
    NothingToExec,
}

fn main() -> ExitCode {
    pretty_env_logger::init();
    match run() {
        // run() only returns through an exec failure or an error
        Err(err) => {
            log::error!("process-starter failed: {err}");
            ExitCode::FAILURE
        }
        Ok(()) => ExitCode::SUCCESS,
    }
}

fn run() -> Result<(), StarterError> {
    let annotation = read_cpu_annotation()?;
    let container_name =
        std::env::var(CONTAINER_NAME_ENV).map_err(|_| StarterError::MissingContainerName)?;

    let (mut exclusive_cpus, shared_cpus) = poll_cpuset_completion()?;

    if let Some(spec) = annotation
        .as_ref()
        .and_then(|annotation| annotation.container(&container_name))
    {
        log::info!("starting processes defined in the pod annotation");
        let last = spec.processes.len() - 1;
        for (index, process) in spec.processes.iter().enumerate() {
            if process.pool_name.starts_with(EXCLUSIVE_POOL_PREFIX) {
                // exclusive processes consume their cores from the front of
                // the granted list
                exclusive_cpus = set_affinity(process.cpus as usize, &exclusive_cpus)?;
            } else {
                set_affinity(shared_cpus.len(), &shared_cpus)?;
            }
            let mut command = Command::new(&process.name);
            command.args(&process.args);
            if index == last {
                let source = command.exec();
                return Err(StarterError::Exec {
                    program: process.name.clone(),
                    source,
                });
            }
            match command.spawn() {
                Ok(child) => log::info!("started {} (pid {})", process.name, child.id()),
                Err(err) => log::error!("failed starting {}: {err}", process.name),
            }
        }
    }

    // No annotation entry for this container: hand over to the command line
    // the webhook preserved from the original pod spec.
    log::info!("no processes in pod annotation, starting process from pod spec command");
    let mut argv = std::env::args_os().skip(1);
    let program = argv.next().ok_or(StarterError::NothingToExec)?;
    let source = Command::new(&program).args(argv).exec();
    Err(StarterError::Exec {
        program: program.to_string_lossy().into_owned(),
        source,
    })
}

/// Extracts and decodes the CPU annotation from the downward-API file.
/// `None` when the pod carries no CPU annotation.
fn read_cpu_annotation() -> Result<Option<CpuAnnotation>, StarterError> {
    let file = File::open(PODINFO_ANNOTATIONS).map_err(StarterError::ReadAnnotations)?;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(StarterError::ReadAnnotations)?;
        if let Some(annotation) = decode_annotation_line(&line)? {
            return Ok(Some(annotation));
        }
    }
    Ok(None)
}

/// The downward API writes `<key>="<json-escaped value>"`; unquote the value
/// and decode the annotation proper.
fn decode_annotation_line(line: &str) -> Result<Option<CpuAnnotation>, StarterError> {
    let Some(value) = line.strip_prefix(CPU_ANNOTATION).and_then(|rest| rest.strip_prefix('=')) else {
        return Ok(None);
    };
    let json: String = serde_json::from_str(value)?;
    Ok(Some(CpuAnnotation::decode(&json)?))
}

/// Waits until the cgroup cpuset equals the set implied by the `CPU_POOLS`
/// category and the `EXCLUSIVE_CPUS`/`SHARED_CPUS` environment.
///
/// Returns the exclusive and shared core lists in ascending order.
fn poll_cpuset_completion() -> Result<(Vec<u32>, Vec<u32>), StarterError> {
    let pool_type = std::env::var(CPU_POOLS_ENV)
        .ok()
        .and_then(|value| value.parse::<CpuPools>().ok())
        .unwrap_or(CpuPools::Default);
    log::info!("used CPU pool(s): {pool_type}");

    let mut expected = CpuSet::new();
    let mut actual = CpuSet::new();
    for _ in 0..CPUSET_POLLS {
        let exclusive = env_cpuset(EXCLUSIVE_CPUS_ENV);
        let shared = env_cpuset(SHARED_CPUS_ENV);
        expected = match pool_type {
            CpuPools::ExclusiveAndShared => {
                if exclusive.is_empty() || shared.is_empty() {
                    std::thread::sleep(CPUSET_POLL_INTERVAL);
                    continue;
                }
                exclusive.union(&shared)
            }
            CpuPools::Exclusive => {
                if exclusive.is_empty() {
                    std::thread::sleep(CPUSET_POLL_INTERVAL);
                    continue;
                }
                exclusive.clone()
            }
            CpuPools::Shared => {
                if shared.is_empty() {
                    std::thread::sleep(CPUSET_POLL_INTERVAL);
                    continue;
                }
                shared.clone()
            }
            CpuPools::Default => CpuSet::new(),
        };

        let contents =
            std::fs::read_to_string(CGROUP_CPUSET_FILE).map_err(StarterError::ReadCgroup)?;
        actual = match CpuSet::parse(contents.trim()) {
            Ok(set) => set,
            Err(err) => {
                log::warn!("cannot parse cgroup cpuset '{}': {err}", contents.trim());
                CpuSet::new()
            }
        };
        log::info!("cgroup cpuset ({actual}) expected cpuset ({expected})");
        if !expected.is_empty() && expected == actual {
            return Ok((exclusive.iter().collect(), shared.iter().collect()));
        }
        std::thread::sleep(CPUSET_POLL_INTERVAL);
    }
    Err(StarterError::CpusetMismatch { expected, actual })
}

fn env_cpuset(name: &str) -> CpuSet {
    let Ok(value) = std::env::var(name) else {
        return CpuSet::new();
    };
    match CpuSet::parse(&value) {
        Ok(set) => set,
        Err(err) => {
            log::warn!("cannot parse {name} environment variable: {err}");
            CpuSet::new()
        }
    }
}

/// Pins the calling thread to the first `count` cores of `cpu_list` and
/// returns the cores left over for the next process.
fn set_affinity(count: usize, cpu_list: &[u32]) -> Result<Vec<u32>, StarterError> {
    if cpu_list.len() < count {
        return Err(StarterError::NotEnoughCpus {
            needed: count,
            available: cpu_list.len(),
        });
    }
    let mut cpuset = nix::sched::CpuSet::new();
    for cpu in &cpu_list[..count] {
        cpuset.set(*cpu as usize)?;
    }
    sched_setaffinity(Pid::from_raw(0), &cpuset)?;
    Ok(cpu_list[count..].to_vec())
}
