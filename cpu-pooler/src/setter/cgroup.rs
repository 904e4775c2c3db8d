//! Locating and writing cpuset cgroup files.
//!
//! Container runtimes place each container's cpuset cgroup somewhere below a
//! per-node root; the directory name embeds the container ID the pod status
//! reports, minus the runtime prefix. Discovery is therefore a downward walk
//! matching on the name segment.

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use walkdir::WalkDir;

use crate::{core::cpuset::CpuSet, setter::SetterError};

/// File inside a cpuset cgroup directory holding the allowed cores.
pub const CPUSET_FILE: &str = "cpuset.cpus";

/// Container-ID prefixes the supported runtimes prepend in pod status.
pub const RUNTIME_PREFIXES: &[&str] = &["docker://", "containerd://", "crio://", "cri-o://"];

/// Strips the runtime scheme off a status container ID.
pub fn strip_runtime_prefix(container_id: &str) -> &str {
    for prefix in RUNTIME_PREFIXES {
        if let Some(stripped) = container_id.strip_prefix(prefix) {
            return stripped;
        }
    }
    container_id
}

/// Walks downward from `root` and returns the cgroup directory belonging to
/// the given (already stripped) container ID.
///
/// The first directory whose name contains the ID wins. When the match has a
/// child cgroup the child takes precedence, to land inside runtimes that
/// nest an extra scope directory.
pub fn find_container_cgroup(root: &Path, container_id: &str) -> Result<PathBuf, SetterError> {
    if !container_id.is_empty() {
        for entry in WalkDir::new(root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_dir())
        {
            if entry.file_name().to_string_lossy().contains(container_id) {
                let dir = entry.path();
                if let Some(child) = first_child_dir(dir) {
                    return Ok(child);
                }
                return Ok(dir.to_owned());
            }
        }
    }
    Err(SetterError::CgroupNotFound {
        root: root.to_owned(),
        container_id: container_id.to_owned(),
    })
}

/// Overwrites `<dir>/cpuset.cpus` with the canonical encoding of `cpus` in
/// a single write. The file must already exist; a missing file means the
/// runtime has not materialized the cgroup yet and the caller retries.
pub fn write_cpuset(dir: &Path, cpus: &CpuSet) -> Result<(), SetterError> {
    let path = dir.join(CPUSET_FILE);
    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(&path)
        .map_err(|source| SetterError::CgroupWrite {
            path: path.clone(),
            source,
        })?;
    file.write_all(cpus.to_string().as_bytes())
        .map_err(|source| SetterError::CgroupWrite { path, source })
}

/// Reads and parses `<dir>/cpuset.cpus`.
pub fn read_cpuset(dir: &Path) -> Result<CpuSet, SetterError> {
    let path = dir.join(CPUSET_FILE);
    let contents = std::fs::read_to_string(&path).map_err(|source| SetterError::CgroupRead {
        path: path.clone(),
        source,
    })?;
    CpuSet::parse(contents.trim()).map_err(|_| SetterError::CgroupRead {
        path,
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, "unparseable cpuset"),
    })
}

/// Enumerates leaf cgroup directories below `root`: directories without
/// child cgroups (link count 2 on cgroupfs).
pub fn leaf_cgroup_dirs(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
        .map(|entry| entry.into_path())
        .filter(|path| first_child_dir(path).is_none())
        .collect()
}

fn first_child_dir(dir: &Path) -> Option<PathBuf> {
    let mut children: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    children.sort();
    children.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_known_runtime_prefixes() {
        assert_eq!(strip_runtime_prefix("docker://cont01"), "cont01");
        assert_eq!(strip_runtime_prefix("containerd://abc"), "abc");
        assert_eq!(strip_runtime_prefix("crio://abc"), "abc");
        assert_eq!(strip_runtime_prefix("bare-id"), "bare-id");
    }

    #[test]
    fn finds_the_directory_containing_the_id() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("kubepods/besteffort/pod01/cont01");
        std::fs::create_dir_all(&dir).unwrap();

        let found = find_container_cgroup(root.path(), "cont01").unwrap();
        assert_eq!(found, dir);
    }

    #[test]
    fn nested_scope_takes_precedence() {
        let root = tempfile::tempdir().unwrap();
        let outer = root.path().join("pod01/docker-cont02.scope");
        let inner = outer.join("container");
        std::fs::create_dir_all(&inner).unwrap();

        let found = find_container_cgroup(root.path(), "cont02").unwrap();
        assert_eq!(found, inner);
    }

    #[test]
    fn missing_container_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        assert!(matches!(
            find_container_cgroup(root.path(), "ghost"),
            Err(SetterError::CgroupNotFound { .. })
        ));
        assert!(matches!(
            find_container_cgroup(root.path(), ""),
            Err(SetterError::CgroupNotFound { .. })
        ));
    }

    #[test]
    fn writes_the_canonical_encoding_without_newline() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CPUSET_FILE), "E").unwrap();

        let cpus = CpuSet::parse("3-4").unwrap();
        write_cpuset(dir.path(), &cpus).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join(CPUSET_FILE)).unwrap(),
            "3-4"
        );
        assert_eq!(read_cpuset(dir.path()).unwrap(), cpus);
    }

    #[test]
    fn write_to_a_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            write_cpuset(dir.path(), &CpuSet::parse("1").unwrap()),
            Err(SetterError::CgroupWrite { .. })
        ));
    }
}
