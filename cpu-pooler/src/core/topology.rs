//! CPU topology probing via `lscpu`.
//!
//! `lscpu -p=cpu,<attr>` prints one `logical,attribute` pair per line; the
//! `-p` and `-J` options are mutually exclusive, so the output has to be
//! parsed by hand. A host where the tool is absent or prints something
//! unexpected degrades to empty maps: exclusive devices then carry no NUMA
//! hints and hyper-threading expansion is a no-op, but nothing fails.

use std::{collections::HashMap, process::Command};

use crate::core::cpuset::CpuSet;

const LSCPU: &str = "lscpu";

/// Returns the logical core → NUMA node map of this host.
pub fn numa_topology() -> HashMap<u32, u32> {
    parse_core_map(&list_cores("node"))
}

/// Returns the physical core → hyper-thread sibling map of this host.
///
/// The physical core itself is not part of its sibling set.
pub fn ht_topology() -> HashMap<u32, CpuSet> {
    let core_map = parse_core_map(&list_cores("core"));
    let mut siblings: HashMap<u32, CpuSet> = HashMap::new();
    for (logical, physical) in core_map {
        if logical != physical {
            siblings.entry(physical).or_default().insert(logical);
        }
    }
    siblings
}

/// Expands an exclusive allocation with the hyper-thread siblings of every
/// core it contains. Pure so it can be exercised without a live host.
pub fn expand_ht_siblings(cpus: &CpuSet, siblings: &HashMap<u32, CpuSet>) -> CpuSet {
    let mut expanded = cpus.clone();
    for core in cpus.iter() {
        if let Some(set) = siblings.get(&core) {
            expanded = expanded.union(set);
        }
    }
    expanded
}

/// Parses `lscpu -p` output into a logical-core keyed map.
///
/// Comment and header lines start with `#`; any line that does not split
/// into exactly two integer fields is skipped.
fn parse_core_map(output: &str) -> HashMap<u32, u32> {
    let mut map = HashMap::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.trim().split(',').collect();
        if fields.len() != 2 {
            continue;
        }
        let (Ok(cpu), Ok(attribute)) = (fields[0].parse(), fields[1].parse()) else {
            continue;
        };
        map.insert(cpu, attribute);
    }
    map
}

fn list_cores(attribute: &str) -> String {
    match Command::new(LSCPU).arg(format!("-p=cpu,{attribute}")).output() {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).into_owned()
        }
        Ok(output) => {
            log::error!(
                "lscpu exited with {} while interrogating the CPU topology",
                output.status
            );
            String::new()
        }
        Err(err) => {
            log::error!("could not interrogate the CPU topology of the node: {err}");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LSCPU_NODE_OUTPUT: &str = "\
# The following is the parsable format, which can be fed to other
# programs. Each different item in every column has an unique ID
# CPU,Node
0,0
1,0
2,1
3,1
";

    #[test]
    fn parses_cpu_node_pairs() {
        let map = parse_core_map(LSCPU_NODE_OUTPUT);
        assert_eq!(map.len(), 4);
        assert_eq!(map[&0], 0);
        assert_eq!(map[&3], 1);
    }

    #[test]
    fn skips_malformed_lines() {
        let map = parse_core_map("0,0\nnot,a,core\nx,1\n4\n\n5,2\n");
        assert_eq!(map.len(), 2);
        assert_eq!(map[&0], 0);
        assert_eq!(map[&5], 2);
    }

    #[test]
    fn sibling_map_excludes_the_physical_core() {
        // cores 0-1 are physical, 2-3 their hyper-thread siblings
        let output = "0,0\n1,1\n2,0\n3,1\n";
        let core_map = parse_core_map(output);
        let mut siblings: HashMap<u32, CpuSet> = HashMap::new();
        for (logical, physical) in core_map {
            if logical != physical {
                siblings.entry(physical).or_default().insert(logical);
            }
        }
        assert_eq!(siblings[&0].to_string(), "2");
        assert_eq!(siblings[&1].to_string(), "3");
    }

    #[test]
    fn expansion_unions_all_siblings() {
        let siblings = HashMap::from([
            (22, CpuSet::parse("62").unwrap()),
            (35, CpuSet::parse("75").unwrap()),
        ]);
        let granted = CpuSet::parse("22,35").unwrap();
        assert_eq!(expand_ht_siblings(&granted, &siblings).to_string(), "22,35,62,75");
    }

    #[test]
    fn expansion_without_siblings_is_identity() {
        let granted = CpuSet::parse("3-4").unwrap();
        assert_eq!(expand_ht_siblings(&granted, &HashMap::new()), granted);
    }
}
