use std::{collections::BTreeSet, fmt, str::FromStr};

/// Error type for parsing the compact CPU range grammar.
#[derive(Debug, thiserror::Error)]
pub enum ParseCpuSetError {
    #[error("'{0}' is not a valid core ID")]
    InvalidCore(String),
    #[error("'{0}' is not a valid core range")]
    InvalidRange(String),
    #[error("range '{0}' is descending")]
    DescendingRange(String),
}

/// An ordered set of CPU core IDs.
///
/// The canonical text form is the one the kernel uses for cpuset cgroup
/// files: sorted, comma separated, with `a-b` for contiguous runs, e.g.
/// `0-2,5,7-8`. [`CpuSet::parse`] and the [`fmt::Display`] impl round-trip
/// through that encoding, and two equal sets always render byte-identically.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuSet {
    cores: BTreeSet<u32>,
}

impl CpuSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a compact range expression such as `"0-3,7"`.
    ///
    /// The empty string parses to the empty set, matching what the kernel
    /// reports for a cpuset with no cores assigned.
    pub fn parse(s: &str) -> Result<Self, ParseCpuSetError> {
        let mut cores = BTreeSet::new();
        for part in s.trim().split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('-') {
                Some((start, end)) => {
                    let start: u32 = start
                        .trim()
                        .parse()
                        .map_err(|_| ParseCpuSetError::InvalidRange(part.to_owned()))?;
                    let end: u32 = end
                        .trim()
                        .parse()
                        .map_err(|_| ParseCpuSetError::InvalidRange(part.to_owned()))?;
                    if start > end {
                        return Err(ParseCpuSetError::DescendingRange(part.to_owned()));
                    }
                    cores.extend(start..=end);
                }
                None => {
                    let core: u32 = part
                        .parse()
                        .map_err(|_| ParseCpuSetError::InvalidCore(part.to_owned()))?;
                    cores.insert(core);
                }
            }
        }
        Ok(Self { cores })
    }

    /// Returns the union of `self` and `other`.
    pub fn union(&self, other: &Self) -> Self {
        Self {
            cores: self.cores.union(&other.cores).copied().collect(),
        }
    }

    pub fn contains(&self, core: u32) -> bool {
        self.cores.contains(&core)
    }

    /// Number of cores in the set.
    pub fn len(&self) -> usize {
        self.cores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cores.is_empty()
    }

    /// Iterates over the cores in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.cores.iter().copied()
    }

    /// Adds a single core to the set.
    pub fn insert(&mut self, core: u32) {
        self.cores.insert(core);
    }
}

impl FromIterator<u32> for CpuSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Self {
            cores: iter.into_iter().collect(),
        }
    }
}

impl From<&[u32]> for CpuSet {
    fn from(cores: &[u32]) -> Self {
        cores.iter().copied().collect()
    }
}

impl FromStr for CpuSet {
    type Err = ParseCpuSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn render_run(start: u32, end: u32) -> String {
            if start == end {
                start.to_string()
            } else {
                format!("{start}-{end}")
            }
        }

        let mut cores = self.cores.iter().copied();
        let Some(first) = cores.next() else {
            return Ok(());
        };
        let mut runs = Vec::new();
        let mut run_start = first;
        let mut run_end = first;
        for core in cores {
            if core == run_end + 1 {
                run_end = core;
            } else {
                runs.push(render_run(run_start, run_end));
                run_start = core;
                run_end = core;
            }
        }
        runs.push(render_run(run_start, run_end));
        f.write_str(&runs.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_cores_and_ranges() {
        let set = CpuSet::parse("0-2,5,7-8").unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 1, 2, 5, 7, 8]);
    }

    #[test]
    fn empty_string_is_empty_set() {
        let set = CpuSet::parse("").unwrap();
        assert!(set.is_empty());
        assert_eq!(set.to_string(), "");
    }

    #[test]
    fn parse_accepts_unsorted_and_overlapping_input() {
        let set = CpuSet::parse("7,0-3,2").unwrap();
        assert_eq!(set.to_string(), "0-3,7");
    }

    #[test]
    fn rejects_garbage() {
        assert!(CpuSet::parse("a").is_err());
        assert!(CpuSet::parse("3-").is_err());
        assert!(CpuSet::parse("-3").is_err());
        assert!(CpuSet::parse("1,x-2").is_err());
    }

    #[test]
    fn rejects_descending_range() {
        assert!(matches!(
            CpuSet::parse("5-2"),
            Err(ParseCpuSetError::DescendingRange(_))
        ));
    }

    #[test]
    fn renders_canonically() {
        let set: CpuSet = [5, 9, 10, 11, 12, 15, 17].as_slice().into();
        assert_eq!(set.to_string(), "5,9-12,15,17");

        let pair: CpuSet = [3, 4].as_slice().into();
        assert_eq!(pair.to_string(), "3-4");

        let single: CpuSet = [3].as_slice().into();
        assert_eq!(single.to_string(), "3");
    }

    #[test]
    fn render_parse_round_trip() {
        for expr in ["0-2", "5,9-12,15,17", "22,35,62,75", "0"] {
            let set = CpuSet::parse(expr).unwrap();
            assert_eq!(CpuSet::parse(&set.to_string()).unwrap(), set);
            assert_eq!(set.to_string(), expr);
        }
    }

    #[test]
    fn union_merges_runs() {
        let a = CpuSet::parse("0-2").unwrap();
        let b = CpuSet::parse("3,5").unwrap();
        assert_eq!(a.union(&b).to_string(), "0-3,5");
    }
}
