//! Process-wide system topology
//!
//! One immutable [`Topology`] value is built at startup from the kernel's
//! node tree and boot command line, then passed explicitly into every
//! component that needs the CPU count or the NUMA partition. Nothing reads
//! these from ambient global state.

use crate::affinity::{format_cpu_list, parse_cpu_list};
use crate::error::{IoResultExt, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Roots of the kernel's text interfaces.
///
/// Defaults to the live `/proc` and `/sys`; tests point it at synthetic
/// trees.
#[derive(Debug, Clone)]
pub struct SysRoot {
    /// procfs mount point
    pub proc: PathBuf,
    /// sysfs mount point
    pub sys: PathBuf,
}

impl Default for SysRoot {
    fn default() -> Self {
        Self {
            proc: PathBuf::from("/proc"),
            sys: PathBuf::from("/sys"),
        }
    }
}

impl SysRoot {
    /// Roots rebased under a single directory, for synthetic trees
    pub fn rebased(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self {
            proc: base.join("proc"),
            sys: base.join("sys"),
        }
    }
}

/// NUMA placement of a CPU set, classified against the node partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodePreference {
    /// Exactly one node's CPU set
    Node(usize),
    /// Equals the full CPU set of the machine
    SpansAll,
    /// Matches neither the full set nor any single node
    Unknown,
}

impl NodePreference {
    /// The concrete node index, if any
    pub fn node(&self) -> Option<usize> {
        match self {
            NodePreference::Node(n) => Some(*n),
            _ => None,
        }
    }
}

/// Immutable snapshot of the machine's CPU and NUMA layout
#[derive(Debug, Clone, Serialize)]
pub struct Topology {
    cpu_count: usize,
    all_cpus: Vec<usize>,
    nodes: Vec<Vec<usize>>,
    isolated: Vec<usize>,
}

impl Topology {
    /// Read the node partition and boot-isolated CPUs from the kernel
    pub fn discover(root: &SysRoot) -> Result<Self> {
        let node_dir = root.sys.join("devices/system/node");
        let mut nodes: Vec<(usize, Vec<usize>)> = Vec::new();

        if let Ok(entries) = fs::read_dir(&node_dir) {
            for entry in entries.filter_map(|e| e.ok()) {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                let Some(id) = name.strip_prefix("node").and_then(|s| s.parse::<usize>().ok())
                else {
                    continue;
                };

                let cpulist_path = entry.path().join("cpulist");
                let content = fs::read_to_string(&cpulist_path).with_path(&cpulist_path)?;
                let mut cpus = parse_cpu_list(content.trim())?;
                cpus.sort_unstable();
                nodes.push((id, cpus));
            }
        }

        nodes.sort_by_key(|(id, _)| *id);
        let mut nodes: Vec<Vec<usize>> = nodes.into_iter().map(|(_, cpus)| cpus).collect();

        // Machines without an exposed node tree get one node over all CPUs.
        if nodes.is_empty() {
            nodes.push((0..num_cpus::get()).collect());
        }

        let isolated = read_isolated_cpus(&root.proc)?;
        Ok(Self::assemble(nodes, isolated))
    }

    /// Build from explicit parts (tests, or pre-read partitions)
    pub fn from_parts(nodes: Vec<Vec<usize>>, isolated: Vec<usize>) -> Self {
        Self::assemble(nodes, isolated)
    }

    fn assemble(nodes: Vec<Vec<usize>>, isolated: Vec<usize>) -> Self {
        let mut all: BTreeSet<usize> = BTreeSet::new();
        for node in &nodes {
            all.extend(node.iter().copied());
        }
        let all_cpus: Vec<usize> = all.into_iter().collect();

        let mut isolated = isolated;
        isolated.sort_unstable();
        isolated.dedup();

        debug!(
            cpus = all_cpus.len(),
            nodes = nodes.len(),
            isolated = %format_cpu_list(&isolated),
            "topology assembled"
        );

        Self {
            cpu_count: all_cpus.len(),
            all_cpus,
            nodes,
            isolated,
        }
    }

    /// Number of online CPUs
    pub fn cpu_count(&self) -> usize {
        self.cpu_count
    }

    /// All CPU ids, ascending
    pub fn all_cpus(&self) -> &[usize] {
        &self.all_cpus
    }

    /// Number of NUMA nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// CPU ids of one node
    pub fn node_cpus(&self, node: usize) -> Option<&[usize]> {
        self.nodes.get(node).map(|v| v.as_slice())
    }

    /// CPUs reserved on the boot command line (`isolcpus=`)
    pub fn isolated_cpus(&self) -> &[usize] {
        &self.isolated
    }

    /// The housekeeping complement of the isolated CPUs
    pub fn system_cpus(&self) -> Vec<usize> {
        let isolated: BTreeSet<usize> = self.isolated.iter().copied().collect();
        self.all_cpus
            .iter()
            .copied()
            .filter(|c| !isolated.contains(c))
            .collect()
    }

    /// Classify a CPU set against the node partition.
    ///
    /// Exact equality only. A set matching the full machine is `SpansAll`;
    /// anything matching no single node exactly is `Unknown` (logged), never
    /// a guess.
    pub fn classify_cpus(&self, cpus: &BTreeSet<usize>) -> NodePreference {
        let all: BTreeSet<usize> = self.all_cpus.iter().copied().collect();
        if *cpus == all {
            return NodePreference::SpansAll;
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            let node_set: BTreeSet<usize> = node.iter().copied().collect();
            if *cpus == node_set {
                return NodePreference::Node(idx);
            }
        }
        warn!(
            cpus = %format_cpu_list(&cpus.iter().copied().collect::<Vec<_>>()),
            "CPU set matches no NUMA node exactly"
        );
        NodePreference::Unknown
    }

    /// True when the target list fits inside the preferred node.
    ///
    /// `SpansAll` accepts anything; `Unknown` accepts nothing.
    pub fn within_node(&self, pref: NodePreference, cpus: &[usize]) -> bool {
        match pref {
            NodePreference::SpansAll => true,
            NodePreference::Unknown => false,
            NodePreference::Node(n) => match self.node_cpus(n) {
                Some(node) => {
                    let node: BTreeSet<usize> = node.iter().copied().collect();
                    cpus.iter().all(|c| node.contains(c))
                }
                None => false,
            },
        }
    }
}

/// Parse `isolcpus=` out of the boot command line.
///
/// Flag prefixes (e.g. `managed_irq,domain,2-5`) are tolerated by keeping
/// only the tokens that look like ids or ranges, same as the fixed-pattern
/// assumption everywhere else.
fn read_isolated_cpus(proc_root: &Path) -> Result<Vec<usize>> {
    let path = proc_root.join("cmdline");
    let cmdline = fs::read_to_string(&path).with_path(&path)?;

    for token in cmdline.split_whitespace() {
        if let Some(value) = token.strip_prefix("isolcpus=") {
            let numeric: Vec<&str> = value.split(',').filter(|t| is_range_token(t)).collect();
            return parse_cpu_list(&numeric.join(","));
        }
    }

    Ok(Vec::new())
}

fn is_range_token(token: &str) -> bool {
    !token.is_empty()
        && token.split('-').count() <= 2
        && token
            .split('-')
            .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn two_node_topology() -> Topology {
        Topology::from_parts(vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7]], vec![])
    }

    #[test]
    fn test_discover_from_synthetic_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = SysRoot::rebased(dir.path());
        write(&root.sys.join("devices/system/node/node0/cpulist"), "0-3\n");
        write(&root.sys.join("devices/system/node/node1/cpulist"), "4-7\n");
        write(
            &root.proc.join("cmdline"),
            "BOOT_IMAGE=/vmlinuz root=/dev/sda1 isolcpus=2-5 quiet\n",
        );

        let topo = Topology::discover(&root).unwrap();
        assert_eq!(topo.cpu_count(), 8);
        assert_eq!(topo.node_count(), 2);
        assert_eq!(topo.node_cpus(1).unwrap(), &[4, 5, 6, 7]);
        assert_eq!(topo.isolated_cpus(), &[2, 3, 4, 5]);
        assert_eq!(topo.system_cpus(), vec![0, 1, 6, 7]);
    }

    #[test]
    fn test_isolcpus_with_flag_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let root = SysRoot::rebased(dir.path());
        write(&root.sys.join("devices/system/node/node0/cpulist"), "0-7\n");
        write(
            &root.proc.join("cmdline"),
            "isolcpus=managed_irq,domain,6-7\n",
        );

        let topo = Topology::discover(&root).unwrap();
        assert_eq!(topo.isolated_cpus(), &[6, 7]);
    }

    #[test]
    fn test_classify_exact_node() {
        let topo = two_node_topology();
        let set: BTreeSet<usize> = [4, 5, 6, 7].into_iter().collect();
        assert_eq!(topo.classify_cpus(&set), NodePreference::Node(1));
    }

    #[test]
    fn test_classify_full_machine() {
        let topo = two_node_topology();
        let set: BTreeSet<usize> = (0..8).collect();
        assert_eq!(topo.classify_cpus(&set), NodePreference::SpansAll);
    }

    #[test]
    fn test_classify_no_match_is_unknown() {
        let topo = two_node_topology();
        let set: BTreeSet<usize> = [0, 1].into_iter().collect();
        assert_eq!(topo.classify_cpus(&set), NodePreference::Unknown);
    }

    #[test]
    fn test_within_node() {
        let topo = two_node_topology();
        assert!(topo.within_node(NodePreference::Node(0), &[1, 2]));
        assert!(!topo.within_node(NodePreference::Node(0), &[1, 2, 9]));
        assert!(topo.within_node(NodePreference::SpansAll, &[7]));
        assert!(!topo.within_node(NodePreference::Unknown, &[0]));
    }
}
