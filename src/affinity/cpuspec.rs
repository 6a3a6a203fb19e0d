//! Named CPU-set specification

use super::{codec, CpuMask};
use crate::error::Result;
use serde::Serialize;
use std::fmt;

/// A named CPU set with its equivalent bitmask and optional memory nodes.
///
/// Constructed from exactly one of an explicit list, a range-notation
/// string, or a bitmask; always normalized to a sorted-unique list plus the
/// derived mask, so the encodings cannot drift apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CpuSpec {
    /// Set name, used as the cpuset group name by the binder
    pub name: String,
    cpus: Vec<usize>,
    mask: CpuMask,
    /// Memory nodes the set may allocate from
    pub mems: Option<Vec<usize>>,
    /// Excluded from interrupt balancing
    pub no_irq_balancing: bool,
}

impl CpuSpec {
    /// Build from an explicit CPU id list
    pub fn from_list(name: impl Into<String>, cpus: Vec<usize>) -> Self {
        let mut cpus = cpus;
        cpus.sort_unstable();
        cpus.dedup();
        let mask = CpuMask::from_cpus(cpus.iter().copied());
        Self {
            name: name.into(),
            cpus,
            mask,
            mems: None,
            no_irq_balancing: false,
        }
    }

    /// Build from kernel range notation
    pub fn from_range_str(name: impl Into<String>, spec: &str) -> Result<Self> {
        Ok(Self::from_list(name, codec::parse_cpu_list(spec)?))
    }

    /// Build from a bitmask
    pub fn from_mask(name: impl Into<String>, mask: CpuMask) -> Self {
        let cpus = mask.cpus();
        Self {
            name: name.into(),
            cpus,
            mask,
            mems: None,
            no_irq_balancing: false,
        }
    }

    /// Attach memory nodes
    pub fn with_mems(mut self, mems: Vec<usize>) -> Self {
        let mut mems = mems;
        mems.sort_unstable();
        mems.dedup();
        self.mems = Some(mems);
        self
    }

    /// Flag the set as excluded from interrupt balancing
    pub fn with_no_irq_balancing(mut self, flag: bool) -> Self {
        self.no_irq_balancing = flag;
        self
    }

    /// The sorted-unique CPU id list
    pub fn cpus(&self) -> &[usize] {
        &self.cpus
    }

    /// The equivalent bitmask
    pub fn mask(&self) -> &CpuMask {
        &self.mask
    }

    /// Number of CPUs in the set
    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    /// True for the empty set
    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    /// Membership test
    pub fn contains(&self, cpu: usize) -> bool {
        self.mask.contains(cpu)
    }

    /// Kernel range notation for this set
    pub fn to_range_notation(&self) -> String {
        codec::format_cpu_list(&self.cpus)
    }

    /// Memory-node list in range notation, if any
    pub fn mems_range_notation(&self) -> Option<String> {
        self.mems.as_ref().map(|m| codec::format_cpu_list(m))
    }
}

impl fmt::Display for CpuSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.name, self.to_range_notation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_list_normalizes() {
        let spec = CpuSpec::from_list("rt", vec![5, 1, 3, 1]);
        assert_eq!(spec.cpus(), &[1, 3, 5]);
        assert_eq!(spec.mask(), &CpuMask::from(0b101010));
        assert_eq!(spec.to_range_notation(), "1,3,5");
    }

    #[test]
    fn test_three_constructions_agree() {
        let a = CpuSpec::from_list("x", vec![0, 1, 2, 5]);
        let b = CpuSpec::from_range_str("x", "0-2,5").unwrap();
        let c = CpuSpec::from_mask("x", CpuMask::from(0b100111));
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn test_empty_spec() {
        let spec = CpuSpec::from_range_str("none", "").unwrap();
        assert!(spec.is_empty());
        assert_eq!(spec.to_range_notation(), "");
        assert!(spec.mask().is_zero());
    }

    #[test]
    fn test_mems_notation() {
        let spec = CpuSpec::from_list("rcu", vec![10, 29]).with_mems(vec![1, 0]);
        assert_eq!(spec.mems_range_notation().as_deref(), Some("0-1"));
        assert_eq!(spec.to_range_notation(), "10,29");
    }

    #[test]
    fn test_display() {
        let spec = CpuSpec::from_list("o_work", vec![6]);
        assert_eq!(spec.to_string(), "(o_work, 6)");
    }
}
