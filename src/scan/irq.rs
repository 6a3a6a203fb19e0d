//! IRQ discovery and per-IRQ kernel files
//!
//! One entity per numeric subdirectory of the kernel's per-interrupt tree.
//! The allowed and effective affinity masks come from the hex mask files;
//! the error counters from the three-line spurious file.

use super::{read_first_line, read_lines};
use crate::affinity::{format_cpu_list, parse_cpu_list, CpuMask};
use crate::error::{IoResultExt, Result, RtTuneError};
use crate::topology::{NodePreference, SysRoot};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info};

/// A hardware interrupt line
#[derive(Debug, Clone, Serialize)]
pub struct Irq {
    /// Stable interrupt id
    pub id: u32,
    allowed: Vec<usize>,
    effective: Vec<usize>,
    /// NUMA node preferred by the owning device, set by correlation
    pub preferred_node: NodePreference,
    /// Total interrupt count from the error file
    pub total_count: u64,
    /// Unhandled interrupt count
    pub unhandled_count: u64,
    /// Timestamp of the last unhandled interrupt, in ms
    pub last_unhandled_ms: u64,
    /// Set once a pin verified exactly against its target
    pub pinned_ok: bool,
}

impl Irq {
    fn dir(root: &SysRoot, id: u32) -> PathBuf {
        root.proc.join("irq").join(id.to_string())
    }

    fn empty(id: u32) -> Self {
        Self {
            id,
            allowed: Vec::new(),
            effective: Vec::new(),
            preferred_node: NodePreference::Unknown,
            total_count: 0,
            unhandled_count: 0,
            last_unhandled_ms: 0,
            pinned_ok: false,
        }
    }

    /// An entity with no kernel state behind it, for tests
    #[cfg(test)]
    pub(crate) fn stub(id: u32) -> Self {
        Self::empty(id)
    }

    fn load(root: &SysRoot, id: u32) -> Result<Self> {
        debug!(irq = id, "loading IRQ");
        let mut irq = Self::empty(id);
        irq.refresh(root)?;
        Ok(irq)
    }

    /// Re-read affinity masks and error counters from the kernel
    pub fn refresh(&mut self, root: &SysRoot) -> Result<()> {
        let dir = Self::dir(root, self.id);

        let allowed_path = dir.join("smp_affinity");
        self.allowed = CpuMask::parse_hex(&read_first_line(&allowed_path)?)?.cpus();

        let effective_path = dir.join("effective_affinity");
        self.effective = CpuMask::parse_hex(&read_first_line(&effective_path)?)?.cpus();

        let spurious_path = dir.join("spurious");
        let lines = read_lines(&spurious_path)?;
        let counters = parse_spurious(&spurious_path.display().to_string(), &lines)?;
        self.total_count = counters.0;
        self.unhandled_count = counters.1;
        self.last_unhandled_ms = counters.2;

        Ok(())
    }

    /// CPUs allowed to service this interrupt (last refresh)
    pub fn allowed_cpus(&self) -> &[usize] {
        &self.allowed
    }

    /// CPUs currently servicing this interrupt (last refresh)
    pub fn effective_cpus(&self) -> &[usize] {
        &self.effective
    }

    /// Re-read the allowed set through the range-notation list file.
    ///
    /// Used by the binder for pin verification, since the same file it
    /// writes is the one read back.
    pub fn read_allowed_list(&mut self, root: &SysRoot) -> Result<Vec<usize>> {
        let path = Self::dir(root, self.id).join("smp_affinity_list");
        let mut cpus = parse_cpu_list(&read_first_line(&path)?)?;
        cpus.sort_unstable();
        cpus.dedup();
        self.allowed = cpus.clone();
        info!(
            irq = self.id,
            cpus = %format_cpu_list(&cpus),
            "IRQ affinity read back"
        );
        Ok(cpus)
    }

    /// Write a CPU list to the affinity-control file. Callers verify and
    /// classify failures; this is the raw privileged write.
    pub(crate) fn write_affinity_list(
        &self,
        root: &SysRoot,
        cpus: &[usize],
    ) -> std::io::Result<()> {
        let path = Self::dir(root, self.id).join("smp_affinity_list");
        fs::write(path, format_cpu_list(cpus))
    }
}

impl fmt::Display for Irq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IRQ {:3} - allowed {}; effective {}",
            self.id,
            format_cpu_list(&self.allowed),
            format_cpu_list(&self.effective)
        )
    }
}

/// Enumerate the per-interrupt directory tree
pub fn discover_all(root: &SysRoot) -> Result<BTreeMap<u32, Irq>> {
    let irq_dir = root.proc.join("irq");
    let mut irqs = BTreeMap::new();

    for entry in fs::read_dir(&irq_dir).with_path(&irq_dir)? {
        let entry = entry.with_path(&irq_dir)?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(id) = name.to_string_lossy().parse::<u32>().ok() else {
            continue;
        };
        irqs.insert(id, Irq::load(root, id)?);
    }

    info!(count = irqs.len(), "IRQ discovery complete");
    Ok(irqs)
}

/// Parse the three-line error file: total, unhandled, last-unhandled-time.
fn parse_spurious(what: &str, lines: &[String]) -> Result<(u64, u64, u64)> {
    if lines.len() < 3 {
        return Err(RtTuneError::malformed(
            what,
            format!("expected 3 counter lines, got {}", lines.len()),
        ));
    }

    let field = |line: &String| -> Result<u64> {
        line.split_whitespace()
            .nth(1)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                RtTuneError::malformed(what, format!("bad counter line '{}'", line.trim()))
            })
    };

    Ok((field(&lines[0])?, field(&lines[1])?, field(&lines[2])?))
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::path::Path;

    pub(crate) fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    pub(crate) fn fake_irq(root: &SysRoot, id: u32, mask_hex: &str, list: &str) {
        let dir = root.proc.join("irq").join(id.to_string());
        write(&dir.join("smp_affinity"), &format!("{mask_hex}\n"));
        write(&dir.join("effective_affinity"), &format!("{mask_hex}\n"));
        write(&dir.join("smp_affinity_list"), &format!("{list}\n"));
        write(
            &dir.join("spurious"),
            "count 120\nunhandled 3\nlast_unhandled 4294672344 ms\n",
        );
    }
}
