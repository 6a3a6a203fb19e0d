//! Topology discovery
//!
//! Snapshots IRQ ids, PCI devices, and kernel threads from the kernel's
//! text interfaces. Discovery is the first phase of every run and must
//! complete before correlation; malformed kernel text aborts the whole
//! pass, since a partial topology is unsafe to bind against.

pub mod host;
pub mod interrupts;
pub mod irq;
pub mod kthread;
pub mod pci;

pub use host::{HostInventory, ShellInventory};
pub use interrupts::{read_interrupts, InterruptSnapshot};
pub use irq::Irq;
pub use kthread::{KThread, KthreadKind, SchedClass};
pub use pci::{IrqMechanism, PciDevice};

use crate::error::{IoResultExt, Result};
use crate::topology::{SysRoot, Topology};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

/// One discovery pass over the machine.
///
/// Entities live in flat collections keyed by their stable identifiers;
/// relations between them are built afterwards by the correlation engine as
/// separate lookup maps.
#[derive(Debug, Serialize)]
pub struct Snapshot {
    /// IRQs keyed by id
    pub irqs: BTreeMap<u32, Irq>,
    /// PCI devices keyed by canonical bus address
    pub devices: BTreeMap<String, PciDevice>,
    /// Kernel threads keyed by pid
    pub kthreads: BTreeMap<i32, KThread>,
}

/// Run a full discovery pass
pub fn scan(root: &SysRoot, topo: &Topology, inv: &dyn HostInventory) -> Result<Snapshot> {
    let irqs = irq::discover_all(root)?;
    let devices = pci::discover_devices(root, topo, inv)?;
    let kthreads = kthread::discover_all(root, inv)?;

    info!(
        irqs = irqs.len(),
        devices = devices.len(),
        kthreads = kthreads.len(),
        "discovery pass complete"
    );

    Ok(Snapshot {
        irqs,
        devices,
        kthreads,
    })
}

pub(crate) fn read_first_line(path: &Path) -> Result<String> {
    let content = fs::read_to_string(path).with_path(path)?;
    Ok(content.lines().next().unwrap_or("").trim_end().to_string())
}

pub(crate) fn read_lines(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path).with_path(path)?;
    Ok(content.lines().map(|l| l.trim_end().to_string()).collect())
}
