//! Cross-referencing of IRQs, PCI devices and kernel threads
//!
//! Entities stay in their flat collections; the relations live here as
//! lookup maps keyed by the stable identifiers, so nothing holds a mutual
//! owning reference. Correlation runs after discovery completes and before
//! any bind operation.

use crate::error::{Result, RtTuneError};
use crate::scan::{KThread, PciDevice, Snapshot};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Relation maps produced by one correlation pass
#[derive(Debug, Default, Serialize)]
pub struct Correlation {
    /// IRQ id → owning device bus address
    pub irq_to_device: BTreeMap<u32, String>,
    /// IRQ id → servicing kernel thread pid
    pub irq_to_thread: BTreeMap<u32, i32>,
    /// Kernel thread pid → serviced IRQ id
    pub thread_to_irq: BTreeMap<i32, u32>,
}

impl Correlation {
    /// Number of IRQ/device matches
    pub fn device_matches(&self) -> usize {
        self.irq_to_device.len()
    }

    /// Number of IRQ/thread matches
    pub fn thread_matches(&self) -> usize {
        self.irq_to_thread.len()
    }
}

/// Build all cross-references over one discovery snapshot.
///
/// Sets each matched IRQ's preferred NUMA node from its owning device.
/// Match counts are informational; zero matches does not fail the run.
pub fn correlate(snapshot: &mut Snapshot) -> Correlation {
    let mut correlation = Correlation::default();
    match_irqs_and_devices(snapshot, &mut correlation);
    match_irqs_and_threads(snapshot, &mut correlation);
    correlation
}

/// Reverse-map every device's interrupt numbers onto IRQ entities.
///
/// Two devices can claim the same number: a leaf and an upstream switch
/// sharing a legacy line, or primary/auxiliary functions in one slot. The
/// device with the greater bus address wins; a heuristic carried over from
/// observed hardware, not proven for every topology.
fn match_irqs_and_devices(snapshot: &mut Snapshot, correlation: &mut Correlation) {
    let mut claims: BTreeMap<u32, &PciDevice> = BTreeMap::new();

    for dev in snapshot.devices.values() {
        for &irq in &dev.irqs {
            match claims.get(&irq) {
                Some(prev) if prev.addr >= dev.addr => {}
                _ => {
                    claims.insert(irq, dev);
                }
            }
        }
    }

    for (irq_id, dev) in &claims {
        if let Some(irq) = snapshot.irqs.get_mut(irq_id) {
            debug!(irq = irq_id, device = %dev.addr, node = ?dev.node, "IRQ owner resolved");
            irq.preferred_node = dev.node;
            correlation
                .irq_to_device
                .insert(*irq_id, dev.addr.clone());
        }
    }

    info!(
        matches = correlation.device_matches(),
        "matched IRQs to PCI devices"
    );
}

/// Reverse-map each thread's parsed interrupt number onto IRQ entities
fn match_irqs_and_threads(snapshot: &mut Snapshot, correlation: &mut Correlation) {
    let mut by_irq: BTreeMap<u32, i32> = BTreeMap::new();
    for kt in snapshot.kthreads.values() {
        if let Some(irq) = kt.irq {
            by_irq.insert(irq, kt.pid);
        }
    }

    for (irq_id, pid) in &by_irq {
        if snapshot.irqs.contains_key(irq_id) {
            correlation.irq_to_thread.insert(*irq_id, *pid);
            correlation.thread_to_irq.insert(*pid, *irq_id);
        }
    }

    info!(
        matches = correlation.thread_matches(),
        "matched IRQ/kthread pairs"
    );
}

/// The correlated triple of one interrupt, its servicing kernel thread,
/// and its owning device.
///
/// Constructible only when the three already reference each other through
/// the correlation maps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceBundle {
    /// Interrupt id
    pub irq: u32,
    /// Servicing kernel thread pid
    pub pid: i32,
    /// Owning device bus address
    pub device: String,
}

impl DeviceBundle {
    /// Assemble the bundle for one IRQ, failing unless both relations exist
    pub fn assemble(irq: u32, correlation: &Correlation) -> Result<Self> {
        let device = correlation.irq_to_device.get(&irq).ok_or_else(|| {
            RtTuneError::ConstraintViolation(format!("IRQ {irq} has no owning PCI device"))
        })?;
        let pid = correlation.irq_to_thread.get(&irq).ok_or_else(|| {
            RtTuneError::ConstraintViolation(format!("IRQ {irq} has no servicing kernel thread"))
        })?;

        Ok(Self {
            irq,
            pid: *pid,
            device: device.clone(),
        })
    }
}

/// Bundles whose owning device uses the given kernel driver, in bus
/// address order. IRQs missing a thread correlation are skipped.
pub fn bundles_for_driver(
    snapshot: &Snapshot,
    correlation: &Correlation,
    driver: &str,
) -> Vec<DeviceBundle> {
    let mut out: Vec<DeviceBundle> = correlation
        .irq_to_device
        .iter()
        .filter(|(_, addr)| {
            snapshot
                .devices
                .get(*addr)
                .map(|d| d.driver == driver)
                .unwrap_or(false)
        })
        .filter_map(|(irq, _)| DeviceBundle::assemble(*irq, correlation).ok())
        .collect();
    out.sort_by(|a, b| a.device.cmp(&b.device).then(a.irq.cmp(&b.irq)));
    out
}

/// IRQ ids whose owning device backs an interface with the given name
/// prefix
pub fn irqs_for_interface(
    snapshot: &Snapshot,
    correlation: &Correlation,
    prefix: &str,
) -> Vec<u32> {
    correlation
        .irq_to_device
        .iter()
        .filter(|(_, addr)| {
            snapshot
                .devices
                .get(*addr)
                .and_then(|d| d.net_iface.as_deref())
                .map(|iface| iface.starts_with(prefix))
                .unwrap_or(false)
        })
        .map(|(irq, _)| *irq)
        .collect()
}

/// Kernel threads whose raw name contains the given substring
pub fn kthreads_matching<'a>(snapshot: &'a Snapshot, substring: &str) -> Vec<&'a KThread> {
    snapshot
        .kthreads
        .values()
        .filter(|kt| kt.name.contains(substring))
        .collect()
}
