//! End-of-run summary
//!
//! Collects the per-entity outcome flags after a bind pass: IRQs that
//! never verified against a pin target, kernel threads never grouped
//! successfully, and the correlation match counts. This is how isolated
//! per-entity failures surface without ever aborting the pass.

use crate::affinity::format_cpu_list;
use crate::correlate::Correlation;
use crate::scan::{KthreadKind, Snapshot};
use serde::Serialize;
use tracing::{debug, info};

/// An IRQ that never verified against a pin target
#[derive(Debug, Clone, Serialize)]
pub struct UnpinnedIrq {
    /// Interrupt id
    pub id: u32,
    /// Owning device bus address, when correlated
    pub device: Option<String>,
    /// Owning device driver, when known
    pub driver: Option<String>,
}

/// A kernel thread that never verified against a grouping target
#[derive(Debug, Clone, Serialize)]
pub struct UnmovedKthread {
    /// Process id
    pub pid: i32,
    /// Raw thread name
    pub name: String,
    /// CPUs the thread was last seen on
    pub cpus: String,
}

/// Outcome summary of one snapshot-correlate-bind cycle
#[derive(Debug, Serialize)]
pub struct RunSummary {
    /// IRQs discovered
    pub irqs_total: usize,
    /// IRQs with a verified pin
    pub irqs_pinned: usize,
    /// IRQ/device correlation matches
    pub device_matches: usize,
    /// IRQ/thread correlation matches
    pub thread_matches: usize,
    /// IRQs never pinned successfully
    pub unpinned_irqs: Vec<UnpinnedIrq>,
    /// Movable kernel threads never grouped successfully
    pub unmoved_kthreads: Vec<UnmovedKthread>,
}

/// Build the summary over a finished run
pub fn summarize(snapshot: &mut Snapshot, correlation: &Correlation) -> RunSummary {
    let mut unpinned = Vec::new();
    for irq in snapshot.irqs.values() {
        if irq.pinned_ok {
            continue;
        }
        let device = correlation.irq_to_device.get(&irq.id).cloned();
        let driver = device
            .as_deref()
            .and_then(|addr| snapshot.devices.get(addr))
            .map(|d| d.driver.clone());
        debug!(irq = irq.id, ?device, "untouched IRQ");
        unpinned.push(UnpinnedIrq {
            id: irq.id,
            device,
            driver,
        });
    }

    let pids: Vec<i32> = snapshot.kthreads.keys().copied().collect();
    let mut unmoved = Vec::new();
    for pid in pids {
        let Some(kt) = snapshot.kthreads.get_mut(&pid) else {
            continue;
        };
        if kt.grouped_ok || exempt_from_grouping(kt.kind, &kt.comm) {
            continue;
        }
        let cpus = kt.os_affinity().unwrap_or_default();
        debug!(pid, name = %kt.name, "untouched kernel thread");
        unmoved.push(UnmovedKthread {
            pid,
            name: kt.name.clone(),
            cpus: format_cpu_list(&cpus),
        });
    }

    let summary = RunSummary {
        irqs_total: snapshot.irqs.len(),
        irqs_pinned: snapshot.irqs.values().filter(|i| i.pinned_ok).count(),
        device_matches: correlation.device_matches(),
        thread_matches: correlation.thread_matches(),
        unpinned_irqs: unpinned,
        unmoved_kthreads: unmoved,
    };

    info!(
        irqs = summary.irqs_total,
        pinned = summary.irqs_pinned,
        device_matches = summary.device_matches,
        thread_matches = summary.thread_matches,
        unmoved_kthreads = summary.unmoved_kthreads.len(),
        "run summary"
    );

    summary
}

/// Thread kinds that legitimately stay where they are: per-CPU kernel
/// machinery, plus the per-CPU worker pools.
fn exempt_from_grouping(kind: KthreadKind, comm: &str) -> bool {
    matches!(
        kind,
        KthreadKind::Rcuc
            | KthreadKind::Cpuhp
            | KthreadKind::Ksoftirqd
            | KthreadKind::IdleInject
            | KthreadKind::Migration
            | KthreadKind::IrqWork
    ) || (kind == KthreadKind::Kworker
        && (comm.contains("mm_percpu_wq") || comm.contains("events_highpri")))
}

impl RunSummary {
    /// Human-readable dump to stdout
    pub fn print(&self) {
        println!("=== Run Summary ===");
        println!(
            "IRQs: {} discovered, {} pinned, {} matched to devices, {} matched to threads",
            self.irqs_total, self.irqs_pinned, self.device_matches, self.thread_matches
        );

        if !self.unpinned_irqs.is_empty() {
            println!("\nIRQs without a verified pin:");
            for irq in &self.unpinned_irqs {
                match (&irq.device, &irq.driver) {
                    (Some(dev), Some(drv)) if !drv.is_empty() => {
                        println!("  IRQ {:3}  (dev {}, {})", irq.id, dev, drv)
                    }
                    (Some(dev), _) => println!("  IRQ {:3}  (dev {})", irq.id, dev),
                    _ => println!("  IRQ {:3}", irq.id),
                }
            }
        }

        if !self.unmoved_kthreads.is_empty() {
            println!("\nKernel threads without a verified grouping:");
            for kt in &self.unmoved_kthreads {
                println!("  pid {:6}  {}  on CPUs {}", kt.pid, kt.name, kt.cpus);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::{Irq, KThread, Snapshot};
    use std::collections::BTreeMap;

    #[test]
    fn test_exemptions() {
        assert!(exempt_from_grouping(KthreadKind::Rcuc, ""));
        assert!(exempt_from_grouping(KthreadKind::Migration, ""));
        assert!(exempt_from_grouping(KthreadKind::Kworker, "kworker/0:0-mm_percpu_wq"));
        assert!(!exempt_from_grouping(KthreadKind::Kworker, "kworker/u8:1-events"));
        assert!(!exempt_from_grouping(KthreadKind::Irq, ""));
        assert!(!exempt_from_grouping(KthreadKind::Rcuop, ""));
    }

    #[test]
    fn test_summary_counts_flags() {
        let mut pinned = Irq::stub(1);
        pinned.pinned_ok = true;
        let unpinned = Irq::stub(2);

        let mut kt = KThread::from_listing(std::process::id() as i32, "TS", "[irq/2-x]").unwrap();
        kt.comm = "irq/2-x".to_string();

        let mut snapshot = Snapshot {
            irqs: BTreeMap::from([(1, pinned), (2, unpinned)]),
            devices: BTreeMap::new(),
            kthreads: BTreeMap::from([(kt.pid, kt)]),
        };
        let correlation = Correlation::default();

        let summary = summarize(&mut snapshot, &correlation);
        assert_eq!(summary.irqs_total, 2);
        assert_eq!(summary.irqs_pinned, 1);
        assert_eq!(summary.unpinned_irqs.len(), 1);
        assert_eq!(summary.unpinned_irqs[0].id, 2);
        assert_eq!(summary.unmoved_kthreads.len(), 1);
    }
}
