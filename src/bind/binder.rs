//! The pin / verify / record protocol
//!
//! Every bind writes a target, reads the result back, and compares as an
//! unordered set; the success flag on the entity is set only on exact
//! match. Verification mismatches are recorded and reported, never raised,
//! so one bad device or thread cannot abort a whole tuning pass.

use super::privilege::ElevatedContext;
use super::tools::{set_os_affinity, ChrtTool, CsetTool, ROOT_SET};
use crate::affinity::{format_cpu_list, CpuSpec};
use crate::correlate::DeviceBundle;
use crate::error::{is_transient_write_race, Result, RtTuneError};
use crate::scan::{Irq, KThread, Snapshot};
use crate::topology::{NodePreference, SysRoot, Topology};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, warn};

/// Applies affinity and policy changes to correlated entities
pub struct AffinityBinder<'a> {
    root: &'a SysRoot,
    topo: &'a Topology,
    cset: CsetTool,
    chrt: ChrtTool,
}

impl<'a> AffinityBinder<'a> {
    /// A binder over one machine's kernel surfaces
    pub fn new(root: &'a SysRoot, topo: &'a Topology) -> Self {
        Self {
            root,
            topo,
            cset: CsetTool,
            chrt: ChrtTool,
        }
    }

    /// Pin one IRQ to a target CPU list and verify the result.
    ///
    /// A target outside the IRQ's preferred NUMA node is intersected with
    /// the node when relaxation is allowed (possibly down to the empty
    /// set), otherwise written as-is with a logged policy violation. A
    /// write hitting a vanished kernel object is logged and swallowed.
    /// Returns the affinity observed after the write.
    pub fn pin_irq(
        &self,
        _ctx: ElevatedContext,
        irq: &mut Irq,
        target: &[usize],
        relax_to_node: bool,
    ) -> Result<Vec<usize>> {
        if target.is_empty() {
            return Err(RtTuneError::ConstraintViolation(format!(
                "empty pin target for IRQ {}",
                irq.id
            )));
        }

        let mut effective: Vec<usize> = target.to_vec();
        effective.sort_unstable();
        effective.dedup();

        if let NodePreference::Node(node) = irq.preferred_node {
            if !self.topo.within_node(irq.preferred_node, &effective) {
                if relax_to_node {
                    let node_cpus: BTreeSet<usize> = self
                        .topo
                        .node_cpus(node)
                        .unwrap_or(&[])
                        .iter()
                        .copied()
                        .collect();
                    effective.retain(|c| node_cpus.contains(c));
                    debug!(
                        irq = irq.id,
                        node,
                        target = %format_cpu_list(&effective),
                        "target relaxed onto preferred NUMA node"
                    );
                } else {
                    error!(
                        irq = irq.id,
                        node,
                        target = %format_cpu_list(&effective),
                        "pinning IRQ off its preferred NUMA node"
                    );
                }
            }
        }

        info!(
            irq = irq.id,
            target = %format_cpu_list(&effective),
            "pinning IRQ"
        );

        match irq.write_affinity_list(self.root, &effective) {
            Ok(()) => {}
            Err(e) if is_transient_write_race(&e) => {
                debug!(
                    irq = irq.id,
                    error = %e,
                    "IRQ vanished during affinity write"
                );
            }
            Err(e) => {
                let path = self
                    .root
                    .proc
                    .join(format!("irq/{}/smp_affinity_list", irq.id));
                return Err(RtTuneError::io(path, e));
            }
        }

        let observed = irq.read_allowed_list(self.root)?;
        let observed_set: BTreeSet<usize> = observed.iter().copied().collect();
        let target_set: BTreeSet<usize> = effective.iter().copied().collect();
        if observed_set == target_set {
            irq.pinned_ok = true;
        } else {
            error!(
                irq = irq.id,
                wanted = %format_cpu_list(&effective),
                got = %format_cpu_list(&observed),
                "IRQ affinity verification mismatch"
            );
        }

        Ok(observed)
    }

    /// Pin one kernel thread into a named CPU-set group and verify.
    ///
    /// The thread is first force-released into the root group, given its
    /// OS-level affinity directly, then force-assigned into the target
    /// group. Verification mismatches are logged, never raised.
    pub fn pin_kthread(
        &self,
        ctx: ElevatedContext,
        kt: &mut KThread,
        spec: &CpuSpec,
    ) -> Result<()> {
        info!(pid = kt.pid, name = %kt.name, set = %spec.name, "pinning kernel thread");

        self.cset.move_thread(ctx, kt.pid, ROOT_SET)?;
        set_os_affinity(ctx, kt.pid, spec.cpus())?;
        self.cset.move_thread(ctx, kt.pid, &spec.name)?;

        let observed = kt.os_affinity()?;
        let observed_set: BTreeSet<usize> = observed.iter().copied().collect();
        let target_set: BTreeSet<usize> = spec.cpus().iter().copied().collect();
        if observed_set == target_set {
            kt.grouped_ok = true;
        } else {
            error!(
                pid = kt.pid,
                name = %kt.name,
                wanted = %spec.to_range_notation(),
                got = %format_cpu_list(&observed),
                "kernel thread affinity verification mismatch"
            );
        }

        Ok(())
    }

    /// Bind a correlated bundle onto a single-CPU set, optionally with a
    /// fixed fifo priority.
    ///
    /// Fails before touching any kernel object when the target names more
    /// than one CPU or a CPU outside the device's preferred node. Both the
    /// IRQ and the thread must report exactly that CPU afterwards; that
    /// postcondition is not recoverable.
    pub fn bind_bundle(
        &self,
        ctx: ElevatedContext,
        bundle: &DeviceBundle,
        snapshot: &mut Snapshot,
        spec: &CpuSpec,
        priority: Option<u32>,
    ) -> Result<()> {
        if spec.len() != 1 {
            return Err(RtTuneError::ConstraintViolation(format!(
                "bundle for IRQ {} needs a single-CPU set, got '{}'",
                bundle.irq,
                spec.to_range_notation()
            )));
        }
        let cpu = spec.cpus()[0];

        info!(
            irq = bundle.irq,
            pid = bundle.pid,
            device = %bundle.device,
            cpu,
            "binding device bundle"
        );

        {
            let irq = snapshot.irqs.get_mut(&bundle.irq).ok_or_else(|| {
                RtTuneError::ConstraintViolation(format!("IRQ {} not in snapshot", bundle.irq))
            })?;
            match irq.preferred_node {
                NodePreference::SpansAll => {}
                NodePreference::Unknown => {
                    return Err(RtTuneError::ConstraintViolation(format!(
                        "IRQ {} has no known NUMA node; refusing bundle bind",
                        bundle.irq
                    )));
                }
                pref @ NodePreference::Node(_) => {
                    if !self.topo.within_node(pref, &[cpu]) {
                        return Err(RtTuneError::ConstraintViolation(format!(
                            "CPU {cpu} is outside the preferred NUMA node of IRQ {}",
                            bundle.irq
                        )));
                    }
                }
            }
            self.pin_irq(ctx, irq, &[cpu], false)?;
        }

        {
            let kt = snapshot.kthreads.get_mut(&bundle.pid).ok_or_else(|| {
                RtTuneError::ConstraintViolation(format!(
                    "kernel thread {} not in snapshot",
                    bundle.pid
                ))
            })?;
            self.pin_kthread(ctx, kt, spec)?;
            if let Some(priority) = priority {
                self.chrt.set_fifo(ctx, kt.pid, priority)?;
            }
        }

        let irq = snapshot.irqs.get_mut(&bundle.irq).ok_or_else(|| {
            RtTuneError::ConstraintViolation(format!("IRQ {} not in snapshot", bundle.irq))
        })?;
        let irq_cpus = irq.read_allowed_list(self.root)?;
        assert!(
            irq_cpus == [cpu],
            "bundle postcondition failed: IRQ {} reports CPUs {:?}, wanted [{cpu}]",
            bundle.irq,
            irq_cpus
        );

        let kt = snapshot.kthreads.get_mut(&bundle.pid).ok_or_else(|| {
            RtTuneError::ConstraintViolation(format!(
                "kernel thread {} not in snapshot",
                bundle.pid
            ))
        })?;
        let kt_cpus = kt.os_affinity()?;
        assert!(
            kt_cpus == [cpu],
            "bundle postcondition failed: thread {} reports CPUs {:?}, wanted [{cpu}]",
            bundle.pid,
            kt_cpus
        );

        Ok(())
    }

    /// Set a fixed-priority fifo policy on a thread
    pub fn set_fifo(&self, ctx: ElevatedContext, kt: &KThread, priority: u32) -> Result<()> {
        self.chrt.set_fifo(ctx, kt.pid, priority)
    }

    /// Reset a thread to the default time-shared policy
    pub fn reset_policy(&self, ctx: ElevatedContext, kt: &KThread) -> Result<()> {
        self.chrt.reset_time_shared(ctx, kt.pid)
    }

    /// Park every IRQ onto the housekeeping CPU set, NUMA-relaxed.
    ///
    /// Per-IRQ failures are isolated; returns how many IRQs verified.
    pub fn park_irqs(
        &self,
        ctx: ElevatedContext,
        irqs: &mut BTreeMap<u32, Irq>,
        spec: &CpuSpec,
    ) -> usize {
        info!(
            count = irqs.len(),
            cpus = %spec.to_range_notation(),
            "parking IRQs onto housekeeping CPUs"
        );

        let mut verified = 0;
        for irq in irqs.values_mut() {
            match self.pin_irq(ctx, irq, spec.cpus(), true) {
                Ok(_) => {
                    if irq.pinned_ok {
                        verified += 1;
                    }
                }
                Err(e) => warn!(irq = irq.id, error = %e, "IRQ parking failed"),
            }
        }
        verified
    }

    /// Recreate the layout's named CPU sets: destroy leftovers from a
    /// previous run, then create each set fresh.
    pub fn rebuild_cpusets(&self, ctx: ElevatedContext, specs: &[CpuSpec]) -> Result<()> {
        for spec in specs {
            if let Err(e) = self.cset.destroy_set(ctx, &spec.name) {
                debug!(set = %spec.name, error = %e, "no previous cpuset to destroy");
            }
            self.cset.create_set(ctx, spec)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bind::privilege::ElevatedContext;
    use crate::scan::irq::testutil::fake_irq;
    use crate::scan::irq;

    fn two_node_topology() -> Topology {
        Topology::from_parts(vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7]], vec![])
    }

    fn setup(
        dir: &tempfile::TempDir,
    ) -> (SysRoot, Topology, ElevatedContext) {
        let root = SysRoot::rebased(dir.path());
        (root, two_node_topology(), ElevatedContext::assume_for_tests())
    }

    #[test]
    fn test_pin_verifies_and_flags() {
        let dir = tempfile::tempdir().unwrap();
        let (root, topo, ctx) = setup(&dir);
        fake_irq(&root, 42, "f", "0-3");
        let mut irqs = irq::discover_all(&root).unwrap();
        let irq = irqs.get_mut(&42).unwrap();

        let binder = AffinityBinder::new(&root, &topo);
        let observed = binder.pin_irq(ctx, irq, &[2, 1], false).unwrap();
        assert_eq!(observed, vec![1, 2]);
        assert!(irq.pinned_ok);
    }

    #[test]
    fn test_pin_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (root, topo, ctx) = setup(&dir);
        fake_irq(&root, 42, "f", "0-3");
        let mut irqs = irq::discover_all(&root).unwrap();
        let irq = irqs.get_mut(&42).unwrap();

        let binder = AffinityBinder::new(&root, &topo);
        let first = binder.pin_irq(ctx, irq, &[1, 2], false).unwrap();
        let flag_first = irq.pinned_ok;
        let second = binder.pin_irq(ctx, irq, &[1, 2], false).unwrap();

        assert_eq!(first, second);
        assert_eq!(flag_first, irq.pinned_ok);
    }

    #[test]
    fn test_numa_relaxation_intersects_target() {
        let dir = tempfile::tempdir().unwrap();
        let (root, topo, ctx) = setup(&dir);
        fake_irq(&root, 42, "f", "0-3");
        let mut irqs = irq::discover_all(&root).unwrap();
        let irq = irqs.get_mut(&42).unwrap();
        irq.preferred_node = NodePreference::Node(0);

        let binder = AffinityBinder::new(&root, &topo);
        let observed = binder.pin_irq(ctx, irq, &[1, 2, 9], true).unwrap();
        assert_eq!(observed, vec![1, 2]);
        assert!(irq.pinned_ok);
    }

    #[test]
    fn test_numa_violation_without_relaxation_keeps_target() {
        let dir = tempfile::tempdir().unwrap();
        let (root, topo, ctx) = setup(&dir);
        fake_irq(&root, 42, "f", "0-3");
        let mut irqs = irq::discover_all(&root).unwrap();
        let irq = irqs.get_mut(&42).unwrap();
        irq.preferred_node = NodePreference::Node(0);

        let binder = AffinityBinder::new(&root, &topo);
        let observed = binder.pin_irq(ctx, irq, &[1, 2, 9], false).unwrap();
        assert_eq!(observed, vec![1, 2, 9]);
    }

    #[test]
    fn test_empty_target_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (root, topo, ctx) = setup(&dir);
        fake_irq(&root, 42, "f", "0-3");
        let mut irqs = irq::discover_all(&root).unwrap();
        let irq = irqs.get_mut(&42).unwrap();

        let binder = AffinityBinder::new(&root, &topo);
        assert!(matches!(
            binder.pin_irq(ctx, irq, &[], false),
            Err(RtTuneError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn test_vanished_irq_write_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let (root, topo, ctx) = setup(&dir);
        fake_irq(&root, 42, "f", "0-3");
        let mut irqs = irq::discover_all(&root).unwrap();
        let irq = irqs.get_mut(&42).unwrap();

        // The IRQ directory disappears between discovery and the write.
        std::fs::remove_dir_all(root.proc.join("irq/42")).unwrap();

        let binder = AffinityBinder::new(&root, &topo);
        // The write race is swallowed; the verification read then fails
        // with plain I/O, which propagates.
        assert!(matches!(
            binder.pin_irq(ctx, irq, &[1], false),
            Err(RtTuneError::Io { .. })
        ));
        assert!(!irq.pinned_ok);
    }

    #[test]
    fn test_bundle_rejects_multi_cpu_target_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let (root, topo, ctx) = setup(&dir);
        fake_irq(&root, 42, "f", "0-3");
        let before =
            std::fs::read_to_string(root.proc.join("irq/42/smp_affinity_list")).unwrap();

        let mut snapshot = Snapshot {
            irqs: irq::discover_all(&root).unwrap(),
            devices: BTreeMap::new(),
            kthreads: BTreeMap::new(),
        };
        let bundle = DeviceBundle {
            irq: 42,
            pid: 1500,
            device: "0000:01:00.0".to_string(),
        };
        let spec = CpuSpec::from_list("bad", vec![1, 2]);

        let binder = AffinityBinder::new(&root, &topo);
        assert!(matches!(
            binder.bind_bundle(ctx, &bundle, &mut snapshot, &spec, None),
            Err(RtTuneError::ConstraintViolation(_))
        ));

        let after =
            std::fs::read_to_string(root.proc.join("irq/42/smp_affinity_list")).unwrap();
        assert_eq!(before, after);
        assert!(!snapshot.irqs[&42].pinned_ok);
    }

    #[test]
    fn test_bundle_rejects_cpu_off_preferred_node() {
        let dir = tempfile::tempdir().unwrap();
        let (root, topo, ctx) = setup(&dir);
        fake_irq(&root, 42, "f", "0-3");

        let mut snapshot = Snapshot {
            irqs: irq::discover_all(&root).unwrap(),
            devices: BTreeMap::new(),
            kthreads: BTreeMap::new(),
        };
        snapshot.irqs.get_mut(&42).unwrap().preferred_node = NodePreference::Node(0);
        let bundle = DeviceBundle {
            irq: 42,
            pid: 1500,
            device: "0000:01:00.0".to_string(),
        };
        // CPU 5 lives on node 1.
        let spec = CpuSpec::from_list("wrong_node", vec![5]);

        let binder = AffinityBinder::new(&root, &topo);
        assert!(matches!(
            binder.bind_bundle(ctx, &bundle, &mut snapshot, &spec, None),
            Err(RtTuneError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn test_park_relaxes_each_irq() {
        let dir = tempfile::tempdir().unwrap();
        let (root, topo, ctx) = setup(&dir);
        fake_irq(&root, 10, "f", "0-3");
        fake_irq(&root, 11, "f0", "4-7");
        let mut irqs = irq::discover_all(&root).unwrap();
        irqs.get_mut(&10).unwrap().preferred_node = NodePreference::Node(0);
        irqs.get_mut(&11).unwrap().preferred_node = NodePreference::Node(1);

        let binder = AffinityBinder::new(&root, &topo);
        let spec = CpuSpec::from_list("system", vec![0, 1, 4, 5]);
        let verified = binder.park_irqs(ctx, &mut irqs, &spec);

        assert_eq!(verified, 2);
        assert_eq!(irqs[&10].allowed_cpus(), &[0, 1]);
        assert_eq!(irqs[&11].allowed_cpus(), &[4, 5]);
    }
}
