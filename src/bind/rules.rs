//! Config-driven binding pass
//!
//! Applies the machine layout's rules to a correlated snapshot, in order.
//! Each rule's failures are isolated and logged: a missing cpuset or a bad
//! device aborts that rule only, never the pass. Outcomes land on the
//! entity flags and are collected by the run summary afterwards.

use super::binder::AffinityBinder;
use super::privilege::ElevatedContext;
use crate::affinity::CpuSpec;
use crate::config::{BindRule, MachineLayout};
use crate::correlate::{self, Correlation};
use crate::error::{Result, RtTuneError};
use crate::scan::{KthreadKind, Snapshot};
use std::collections::BTreeMap;
use tracing::{error, info};

/// Apply every rule of the layout against one correlated snapshot
pub fn apply_layout(
    binder: &AffinityBinder<'_>,
    ctx: ElevatedContext,
    layout: &MachineLayout,
    snapshot: &mut Snapshot,
    correlation: &Correlation,
) -> Result<()> {
    let specs = layout.build_specs()?;
    let sets: BTreeMap<&str, &CpuSpec> = specs.iter().map(|s| (s.name.as_str(), s)).collect();

    for (idx, rule) in layout.rules.iter().enumerate() {
        if let Err(e) = apply_rule(binder, ctx, rule, &sets, snapshot, correlation) {
            error!(rule = idx, error = %e, "binding rule failed; continuing with next rule");
        }
    }

    Ok(())
}

fn lookup<'a>(sets: &BTreeMap<&str, &'a CpuSpec>, name: &str) -> Result<&'a CpuSpec> {
    sets.get(name)
        .copied()
        .ok_or_else(|| RtTuneError::UnknownCpuSet(name.to_string()))
}

fn apply_rule(
    binder: &AffinityBinder<'_>,
    ctx: ElevatedContext,
    rule: &BindRule,
    sets: &BTreeMap<&str, &CpuSpec>,
    snapshot: &mut Snapshot,
    correlation: &Correlation,
) -> Result<()> {
    match rule {
        BindRule::Driver {
            driver,
            cpusets,
            priority,
        } => {
            let bundles = correlate::bundles_for_driver(snapshot, correlation, driver);
            if bundles.len() != cpusets.len() {
                return Err(RtTuneError::ConstraintViolation(format!(
                    "driver '{driver}' matched {} bundles but the rule names {} cpusets",
                    bundles.len(),
                    cpusets.len()
                )));
            }
            info!(driver = %driver, bundles = bundles.len(), "applying driver rule");
            for (bundle, set_name) in bundles.iter().zip(cpusets) {
                let spec = lookup(sets, set_name)?;
                binder.bind_bundle(ctx, bundle, snapshot, spec, *priority)?;
            }
        }

        BindRule::Interface {
            prefix,
            irq_cpuset,
            kthread_cpuset,
            priority,
        } => {
            let irq_spec = lookup(sets, irq_cpuset)?;
            let irq_ids = correlate::irqs_for_interface(snapshot, correlation, prefix);
            info!(prefix = %prefix, irqs = irq_ids.len(), "applying interface rule");
            for id in irq_ids {
                if let Some(irq) = snapshot.irqs.get_mut(&id) {
                    binder.pin_irq(ctx, irq, irq_spec.cpus(), false)?;
                }
            }

            if let Some(kt_set) = kthread_cpuset {
                let kt_spec = lookup(sets, kt_set)?;
                let pids: Vec<i32> = correlate::kthreads_matching(snapshot, prefix)
                    .iter()
                    .map(|kt| kt.pid)
                    .collect();
                for pid in pids {
                    if let Some(kt) = snapshot.kthreads.get_mut(&pid) {
                        binder.pin_kthread(ctx, kt, kt_spec)?;
                        if let Some(priority) = priority {
                            binder.set_fifo(ctx, kt, *priority)?;
                        }
                    }
                }
            }
        }

        BindRule::RcuFamily { cpuset, priority } => {
            let spec = cpuset.as_deref().map(|n| lookup(sets, n)).transpose()?;
            let pids: Vec<i32> = snapshot
                .kthreads
                .values()
                .filter(|kt| kt.kind.is_rcu_percpu())
                .map(|kt| kt.pid)
                .collect();
            info!(threads = pids.len(), "applying RCU-family rule");
            for pid in pids {
                let Some(kt) = snapshot.kthreads.get_mut(&pid) else {
                    continue;
                };
                // Callback threads stay per-CPU; only the offload family
                // moves into the housekeeping set.
                if kt.kind != KthreadKind::Rcuc {
                    if let Some(spec) = spec {
                        binder.pin_kthread(ctx, kt, spec)?;
                    }
                }
                if let Some(priority) = priority {
                    binder.set_fifo(ctx, kt, *priority)?;
                }
            }
        }

        BindRule::NameContains {
            substring,
            cpuset,
            priority,
        } => {
            let spec = lookup(sets, cpuset)?;
            let pids: Vec<i32> = correlate::kthreads_matching(snapshot, substring)
                .iter()
                .map(|kt| kt.pid)
                .collect();
            info!(substring = %substring, threads = pids.len(), "applying name rule");
            for pid in pids {
                if let Some(kt) = snapshot.kthreads.get_mut(&pid) {
                    binder.pin_kthread(ctx, kt, spec)?;
                    if let Some(priority) = priority {
                        binder.set_fifo(ctx, kt, *priority)?;
                    }
                }
            }
        }
    }

    Ok(())
}
