//! RtTune CLI - real-time affinity tuning for Linux
//!
//! Discovers the machine's interrupt topology and binds latency-critical
//! IRQs and kernel threads onto dedicated CPUs.

use anyhow::Context;
use clap::Parser;
use rttune::affinity::CpuSpec;
use rttune::bind::{apply_layout, AffinityBinder, ElevatedContext};
use rttune::config::{CliArgs, Commands, MachineLayout};
use rttune::correlate::correlate;
use rttune::report::summarize;
use rttune::scan::{self, read_interrupts, ShellInventory};
use rttune::stats::StatsSampler;
use rttune::topology::{SysRoot, Topology};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

fn main() {
    let args = CliArgs::parse();

    // Initialize logging; -v flags widen the default filter.
    let default_filter = match (args.quiet, args.verbose) {
        (true, _) => "error",
        (_, 0) => "warn",
        (_, 1) => "info",
        (_, _) => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    if let Err(e) = run(args) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run(args: CliArgs) -> anyhow::Result<()> {
    let root = SysRoot::default();
    let topo = Topology::discover(&root).context("reading system topology")?;

    match args.command {
        Commands::Scan { json } => cmd_scan(&root, &topo, json),
        Commands::Rates {
            interval,
            count,
            driver,
        } => cmd_rates(&root, &topo, interval, count, driver.as_deref()),
        Commands::Apply {
            layout,
            no_park,
            json,
        } => {
            let layout = MachineLayout::load(&layout).context("loading machine layout")?;
            cmd_apply(&root, &topo, &layout, no_park, json)
        }
        Commands::Park { cpus } => cmd_park(&root, &topo, cpus.as_deref()),
    }
}

fn cmd_scan(root: &SysRoot, topo: &Topology, json: bool) -> anyhow::Result<()> {
    let mut snapshot = scan::scan(root, topo, &ShellInventory).context("discovery pass")?;
    let correlation = correlate(&mut snapshot);

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    println!(
        "{} CPUs over {} NUMA nodes; isolated: {}",
        topo.cpu_count(),
        topo.node_count(),
        rttune::affinity::format_cpu_list(topo.isolated_cpus())
    );

    println!("\nPCI devices:");
    for dev in snapshot.devices.values() {
        println!("  {dev}");
    }

    println!("\nIRQs with an owning device:");
    for (irq_id, addr) in &correlation.irq_to_device {
        let irq = &snapshot.irqs[irq_id];
        let thread = correlation
            .irq_to_thread
            .get(irq_id)
            .map(|pid| format!(" - kthread pid {pid}"))
            .unwrap_or_default();
        println!("  {irq} - dev {addr}{thread}");
    }

    println!(
        "\n{} kernel threads; {} IRQ/device matches; {} IRQ/thread matches",
        snapshot.kthreads.len(),
        correlation.device_matches(),
        correlation.thread_matches()
    );

    Ok(())
}

fn cmd_rates(
    root: &SysRoot,
    topo: &Topology,
    interval: Duration,
    count: u32,
    driver: Option<&str>,
) -> anyhow::Result<()> {
    let mut snapshot = scan::scan(root, topo, &ShellInventory).context("discovery pass")?;
    let correlation = correlate(&mut snapshot);

    let tracked: Vec<u32> = match driver {
        Some(driver) => correlation
            .irq_to_device
            .iter()
            .filter(|(_, addr)| {
                snapshot
                    .devices
                    .get(*addr)
                    .map(|d| d.driver == driver)
                    .unwrap_or(false)
            })
            .map(|(irq, _)| *irq)
            .collect(),
        None => snapshot.irqs.keys().copied().collect(),
    };

    let mut sampler = StatsSampler::new(tracked, topo.cpu_count());
    let start = Instant::now();

    for sample in 0..=count {
        let snap = read_interrupts(root).context("reading interrupt counters")?;
        sampler.ingest(start.elapsed().as_secs_f64(), &snap)?;

        if sample > 0 {
            println!("--- sample {sample} ---");
            for (irq, rate) in sampler.fastest().into_iter().take(10) {
                if rate > 0.0 {
                    println!("  IRQ {irq:4}  {rate:10.1} /s");
                }
            }
        }
        if sample < count {
            std::thread::sleep(interval);
        }
    }

    Ok(())
}

fn cmd_apply(
    root: &SysRoot,
    topo: &Topology,
    layout: &MachineLayout,
    no_park: bool,
    json: bool,
) -> anyhow::Result<()> {
    let ctx = ElevatedContext::acquire().context("apply requires root")?;

    let mut snapshot = scan::scan(root, topo, &ShellInventory).context("discovery pass")?;
    let correlation = correlate(&mut snapshot);
    let binder = AffinityBinder::new(root, topo);

    let specs = layout.build_specs()?;
    binder
        .rebuild_cpusets(ctx, &specs)
        .context("rebuilding cpusets")?;

    if !no_park {
        let park = match &layout.park_cpus {
            Some(range) => CpuSpec::from_range_str("park", range)?,
            None => CpuSpec::from_list("park", topo.system_cpus()),
        };
        binder.park_irqs(ctx, &mut snapshot.irqs, &park);
    }

    apply_layout(&binder, ctx, layout, &mut snapshot, &correlation)?;

    // One repeat pass; some kernel threads need the nudge.
    apply_layout(&binder, ctx, layout, &mut snapshot, &correlation)?;

    let summary = summarize(&mut snapshot, &correlation);
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        summary.print();
    }

    Ok(())
}

fn cmd_park(root: &SysRoot, topo: &Topology, cpus: Option<&str>) -> anyhow::Result<()> {
    let ctx = ElevatedContext::acquire().context("park requires root")?;

    let spec = match cpus {
        Some(range) => CpuSpec::from_range_str("park", range)?,
        None => CpuSpec::from_list("park", topo.system_cpus()),
    };
    anyhow::ensure!(!spec.is_empty(), "no CPUs to park onto");

    let mut irqs = scan_irqs_with_nodes(root, topo)?;
    let binder = AffinityBinder::new(root, topo);
    let verified = binder.park_irqs(ctx, &mut irqs, &spec);

    println!(
        "Parked {verified}/{} IRQs onto CPUs {}",
        irqs.len(),
        spec.to_range_notation()
    );
    Ok(())
}

/// Parking only needs IRQ entities with their NUMA preference; run the
/// scan-correlate prefix and keep the IRQs.
fn scan_irqs_with_nodes(
    root: &SysRoot,
    topo: &Topology,
) -> anyhow::Result<std::collections::BTreeMap<u32, rttune::scan::Irq>> {
    let mut snapshot = scan::scan(root, topo, &ShellInventory).context("discovery pass")?;
    let _ = correlate(&mut snapshot);
    Ok(snapshot.irqs)
}
