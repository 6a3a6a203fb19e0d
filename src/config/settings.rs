//! Configuration settings for RtTune
//!
//! Defines the CLI surface and the machine layout file. The layout is the
//! per-machine input: which named CPU sets exist and which discovery
//! results get bound onto them.

use crate::affinity::CpuSpec;
use crate::error::{IoResultExt, Result, RtTuneError};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// RtTune - real-time interrupt and NUMA affinity tuner
#[derive(Parser, Debug)]
#[command(name = "rttune")]
#[command(author = "RtTune Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Pin latency-critical IRQs and kernel threads onto dedicated CPUs")]
#[command(long_about = r#"
RtTune tunes a Linux machine for real-time, low-jitter operation. Each run
takes a fresh snapshot of the IRQ, PCI and kernel-thread topology,
cross-references it, and binds latency-critical entities onto the CPU sets
a machine layout file names, verifying every change.

Examples:
  rttune scan                          # Show the discovered topology
  rttune rates -i 2s -n 10             # Watch per-IRQ interrupt rates
  rttune apply --layout sc5.json       # Apply a machine layout (root)
  rttune park --cpus 0-5               # Park all IRQs on housekeeping CPUs
"#)]
pub struct CliArgs {
    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Discover and print the IRQ / PCI / kernel-thread topology
    Scan {
        /// Emit the snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Sample per-IRQ interrupt rates
    Rates {
        /// Sampling interval (e.g. 500ms, 2s)
        #[arg(short = 'i', long, default_value = "1s", value_parser = humantime::parse_duration)]
        interval: Duration,

        /// Number of samples to take
        #[arg(short = 'n', long, default_value = "5")]
        count: u32,

        /// Only IRQs owned by devices using this kernel driver
        #[arg(long, value_name = "DRIVER")]
        driver: Option<String>,
    },

    /// Apply a machine layout: rebuild cpusets, park IRQs, run the rules
    Apply {
        /// Machine layout file (JSON)
        #[arg(long, value_name = "FILE")]
        layout: PathBuf,

        /// Skip the IRQ parking step
        #[arg(long)]
        no_park: bool,

        /// Emit the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Park every IRQ onto the housekeeping CPUs
    Park {
        /// Target CPUs in range notation; defaults to the non-isolated set
        #[arg(long, value_name = "CPUS")]
        cpus: Option<String>,
    },
}

/// One named CPU set in the layout file
#[derive(Debug, Clone, Deserialize)]
pub struct CpuSetDef {
    /// Set name
    pub name: String,
    /// CPUs in range notation
    pub cpus: String,
    /// Memory nodes the set may allocate from
    #[serde(default)]
    pub mems: Option<Vec<usize>>,
    /// Exclude these CPUs from interrupt balancing
    #[serde(default)]
    pub no_irq_balancing: bool,
}

impl CpuSetDef {
    /// Materialize into the canonical CPU-set representation
    pub fn to_spec(&self) -> Result<CpuSpec> {
        let mut spec = CpuSpec::from_range_str(&self.name, &self.cpus)?
            .with_no_irq_balancing(self.no_irq_balancing);
        if let Some(mems) = &self.mems {
            spec = spec.with_mems(mems.clone());
        }
        Ok(spec)
    }
}

/// One binding rule of the layout, applied in file order
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BindRule {
    /// Bind each device bundle of a kernel driver onto its own set, in bus
    /// address order; the cpuset count must match the device count
    Driver {
        /// Kernel driver module name
        driver: String,
        /// One set name per matched device
        cpusets: Vec<String>,
        /// Fifo priority for the serviced threads
        #[serde(default)]
        priority: Option<u32>,
    },

    /// Pin the IRQs (and optionally the kernel threads) of a network
    /// interface prefix
    Interface {
        /// Interface name prefix, e.g. "enp2"
        prefix: String,
        /// Set receiving the interface's IRQs
        irq_cpuset: String,
        /// Set receiving the interface's kernel threads
        #[serde(default)]
        kthread_cpuset: Option<String>,
        /// Fifo priority for the moved threads
        #[serde(default)]
        priority: Option<u32>,
    },

    /// Pin the RCU offload threads and set RCU thread priorities
    RcuFamily {
        /// Set receiving the offload threads (callback threads stay put)
        #[serde(default)]
        cpuset: Option<String>,
        /// Fifo priority for all RCU-family threads
        #[serde(default)]
        priority: Option<u32>,
    },

    /// Pin kernel threads whose name contains a substring
    NameContains {
        /// Substring matched against the raw thread name
        substring: String,
        /// Target set name
        cpuset: String,
        /// Fifo priority for the moved threads
        #[serde(default)]
        priority: Option<u32>,
    },
}

/// Per-machine layout: the named CPU sets and the rules binding discovery
/// results onto them
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MachineLayout {
    /// Named CPU sets to (re)create before binding
    #[serde(default)]
    pub cpusets: Vec<CpuSetDef>,
    /// Binding rules, applied in order
    #[serde(default)]
    pub rules: Vec<BindRule>,
    /// CPUs for IRQ parking, in range notation; defaults to the
    /// non-isolated CPUs
    #[serde(default)]
    pub park_cpus: Option<String>,
}

impl MachineLayout {
    /// Load a layout file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        let layout: Self = serde_json::from_str(&content)
            .map_err(|e| RtTuneError::config(format!("{}: {e}", path.display())))?;
        layout.validate()?;
        Ok(layout)
    }

    /// Materialize every set definition
    pub fn build_specs(&self) -> Result<Vec<CpuSpec>> {
        self.cpusets.iter().map(|def| def.to_spec()).collect()
    }

    fn validate(&self) -> Result<()> {
        let mut names = std::collections::BTreeSet::new();
        for def in &self.cpusets {
            if !names.insert(def.name.as_str()) {
                return Err(RtTuneError::config(format!(
                    "duplicate cpuset name '{}'",
                    def.name
                )));
            }
            def.to_spec()?;
        }
        Ok(())
    }
}
