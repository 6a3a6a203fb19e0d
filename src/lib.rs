//! # RtTune - Real-Time Affinity Tuning for Linux
//!
//! RtTune prepares a Linux machine for real-time, low-jitter operation.
//! Every run performs one fresh snapshot-correlate-bind cycle:
//!
//! - **Discovery**: IRQs from the per-interrupt tree, PCI endpoints from
//!   the device tree (bridges excluded), kernel threads from the thread
//!   reaper's children.
//! - **Correlation**: IRQ ↔ device and IRQ ↔ kernel-thread cross-references
//!   with a documented tie-break for duplicate interrupt claims.
//! - **Binding**: pin IRQs and threads onto named CPU sets, verify every
//!   write by reading it back, record outcomes per entity.
//! - **Sampling**: per-IRQ per-CPU interrupt rates from periodic counter
//!   snapshots.
//!
//! ## Quick Start
//!
//! ```no_run
//! use rttune::bind::{AffinityBinder, ElevatedContext};
//! use rttune::scan::ShellInventory;
//! use rttune::topology::{SysRoot, Topology};
//!
//! let root = SysRoot::default();
//! let topo = Topology::discover(&root).unwrap();
//!
//! let mut snapshot = rttune::scan::scan(&root, &topo, &ShellInventory).unwrap();
//! let correlation = rttune::correlate::correlate(&mut snapshot);
//!
//! let ctx = ElevatedContext::acquire().unwrap();
//! let binder = AffinityBinder::new(&root, &topo);
//! let system = rttune::affinity::CpuSpec::from_list("system", topo.system_cpus());
//! binder.park_irqs(ctx, &mut snapshot.irqs, &system);
//! ```
//!
//! ## Rate Sampling
//!
//! ```no_run
//! use rttune::scan::read_interrupts;
//! use rttune::stats::StatsSampler;
//! use rttune::topology::SysRoot;
//!
//! let root = SysRoot::default();
//! let mut sampler = StatsSampler::new([42, 43], 8);
//! let t0 = std::time::Instant::now();
//! loop {
//!     let snap = read_interrupts(&root).unwrap();
//!     sampler.ingest(t0.elapsed().as_secs_f64(), &snap).unwrap();
//!     std::thread::sleep(std::time::Duration::from_secs(1));
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod affinity;
pub mod bind;
pub mod config;
pub mod correlate;
pub mod error;
pub mod report;
pub mod scan;
pub mod stats;
pub mod topology;

// Re-export commonly used types
pub use affinity::{CpuMask, CpuSpec};
pub use error::{Result, RtTuneError};
pub use topology::{SysRoot, Topology};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient re-exports for common usage
    //!
    //! ```no_run
    //! use rttune::prelude::*;
    //! ```

    pub use crate::affinity::{format_cpu_list, parse_cpu_list, CpuMask, CpuSpec};
    pub use crate::bind::{apply_layout, AffinityBinder, ElevatedContext};
    pub use crate::config::{CliArgs, Commands, MachineLayout};
    pub use crate::correlate::{correlate, Correlation, DeviceBundle};
    pub use crate::error::{Result, RtTuneError};
    pub use crate::report::{summarize, RunSummary};
    pub use crate::scan::{scan, Irq, KThread, PciDevice, ShellInventory, Snapshot};
    pub use crate::stats::StatsSampler;
    pub use crate::topology::{NodePreference, SysRoot, Topology};
}
