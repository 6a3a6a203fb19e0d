//! Configuration module
//!
//! CLI arguments and the per-machine layout file (named CPU sets plus
//! binding rules) that drives the apply pass.

mod settings;

pub use settings::{BindRule, CliArgs, Commands, CpuSetDef, MachineLayout};
