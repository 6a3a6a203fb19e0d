//! Canonical CPU-set representation
//!
//! Three mutually convertible encodings of a CPU set: a sorted-unique id
//! list, the kernel's range notation ("0-2,5,7-9"), and a bitmask that may
//! exceed one machine word. Every other component goes through this module.

mod codec;
mod cpuspec;
mod mask;

pub use codec::{format_cpu_list, parse_cpu_list};
pub use cpuspec::CpuSpec;
pub use mask::CpuMask;
