//! Affinity binding
//!
//! The third phase of a run: pin IRQs and kernel threads onto the CPU sets
//! the layout names, verify every write by reading it back, and record the
//! outcome on the entity. Requires a populated correlation; privileged
//! writes require the elevation capability.

mod binder;
mod privilege;
mod rules;
mod tools;

pub use binder::AffinityBinder;
pub use privilege::ElevatedContext;
pub use rules::apply_layout;
pub use tools::{set_os_affinity, ChrtTool, CsetTool, ROOT_SET};
