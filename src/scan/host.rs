//! Hardware-enumeration tool collaborators
//!
//! Text output of the bus-listing, loaded-module, kernel-thread and
//! interface-address tools. The tools are opaque; their output is parsed
//! elsewhere under fixed column assumptions. Discovery takes the trait so
//! tests can feed canned output.

use crate::error::{Result, RtTuneError};
use std::process::Command;

/// Source of external enumeration-tool output
pub trait HostInventory {
    /// `lspci` output: one device per line, short address first
    fn bus_listing(&self) -> Result<String>;

    /// `lsmod` output: header line, then one module per line
    fn loaded_modules(&self) -> Result<String>;

    /// Children of the kernel thread reaper: one `pid cls cmd` row per
    /// thread, no header
    fn kernel_thread_listing(&self) -> Result<String>;

    /// One-line-per-address listing for a network interface
    fn interface_addr_listing(&self, iface: &str) -> Result<String>;
}

/// Live implementation shelling out to the host tools
#[derive(Debug, Default)]
pub struct ShellInventory;

impl ShellInventory {
    fn run(tool: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(tool)
            .args(args)
            .output()
            .map_err(|e| RtTuneError::tool(tool, e.to_string()))?;

        if !output.status.success() {
            return Err(RtTuneError::tool(
                tool,
                format!(
                    "exit status {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl HostInventory for ShellInventory {
    fn bus_listing(&self) -> Result<String> {
        Self::run("lspci", &[])
    }

    fn loaded_modules(&self) -> Result<String> {
        Self::run("lsmod", &[])
    }

    fn kernel_thread_listing(&self) -> Result<String> {
        // cmd must be last to avoid truncation
        Self::run(
            "ps",
            &["--ppid", "2", "-p", "2", "-o", "pid,cls,cmd", "--no-headers"],
        )
    }

    fn interface_addr_listing(&self, iface: &str) -> Result<String> {
        Self::run("ip", &["-4", "-o", "addr", "show", "dev", iface])
    }
}

/// Canned tool output for unit tests
#[cfg(test)]
#[derive(Debug, Default)]
pub struct FixtureInventory {
    pub bus_listing: String,
    pub loaded_modules: String,
    pub kernel_threads: String,
    pub interface_addrs: std::collections::BTreeMap<String, String>,
}

#[cfg(test)]
impl HostInventory for FixtureInventory {
    fn bus_listing(&self) -> Result<String> {
        Ok(self.bus_listing.clone())
    }

    fn loaded_modules(&self) -> Result<String> {
        Ok(self.loaded_modules.clone())
    }

    fn kernel_thread_listing(&self) -> Result<String> {
        Ok(self.kernel_threads.clone())
    }

    fn interface_addr_listing(&self, iface: &str) -> Result<String> {
        Ok(self.interface_addrs.get(iface).cloned().unwrap_or_default())
    }
}
