//! External collaborator tools
//!
//! The CPU-set partitioning tool (`cset`), the scheduling-policy tool
//! (`chrt`), and the OS affinity calls. Their internals are opaque; only
//! the argument surface and exit status matter here.

use super::privilege::ElevatedContext;
use crate::affinity::CpuSpec;
use crate::error::{Result, RtTuneError};
use nix::unistd::Pid;
use std::process::Command;
use tracing::{debug, info};

/// Name of the root cpuset group every thread can be released into
pub const ROOT_SET: &str = "root";

fn run(tool: &str, args: &[String]) -> Result<()> {
    debug!(tool, ?args, "invoking external tool");
    let output = Command::new(tool)
        .args(args)
        .output()
        .map_err(|e| RtTuneError::tool(tool, e.to_string()))?;

    if !output.status.success() {
        return Err(RtTuneError::tool(
            tool,
            format!(
                "exit status {} for args {:?}: {}",
                output.status,
                args,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    Ok(())
}

/// CPU-set partitioning tool wrapper
#[derive(Debug, Default)]
pub struct CsetTool;

impl CsetTool {
    /// Create a named set from a spec (CPUs plus optional memory nodes)
    pub fn create_set(&self, _ctx: ElevatedContext, spec: &CpuSpec) -> Result<()> {
        info!(set = %spec.name, cpus = %spec.to_range_notation(), "creating cpuset");
        run("cset", &Self::create_args(spec))
    }

    /// Delete a named set; missing sets are a tool failure the caller may
    /// choose to ignore
    pub fn destroy_set(&self, _ctx: ElevatedContext, name: &str) -> Result<()> {
        info!(set = name, "destroying cpuset");
        run("cset", &Self::destroy_args(name))
    }

    /// Force-assign one kernel thread into a named set
    pub fn move_thread(&self, _ctx: ElevatedContext, pid: i32, set_name: &str) -> Result<()> {
        debug!(pid, set = set_name, "moving kernel thread into cpuset");
        run("cset", &Self::move_args(pid, set_name))
    }

    pub(crate) fn create_args(spec: &CpuSpec) -> Vec<String> {
        let mut args = vec![
            "set".to_string(),
            "--cpu".to_string(),
            spec.to_range_notation(),
        ];
        if let Some(mems) = spec.mems_range_notation() {
            args.push("-m".to_string());
            args.push(mems);
        }
        args.push("--set".to_string());
        args.push(spec.name.clone());
        args
    }

    pub(crate) fn destroy_args(name: &str) -> Vec<String> {
        vec!["set".to_string(), "-d".to_string(), name.to_string()]
    }

    pub(crate) fn move_args(pid: i32, set_name: &str) -> Vec<String> {
        // Forceful kernel-thread move; some threads need the nudge.
        vec![
            "proc".to_string(),
            "-k".to_string(),
            "-m".to_string(),
            "--force".to_string(),
            pid.to_string(),
            set_name.to_string(),
        ]
    }
}

/// Scheduling-policy tool wrapper
#[derive(Debug, Default)]
pub struct ChrtTool;

impl ChrtTool {
    /// Set a fixed-priority fifo policy on a thread
    pub fn set_fifo(&self, _ctx: ElevatedContext, pid: i32, priority: u32) -> Result<()> {
        info!(pid, priority, "setting fifo scheduling policy");
        run("chrt", &Self::fifo_args(pid, priority))
    }

    /// Reset a thread to the default time-shared policy
    pub fn reset_time_shared(&self, _ctx: ElevatedContext, pid: i32) -> Result<()> {
        info!(pid, "resetting to time-shared scheduling policy");
        run("chrt", &Self::other_args(pid))
    }

    pub(crate) fn fifo_args(pid: i32, priority: u32) -> Vec<String> {
        vec![
            "-f".to_string(),
            "-p".to_string(),
            priority.to_string(),
            pid.to_string(),
        ]
    }

    pub(crate) fn other_args(pid: i32) -> Vec<String> {
        vec![
            "-o".to_string(),
            "-p".to_string(),
            "0".to_string(),
            pid.to_string(),
        ]
    }
}

/// Set a thread's OS-level affinity list directly
pub fn set_os_affinity(_ctx: ElevatedContext, pid: i32, cpus: &[usize]) -> Result<()> {
    let mut set = nix::sched::CpuSet::new();
    for &cpu in cpus {
        set.set(cpu).map_err(|e| {
            RtTuneError::tool("sched_setaffinity", format!("cpu {cpu} out of range: {e}"))
        })?;
    }
    nix::sched::sched_setaffinity(Pid::from_raw(pid), &set)
        .map_err(|e| RtTuneError::tool("sched_setaffinity", format!("pid {pid}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::CpuSpec;

    #[test]
    fn test_create_args_with_mems() {
        let spec = CpuSpec::from_list("kt_rcu_safe", vec![10, 29]).with_mems(vec![0, 1]);
        assert_eq!(
            CsetTool::create_args(&spec),
            vec!["set", "--cpu", "10,29", "-m", "0-1", "--set", "kt_rcu_safe"]
        );
    }

    #[test]
    fn test_create_args_without_mems() {
        let spec = CpuSpec::from_list("o_work", vec![6]);
        assert_eq!(
            CsetTool::create_args(&spec),
            vec!["set", "--cpu", "6", "--set", "o_work"]
        );
    }

    #[test]
    fn test_move_args_are_forceful() {
        assert_eq!(
            CsetTool::move_args(1500, "a_edt"),
            vec!["proc", "-k", "-m", "--force", "1500", "a_edt"]
        );
    }

    #[test]
    fn test_chrt_args() {
        assert_eq!(ChrtTool::fifo_args(1500, 49), vec!["-f", "-p", "49", "1500"]);
        assert_eq!(ChrtTool::other_args(1500), vec!["-o", "-p", "0", "1500"]);
    }
}
