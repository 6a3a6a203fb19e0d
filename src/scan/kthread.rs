//! Kernel-thread discovery
//!
//! Enumerates the direct children of the kernel thread reaper and parses
//! their bracketed names into a closed category set. The per-thread
//! scheduler file feeds delta-tracked counters; liveness is probed lazily
//! with a null signal and is sticky once a thread is found dead.

use super::{read_first_line, read_lines, HostInventory};
use crate::error::{Result, RtTuneError};
use crate::topology::SysRoot;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Mutex, OnceLock};
use tracing::{debug, info, warn};

/// Kernel-thread category, parsed from the name prefix.
///
/// A closed set; unrecognized prefixes collapse to [`KthreadKind::Other`],
/// each raw value logged exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KthreadKind {
    /// Threaded interrupt handler
    Irq,
    /// RCU boost thread
    Rcub,
    /// RCU callback thread
    Rcuc,
    /// RCU no-CB grace-period thread
    Rcuog,
    /// RCU no-CB offload thread
    Rcuop,
    /// Generic worker
    Kworker,
    /// Softirq servicing thread
    Ksoftirqd,
    /// Migration helper
    Migration,
    /// IRQ work thread
    IrqWork,
    /// Idle injection thread
    IdleInject,
    /// CPU hotplug helper
    Cpuhp,
    /// Page-replacement thread
    Pr,
    /// NVIDIA modeset worker
    NvidiaModeset,
    /// Journaling thread
    Jbd2,
    /// Anything else
    Other,
}

impl KthreadKind {
    /// Map a name prefix onto the category set
    pub fn from_token(token: &str) -> Self {
        match token {
            "irq" => Self::Irq,
            "rcub" => Self::Rcub,
            "rcuc" => Self::Rcuc,
            "rcuog" => Self::Rcuog,
            "rcuop" => Self::Rcuop,
            "kworker" => Self::Kworker,
            "ksoftirqd" => Self::Ksoftirqd,
            "migration" => Self::Migration,
            "irq_work" => Self::IrqWork,
            "idle_inject" => Self::IdleInject,
            "cpuhp" => Self::Cpuhp,
            "pr" => Self::Pr,
            "nvidia-modeset" => Self::NvidiaModeset,
            "jbd2" => Self::Jbd2,
            other => {
                warn_once("kthread category", other);
                Self::Other
            }
        }
    }

    /// RCU-family threads carrying a per-CPU index in their name
    pub fn is_rcu_percpu(&self) -> bool {
        matches!(self, Self::Rcub | Self::Rcuc | Self::Rcuog | Self::Rcuop)
    }
}

/// Scheduling class as reported by the thread listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedClass {
    /// Fixed-priority fifo
    Fifo,
    /// Default time-shared
    TimeShared,
    /// Unrecognized class token
    Unknown,
}

impl SchedClass {
    /// Map a class token; unrecognized values are logged once
    pub fn from_token(token: &str) -> Self {
        match token {
            "FF" => Self::Fifo,
            "TS" => Self::TimeShared,
            other => {
                warn_once("sched class", other);
                Self::Unknown
            }
        }
    }
}

fn warn_once(domain: &str, value: &str) {
    static SEEN: OnceLock<Mutex<BTreeSet<String>>> = OnceLock::new();
    let seen = SEEN.get_or_init(|| Mutex::new(BTreeSet::new()));
    let key = format!("{domain}:{value}");
    if seen.lock().map(|mut s| s.insert(key)).unwrap_or(false) {
        warn!(domain, value, "unrecognized token, using catch-all");
    }
}

/// A monotonic counter tracked together with its last increment
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Delta<T> {
    /// Last absolute value read
    pub value: T,
    /// Increment since the previous read
    pub delta: T,
}

impl Delta<u64> {
    fn update(&mut self, new: u64) {
        self.delta = new.saturating_sub(self.value);
        self.value = new;
    }
}

impl Delta<f64> {
    fn update(&mut self, new: f64) {
        self.delta = new - self.value;
        self.value = new;
    }
}

/// A kernel thread (any child of the thread reaper)
#[derive(Debug, Clone, Serialize)]
pub struct KThread {
    /// Process id
    pub pid: i32,
    /// Raw name, brackets included
    pub name: String,
    /// Scheduling class at discovery time
    pub sched_class: SchedClass,
    /// Parsed category
    pub kind: KthreadKind,
    /// Interrupt number parsed from the name, for irq-category threads
    pub irq: Option<u32>,
    /// Per-CPU index parsed from the name, for RCU-family threads
    pub cpu_index: Option<usize>,
    alive: bool,
    /// Kernel comm string
    pub comm: String,
    /// Cpuset group path, leading separator stripped
    pub cpuset_path: String,
    /// Accumulated runtime, ms
    pub runtime_ms: Delta<f64>,
    /// Scheduler migrations
    pub migrations: Delta<u64>,
    /// Total context switches
    pub switches: Delta<u64>,
    /// Voluntary context switches
    pub voluntary_switches: Delta<u64>,
    /// Involuntary context switches
    pub involuntary_switches: Delta<u64>,
    /// Set once a grouping verified exactly against its target
    pub grouped_ok: bool,
}

impl KThread {
    /// Build from one listing row, applying the name-parsing contract
    pub fn from_listing(pid: i32, sched_token: &str, name: &str) -> Result<Self> {
        debug!(pid, name, "parsing kernel thread");

        let stripped = name
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(name);

        let mut kind = KthreadKind::Other;
        let mut irq = None;
        let mut cpu_index = None;

        if let Some((first, rest)) = stripped.split_once('/') {
            kind = KthreadKind::from_token(first);
            if kind == KthreadKind::Irq {
                let num = rest.split('-').next().unwrap_or(rest);
                irq = Some(num.parse().map_err(|_| {
                    RtTuneError::malformed(
                        format!("kthread name '{name}'"),
                        format!("bad interrupt number '{num}'"),
                    )
                })?);
            } else if kind.is_rcu_percpu() {
                cpu_index = Some(rest.parse().map_err(|_| {
                    RtTuneError::malformed(
                        format!("kthread name '{name}'"),
                        format!("bad per-CPU index '{rest}'"),
                    )
                })?);
            }
        }

        Ok(Self {
            pid,
            name: name.to_string(),
            sched_class: SchedClass::from_token(sched_token),
            kind,
            irq,
            cpu_index,
            alive: true,
            comm: String::new(),
            cpuset_path: String::new(),
            runtime_ms: Delta::default(),
            migrations: Delta::default(),
            switches: Delta::default(),
            voluntary_switches: Delta::default(),
            involuntary_switches: Delta::default(),
            grouped_ok: false,
        })
    }

    /// Re-read comm, cpuset and the scheduler counters
    pub fn refresh(&mut self, root: &SysRoot) -> Result<()> {
        let proc_dir = root.proc.join(self.pid.to_string());

        self.comm = read_first_line(&proc_dir.join("comm"))?;
        self.cpuset_path = read_first_line(&proc_dir.join("cpuset"))
            .map(|s| s.trim_start_matches('/').to_string())?;

        let sched_path = proc_dir.join("sched");
        let lines = read_lines(&sched_path)?;
        let table = parse_sched_table(&lines);
        let what = sched_path.display().to_string();

        self.runtime_ms
            .update(required_f64(&what, &table, "se.sum_exec_runtime")?);
        self.migrations
            .update(required_u64(&what, &table, "se.nr_migrations")?);
        self.switches
            .update(required_u64(&what, &table, "nr_switches")?);
        self.voluntary_switches
            .update(required_u64(&what, &table, "nr_voluntary_switches")?);
        self.involuntary_switches
            .update(required_u64(&what, &table, "nr_involuntary_switches")?);

        Ok(())
    }

    /// Lazy liveness probe.
    ///
    /// A thread found dead stays dead; permission failures on the probe
    /// count as alive.
    pub fn is_alive(&mut self) -> bool {
        if !self.alive {
            return false;
        }
        match kill(Pid::from_raw(self.pid), None::<Signal>) {
            Ok(()) | Err(Errno::EPERM) => true,
            Err(_) => {
                warn!(pid = self.pid, name = %self.name, "kernel thread has terminated");
                self.alive = false;
                false
            }
        }
    }

    /// Current OS-level affinity as a sorted CPU list.
    ///
    /// A vanished thread yields the empty list and marks itself dead.
    pub fn os_affinity(&mut self) -> Result<Vec<usize>> {
        match nix::sched::sched_getaffinity(Pid::from_raw(self.pid)) {
            Ok(set) => {
                let mut cpus = Vec::new();
                for cpu in 0..nix::sched::CpuSet::count() {
                    if set.is_set(cpu).unwrap_or(false) {
                        cpus.push(cpu);
                    }
                }
                Ok(cpus)
            }
            Err(Errno::ESRCH) => {
                self.alive = false;
                Ok(Vec::new())
            }
            Err(e) => Err(RtTuneError::tool(
                "sched_getaffinity",
                format!("pid {}: {e}", self.pid),
            )),
        }
    }
}

impl fmt::Display for KThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KThread pid {} - {}", self.pid, self.name)?;
        if let Some(irq) = self.irq {
            write!(f, " - bound to IRQ {irq}")?;
        }
        Ok(())
    }
}

/// Enumerate the thread reaper's children and load each thread's state.
///
/// A thread that dies between the listing and the first file read is
/// dropped with a warning instead of failing the pass.
pub fn discover_all(
    root: &SysRoot,
    inv: &dyn HostInventory,
) -> Result<BTreeMap<i32, KThread>> {
    let listing = inv.kernel_thread_listing()?;
    let mut kthreads = BTreeMap::new();

    for (pid, cls, name) in parse_thread_listing(&listing)? {
        let mut kt = KThread::from_listing(pid, &cls, &name)?;
        match kt.refresh(root) {
            Ok(()) => {
                kthreads.insert(pid, kt);
            }
            Err(e) if vanished(&e) => {
                warn!(pid, name = %name, "kernel thread vanished during discovery");
            }
            Err(e) => return Err(e),
        }
    }

    info!(count = kthreads.len(), "kernel thread discovery complete");
    Ok(kthreads)
}

fn vanished(err: &RtTuneError) -> bool {
    matches!(err, RtTuneError::Io { source, .. }
        if source.kind() == std::io::ErrorKind::NotFound)
}

/// Parse `pid cls cmd` rows under fixed column assumptions
fn parse_thread_listing(listing: &str) -> Result<Vec<(i32, String, String)>> {
    let mut rows = Vec::new();

    for line in listing.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(pid), Some(cls), Some(first)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(RtTuneError::malformed(
                "kernel thread listing",
                format!("bad row '{line}'"),
            ));
        };
        let pid: i32 = pid.parse().map_err(|_| {
            RtTuneError::malformed("kernel thread listing", format!("bad pid in '{line}'"))
        })?;

        let mut name = first.to_string();
        for tok in fields {
            name.push(' ');
            name.push_str(tok);
        }
        rows.push((pid, cls.to_string(), name));
    }

    Ok(rows)
}

/// Scheduler file body: two header lines, then colon-separated key/value
/// rows. Colon-less lines (NUMA fault summaries) are skipped.
fn parse_sched_table(lines: &[String]) -> BTreeMap<String, String> {
    lines
        .iter()
        .skip(2)
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn required<'a>(
    what: &str,
    table: &'a BTreeMap<String, String>,
    key: &str,
) -> Result<&'a str> {
    table
        .get(key)
        .map(|s| s.as_str())
        .ok_or_else(|| RtTuneError::malformed(what, format!("missing '{key}'")))
}

fn required_f64(what: &str, table: &BTreeMap<String, String>, key: &str) -> Result<f64> {
    required(what, table, key)?
        .parse()
        .map_err(|_| RtTuneError::malformed(what, format!("non-numeric '{key}'")))
}

fn required_u64(what: &str, table: &BTreeMap<String, String>, key: &str) -> Result<u64> {
    required(what, table, key)?
        .parse()
        .map_err(|_| RtTuneError::malformed(what, format!("non-numeric '{key}'")))
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::super::irq::testutil::write;
    use crate::topology::SysRoot;

    pub(crate) fn fake_kthread_files(root: &SysRoot, pid: i32, comm: &str, runtime: f64) {
        let dir = root.proc.join(pid.to_string());
        write(&dir.join("comm"), &format!("{comm}\n"));
        write(&dir.join("cpuset"), "/rt/workers\n");
        write(
            &dir.join("sched"),
            &format!(
                "{comm} ({pid}, #threads: 1)\n\
                 -------------------------------------------------------------------\n\
                 se.exec_start                                :       1234.567890\n\
                 se.sum_exec_runtime                          :       {runtime}\n\
                 se.nr_migrations                             :                 12\n\
                 nr_switches                                  :               4000\n\
                 nr_voluntary_switches                        :               3900\n\
                 nr_involuntary_switches                      :                100\n\
                 current_node=0, numa_group_id=0\n\
                 numa_faults node=0 task_private=0 task_shared=0 group_private=0 group_shared=0\n"
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::super::host::FixtureInventory;
    use super::testutil::fake_kthread_files;
    use super::*;

    #[test]
    fn test_name_parsing_irq_category() {
        let kt = KThread::from_listing(1500, "FF", "[irq/128-nvidia]").unwrap();
        assert_eq!(kt.kind, KthreadKind::Irq);
        assert_eq!(kt.irq, Some(128));
        assert_eq!(kt.cpu_index, None);
        assert_eq!(kt.sched_class, SchedClass::Fifo);
    }

    #[test]
    fn test_name_parsing_rcu_family() {
        let kt = KThread::from_listing(77, "TS", "[rcuop/3]").unwrap();
        assert_eq!(kt.kind, KthreadKind::Rcuop);
        assert_eq!(kt.cpu_index, Some(3));
        assert_eq!(kt.irq, None);
        assert_eq!(kt.sched_class, SchedClass::TimeShared);
    }

    #[test]
    fn test_name_parsing_unknown_prefix_falls_back() {
        let kt = KThread::from_listing(900, "TS", "[nv_queue/0]").unwrap();
        assert_eq!(kt.kind, KthreadKind::Other);
        assert_eq!(kt.irq, None);
        assert_eq!(kt.cpu_index, None);
    }

    #[test]
    fn test_name_without_slash_is_other() {
        let kt = KThread::from_listing(55, "TS", "[khugepaged]").unwrap();
        assert_eq!(kt.kind, KthreadKind::Other);
    }

    #[test]
    fn test_bad_irq_number_is_fatal() {
        assert!(KThread::from_listing(10, "FF", "[irq/not-a-number]").is_err());
    }

    #[test]
    fn test_unknown_sched_class() {
        let kt = KThread::from_listing(12, "RR", "[ksoftirqd/0]").unwrap();
        assert_eq!(kt.sched_class, SchedClass::Unknown);
        assert_eq!(kt.kind, KthreadKind::Ksoftirqd);
    }

    #[test]
    fn test_thread_listing_parse() {
        let rows = parse_thread_listing(
            "     12  TS [ksoftirqd/0]\n   1500  FF [irq/128-nvidia]\n",
        )
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], (12, "TS".to_string(), "[ksoftirqd/0]".to_string()));
        assert_eq!(rows[1].2, "[irq/128-nvidia]");
    }

    #[test]
    fn test_thread_listing_rejects_garbage() {
        assert!(parse_thread_listing("what is this\n").is_err());
    }

    #[test]
    fn test_refresh_parses_sched_counters() {
        let dir = tempfile::tempdir().unwrap();
        let root = SysRoot::rebased(dir.path());
        fake_kthread_files(&root, 1500, "irq/128-nvidia", 1079.943120);

        let mut kt = KThread::from_listing(1500, "FF", "[irq/128-nvidia]").unwrap();
        kt.refresh(&root).unwrap();

        assert_eq!(kt.comm, "irq/128-nvidia");
        assert_eq!(kt.cpuset_path, "rt/workers");
        assert!((kt.runtime_ms.value - 1079.943120).abs() < 1e-9);
        assert_eq!(kt.migrations.value, 12);
        assert_eq!(kt.switches.value, 4000);
        assert_eq!(kt.voluntary_switches.value, 3900);
        assert_eq!(kt.involuntary_switches.value, 100);

        // Second refresh tracks increments.
        fake_kthread_files(&root, 1500, "irq/128-nvidia", 1100.0);
        kt.refresh(&root).unwrap();
        assert!((kt.runtime_ms.delta - (1100.0 - 1079.943120)).abs() < 1e-9);
        assert_eq!(kt.migrations.delta, 0);
    }

    #[test]
    fn test_discover_skips_vanished_threads() {
        let dir = tempfile::tempdir().unwrap();
        let root = SysRoot::rebased(dir.path());
        fake_kthread_files(&root, 12, "ksoftirqd/0", 1.0);
        // pid 9999 is listed but has no proc entry.

        let inv = FixtureInventory {
            kernel_threads: "  12 TS [ksoftirqd/0]\n  9999 TS [kworker/1:1]\n".into(),
            ..Default::default()
        };
        let kthreads = discover_all(&root, &inv).unwrap();
        assert_eq!(kthreads.len(), 1);
        assert!(kthreads.contains_key(&12));
    }

    #[test]
    fn test_liveness_is_sticky() {
        // A pid that certainly does not exist.
        let mut kt = KThread::from_listing(i32::MAX - 1, "TS", "[kworker/0:0]").unwrap();
        assert!(!kt.is_alive());
        assert!(!kt.is_alive());
    }

    #[test]
    fn test_own_process_counts_alive() {
        let mut kt =
            KThread::from_listing(std::process::id() as i32, "TS", "[fake]").unwrap();
        assert!(kt.is_alive());
    }
}
