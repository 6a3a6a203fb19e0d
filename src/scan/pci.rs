//! PCI device discovery
//!
//! Walks the kernel's PCI device tree, excluding bridges and switches
//! reported by the bus-listing tool: a bridge shares its leaf device's
//! legacy interrupt number and must not be treated as an independent owner.
//! Driver names come from the bus-enumeration dump cross-checked against
//! the loaded-module list; network interface names from the per-interface
//! slot metadata.

use super::{read_first_line, HostInventory};
use crate::error::{IoResultExt, Result, RtTuneError};
use crate::topology::{NodePreference, SysRoot, Topology};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::Path;
use tracing::{debug, info};

/// How a device delivers interrupts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IrqMechanism {
    /// No interrupt line
    None,
    /// One shared legacy line
    Legacy,
    /// Message-signaled, possibly many lines
    Msi,
}

/// A PCI endpoint device
#[derive(Debug, Clone, Serialize)]
pub struct PciDevice {
    /// Canonical bus address, "0000:BB:DD.F"
    pub addr: String,
    /// Interrupt delivery mechanism
    pub mechanism: IrqMechanism,
    /// Raw interrupt numbers owned by the device
    pub irqs: Vec<u32>,
    /// CPUs local to the device
    pub local_cpus: BTreeSet<usize>,
    /// NUMA placement classified against the node partition
    pub node: NodePreference,
    /// Kernel driver module, empty when unknown
    pub driver: String,
    /// Backing network interface, if any
    pub net_iface: Option<String>,
    /// First IPv4 address of the interface
    pub ip_addr: Option<String>,
    /// Interface address sits in a private LAN range
    pub lan_facing: bool,
}

impl PartialEq for PciDevice {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for PciDevice {}

impl Hash for PciDevice {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

impl fmt::Display for PciDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PCI@{}", self.addr)?;
        if self.mechanism != IrqMechanism::None {
            write!(f, " - {} IRQs ({:?})", self.irqs.len(), self.mechanism)?;
        }
        if !self.driver.is_empty() {
            write!(f, " - mod. {}", self.driver)?;
        }
        if let Some(iface) = &self.net_iface {
            write!(f, " - net. {}/{}", iface, self.ip_addr.as_deref().unwrap_or("?"))?;
        }
        Ok(())
    }
}

/// Enumerate PCI endpoints, excluding bridges
pub fn discover_devices(
    root: &SysRoot,
    topo: &Topology,
    inv: &dyn HostInventory,
) -> Result<BTreeMap<String, PciDevice>> {
    let bridges = parse_bridge_listing(&inv.bus_listing()?)?;
    let modules = parse_loaded_modules(&inv.loaded_modules()?)?;

    let dump_path = root.proc.join("bus/pci/devices");
    let dump = fs::read_to_string(&dump_path).with_path(&dump_path)?;
    let driver_by_devfn = parse_bus_dump(&dump);

    let slot_map = interface_slot_map(root)?;
    info!(interfaces = slot_map.len(), "PCI/network slot mappings found");

    let dev_dir = root.sys.join("bus/pci/devices");
    let mut devices = BTreeMap::new();

    for entry in fs::read_dir(&dev_dir).with_path(&dev_dir)? {
        let entry = entry.with_path(&dev_dir)?;
        let addr = entry.file_name().to_string_lossy().into_owned();
        let (_domain, bus, dev, func) = parse_pci_addr(&addr)?;

        if bridges.contains(&(bus, dev)) {
            debug!(addr = %addr, "skipping PCI bridge/switch");
            continue;
        }

        let path = entry.path();
        let (mechanism, irqs) = read_interrupt_numbers(&path)?;

        let cpulist_path = path.join("local_cpulist");
        let local_cpus: BTreeSet<usize> =
            crate::affinity::parse_cpu_list(&read_first_line(&cpulist_path)?)?
                .into_iter()
                .collect();
        let node = topo.classify_cpus(&local_cpus);

        let devfn_key = format!("{:02x}{:02x}", bus, (dev << 3) | func);
        let driver = driver_by_devfn
            .get(&devfn_key)
            .filter(|m| modules.contains(*m))
            .cloned()
            .unwrap_or_default();

        let net_iface = slot_map.get(&addr).cloned();
        let (ip_addr, lan_facing) = match &net_iface {
            Some(iface) => {
                let ip = parse_interface_ipv4(&inv.interface_addr_listing(iface)?);
                let lan = ip
                    .as_deref()
                    .map(|a| a.starts_with("10.") || a.starts_with("192."))
                    .unwrap_or(false);
                (ip, lan)
            }
            None => (None, false),
        };

        let device = PciDevice {
            addr: addr.clone(),
            mechanism,
            irqs,
            local_cpus,
            node,
            driver,
            net_iface,
            ip_addr,
            lan_facing,
        };
        debug!(device = %device, "PCI device discovered");
        devices.insert(addr, device);
    }

    let named: BTreeSet<&str> = devices
        .values()
        .filter(|d| !d.driver.is_empty())
        .map(|d| d.driver.as_str())
        .collect();
    info!(
        devices = devices.len(),
        with_driver = named.len(),
        "PCI discovery complete"
    );

    Ok(devices)
}

/// Classify the interrupt mechanism and collect owned interrupt numbers
fn read_interrupt_numbers(dev_path: &Path) -> Result<(IrqMechanism, Vec<u32>)> {
    let msi_dir = dev_path.join("msi_irqs");
    if msi_dir.is_dir() {
        let mut irqs = Vec::new();
        for entry in fs::read_dir(&msi_dir).with_path(&msi_dir)? {
            let entry = entry.with_path(&msi_dir)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let irq = name.parse().map_err(|_| {
                RtTuneError::malformed(
                    msi_dir.display().to_string(),
                    format!("non-numeric MSI entry '{name}'"),
                )
            })?;
            irqs.push(irq);
        }
        irqs.sort_unstable();
        return Ok((IrqMechanism::Msi, irqs));
    }

    let irq_file = dev_path.join("irq");
    if irq_file.is_file() {
        let line = read_first_line(&irq_file)?;
        let irq = line.parse().map_err(|_| {
            RtTuneError::malformed(
                irq_file.display().to_string(),
                format!("non-numeric interrupt number '{line}'"),
            )
        })?;
        return Ok((IrqMechanism::Legacy, vec![irq]));
    }

    Ok((IrqMechanism::None, Vec::new()))
}

/// Parse a canonical "DDDD:BB:DD.F" address into its numeric parts
pub(crate) fn parse_pci_addr(addr: &str) -> Result<(u16, u8, u8, u8)> {
    let malformed = || RtTuneError::malformed(format!("PCI address '{addr}'"), "expected DDDD:BB:DD.F");

    let mut parts = addr.split(':');
    let (domain, bus, devfn) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(d), Some(b), Some(df), None) => (d, b, df),
        _ => return Err(malformed()),
    };
    let (dev, func) = devfn.split_once('.').ok_or_else(malformed)?;

    Ok((
        u16::from_str_radix(domain, 16).map_err(|_| malformed())?,
        u8::from_str_radix(bus, 16).map_err(|_| malformed())?,
        u8::from_str_radix(dev, 16).map_err(|_| malformed())?,
        u8::from_str_radix(func, 16).map_err(|_| malformed())?,
    ))
}

/// Extract (bus, device) pairs of bridges/switches from the bus listing.
///
/// Function-insensitive on purpose: any function of a bridge slot is
/// excluded along with it.
fn parse_bridge_listing(listing: &str) -> Result<BTreeSet<(u8, u8)>> {
    let mut bridges = BTreeSet::new();

    for line in listing.lines() {
        if !line.contains("PCI bridge:") {
            continue;
        }
        let token = line
            .split_whitespace()
            .next()
            .ok_or_else(|| RtTuneError::malformed("bus listing", format!("bad line '{line}'")))?;

        // Short form "BB:DD.F"; a domain prefix is tolerated.
        let fields: Vec<&str> = token.split(':').collect();
        let (bus, devfn) = match fields.as_slice() {
            [bus, devfn] => (*bus, *devfn),
            [_domain, bus, devfn] => (*bus, *devfn),
            _ => {
                return Err(RtTuneError::malformed(
                    "bus listing",
                    format!("bad address token '{token}'"),
                ))
            }
        };
        let dev = devfn.split('.').next().unwrap_or(devfn);

        let bus = u8::from_str_radix(bus, 16).map_err(|_| {
            RtTuneError::malformed("bus listing", format!("bad bus in '{token}'"))
        })?;
        let dev = u8::from_str_radix(dev, 16).map_err(|_| {
            RtTuneError::malformed("bus listing", format!("bad device in '{token}'"))
        })?;
        bridges.insert((bus, dev));
    }

    Ok(bridges)
}

/// First column of each non-header line of the module listing
fn parse_loaded_modules(listing: &str) -> Result<BTreeSet<String>> {
    Ok(listing
        .lines()
        .skip(1)
        .filter_map(|l| l.split_whitespace().next())
        .map(|s| s.to_string())
        .collect())
}

/// Bus-enumeration dump rows: devfn key in the first column, candidate
/// driver name in the last. Rows without a loaded driver leave a numeric
/// last column, filtered out later by the loaded-module cross-check.
fn parse_bus_dump(dump: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in dump.lines() {
        let mut fields = line.split_whitespace();
        let (Some(key), Some(last)) = (fields.next(), fields.last()) else {
            continue;
        };
        map.insert(key.to_ascii_lowercase(), last.to_string());
    }
    map
}

/// Reverse map from PCI slot address to interface name, from the
/// per-interface device metadata
fn interface_slot_map(root: &SysRoot) -> Result<BTreeMap<String, String>> {
    let net_dir = root.sys.join("class/net");
    let mut map = BTreeMap::new();

    let entries = match fs::read_dir(&net_dir) {
        Ok(entries) => entries,
        // No network class tree at all; nothing to map.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(map),
        Err(e) => return Err(RtTuneError::io(&net_dir, e)),
    };

    for entry in entries {
        let entry = entry.with_path(&net_dir)?;
        let iface = entry.file_name().to_string_lossy().into_owned();
        let uevent = entry.path().join("device/uevent");
        let Ok(content) = fs::read_to_string(&uevent) else {
            // Virtual interfaces carry no backing device.
            continue;
        };
        for line in content.lines() {
            if let Some(slot) = line.strip_prefix("PCI_SLOT_NAME=") {
                map.insert(slot.trim().to_string(), iface.clone());
            }
        }
    }

    Ok(map)
}

/// First IPv4 address in the interface listing, without the prefix length
fn parse_interface_ipv4(listing: &str) -> Option<String> {
    let mut tokens = listing.split_whitespace();
    while let Some(tok) = tokens.next() {
        if tok == "inet" {
            return tokens
                .next()
                .map(|cidr| cidr.split('/').next().unwrap_or(cidr).to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::super::host::FixtureInventory;
    use super::super::irq::testutil::write;
    use super::*;

    fn fake_device(
        root: &SysRoot,
        addr: &str,
        msi: Option<&[u32]>,
        legacy: Option<u32>,
        cpulist: &str,
    ) {
        let dir = root.sys.join("bus/pci/devices").join(addr);
        write(&dir.join("local_cpulist"), &format!("{cpulist}\n"));
        if let Some(irqs) = msi {
            for irq in irqs {
                write(&dir.join("msi_irqs").join(irq.to_string()), "");
            }
        } else if let Some(irq) = legacy {
            write(&dir.join("irq"), &format!("{irq}\n"));
        }
    }

    fn two_node_topology() -> Topology {
        Topology::from_parts(vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7]], vec![])
    }

    #[test]
    fn test_parse_pci_addr() {
        assert_eq!(parse_pci_addr("0000:02:00.1").unwrap(), (0, 2, 0, 1));
        assert_eq!(parse_pci_addr("0000:af:1f.7").unwrap(), (0, 0xaf, 0x1f, 7));
        assert!(parse_pci_addr("02:00.1").is_err());
        assert!(parse_pci_addr("0000:zz:00.0").is_err());
    }

    #[test]
    fn test_discovery_classifies_mechanism_and_node() {
        let dir = tempfile::tempdir().unwrap();
        let root = SysRoot::rebased(dir.path());
        fake_device(&root, "0000:02:00.0", Some(&[40, 41]), None, "0-3");
        fake_device(&root, "0000:05:00.0", None, Some(17), "4-7");
        fake_device(&root, "0000:06:00.0", None, None, "0-7");
        write(&root.proc.join("bus/pci/devices"), "0200\t10de\t0\tsomedrv\n");

        let inv = FixtureInventory {
            loaded_modules: "Module Size Used by\nsomedrv 16384 0\n".into(),
            ..Default::default()
        };
        let topo = two_node_topology();
        let devices = discover_devices(&root, &topo, &inv).unwrap();
        assert_eq!(devices.len(), 3);

        let msi = &devices["0000:02:00.0"];
        assert_eq!(msi.mechanism, IrqMechanism::Msi);
        assert_eq!(msi.irqs, vec![40, 41]);
        assert_eq!(msi.node, NodePreference::Node(0));
        assert_eq!(msi.driver, "somedrv");

        let legacy = &devices["0000:05:00.0"];
        assert_eq!(legacy.mechanism, IrqMechanism::Legacy);
        assert_eq!(legacy.irqs, vec![17]);
        assert_eq!(legacy.node, NodePreference::Node(1));
        assert_eq!(legacy.driver, "");

        let bare = &devices["0000:06:00.0"];
        assert_eq!(bare.mechanism, IrqMechanism::None);
        assert!(bare.irqs.is_empty());
        assert_eq!(bare.node, NodePreference::SpansAll);
    }

    #[test]
    fn test_bridges_are_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let root = SysRoot::rebased(dir.path());
        fake_device(&root, "0000:00:1c.0", None, Some(16), "0-7");
        fake_device(&root, "0000:02:00.0", None, Some(16), "0-3");
        write(&root.proc.join("bus/pci/devices"), "");

        let inv = FixtureInventory {
            bus_listing: "00:1c.0 PCI bridge: Intel Corporation (rev f0)\n\
                          02:00.0 Ethernet controller: Mellanox ConnectX-5\n"
                .into(),
            loaded_modules: "Module Size Used by\n".into(),
            ..Default::default()
        };
        let topo = two_node_topology();
        let devices = discover_devices(&root, &topo, &inv).unwrap();
        assert_eq!(devices.len(), 1);
        assert!(devices.contains_key("0000:02:00.0"));
    }

    #[test]
    fn test_stale_driver_not_reported_as_live() {
        let dir = tempfile::tempdir().unwrap();
        let root = SysRoot::rebased(dir.path());
        fake_device(&root, "0000:02:00.0", None, Some(17), "0-3");
        write(&root.proc.join("bus/pci/devices"), "0200\t15b3\t11\tmlx5_core\n");

        // mlx5_core is in the dump but no longer loaded.
        let inv = FixtureInventory {
            loaded_modules: "Module Size Used by\nnvme 49152 4\n".into(),
            ..Default::default()
        };
        let topo = two_node_topology();
        let devices = discover_devices(&root, &topo, &inv).unwrap();
        assert_eq!(devices["0000:02:00.0"].driver, "");
    }

    #[test]
    fn test_network_interface_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let root = SysRoot::rebased(dir.path());
        fake_device(&root, "0000:02:00.0", Some(&[40]), None, "0-3");
        write(&root.proc.join("bus/pci/devices"), "");
        write(
            &root.sys.join("class/net/enp2s0/device/uevent"),
            "DRIVER=mlx5_core\nPCI_SLOT_NAME=0000:02:00.0\n",
        );

        let mut inv = FixtureInventory {
            loaded_modules: "Module Size Used by\n".into(),
            ..Default::default()
        };
        inv.interface_addrs.insert(
            "enp2s0".into(),
            "2: enp2s0    inet 10.20.30.40/24 brd 10.20.30.255 scope global enp2s0\n".into(),
        );

        let topo = two_node_topology();
        let devices = discover_devices(&root, &topo, &inv).unwrap();
        let dev = &devices["0000:02:00.0"];
        assert_eq!(dev.net_iface.as_deref(), Some("enp2s0"));
        assert_eq!(dev.ip_addr.as_deref(), Some("10.20.30.40"));
        assert!(dev.lan_facing);
    }

    #[test]
    fn test_parse_interface_ipv4() {
        assert_eq!(
            parse_interface_ipv4("2: eth0    inet 192.168.1.5/24 brd 192.168.1.255"),
            Some("192.168.1.5".to_string())
        );
        assert_eq!(parse_interface_ipv4(""), None);
    }
}
