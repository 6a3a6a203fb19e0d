//! Interrupt counter table parser
//!
//! The kernel's counter table: a header row naming per-CPU columns, then
//! one row per interrupt name with cumulative counts. Rows one field wider
//! than the column count carry a trailing device-type column.

use crate::error::{IoResultExt, Result, RtTuneError};
use crate::topology::SysRoot;
use std::collections::BTreeMap;
use std::fs;

/// One row of the counter table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptRow {
    /// Per-CPU cumulative counts, one per column present
    pub counts: Vec<u64>,
    /// Trailing device/type text, when the row carries one
    pub device_type: Option<String>,
}

/// A parsed snapshot of the counter table, keyed by interrupt name
#[derive(Debug, Clone)]
pub struct InterruptSnapshot {
    /// Number of per-CPU columns in the header
    pub cpu_count: usize,
    /// Rows keyed by interrupt name ("42", "NMI", ...)
    pub rows: BTreeMap<String, InterruptRow>,
}

/// Read and parse the live counter table
pub fn read_interrupts(root: &SysRoot) -> Result<InterruptSnapshot> {
    let path = root.proc.join("interrupts");
    let text = fs::read_to_string(&path).with_path(&path)?;
    parse_interrupts(&text)
}

/// Parse the counter table text
pub fn parse_interrupts(text: &str) -> Result<InterruptSnapshot> {
    let what = "interrupt counter table";
    let mut lines = text.lines();

    let header = lines
        .next()
        .ok_or_else(|| RtTuneError::malformed(what, "empty table"))?;
    let cpu_names: Vec<&str> = header.split_whitespace().collect();
    if cpu_names.is_empty() || !cpu_names[0].starts_with("CPU") {
        return Err(RtTuneError::malformed(
            what,
            "unable to determine number of CPUs from header",
        ));
    }
    let cpu_count = cpu_names.len();

    let mut rows = BTreeMap::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let parts = split_columns(line, cpu_count + 1);
        if parts.len() < 2 {
            return Err(RtTuneError::malformed(what, format!("bad row '{line}'")));
        }

        let name = parts[0].trim_end_matches(':').to_string();

        let (count_fields, device_type) = if parts.len() == cpu_count + 2 {
            (
                &parts[1..parts.len() - 1],
                Some(parts[parts.len() - 1].to_string()),
            )
        } else {
            (&parts[1..], None)
        };

        let mut counts = Vec::with_capacity(count_fields.len().min(cpu_count));
        for field in count_fields.iter().take(cpu_count) {
            let count = field.parse().map_err(|_| {
                RtTuneError::malformed(what, format!("non-numeric count '{field}' in '{line}'"))
            })?;
            counts.push(count);
        }

        rows.insert(name, InterruptRow { counts, device_type });
    }

    if rows.is_empty() {
        return Err(RtTuneError::malformed(what, "no data rows"));
    }

    Ok(InterruptSnapshot { cpu_count, rows })
}

/// Whitespace split with at most `maxsplit` leading fields; whatever
/// follows is kept intact as one trailing field.
fn split_columns(line: &str, maxsplit: usize) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = line.trim_start();

    while out.len() < maxsplit && !rest.is_empty() {
        match rest.find(char::is_whitespace) {
            Some(idx) => {
                out.push(&rest[..idx]);
                rest = rest[idx..].trim_start();
            }
            None => {
                out.push(rest);
                rest = "";
            }
        }
    }

    let rest = rest.trim_end();
    if !rest.is_empty() {
        out.push(rest);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
            CPU0       CPU1       CPU2       CPU3
  42:       1000        200          0          0  IR-PCI-MSI 524288-edge  enp2s0-TxRx-0
  43:          0          0         17          0  IR-PCI-MSI 524289-edge  enp2s0-TxRx-1
 NMI:          5          5          4          6  Non-maskable interrupts
 ERR:          3
";

    #[test]
    fn test_parse_full_rows() {
        let snap = parse_interrupts(TABLE).unwrap();
        assert_eq!(snap.cpu_count, 4);

        let row = &snap.rows["42"];
        assert_eq!(row.counts, vec![1000, 200, 0, 0]);
        assert_eq!(
            row.device_type.as_deref(),
            Some("IR-PCI-MSI 524288-edge  enp2s0-TxRx-0")
        );

        let nmi = &snap.rows["NMI"];
        assert_eq!(nmi.counts, vec![5, 5, 4, 6]);
        assert_eq!(nmi.device_type.as_deref(), Some("Non-maskable interrupts"));
    }

    #[test]
    fn test_parse_short_row_has_no_device_type() {
        let snap = parse_interrupts(TABLE).unwrap();
        let err_row = &snap.rows["ERR"];
        assert_eq!(err_row.counts, vec![3]);
        assert_eq!(err_row.device_type, None);
    }

    #[test]
    fn test_bad_header_is_fatal() {
        assert!(parse_interrupts("").is_err());
        assert!(parse_interrupts("not a header\n 42: 1 2\n").is_err());
    }

    #[test]
    fn test_non_numeric_count_is_fatal() {
        let text = "  CPU0  CPU1\n 42:  12  x\n";
        assert!(matches!(
            parse_interrupts(text),
            Err(RtTuneError::MalformedInput { .. })
        ));
    }

    #[test]
    fn test_empty_body_is_fatal() {
        assert!(parse_interrupts("  CPU0  CPU1\n").is_err());
    }

    #[test]
    fn test_split_columns_keeps_remainder() {
        assert_eq!(
            split_columns("a b c d  e   f", 3),
            vec!["a", "b", "c", "d  e   f"]
        );
        assert_eq!(split_columns("  a  ", 3), vec!["a"]);
    }
}
