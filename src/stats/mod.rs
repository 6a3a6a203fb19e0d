//! Per-IRQ interrupt-rate sampling
//!
//! Consumes periodic counter-table snapshots and derives per-CPU rates for
//! a tracked set of IRQ ids. Independent of correlation and binding; the
//! only input from discovery is the id set.

use crate::scan::InterruptSnapshot;
use crate::error::{Result, RtTuneError};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Rate state for one tracked IRQ
#[derive(Debug, Clone, Serialize)]
struct IrqCounters {
    counts: Vec<u64>,
    rates: Vec<f64>,
    last_time: f64,
    has_baseline: bool,
}

/// Derives per-CPU interrupt rates from cumulative count snapshots
#[derive(Debug, Serialize)]
pub struct StatsSampler {
    cpu_count: usize,
    tracked: BTreeMap<u32, IrqCounters>,
}

impl StatsSampler {
    /// Track the given IRQ ids over tables with `cpu_count` columns
    pub fn new<I: IntoIterator<Item = u32>>(irq_ids: I, cpu_count: usize) -> Self {
        let tracked = irq_ids
            .into_iter()
            .map(|id| {
                (
                    id,
                    IrqCounters {
                        counts: vec![0; cpu_count],
                        rates: vec![0.0; cpu_count],
                        last_time: 0.0,
                        has_baseline: false,
                    },
                )
            })
            .collect();
        Self { cpu_count, tracked }
    }

    /// Ingest one snapshot taken at `now` (seconds on any monotonic clock).
    ///
    /// Tracked IRQs present in the snapshot get fresh rates; the first
    /// sample for an IRQ only establishes its baseline. Tracked IRQs
    /// absent from the snapshot keep their last known rates; snapshot
    /// names nobody tracks are ignored.
    pub fn ingest(&mut self, now: f64, snapshot: &InterruptSnapshot) -> Result<()> {
        for (id, state) in self.tracked.iter_mut() {
            let Some(row) = snapshot.rows.get(&id.to_string()) else {
                continue;
            };
            if row.counts.len() != self.cpu_count {
                return Err(RtTuneError::malformed(
                    "interrupt counter table",
                    format!(
                        "IRQ {id} row has {} counts, expected {}",
                        row.counts.len(),
                        self.cpu_count
                    ),
                ));
            }

            if state.has_baseline {
                let dt = now - state.last_time;
                if dt > 0.0 {
                    for (rate, (new, old)) in state
                        .rates
                        .iter_mut()
                        .zip(row.counts.iter().zip(state.counts.iter()))
                    {
                        *rate = new.saturating_sub(*old) as f64 / dt;
                    }
                }
            } else {
                debug!(irq = id, "baseline sample, no rate yet");
            }

            state.counts.copy_from_slice(&row.counts);
            state.last_time = now;
            state.has_baseline = true;
        }

        Ok(())
    }

    /// Per-CPU rates for one IRQ; all-zero until a second sample arrives
    pub fn rates(&self, irq: u32) -> Option<&[f64]> {
        self.tracked
            .get(&irq)
            .filter(|s| s.has_baseline)
            .map(|s| s.rates.as_slice())
    }

    /// Summed rate across CPUs for one IRQ, zero until rates exist
    pub fn total_rate(&self, irq: u32) -> f64 {
        self.rates(irq).map(|r| r.iter().sum()).unwrap_or(0.0)
    }

    /// Tracked IRQ ids with their summed rates, fastest first
    pub fn fastest(&self) -> Vec<(u32, f64)> {
        let mut out: Vec<(u32, f64)> = self
            .tracked
            .keys()
            .map(|&id| (id, self.total_rate(id)))
            .collect();
        out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::interrupts::parse_interrupts;

    fn snapshot(rows: &[(&str, &[u64])]) -> InterruptSnapshot {
        let cpu_count = rows.iter().map(|(_, c)| c.len()).max().unwrap_or(1);
        let header: String = (0..cpu_count)
            .map(|i| format!("  CPU{i}"))
            .collect::<String>();
        let mut text = format!("{header}\n");
        for (name, counts) in rows {
            text.push_str(&format!(
                " {name}: {}\n",
                counts
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
            ));
        }
        parse_interrupts(&text).unwrap()
    }

    #[test]
    fn test_rate_computation() {
        let mut sampler = StatsSampler::new([42], 1);
        sampler.ingest(0.0, &snapshot(&[("42", &[100])])).unwrap();
        // First sample establishes the baseline only.
        assert_eq!(sampler.rates(42).map(|r| r.to_vec()), Some(vec![0.0]));

        sampler.ingest(10.0, &snapshot(&[("42", &[150])])).unwrap();
        assert_eq!(sampler.rates(42).unwrap(), &[5.0]);
        assert!((sampler.total_rate(42) - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_first_sample_produces_no_rate_artifacts() {
        let mut sampler = StatsSampler::new([7], 2);
        sampler
            .ingest(100.0, &snapshot(&[("7", &[123456, 99999])]))
            .unwrap();
        // Huge initial counts must not become a rate.
        assert_eq!(sampler.rates(7).unwrap(), &[0.0, 0.0]);
    }

    #[test]
    fn test_untracked_names_ignored_and_absent_keep_rates() {
        let mut sampler = StatsSampler::new([42], 1);
        sampler
            .ingest(0.0, &snapshot(&[("42", &[0]), ("NMI", &[5])]))
            .unwrap();
        sampler.ingest(2.0, &snapshot(&[("42", &[20])])).unwrap();
        assert_eq!(sampler.rates(42).unwrap(), &[10.0]);

        // 42 missing from the next snapshot: last rate survives.
        sampler.ingest(4.0, &snapshot(&[("NMI", &[9])])).unwrap();
        assert_eq!(sampler.rates(42).unwrap(), &[10.0]);
        assert_eq!(sampler.rates(99), None);
    }

    #[test]
    fn test_fastest_ordering() {
        let mut sampler = StatsSampler::new([1, 2], 1);
        sampler
            .ingest(0.0, &snapshot(&[("1", &[0]), ("2", &[0])]))
            .unwrap();
        sampler
            .ingest(1.0, &snapshot(&[("1", &[5]), ("2", &[50])]))
            .unwrap();
        let fastest = sampler.fastest();
        assert_eq!(fastest[0].0, 2);
        assert_eq!(fastest[1].0, 1);
    }

    #[test]
    fn test_row_width_mismatch_is_fatal() {
        let mut sampler = StatsSampler::new([42], 4);
        let snap = snapshot(&[("42", &[1, 2])]);
        assert!(sampler.ingest(1.0, &snap).is_err());
    }
}
