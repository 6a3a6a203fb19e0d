//! Range-notation codec
//!
//! The kernel's cpulist format: comma-separated ascending tokens, each a
//! single integer or an inclusive "low-high" pair. The empty string denotes
//! the empty set. Serialization coalesces maximal consecutive runs and is
//! the exact inverse of parsing for any sorted-unique input.

use crate::error::{Result, RtTuneError};

/// Parse kernel range notation into a CPU id list.
///
/// The output preserves token order; callers needing a canonical set should
/// normalize through [`CpuSpec`](super::CpuSpec).
pub fn parse_cpu_list(s: &str) -> Result<Vec<usize>> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(Vec::new());
    }

    let mut cpus = Vec::new();
    for token in s.split(',') {
        let token = token.trim();
        match token.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = parse_int(s, lo)?;
                let hi: usize = parse_int(s, hi)?;
                if lo > hi {
                    return Err(RtTuneError::malformed(
                        format!("cpu list '{s}'"),
                        format!("descending range '{token}'"),
                    ));
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(parse_int(s, token)?),
        }
    }

    Ok(cpus)
}

fn parse_int(input: &str, token: &str) -> Result<usize> {
    token.parse().map_err(|_| {
        RtTuneError::malformed(
            format!("cpu list '{input}'"),
            format!("invalid token '{token}'"),
        )
    })
}

/// Serialize a CPU id list into kernel range notation.
///
/// Input order does not matter; duplicates collapse. Consecutive runs of
/// length two or more become "low-high" tokens.
pub fn format_cpu_list(cpus: &[usize]) -> String {
    let mut sorted = cpus.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut out = String::new();
    let mut run: Option<(usize, usize)> = None;

    for &cpu in &sorted {
        match run {
            Some((lo, hi)) if cpu == hi + 1 => run = Some((lo, cpu)),
            Some(r) => {
                flush_run(&mut out, r);
                run = Some((cpu, cpu));
            }
            None => run = Some((cpu, cpu)),
        }
    }
    if let Some(r) = run {
        flush_run(&mut out, r);
    }

    out
}

fn flush_run(out: &mut String, (lo, hi): (usize, usize)) {
    if !out.is_empty() {
        out.push(',');
    }
    if lo == hi {
        out.push_str(&lo.to_string());
    } else {
        out.push_str(&format!("{lo}-{hi}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_basic() {
        assert_eq!(parse_cpu_list("0-3").unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpu_list("0,2,4").unwrap(), vec![0, 2, 4]);
        assert_eq!(parse_cpu_list("0-2,4-6").unwrap(), vec![0, 1, 2, 4, 5, 6]);
        assert_eq!(parse_cpu_list("7").unwrap(), vec![7]);
    }

    #[test]
    fn test_empty_round_trip() {
        assert_eq!(parse_cpu_list("").unwrap(), Vec::<usize>::new());
        assert_eq!(format_cpu_list(&[]), "");
    }

    #[test]
    fn test_format_coalesces_runs() {
        assert_eq!(format_cpu_list(&[0, 1, 2, 5, 7, 8, 9]), "0-2,5,7-9");
        assert_eq!(parse_cpu_list("0-2,5,7-9").unwrap(), vec![0, 1, 2, 5, 7, 8, 9]);
        assert_eq!(format_cpu_list(&[4]), "4");
        assert_eq!(format_cpu_list(&[1, 2]), "1-2");
    }

    #[test]
    fn test_format_normalizes_unsorted_input() {
        assert_eq!(format_cpu_list(&[9, 7, 8, 0, 2, 1, 5]), "0-2,5,7-9");
        assert_eq!(format_cpu_list(&[3, 3, 3]), "3");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_cpu_list("0-").is_err());
        assert!(parse_cpu_list("a,b").is_err());
        assert!(parse_cpu_list("5-2").is_err());
        assert!(parse_cpu_list("1,,2").is_err());
    }

    proptest! {
        #[test]
        fn round_trip_sorted_unique(cpus in proptest::collection::btree_set(0usize..512, 0..64)) {
            let list: Vec<usize> = cpus.into_iter().collect();
            let notation = format_cpu_list(&list);
            prop_assert_eq!(parse_cpu_list(&notation).unwrap(), list);
        }
    }
}
