//! CPU bitmask codec
//!
//! Bit *i* set iff CPU *i* is a member. Machines can carry more CPUs than a
//! native word holds, so the mask is a little-endian vector of 64-bit words.
//! Kernel affinity files print the mask as comma-grouped fixed-width hex
//! chunks; writes use plain hex.

use crate::error::{Result, RtTuneError};
use serde::Serialize;

const WORD_BITS: usize = 64;
const WORD_HEX: usize = WORD_BITS / 4;

/// Arbitrary-width CPU bitmask
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct CpuMask {
    // Little-endian words, normalized (no trailing zero words).
    words: Vec<u64>,
}

impl CpuMask {
    /// The empty mask
    pub fn zero() -> Self {
        Self::default()
    }

    /// Build a mask from CPU ids
    pub fn from_cpus<I: IntoIterator<Item = usize>>(cpus: I) -> Self {
        let mut mask = Self::zero();
        for cpu in cpus {
            mask.set(cpu);
        }
        mask
    }

    /// Set the bit for one CPU
    pub fn set(&mut self, cpu: usize) {
        let word = cpu / WORD_BITS;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (cpu % WORD_BITS);
    }

    /// Check membership of one CPU
    pub fn contains(&self, cpu: usize) -> bool {
        self.words
            .get(cpu / WORD_BITS)
            .map_or(false, |w| w & (1u64 << (cpu % WORD_BITS)) != 0)
    }

    /// True if no bit is set
    pub fn is_zero(&self) -> bool {
        self.words.is_empty()
    }

    /// Expand into the ascending CPU id list
    pub fn cpus(&self) -> Vec<usize> {
        let mut out = Vec::new();
        for (wi, &word) in self.words.iter().enumerate() {
            let mut w = word;
            while w != 0 {
                let bit = w.trailing_zeros() as usize;
                out.push(wi * WORD_BITS + bit);
                w &= w - 1;
            }
        }
        out
    }

    /// The normalized little-endian word representation
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Parse a kernel hex mask, tolerating the comma-grouped chunk format
    /// used by `smp_affinity` and friends (e.g. "00000000,00000001").
    pub fn parse_hex(s: &str) -> Result<Self> {
        let hex: String = s
            .trim()
            .chars()
            .filter(|c| *c != ',' && !c.is_whitespace())
            .collect();
        if hex.is_empty() {
            return Err(RtTuneError::malformed(
                format!("hex mask '{}'", s.trim()),
                "empty mask string",
            ));
        }

        let mut words = Vec::new();
        let digits: Vec<char> = hex.chars().collect();
        let mut hi = digits.len();
        while hi > 0 {
            let lo = hi.saturating_sub(WORD_HEX);
            let chunk: String = digits[lo..hi].iter().collect();
            let word = u64::from_str_radix(&chunk, 16).map_err(|_| {
                RtTuneError::malformed(
                    format!("hex mask '{}'", s.trim()),
                    format!("invalid hex chunk '{chunk}'"),
                )
            })?;
            words.push(word);
            hi = lo;
        }

        let mut mask = Self { words };
        mask.normalize();
        Ok(mask)
    }

    /// Render as plain hex for kernel writes
    pub fn to_hex(&self) -> String {
        match self.words.split_last() {
            None => "0".to_string(),
            Some((top, rest)) => {
                let mut s = format!("{top:x}");
                for word in rest.iter().rev() {
                    s.push_str(&format!("{word:016x}"));
                }
                s
            }
        }
    }

    fn normalize(&mut self) {
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }
}

impl From<u64> for CpuMask {
    fn from(word: u64) -> Self {
        let mut mask = Self { words: vec![word] };
        mask.normalize();
        mask
    }
}
