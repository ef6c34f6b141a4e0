//! HyperLogLog cardinality sketch.
//!
//! `m = 2^p` byte-wide registers hold the maximum rank (leading-zero count
//! plus one) observed for hashes routed to them. The estimator applies the
//! classical bias corrections: linear counting in the small range and
//! 64-bit hash-space saturation in the large range.

use crate::error::{Error, Result};
use crate::hash::{hash64, HashConfig};
use crate::pipeline::StreamSketch;

pub const MIN_PRECISION: u8 = 4;
pub const MAX_PRECISION: u8 = 20;

/// 2^64 as f64, the hash-space size for the large-range correction.
const TWO_POW_64: f64 = 18_446_744_073_709_551_616.0;

pub struct Sketch {
    p: u8,
    registers: Vec<u8>,
    hash: HashConfig,
}

impl Sketch {
    /// Construct with `m = 2^p` zeroed registers, `p` in `[4, 20]`.
    pub fn by_precision(p: u8, hash: HashConfig) -> Result<Self> {
        if !(MIN_PRECISION..=MAX_PRECISION).contains(&p) {
            return Err(Error::InvalidArgument("hll precision must be in [4, 20]"));
        }
        Ok(Self { p, registers: vec![0; 1 << p], hash })
    }

    /// Observe one record. Registers are monotone: an add never lowers one.
    pub fn add(&mut self, x: &[u8]) {
        let h = hash64(x, &self.hash);
        let idx = (h >> (64 - self.p)) as usize & (self.m() - 1);
        let rank = rho(h, self.p);
        let cell = &mut self.registers[idx];
        if rank > *cell {
            *cell = rank;
        }
    }

    /// Estimated number of distinct records observed.
    pub fn estimate(&self) -> f64 {
        let m = self.m() as f64;
        let mut sum = 0.0;
        let mut zeros = 0usize;
        for &v in &self.registers {
            if v == 0 {
                zeros += 1;
            }
            sum += 1.0 / (1u64 << v) as f64;
        }
        let raw = alpha(self.m()) * m * m / sum;
        if raw <= 2.5 * m && zeros > 0 {
            // Linear counting is more accurate while registers are sparse.
            m * (m / zeros as f64).ln()
        } else if raw > TWO_POW_64 / 30.0 {
            -TWO_POW_64 * (1.0 - raw / TWO_POW_64).ln()
        } else {
            raw
        }
    }

    /// Element-wise register max; requires identical p and hash config.
    pub fn merge_from(&mut self, other: &Self) -> Result<()> {
        if self.p != other.p || self.hash != other.hash {
            return Err(Error::InvalidArgument(
                "hll merge requires identical precision and hash config",
            ));
        }
        for (reg, o) in self.registers.iter_mut().zip(&other.registers) {
            if *o > *reg {
                *reg = *o;
            }
        }
        Ok(())
    }

    /// Zero all registers, keeping precision and hash config.
    pub fn clear(&mut self) {
        self.registers.fill(0);
    }

    pub fn precision(&self) -> u8 {
        self.p
    }

    pub fn m(&self) -> usize {
        1 << self.p
    }

    pub fn hash_config(&self) -> HashConfig {
        self.hash
    }

    #[cfg(test)]
    fn registers(&self) -> &[u8] {
        &self.registers
    }
}

impl StreamSketch for Sketch {
    fn ingest(&mut self, record: &[u8]) -> Result<()> {
        self.add(record);
        Ok(())
    }

    fn merge_from(&mut self, other: &Self) -> Result<()> {
        Sketch::merge_from(self, other)
    }

    fn reset(&mut self) {
        self.clear();
    }
}

/// Rank of a hash for precision `p`: leading zeros of the hash with its
/// index bits shifted out (a guard bit keeps the all-zero case finite),
/// plus one, capped at `64 - p + 1`.
#[inline]
fn rho(h: u64, p: u8) -> u8 {
    let tail = (h << p) | (1u64 << (p - 1));
    let rank = tail.leading_zeros() as u8 + 1;
    rank.min(64 - p + 1)
}

/// Parameter for bias correction
#[inline]
fn alpha(m: usize) -> f64 {
    match m {
        16 => 0.673,
        32 => 0.697,
        64 => 0.709,
        _ => 0.7213 / (1.0 + 1.079 / (m as f64)),
    }
}
