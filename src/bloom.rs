//! Bloom filter: approximate membership with no false negatives.
//!
//! Probes are derived by double hashing: two independent 64-bit hashes
//! `h1`, `h2` (second seed = first seed xor the golden gamma, forced odd)
//! yield the i-th bit index `(h1 + i * h2) mod m`.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::hash::{hash64, HashConfig, GOLDEN_GAMMA};
use crate::pipeline::StreamSketch;

/// Default insertion-count hint for [`Filter::by_fp`].
const DEFAULT_CAPACITY_HINT: usize = 100_000;
/// Hash count used when sizing from a byte budget.
const DEFAULT_K: u8 = 7;
/// A byte budget below one 64-bit word is unusable.
const MIN_BYTES: usize = 8;

/// Word-packed Bloom filter.
pub struct Filter {
    words: Vec<u64>,
    m_bits: usize,
    k: u8,
    hash: HashConfig,
}

impl Filter {
    /// Size for a target false-positive rate `p` at the default capacity
    /// hint of 100 000 insertions.
    pub fn by_fp(p: f64, hash: HashConfig) -> Result<Self> {
        Self::by_fp_with_capacity(p, DEFAULT_CAPACITY_HINT, hash)
    }

    /// Size for false-positive rate `p` at an expected `capacity_hint`
    /// insertions: `k = round(-ln p / ln 2)` clamped to [1, 32],
    /// `m = ceil(n * -ln p / ln^2 2)` rounded up to a word multiple.
    pub fn by_fp_with_capacity(p: f64, capacity_hint: usize, hash: HashConfig) -> Result<Self> {
        if !(p > 0.0 && p < 1.0) {
            return Err(Error::InvalidArgument("false-positive rate must be in (0, 1)"));
        }
        if capacity_hint == 0 {
            return Err(Error::InvalidArgument("capacity hint must be > 0"));
        }
        let ln2 = std::f64::consts::LN_2;
        let k = (-p.ln() / ln2).clamp(1.0, 32.0).round() as u8;
        let bits_per_item = -p.ln() / (ln2 * ln2);
        let m_bits = (bits_per_item * capacity_hint as f64).ceil() as usize;
        let words = m_bits.div_ceil(64).max(1);
        Ok(Self { words: vec![0; words], m_bits: words * 64, k, hash })
    }

    /// Size from a byte budget; `k` fixed at 7.
    pub fn by_mem(bytes: usize, hash: HashConfig) -> Result<Self> {
        if bytes < MIN_BYTES {
            return Err(Error::InvalidArgument("memory budget must be at least 8 bytes"));
        }
        let words = bytes / 8;
        Ok(Self { words: vec![0; words], m_bits: words * 64, k: DEFAULT_K, hash })
    }

    #[inline]
    fn probe_pair(&self, x: &[u8]) -> (u64, u64) {
        let h1 = hash64(x, &self.hash);
        let cfg2 = self.hash.with_seed(self.hash.seed ^ GOLDEN_GAMMA);
        // Odd step avoids short probe cycles when m shares factors with h2.
        let h2 = hash64(x, &cfg2) | 1;
        (h1, h2)
    }

    #[inline]
    fn bit_at(&self, h1: u64, h2: u64, i: u64) -> usize {
        (h1.wrapping_add(i.wrapping_mul(h2)) % self.m_bits as u64) as usize
    }

    /// Record `x` as a member.
    pub fn add(&mut self, x: &[u8]) {
        let (h1, h2) = self.probe_pair(x);
        for i in 0..u64::from(self.k) {
            let bit = self.bit_at(h1, h2, i);
            self.words[bit >> 6] |= 1 << (bit & 63);
        }
    }

    /// `false` means definitely absent; `true` may be a false positive.
    pub fn might_contain(&self, x: &[u8]) -> bool {
        let (h1, h2) = self.probe_pair(x);
        for i in 0..u64::from(self.k) {
            let bit = self.bit_at(h1, h2, i);
            if self.words[bit >> 6] & (1 << (bit & 63)) == 0 {
                return false;
            }
        }
        true
    }

    /// Union `other` into `self`; requires identical m, k, and hash config.
    pub fn merge_from(&mut self, other: &Self) -> Result<()> {
        if self.m_bits != other.m_bits || self.k != other.k || self.hash != other.hash {
            return Err(Error::InvalidArgument(
                "bloom merge requires identical size, hash count, and hash config",
            ));
        }
        for (word, o) in self.words.iter_mut().zip(&other.words) {
            *word |= o;
        }
        Ok(())
    }

    /// Forget all members, keeping the sizing and hash config.
    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    pub fn bit_size(&self) -> usize {
        self.m_bits
    }

    pub fn hashes(&self) -> u8 {
        self.k
    }

    pub fn hash_config(&self) -> HashConfig {
        self.hash
    }
}

impl StreamSketch for Filter {
    fn ingest(&mut self, record: &[u8]) -> Result<()> {
        self.add(record);
        Ok(())
    }

    fn merge_from(&mut self, other: &Self) -> Result<()> {
        Filter::merge_from(self, other)
    }

    fn reset(&mut self) {
        self.clear();
    }
}

/// Streaming dedup over a sharded filter: unseen records pass through to a
/// line-locked writer, duplicates (and Bloom false positives) are dropped.
///
/// Each pipeline shard owns one `Dedup`; content sharding routes identical
/// records to the same shard, so per-shard membership implies global
/// membership up to the filter's false-positive rate.
pub struct Dedup<W> {
    filter: Filter,
    out: Arc<Mutex<W>>,
    seen: u64,
    passed: u64,
}

impl<W: Write + Send> Dedup<W> {
    pub fn new(filter: Filter, out: Arc<Mutex<W>>) -> Self {
        Self { filter, out, seen: 0, passed: 0 }
    }

    /// Records observed by this shard.
    pub fn seen(&self) -> u64 {
        self.seen
    }

    /// Records written through as first occurrences.
    pub fn passed(&self) -> u64 {
        self.passed
    }
}

impl<W: Write + Send> StreamSketch for Dedup<W> {
    fn ingest(&mut self, record: &[u8]) -> Result<()> {
        self.seen += 1;
        if self.filter.might_contain(record) {
            return Ok(());
        }
        self.filter.add(record);
        // Whole line under one lock; partial interleaving is a defect.
        let mut out = self.out.lock();
        out.write_all(record)?;
        out.write_all(b"\n")?;
        self.passed += 1;
        Ok(())
    }

    fn merge_from(&mut self, other: &Self) -> Result<()> {
        self.filter.merge_from(&other.filter)?;
        self.seen += other.seen;
        self.passed += other.passed;
        Ok(())
    }

    fn reset(&mut self) {
        self.filter.clear();
        self.seen = 0;
        self.passed = 0;
    }
}
