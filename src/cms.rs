//! Count-Min sketch: additive frequency estimation with one-sided error.
//!
//! A depth × width table of saturating `u64` counters; each row hashes the
//! key under a row-specific seed (base seed xor a golden-gamma multiple).
//! The point estimate is the minimum over rows, which never undercounts.
//!
//! Top-k is an optional bounded candidate set in the Space-Saving style:
//! keys touch their candidate entry on every increment, and a full set
//! evicts its minimum only for a newcomer whose estimate beats it.

use hashbrown::HashMap;

use crate::error::{Error, Result};
use crate::hash::{hash64, HashConfig, GOLDEN_GAMMA};
use crate::pipeline::StreamSketch;

/// Candidate slots kept per requested top-k entry.
const CANDIDATE_OVERPROVISION: usize = 8;

/// One heavy-hitter candidate: key bytes and its point estimate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopEntry {
    pub key: Vec<u8>,
    pub estimate: u64,
}

pub struct Sketch {
    depth: usize,
    width: usize,
    table: Vec<u64>,
    hash: HashConfig,
    candidates: Option<Candidates>,
    saturated: bool,
}

struct Candidates {
    cap: usize,
    entries: HashMap<Vec<u8>, u64>,
}

impl Sketch {
    /// Size for additive error `eps * N` at confidence `1 - delta`:
    /// `w = ceil(e / eps)`, `d = ceil(ln(1 / delta))`.
    pub fn by_eps_delta(eps: f64, delta: f64, hash: HashConfig) -> Result<Self> {
        if !(eps > 0.0 && eps < 1.0) || !(delta > 0.0 && delta < 1.0) {
            return Err(Error::InvalidArgument("eps and delta must be in (0, 1)"));
        }
        let width = (std::f64::consts::E / eps).ceil() as usize;
        let depth = (1.0 / delta).ln().ceil() as usize;
        if depth == 0 || width == 0 {
            return Err(Error::InvalidArgument("eps/delta produce an empty table"));
        }
        Ok(Self {
            depth,
            width,
            table: vec![0; depth * width],
            hash,
            candidates: None,
            saturated: false,
        })
    }

    /// Enable heavy-hitter tracking for `top_k(k)` queries.
    pub fn track_top(mut self, k: usize) -> Self {
        let cap = k.max(1) * CANDIDATE_OVERPROVISION;
        self.candidates = Some(Candidates { cap, entries: HashMap::with_capacity(cap) });
        self
    }

    #[inline]
    fn row_column(&self, x: &[u8], row: usize) -> usize {
        let cfg = self
            .hash
            .with_seed(self.hash.seed ^ GOLDEN_GAMMA.wrapping_mul(row as u64 + 1));
        (hash64(x, &cfg) % self.width as u64) as usize
    }

    /// Add `c` occurrences of `x`. Counters saturate instead of wrapping;
    /// the first clamp sets the sticky [`saturated`](Self::saturated) flag.
    pub fn inc(&mut self, x: &[u8], c: u64) {
        let mut est = u64::MAX;
        for row in 0..self.depth {
            let idx = row * self.width + self.row_column(x, row);
            let cell = &mut self.table[idx];
            let (sum, clamped) = saturating_add(*cell, c);
            *cell = sum;
            self.saturated |= clamped;
            est = est.min(sum);
        }
        if let Some(cand) = &mut self.candidates {
            cand.offer(x, est);
        }
    }

    /// Point estimate for `x`; an upper bound on its true count.
    pub fn estimate(&self, x: &[u8]) -> u64 {
        (0..self.depth)
            .map(|row| self.table[row * self.width + self.row_column(x, row)])
            .min()
            .unwrap_or(0)
    }

    /// Best `k` candidates by estimate, ties broken by key order. Empty
    /// unless tracking was enabled with [`track_top`](Self::track_top).
    pub fn top_k(&self, k: usize) -> Vec<TopEntry> {
        let Some(cand) = &self.candidates else {
            return Vec::new();
        };
        let mut entries: Vec<TopEntry> = cand
            .entries
            .iter()
            .map(|(key, &estimate)| TopEntry { key: key.clone(), estimate })
            .collect();
        entries.sort_unstable_by(|a, b| b.estimate.cmp(&a.estimate).then_with(|| a.key.cmp(&b.key)));
        entries.truncate(k);
        entries
    }

    /// Element-wise counter addition; requires identical dimensions and
    /// hash config. Candidate sets are unioned and re-estimated against
    /// the merged table.
    ///
    /// Unlike [`inc`](Self::inc), a merge that would wrap a counter fails
    /// with [`Error::Overflow`] before touching `self`.
    pub fn merge_from(&mut self, other: &Self) -> Result<()> {
        if self.depth != other.depth || self.width != other.width || self.hash != other.hash {
            return Err(Error::InvalidArgument(
                "cms merge requires identical dimensions and hash config",
            ));
        }
        if self
            .table
            .iter()
            .zip(&other.table)
            .any(|(cell, o)| cell.checked_add(*o).is_none())
        {
            return Err(Error::Overflow("cms merge would wrap a counter"));
        }
        for (cell, o) in self.table.iter_mut().zip(&other.table) {
            *cell += *o;
        }
        self.saturated |= other.saturated;

        if self.candidates.is_some() {
            let mut keys: Vec<Vec<u8>> = Vec::new();
            if let Some(cand) = &self.candidates {
                keys.extend(cand.entries.keys().cloned());
            }
            if let Some(other_cand) = &other.candidates {
                keys.extend(other_cand.entries.keys().cloned());
            }
            keys.sort_unstable();
            keys.dedup();
            let mut rescored: Vec<(Vec<u8>, u64)> = keys
                .into_iter()
                .map(|key| {
                    let est = self.estimate(&key);
                    (key, est)
                })
                .collect();
            rescored.sort_unstable_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            if let Some(cand) = &mut self.candidates {
                rescored.truncate(cand.cap);
                cand.entries = rescored.into_iter().collect();
            }
        }
        Ok(())
    }

    /// Zero the table and forget candidates, keeping the sizing, hash
    /// config, and tracking capacity.
    pub fn clear(&mut self) {
        self.table.fill(0);
        self.saturated = false;
        if let Some(cand) = &mut self.candidates {
            cand.entries.clear();
        }
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.depth, self.width)
    }

    pub fn hash_config(&self) -> HashConfig {
        self.hash
    }

    /// Whether any counter has clamped at `u64::MAX`.
    pub fn saturated(&self) -> bool {
        self.saturated
    }
}

impl StreamSketch for Sketch {
    fn ingest(&mut self, record: &[u8]) -> Result<()> {
        self.inc(record, 1);
        Ok(())
    }

    fn merge_from(&mut self, other: &Self) -> Result<()> {
        Sketch::merge_from(self, other)
    }

    fn reset(&mut self) {
        self.clear();
    }
}

impl Candidates {
    fn offer(&mut self, key: &[u8], est: u64) {
        if let Some(entry) = self.entries.get_mut(key) {
            *entry = (*entry).max(est);
            return;
        }
        if self.entries.len() < self.cap {
            self.entries.insert(key.to_vec(), est);
            return;
        }
        // Evict the weakest candidate only if the newcomer beats it.
        let weakest = self
            .entries
            .iter()
            .min_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(k, &v)| (k.clone(), v));
        if let Some((weak_key, weak_est)) = weakest {
            if est > weak_est {
                self.entries.remove(&weak_key);
                self.entries.insert(key.to_vec(), est);
            }
        }
    }
}

#[inline]
fn saturating_add(a: u64, b: u64) -> (u64, bool) {
    match a.checked_add(b) {
        Some(sum) => (sum, false),
        None => (u64::MAX, true),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use test_case::test_case;

    use super::*;

    #[test_case(0.0, 0.1)]
    #[test_case(1.0, 0.1)]
    #[test_case(0.1, 0.0)]
    #[test_case(0.1, 1.0)]
    #[test_case(-0.1, 0.5)]
    fn rejects_out_of_range_bounds(eps: f64, delta: f64) {
        assert!(Sketch::by_eps_delta(eps, delta, HashConfig::default()).is_err());
    }

    #[test]
    fn dims_follow_theory() {
        let sk = Sketch::by_eps_delta(1e-3, 1e-4, HashConfig::default()).unwrap();
        let (depth, width) = sk.dims();
        assert_eq!(width, 2719); // ceil(e / 1e-3)
        assert_eq!(depth, 10); // ceil(ln(1e4))
    }

    #[test]
    fn never_underestimates() {
        let mut sk = Sketch::by_eps_delta(0.01, 0.01, HashConfig::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let mut truth: StdHashMap<u8, u64> = StdHashMap::new();
        for _ in 0..50_000 {
            let key = [rng.gen_range(0u8..50)];
            sk.inc(&key, 1);
            *truth.entry(key[0]).or_default() += 1;
        }
        for (key, count) in truth {
            assert!(sk.estimate(&[key]) >= count);
        }
    }

    #[test]
    fn overestimate_is_bounded() {
        let eps = 0.001;
        let mut sk = Sketch::by_eps_delta(eps, 0.01, HashConfig::default()).unwrap();
        let n = 100_000u64;
        let mut rng = StdRng::seed_from_u64(13);
        for _ in 0..n {
            sk.inc(&rng.gen::<[u8; 8]>(), 1);
        }
        // An absent key's estimate is pure noise, bounded by eps * N with
        // probability 1 - delta; use a few fresh keys.
        for probe in 0..5u64 {
            let est = sk.estimate(format!("absent-{probe}").as_bytes());
            assert!(est <= (eps * n as f64 * 3.0) as u64, "estimate {est}");
        }
    }

    #[test]
    fn counts_are_exact_for_single_hot_key() {
        let mut sk = Sketch::by_eps_delta(1e-3, 1e-4, HashConfig::default()).unwrap();
        sk.inc(b"x", 1_000_000);
        assert!(sk.estimate(b"x") >= 1_000_000);
        assert!(sk.estimate(b"x") <= 1_001_000);
    }

    #[test]
    fn merge_adds_pointwise() {
        let cfg = HashConfig::default();
        let mut a = Sketch::by_eps_delta(0.01, 0.01, cfg).unwrap();
        let mut b = Sketch::by_eps_delta(0.01, 0.01, cfg).unwrap();
        a.inc(b"k", 3);
        b.inc(b"k", 4);
        b.inc(b"other", 2);
        a.merge_from(&b).unwrap();
        assert_eq!(a.estimate(b"k"), 7);
        assert_eq!(a.estimate(b"other"), 2);
    }

    #[test]
    fn merge_rejects_incompatible() {
        let cfg = HashConfig::default();
        let mut a = Sketch::by_eps_delta(0.01, 0.01, cfg).unwrap();
        let b = Sketch::by_eps_delta(0.02, 0.01, cfg).unwrap();
        assert!(matches!(a.merge_from(&b), Err(Error::InvalidArgument(_))));

        let c = Sketch::by_eps_delta(0.01, 0.01, cfg.with_thread_salt(9)).unwrap();
        assert!(matches!(a.merge_from(&c), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn saturation_is_sticky_and_clamped() {
        let mut sk = Sketch::by_eps_delta(0.1, 0.5, HashConfig::default()).unwrap();
        sk.inc(b"k", u64::MAX);
        assert!(!sk.saturated());
        sk.inc(b"k", 1);
        assert!(sk.saturated());
        assert_eq!(sk.estimate(b"k"), u64::MAX);
    }

    #[test]
    fn merge_induced_overflow_is_an_error() {
        let cfg = HashConfig::default();
        let mut a = Sketch::by_eps_delta(0.1, 0.5, cfg).unwrap();
        let mut b = Sketch::by_eps_delta(0.1, 0.5, cfg).unwrap();
        a.inc(b"k", u64::MAX);
        b.inc(b"k", 2);
        assert!(matches!(a.merge_from(&b), Err(Error::Overflow(_))));
        // The failed merge left the receiver untouched.
        assert_eq!(a.estimate(b"k"), u64::MAX);
        assert!(!a.saturated());
    }

    #[test]
    fn top_k_ranks_heavy_hitters() {
        let mut sk = Sketch::by_eps_delta(0.001, 0.01, HashConfig::default())
            .unwrap()
            .track_top(3);
        for (key, count) in [("whale", 500u64), ("shark", 300), ("crab", 100), ("krill", 1)] {
            for _ in 0..count {
                sk.inc(key.as_bytes(), 1);
            }
        }
        let top = sk.top_k(2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].key, b"whale");
        assert_eq!(top[1].key, b"shark");
        assert!(top[0].estimate >= 500);
    }

    #[test]
    fn top_k_empty_without_tracking() {
        let mut sk = Sketch::by_eps_delta(0.01, 0.01, HashConfig::default()).unwrap();
        sk.inc(b"k", 10);
        assert!(sk.top_k(5).is_empty());
    }

    #[test]
    fn clear_resets_counts_and_candidates() {
        let mut sk = Sketch::by_eps_delta(0.01, 0.01, HashConfig::default())
            .unwrap()
            .track_top(2);
        sk.inc(b"k", 10);
        sk.clear();
        assert_eq!(sk.estimate(b"k"), 0);
        assert!(sk.top_k(2).is_empty());
    }
}
