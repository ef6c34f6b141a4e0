//! Seeded 64-bit hashing shared by all sketches.
//!
//! Every sketch hashes records through [`hash64`] under a [`HashConfig`];
//! two sketches are merge-compatible only when their configs are
//! bit-identical. The effective seed of a call is `seed ^ thread_salt`,
//! which lets sharded pipelines decorrelate collisions across workers
//! without changing the hash family.

use std::fmt;
use std::str::FromStr;

use wyhash::wyhash;
use xxhash_rust::xxh64::xxh64;

use crate::error::Error;

/// 2^64 / φ, the golden-gamma increment used for seed spreading.
pub const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

/// Hash family selector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HashKind {
    #[default]
    Wyhash,
    Xxhash,
}

impl HashKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HashKind::Wyhash => "wyhash",
            HashKind::Xxhash => "xxhash",
        }
    }
}

impl fmt::Display for HashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashKind {
    type Err = Error;

    /// Accepts `wyhash`, `xxhash`, and the common shorthand `xxh`.
    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "wyhash" => Ok(HashKind::Wyhash),
            "xxhash" | "xxh" => Ok(HashKind::Xxhash),
            other => Err(Error::Parse(format!("unknown hash kind `{other}`"))),
        }
    }
}

/// Immutable hashing parameters of one sketch instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HashConfig {
    pub kind: HashKind,
    pub seed: u64,
    pub thread_salt: u64,
}

impl HashConfig {
    pub fn new(kind: HashKind) -> Self {
        Self { kind, seed: 0, thread_salt: 0 }
    }

    /// Same family and seed, different per-worker salt.
    pub fn with_thread_salt(self, thread_salt: u64) -> Self {
        Self { thread_salt, ..self }
    }

    /// Same family and salt, different base seed (double hashing, CMS rows).
    pub(crate) fn with_seed(self, seed: u64) -> Self {
        Self { seed, ..self }
    }
}

/// Hash `input` under `cfg`. Deterministic across runs, threads, and
/// architectures for a fixed config.
#[inline]
pub fn hash64(input: &[u8], cfg: &HashConfig) -> u64 {
    let seed = cfg.seed ^ cfg.thread_salt;
    match cfg.kind {
        HashKind::Wyhash => wyhash(input, seed),
        HashKind::Xxhash => xxh64(input, seed),
    }
}

/// Derive a per-worker salt from a base seed and a 1-based worker index.
///
/// Spacing indices by the golden gamma before the splitmix64 finalizer keeps
/// salts of adjacent workers far apart in the output space.
#[inline]
pub fn derive_thread_salt(base: u64, thread_index: u64) -> u64 {
    splitmix64(base ^ thread_index.wrapping_mul(GOLDEN_GAMMA))
}

#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(GOLDEN_GAMMA);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}
