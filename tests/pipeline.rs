//! End-to-end scenarios through the library API: build sketches, run the
//! pipeline over in-memory input, and check the externally visible results.

use std::io::Cursor;
use std::sync::Arc;

use parking_lot::Mutex;

use probkit::bloom::{Dedup, Filter};
use probkit::cms;
use probkit::hash::{derive_thread_salt, HashConfig};
use probkit::hll;
use probkit::pipeline::{Pipeline, PipelineOptions, ShardPolicy};

fn input_from(lines: &[&str]) -> Cursor<Vec<u8>> {
    let mut buf = Vec::new();
    for line in lines {
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
    }
    Cursor::new(buf)
}

fn numbered_lines(prefix: &str, n: usize) -> Cursor<Vec<u8>> {
    let mut buf = Vec::new();
    for i in 0..n {
        buf.extend_from_slice(format!("{prefix}-{i}\n").as_bytes());
    }
    Cursor::new(buf)
}

fn dedup_locals(workers: usize, fp: f64, out: &Arc<Mutex<Vec<u8>>>) -> Vec<Dedup<Vec<u8>>> {
    let cfg = HashConfig::default();
    (0..workers)
        .map(|i| {
            let salt = derive_thread_salt(cfg.seed, i as u64 + 1);
            let filter = Filter::by_fp(fp, cfg.with_thread_salt(salt)).unwrap();
            Dedup::new(filter, Arc::clone(out))
        })
        .collect()
}

#[test]
fn dedup_single_worker_preserves_order() {
    let out = Arc::new(Mutex::new(Vec::new()));
    let locals = dedup_locals(1, 0.01, &out);
    let opts = PipelineOptions { shard: ShardPolicy::Content, ..Default::default() };
    let summary = Pipeline::new(locals, opts)
        .run(input_from(&["a", "b", "a", "c"]))
        .unwrap();
    assert_eq!(out.lock().as_slice(), b"a\nb\nc\n");
    let seen: u64 = summary.locals.iter().map(Dedup::seen).sum();
    let passed: u64 = summary.locals.iter().map(Dedup::passed).sum();
    assert_eq!(seen, 4);
    assert_eq!(passed, 3);
}

#[test]
fn dedup_sharded_counts_match_distinct_lines() {
    let out = Arc::new(Mutex::new(Vec::new()));
    let locals = dedup_locals(4, 0.001, &out);
    let opts = PipelineOptions { shard: ShardPolicy::Content, ..Default::default() };

    // 2000 distinct keys, each repeated three times.
    let mut buf = Vec::new();
    for _round in 0..3 {
        for i in 0..2_000 {
            buf.extend_from_slice(format!("key-{i}\n").as_bytes());
        }
    }
    let summary = Pipeline::new(locals, opts).run(Cursor::new(buf)).unwrap();

    let seen: u64 = summary.locals.iter().map(Dedup::seen).sum();
    let passed: u64 = summary.locals.iter().map(Dedup::passed).sum();
    assert_eq!(seen, 6_000);
    // Every duplicate lands on the shard that saw the original, so only
    // Bloom false positives can suppress a first occurrence.
    assert!(passed >= 1_990 && passed <= 2_000, "passed = {passed}");

    let written = out.lock();
    let emitted = written.split(|&b| b == b'\n').filter(|l| !l.is_empty()).count();
    assert_eq!(emitted as u64, passed);
}

#[test]
fn hll_ten_thousand_distinct_within_window() {
    let cfg = HashConfig::default();
    let locals: Vec<hll::Sketch> = (0..4)
        .map(|_| hll::Sketch::by_precision(12, cfg).unwrap())
        .collect();
    let summary = Pipeline::new(locals, PipelineOptions::default())
        .run(numbered_lines("k", 10_000))
        .unwrap();
    let mut merged = hll::Sketch::by_precision(12, cfg).unwrap();
    for local in &summary.locals {
        merged.merge_from(local).unwrap();
    }
    let estimate = merged.estimate();
    assert!(
        (8_000.0..=12_000.0).contains(&estimate),
        "estimate {estimate} for 10k distinct"
    );
}

#[test]
fn sharded_hll_equals_single_sketch() {
    // Register max over a partition of the stream reproduces the
    // full-stream register array exactly.
    let cfg = HashConfig::default();
    let locals: Vec<hll::Sketch> = (0..8)
        .map(|_| hll::Sketch::by_precision(12, cfg).unwrap())
        .collect();
    let summary = Pipeline::new(locals, PipelineOptions::default())
        .run(numbered_lines("item", 50_000))
        .unwrap();
    let mut merged = hll::Sketch::by_precision(12, cfg).unwrap();
    for local in &summary.locals {
        merged.merge_from(local).unwrap();
    }

    let mut single = hll::Sketch::by_precision(12, cfg).unwrap();
    for i in 0..50_000 {
        single.add(format!("item-{i}").as_bytes());
    }
    assert_eq!(merged.estimate(), single.estimate());
}

#[test]
fn cms_hot_key_is_never_undercounted() {
    let cfg = HashConfig::default();
    let locals: Vec<cms::Sketch> = (0..4)
        .map(|_| cms::Sketch::by_eps_delta(1e-3, 1e-4, cfg).unwrap())
        .collect();
    let n = 200_000usize;
    let mut buf = Vec::with_capacity(n * 2);
    for _ in 0..n {
        buf.extend_from_slice(b"x\n");
    }
    let summary = Pipeline::new(locals, PipelineOptions::default())
        .run(Cursor::new(buf))
        .unwrap();
    let mut merged = cms::Sketch::by_eps_delta(1e-3, 1e-4, cfg).unwrap();
    for local in &summary.locals {
        merged.merge_from(local).unwrap();
    }
    let estimate = merged.estimate(b"x");
    assert!(estimate >= n as u64);
    assert!(estimate <= n as u64 + (1e-3 * n as f64) as u64 + 1);
}

#[test]
fn sharded_cms_counters_add_to_single_sketch() {
    let cfg = HashConfig::default();
    let locals: Vec<cms::Sketch> = (0..3)
        .map(|_| cms::Sketch::by_eps_delta(0.01, 0.01, cfg).unwrap())
        .collect();
    let summary = Pipeline::new(locals, PipelineOptions::default())
        .run(numbered_lines("rec", 9_000))
        .unwrap();
    let mut merged = cms::Sketch::by_eps_delta(0.01, 0.01, cfg).unwrap();
    for local in &summary.locals {
        merged.merge_from(local).unwrap();
    }

    let mut single = cms::Sketch::by_eps_delta(0.01, 0.01, cfg).unwrap();
    for i in 0..9_000 {
        single.inc(format!("rec-{i}").as_bytes(), 1);
    }
    for probe in ["rec-0", "rec-4500", "rec-8999", "never-seen"] {
        assert_eq!(merged.estimate(probe.as_bytes()), single.estimate(probe.as_bytes()));
    }
}

#[test]
fn stop_after_caps_dedup_stream() {
    let out = Arc::new(Mutex::new(Vec::new()));
    let locals = dedup_locals(2, 0.01, &out);
    let opts = PipelineOptions {
        shard: ShardPolicy::Content,
        stop_after: Some(10),
        ..Default::default()
    };
    let summary = Pipeline::new(locals, opts)
        .run(numbered_lines("line", 100_000))
        .unwrap();
    let seen: u64 = summary.locals.iter().map(Dedup::seen).sum();
    assert_eq!(summary.records_read, 10);
    assert_eq!(seen, 10);
}

#[test]
fn mismatched_bloom_filters_refuse_to_merge() {
    let cfg = HashConfig::default();
    let mut small = Filter::by_mem(64, cfg).unwrap();
    let large = Filter::by_mem(128, cfg).unwrap();
    assert!(matches!(
        small.merge_from(&large),
        Err(probkit::Error::InvalidArgument(_))
    ));
}

#[test]
fn hll_precision_21_is_rejected() {
    assert!(matches!(
        hll::Sketch::by_precision(21, HashConfig::default()),
        Err(probkit::Error::InvalidArgument(_))
    ));
}

#[test]
fn cms_topk_through_the_pipeline() {
    let cfg = HashConfig::default();
    let locals: Vec<cms::Sketch> = (0..2)
        .map(|_| cms::Sketch::by_eps_delta(1e-3, 1e-3, cfg).unwrap().track_top(2))
        .collect();

    let mut buf = Vec::new();
    for (key, count) in [("hot", 5_000), ("warm", 1_000), ("cold", 10)] {
        for _ in 0..count {
            buf.extend_from_slice(key.as_bytes());
            buf.push(b'\n');
        }
    }
    let summary = Pipeline::new(locals, PipelineOptions::default())
        .run(Cursor::new(buf))
        .unwrap();
    let mut merged = cms::Sketch::by_eps_delta(1e-3, 1e-3, cfg).unwrap().track_top(2);
    for local in &summary.locals {
        merged.merge_from(local).unwrap();
    }
    let top = merged.top_k(2);
    assert_eq!(top.len(), 2);
    assert_eq!(top[0].key, b"hot");
    assert!(top[0].estimate >= 5_000);
    assert_eq!(top[1].key, b"warm");
}
