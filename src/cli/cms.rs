//! `probkit cms`: frequency estimation, optional heavy-hitter report.

use std::time::SystemTime;

use serde::Serialize;

use probkit::cms::{Sketch, TopEntry};
use probkit::hash::HashConfig;
use probkit::pipeline::{Pipeline, ShardPolicy};

use super::{format_utc, print_json, prom, CliError, CmsArgs, GlobalArgs};

#[derive(Serialize)]
struct Dimensions {
    depth: usize,
    width: usize,
}

#[derive(Serialize)]
struct BucketDimensions {
    ts: String,
    depth: usize,
    width: usize,
}

#[derive(Serialize)]
struct TopItem {
    key: String,
    est: u64,
}

#[derive(Serialize)]
struct TopReport {
    topk: Vec<TopItem>,
}

#[derive(Serialize)]
struct BucketTopReport {
    ts: String,
    topk: Vec<TopItem>,
}

fn top_items(entries: &[TopEntry]) -> Vec<TopItem> {
    entries
        .iter()
        .map(|entry| TopItem {
            key: String::from_utf8_lossy(&entry.key).into_owned(),
            est: entry.estimate,
        })
        .collect()
}

fn make_sketch(args: &CmsArgs, hash: HashConfig) -> probkit::Result<Sketch> {
    let sketch = Sketch::by_eps_delta(args.eps, args.delta, hash)?;
    Ok(match args.topk {
        Some(k) if k > 0 => sketch.track_top(k),
        _ => sketch,
    })
}

pub(crate) fn run(global: &GlobalArgs, args: &CmsArgs) -> Result<(), CliError> {
    let cfg = global.hash_config();
    let workers = global.workers();

    // All workers share the global config: the row-hash functions must be
    // identical for per-shard counters to add up in the merge.
    let mut locals = Vec::with_capacity(workers);
    for _ in 0..workers {
        locals.push(make_sketch(args, cfg)?);
    }
    let input = global.open_input()?;
    let pipeline = Pipeline::new(locals, global.pipeline_options(ShardPolicy::RoundRobin));

    if let Some(width) = global.bucket {
        let accumulator = make_sketch(args, cfg)?;
        let json = global.json;
        let topk = args.topk.unwrap_or(0);
        pipeline.run_bucketed(input, accumulator, width, move |ts, sketch| {
            emit_bucket(ts, sketch, topk, json)
        })?;
        return Ok(());
    }

    let summary = pipeline.run(input)?;
    let mut merged = make_sketch(args, cfg)?;
    for local in &summary.locals {
        merged.merge_from(local)?;
    }
    match args.topk {
        Some(k) if k > 0 => {
            let items = merged.top_k(k);
            if global.json {
                print_json(&TopReport { topk: top_items(&items) });
            } else {
                for item in &items {
                    println!("{}\t{}", String::from_utf8_lossy(&item.key), item.estimate);
                }
            }
        }
        _ => {
            let (depth, width) = merged.dims();
            if global.json {
                print_json(&Dimensions { depth, width });
            } else {
                println!("cms: processed");
            }
        }
    }
    if merged.saturated() {
        eprintln!("warning: cms counters saturated; heavy counts are clamped");
    }
    if let Some(path) = &global.prom {
        prom::write_gauge(
            path,
            "probkit_cms_records",
            "Records folded into the sketch.",
            summary.records_read,
        )?;
    }
    Ok(())
}

fn emit_bucket(ts: SystemTime, sketch: &Sketch, topk: usize, json: bool) {
    let stamp = format_utc(ts);
    if topk > 0 {
        let items = sketch.top_k(topk);
        if json {
            print_json(&BucketTopReport { ts: stamp, topk: top_items(&items) });
        } else {
            for item in &items {
                println!("{stamp}\t{}\t{}", String::from_utf8_lossy(&item.key), item.estimate);
            }
        }
    } else {
        let (depth, width) = sketch.dims();
        if json {
            print_json(&BucketDimensions { ts: stamp, depth, width });
        } else {
            println!("{stamp}\trotated");
        }
    }
}
