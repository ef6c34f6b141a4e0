//! `probkit hll`: distinct-record estimation over the pipeline.

use std::time::SystemTime;

use serde::Serialize;

use probkit::hll::Sketch;
use probkit::pipeline::{Pipeline, ShardPolicy};

use super::{format_utc, print_json, prom, CliError, GlobalArgs, HllArgs};

#[derive(Serialize)]
struct Summary {
    uu: u64,
    m: usize,
}

#[derive(Serialize)]
struct BucketLine {
    ts: String,
    uu: u64,
    m: usize,
}

pub(crate) fn run(global: &GlobalArgs, args: &HllArgs) -> Result<(), CliError> {
    let cfg = global.hash_config();
    let workers = global.workers();

    // All workers share the global config: register max is shard-agnostic.
    let mut locals = Vec::with_capacity(workers);
    for _ in 0..workers {
        locals.push(Sketch::by_precision(args.precision, cfg)?);
    }
    let input = global.open_input()?;
    let pipeline = Pipeline::new(locals, global.pipeline_options(ShardPolicy::RoundRobin));

    if let Some(width) = global.bucket {
        let accumulator = Sketch::by_precision(args.precision, cfg)?;
        let json = global.json;
        pipeline.run_bucketed(input, accumulator, width, move |ts, sketch| {
            emit_bucket(ts, sketch, json)
        })?;
        return Ok(());
    }

    let summary = pipeline.run(input)?;
    let mut merged = Sketch::by_precision(args.precision, cfg)?;
    for local in &summary.locals {
        merged.merge_from(local)?;
    }
    let estimate = merged.estimate();
    if global.json {
        print_json(&Summary { uu: estimate.round() as u64, m: merged.m() });
    } else {
        println!("uu={estimate:.0} m={}", merged.m());
    }
    if let Some(path) = &global.prom {
        prom::write_gauge(
            path,
            "probkit_hll_estimate",
            "Estimated distinct records.",
            estimate.round() as u64,
        )?;
    }
    Ok(())
}

fn emit_bucket(ts: SystemTime, sketch: &Sketch, json: bool) {
    let stamp = format_utc(ts);
    let estimate = sketch.estimate();
    if json {
        print_json(&BucketLine { ts: stamp, uu: estimate.round() as u64, m: sketch.m() });
    } else {
        println!("{stamp}\tuu={estimate:.0} m={}", sketch.m());
    }
}
