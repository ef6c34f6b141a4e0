//! `probkit bloom`: filter sizing, and sharded streaming dedup.

use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use probkit::bloom::{Dedup, Filter};
use probkit::hash::{derive_thread_salt, HashConfig};
use probkit::pipeline::{Pipeline, ShardPolicy};

use super::{print_json, prom, BloomAction, BloomArgs, CliError, GlobalArgs};

#[derive(Serialize)]
struct Dimensions {
    m_bits: usize,
    k: u8,
}

#[derive(Serialize)]
struct DedupSummary {
    seen: u64,
    passed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    fp_target: Option<f64>,
}

/// How the filter is sized; `--fp` and `--mem-budget` are exclusive.
enum Sizing {
    Fp { p: f64, hint: Option<u64> },
    Mem(u64),
}

impl Sizing {
    fn resolve(global: &GlobalArgs, args: &BloomArgs) -> Result<Self, CliError> {
        match (args.fp, global.mem_budget) {
            (Some(_), Some(_)) => Err(CliError::Usage(
                "specify either --fp or --mem-budget, not both".into(),
            )),
            (None, None) => Err(CliError::Usage("bloom needs --fp or --mem-budget".into())),
            // Range checks on the values belong to the constructor; its
            // failure surfaces as a config error, not an argument error.
            (Some(p), None) => Ok(Sizing::Fp { p, hint: args.capacity_hint }),
            (None, Some(bytes)) => {
                if args.capacity_hint.is_some() {
                    return Err(CliError::Usage("--capacity-hint requires --fp".into()));
                }
                Ok(Sizing::Mem(bytes))
            }
        }
    }

    fn build(&self, hash: HashConfig) -> probkit::Result<Filter> {
        match *self {
            Sizing::Fp { p, hint: Some(n) } => Filter::by_fp_with_capacity(p, n as usize, hash),
            Sizing::Fp { p, hint: None } => Filter::by_fp(p, hash),
            Sizing::Mem(bytes) => Filter::by_mem(bytes as usize, hash),
        }
    }

    fn fp_target(&self) -> Option<f64> {
        match *self {
            Sizing::Fp { p, .. } => Some(p),
            Sizing::Mem(_) => None,
        }
    }
}

pub(crate) fn run(global: &GlobalArgs, args: &BloomArgs) -> Result<(), CliError> {
    let sizing = Sizing::resolve(global, args)?;
    let cfg = global.hash_config();

    if args.action != Some(BloomAction::Dedup) {
        let filter = sizing.build(cfg)?;
        if global.json {
            print_json(&Dimensions { m_bits: filter.bit_size(), k: filter.hashes() });
        } else {
            println!("bloom: m_bits={} k={}", filter.bit_size(), filter.hashes());
        }
        return Ok(());
    }

    let workers = global.workers();
    let out = Arc::new(Mutex::new(io::stdout()));
    // Content sharding routes equal records to the same worker, so each
    // shard dedups its own slice of the key space; per-shard salts keep
    // the shards' collision patterns independent.
    let mut locals = Vec::with_capacity(workers);
    for i in 0..workers {
        let salt = derive_thread_salt(cfg.seed, i as u64 + 1);
        let filter = sizing.build(cfg.with_thread_salt(salt))?;
        locals.push(Dedup::new(filter, Arc::clone(&out)));
    }
    let input = global.open_input()?;
    let pipeline = Pipeline::new(locals, global.pipeline_options(ShardPolicy::Content));
    let summary = pipeline.run(input)?;
    let _ = out.lock().flush();

    let seen: u64 = summary.locals.iter().map(Dedup::seen).sum();
    let passed: u64 = summary.locals.iter().map(Dedup::passed).sum();
    if global.json {
        let line = DedupSummary { seen, passed, fp_target: sizing.fp_target() };
        if let Ok(line) = serde_json::to_string(&line) {
            eprintln!("{line}");
        }
    }
    if let Some(path) = &global.prom {
        prom::write_gauge(
            path,
            "probkit_bloom_dedup_passed",
            "Records passed through as first occurrences.",
            passed,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use crate::cli::{Cli, Command};

    use super::*;

    fn parse(argv: &[&str]) -> (GlobalArgs, BloomArgs) {
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Command::Bloom(args) => (cli.global, args),
            _ => unreachable!("tests parse bloom invocations only"),
        }
    }

    #[test]
    fn fp_with_mem_budget_is_a_usage_error() {
        let (global, args) = parse(&["probkit", "--mem-budget=64", "bloom", "--fp=0.01"]);
        assert!(matches!(Sizing::resolve(&global, &args), Err(CliError::Usage(_))));
    }

    #[test]
    fn missing_sizing_is_a_usage_error() {
        let (global, args) = parse(&["probkit", "bloom"]);
        assert!(matches!(Sizing::resolve(&global, &args), Err(CliError::Usage(_))));
    }

    #[test]
    fn capacity_hint_without_fp_is_a_usage_error() {
        let (global, args) = parse(&["probkit", "--mem-budget=64", "bloom", "--capacity-hint=10"]);
        assert!(matches!(Sizing::resolve(&global, &args), Err(CliError::Usage(_))));
    }

    #[test]
    fn out_of_range_fp_is_a_config_error_not_a_usage_error() {
        for argv in [
            ["probkit", "bloom", "--fp=2.0"],
            ["probkit", "bloom", "--fp=0.0"],
        ] {
            let (global, args) = parse(&argv);
            let sizing = Sizing::resolve(&global, &args).unwrap();
            let result = sizing.build(HashConfig::default()).map_err(CliError::from);
            assert!(matches!(
                result,
                Err(CliError::Failed(probkit::Error::InvalidArgument(_)))
            ));
        }
    }

    #[test]
    fn zero_capacity_hint_is_a_config_error_not_a_usage_error() {
        let (global, args) = parse(&["probkit", "bloom", "--fp=0.01", "--capacity-hint=0"]);
        let sizing = Sizing::resolve(&global, &args).unwrap();
        let result = sizing.build(HashConfig::default()).map_err(CliError::from);
        assert!(matches!(
            result,
            Err(CliError::Failed(probkit::Error::InvalidArgument(_)))
        ));
    }

    #[test]
    fn tiny_mem_budget_is_a_config_error() {
        let (global, args) = parse(&["probkit", "--mem-budget=4", "bloom"]);
        let sizing = Sizing::resolve(&global, &args).unwrap();
        assert!(matches!(
            sizing.build(HashConfig::default()),
            Err(probkit::Error::InvalidArgument(_))
        ));
    }
}
