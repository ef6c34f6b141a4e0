//! Command-line surface: argument parsing, input opening, and the shared
//! output helpers. Estimation itself lives in the library; each subcommand
//! driver only builds sketches, runs the pipeline, and formats results.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;

use probkit::hash::{HashConfig, HashKind};
use probkit::pipeline::{resolve_workers, PipelineOptions, ShardPolicy};

mod bloom;
mod cms;
mod hll;
mod prom;

#[derive(Parser)]
#[command(
    name = "probkit",
    version,
    about = "Approximate stream summarization (Bloom/HLL/CMS)"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Estimate distinct records (HyperLogLog)
    Hll(HllArgs),
    /// Membership filter sizing and streaming dedup (Bloom)
    Bloom(BloomArgs),
    /// Frequency estimation and heavy hitters (Count-Min)
    Cms(CmsArgs),
}

#[derive(Args)]
pub struct GlobalArgs {
    /// Worker threads (default: available parallelism)
    #[arg(long, global = true, value_parser = clap::value_parser!(u32).range(1..=1024))]
    pub threads: Option<u32>,

    /// Input file; "-" or absent reads stdin
    #[arg(long, global = true, value_name = "PATH")]
    pub file: Option<PathBuf>,

    /// Machine-readable output
    #[arg(long, global = true)]
    pub json: bool,

    /// Hash family: wyhash | xxhash
    #[arg(long, global = true, default_value = "wyhash", value_parser = parse_hash_kind)]
    pub hash: HashKind,

    /// Stop after N records
    #[arg(long, global = true, value_name = "N")]
    pub stop_after: Option<u64>,

    /// Print processed-record counts to stderr every SECONDS (default 5)
    #[arg(
        long,
        global = true,
        value_name = "SECONDS",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "5"
    )]
    pub stats: Option<u64>,

    /// Tumbling bucket width, e.g. 500ms, 30s, 1m (effective minimum 1s)
    #[arg(long, global = true, value_name = "DURATION", value_parser = parse_duration)]
    pub bucket: Option<Duration>,

    /// Emit a Prometheus textfile after the final summary ("-" = stdout)
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "-"
    )]
    pub prom: Option<PathBuf>,

    /// Memory budget hint in bytes (Bloom sizing)
    #[arg(long, global = true, value_name = "BYTES")]
    pub mem_budget: Option<u64>,
}

#[derive(Args)]
pub struct HllArgs {
    /// Register precision p in [4, 20]; m = 2^p registers
    #[arg(long, default_value_t = 14)]
    pub precision: u8,
}

#[derive(Args)]
pub struct BloomArgs {
    /// Target false-positive rate in (0, 1)
    #[arg(long)]
    pub fp: Option<f64>,

    /// Expected insertions for --fp sizing (default 100000)
    #[arg(long, value_name = "N")]
    pub capacity_hint: Option<u64>,

    /// Streaming action
    #[arg(long, value_enum)]
    pub action: Option<BloomAction>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BloomAction {
    /// Pass each unseen record to stdout, drop duplicates
    Dedup,
}

#[derive(Args)]
pub struct CmsArgs {
    /// Additive error bound as a fraction of the stream weight
    #[arg(long, default_value_t = 1e-3)]
    pub eps: f64,

    /// Failure probability of the error bound
    #[arg(long, default_value_t = 1e-4)]
    pub delta: f64,

    /// Track and report the K heaviest keys
    #[arg(long, value_name = "K")]
    pub topk: Option<usize>,
}

#[derive(Debug)]
pub enum CliError {
    /// Conflicting or missing options; exits 2.
    Usage(String),
    /// Configuration or runtime failure; exits 1.
    Failed(probkit::Error),
}

impl From<probkit::Error> for CliError {
    fn from(err: probkit::Error) -> Self {
        CliError::Failed(err)
    }
}

pub fn run(cli: Cli) -> Result<(), CliError> {
    match &cli.command {
        Command::Hll(args) => hll::run(&cli.global, args),
        Command::Bloom(args) => bloom::run(&cli.global, args),
        Command::Cms(args) => cms::run(&cli.global, args),
    }
}

impl GlobalArgs {
    fn hash_config(&self) -> HashConfig {
        HashConfig::new(self.hash)
    }

    fn workers(&self) -> usize {
        resolve_workers(self.threads.map(|n| n as usize))
    }

    fn open_input(&self) -> Result<Box<dyn BufRead + Send>, CliError> {
        match &self.file {
            Some(path) if path.as_os_str() != "-" => {
                let file = File::open(path).map_err(probkit::Error::from)?;
                Ok(Box::new(BufReader::new(file)))
            }
            _ => Ok(Box::new(BufReader::new(io::stdin()))),
        }
    }

    fn pipeline_options(&self, shard: ShardPolicy) -> PipelineOptions {
        PipelineOptions {
            stop_after: self.stop_after,
            stats_interval: self.stats.map(|s| Duration::from_secs(s.max(1))),
            shard,
            hash: self.hash_config(),
            ..Default::default()
        }
    }
}

fn parse_hash_kind(s: &str) -> Result<HashKind, String> {
    s.parse::<HashKind>().map_err(|err| err.to_string())
}

/// Parse `<n>{ms|s|m|h}` into a duration.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("`{s}` is missing a unit (ms, s, m, h)"))?;
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("`{s}` has no leading number"))?;
    let seconds_per_unit = match unit {
        "ms" => return Ok(Duration::from_millis(value)),
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        other => return Err(format!("unknown duration unit `{other}`")),
    };
    value
        .checked_mul(seconds_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("`{s}` overflows"))
}

fn format_utc(ts: SystemTime) -> String {
    DateTime::<Utc>::from(ts).format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn print_json<T: Serialize>(value: &T) {
    if let Ok(line) = serde_json::to_string(value) {
        println!("{line}");
    }
}
