//! Parallel ingest-and-summarize runtime.
//!
//! Topology: one reader thread shards newline-delimited records into one
//! SPSC ring per worker; each worker folds its shard into a thread-local
//! sketch; an optional reducer rotates tumbling time buckets. The pipeline
//! is generic over [`StreamSketch`], so each subcommand binds its sketch
//! type once at construction instead of owning a parallel pipeline.
//!
//! Cross-thread coordination is a handful of atomics with release/acquire
//! discipline: `done` (reader finished), `merging`/`paused_workers` (the
//! rotation handshake), `workers_ended` (final-merge barrier). Each local
//! sketch additionally sits in a mutex; workers hold it only around a
//! single update and the handshake guarantees the reducer takes it
//! uncontended, so the lock is the aliasing proof rather than a contention
//! point.

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::hash::{hash64, HashConfig};
use crate::ring::{self, Consumer, Producer};

/// Per-worker ring capacity in records.
pub const RING_CAPACITY: usize = 1 << 14;

/// Reader yields this many times before sleeping on a full ring.
const PUSH_SPIN_LIMIT: u32 = 16;
const PUSH_BACKOFF: Duration = Duration::from_micros(50);
const PAUSE_BACKOFF: Duration = Duration::from_micros(50);
const PAUSE_WAIT: Duration = Duration::from_micros(100);
const REDUCER_TICK: Duration = Duration::from_millis(50);
const STATS_TICK: Duration = Duration::from_millis(100);
/// Buckets narrower than this are clamped up.
const MIN_BUCKET: Duration = Duration::from_secs(1);

/// Capability set the pipeline needs from a per-worker summary.
pub trait StreamSketch: Send {
    /// Fold one record into the summary.
    fn ingest(&mut self, record: &[u8]) -> Result<()>;
    /// Fold a compatible summary into this one.
    fn merge_from(&mut self, other: &Self) -> Result<()>;
    /// Forget contents, keeping parameters and hash config.
    fn reset(&mut self);
}

/// How the reader routes records to workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardPolicy {
    /// `hash(record) mod N`: identical records always land on the same
    /// shard, so per-shard dedup implies global dedup.
    Content,
    /// `counter mod N`: cheapest spread for sketches whose merge is
    /// shard-agnostic (HLL register max, CMS counter add).
    RoundRobin,
}

pub struct PipelineOptions {
    pub ring_capacity: usize,
    /// Stop reading after this many records.
    pub stop_after: Option<u64>,
    /// Print `processed=<N>` to stderr at this interval.
    pub stats_interval: Option<Duration>,
    pub shard: ShardPolicy,
    /// Config used for content sharding (the global hash config).
    pub hash: HashConfig,
    /// External cancellation (e.g. a SIGINT flag). When it trips, the
    /// reader stops and workers exit without draining their rings.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            ring_capacity: RING_CAPACITY,
            stop_after: None,
            stats_interval: None,
            shard: ShardPolicy::RoundRobin,
            hash: HashConfig::default(),
            cancel: None,
        }
    }
}

/// Worker count for a requested `--threads` value: the request if positive,
/// else available parallelism, else 1.
pub fn resolve_workers(requested: Option<usize>) -> usize {
    match requested {
        Some(n) if n > 0 => n,
        _ => thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
    }
}

/// Anchors the monotonic clock to wall-clock time at pipeline start so
/// bucket timestamps stay monotone even if the system clock steps.
pub struct Timebase {
    sys: SystemTime,
    steady: Instant,
}

impl Timebase {
    pub fn new() -> Self {
        Self { sys: SystemTime::now(), steady: Instant::now() }
    }

    pub fn to_system(&self, at: Instant) -> SystemTime {
        if at >= self.steady {
            self.sys + (at - self.steady)
        } else {
            self.sys - (self.steady - at)
        }
    }
}

impl Default for Timebase {
    fn default() -> Self {
        Self::new()
    }
}

/// What a finished run hands back: the per-worker sketches (for the final
/// merge) and how many records the reader dispatched.
pub struct Summary<S> {
    pub locals: Vec<S>,
    pub records_read: u64,
}

#[derive(Default)]
struct PipelineState {
    done: AtomicBool,
    merging: AtomicBool,
    paused_workers: AtomicUsize,
    workers_ended: AtomicBool,
    cancelled: AtomicBool,
    live_workers: AtomicUsize,
    /// Bumped before each rotation so a worker pauses at most once per
    /// rotation even if it slept through the previous resume.
    merge_epoch: AtomicU64,
}

impl PipelineState {
    /// Latches the external cancel flag into `cancelled`.
    fn observe_cancel(&self, opts: &PipelineOptions) -> bool {
        if let Some(flag) = &opts.cancel {
            if flag.load(Ordering::Acquire) {
                self.cancelled.store(true, Ordering::Release);
                return true;
            }
        }
        false
    }
}

struct BucketMode<S, E> {
    accumulator: S,
    width: Duration,
    emit: E,
}

pub struct Pipeline<S> {
    locals: Vec<Mutex<S>>,
    opts: PipelineOptions,
}

impl<S: StreamSketch> Pipeline<S> {
    /// One local sketch per worker; the vector length is the worker count.
    pub fn new(locals: Vec<S>, opts: PipelineOptions) -> Self {
        Self { locals: locals.into_iter().map(Mutex::new).collect(), opts }
    }

    /// Run to end of input and return the locals for a caller-side merge.
    pub fn run<In>(self, input: In) -> Result<Summary<S>>
    where
        In: BufRead + Send,
    {
        self.drive(input, None::<BucketMode<S, fn(SystemTime, &S)>>)
    }

    /// Run with tumbling-bucket output: every `width` (clamped to >= 1 s)
    /// the reducer merges all locals into `accumulator`, calls `emit` with
    /// the bucket's start timestamp, and resets both.
    pub fn run_bucketed<In, E>(
        self,
        input: In,
        accumulator: S,
        width: Duration,
        emit: E,
    ) -> Result<Summary<S>>
    where
        In: BufRead + Send,
        E: FnMut(SystemTime, &S) + Send,
    {
        self.drive(input, Some(BucketMode { accumulator, width, emit }))
    }

    fn drive<In, E>(self, input: In, bucket: Option<BucketMode<S, E>>) -> Result<Summary<S>>
    where
        In: BufRead + Send,
        E: FnMut(SystemTime, &S) + Send,
    {
        let Pipeline { locals, opts } = self;
        let workers = locals.len();
        if workers == 0 {
            return Err(Error::InvalidArgument("pipeline needs at least one worker"));
        }

        let state = PipelineState::default();
        state.live_workers.store(workers, Ordering::Relaxed);
        let records_read = AtomicU64::new(0);

        let mut producers = Vec::with_capacity(workers);
        let mut consumers = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = ring::spsc(opts.ring_capacity);
            producers.push(tx);
            consumers.push(rx);
        }

        let read_result = thread::scope(|scope| {
            let state = &state;
            let records_read = &records_read;
            let opts = &opts;
            let locals = &locals;

            let mut worker_handles = Vec::with_capacity(workers);
            for (rx, local) in consumers.into_iter().zip(locals.iter()) {
                worker_handles.push(scope.spawn(move || worker_loop(rx, local, state)));
            }
            let reader_handle =
                scope.spawn(move || reader_loop(input, producers, opts, state, records_read));
            let reducer_handle =
                bucket.map(|mode| scope.spawn(move || reducer_loop(mode, locals, state)));
            if let Some(interval) = opts.stats_interval {
                scope.spawn(move || stats_loop(interval, records_read, state));
            }

            // Shutdown ordering: reader, then workers, then (after the
            // barrier) the reducer. The barrier guarantees the final merge
            // sees quiescent locals.
            let read_result = join(reader_handle);
            for handle in worker_handles {
                join(handle);
            }
            state.workers_ended.store(true, Ordering::Release);
            if let Some(handle) = reducer_handle {
                join(handle);
            }
            read_result
        });

        let locals = locals.into_iter().map(Mutex::into_inner).collect();
        read_result.map(|()| Summary { locals, records_read: records_read.load(Ordering::Relaxed) })
    }
}

fn join<T>(handle: thread::ScopedJoinHandle<'_, T>) -> T {
    match handle.join() {
        Ok(value) => value,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

fn reader_loop<In: BufRead>(
    mut input: In,
    mut rings: Vec<Producer<Vec<u8>>>,
    opts: &PipelineOptions,
    state: &PipelineState,
    records_read: &AtomicU64,
) -> Result<()> {
    let shards = rings.len() as u64;
    let mut line: Vec<u8> = Vec::with_capacity(256);
    let mut next_shard = 0u64;
    let mut read = 0u64;
    let result = loop {
        if state.observe_cancel(opts) {
            break Ok(());
        }
        line.clear();
        match input.read_until(b'\n', &mut line) {
            Ok(0) => break Ok(()),
            Ok(_) => {}
            Err(err) => break Err(err.into()),
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        let shard = match opts.shard {
            ShardPolicy::Content => (hash64(&line, &opts.hash) % shards) as usize,
            ShardPolicy::RoundRobin => {
                let s = next_shard as usize;
                next_shard = (next_shard + 1) % shards;
                s
            }
        };
        if !push_with_backpressure(&mut rings[shard], std::mem::take(&mut line), opts, state) {
            break Ok(());
        }
        read += 1;
        records_read.fetch_add(1, Ordering::Relaxed);
        if opts.stop_after.is_some_and(|cap| read >= cap) {
            break Ok(());
        }
    };
    state.done.store(true, Ordering::Release);
    result
}

/// Returns false when cancelled before the push landed.
fn push_with_backpressure(
    ring: &mut Producer<Vec<u8>>,
    mut item: Vec<u8>,
    opts: &PipelineOptions,
    state: &PipelineState,
) -> bool {
    let mut spins = 0u32;
    loop {
        match ring.try_push(item) {
            Ok(()) => return true,
            Err(back) => {
                if state.observe_cancel(opts) {
                    return false;
                }
                item = back;
                if spins < PUSH_SPIN_LIMIT {
                    thread::yield_now();
                    spins += 1;
                } else {
                    thread::sleep(PUSH_BACKOFF);
                }
            }
        }
    }
}

fn worker_loop<S: StreamSketch>(
    mut ring: Consumer<Vec<u8>>,
    local: &Mutex<S>,
    state: &PipelineState,
) {
    let mut paused_epoch = 0u64;
    loop {
        if state.merging.load(Ordering::Acquire) {
            let epoch = state.merge_epoch.load(Ordering::Acquire);
            if paused_epoch != epoch {
                state.paused_workers.fetch_add(1, Ordering::AcqRel);
                paused_epoch = epoch;
            }
            thread::sleep(PAUSE_BACKOFF);
            continue;
        }
        if state.cancelled.load(Ordering::Acquire) {
            // Unconsumed ring items are discarded on drop.
            break;
        }
        if let Some(record) = ring.try_pop() {
            // A failed update drops the record; the stream keeps flowing.
            let _ = local.lock().ingest(&record);
        } else if state.done.load(Ordering::Acquire) {
            break;
        } else {
            thread::yield_now();
        }
    }
    state.live_workers.fetch_sub(1, Ordering::AcqRel);
}

fn reducer_loop<S: StreamSketch, E: FnMut(SystemTime, &S)>(
    mut mode: BucketMode<S, E>,
    locals: &[Mutex<S>],
    state: &PipelineState,
) {
    let width = mode.width.max(MIN_BUCKET);
    let timebase = Timebase::new();
    let mut bucket_start = Instant::now();
    loop {
        thread::sleep(REDUCER_TICK);
        let finishing =
            state.done.load(Ordering::Acquire) && state.workers_ended.load(Ordering::Acquire);
        if Instant::now() < bucket_start + width && !finishing {
            continue;
        }
        if !finishing {
            state.merge_epoch.fetch_add(1, Ordering::AcqRel);
            state.merging.store(true, Ordering::Release);
            // A worker that already exited cannot pause; wait only for the
            // live ones. Exited workers' sketches are quiescent.
            loop {
                let live = state.live_workers.load(Ordering::Acquire);
                if state.paused_workers.load(Ordering::Acquire) >= live {
                    break;
                }
                thread::sleep(PAUSE_WAIT);
            }
        }
        for local in locals {
            let mut sketch = local.lock();
            let _ = mode.accumulator.merge_from(&sketch);
            sketch.reset();
        }
        (mode.emit)(timebase.to_system(bucket_start), &mode.accumulator);
        mode.accumulator.reset();
        if finishing {
            break;
        }
        state.paused_workers.store(0, Ordering::Release);
        state.merging.store(false, Ordering::Release);
        bucket_start += width;
    }
}

fn stats_loop(interval: Duration, records_read: &AtomicU64, state: &PipelineState) {
    let interval = interval.max(Duration::from_secs(1));
    let mut last = Instant::now();
    loop {
        thread::sleep(STATS_TICK);
        if last.elapsed() >= interval {
            eprintln!("processed={}", records_read.load(Ordering::Relaxed));
            last = Instant::now();
        }
        if state.done.load(Ordering::Acquire) && state.workers_ended.load(Ordering::Acquire) {
            break;
        }
    }
}
