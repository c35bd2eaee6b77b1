//! The runtime half of instrumentation: registering counter arrays and writing
//! them to a profile file when the process exits.
//!
//! Instrumented programs call exactly one `start_*` function per strategy they
//! were instrumented with, early in their entry function. Calling the same
//! initializer twice registers a second exit handler and is not supported.
//!
//! Counters are plain atomics updated with relaxed ordering, so multi-threaded
//! programs get exact totals but no ordering between counters.

use crate::storage::{self, CommCounter, Record};
use crate::InstrumentationStrategy;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Mutex;

/// The environment variable naming the profile file to append to.
pub const OUTPUT_ENV: &str = "COMMPROF_OUTPUT";

/// The profile file used when [`OUTPUT_ENV`] is unset.
pub const DEFAULT_OUTPUT: &str = "commprof.out";

type Counters = &'static [AtomicU64];
type Ranks = &'static [AtomicI32];

struct State {
    arguments: Vec<String>,
    wrote_arguments: bool,
    edge: Option<Counters>,
    edge_rank: Option<(Counters, Ranks)>,
    rank: Option<Ranks>,
    comm: Option<Counters>,
    time: Option<(Counters, Ranks)>,
    weighted_block: Option<Counters>,
}

impl State {
    const fn new() -> Self {
        State {
            arguments: Vec::new(),
            wrote_arguments: false,
            edge: None,
            edge_rank: None,
            rank: None,
            comm: None,
            time: None,
            weighted_block: None,
        }
    }
}

static STATE: Mutex<State> = Mutex::new(State::new());

fn with_state<T>(f: impl FnOnce(&mut State) -> T) -> T {
    let mut state = STATE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut state)
}

fn start(
    args: impl IntoIterator<Item = String>,
    install: impl FnOnce(&mut State),
    handler: extern "C" fn(),
) {
    let args: Vec<String> = args.into_iter().collect();
    with_state(|s| {
        s.arguments = args;
        install(s);
    });
    // Safety: `handler` is a plain function that never unwinds.
    if unsafe { libc::atexit(handler) } != 0 {
        log::warn!("failed to register profiling exit handler; no profile will be written");
    }
}

/// Start edge profiling.
///
/// `edges` are the counters the instrumentation increments, one per edge.
pub fn start_edge_profiling(args: impl IntoIterator<Item = String>, edges: Counters) {
    start(args, |s| s.edge = Some(edges), edge_exit_handler);
}

/// Start edge profiling with the process rank appended to the edge record.
pub fn start_edge_rank_profiling(
    args: impl IntoIterator<Item = String>,
    edges: Counters,
    ranks: Ranks,
) {
    start(args, |s| s.edge_rank = Some((edges, ranks)), edge_rank_exit_handler);
}

/// Start recording the process rank alone.
pub fn start_rank_profiling(args: impl IntoIterator<Item = String>, ranks: Ranks) {
    start(args, |s| s.rank = Some(ranks), rank_exit_handler);
}

/// Start recording communication call and byte counters.
///
/// `counters` holds a `(calls, bytes)` pair of slots per trapped call site.
pub fn start_comm_profiling(args: impl IntoIterator<Item = String>, counters: Counters) {
    start(args, |s| s.comm = Some(counters), comm_exit_handler);
}

/// Start recording time spent in communication calls.
///
/// `seconds` holds the bit patterns of `f64` second totals, one per timed
/// call site.
pub fn start_time_profiling(args: impl IntoIterator<Item = String>, seconds: Counters, ranks: Ranks) {
    start(args, |s| s.time = Some((seconds, ranks)), time_exit_handler);
}

/// Start accumulating block weights.
///
/// `weights` holds the bit patterns of `f64` totals, one per block; update
/// them with [`add_weight`].
pub fn start_weighted_block_profiling(args: impl IntoIterator<Item = String>, weights: Counters) {
    start(args, |s| s.weighted_block = Some(weights), weighted_block_exit_handler);
}

/// Build the record an exit handler writes for `strategy`.
///
/// `words` are the raw primary counters: counts for every strategy except
/// `Time` and `WeightedBlock`, whose words are `f64` bit patterns.
pub(crate) fn exit_record(strategy: InstrumentationStrategy, words: Vec<u64>, ranks: Vec<i32>) -> Record {
    match strategy {
        InstrumentationStrategy::Edge | InstrumentationStrategy::EdgeRank => Record::Edges {
            counts: words,
            ranks,
        },
        InstrumentationStrategy::Rank => Record::Ranks(ranks),
        InstrumentationStrategy::Comm => Record::Comm(
            words
                .chunks(2)
                .map(|pair| CommCounter {
                    calls: pair[0],
                    bytes: pair.get(1).copied().unwrap_or(0),
                })
                .collect(),
        ),
        InstrumentationStrategy::Time => Record::Time {
            seconds: words.into_iter().map(f64::from_bits).collect(),
            ranks,
        },
        InstrumentationStrategy::WeightedBlock => {
            Record::WeightedBlocks(words.into_iter().map(f64::from_bits).collect())
        }
    }
}

fn load_counters(counters: Counters) -> Vec<u64> {
    counters.iter().map(|c| c.load(Ordering::Relaxed)).collect()
}

fn load_ranks(ranks: Ranks) -> Vec<i32> {
    ranks.iter().map(|r| r.load(Ordering::Relaxed)).collect()
}

fn add_f64(slot: &AtomicU64, value: f64) {
    let _ = slot.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
        Some((f64::from_bits(bits) + value).to_bits())
    });
}

/// Add `seconds` to an `f64` accumulator stored as bits in `slot`.
pub fn add_seconds(slot: &AtomicU64, seconds: f64) {
    add_f64(slot, seconds);
}

/// Add an integer `weight` to an `f64` block accumulator stored as bits in
/// `slot`.
pub fn add_weight(slot: &AtomicU64, weight: i64) {
    add_f64(slot, weight as f64);
}

fn output_path() -> PathBuf {
    std::env::var_os(OUTPUT_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT))
}

/// Append `strategy`'s record to `path`, preceded by the arguments record if
/// no earlier write succeeded.
///
/// Failures are logged, not returned.
fn write_to(path: &Path, strategy: InstrumentationStrategy) {
    let records = with_state(|s| {
        let record = match strategy {
            InstrumentationStrategy::Edge => {
                exit_record(strategy, load_counters(s.edge?), vec![])
            }
            InstrumentationStrategy::EdgeRank => {
                let (edges, ranks) = s.edge_rank?;
                exit_record(strategy, load_counters(edges), load_ranks(ranks))
            }
            InstrumentationStrategy::Rank => exit_record(strategy, vec![], load_ranks(s.rank?)),
            InstrumentationStrategy::Comm => {
                exit_record(strategy, load_counters(s.comm?), vec![])
            }
            InstrumentationStrategy::Time => {
                let (seconds, ranks) = s.time?;
                exit_record(strategy, load_counters(seconds), load_ranks(ranks))
            }
            InstrumentationStrategy::WeightedBlock => {
                exit_record(strategy, load_counters(s.weighted_block?), vec![])
            }
        };
        let mut records = vec![];
        if !s.wrote_arguments {
            records.push(Record::Arguments(s.arguments.clone()));
        }
        records.push(record);
        Some(records)
    });

    let Some(records) = records else {
        return;
    };
    match storage::append_records(path, &records) {
        Ok(()) => with_state(|s| s.wrote_arguments = true),
        Err(e) => log::warn!("failed to write {strategy} profile: {e:#}"),
    }
}

fn write(strategy: InstrumentationStrategy) {
    write_to(&output_path(), strategy);
}

extern "C" fn edge_exit_handler() {
    write(InstrumentationStrategy::Edge);
}

extern "C" fn edge_rank_exit_handler() {
    write(InstrumentationStrategy::EdgeRank);
}

extern "C" fn rank_exit_handler() {
    write(InstrumentationStrategy::Rank);
}

extern "C" fn comm_exit_handler() {
    write(InstrumentationStrategy::Comm);
}

extern "C" fn time_exit_handler() {
    write(InstrumentationStrategy::Time);
}

extern "C" fn weighted_block_exit_handler() {
    write(InstrumentationStrategy::WeightedBlock);
}
