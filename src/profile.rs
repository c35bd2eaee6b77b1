//! Reading profiles written by instrumented programs, merging them together,
//! and binding their counters to the module they were recorded from.

use crate::comm::CommCategory;
use crate::ir::{BlockId, Module};
use crate::storage::{self, CommCounter, Record};
use crate::trap::{self, CallSite, RANK_UNKNOWN};
use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Once;

/// Observed behavior of one or more executions of an instrumented program.
///
/// A `Profile` holds the raw counters, in the order the instrumentation laid
/// them out:
///
/// * How many times was each control-flow edge taken?
/// * How many times was each block executed (for converted profiles)?
/// * How many times, and with how many bytes, was each communication call
///   made?
/// * How long did each communication call take?
/// * How much weight did each block accumulate?
/// * Which ranks contributed?
///
/// ## Constructing a `Profile`
///
/// Read a profile file written by the runtime with [`Profile::from_file`], or
/// decode in-memory records with [`Profile::from_records`].
///
/// ## Merging `Profile`s
///
/// Every process of a parallel run writes its own profile file. Read each of
/// them and call [`Profile::merge`] to combine them into a single, aggregate
/// `Profile`, or use [`Profile::from_files`] to do both at once.
///
/// ## Serializing `Profile`s
///
/// `Profile` implements `serde::Serialize` and `serde::Deserialize`, which the
/// `show` command uses to dump profiles as JSON.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    // The command line of each execution in this profile.
    executions: Vec<Vec<String>>,
    edge_counts: Option<Vec<u64>>,
    block_counts: Option<Vec<u64>>,
    comm: Option<Vec<CommCounter>>,
    legacy_comm: Option<Vec<u64>>,
    comm_seconds: Option<Vec<f64>>,
    block_weights: Option<Vec<f64>>,
    // Every rank seen, excluding the unknown-rank sentinel.
    ranks: BTreeSet<i32>,
    // Whether some execution did not identify its rank.
    unknown_rank: bool,
}

fn add_counts<T: Copy + Counter>(into: &mut Option<Vec<T>>, counts: &[T], what: &str) -> Result<()> {
    match into {
        None => *into = Some(counts.to_vec()),
        Some(existing) => {
            ensure!(
                existing.len() == counts.len(),
                "incompatible {what} counters: {} versus {}; were these profiles recorded from \
                 the same program?",
                existing.len(),
                counts.len()
            );
            for (e, c) in existing.iter_mut().zip(counts) {
                *e = e.plus(*c);
            }
        }
    }
    Ok(())
}

// Counters saturate instead of overflowing.
trait Counter {
    fn plus(self, other: Self) -> Self;
}

impl Counter for u64 {
    fn plus(self, other: u64) -> u64 {
        self.saturating_add(other)
    }
}

impl Counter for f64 {
    fn plus(self, other: f64) -> f64 {
        self + other
    }
}

impl Profile {
    /// Decode a profile from the records of a profile file.
    ///
    /// Records of the same kind, e.g. from several executions appended to one
    /// file, are summed together.
    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Result<Self> {
        let mut profile = Profile::default();
        for record in records {
            profile.add_record(record)?;
        }
        Ok(profile)
    }

    /// Decode a profile from the raw contents of a profile file.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Profile::from_records(storage::decode_records(bytes)?)
    }

    /// Read a profile file.
    ///
    /// # Example
    ///
    /// ```
    /// # fn foo() -> anyhow::Result<()> {
    /// use commprof::Profile;
    ///
    /// let profile = Profile::from_file("commprof.out")?;
    /// println!("{} executions", profile.num_executions());
    /// # Ok(()) }
    /// ```
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Profile::from_records(storage::read_records(path)?)
            .with_context(|| format!("invalid profile `{}`", path.display()))
    }

    /// Read several profile files, typically one per process, and merge them.
    pub fn from_files<P: AsRef<Path>>(paths: impl IntoIterator<Item = P>) -> Result<Self> {
        let mut merged: Option<Profile> = None;
        for path in paths {
            let profile = Profile::from_file(path.as_ref())?;
            match &mut merged {
                None => merged = Some(profile),
                Some(m) => m
                    .merge(&profile)
                    .with_context(|| format!("cannot merge `{}`", path.as_ref().display()))?,
            }
        }
        merged.context("no profile files given")
    }

    fn add_record(&mut self, record: Record) -> Result<()> {
        match record {
            Record::Arguments(args) => self.executions.push(args),
            Record::Blocks(counts) => add_counts(&mut self.block_counts, &counts, "block")?,
            Record::Edges { counts, ranks } => {
                add_counts(&mut self.edge_counts, &counts, "edge")?;
                self.add_ranks(&ranks);
            }
            Record::Ranks(ranks) => self.add_ranks(&ranks),
            Record::LegacyComm(bytes) => {
                add_counts(&mut self.legacy_comm, &bytes, "communication")?
            }
            Record::Comm(counters) => match &mut self.comm {
                None => self.comm = Some(counters),
                Some(existing) => {
                    ensure!(
                        existing.len() == counters.len(),
                        "incompatible communication counters: {} versus {}",
                        existing.len(),
                        counters.len()
                    );
                    for (e, c) in existing.iter_mut().zip(&counters) {
                        e.calls = e.calls.saturating_add(c.calls);
                        e.bytes = e.bytes.saturating_add(c.bytes);
                    }
                }
            },
            Record::Time { seconds, ranks } => {
                add_counts(&mut self.comm_seconds, &seconds, "timing")?;
                self.add_ranks(&ranks);
            }
            Record::WeightedBlocks(weights) => {
                add_counts(&mut self.block_weights, &weights, "block weight")?
            }
        }
        Ok(())
    }

    fn add_ranks(&mut self, ranks: &[i32]) {
        for &rank in ranks {
            if rank == RANK_UNKNOWN {
                self.unknown_rank = true;
            } else {
                self.ranks.insert(rank);
            }
        }
    }

    /// Merge two profiles together.
    ///
    /// The `other` profile is merged into `self`. Counters are summed
    /// elementwise; profiles with differently sized counter arrays were
    /// recorded from different programs and cannot be merged.
    ///
    /// # Example
    ///
    /// ```
    /// # fn foo() -> anyhow::Result<()> {
    /// use commprof::Profile;
    ///
    /// let mut profile = Profile::from_file("rank0.out")?;
    /// profile.merge(&Profile::from_file("rank1.out")?)?;
    /// # Ok(()) }
    /// ```
    pub fn merge(&mut self, other: &Profile) -> Result<()> {
        let mut merged = self.clone();
        merged.executions.extend(other.executions.iter().cloned());
        if let Some(counts) = &other.edge_counts {
            add_counts(&mut merged.edge_counts, counts, "edge")?;
        }
        if let Some(counts) = &other.block_counts {
            add_counts(&mut merged.block_counts, counts, "block")?;
        }
        if let Some(bytes) = &other.legacy_comm {
            add_counts(&mut merged.legacy_comm, bytes, "communication")?;
        }
        if let Some(seconds) = &other.comm_seconds {
            add_counts(&mut merged.comm_seconds, seconds, "timing")?;
        }
        if let Some(weights) = &other.block_weights {
            add_counts(&mut merged.block_weights, weights, "block weight")?;
        }
        if let Some(counters) = &other.comm {
            merged.add_record(Record::Comm(counters.clone()))?;
        }
        merged.ranks.extend(other.ranks.iter().copied());
        merged.unknown_rank |= other.unknown_rank;
        *self = merged;
        Ok(())
    }

    /// The number of program executions this profile aggregates.
    pub fn num_executions(&self) -> usize {
        self.executions.len()
    }

    /// The command line of each execution.
    pub fn executions(&self) -> &[Vec<String>] {
        &self.executions
    }

    /// Raw edge counters, if this profile has any.
    pub fn edge_counts(&self) -> Option<&[u64]> {
        self.edge_counts.as_deref()
    }

    /// Raw block counters, if this profile has any.
    pub fn block_counts(&self) -> Option<&[u64]> {
        self.block_counts.as_deref()
    }

    /// Full communication counters, if this profile has any.
    pub fn comm(&self) -> Option<&[CommCounter]> {
        self.comm.as_deref()
    }

    /// Legacy communication byte counters, if this profile has any.
    pub fn legacy_comm(&self) -> Option<&[u64]> {
        self.legacy_comm.as_deref()
    }

    /// Measured seconds per timed communication call site.
    pub fn comm_seconds(&self) -> Option<&[f64]> {
        self.comm_seconds.as_deref()
    }

    /// Accumulated weight per block, if this profile has any.
    pub fn block_weights(&self) -> Option<&[f64]> {
        self.block_weights.as_deref()
    }

    /// The ranks of the processes that contributed to this profile.
    pub fn ranks(&self) -> &BTreeSet<i32> {
        &self.ranks
    }

    /// Did some contributing process fail to identify its rank?
    pub fn has_unknown_rank(&self) -> bool {
        self.unknown_rank
    }
}

/// Compare two profiles.
///
/// Returns `false` when the number of executions differs. Differences in the
/// counters themselves are only logged as warnings.
pub fn compare(lhs: &Profile, rhs: &Profile) -> bool {
    if lhs.num_executions() != rhs.num_executions() {
        log::error!(
            "number of executions differ: {} versus {}",
            lhs.num_executions(),
            rhs.num_executions()
        );
        return false;
    }
    macro_rules! warn_differ {
        ($($field:ident),*) => {$(
            if lhs.$field != rhs.$field {
                log::warn!(concat!(stringify!($field), " differ"));
            }
        )*};
    }
    warn_differ!(
        edge_counts,
        block_counts,
        comm,
        legacy_comm,
        comm_seconds,
        block_weights,
        ranks
    );
    true
}

/// How a trapped communication call's counters were recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrapFormat {
    /// Call and byte counters.
    Full,
    /// Byte counters only, from older profiles.
    Legacy,
}

/// A trapped communication call and its counters.
#[derive(Clone, Debug, PartialEq)]
pub struct TrappedCall {
    /// The trap's index in program order.
    pub index: usize,
    /// Where the call is.
    pub site: CallSite,
    /// How the counters were recorded.
    pub format: TrapFormat,
    /// How many times the call executed.
    pub calls: u64,
    /// The total bytes it moved.
    pub bytes: u64,
}

impl TrappedCall {
    /// The call's cost category.
    pub fn category(&self) -> CommCategory {
        self.site.op.category
    }
}

/// A timed communication call and its measured time.
#[derive(Clone, Debug, PartialEq)]
pub struct TimedCall {
    /// Where the call is.
    pub site: CallSite,
    /// The total seconds spent in the call.
    pub seconds: f64,
}

static LEGACY_NOTICE: Once = Once::new();

/// A [`Profile`] bound to the module it was recorded from.
///
/// The module must be the original, uninstrumented one (or one instrumented
/// identically to it): counters are matched to edges, blocks and call sites by
/// their position in program order.
pub struct ProfileInfo<'a> {
    module: &'a Module,
    profile: &'a Profile,
    // Per defined function: the count of the synthetic entry edge.
    entry_counts: Vec<Option<u64>>,
    // Per function, per block: the count of each out-edge.
    edge_counts: Vec<Vec<Vec<u64>>>,
    // Per function, per block: the execution count.
    block_counts: Vec<Vec<u64>>,
    has_block_counts: bool,
    // Per function, per block: the accumulated weight.
    block_weights: Option<Vec<Vec<f64>>>,
    trapped: Vec<TrappedCall>,
    timed: Vec<TimedCall>,
}

impl<'a> ProfileInfo<'a> {
    /// Bind `profile` to `module`.
    ///
    /// Fails if the profile's counters do not fit the module's layout.
    pub fn new(module: &'a Module, profile: &'a Profile) -> Result<Self> {
        let mut info = ProfileInfo {
            module,
            profile,
            entry_counts: vec![None; module.functions.len()],
            edge_counts: module
                .functions
                .iter()
                .map(|f| f.blocks.iter().map(|_| vec![]).collect())
                .collect(),
            block_counts: module
                .functions
                .iter()
                .map(|f| vec![0; f.blocks.len()])
                .collect(),
            has_block_counts: false,
            block_weights: None,
            trapped: vec![],
            timed: vec![],
        };

        if let Some(counts) = profile.edge_counts() {
            info.bind_edges(counts)?;
        } else if let Some(counts) = profile.block_counts() {
            info.bind_blocks(counts)?;
        }
        if let Some(weights) = profile.block_weights() {
            info.bind_weights(weights)?;
        }
        info.bind_traps()?;
        Ok(info)
    }

    fn bind_edges(&mut self, counts: &[u64]) -> Result<()> {
        let expected = crate::instrument::num_edge_slots(self.module);
        ensure!(
            counts.len() == expected,
            "edge profile has {} counters but the module has {expected} edges; was the profile \
             recorded from this module?",
            counts.len()
        );

        let mut counts = counts.iter().copied();
        let mut next = || counts.next().unwrap_or(0);
        let module = self.module;
        for (fi, func) in module.defined_functions() {
            let entry = next();
            self.entry_counts[fi] = Some(entry);
            let slot = &mut self.block_counts[fi][BlockId::ENTRY.index()];
            *slot = slot.saturating_add(entry);
            for (bi, block) in func.blocks.iter().enumerate() {
                for succ in block.terminator.successors() {
                    let count = next();
                    self.edge_counts[fi][bi].push(count);
                    let slot = &mut self.block_counts[fi][succ.index()];
                    *slot = slot.saturating_add(count);
                }
            }
        }
        self.has_block_counts = true;
        Ok(())
    }

    fn num_blocks(&self) -> usize {
        self.module
            .defined_functions()
            .map(|(_, f)| f.blocks.len())
            .sum()
    }

    fn bind_weights(&mut self, weights: &[f64]) -> Result<()> {
        let expected = self.num_blocks();
        ensure!(
            weights.len() == expected,
            "weighted block profile has {} counters but the module has {expected} blocks",
            weights.len()
        );
        let mut weights = weights.iter().copied();
        self.block_weights = Some(
            self.module
                .functions
                .iter()
                .map(|f| weights.by_ref().take(f.blocks.len()).collect())
                .collect(),
        );
        Ok(())
    }

    fn bind_blocks(&mut self, counts: &[u64]) -> Result<()> {
        let expected = self.num_blocks();
        ensure!(
            counts.len() == expected,
            "block profile has {} counters but the module has {expected} blocks",
            counts.len()
        );
        let mut counts = counts.iter().copied();
        let module = self.module;
        for (fi, func) in module.defined_functions() {
            for bi in 0..func.blocks.len() {
                self.block_counts[fi][bi] = counts.next().unwrap_or(0);
            }
            self.entry_counts[fi] = Some(self.block_counts[fi][BlockId::ENTRY.index()]);
        }
        self.has_block_counts = true;
        Ok(())
    }

    fn bind_traps(&mut self) -> Result<()> {
        let sites = trap::comm_sites(self.module);
        match (self.profile.comm(), self.profile.legacy_comm()) {
            (Some(counters), legacy) => {
                if legacy.is_some() {
                    log::warn!("profile has both full and legacy communication records; using the full records");
                }
                ensure!(
                    counters.len() == sites.len(),
                    "communication profile has {} sites but the module has {}",
                    counters.len(),
                    sites.len()
                );
                self.trapped = sites
                    .into_iter()
                    .zip(counters)
                    .enumerate()
                    .map(|(index, (site, c))| TrappedCall {
                        index,
                        site,
                        format: TrapFormat::Full,
                        calls: c.calls,
                        bytes: c.bytes,
                    })
                    .collect();
            }
            (None, Some(bytes)) => {
                LEGACY_NOTICE.call_once(|| log::warn!("Notice: old communication profiling format"));
                ensure!(
                    bytes.len() == sites.len(),
                    "legacy communication profile has {} sites but the module has {}",
                    bytes.len(),
                    sites.len()
                );
                self.trapped = sites
                    .into_iter()
                    .zip(bytes)
                    .enumerate()
                    .map(|(index, (site, &bytes))| {
                        // Old profiles did not count calls; assume one per
                        // execution of the enclosing block.
                        let calls = self.block_counts[site.function][site.block.index()];
                        TrappedCall {
                            index,
                            site,
                            format: TrapFormat::Legacy,
                            calls,
                            bytes,
                        }
                    })
                    .collect();
            }
            (None, None) => {}
        }

        if let Some(seconds) = self.profile.comm_seconds() {
            let sites = trap::timed_sites(self.module);
            if seconds.len() != sites.len() {
                bail!(
                    "timing profile has {} sites but the module has {}",
                    seconds.len(),
                    sites.len()
                );
            }
            self.timed = sites
                .into_iter()
                .zip(seconds)
                .map(|(site, &seconds)| TimedCall { site, seconds })
                .collect();
        }
        Ok(())
    }

    /// The module this profile is bound to.
    pub fn module(&self) -> &'a Module {
        self.module
    }

    /// The raw profile.
    pub fn profile(&self) -> &'a Profile {
        self.profile
    }

    /// Does this profile carry block execution counts?
    pub fn has_block_counts(&self) -> bool {
        self.has_block_counts
    }

    /// How many times `block` of the `function`th function executed.
    pub fn execution_count(&self, function: usize, block: BlockId) -> u64 {
        self.block_counts
            .get(function)
            .and_then(|f| f.get(block.index()))
            .copied()
            .unwrap_or(0)
    }

    /// The weight accumulated by `block` of the `function`th function, if
    /// the profile carries block weights.
    pub fn block_weight(&self, function: usize, block: BlockId) -> Option<f64> {
        self.block_weights
            .as_ref()?
            .get(function)?
            .get(block.index())
            .copied()
    }

    /// How many times the `function`th function was entered, if known.
    pub fn function_count(&self, function: usize) -> Option<u64> {
        self.entry_counts.get(function).copied().flatten()
    }

    /// How many times the `succ`th out-edge of `block` was taken, if known.
    pub fn edge_count(&self, function: usize, block: BlockId, succ: usize) -> Option<u64> {
        self.edge_counts
            .get(function)?
            .get(block.index())?
            .get(succ)
            .copied()
    }

    /// Every trapped communication call, in program order.
    pub fn trapped_calls(&self) -> &[TrappedCall] {
        &self.trapped
    }

    /// The trapped calls recorded in the given format.
    pub fn trapped_calls_in(&self, format: TrapFormat) -> impl Iterator<Item = &TrappedCall> {
        self.trapped.iter().filter(move |t| t.format == format)
    }

    /// How often the block enclosing `call` executed.
    ///
    /// Without block counts, the call's own count stands in.
    pub fn block_frequency(&self, call: &TrappedCall) -> u64 {
        if self.has_block_counts {
            self.execution_count(call.site.function, call.site.block)
        } else {
            call.calls
        }
    }

    /// Every timed communication call, in program order.
    pub fn timed_calls(&self) -> &[TimedCall] {
        &self.timed
    }

    /// The block-count record equivalent to this profile's edge counts.
    pub fn block_record(&self) -> Result<Record> {
        ensure!(self.has_block_counts, "profile has no edge or block counts");
        Ok(Record::Blocks(
            self.module
                .defined_functions()
                .flat_map(|(fi, _)| self.block_counts[fi].iter().copied())
                .collect(),
        ))
    }
}
