//! Timing sources: the cost models the aggregator prices a profile with.
//!
//! Each source is configured by a JSON document. For example, a block timing
//! source:
//!
//! ```json
//! { "instruction_costs": { "add": 0.5, "load": 2.0, "call": 5.0 }, "default_cost": 1.0 }
//! ```
//!
//! an MPI timing source:
//!
//! ```json
//! {
//!   "latency_ns": 1500.0,
//!   "bandwidth": 3.2,
//!   "processes": 16,
//!   "fitting": { "send": { "intercept": 1.2e-6, "per_byte": 3.0e-10 } }
//! }
//! ```
//!
//! and a library-call timing source:
//!
//! ```json
//! { "costs": { "sqrt": 20.0, "memcpy": 150.0 } }
//! ```

use crate::cost::{FittingModel, LatencyModel};
use crate::ir::{Block, Inst};
use anyhow::{bail, Context, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

/// The kind of a timing source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimingKind {
    /// Computation time of basic blocks.
    Block,
    /// Communication time of trapped calls.
    Mpi,
    /// Time spent in library calls.
    LibCall,
}

impl std::fmt::Display for TimingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TimingKind::Block => "block",
            TimingKind::Mpi => "mpi",
            TimingKind::LibCall => "libcall",
        })
    }
}

impl FromStr for TimingKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "block" => Ok(TimingKind::Block),
            "mpi" => Ok(TimingKind::Mpi),
            "libcall" => Ok(TimingKind::LibCall),
            _ => bail!("Unknown timing source '{s}'; valid sources are: block, mpi, libcall"),
        }
    }
}

/// Per-instruction costs of basic blocks, in nanoseconds.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockTiming {
    /// Cost of one execution of an instruction, by opcode name.
    #[serde(default)]
    pub instruction_costs: BTreeMap<String, f64>,
    /// Cost of an instruction whose opcode has no entry.
    #[serde(default)]
    pub default_cost: f64,
}

impl BlockTiming {
    /// The cost of one execution of an instruction with the given opcode.
    pub fn instruction_cost(&self, opcode: &str) -> f64 {
        self.instruction_costs
            .get(opcode)
            .copied()
            .unwrap_or(self.default_cost)
    }

    /// The cost of one execution of `block`.
    ///
    /// Instructions inserted by instrumentation are free.
    pub fn count(&self, block: &Block) -> f64 {
        opcodes(block).map(|op| self.instruction_cost(op)).sum()
    }

    /// The number of instructions one execution of `block` runs.
    pub fn ir_count(&self, block: &Block) -> u64 {
        opcodes(block).count() as u64
    }
}

/// The opcodes of `block`'s program instructions, terminator included.
pub(crate) fn opcodes(block: &Block) -> impl Iterator<Item = &str> {
    block
        .insts
        .iter()
        .filter(|i| !i.is_instrumentation())
        .map(Inst::opcode)
        .chain(std::iter::once(block.terminator.opcode()))
}

/// Communication cost models.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MpiTiming {
    /// The closed-form model.
    #[serde(flatten)]
    pub model: LatencyModel,
    /// The fitted model.
    #[serde(default)]
    pub fitting: FittingModel,
}

/// Per-call costs of library functions, in nanoseconds.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LibCallTiming {
    /// Cost of one call, by callee name.
    #[serde(default)]
    pub costs: BTreeMap<String, f64>,
}

impl LibCallTiming {
    /// The cost of a call to `callee` made `frequency` times.
    ///
    /// Unlisted callees are free.
    pub fn count(&self, callee: &str, frequency: u64) -> f64 {
        self.costs.get(callee).copied().unwrap_or(0.0) * frequency as f64
    }
}

/// A configured timing source.
#[derive(Clone, Debug, PartialEq)]
pub enum TimingSource {
    /// See [`BlockTiming`].
    Block(BlockTiming),
    /// See [`MpiTiming`].
    Mpi(MpiTiming),
    /// See [`LibCallTiming`].
    LibCall(LibCallTiming),
}

impl TimingSource {
    /// Parse a source of the given kind from its JSON configuration.
    pub fn from_json(kind: TimingKind, json: &str) -> Result<Self> {
        Ok(match kind {
            TimingKind::Block => TimingSource::Block(serde_json::from_str(json)?),
            TimingKind::Mpi => TimingSource::Mpi(serde_json::from_str(json)?),
            TimingKind::LibCall => TimingSource::LibCall(serde_json::from_str(json)?),
        })
    }

    /// Read a source of the given kind from a JSON file.
    pub fn from_file(kind: TimingKind, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {kind} timing source `{}`", path.display()))?;
        TimingSource::from_json(kind, &json)
            .with_context(|| format!("invalid {kind} timing source `{}`", path.display()))
    }

    /// This source's kind.
    pub fn kind(&self) -> TimingKind {
        match self {
            TimingSource::Block(_) => TimingKind::Block,
            TimingSource::Mpi(_) => TimingKind::Mpi,
            TimingSource::LibCall(_) => TimingKind::LibCall,
        }
    }
}
