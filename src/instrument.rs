//! Instrumenting a program's control-flow graph to count edge executions and
//! trap communication calls.

use crate::ir::{BlockId, CounterType, Global, Inst, Module, Operand};
use crate::trap;
use anyhow::{bail, ensure, Error, Result};
use std::str::FromStr;

#[cfg(feature = "clap")]
use clap::Parser;

/// Instrument a program to collect edge and communication profiles.
#[cfg_attr(feature = "clap", derive(Parser))]
pub struct Instrumenter {
    /// The instrumentation strategies to apply, in order.
    ///
    /// Choices:
    ///
    /// * edge: count every control-flow edge.
    ///
    /// * edge-rank: count every control-flow edge and capture the process's
    ///   rank.
    ///
    /// * rank: capture the process's rank only.
    ///
    /// * comm: count calls and payload bytes of every data-moving
    ///   communication call.
    ///
    /// * time: measure the time spent in every communication call and
    ///   capture the process's rank.
    ///
    /// * weighted-block: accumulate the weights given with `--weight` per
    ///   block.
    ///
    /// edge and edge-rank cannot be combined.
    ///
    /// See the API documentation for `commprof::InstrumentationStrategy` for
    /// more details.
    #[cfg_attr(
        feature = "clap",
        clap(short, long = "strategy", value_delimiter = ',', default_value = "edge-rank")
    )]
    strategies: Vec<InstrumentationStrategy>,

    /// The name of the program's entry function.
    ///
    /// The runtime initialization calls are inserted at the start of this
    /// function. A module without it is left uninstrumented.
    #[cfg_attr(feature = "clap", clap(long, default_value = "main"))]
    entry: String,

    /// A block weight for the weighted-block strategy, as
    /// `FUNCTION:BLOCK=WEIGHT`, where `WEIGHT` is an integer or the name of a
    /// variable read when the block finishes.
    #[cfg_attr(feature = "clap", clap(long = "weight"))]
    weights: Vec<BlockWeight>,
}

impl Default for Instrumenter {
    fn default() -> Self {
        Instrumenter {
            strategies: vec![InstrumentationStrategy::EdgeRank],
            entry: "main".to_string(),
            weights: vec![],
        }
    }
}

impl Instrumenter {
    /// Construct a new `Instrumenter`.
    pub fn new() -> Self {
        Instrumenter::default()
    }

    /// Configure a single instrumentation strategy, replacing any others.
    ///
    /// See the documentation for [`InstrumentationStrategy`] for details.
    pub fn strategy(&mut self, strategy: InstrumentationStrategy) -> &mut Self {
        self.strategies = vec![strategy];
        self
    }

    /// Configure the list of strategies applied, in order.
    pub fn strategies(
        &mut self,
        strategies: impl IntoIterator<Item = InstrumentationStrategy>,
    ) -> &mut Self {
        self.strategies = strategies.into_iter().collect();
        self
    }

    /// Configure the name of the program's entry function.
    pub fn entry(&mut self, name: impl Into<String>) -> &mut Self {
        self.entry = name.into();
        self
    }

    /// Add a block weight for [`InstrumentationStrategy::WeightedBlock`].
    pub fn weight(&mut self, weight: BlockWeight) -> &mut Self {
        self.weights.push(weight);
        self
    }

    /// Instrument the given module.
    ///
    /// Returns a new version of the input module with counter arrays declared,
    /// counter updates inserted, and runtime initialization calls added to the
    /// entry function.
    ///
    /// A module without an entry function is returned unchanged, with a
    /// warning.
    pub fn instrument(&self, module: &Module) -> Result<Module> {
        module.validate()?;
        let mut module = module.clone();

        let Some(main) = module.function_index(&self.entry) else {
            log::warn!(
                "cannot insert profiling into a module with no `{}` function",
                self.entry
            );
            return Ok(module);
        };
        ensure!(
            !module.functions[main].is_declaration(),
            "entry function `{}` has no body",
            self.entry
        );
        ensure!(
            !(self.strategies.contains(&InstrumentationStrategy::Edge)
                && self.strategies.contains(&InstrumentationStrategy::EdgeRank)),
            "the edge and edge-rank strategies write the same edge counters and cannot be \
             combined"
        );

        // Later strategies must only see the blocks of the original program,
        // not the ones earlier strategies split off.
        let original: Vec<usize> = module.functions.iter().map(|f| f.blocks.len()).collect();

        for strategy in &self.strategies {
            log::debug!("Applying {strategy} instrumentation");
            let mut init_args = vec![];
            match strategy {
                InstrumentationStrategy::Edge => {
                    init_args.push(insert_edge_counters(&mut module, &original, EDGE_COUNTERS)?);
                }
                InstrumentationStrategy::EdgeRank => {
                    init_args.push(insert_edge_counters(
                        &mut module,
                        &original,
                        EDGE_RANK_COUNTERS,
                    )?);
                    init_args.push(trap::trap_rank(&mut module, EDGE_RANK_RANKS)?);
                }
                InstrumentationStrategy::Rank => {
                    init_args.push(trap::trap_rank(&mut module, RANK_COUNTERS)?);
                }
                InstrumentationStrategy::Comm => {
                    init_args.push(trap::trap_comm(&mut module, COMM_COUNTERS)?);
                }
                InstrumentationStrategy::Time => {
                    init_args.push(trap::trap_time(&mut module, TIME_COUNTERS)?);
                    init_args.push(trap::trap_rank(&mut module, TIME_RANKS)?);
                }
                InstrumentationStrategy::WeightedBlock => {
                    init_args.push(insert_block_weights(
                        &mut module,
                        &original,
                        &self.weights,
                        WEIGHT_COUNTERS,
                    )?);
                }
            }
            insert_init_call(&mut module, main, strategy.entry_point(), init_args);
        }

        Ok(module)
    }
}

const EDGE_COUNTERS: &str = "__commprof_edge_counters";
const EDGE_RANK_COUNTERS: &str = "__commprof_edge_rank_counters";
const EDGE_RANK_RANKS: &str = "__commprof_edge_rank_ranks";
const RANK_COUNTERS: &str = "__commprof_rank";
const COMM_COUNTERS: &str = "__commprof_comm_counters";
const TIME_COUNTERS: &str = "__commprof_time_counters";
const TIME_RANKS: &str = "__commprof_time_ranks";
const WEIGHT_COUNTERS: &str = "__commprof_block_weights";

/// The number of edge counter slots `module` needs: one for the entry edge of
/// every function with a body, plus one per block successor.
pub fn num_edge_slots(module: &Module) -> usize {
    module
        .defined_functions()
        .map(|(_, f)| {
            1 + f
                .blocks
                .iter()
                .map(|b| b.terminator.num_successors())
                .sum::<usize>()
        })
        .sum()
}

/// Insert one counter per control-flow edge, plus one per function for the
/// edge into its entry block.
///
/// Counting happens in two passes. The first pass collects the blocks that
/// existed before any instrumentation (`original` holds each function's block
/// count then); the second pass rewrites only those blocks, so blocks created
/// by splitting critical edges are never instrumented themselves.
fn insert_edge_counters(module: &mut Module, original: &[usize], counters: &str) -> Result<Operand> {
    let mut to_instrument: Vec<(usize, Vec<BlockId>)> = vec![];
    let mut num_edges = 0_usize;
    for (func_index, func) in module.defined_functions() {
        // Reserve space for the (0, entry) edge.
        num_edges += 1;
        let blocks: Vec<BlockId> = func.block_ids().take(original[func_index]).collect();
        for &block in &blocks {
            num_edges += func.block(block).terminator.num_successors();
        }
        to_instrument.push((func_index, blocks));
    }

    let len = u32::try_from(num_edges)
        .map_err(|_| anyhow::anyhow!("too many edges to instrument: {num_edges}"))?;
    module.declare_global(Global {
        name: counters.to_string(),
        ty: CounterType::U64,
        len,
        init: 0,
    })?;

    let increment = |slot: u32| Inst::Increment {
        counters: counters.to_string(),
        slot,
    };

    let mut slot = 0_u32;
    for (func_index, blocks) in to_instrument {
        let func = &mut module.functions[func_index];
        func.insert_at_start(BlockId::ENTRY, increment(slot));
        slot += 1;

        for block in blocks {
            let num_succs = func.block(block).terminator.num_successors();
            for succ in 0..num_succs {
                func.split_critical_edge(block, succ);

                // The edge is no longer critical. With a single successor the
                // counter goes at the end of this block, otherwise at the start
                // of the successor, which now has this block as its only
                // predecessor.
                let term = &func.block(block).terminator;
                if term.num_successors() == 1 {
                    func.insert_at_end(block, increment(slot));
                } else {
                    let Some(to) = term.successor(succ) else {
                        bail!("successor {succ} of block {} disappeared", block.0);
                    };
                    func.insert_at_start(to, increment(slot));
                }
                slot += 1;
            }
        }
    }

    ensure!(
        slot as usize == num_edges,
        "inserted {slot} edge counters but reserved {num_edges}"
    );
    log::debug!("Inserted {num_edges} edge counters into `{counters}`");
    Ok(Operand::Global(counters.to_string()))
}

/// Give every original block an `f64` accumulator, and add each configured
/// weight to its block's accumulator at the end of that block.
///
/// Slots follow the blocks of functions with bodies in program order.
fn insert_block_weights(
    module: &mut Module,
    original: &[usize],
    weights: &[BlockWeight],
    counters: &str,
) -> Result<Operand> {
    let mut first_slot = vec![0_usize; module.functions.len()];
    let mut num_blocks = 0_usize;
    for (func_index, _) in module.defined_functions() {
        first_slot[func_index] = num_blocks;
        num_blocks += original[func_index];
    }

    let mut updates = vec![];
    for weight in weights {
        let Some(func_index) = module.function_index(&weight.function) else {
            bail!("cannot weigh blocks of unknown function `{}`", weight.function);
        };
        ensure!(
            weight.block.index() < original[func_index],
            "cannot weigh block {} of `{}`: it has {} blocks",
            weight.block.0,
            weight.function,
            original[func_index]
        );
        let slot = u32::try_from(first_slot[func_index] + weight.block.index())?;
        updates.push((func_index, slot, weight));
    }

    module.declare_global(Global {
        name: counters.to_string(),
        ty: CounterType::F64,
        len: u32::try_from(num_blocks)
            .map_err(|_| anyhow::anyhow!("too many blocks to instrument: {num_blocks}"))?,
        init: 0,
    })?;
    for (func_index, slot, weight) in updates {
        module.functions[func_index].insert_at_end(
            weight.block,
            Inst::AddWeight {
                counters: counters.to_string(),
                slot,
                value: weight.value.clone(),
            },
        );
    }

    log::debug!("Weighing {} of {num_blocks} blocks", weights.len());
    Ok(Operand::Global(counters.to_string()))
}

fn insert_init_call(module: &mut Module, main: usize, entry_point: &str, args: Vec<Operand>) {
    log::trace!("Inserting call to `{entry_point}` into `{}`", module.functions[main].name);
    module.functions[main].insert_at_start(
        BlockId::ENTRY,
        Inst::Call {
            callee: crate::ir::Callee::Direct(entry_point.to_string()),
            args,
        },
    );
}

/// The instrumentation strategy for recording profiling data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InstrumentationStrategy {
    /// Count every control-flow edge.
    ///
    /// One 64-bit counter is allocated per edge, plus one per function for
    /// the edge entering its entry block. Critical edges are split so that
    /// every counter sits on a path that only that edge takes:
    ///
    /// * If the edge's source has a single successor, the counter is
    ///   incremented at the end of the source block.
    ///
    /// * Otherwise the counter is incremented at the start of the destination
    ///   block.
    ///
    /// The program's entry function gets a call to
    /// `commprof_start_edge_profiling` that registers the counters with the
    /// runtime, which writes them out when the process exits.
    Edge,

    /// Like [`InstrumentationStrategy::Edge`], but additionally captures the
    /// rank the process receives from the first `MPI_Comm_rank` (or
    /// `mpi_comm_rank_`) call, and writes it out with the edge counters.
    ///
    /// Initialized by `commprof_start_edge_rank_profiling`.
    EdgeRank,

    /// Only capture the process's rank.
    ///
    /// Initialized by `commprof_start_rank_profiling`.
    Rank,

    /// Count calls and payload bytes of every data-moving communication call.
    ///
    /// Each trapped call site gets two 64-bit slots. Right after the call, the
    /// first slot is incremented and the call's element count times its
    /// datatype's size is added to the second.
    ///
    /// Initialized by `commprof_start_comm_profiling`.
    Comm,

    /// Measure the wall-clock time spent in every communication call, and
    /// capture the process's rank.
    ///
    /// Initialized by `commprof_start_time_profiling`.
    Time,

    /// Accumulate a weight per block.
    ///
    /// One `f64` accumulator is allocated per block of every function with a
    /// body. Each configured [`BlockWeight`] adds its value to its block's
    /// accumulator every time the block finishes; blocks without a weight
    /// stay at zero.
    ///
    /// Initialized by `commprof_start_weighted_block_profiling`.
    WeightedBlock,
}

/// A weight added to a block's accumulator by
/// [`InstrumentationStrategy::WeightedBlock`].
#[derive(Clone, Debug, PartialEq)]
pub struct BlockWeight {
    /// The function containing the block.
    pub function: String,
    /// The weighed block.
    pub block: BlockId,
    /// The weight: a constant, or a variable read when the block finishes.
    pub value: Operand,
}

impl FromStr for BlockWeight {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let parse = || -> Option<BlockWeight> {
            let (place, value) = s.split_once('=')?;
            let (function, block) = place.rsplit_once(':')?;
            let value = match value.parse() {
                Ok(c) => Operand::Const(c),
                Err(_) if !value.is_empty() => Operand::Var(value.to_string()),
                Err(_) => return None,
            };
            Some(BlockWeight {
                function: function.to_string(),
                block: BlockId(block.parse().ok()?),
                value,
            })
        };
        parse().ok_or_else(|| {
            anyhow::anyhow!("invalid block weight '{s}'; expected FUNCTION:BLOCK=WEIGHT")
        })
    }
}

impl InstrumentationStrategy {
    /// The name of the runtime function that this strategy's instrumentation
    /// calls from the entry function.
    pub fn entry_point(&self) -> &'static str {
        match self {
            InstrumentationStrategy::Edge => "commprof_start_edge_profiling",
            InstrumentationStrategy::EdgeRank => "commprof_start_edge_rank_profiling",
            InstrumentationStrategy::Rank => "commprof_start_rank_profiling",
            InstrumentationStrategy::Comm => "commprof_start_comm_profiling",
            InstrumentationStrategy::Time => "commprof_start_time_profiling",
            InstrumentationStrategy::WeightedBlock => "commprof_start_weighted_block_profiling",
        }
    }

    /// The strategy whose runtime entry point is named `name`, if any.
    pub fn from_entry_point(name: &str) -> Option<Self> {
        [
            InstrumentationStrategy::Edge,
            InstrumentationStrategy::EdgeRank,
            InstrumentationStrategy::Rank,
            InstrumentationStrategy::Comm,
            InstrumentationStrategy::Time,
            InstrumentationStrategy::WeightedBlock,
        ]
        .into_iter()
        .find(|s| s.entry_point() == name)
    }
}

impl std::fmt::Display for InstrumentationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            InstrumentationStrategy::Edge => "edge",
            InstrumentationStrategy::EdgeRank => "edge-rank",
            InstrumentationStrategy::Rank => "rank",
            InstrumentationStrategy::Comm => "comm",
            InstrumentationStrategy::Time => "time",
            InstrumentationStrategy::WeightedBlock => "weighted-block",
        })
    }
}

impl FromStr for InstrumentationStrategy {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "edge" => Ok(InstrumentationStrategy::Edge),
            "edge-rank" => Ok(InstrumentationStrategy::EdgeRank),
            "rank" => Ok(InstrumentationStrategy::Rank),
            "comm" => Ok(InstrumentationStrategy::Comm),
            "time" => Ok(InstrumentationStrategy::Time),
            "weighted-block" => Ok(InstrumentationStrategy::WeightedBlock),
            _ => bail!(
                "Unknown instrumentation strategy '{s}'; valid strategies are: edge, edge-rank, \
                 rank, comm, time, weighted-block"
            ),
        }
    }
}
