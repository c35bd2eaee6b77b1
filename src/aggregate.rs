//! Pricing a profile with timing sources and summing the results.

use crate::comm::CommCategory;
use crate::ir::{BlockId, Inst};
use crate::profile::ProfileInfo;
use crate::timing::{self, BlockTiming, LibCallTiming, MpiTiming, TimingKind, TimingSource};
use anyhow::{ensure, Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

/// Prices a profile with a set of timing sources.
#[derive(Clone, Debug, Default)]
pub struct Analyzer {
    sources: Vec<TimingSource>,
    ignore: BTreeSet<String>,
    verbose: bool,
}

impl Analyzer {
    /// Build an analyzer from source kinds and the files configuring them.
    ///
    /// The `i`th kind is configured by the `i`th file. Surplus files are
    /// ignored; too few files is an error raised before anything is read.
    /// `ignore` optionally names a file of whitespace-separated function
    /// names whose blocks and calls are left out of every total.
    pub fn new<P: AsRef<Path>>(
        kinds: &[TimingKind],
        files: &[P],
        ignore: Option<&Path>,
    ) -> Result<Self> {
        ensure!(
            kinds.len() <= files.len(),
            "not enough files to initialize timing sources: {} sources but {} files",
            kinds.len(),
            files.len()
        );

        let ignore = match ignore {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("couldn't open ignore file `{}`", path.display()))?
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            None => BTreeSet::new(),
        };
        if !ignore.is_empty() {
            log::debug!("Ignoring functions: {ignore:?}");
        }

        let sources = kinds
            .iter()
            .zip(files)
            .map(|(&kind, file)| TimingSource::from_file(kind, file))
            .collect::<Result<_>>()?;

        Ok(Analyzer {
            sources,
            ignore,
            verbose: false,
        })
    }

    /// Build an analyzer from already-configured sources.
    pub fn from_sources(sources: Vec<TimingSource>) -> Self {
        Analyzer {
            sources,
            ..Analyzer::default()
        }
    }

    /// Leave the named functions out of every total.
    pub fn ignore(&mut self, names: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.ignore.extend(names.into_iter().map(Into::into));
        self
    }

    /// Collect per-opcode, per-function and per-call breakdowns.
    pub fn verbose(&mut self, verbose: bool) -> &mut Self {
        self.verbose = verbose;
        self
    }

    /// Price `info` with every configured source.
    ///
    /// Only the first source of each kind contributes; later ones are skipped
    /// with a warning.
    pub fn run(&self, info: &ProfileInfo) -> TimingReport {
        let mut report = TimingReport::default();
        if self.verbose {
            report.breakdown = Some(Breakdown::default());
        }
        let mut seen = BTreeSet::new();
        for source in &self.sources {
            if !seen.insert(source.kind()) {
                log::warn!("ignoring extra {} timing source", source.kind());
                continue;
            }
            match source {
                TimingSource::Block(timing) => self.block_timing(info, timing, &mut report),
                TimingSource::Mpi(timing) => self.mpi_timing(info, timing, &mut report),
                TimingSource::LibCall(timing) => self.call_timing(info, timing, &mut report),
            }
        }
        report
    }

    fn is_ignored(&self, info: &ProfileInfo, function: usize) -> bool {
        self.ignore.contains(&info.module().functions[function].name)
    }

    fn block_timing(&self, info: &ProfileInfo, timing: &BlockTiming, report: &mut TimingReport) {
        for (fi, func) in info.module().defined_functions() {
            if self.is_ignored(info, fi) {
                continue;
            }
            let mut func_ns = 0.0;
            for (bi, block) in func.blocks.iter().enumerate() {
                let executions = info.execution_count(fi, BlockId(bi as u32));
                func_ns += executions as f64 * timing.count(block);
                report.instructions += executions * timing.ir_count(block);
                if let Some(breakdown) = &mut report.breakdown {
                    for op in timing::opcodes(block) {
                        let entry = breakdown.opcodes.entry(op.to_string()).or_default();
                        entry.0 += executions;
                        entry.1 += executions as f64 * timing.instruction_cost(op);
                    }
                }
            }
            if let Some(breakdown) = &mut report.breakdown {
                breakdown.functions.push((func.name.clone(), func_ns));
            }
            report.block_ns += func_ns;
        }
    }

    fn mpi_timing(&self, info: &ProfileInfo, timing: &MpiTiming, report: &mut TimingReport) {
        for call in info.timed_calls() {
            if self.is_ignored(info, call.site.function) {
                continue;
            }
            if matches!(call.site.op.stem, "init" | "comm_rank" | "comm_size") {
                continue;
            }
            report.real_mpi_seconds += call.seconds;
            if call.site.op.category == CommCategory::Wait {
                report.real_wait_seconds += call.seconds;
            }
        }

        for call in info.trapped_calls() {
            if self.is_ignored(info, call.site.function) {
                continue;
            }
            let block_frequency = info.block_frequency(call);
            let estimate = timing
                .model
                .estimate(call.category(), block_frequency, call.bytes);
            let fitting = timing.fitting.estimate(
                call.site.op.stem,
                call.calls,
                call.bytes,
                timing.model.processes,
            );
            log::debug!(
                "  {}\tBB:{block_frequency}\tT:{estimate}\tN:{}:{}",
                call.index,
                info.module().functions[call.site.function].name,
                call.site.block.0
            );

            report.mpi_ns += estimate;
            report.fitting_ns += fitting;
            report.mpi_calls += block_frequency;
            report.comm_amount = report.comm_amount.saturating_add(call.bytes);
            if let Some(breakdown) = &mut report.breakdown {
                breakdown.calls.push(CallBreakdown {
                    index: call.index,
                    function: info.module().functions[call.site.function].name.clone(),
                    block: call.site.block,
                    callee: call.site.callee.clone(),
                    block_frequency,
                    estimate_ns: estimate,
                });
            }
        }
    }

    fn call_timing(&self, info: &ProfileInfo, timing: &LibCallTiming, report: &mut TimingReport) {
        for (fi, func) in info.module().defined_functions() {
            if self.is_ignored(info, fi) {
                continue;
            }
            for (bi, block) in func.blocks.iter().enumerate() {
                let executions = info.execution_count(fi, BlockId(bi as u32));
                report.call_ns += block
                    .insts
                    .iter()
                    .filter_map(Inst::callee_name)
                    .map(|callee| timing.count(callee, executions))
                    .sum::<f64>();
            }
        }
    }
}

/// The totals of an aggregation run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TimingReport {
    /// Computation time, in nanoseconds.
    pub block_ns: f64,
    /// Modeled communication time, in nanoseconds.
    pub mpi_ns: f64,
    /// Library-call time, in nanoseconds.
    pub call_ns: f64,
    /// Executed program instructions.
    pub instructions: u64,
    /// Executed trapped communication calls.
    pub mpi_calls: u64,
    /// Bytes moved by trapped communication calls.
    pub comm_amount: u64,
    /// Measured communication time, in seconds.
    pub real_mpi_seconds: f64,
    /// Measured time in waits and barriers, in seconds.
    pub real_wait_seconds: f64,
    /// Communication time according to the fitted model, in nanoseconds.
    pub fitting_ns: f64,
    /// Breakdowns, in verbose mode.
    pub breakdown: Option<Breakdown>,
}

impl TimingReport {
    /// The sum of computation, communication and library-call time.
    pub fn total_ns(&self) -> f64 {
        self.block_ns + self.mpi_ns + self.call_ns
    }
}

/// Detailed contributions to a [`TimingReport`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Breakdown {
    /// Execution count and time per opcode.
    pub opcodes: BTreeMap<String, (u64, f64)>,
    /// Computation time per function, in module order.
    pub functions: Vec<(String, f64)>,
    /// Modeled time per trapped call, in program order.
    pub calls: Vec<CallBreakdown>,
}

/// A trapped call's contribution to the modeled communication time.
#[derive(Clone, Debug, PartialEq)]
pub struct CallBreakdown {
    /// The trap index.
    pub index: usize,
    /// The enclosing function.
    pub function: String,
    /// The enclosing block.
    pub block: BlockId,
    /// The called function.
    pub callee: String,
    /// How often the enclosing block executed.
    pub block_frequency: u64,
    /// The modeled time.
    pub estimate_ns: f64,
}

impl fmt::Display for TimingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Block Timing: {} ns", self.block_ns)?;
        writeln!(f, "MPI Timing: {} ns", self.mpi_ns)?;
        writeln!(f, "Call Timing: {} ns", self.call_ns)?;
        writeln!(f, "Timing: {} ns", self.total_ns())?;
        writeln!(f, "Inst Num: {}", self.instructions)?;
        writeln!(f, "Mpi Num: {}", self.mpi_calls)?;
        writeln!(f, "Comm Amount: {}", self.comm_amount)?;
        writeln!(f, "Real MPI Timing: {} ns", self.real_mpi_seconds * 1e9)?;
        writeln!(f, "Real MPI Wait Timing: {} ns", self.real_wait_seconds * 1e9)?;
        writeln!(f, "MPI Fitting Timing: {} ns", self.fitting_ns)?;

        let Some(breakdown) = &self.breakdown else {
            return Ok(());
        };
        if !breakdown.opcodes.is_empty() {
            writeln!(f, "\nInstructions:")?;
            for (op, (count, ns)) in &breakdown.opcodes {
                writeln!(f, "  {op}\t{count}\t{ns} ns")?;
            }
        }
        if !breakdown.functions.is_empty() {
            writeln!(f, "\nFunctions:")?;
            for (name, ns) in &breakdown.functions {
                writeln!(f, "  {ns}\t{name}")?;
            }
        }
        if !breakdown.calls.is_empty() {
            writeln!(f, "\nCommunication calls:")?;
            for c in &breakdown.calls {
                writeln!(
                    f,
                    "  {}\t{}\tBB:{}\tT:{}\t{}:{}",
                    c.index, c.callee, c.block_frequency, c.estimate_ns, c.function, c.block.0
                )?;
            }
        }
        Ok(())
    }
}
