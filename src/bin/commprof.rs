use anyhow::{Context, Result};
use clap::Parser;
use commprof::exec::{Machine, SimulatedMpi};
use commprof::runtime::{DEFAULT_OUTPUT, OUTPUT_ENV};
use commprof::storage::{self, Record};
use commprof::timing::TimingKind;
use commprof::{Analyzer, Module, Profile, ProfileInfo};
use std::path::PathBuf;

/// Edge and communication-call profiling with an MPI cost model.
#[derive(Parser)]
enum Command {
    Instrument(InstrumentCommand),
    Run(RunCommand),
    Show(ShowCommand),
    Timing(TimingCommand),
    Convert(ConvertCommand),
    Compare(CompareCommand),
    Comm(CommCommand),
}

/// Instrument a module for profiling.
#[derive(Parser)]
struct InstrumentCommand {
    #[clap(flatten)]
    instrumenter: commprof::Instrumenter,

    /// The output path for the instrumented module.
    #[clap(short, long, default_value = "instrumented.json")]
    output: PathBuf,

    /// The input module.
    module: PathBuf,
}

/// Execute a module as one process of a parallel run, appending the profile
/// it writes at exit.
#[derive(Parser)]
struct RunCommand {
    /// This process's rank.
    #[clap(long, default_value = "0")]
    rank: i32,

    /// The number of processes.
    #[clap(long, default_value = "1")]
    size: i32,

    /// Seconds each communication call takes.
    #[clap(long, default_value = "0.000001")]
    call_seconds: f64,

    /// The profile file to append to. Defaults to `$COMMPROF_OUTPUT`, then
    /// `commprof.out`.
    #[clap(short, long)]
    output: Option<PathBuf>,

    /// The (instrumented) module to run.
    module: PathBuf,

    /// Arguments recorded for this execution.
    args: Vec<String>,
}

/// Merge profiles and print them as JSON.
#[derive(Parser)]
struct ShowCommand {
    /// The profile files.
    #[clap(required = true)]
    profiles: Vec<PathBuf>,
}

/// Estimate the run time of a profiled program.
#[derive(Parser)]
struct TimingCommand {
    /// The timing sources, in order: any of block, mpi, libcall.
    #[clap(short, long = "source", value_delimiter = ',')]
    sources: Vec<TimingKind>,

    /// The JSON file configuring each timing source, in the same order.
    #[clap(short = 'f', long = "source-file")]
    source_files: Vec<PathBuf>,

    /// A file of whitespace-separated function names to leave out.
    #[clap(long)]
    ignore: Option<PathBuf>,

    /// Print per-opcode, per-function and per-call breakdowns.
    #[clap(short, long)]
    verbose: bool,

    /// The original, uninstrumented module.
    #[clap(short, long)]
    module: PathBuf,

    /// The profile files.
    #[clap(required = true)]
    profiles: Vec<PathBuf>,
}

/// Convert an edge profile into a block profile.
#[derive(Parser)]
struct ConvertCommand {
    /// The output path for the block profile.
    #[clap(short, long, default_value = "commprof.blocks.out")]
    output: PathBuf,

    /// The original, uninstrumented module.
    #[clap(short, long)]
    module: PathBuf,

    /// The edge profile files.
    #[clap(required = true)]
    profiles: Vec<PathBuf>,
}

/// Compare two profiles.
#[derive(Parser)]
struct CompareCommand {
    lhs: PathBuf,
    rhs: PathBuf,
}

/// Print the bytes moved by every trapped communication call.
#[derive(Parser)]
struct CommCommand {
    /// The original, uninstrumented module.
    #[clap(short, long)]
    module: PathBuf,

    /// The profile files.
    #[clap(required = true)]
    profiles: Vec<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();
    match Command::parse() {
        Command::Instrument(cmd) => instrument(cmd),
        Command::Run(cmd) => run(cmd),
        Command::Show(cmd) => show(cmd),
        Command::Timing(cmd) => timing(cmd),
        Command::Convert(cmd) => convert(cmd),
        Command::Compare(cmd) => compare(cmd),
        Command::Comm(cmd) => comm(cmd),
    }
}

fn instrument(cmd: InstrumentCommand) -> Result<()> {
    let module = Module::from_file(&cmd.module)?;
    let instrumented = cmd.instrumenter.instrument(&module)?;
    let json = serde_json::to_string_pretty(&instrumented)?;
    std::fs::write(&cmd.output, json)
        .with_context(|| format!("failed to write `{}`", cmd.output.display()))?;
    Ok(())
}

fn run(cmd: RunCommand) -> Result<()> {
    let module = Module::from_file(&cmd.module)?;
    let mut host = SimulatedMpi::new(cmd.rank, cmd.size);
    host.call_seconds(cmd.call_seconds);

    let mut args = vec![cmd.module.display().to_string()];
    args.extend(cmd.args);
    let records = Machine::new(&module, host).run(&args)?;
    if records.is_empty() {
        log::warn!("`{}` is not instrumented; no profile written", cmd.module.display());
        return Ok(());
    }

    let output = cmd
        .output
        .or_else(|| std::env::var_os(OUTPUT_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT));
    storage::append_records(&output, &records)
}

fn show(cmd: ShowCommand) -> Result<()> {
    let profile = Profile::from_files(&cmd.profiles)?;
    println!("{}", serde_json::to_string_pretty(&profile)?);
    Ok(())
}

fn timing(cmd: TimingCommand) -> Result<()> {
    let mut analyzer = Analyzer::new(&cmd.sources, &cmd.source_files, cmd.ignore.as_deref())?;
    analyzer.verbose(cmd.verbose);
    let module = Module::from_file(&cmd.module)?;
    let profile = Profile::from_files(&cmd.profiles)?;
    let info = ProfileInfo::new(&module, &profile)?;
    print!("{}", analyzer.run(&info));
    Ok(())
}

fn convert(cmd: ConvertCommand) -> Result<()> {
    let module = Module::from_file(&cmd.module)?;
    let profile = Profile::from_files(&cmd.profiles)?;
    let info = ProfileInfo::new(&module, &profile)?;
    let mut records: Vec<Record> = profile
        .executions()
        .iter()
        .cloned()
        .map(Record::Arguments)
        .collect();
    records.push(info.block_record()?);
    std::fs::write(&cmd.output, storage::encode_records(&records)?)
        .with_context(|| format!("failed to write `{}`", cmd.output.display()))?;
    Ok(())
}

fn compare(cmd: CompareCommand) -> Result<()> {
    let lhs = Profile::from_file(&cmd.lhs)?;
    let rhs = Profile::from_file(&cmd.rhs)?;
    if !commprof::compare(&lhs, &rhs) {
        anyhow::bail!(
            "`{}` and `{}` are not comparable",
            cmd.lhs.display(),
            cmd.rhs.display()
        );
    }
    Ok(())
}

fn comm(cmd: CommCommand) -> Result<()> {
    let module = Module::from_file(&cmd.module)?;
    let profile = Profile::from_files(&cmd.profiles)?;
    let info = ProfileInfo::new(&module, &profile)?;
    for call in info.trapped_calls() {
        let block_frequency = info.block_frequency(call);
        let per_call = if block_frequency == 0 {
            0.0
        } else {
            call.bytes as f64 / block_frequency as f64
        };
        println!(
            "{}\t{per_call}\t{}\t{block_frequency}",
            call.site.callee, call.bytes
        );
    }
    Ok(())
}
