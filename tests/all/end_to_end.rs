//! Instrument, execute, read back and price whole programs.

use crate::{assert_no_diff, module};
use anyhow::Result;
use commprof::cost::{FittingModel, LatencyModel};
use commprof::exec::{Machine, SimulatedMpi};
use commprof::ir::{BlockId, Module};
use commprof::storage::{self, Record};
use commprof::timing::{BlockTiming, MpiTiming, TimingSource};
use commprof::{Analyzer, InstrumentationStrategy, Instrumenter, Profile, ProfileInfo};
use std::collections::BTreeSet;

const SEND: &str = r#"
{
  "functions": [
    {
      "name": "main",
      "blocks": [
        {
          "name": "entry",
          "insts": [
            { "call": { "callee": { "direct": "MPI_Comm_rank" }, "args": [ { "const": 0 }, { "var": "rank" } ] } }
          ],
          "terminator": { "br": 1 }
        },
        {
          "name": "send",
          "insts": [
            {
              "call": {
                "callee": { "direct": "MPI_Send" },
                "args": [ { "var": "buf" }, { "const": 100 }, { "const": 8 }, { "const": 1 }, { "const": 0 }, { "const": 0 } ]
              }
            },
            { "call": { "callee": { "direct": "MPI_Barrier" }, "args": [ { "const": 0 } ] } }
          ],
          "terminator": "ret"
        }
      ]
    }
  ]
}
"#;

const LOOP: &str = r#"
{
  "functions": [
    {
      "name": "main",
      "blocks": [
        {
          "name": "entry",
          "insts": [ { "op": { "opcode": "mov", "dest": "i", "operands": [ { "const": 0 } ] } } ],
          "terminator": { "br": 1 }
        },
        {
          "name": "loop",
          "insts": [
            { "op": { "opcode": "add", "dest": "i", "operands": [ { "var": "i" }, { "const": 1 } ] } },
            { "op": { "opcode": "lt", "dest": "c", "operands": [ { "var": "i" }, { "const": 3 } ] } }
          ],
          "terminator": { "cond_br": { "cond": { "var": "c" }, "then_block": 1, "else_block": 2 } }
        },
        { "name": "exit", "terminator": "ret" }
      ]
    }
  ]
}
"#;

fn profile(
    program: &Module,
    strategies: &[InstrumentationStrategy],
    host: SimulatedMpi,
) -> Result<Vec<Record>> {
    let _ = env_logger::try_init();
    let mut instrumenter = Instrumenter::new();
    instrumenter.strategies(strategies.iter().copied());
    let instrumented = instrumenter.instrument(program)?;
    Machine::new(&instrumented, host).run(&["a.out".to_string()])
}

fn mpi_source(latency_ns: f64, bandwidth: f64, processes: u32) -> TimingSource {
    TimingSource::Mpi(MpiTiming {
        model: LatencyModel {
            latency_ns,
            bandwidth,
            processes,
        },
        fitting: FittingModel::default(),
    })
}

fn block_source() -> TimingSource {
    TimingSource::Block(BlockTiming {
        default_cost: 1.0,
        ..BlockTiming::default()
    })
}

#[test]
fn point_to_point_send() -> Result<()> {
    let program = module(SEND);
    let records = profile(
        &program,
        &[InstrumentationStrategy::EdgeRank, InstrumentationStrategy::Comm],
        SimulatedMpi::new(3, 4),
    )?;
    let profile = Profile::from_records(records)?;

    assert_eq!(profile.num_executions(), 1);
    assert_eq!(profile.edge_counts(), Some(&[1, 1][..]));
    assert_eq!(profile.ranks(), &BTreeSet::from([3]));
    assert!(!profile.has_unknown_rank());

    let info = ProfileInfo::new(&program, &profile)?;
    let calls = info.trapped_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].site.callee, "MPI_Send");
    assert_eq!(calls[0].calls, 1);
    assert_eq!(calls[0].bytes, 800);
    assert_eq!(info.block_frequency(&calls[0]), 1);

    let report = Analyzer::from_sources(vec![mpi_source(1000.0, 2.0, 4)]).run(&info);
    assert_eq!(report.mpi_ns, 1000.0 + 800.0 / 2.0);
    assert_eq!(report.mpi_calls, 1);
    assert_eq!(report.comm_amount, 800);
    assert_eq!(report.total_ns(), report.mpi_ns);
    Ok(())
}

#[test]
fn measured_communication_time() -> Result<()> {
    let program = module(SEND);
    let mut host = SimulatedMpi::new(1, 2);
    host.call_seconds(0.5);
    let records = profile(&program, &[InstrumentationStrategy::Time], host)?;
    let profile = Profile::from_records(records)?;
    assert_eq!(profile.comm_seconds(), Some(&[0.5, 0.5, 0.5][..]));
    assert_eq!(profile.ranks(), &BTreeSet::from([1]));

    let info = ProfileInfo::new(&program, &profile)?;
    assert_eq!(info.timed_calls().len(), 3);
    let report = Analyzer::from_sources(vec![mpi_source(1000.0, 2.0, 2)]).run(&info);
    // The rank query is not communication; the barrier is also a wait.
    assert_eq!(report.real_mpi_seconds, 1.0);
    assert_eq!(report.real_wait_seconds, 0.5);
    assert_eq!(report.mpi_ns, 0.0);
    Ok(())
}

#[test]
fn loop_counts() -> Result<()> {
    let program = module(LOOP);
    let records = profile(&program, &[InstrumentationStrategy::Edge], SimulatedMpi::new(0, 1))?;
    // One arguments record and a single exit handler's edge record.
    assert_eq!(records.len(), 2);
    let profile = Profile::from_records(records)?;
    assert_eq!(profile.edge_counts(), Some(&[1, 1, 2, 1][..]));

    let info = ProfileInfo::new(&program, &profile)?;
    assert_eq!(info.function_count(0), Some(1));
    assert_eq!(info.execution_count(0, BlockId(0)), 1);
    assert_eq!(info.execution_count(0, BlockId(1)), 3);
    assert_eq!(info.execution_count(0, BlockId(2)), 1);
    assert_eq!(info.edge_count(0, BlockId(1), 0), Some(2));
    assert_eq!(info.edge_count(0, BlockId(1), 1), Some(1));
    assert_eq!(info.block_record()?, Record::Blocks(vec![1, 3, 1]));

    let report = Analyzer::from_sources(vec![block_source()]).run(&info);
    assert_no_diff(
        "\
Block Timing: 12 ns
MPI Timing: 0 ns
Call Timing: 0 ns
Timing: 12 ns
Inst Num: 12
Mpi Num: 0
Comm Amount: 0
Real MPI Timing: 0 ns
Real MPI Wait Timing: 0 ns
MPI Fitting Timing: 0 ns
",
        &report.to_string(),
    );
    Ok(())
}

#[test]
fn weighted_blocks() -> Result<()> {
    let _ = env_logger::try_init();
    let program = module(LOOP);
    let mut instrumenter = Instrumenter::new();
    instrumenter
        .strategies([
            InstrumentationStrategy::Edge,
            InstrumentationStrategy::WeightedBlock,
        ])
        .weight("main:1=i".parse()?)
        .weight("main:2=10".parse()?);
    let instrumented = instrumenter.instrument(&program)?;
    let records = Machine::new(&instrumented, SimulatedMpi::new(0, 1)).run(&[])?;
    assert!(records.contains(&Record::WeightedBlocks(vec![0.0, 6.0, 10.0])));

    let profile = Profile::from_records(records)?;
    assert_eq!(profile.edge_counts(), Some(&[1, 1, 2, 1][..]));
    let info = ProfileInfo::new(&program, &profile)?;
    // `i` is 1, 2 and 3 at the end of the three iterations.
    assert_eq!(info.block_weight(0, BlockId(1)), Some(6.0));
    assert_eq!(info.block_weight(0, BlockId(2)), Some(10.0));
    assert_eq!(info.execution_count(0, BlockId(1)), 3);
    Ok(())
}

#[test]
fn converted_profiles_keep_block_counts() -> Result<()> {
    let program = module(LOOP);
    let records = profile(&program, &[InstrumentationStrategy::Edge], SimulatedMpi::new(0, 1))?;
    let edges = Profile::from_records(records)?;
    let info = ProfileInfo::new(&program, &edges)?;

    let bytes = storage::encode_records(&[info.block_record()?])?;
    let blocks = Profile::from_bytes(&bytes)?;
    let converted = ProfileInfo::new(&program, &blocks)?;
    for block in program.functions[0].block_ids() {
        assert_eq!(
            converted.execution_count(0, block),
            info.execution_count(0, block)
        );
    }
    Ok(())
}

#[test]
fn ignored_functions_contribute_nothing() -> Result<()> {
    let program = module(
        r#"
{
  "functions": [
    {
      "name": "exchange",
      "blocks": [
        {
          "insts": [
            {
              "call": {
                "callee": { "direct": "mpi_allreduce_" },
                "args": [ { "var": "in" }, { "var": "out" }, { "const": 4 }, { "const": 8 } ]
              }
            },
            { "op": { "opcode": "add", "dest": "x", "operands": [ { "var": "x" }, { "const": 1 } ] } }
          ],
          "terminator": "ret"
        }
      ]
    },
    {
      "name": "main",
      "blocks": [
        { "insts": [ { "call": { "callee": { "direct": "exchange" } } } ], "terminator": "ret" }
      ]
    }
  ]
}
        "#,
    );
    let records = profile(
        &program,
        &[InstrumentationStrategy::Edge, InstrumentationStrategy::Comm],
        SimulatedMpi::new(0, 1),
    )?;
    let profile = Profile::from_records(records)?;
    let info = ProfileInfo::new(&program, &profile)?;

    let sources = vec![block_source(), mpi_source(1000.0, 1.0, 4)];
    let all = Analyzer::from_sources(sources.clone()).run(&info);
    assert!(all.mpi_ns > 0.0);
    assert_eq!(all.block_ns, 2.0 + 3.0);

    let mut analyzer = Analyzer::from_sources(sources);
    analyzer.ignore(["exchange"]);
    let ignored = analyzer.run(&info);
    assert_eq!(ignored.mpi_ns, 0.0);
    assert_eq!(ignored.comm_amount, 0);
    assert_eq!(ignored.block_ns, 2.0);

    // The raw counters still see the call.
    let comm = profile.comm().unwrap();
    assert_eq!((comm[0].calls, comm[0].bytes), (1, 32));
    Ok(())
}

#[test]
fn missing_rank_query_records_unknown_rank() -> Result<()> {
    let program = module(LOOP);
    let records = profile(&program, &[InstrumentationStrategy::Rank], SimulatedMpi::new(5, 8))?;
    assert_eq!(records[1], Record::Ranks(vec![-1]));
    let profile = Profile::from_records(records)?;
    assert!(profile.has_unknown_rank());
    assert!(profile.ranks().is_empty());
    Ok(())
}

#[test]
fn one_profile_per_process() -> Result<()> {
    let program = module(SEND);
    let dir = tempfile::tempdir()?;
    let mut paths = vec![];
    for rank in 0..2 {
        let records = profile(
            &program,
            &[InstrumentationStrategy::EdgeRank],
            SimulatedMpi::new(rank, 2),
        )?;
        let path = dir.path().join(format!("rank{rank}.out"));
        storage::append_records(&path, &records)?;
        paths.push(path);
    }

    let merged = Profile::from_files(&paths)?;
    assert_eq!(merged.num_executions(), 2);
    assert_eq!(merged.edge_counts(), Some(&[2, 2][..]));
    assert_eq!(merged.ranks(), &BTreeSet::from([0, 1]));
    Ok(())
}

#[test]
fn verbose_breakdown() -> Result<()> {
    let program = module(SEND);
    let records = profile(
        &program,
        &[InstrumentationStrategy::Edge, InstrumentationStrategy::Comm],
        SimulatedMpi::new(0, 1),
    )?;
    let profile = Profile::from_records(records)?;
    let info = ProfileInfo::new(&program, &profile)?;

    let mut analyzer = Analyzer::from_sources(vec![block_source(), mpi_source(10.0, 1.0, 1)]);
    analyzer.verbose(true);
    let report = analyzer.run(&info);
    let breakdown = report.breakdown.as_ref().unwrap();
    assert_eq!(breakdown.opcodes["call"], (3, 3.0));
    assert_eq!(breakdown.functions, [("main".to_string(), 5.0)]);
    assert_eq!(breakdown.calls.len(), 1);
    assert_eq!(breakdown.calls[0].estimate_ns, 10.0 + 800.0);
    assert!(report.to_string().contains("\nCommunication calls:\n"));
    Ok(())
}
