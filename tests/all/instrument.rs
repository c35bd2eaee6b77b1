use crate::{assert_no_diff, module};
use anyhow::{Context, Result};
use commprof::ir::{BlockId, Inst, Operand, Terminator};
use commprof::{num_edge_slots, BlockWeight, InstrumentationStrategy, Instrumenter};

fn assert_instrumentation(
    instrumenter: &Instrumenter,
    input: &str,
    expected_output: &str,
) -> Result<()> {
    let _ = env_logger::try_init();
    let input = module(input);
    let actual = instrumenter
        .instrument(&input)
        .context("failed to instrument input module")?;
    let actual = serde_json::to_string_pretty(&actual)?;
    assert_no_diff(expected_output.trim(), actual.trim());
    Ok(())
}

fn instrumenter(strategy: InstrumentationStrategy) -> Instrumenter {
    let mut i = Instrumenter::new();
    i.strategy(strategy);
    i
}

fn increments(func: &commprof::ir::Function) -> usize {
    func.blocks
        .iter()
        .flat_map(|b| &b.insts)
        .filter(|i| matches!(i, Inst::Increment { .. }))
        .count()
}

const DIAMOND: &str = r#"
{
  "functions": [
    {
      "name": "main",
      "blocks": [
        {
          "name": "entry",
          "terminator": { "cond_br": { "cond": { "var": "c" }, "then_block": 1, "else_block": 2 } }
        },
        { "name": "then", "terminator": { "br": 2 } },
        { "name": "exit", "terminator": "ret" }
      ]
    }
  ]
}
"#;

#[test]
fn empty_module() -> Result<()> {
    assert_instrumentation(
        &instrumenter(InstrumentationStrategy::Edge),
        r#"{ "functions": [] }"#,
        r#"
{
  "functions": [],
  "globals": []
}
        "#,
    )
}

#[test]
fn no_entry_function_is_left_alone() -> Result<()> {
    let input = module(
        r#"{ "functions": [ { "name": "helper", "blocks": [ { "terminator": "ret" } ] } ] }"#,
    );
    let output = instrumenter(InstrumentationStrategy::EdgeRank).instrument(&input)?;
    assert_eq!(input, output);
    Ok(())
}

#[test]
fn entry_declaration_is_an_error() {
    let input = module(r#"{ "functions": [ { "name": "main" } ] }"#);
    assert!(instrumenter(InstrumentationStrategy::Edge)
        .instrument(&input)
        .is_err());
}

#[test]
fn basic() -> Result<()> {
    assert_instrumentation(
        &instrumenter(InstrumentationStrategy::Edge),
        r#"
{
  "functions": [
    {
      "name": "main",
      "blocks": [
        { "name": "entry", "terminator": { "br": 1 } },
        { "name": "exit", "terminator": "ret" }
      ]
    }
  ]
}
        "#,
        r#"
{
  "functions": [
    {
      "name": "main",
      "blocks": [
        {
          "name": "entry",
          "insts": [
            {
              "call": {
                "callee": {
                  "direct": "commprof_start_edge_profiling"
                },
                "args": [
                  {
                    "global": "__commprof_edge_counters"
                  }
                ]
              }
            },
            {
              "increment": {
                "counters": "__commprof_edge_counters",
                "slot": 0
              }
            },
            {
              "increment": {
                "counters": "__commprof_edge_counters",
                "slot": 1
              }
            }
          ],
          "terminator": {
            "br": 1
          }
        },
        {
          "name": "exit",
          "insts": [],
          "terminator": "ret"
        }
      ]
    }
  ],
  "globals": [
    {
      "name": "__commprof_edge_counters",
      "ty": "u64",
      "len": 2,
      "init": 0
    }
  ]
}
        "#,
    )
}

#[test]
fn one_slot_per_function_and_edge() -> Result<()> {
    let input = module(
        r#"
{
  "functions": [
    { "name": "MPI_Send" },
    {
      "name": "f",
      "blocks": [
        { "terminator": { "switch": { "value": { "var": "x" }, "default": 1, "cases": [[0, 1], [1, 2]] } } },
        { "terminator": { "br": 2 } },
        { "terminator": "ret" }
      ]
    },
    {
      "name": "main",
      "blocks": [
        { "insts": [ { "call": { "callee": { "direct": "f" } } } ], "terminator": "ret" }
      ]
    }
  ]
}
        "#,
    );
    // Two functions with bodies, plus 3 + 1 successors in `f`.
    assert_eq!(num_edge_slots(&input), 6);

    let output = instrumenter(InstrumentationStrategy::Edge).instrument(&input)?;
    let counters = output.global("__commprof_edge_counters").unwrap();
    assert_eq!(counters.len, 6);
    let total: usize = output.functions.iter().map(increments).sum();
    assert_eq!(total, 6);
    assert!(output.functions[0].is_declaration());
    Ok(())
}

#[test]
fn critical_edges_are_split_but_not_instrumented() -> Result<()> {
    let input = module(DIAMOND);
    let output = instrumenter(InstrumentationStrategy::Edge).instrument(&input)?;
    let main = &output.functions[0];

    // `entry -> exit` is critical and gets its own block.
    assert_eq!(main.blocks.len(), 4);
    let split = &main.blocks[3];
    assert_eq!(split.terminator, Terminator::Br(BlockId(2)));
    assert_eq!(increments(main), num_edge_slots(&input));
    assert_eq!(
        split
            .insts
            .iter()
            .filter(|i| matches!(i, Inst::Increment { .. }))
            .count(),
        1
    );
    assert_eq!(
        main.blocks[0].terminator.successors().collect::<Vec<_>>(),
        [BlockId(1), BlockId(3)]
    );
    Ok(())
}

#[test]
fn loops_through_the_entry_block_are_rejected() {
    // Counting `head` on entry would count every iteration instead.
    let input = module(
        r#"
{
  "functions": [
    {
      "name": "main",
      "blocks": [
        { "name": "head", "terminator": { "br": 1 } },
        { "name": "latch", "terminator": { "cond_br": { "cond": { "var": "c" }, "then_block": 0, "else_block": 2 } } },
        { "name": "exit", "terminator": "ret" }
      ]
    }
  ]
}
        "#,
    );
    let err = instrumenter(InstrumentationStrategy::Edge)
        .instrument(&input)
        .unwrap_err();
    assert!(err.to_string().contains("entry block"), "{err:#}");
}

#[test]
fn instrumenting_twice_is_an_error() -> Result<()> {
    let i = instrumenter(InstrumentationStrategy::Comm);
    let once = i.instrument(&module(DIAMOND))?;
    assert!(i.instrument(&once).is_err());
    Ok(())
}

#[test]
fn edge_and_edge_rank_cannot_be_combined() {
    let mut i = Instrumenter::new();
    i.strategies([InstrumentationStrategy::Edge, InstrumentationStrategy::EdgeRank]);
    let err = i.instrument(&module(DIAMOND)).unwrap_err();
    assert!(err.to_string().contains("cannot be combined"), "{err:#}");
}

#[test]
fn later_strategies_skip_split_blocks() -> Result<()> {
    let mut i = Instrumenter::new();
    i.strategies([
        InstrumentationStrategy::Edge,
        InstrumentationStrategy::WeightedBlock,
    ]);
    i.weight("main:2=1".parse()?);
    let output = i.instrument(&module(DIAMOND))?;
    assert_eq!(output.functions[0].blocks.len(), 4);
    assert_eq!(output.global("__commprof_edge_counters").unwrap().len, 4);
    assert_eq!(output.global("__commprof_block_weights").unwrap().len, 3);
    Ok(())
}

#[test]
fn block_weights() -> Result<()> {
    let mut i = instrumenter(InstrumentationStrategy::WeightedBlock);
    i.weight("main:1=n".parse()?);
    let output = i.instrument(&module(DIAMOND))?;
    let then = &output.functions[0].blocks[1];
    assert_eq!(
        then.insts,
        [Inst::AddWeight {
            counters: "__commprof_block_weights".into(),
            slot: 1,
            value: Operand::Var("n".into()),
        }]
    );
    // No edges are split without edge counters.
    assert_eq!(output.functions[0].blocks.len(), 3);

    let mut unknown = instrumenter(InstrumentationStrategy::WeightedBlock);
    unknown.weight("solve:0=1".parse()?);
    assert!(unknown.instrument(&module(DIAMOND)).is_err());

    let mut out_of_range = instrumenter(InstrumentationStrategy::WeightedBlock);
    out_of_range.weight("main:3=1".parse()?);
    assert!(out_of_range.instrument(&module(DIAMOND)).is_err());
    Ok(())
}

#[test]
fn block_weight_syntax() -> Result<()> {
    assert_eq!(
        "main:2=10".parse::<BlockWeight>()?,
        BlockWeight {
            function: "main".into(),
            block: BlockId(2),
            value: Operand::Const(10),
        }
    );
    assert_eq!(
        "ns::f:0=-2".parse::<BlockWeight>()?,
        BlockWeight {
            function: "ns::f".into(),
            block: BlockId(0),
            value: Operand::Const(-2),
        }
    );
    assert_eq!("main:1=nnz".parse::<BlockWeight>()?.value, Operand::Var("nnz".into()));
    for bad in ["main", "main:1", "main:x=1", "main:1="] {
        assert!(bad.parse::<BlockWeight>().is_err(), "{bad}");
    }
    Ok(())
}

#[test]
fn strategies_stack() -> Result<()> {
    let mut i = Instrumenter::new();
    i.strategies([
        InstrumentationStrategy::EdgeRank,
        InstrumentationStrategy::Comm,
        InstrumentationStrategy::Time,
    ]);
    let output = i.instrument(&module(DIAMOND))?;
    let entry_points: Vec<_> = output.functions[0].blocks[0]
        .insts
        .iter()
        .filter_map(Inst::callee_name)
        .collect();
    assert_eq!(
        entry_points,
        [
            "commprof_start_time_profiling",
            "commprof_start_comm_profiling",
            "commprof_start_edge_rank_profiling",
        ]
    );
    assert_eq!(output.globals.len(), 5);
    Ok(())
}

#[test]
fn strategy_names() {
    for s in [
        InstrumentationStrategy::Edge,
        InstrumentationStrategy::EdgeRank,
        InstrumentationStrategy::Rank,
        InstrumentationStrategy::Comm,
        InstrumentationStrategy::Time,
        InstrumentationStrategy::WeightedBlock,
    ] {
        assert_eq!(s.to_string().parse::<InstrumentationStrategy>().unwrap(), s);
        assert_eq!(InstrumentationStrategy::from_entry_point(s.entry_point()), Some(s));
    }
    assert!("edges".parse::<InstrumentationStrategy>().is_err());
}
