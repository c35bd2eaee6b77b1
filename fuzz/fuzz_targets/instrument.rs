//! Fuzz the instrumentation pass on arbitrary control-flow graphs.

#![no_main]

use commprof::exec::{Machine, SimulatedMpi};
use commprof::ir::{Block, BlockId, Callee, Function, Inst, Module, Operand, Terminator};
use commprof::{num_edge_slots, InstrumentationStrategy, Instrumenter, Profile, ProfileInfo};
use libfuzzer_sys::{
    arbitrary::{self, Arbitrary},
    fuzz_target,
};

#[derive(Arbitrary, Debug)]
enum FuzzTerminator {
    Br(u8),
    CondBr(u8, u8),
    Switch(u8, Vec<u8>),
    Ret,
}

#[derive(Arbitrary, Debug)]
struct FuzzBlock {
    send: bool,
    terminator: FuzzTerminator,
}

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    functions: Vec<Vec<FuzzBlock>>,
    strategies: Vec<u8>,
}

impl FuzzInput {
    fn module(&self) -> Module {
        let functions = self
            .functions
            .iter()
            .enumerate()
            .map(|(i, blocks)| {
                // Branches never re-enter block 0.
                let n = blocks.len() as u32;
                let target = |b: &u8| BlockId(1 + u32::from(*b) % n.saturating_sub(1).max(1));
                Function {
                    name: if i == 0 { "main".into() } else { format!("f{i}") },
                    blocks: blocks
                        .iter()
                        .map(|b| Block {
                            name: String::new(),
                            insts: if b.send {
                                vec![Inst::Call {
                                    callee: Callee::Direct("MPI_Send".into()),
                                    args: vec![
                                        Operand::Var("buf".into()),
                                        Operand::Const(4),
                                        Operand::Const(8),
                                    ],
                                }]
                            } else {
                                vec![]
                            },
                            terminator: match &b.terminator {
                                _ if n < 2 => Terminator::Ret,
                                FuzzTerminator::Br(t) => Terminator::Br(target(t)),
                                FuzzTerminator::CondBr(t, e) => Terminator::CondBr {
                                    cond: Operand::Var("c".into()),
                                    then_block: target(t),
                                    else_block: target(e),
                                },
                                FuzzTerminator::Switch(d, cases) => Terminator::Switch {
                                    value: Operand::Var("x".into()),
                                    default: target(d),
                                    cases: cases
                                        .iter()
                                        .enumerate()
                                        .map(|(v, t)| (v as i64, target(t)))
                                        .collect(),
                                },
                                FuzzTerminator::Ret => Terminator::Ret,
                            },
                        })
                        .collect(),
                }
            })
            .collect();
        Module {
            functions,
            globals: vec![],
        }
    }

    fn instrumenter(&self) -> Instrumenter {
        // Edge counting is always on, which rules out edge-rank.
        let all = [
            InstrumentationStrategy::Edge,
            InstrumentationStrategy::Rank,
            InstrumentationStrategy::Comm,
            InstrumentationStrategy::Time,
            InstrumentationStrategy::WeightedBlock,
        ];
        let mut strategies: Vec<_> = self
            .strategies
            .iter()
            .map(|s| all[usize::from(*s) % all.len()])
            .collect();
        strategies.sort_by_key(|s| s.entry_point());
        strategies.dedup();
        if !strategies.contains(&InstrumentationStrategy::Edge) {
            strategies.push(InstrumentationStrategy::Edge);
        }
        let mut i = Instrumenter::new();
        i.strategies(strategies);
        i
    }
}

fuzz_target!(|input: FuzzInput| {
    let module = input.module();
    if module.function("main").map_or(true, |f| f.is_declaration()) {
        return;
    }
    let Ok(instrumented) = input.instrumenter().instrument(&module) else {
        return;
    };
    instrumented
        .validate()
        .expect("instrumentation produces a valid module");

    let increments = |counters: &str| {
        instrumented
            .functions
            .iter()
            .flat_map(|f| &f.blocks)
            .flat_map(|b| &b.insts)
            .filter(|i| matches!(i, Inst::Increment { counters: c, .. } if c == counters))
            .count()
    };
    let slots = num_edge_slots(&module);
    let counters = instrumented
        .global("__commprof_edge_counters")
        .expect("edge counters are declared");
    assert_eq!(counters.len as usize, slots);
    assert_eq!(increments("__commprof_edge_counters"), slots);

    // Executions that finish must produce a profile that fits the original.
    let mut machine = Machine::new(&instrumented, SimulatedMpi::new(0, 1));
    machine.max_steps(10_000);
    if let Ok(records) = machine.run(&[]) {
        let profile = Profile::from_records(records).expect("fresh profile decodes");
        ProfileInfo::new(&module, &profile).expect("fresh profile fits its module");
    }
});
