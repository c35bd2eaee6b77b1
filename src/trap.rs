//! Trapping values and timings at communication call sites.
//!
//! Trapped call sites are numbered in program order: functions in module
//! order, blocks in id order, instructions in block order. Both the
//! instrumentation and the profile reader enumerate sites through
//! [`comm_sites`] and [`timed_sites`], so a site's counter slots always line up
//! with the call they describe.

use crate::comm::{self, CommOp};
use crate::ir::{BlockId, Callee, CounterType, Global, Inst, Module, Operand};
use anyhow::Result;

/// The value a rank counter holds when no rank query was found or executed.
///
/// Distinct from every real rank, which are non-negative.
pub const RANK_UNKNOWN: i32 = -1;

/// A communication call site.
#[derive(Clone, Debug, PartialEq)]
pub struct CallSite {
    /// The index of the enclosing function in the module.
    pub function: usize,
    /// The enclosing block.
    pub block: BlockId,
    /// The index of the call within its block.
    pub inst: usize,
    /// The called function's name.
    pub callee: String,
    /// The recognized operation.
    pub op: CommOp,
}

fn call_sites(module: &Module, mut keep: impl FnMut(&CommOp, &[Operand]) -> bool) -> Vec<CallSite> {
    let mut sites = vec![];
    for (function, func) in module.defined_functions() {
        for block in func.block_ids() {
            for (inst, i) in func.block(block).insts.iter().enumerate() {
                let Inst::Call { callee, args } = i else {
                    continue;
                };
                let Callee::Direct(callee) = callee else {
                    continue;
                };
                let Some(op) = CommOp::lookup(callee) else {
                    continue;
                };
                if keep(&op, args) {
                    sites.push(CallSite {
                        function,
                        block,
                        inst,
                        callee: callee.clone(),
                        op,
                    });
                }
            }
        }
    }
    sites
}

/// Every call site whose payload size gets trapped by the `comm` strategy.
pub fn comm_sites(module: &Module) -> Vec<CallSite> {
    call_sites(module, |op, args| match op.payload {
        Some((count, datatype)) if op.moves_data() => args.len() > count.max(datatype),
        _ => false,
    })
}

/// Every call site the `time` strategy measures.
pub fn timed_sites(module: &Module) -> Vec<CallSite> {
    call_sites(module, |_, _| true)
}

/// Insert a trap that copies the rank output argument of the first rank
/// query into a one-slot counter array.
pub(crate) fn trap_rank(module: &mut Module, counters: &str) -> Result<Operand> {
    module.declare_global(Global {
        name: counters.to_string(),
        ty: CounterType::I32,
        len: 1,
        init: RANK_UNKNOWN.into(),
    })?;

    let mut found = None;
    'search: for (function, func) in module.defined_functions() {
        for block in func.block_ids() {
            for (inst, i) in func.block(block).insts.iter().enumerate() {
                let Inst::Call { callee, args } = i else {
                    continue;
                };
                let name = match callee {
                    Callee::Direct(name) => name,
                    Callee::Indirect(_) => {
                        log::warn!(
                            "unresolved callee at call {inst} of block {} in `{}`",
                            block.0,
                            func.name
                        );
                        continue;
                    }
                };
                if comm::is_rank_query(name) {
                    found = Some((function, block, inst, args.get(1).cloned()));
                    break 'search;
                }
            }
        }
    }

    match found {
        Some((function, block, inst, Some(rank))) => {
            log::debug!(
                "Trapping rank after call {inst} of block {} in `{}`",
                block.0,
                module.functions[function].name
            );
            module.functions[function].insert_after(
                block,
                inst,
                Inst::Store {
                    counters: counters.to_string(),
                    slot: 0,
                    value: rank,
                },
            );
        }
        Some((function, block, _, None)) => log::warn!(
            "rank query in block {} of `{}` has no rank argument; rank will be unknown",
            block.0,
            module.functions[function].name
        ),
        None => log::warn!("no rank query found; rank will be recorded as unknown"),
    }

    Ok(Operand::Global(counters.to_string()))
}

/// Insert call and byte counters after every data-moving communication call.
pub(crate) fn trap_comm(module: &mut Module, counters: &str) -> Result<Operand> {
    let sites = comm_sites(module);
    module.declare_global(Global {
        name: counters.to_string(),
        ty: CounterType::U64,
        len: u32::try_from(sites.len() * 2)?,
        init: 0,
    })?;

    // Insert back to front so that earlier instruction indices stay valid.
    for (index, site) in sites.iter().enumerate().rev() {
        let Some((count, datatype)) = site.op.payload else {
            continue;
        };
        let func = &mut module.functions[site.function];
        let Inst::Call { args, .. } = &func.block(site.block).insts[site.inst] else {
            unreachable!("trapped site is not a call");
        };
        let trap = Inst::Accumulate {
            counters: counters.to_string(),
            slot: u32::try_from(index * 2)?,
            count: args[count].clone(),
            datatype: args[datatype].clone(),
        };
        func.insert_after(site.block, site.inst, trap);
    }

    log::debug!("Trapped {} communication call sites", sites.len());
    Ok(Operand::Global(counters.to_string()))
}

/// Bracket every communication call with a timer.
pub(crate) fn trap_time(module: &mut Module, counters: &str) -> Result<Operand> {
    let sites = timed_sites(module);
    module.declare_global(Global {
        name: counters.to_string(),
        ty: CounterType::F64,
        len: u32::try_from(sites.len())?,
        init: 0,
    })?;

    for (index, site) in sites.iter().enumerate().rev() {
        let func = &mut module.functions[site.function];
        func.insert_after(
            site.block,
            site.inst,
            Inst::TimerStop {
                counters: counters.to_string(),
                slot: u32::try_from(index)?,
            },
        );
        func.block_mut(site.block)
            .insts
            .insert(site.inst, Inst::TimerStart);
    }

    log::debug!("Timing {} communication call sites", sites.len());
    Ok(Operand::Global(counters.to_string()))
}
