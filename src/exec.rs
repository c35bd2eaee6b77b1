//! Executing a (possibly instrumented) module.
//!
//! The interpreter runs a module's `main` function the way the instrumented
//! native program would run: counter updates execute as ordinary
//! instructions, runtime initializer calls register exit handlers, and when
//! `main` returns the handlers produce the profile records the process would
//! have written.

use crate::comm::{self, CommOp};
use crate::ir::{BlockId, Callee, CounterType, Inst, Module, Operand, Terminator};
use crate::runtime::exit_record;
use crate::storage::Record;
use crate::InstrumentationStrategy;
use anyhow::{anyhow, bail, ensure, Context, Result};
use std::collections::HashMap;

/// The program's variables, keyed by name. Unset variables read as zero.
#[derive(Default, Debug)]
pub struct Variables {
    values: HashMap<String, i64>,
}

impl Variables {
    /// Read the value an operand denotes.
    pub fn get(&self, operand: &Operand) -> Result<i64> {
        match operand {
            Operand::Const(c) => Ok(*c),
            Operand::Var(name) => Ok(self.values.get(name).copied().unwrap_or(0)),
            Operand::Global(name) => bail!("cannot load counter array `{name}` as a value"),
        }
    }

    /// Write through a variable operand.
    pub fn set(&mut self, operand: &Operand, value: i64) -> Result<()> {
        match operand {
            Operand::Var(name) => {
                self.values.insert(name.clone(), value);
                Ok(())
            }
            _ => bail!("cannot store through {operand:?}"),
        }
    }
}

/// The environment outside the module: external functions and the clock.
pub trait Host {
    /// Call an external function.
    fn call(&mut self, callee: &str, args: &[Operand], vars: &mut Variables) -> Result<()>;

    /// The current time in seconds.
    fn now(&mut self) -> f64;
}

/// A deterministic stand-in for the message-passing library, as seen by one
/// process.
#[derive(Clone, Debug)]
pub struct SimulatedMpi {
    rank: i32,
    size: i32,
    clock: f64,
    call_seconds: f64,
}

impl SimulatedMpi {
    /// A process with the given rank among `size` processes.
    pub fn new(rank: i32, size: i32) -> Self {
        SimulatedMpi {
            rank,
            size,
            clock: 0.0,
            call_seconds: 1e-6,
        }
    }

    /// How far the clock advances during every communication call.
    pub fn call_seconds(&mut self, seconds: f64) -> &mut Self {
        self.call_seconds = seconds;
        self
    }
}

impl Host for SimulatedMpi {
    fn call(&mut self, callee: &str, args: &[Operand], vars: &mut Variables) -> Result<()> {
        let Some(op) = CommOp::lookup(callee) else {
            log::trace!("Ignoring call to external function `{callee}`");
            return Ok(());
        };
        self.clock += self.call_seconds;
        match op.stem {
            "comm_rank" | "comm_size" => {
                let out = args
                    .get(1)
                    .ok_or_else(|| anyhow!("`{callee}` called without an output argument"))?;
                let value = if op.stem == "comm_rank" { self.rank } else { self.size };
                vars.set(out, value.into())
            }
            _ => Ok(()),
        }
    }

    fn now(&mut self) -> f64 {
        self.clock
    }
}

#[derive(Debug)]
enum Counters {
    U64(Vec<u64>),
    I32(Vec<i32>),
    F64(Vec<f64>),
}

/// An interpreter for one execution of a module.
pub struct Machine<'a, H> {
    module: &'a Module,
    host: H,
    vars: Variables,
    counters: HashMap<&'a str, Counters>,
    handlers: Vec<(InstrumentationStrategy, Vec<String>)>,
    timer: Option<f64>,
    steps: u64,
    max_steps: u64,
    max_depth: usize,
}

impl<'a, H: Host> Machine<'a, H> {
    /// Create a machine for `module` with all counter arrays at their initial
    /// values.
    pub fn new(module: &'a Module, host: H) -> Self {
        let counters = module
            .globals
            .iter()
            .map(|g| {
                let len = g.len as usize;
                let counters = match g.ty {
                    CounterType::U64 => Counters::U64(vec![g.init as u64; len]),
                    CounterType::I32 => Counters::I32(vec![g.init as i32; len]),
                    CounterType::F64 => Counters::F64(vec![g.init as f64; len]),
                };
                (g.name.as_str(), counters)
            })
            .collect();
        Machine {
            module,
            host,
            vars: Variables::default(),
            counters,
            handlers: vec![],
            timer: None,
            steps: 0,
            max_steps: 10_000_000,
            max_depth: 1_000,
        }
    }

    /// Limit the number of instructions executed before giving up.
    pub fn max_steps(&mut self, steps: u64) -> &mut Self {
        self.max_steps = steps;
        self
    }

    /// Run `main` to completion and return the records the registered exit
    /// handlers write, preceded by the arguments record.
    ///
    /// A program that never initialized profiling produces no records.
    pub fn run(&mut self, args: &[String]) -> Result<Vec<Record>> {
        self.module.validate()?;
        ensure!(
            self.module.function("main").is_some(),
            "module has no `main` function"
        );
        self.call("main", 0)?;

        if self.handlers.is_empty() {
            return Ok(vec![]);
        }
        let mut records = vec![Record::Arguments(args.to_vec())];
        for (strategy, globals) in &self.handlers {
            records.push(self.exit_record(*strategy, globals)?);
        }
        Ok(records)
    }

    /// The current contents of a 64-bit counter array.
    pub fn counters(&self, name: &str) -> Option<&[u64]> {
        match self.counters.get(name)? {
            Counters::U64(c) => Some(c),
            _ => None,
        }
    }

    fn exit_record(&self, strategy: InstrumentationStrategy, globals: &[String]) -> Result<Record> {
        let mut words = vec![];
        let mut ranks = vec![];
        for name in globals {
            match self.counters.get(name.as_str()) {
                Some(Counters::U64(c)) => words.extend_from_slice(c),
                Some(Counters::F64(c)) => words.extend(c.iter().map(|s| s.to_bits())),
                Some(Counters::I32(c)) => ranks.extend_from_slice(c),
                None => bail!("`{}` was passed unknown counter array `{name}`", strategy.entry_point()),
            }
        }
        Ok(exit_record(strategy, words, ranks))
    }

    fn call(&mut self, name: &str, depth: usize) -> Result<()> {
        ensure!(depth < self.max_depth, "call depth exceeded {}", self.max_depth);
        let module = self.module;
        let func = module
            .function(name)
            .filter(|f| !f.is_declaration())
            .ok_or_else(|| anyhow!("no body for function `{name}`"))?;

        let mut block = BlockId::ENTRY;
        loop {
            let b = func.block(block);
            for inst in &b.insts {
                self.step()?;
                self.exec(inst, depth)
                    .with_context(|| format!("in block `{}` of `{name}`", b.name))?;
            }
            self.step()?;
            block = match &b.terminator {
                Terminator::Br(to) => *to,
                Terminator::CondBr {
                    cond,
                    then_block,
                    else_block,
                } => {
                    if self.vars.get(cond)? != 0 {
                        *then_block
                    } else {
                        *else_block
                    }
                }
                Terminator::Switch {
                    value,
                    default,
                    cases,
                } => {
                    let value = self.vars.get(value)?;
                    cases
                        .iter()
                        .find(|(case, _)| *case == value)
                        .map_or(*default, |(_, to)| *to)
                }
                Terminator::Ret => return Ok(()),
                Terminator::Unreachable => bail!("reached unreachable code in `{name}`"),
            };
        }
    }

    fn step(&mut self) -> Result<()> {
        self.steps += 1;
        ensure!(self.steps <= self.max_steps, "step limit of {} exceeded", self.max_steps);
        Ok(())
    }

    fn exec(&mut self, inst: &Inst, depth: usize) -> Result<()> {
        let module = self.module;
        match inst {
            Inst::Op {
                opcode,
                dest,
                operands,
            } => {
                let Some(dest) = dest else {
                    return Ok(());
                };
                let arg = |i: usize| -> Result<i64> {
                    let operand = operands
                        .get(i)
                        .ok_or_else(|| anyhow!("`{opcode}` is missing operand {i}"))?;
                    self.vars.get(operand)
                };
                let value = match opcode.as_str() {
                    "mov" => arg(0)?,
                    "add" => arg(0)?.wrapping_add(arg(1)?),
                    "sub" => arg(0)?.wrapping_sub(arg(1)?),
                    "mul" => arg(0)?.wrapping_mul(arg(1)?),
                    "lt" => (arg(0)? < arg(1)?).into(),
                    "le" => (arg(0)? <= arg(1)?).into(),
                    "eq" => (arg(0)? == arg(1)?).into(),
                    "ne" => (arg(0)? != arg(1)?).into(),
                    _ => return Ok(()),
                };
                self.vars.values.insert(dest.clone(), value);
            }

            Inst::Call { callee, args } => {
                let name = match callee {
                    Callee::Direct(name) => name.as_str(),
                    Callee::Indirect(target) => {
                        let index = self.vars.get(target)?;
                        let func = usize::try_from(index)
                            .ok()
                            .and_then(|i| module.functions.get(i))
                            .ok_or_else(|| anyhow!("indirect call to bogus function {index}"))?;
                        func.name.as_str()
                    }
                };
                if let Some(strategy) = InstrumentationStrategy::from_entry_point(name) {
                    let globals = args
                        .iter()
                        .map(|a| match a {
                            Operand::Global(g) => Ok(g.clone()),
                            _ => bail!("`{name}` expects counter arrays, got {a:?}"),
                        })
                        .collect::<Result<Vec<_>>>()?;
                    log::trace!("Registering {strategy} exit handler");
                    self.handlers.push((strategy, globals));
                } else if module.function(name).map_or(false, |f| !f.is_declaration()) {
                    self.call(name, depth + 1)?;
                } else {
                    self.host.call(name, args, &mut self.vars)?;
                }
            }

            Inst::Increment { counters, slot } => {
                *self.u64_slot(counters, *slot)? += 1;
            }

            Inst::Store {
                counters,
                slot,
                value,
            } => {
                let value = self.vars.get(value)?;
                match self.counters.get_mut(counters.as_str()) {
                    Some(Counters::I32(c)) if (*slot as usize) < c.len() => {
                        c[*slot as usize] = value as i32;
                    }
                    _ => bail!("no i32 slot {slot} in `{counters}`"),
                }
            }

            Inst::Accumulate {
                counters,
                slot,
                count,
                datatype,
            } => {
                let count = u64::try_from(self.vars.get(count)?).unwrap_or(0);
                let size = comm::datatype_size(self.vars.get(datatype)?);
                *self.u64_slot(counters, *slot)? += 1;
                let bytes = self.u64_slot(counters, *slot + 1)?;
                *bytes = bytes.saturating_add(count.saturating_mul(size));
            }

            Inst::AddWeight {
                counters,
                slot,
                value,
            } => {
                let weight = self.vars.get(value)? as f64;
                match self.counters.get_mut(counters.as_str()) {
                    Some(Counters::F64(c)) if (*slot as usize) < c.len() => {
                        c[*slot as usize] += weight;
                    }
                    _ => bail!("no f64 slot {slot} in `{counters}`"),
                }
            }

            Inst::TimerStart => {
                self.timer = Some(self.host.now());
            }

            Inst::TimerStop { counters, slot } => {
                let start = self
                    .timer
                    .take()
                    .ok_or_else(|| anyhow!("timer stopped without being started"))?;
                let elapsed = self.host.now() - start;
                match self.counters.get_mut(counters.as_str()) {
                    Some(Counters::F64(c)) if (*slot as usize) < c.len() => {
                        c[*slot as usize] += elapsed;
                    }
                    _ => bail!("no f64 slot {slot} in `{counters}`"),
                }
            }
        }
        Ok(())
    }

    fn u64_slot(&mut self, counters: &str, slot: u32) -> Result<&mut u64> {
        match self.counters.get_mut(counters) {
            Some(Counters::U64(c)) => c
                .get_mut(slot as usize)
                .ok_or_else(|| anyhow!("slot {slot} out of bounds for `{counters}`")),
            _ => bail!("no u64 counter array named `{counters}`"),
        }
    }
}
