//! The control-flow graph representation that gets instrumented and analyzed.
//!
//! This is deliberately small: just enough structure to enumerate functions,
//! blocks, terminators and call sites, split edges, and insert instructions.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A whole program unit: its functions plus any counter arrays that
/// instrumentation has declared.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Module {
    /// The functions in this module, in traversal order.
    pub functions: Vec<Function>,
    /// Counter arrays declared by instrumentation.
    #[serde(default)]
    pub globals: Vec<Global>,
}

/// A function. Declarations have no blocks and are never instrumented.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Function {
    /// The function's symbol name.
    pub name: String,
    /// The function's blocks, addressed by [`BlockId`]. Block 0 is the entry.
    #[serde(default)]
    pub blocks: Vec<Block>,
}

/// The index of a block within its function.
///
/// Ids are stable: new blocks are only ever appended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub u32);

impl BlockId {
    /// The entry block of every function with a body.
    pub const ENTRY: BlockId = BlockId(0);

    /// This id as an index into `Function::blocks`.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A basic block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// A human-readable label, used only in reports.
    #[serde(default)]
    pub name: String,
    /// The straight-line body of this block.
    #[serde(default)]
    pub insts: Vec<Inst>,
    /// How control leaves this block.
    pub terminator: Terminator,
}

/// How control leaves a block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminator {
    /// Unconditional branch.
    Br(BlockId),
    /// Two-way branch on whether `cond` is non-zero.
    CondBr {
        /// The branch condition.
        cond: Operand,
        /// Taken when `cond != 0`.
        then_block: BlockId,
        /// Taken when `cond == 0`.
        else_block: BlockId,
    },
    /// Multi-way branch.
    Switch {
        /// The scrutinee.
        value: Operand,
        /// Taken when no case matches.
        default: BlockId,
        /// `(case value, destination)` pairs.
        cases: Vec<(i64, BlockId)>,
    },
    /// Return from the function.
    Ret,
    /// Control never reaches the end of this block.
    Unreachable,
}

/// A non-terminator instruction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Inst {
    /// Plain computation, identified by its opcode name (`add`, `load`, ...).
    Op {
        /// The opcode name.
        opcode: String,
        /// The variable receiving the result, if any.
        #[serde(default)]
        dest: Option<String>,
        /// The operands.
        #[serde(default)]
        operands: Vec<Operand>,
    },
    /// A call site.
    Call {
        /// What is being called.
        callee: Callee,
        /// The call's arguments.
        #[serde(default)]
        args: Vec<Operand>,
    },
    /// `counters[slot] += 1`
    Increment {
        /// The counter array.
        counters: String,
        /// The slot within the array.
        slot: u32,
    },
    /// `counters[slot] = *value`
    Store {
        /// The counter array.
        counters: String,
        /// The slot within the array.
        slot: u32,
        /// The value that gets loaded and stored.
        value: Operand,
    },
    /// `counters[slot] += 1; counters[slot + 1] += *count * sizeof(*datatype)`
    Accumulate {
        /// The counter array.
        counters: String,
        /// The first of the two slots.
        slot: u32,
        /// The element count operand of the trapped call.
        count: Operand,
        /// The datatype operand of the trapped call.
        datatype: Operand,
    },
    /// `counters[slot] += *value as f64`
    AddWeight {
        /// The floating-point counter array.
        counters: String,
        /// The slot within the array.
        slot: u32,
        /// The weight added on every execution.
        value: Operand,
    },
    /// Start the per-process communication timer.
    TimerStart,
    /// `counters[slot] += now() - timer_start`
    TimerStop {
        /// The counter array.
        counters: String,
        /// The slot within the array.
        slot: u32,
    },
}

/// The target of a call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Callee {
    /// A call to a known symbol.
    Direct(String),
    /// A call through a function pointer.
    Indirect(Operand),
}

/// An instruction operand.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    /// An immediate integer.
    Const(i64),
    /// The address of a program variable.
    Var(String),
    /// The address of a counter array.
    Global(String),
}

/// A zero-or-`init`-initialized counter array declared by instrumentation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Global {
    /// The array's symbol name.
    pub name: String,
    /// The element type.
    pub ty: CounterType,
    /// The number of slots.
    pub len: u32,
    /// The initial value of every slot.
    #[serde(default)]
    pub init: i64,
}

/// The element type of a counter array.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterType {
    /// 64-bit execution counters.
    U64,
    /// 32-bit captured values such as the process rank.
    I32,
    /// Floating-point accumulators.
    F64,
}

impl Module {
    /// Read a module from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open module `{}`", path.display()))?;
        let module: Module = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("failed to parse module `{}`", path.display()))?;
        module.validate()?;
        Ok(module)
    }

    /// Check that every branch target exists and that no block branches back
    /// into its function's entry block.
    ///
    /// The entry block is only ever entered from the function's callers, so
    /// the function-entry counter and the runtime initializer calls placed
    /// there run once per call.
    pub fn validate(&self) -> Result<()> {
        for func in &self.functions {
            for (i, block) in func.blocks.iter().enumerate() {
                for succ in block.terminator.successors() {
                    if succ.index() >= func.blocks.len() {
                        bail!(
                            "block {i} of `{}` branches to nonexistent block {}",
                            func.name,
                            succ.0
                        );
                    }
                    if succ == BlockId::ENTRY {
                        bail!(
                            "block {i} of `{}` branches to the entry block; loop headers need a \
                             separate entry block",
                            func.name
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Find a function by name.
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Find a function by name, returning its index.
    pub fn function_index(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|f| f.name == name)
    }

    /// Find a counter array by name.
    pub fn global(&self, name: &str) -> Option<&Global> {
        self.globals.iter().find(|g| g.name == name)
    }

    /// Iterate over the functions that have bodies.
    pub fn defined_functions(&self) -> impl Iterator<Item = (usize, &Function)> {
        self.functions
            .iter()
            .enumerate()
            .filter(|(_, f)| !f.is_declaration())
    }

    /// Declare a new counter array.
    pub fn declare_global(&mut self, global: Global) -> Result<()> {
        if self.global(&global.name).is_some() {
            bail!(
                "counter array `{}` already exists; was this module already instrumented?",
                global.name
            );
        }
        log::trace!("Declaring counter array `{}` of {} slots", global.name, global.len);
        self.globals.push(global);
        Ok(())
    }
}

impl Function {
    /// Does this function lack a body?
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Get a block.
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    /// Get a block mutably.
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    /// The ids of all blocks currently in this function.
    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    /// The number of edges, counted with multiplicity, that enter `id`.
    pub fn predecessor_count(&self, id: BlockId) -> usize {
        self.blocks
            .iter()
            .map(|b| b.terminator.successors().filter(|s| *s == id).count())
            .sum()
    }

    /// Is the `succ_index`th out-edge of `from` critical?
    pub fn is_critical_edge(&self, from: BlockId, succ_index: usize) -> bool {
        let term = &self.block(from).terminator;
        if term.num_successors() <= 1 {
            return false;
        }
        match term.successor(succ_index) {
            Some(to) => self.predecessor_count(to) > 1,
            None => false,
        }
    }

    /// Split the `succ_index`th out-edge of `from` if it is critical.
    ///
    /// Returns the new intermediate block, which is appended to the function.
    pub fn split_critical_edge(&mut self, from: BlockId, succ_index: usize) -> Option<BlockId> {
        if !self.is_critical_edge(from, succ_index) {
            return None;
        }
        let to = self.block(from).terminator.successor(succ_index)?;
        let new = BlockId(self.blocks.len() as u32);
        let name = format!("{}.{}_crit_edge", self.block(from).name, self.block(to).name);
        log::trace!("Splitting critical edge {} -> {} of `{}`", from.0, to.0, self.name);
        self.blocks.push(Block {
            name,
            insts: vec![],
            terminator: Terminator::Br(to),
        });
        self.block_mut(from)
            .terminator
            .set_successor(succ_index, new);
        Some(new)
    }

    /// Insert `inst` as the first instruction of `id`.
    pub fn insert_at_start(&mut self, id: BlockId, inst: Inst) {
        self.block_mut(id).insts.insert(0, inst);
    }

    /// Insert `inst` as the last instruction of `id`, right before its
    /// terminator.
    pub fn insert_at_end(&mut self, id: BlockId, inst: Inst) {
        self.block_mut(id).insts.push(inst);
    }

    /// Insert `inst` immediately after the `index`th instruction of `id`.
    pub fn insert_after(&mut self, id: BlockId, index: usize, inst: Inst) {
        self.block_mut(id).insts.insert(index + 1, inst);
    }
}

impl Terminator {
    /// This terminator's successors, with multiplicity, in edge order.
    pub fn successors(&self) -> impl Iterator<Item = BlockId> + '_ {
        let (first, rest): (Option<BlockId>, &[(i64, BlockId)]) = match self {
            Terminator::Br(b) => (Some(*b), &[]),
            Terminator::CondBr {
                then_block,
                else_block,
                ..
            } => {
                return Successors::Two([*then_block, *else_block].into_iter());
            }
            Terminator::Switch { default, cases, .. } => (Some(*default), cases),
            Terminator::Ret | Terminator::Unreachable => (None, &[]),
        };
        Successors::List(first.into_iter().chain(rest.iter().map(|(_, b)| *b)))
    }

    /// The opcode name used when costing this terminator.
    pub fn opcode(&self) -> &'static str {
        match self {
            Terminator::Br(_) | Terminator::CondBr { .. } => "br",
            Terminator::Switch { .. } => "switch",
            Terminator::Ret => "ret",
            Terminator::Unreachable => "unreachable",
        }
    }

    /// The number of out-edges.
    pub fn num_successors(&self) -> usize {
        match self {
            Terminator::Br(_) => 1,
            Terminator::CondBr { .. } => 2,
            Terminator::Switch { cases, .. } => 1 + cases.len(),
            Terminator::Ret | Terminator::Unreachable => 0,
        }
    }

    /// The destination of the `i`th out-edge.
    pub fn successor(&self, i: usize) -> Option<BlockId> {
        self.successors().nth(i)
    }

    /// Redirect the `i`th out-edge to `to`.
    pub fn set_successor(&mut self, i: usize, to: BlockId) {
        match self {
            Terminator::Br(b) if i == 0 => *b = to,
            Terminator::CondBr { then_block, .. } if i == 0 => *then_block = to,
            Terminator::CondBr { else_block, .. } if i == 1 => *else_block = to,
            Terminator::Switch { default, .. } if i == 0 => *default = to,
            Terminator::Switch { cases, .. } if i >= 1 && i <= cases.len() => cases[i - 1].1 = to,
            _ => panic!("successor index {i} out of range for {self:?}"),
        }
    }
}

enum Successors<A, B> {
    Two(A),
    List(B),
}

impl<A, B> Iterator for Successors<A, B>
where
    A: Iterator<Item = BlockId>,
    B: Iterator<Item = BlockId>,
{
    type Item = BlockId;

    fn next(&mut self) -> Option<BlockId> {
        match self {
            Successors::Two(a) => a.next(),
            Successors::List(b) => b.next(),
        }
    }
}

impl Inst {
    /// The opcode name used when costing this instruction.
    pub fn opcode(&self) -> &str {
        match self {
            Inst::Op { opcode, .. } => opcode,
            Inst::Call { .. } => "call",
            Inst::Increment { .. }
            | Inst::Store { .. }
            | Inst::Accumulate { .. }
            | Inst::AddWeight { .. }
            | Inst::TimerStart
            | Inst::TimerStop { .. } => "instrumentation",
        }
    }

    /// The name of the directly called function, if this is a direct call.
    pub fn callee_name(&self) -> Option<&str> {
        match self {
            Inst::Call {
                callee: Callee::Direct(name),
                ..
            } => Some(name),
            _ => None,
        }
    }

    /// Is this an instruction inserted by instrumentation?
    pub fn is_instrumentation(&self) -> bool {
        self.opcode() == "instrumentation"
    }
}
