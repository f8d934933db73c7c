//! Modules, Functions and Basic Blocks
//!
//! # Memory Layout
//! - `Function.blocks`, `Function.insts` and `Function.vars` are arenas indexed by
//!   [`BlockId`], [`InstId`] and [`VarId`]
//! - A block lists its instructions by id, in execution order
//! - `BasicBlock.edges` and `BasicBlock.preds` use `SmallVec<[_; 2]>` (most blocks have ≤2)
//!
//! # Ownership
//! A [`Module`] owns its functions; a [`Function`] owns its blocks, instructions and
//! variables. Regions and analyses refer to blocks by id only.

use crate::decompiler::config::Abi;
use crate::decompiler::error::{DecompileError, ErrorContext, Warning};
use crate::decompiler::ir::instruction::{Instruction, Opcode, Value};
use crate::decompiler::ir::types::{Type, TypeTable};
use crate::decompiler::ir::{BlockId, FuncId, InstId, VarId};
use crate::decompiler::structurer::region::Region;
use bitvec::prelude::*;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::VecDeque;

/// Whole decompilation unit.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Module {
    /// Functions in input order (entry-address first appearance)
    pub functions: Vec<Function>,
    /// Global type table, appended after each pipeline run
    pub types: TypeTable,
    /// Register conventions the IR was lifted with
    #[serde(skip)]
    pub abi: Abi,
}

impl Module {
    pub fn new(abi: Abi) -> Self {
        Self {
            functions: Vec::new(),
            types: TypeTable::new(),
            abi,
        }
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn function_by_entry(&self, entry: u64) -> Option<&Function> {
        self.functions.iter().find(|f| f.entry_address == entry)
    }

    /// Intern every variable and return type into the global table, in module order.
    pub fn absorb_types(&mut self) {
        for func in self.functions.iter() {
            for var in func.vars.iter() {
                self.types.intern(&var.ty);
            }
            if let Some(ret) = &func.return_type {
                self.types.intern(ret);
            }
        }
    }

    /// All warnings, grouped by function in module order.
    pub fn warnings(&self) -> impl Iterator<Item = &Warning> {
        self.functions.iter().flat_map(|f| f.warnings.iter())
    }

    pub fn block_count(&self) -> usize {
        self.functions.iter().map(|f| f.blocks.len()).sum()
    }

    pub fn instruction_count(&self) -> usize {
        self.functions.iter().map(|f| f.live_instruction_count()).sum()
    }
}

/// Kind of a control-flow edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    /// Explicit unconditional jump
    Unconditional,
    /// Branch taken
    True,
    /// Branch not taken
    False,
    /// Jump-table entry `n`
    SwitchCase(u32),
    /// Block ended without a transfer because the next block starts
    Fallthrough,
}

/// Destination of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeTarget {
    Block(BlockId),
    /// Sentinel for a transfer that does not resolve to a block of this function
    Unknown(Option<u64>),
}

impl EdgeTarget {
    #[inline]
    pub fn block(self) -> Option<BlockId> {
        match self {
            EdgeTarget::Block(b) => Some(b),
            EdgeTarget::Unknown(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub target: EdgeTarget,
    pub kind: EdgeKind,
}

impl Edge {
    pub fn new(target: EdgeTarget, kind: EdgeKind) -> Self {
        Self { target, kind }
    }

    pub fn to_block(block: BlockId, kind: EdgeKind) -> Self {
        Self {
            target: EdgeTarget::Block(block),
            kind,
        }
    }
}

/// Straight-line run of instructions.
///
/// # Basic Block Properties
/// - Only the last instruction transfers control
/// - `edges` follow the terminator: one for `Jump`, `True`+`False` for `Branch`,
///   one per case for `Switch`, none for `Return`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicBlock {
    pub id: BlockId,
    /// Address of the first instruction
    pub start_address: u64,
    /// Address of the last instruction (inclusive)
    pub end_address: u64,
    pub insts: Vec<InstId>,
    pub edges: SmallVec<[Edge; 2]>,
    pub preds: SmallVec<[BlockId; 2]>,
    /// Not reachable from the function entry
    pub unreachable: bool,
}

impl BasicBlock {
    pub fn new(id: BlockId, start_address: u64, end_address: u64) -> Self {
        Self {
            id,
            start_address,
            end_address,
            insts: Vec::new(),
            edges: SmallVec::new(),
            preds: SmallVec::new(),
            unreachable: false,
        }
    }

    /// Successor blocks in edge order (unknown targets skipped, duplicates kept).
    #[inline]
    pub fn successors(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.edges.iter().filter_map(|e| e.target.block())
    }

    pub fn edge(&self, kind: EdgeKind) -> Option<&Edge> {
        self.edges.iter().find(|e| e.kind == kind)
    }
}

/// Where a variable lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageClass {
    Register(String),
    /// Stack parameter `index` (1-based) at `offset` from the entry stack pointer
    Param { index: u32, offset: i64 },
    /// Stack local at a negative `offset` from the entry stack pointer
    Stack { offset: i64 },
    Global(u64),
    /// Synthesized by a pass (merged return values)
    Temp,
}

impl StorageClass {
    /// Coalescing keeps the name of the higher-ranked variable.
    pub fn rank(&self) -> u8 {
        match self {
            StorageClass::Param { .. } => 4,
            StorageClass::Global(_) => 3,
            StorageClass::Stack { .. } => 2,
            StorageClass::Register(_) => 1,
            StorageClass::Temp => 0,
        }
    }
}

/// Recovered storage location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub id: VarId,
    pub name: String,
    pub storage: StorageClass,
    /// Access width in bytes
    pub size: u8,
    pub ty: Type,
    /// Blocks in which the variable is live (filled by `coalesce-variables`)
    pub live_range: Vec<BlockId>,
}

/// One recovered procedure.
#[derive(Debug, Clone, Serialize)]
pub struct Function {
    pub id: FuncId,
    pub name: String,
    pub entry_address: u64,
    pub entry: BlockId,
    pub blocks: Vec<BasicBlock>,
    #[serde(skip)]
    pub insts: Vec<Instruction>,
    pub vars: Vec<Variable>,
    /// `None` when the function returns nothing
    pub return_type: Option<Type>,
    pub return_width: u8,
    pub region: Option<Region>,
    pub warnings: Vec<Warning>,
}

impl Function {
    pub fn new(id: FuncId, name: impl Into<String>, entry_address: u64) -> Self {
        Self {
            id,
            name: name.into(),
            entry_address,
            entry: BlockId(0),
            blocks: Vec::new(),
            insts: Vec::new(),
            vars: Vec::new(),
            return_type: Some(Type::Unknown),
            return_width: 4,
            region: None,
            warnings: Vec::new(),
        }
    }

    /// Error context naming this function.
    pub fn context(&self) -> ErrorContext {
        ErrorContext::new()
            .with_function(self.name.clone())
            .with_address(self.entry_address)
    }

    #[inline]
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    #[inline]
    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.index()]
    }

    #[inline]
    pub fn inst(&self, id: InstId) -> &Instruction {
        &self.insts[id.index()]
    }

    #[inline]
    pub fn inst_mut(&mut self, id: InstId) -> &mut Instruction {
        &mut self.insts[id.index()]
    }

    #[inline]
    pub fn var(&self, id: VarId) -> &Variable {
        &self.vars[id.index()]
    }

    #[inline]
    pub fn var_mut(&mut self, id: VarId) -> &mut Variable {
        &mut self.vars[id.index()]
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len()).map(BlockId::from_index)
    }

    pub fn add_block(&mut self, start_address: u64, end_address: u64) -> BlockId {
        let id = BlockId::from_index(self.blocks.len());
        self.blocks.push(BasicBlock::new(id, start_address, end_address));
        id
    }

    /// Put an instruction in the arena without placing it in a block.
    pub fn add_inst(&mut self, op: Opcode, address: u64) -> InstId {
        let id = InstId::from_index(self.insts.len());
        self.insts.push(Instruction::new(op, address));
        id
    }

    /// Append an instruction to the end of `block`.
    pub fn append_inst(&mut self, block: BlockId, op: Opcode, address: u64) -> InstId {
        let id = self.add_inst(op, address);
        self.blocks[block.index()].insts.push(id);
        id
    }

    pub fn add_var(&mut self, name: impl Into<String>, storage: StorageClass, size: u8) -> VarId {
        let id = VarId::from_index(self.vars.len());
        self.vars.push(Variable {
            id,
            name: name.into(),
            storage,
            size,
            ty: Type::Unknown,
            live_range: Vec::new(),
        });
        id
    }

    pub fn find_var(&self, storage: &StorageClass) -> Option<VarId> {
        self.vars.iter().find(|v| &v.storage == storage).map(|v| v.id)
    }

    /// Parameters ordered by stack position.
    pub fn params(&self) -> Vec<&Variable> {
        let mut params: Vec<&Variable> = self
            .vars
            .iter()
            .filter(|v| matches!(v.storage, StorageClass::Param { .. }))
            .collect();
        params.sort_by_key(|v| match v.storage {
            StorageClass::Param { index, .. } => index,
            _ => u32::MAX,
        });
        params
    }

    /// The block's terminator instruction, if its last instruction is one.
    #[inline]
    pub fn terminator(&self, block: BlockId) -> Option<InstId> {
        let last = *self.blocks[block.index()].insts.last()?;
        if self.insts[last.index()].op.is_terminator() {
            Some(last)
        } else {
            None
        }
    }

    /// Remove `inst` from `block` and turn its arena slot into a `Nop`.
    pub fn remove_inst(&mut self, block: BlockId, inst: InstId) {
        self.blocks[block.index()].insts.retain(|&i| i != inst);
        self.insts[inst.index()].op = Opcode::Nop;
    }

    /// Replace every operand equal to `from` with `to`. Returns the number of rewrites.
    pub fn replace_uses(&mut self, from: Value, to: Value) -> usize {
        let mut count = 0usize;
        for block in self.blocks.iter() {
            for &inst in block.insts.iter() {
                self.insts[inst.index()].op.for_each_operand_mut(|v| {
                    if *v == from {
                        *v = to;
                        count += 1;
                    }
                });
            }
        }
        count
    }

    /// Iterate placed instructions in block order.
    pub fn placed_insts(&self) -> impl Iterator<Item = (BlockId, InstId)> + '_ {
        self.blocks
            .iter()
            .flat_map(|b| b.insts.iter().map(move |&i| (b.id, i)))
    }

    pub fn live_instruction_count(&self) -> usize {
        self.blocks.iter().map(|b| b.insts.len()).sum()
    }

    /// Number of operand references to each instruction result, indexed by `InstId`.
    pub fn inst_use_counts(&self) -> Vec<u32> {
        let mut counts = vec![0u32; self.insts.len()];
        for (_, inst) in self.placed_insts() {
            self.insts[inst.index()].op.for_each_operand(|v| {
                if let Value::Inst(def) = v {
                    counts[def.index()] += 1;
                }
            });
        }
        counts
    }

    /// Number of reads of each variable, indexed by `VarId`.
    pub fn var_use_counts(&self) -> Vec<u32> {
        let mut counts = vec![0u32; self.vars.len()];
        for (_, inst) in self.placed_insts() {
            self.insts[inst.index()].op.for_each_operand(|v| {
                if let Value::Var(var) = v {
                    counts[var.index()] += 1;
                }
            });
        }
        counts
    }

    /// Variables read or written by any placed instruction.
    pub fn referenced_vars(&self) -> BitVec<u32> {
        let mut used: BitVec<u32> = bitvec![u32, Lsb0; 0; self.vars.len()];
        for (_, inst) in self.placed_insts() {
            let op = &self.insts[inst.index()].op;
            if let Some(dst) = op.defined_var() {
                used.set(dst.index(), true);
            }
            op.for_each_operand(|v| {
                if let Value::Var(var) = v {
                    used.set(var.index(), true);
                }
            });
        }
        used
    }

    /// Map each placed instruction to its block and position.
    pub fn inst_locations(&self) -> Vec<Option<(BlockId, u32)>> {
        let mut locations = vec![None; self.insts.len()];
        for block in self.blocks.iter() {
            for (pos, &inst) in block.insts.iter().enumerate() {
                locations[inst.index()] = Some((block.id, pos as u32));
            }
        }
        locations
    }

    /// Recompute every block's predecessor list from the edges.
    pub fn rebuild_preds(&mut self) {
        for block in self.blocks.iter_mut() {
            block.preds.clear();
        }
        let mut updates: Vec<(BlockId, BlockId)> = Vec::new();
        for block in self.blocks.iter() {
            for succ in block.successors() {
                updates.push((succ, block.id));
            }
        }
        for (succ, pred) in updates {
            let preds = &mut self.blocks[succ.index()].preds;
            if !preds.contains(&pred) {
                preds.push(pred);
            }
        }
    }

    /// Flag blocks that cannot be reached from the entry. Returns how many there are.
    pub fn mark_unreachable(&mut self) -> usize {
        let mut seen: BitVec<u32> = bitvec![u32, Lsb0; 0; self.blocks.len()];
        let mut queue: VecDeque<BlockId> = VecDeque::new();
        if self.entry.index() < self.blocks.len() {
            seen.set(self.entry.index(), true);
            queue.push_back(self.entry);
        }
        while let Some(b) = queue.pop_front() {
            for succ in self.blocks[b.index()].successors() {
                if !seen[succ.index()] {
                    seen.set(succ.index(), true);
                    queue.push_back(succ);
                }
            }
        }
        let mut count = 0usize;
        for block in self.blocks.iter_mut() {
            block.unreachable = !seen[block.id.index()];
            if block.unreachable {
                count += 1;
            }
        }
        count
    }

    /// Drop every block whose bit in `keep` is clear and renumber the rest.
    ///
    /// Edges into dropped blocks become unknown-target edges; merge inputs from dropped
    /// blocks are removed. Invalidates any region.
    ///
    /// # Errors
    /// Returns `InvariantViolation` if the entry block would be dropped.
    pub fn retain_blocks(&mut self, keep: &BitSlice<u32>) -> Result<(), DecompileError> {
        if !keep.get(self.entry.index()).map(|b| *b).unwrap_or(false) {
            return Err(DecompileError::invariant(
                "entry block cannot be removed",
                self.context().with_block(self.entry),
            ));
        }
        let old_blocks = std::mem::take(&mut self.blocks);
        let mut remap: Vec<Option<BlockId>> = vec![None; old_blocks.len()];
        let mut dropped_starts: Vec<u64> = vec![0; old_blocks.len()];
        let mut kept: Vec<BasicBlock> = Vec::with_capacity(old_blocks.len());
        for (index, block) in old_blocks.into_iter().enumerate() {
            dropped_starts[index] = block.start_address;
            if keep.get(index).map(|b| *b).unwrap_or(false) {
                remap[index] = Some(BlockId::from_index(kept.len()));
                kept.push(block);
            } else {
                for inst in block.insts.iter() {
                    self.insts[inst.index()].op = Opcode::Nop;
                }
            }
        }
        for block in kept.iter_mut() {
            block.id = remap[block.id.index()].unwrap_or(block.id);
            for edge in block.edges.iter_mut() {
                if let EdgeTarget::Block(target) = edge.target {
                    edge.target = match remap[target.index()] {
                        Some(new) => EdgeTarget::Block(new),
                        None => EdgeTarget::Unknown(Some(dropped_starts[target.index()])),
                    };
                }
            }
            for &inst in block.insts.iter() {
                if let Opcode::Merge { inputs, .. } = &mut self.insts[inst.index()].op {
                    inputs.retain(|(pred, _)| remap[pred.index()].is_some());
                    for (pred, _) in inputs.iter_mut() {
                        if let Some(new) = remap[pred.index()] {
                            *pred = new;
                        }
                    }
                }
            }
        }
        self.entry = remap[self.entry.index()].unwrap_or(self.entry);
        self.blocks = kept;
        self.rebuild_preds();
        self.region = None;
        Ok(())
    }
}
