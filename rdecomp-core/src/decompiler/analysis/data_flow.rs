//! Data Flow Analysis
//!
//! Variable liveness over the IR.
//!
//! # Memory Optimizations
//! - Live sets are `BitVec<u32>` over variable indices (1 bit per variable)
//!
//! # Live Variable Analysis
//! Iterative backward analysis until fixed point:
//! - **Live at exit**: union of live at entry of all successors, plus variables read by
//!   those successors' merges on the edge from this block
//! - **Live at entry**: (live at exit - killed) ∪ generated
//!
//! Merge inputs are uses at the end of the corresponding predecessor, and the merge
//! destination is a definition at the top of its block.

use crate::decompiler::ir::{BlockId, Function, InstId, Opcode, Value, VarId};
use bitvec::prelude::*;

#[derive(Debug, Clone)]
pub struct Liveness {
    pub live_in: Vec<BitVec<u32>>,
    pub live_out: Vec<BitVec<u32>>,
}

impl Liveness {
    /// Compute live-in and live-out sets for every block.
    ///
    /// # Algorithm
    /// 1. Per block, compute `gen` (read before written) and `kill` (written)
    /// 2. Sweep blocks in reverse order until no set changes
    pub fn compute(func: &Function) -> Self {
        let n = func.blocks.len();
        let vars = func.vars.len();
        let empty: BitVec<u32> = bitvec![u32, Lsb0; 0; vars];

        let mut gens = vec![empty.clone(); n];
        let mut kill = vec![empty.clone(); n];
        // Variables read by merges of a successor, per (pred) block
        let mut phi_uses = vec![empty.clone(); n];

        for block in func.blocks.iter() {
            let b = block.id.index();
            for &inst in block.insts.iter().rev() {
                let op = &func.inst(inst).op;
                if let Opcode::Merge { dst, inputs } = op {
                    gens[b].set(dst.index(), false);
                    kill[b].set(dst.index(), true);
                    for (pred, value) in inputs.iter() {
                        if let Value::Var(v) = value {
                            if let Some(set) = phi_uses.get_mut(pred.index()) {
                                set.set(v.index(), true);
                            }
                        }
                    }
                    continue;
                }
                if let Some(dst) = op.defined_var() {
                    gens[b].set(dst.index(), false);
                    kill[b].set(dst.index(), true);
                }
                op.for_each_operand(|v| {
                    if let Value::Var(var) = v {
                        gens[b].set(var.index(), true);
                    }
                });
            }
        }

        let mut live_in = gens.clone();
        let mut live_out = phi_uses.clone();
        let mut changed = true;
        while changed {
            changed = false;
            for block in func.blocks.iter().rev() {
                let b = block.id.index();
                let mut out = phi_uses[b].clone();
                for s in block.successors() {
                    union_into(&mut out, &live_in[s.index()]);
                }
                let mut inn = out.clone();
                for ((word, k), g) in inn
                    .as_raw_mut_slice()
                    .iter_mut()
                    .zip(kill[b].as_raw_slice())
                    .zip(gens[b].as_raw_slice())
                {
                    *word = (*word & !*k) | *g;
                }
                if out != live_out[b] || inn != live_in[b] {
                    live_out[b] = out;
                    live_in[b] = inn;
                    changed = true;
                }
            }
        }

        Self { live_in, live_out }
    }

    /// Walk `block` backwards, calling `f(inst, live_after)` for every instruction.
    ///
    /// `live_after` is the set of variables live immediately after `inst`.
    pub fn walk_block(&self, func: &Function, block: BlockId, mut f: impl FnMut(InstId, &BitSlice<u32>)) {
        let mut live = self.live_out[block.index()].clone();
        for &inst in func.block(block).insts.iter().rev() {
            f(inst, live.as_bitslice());
            let op = &func.inst(inst).op;
            if let Some(dst) = op.defined_var() {
                live.set(dst.index(), false);
            }
            if !matches!(op, Opcode::Merge { .. }) {
                op.for_each_operand(|v| {
                    if let Value::Var(var) = v {
                        live.set(var.index(), true);
                    }
                });
            }
        }
    }

    #[inline]
    pub fn is_live_in(&self, block: BlockId, var: VarId) -> bool {
        self.live_in[block.index()].get(var.index()).map(|b| *b).unwrap_or(false)
    }

    #[inline]
    pub fn is_live_out(&self, block: BlockId, var: VarId) -> bool {
        self.live_out[block.index()].get(var.index()).map(|b| *b).unwrap_or(false)
    }
}

/// `dst |= src` for sets of equal length.
#[inline] // Hot path
pub fn union_into(dst: &mut BitVec<u32>, src: &BitVec<u32>) {
    for (d, s) in dst.as_raw_mut_slice().iter_mut().zip(src.as_raw_slice()) {
        *d |= *s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompiler::ir::{Edge, EdgeKind, FuncId, StorageClass};

    #[test]
    fn test_value_live_across_blocks() {
        let mut func = Function::new(FuncId(0), "live", 0);
        let x = func.add_var("x", StorageClass::Register("ecx".into()), 4);
        let y = func.add_var("y", StorageClass::Register("edx".into()), 4);
        let b0 = func.add_block(0, 0);
        let b1 = func.add_block(4, 4);
        func.append_inst(b0, Opcode::Assign { dst: x, src: Value::Const(1) }, 0);
        func.append_inst(b0, Opcode::Assign { dst: y, src: Value::Const(2) }, 0);
        func.append_inst(b0, Opcode::Jump, 0);
        func.block_mut(b0).edges.push(Edge::to_block(b1, EdgeKind::Unconditional));
        func.append_inst(b1, Opcode::Return { value: Some(Value::Var(x)) }, 4);
        func.rebuild_preds();

        let live = Liveness::compute(&func);
        assert!(live.is_live_out(b0, x));
        assert!(!live.is_live_out(b0, y), "y is never read");
        assert!(!live.is_live_in(b0, x), "x is defined before use");
    }
}
