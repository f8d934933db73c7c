//! Variable Coalescing
//!
//! Merges variables connected by copies when their live ranges never overlap, then
//! records every variable's live range.
//!
//! # Algorithm
//! 1. **Interference**: walking each block backwards, a written variable interferes with
//!    everything live after the write, except the source of a plain copy. Variables
//!    live on entry to the function interfere pairwise.
//! 2. **Candidates**: copies `a = b` in block order where both have the same access
//!    width, neither is a global, they are not two distinct parameters, and their types
//!    do not conflict
//! 3. **Union**: classes merge when no member of one interferes with a member of the
//!    other. The survivor is the variable with the higher storage rank (parameters, then
//!    globals, stack slots, registers and temporaries), the lower id on ties.
//! 4. **Rewrite**: every merged variable is renamed to its survivor and self-copies are
//!    deleted
//! 5. **Repeat** from step 1 until a round merges nothing
//!
//! Merged-away variables stay in the arena (ids are stable) but are no longer referenced.

use crate::decompiler::analysis::Liveness;
use crate::decompiler::error::DecompileError;
use crate::decompiler::ir::{BlockId, Function, InstId, Opcode, StorageClass, Value, VarId};
use crate::decompiler::passes::{Pass, PassContext, PassDescriptor, PassOutcome, PassScope};
use std::collections::BTreeSet;

pub const DESCRIPTOR: PassDescriptor = PassDescriptor {
    id: "coalesce-variables",
    scope: PassScope::Function,
    idempotent: true,
    description: "Merge copy-related variables with disjoint live ranges",
    options: &[],
};

pub struct CoalesceVariables;

impl Pass for CoalesceVariables {
    fn name(&self) -> &'static str {
        DESCRIPTOR.id
    }

    fn run_on_function(&self, func: &mut Function, _ctx: &PassContext<'_>) -> Result<PassOutcome, DecompileError> {
        // Deleting a self-copy shortens live ranges, which can free the next link of a chain
        let mut total = 0usize;
        loop {
            let merged = coalesce_round(func);
            if merged == 0 {
                break;
            }
            total += merged;
        }

        let mut changed = total > 0;
        if changed {
            log::debug!("{}: coalesced {} variable pairs", func.name, total);
        }
        changed |= record_live_ranges(func);
        Ok(PassOutcome::from_changed(changed))
    }
}

/// One interference build, union and rewrite. Returns the number of merges.
fn coalesce_round(func: &mut Function) -> usize {
    let liveness = Liveness::compute(func);
    let mut graph = Interference::build(func, &liveness);

    let mut merged = 0usize;
    for (a, b) in copy_pairs(func) {
        let (ra, rb) = (graph.find(a), graph.find(b));
        if ra == rb || !compatible(func, ra, rb) || graph.interferes(ra, rb) {
            continue;
        }
        let (keep, gone) = survivor(func, ra, rb);
        let ty = func.var(keep).ty.meet(&func.var(gone).ty);
        func.var_mut(keep).ty = ty;
        graph.union(keep, gone);
        merged += 1;
    }
    if merged > 0 {
        rewrite(func, &mut graph);
    }
    merged
}

/// Interference sets with union-find over variable ids.
struct Interference {
    parent: Vec<u32>,
    edges: Vec<BTreeSet<u32>>,
}

impl Interference {
    fn build(func: &Function, liveness: &Liveness) -> Self {
        let n = func.vars.len();
        let mut graph = Self {
            parent: (0..n as u32).collect(),
            edges: vec![BTreeSet::new(); n],
        };

        for block in func.block_ids() {
            liveness.walk_block(func, block, |inst, live_after| {
                let op = &func.inst(inst).op;
                let Some(dst) = op.defined_var() else {
                    return;
                };
                let copied_from = match op {
                    Opcode::Assign { src: Value::Var(src), .. } => Some(*src),
                    _ => None,
                };
                for live in live_after.iter_ones() {
                    let live = VarId::from_index(live);
                    if live != dst && Some(live) != copied_from {
                        graph.add_edge(dst, live);
                    }
                }
            });
        }

        if func.entry.index() < func.blocks.len() {
            let entry_live: Vec<usize> = liveness.live_in[func.entry.index()].iter_ones().collect();
            for (i, &a) in entry_live.iter().enumerate() {
                for &b in entry_live[i + 1..].iter() {
                    graph.add_edge(VarId::from_index(a), VarId::from_index(b));
                }
            }
        }
        graph
    }

    fn add_edge(&mut self, a: VarId, b: VarId) {
        self.edges[a.index()].insert(b.0);
        self.edges[b.index()].insert(a.0);
    }

    fn find(&mut self, v: VarId) -> VarId {
        let mut root = v.0;
        while self.parent[root as usize] != root {
            root = self.parent[root as usize];
        }
        let mut cur = v.0;
        while self.parent[cur as usize] != root {
            let next = self.parent[cur as usize];
            self.parent[cur as usize] = root;
            cur = next;
        }
        VarId(root)
    }

    /// Roots only: a root's edge set covers every member of its class.
    fn interferes(&mut self, a: VarId, b: VarId) -> bool {
        let neighbours: Vec<u32> = self.edges[a.index()].iter().copied().collect();
        neighbours.into_iter().any(|x| self.find(VarId(x)) == b)
    }

    /// Merge root `gone` into root `keep`.
    fn union(&mut self, keep: VarId, gone: VarId) {
        self.parent[gone.index()] = keep.0;
        let moved = std::mem::take(&mut self.edges[gone.index()]);
        for x in moved {
            self.edges[keep.index()].insert(x);
            self.edges[x as usize].insert(keep.0);
        }
    }
}

/// Copies between distinct variables, in block order.
fn copy_pairs(func: &Function) -> Vec<(VarId, VarId)> {
    func.placed_insts()
        .filter_map(|(_, i)| match func.inst(i).op {
            Opcode::Assign { dst, src: Value::Var(src) } if dst != src => Some((dst, src)),
            _ => None,
        })
        .collect()
}

fn compatible(func: &Function, a: VarId, b: VarId) -> bool {
    let (va, vb) = (func.var(a), func.var(b));
    let global = |s: &StorageClass| matches!(s, StorageClass::Global(_));
    let param = |s: &StorageClass| matches!(s, StorageClass::Param { .. });
    va.size == vb.size
        && !global(&va.storage)
        && !global(&vb.storage)
        && !(param(&va.storage) && param(&vb.storage))
        && !va.ty.meet(&vb.ty).is_conflict()
}

/// `(keep, gone)`: higher storage rank wins, then the lower id.
fn survivor(func: &Function, a: VarId, b: VarId) -> (VarId, VarId) {
    let key = |v: VarId| (std::cmp::Reverse(func.var(v).storage.rank()), v);
    if key(a) <= key(b) {
        (a, b)
    } else {
        (b, a)
    }
}

fn rewrite(func: &mut Function, graph: &mut Interference) {
    let renames: Vec<(VarId, VarId)> = (0..func.vars.len())
        .map(VarId::from_index)
        .map(|v| (v, graph.find(v)))
        .filter(|(v, root)| v != root)
        .collect();

    let placed: Vec<(BlockId, InstId)> = func.placed_insts().collect();
    for &(_, inst) in placed.iter() {
        for &(from, to) in renames.iter() {
            func.inst_mut(inst).op.rename_var(from, to);
        }
    }
    for (block, inst) in placed {
        if matches!(func.inst(inst).op, Opcode::Assign { dst, src: Value::Var(src) } if dst == src) {
            func.remove_inst(block, inst);
        }
    }
}

/// Store each variable's live blocks. Returns whether any range changed.
fn record_live_ranges(func: &mut Function) -> bool {
    let liveness = Liveness::compute(func);
    let mut ranges: Vec<BTreeSet<BlockId>> = vec![BTreeSet::new(); func.vars.len()];
    for block in func.blocks.iter() {
        let b = block.id;
        for v in liveness.live_in[b.index()].iter_ones() {
            ranges[v].insert(b);
        }
        for v in liveness.live_out[b.index()].iter_ones() {
            ranges[v].insert(b);
        }
        for &inst in block.insts.iter() {
            let op = &func.inst(inst).op;
            if let Some(dst) = op.defined_var() {
                ranges[dst.index()].insert(b);
            }
            op.for_each_operand(|v| {
                if let Value::Var(var) = v {
                    ranges[var.index()].insert(b);
                }
            });
        }
    }

    let mut changed = false;
    for (var, range) in func.vars.iter_mut().zip(ranges) {
        let range: Vec<BlockId> = range.into_iter().collect();
        if var.live_range != range {
            var.live_range = range;
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompiler::analysis::AnalysisCache;
    use crate::decompiler::config::Abi;
    use crate::decompiler::ir::FuncId;

    fn run(func: &mut Function) -> PassOutcome {
        let abi = Abi::default();
        let analyses = AnalysisCache::new();
        let ctx = PassContext {
            analyses: &analyses,
            abi: &abi,
        };
        CoalesceVariables.run_on_function(func, &ctx).expect("coalesce")
    }

    #[test]
    fn test_copy_of_parameter_is_coalesced_into_it() {
        let mut func = Function::new(FuncId(0), "copy", 0);
        let arg = func.add_var("arg1", StorageClass::Param { index: 1, offset: 4 }, 4);
        let eax = func.add_var("eax", StorageClass::Register("eax".into()), 4);
        let b = func.add_block(0, 0);
        func.append_inst(b, Opcode::Assign { dst: eax, src: Value::Var(arg) }, 0);
        func.append_inst(b, Opcode::Return { value: Some(Value::Var(eax)) }, 0);

        assert!(run(&mut func).changed);
        let insts = &func.block(b).insts;
        assert_eq!(insts.len(), 1, "the self-copy is gone");
        assert_eq!(func.inst(insts[0]).op, Opcode::Return { value: Some(Value::Var(arg)) });
        assert_eq!(func.var(arg).live_range, vec![b]);
        assert_eq!(run(&mut func), PassOutcome::UNCHANGED);
    }

    #[test]
    fn test_interfering_copy_is_kept() {
        let mut func = Function::new(FuncId(0), "swap", 0);
        let ecx = func.add_var("ecx", StorageClass::Register("ecx".into()), 4);
        let edx = func.add_var("edx", StorageClass::Register("edx".into()), 4);
        let b = func.add_block(0, 0);
        // edx = ecx; ecx = ecx + 1; return edx + ecx
        func.append_inst(b, Opcode::Assign { dst: edx, src: Value::Var(ecx) }, 0);
        let inc = func.append_inst(
            b,
            Opcode::Binary { op: crate::decompiler::ir::BinaryOp::Add, lhs: Value::Var(ecx), rhs: Value::Const(1) },
            0,
        );
        func.append_inst(b, Opcode::Assign { dst: ecx, src: Value::Inst(inc) }, 0);
        let sum = func.append_inst(
            b,
            Opcode::Binary { op: crate::decompiler::ir::BinaryOp::Add, lhs: Value::Var(edx), rhs: Value::Var(ecx) },
            0,
        );
        func.append_inst(b, Opcode::Return { value: Some(Value::Inst(sum)) }, 0);

        run(&mut func);
        assert_eq!(func.block(b).insts.len(), 5, "edx and ecx are live at the same time");
        assert!(matches!(func.inst(func.block(b).insts[0]).op, Opcode::Assign { dst, .. } if dst == edx));
    }

    #[test]
    fn test_copy_chain_collapses_in_one_run() {
        let mut func = Function::new(FuncId(0), "chain", 0);
        let eax = func.add_var("eax", StorageClass::Register("eax".into()), 4);
        let esi = func.add_var("esi", StorageClass::Register("esi".into()), 4);
        let ebp = func.add_var("ebp", StorageClass::Register("ebp".into()), 4);
        let b = func.add_block(0, 0);
        // esi = eax; ebp = esi; return ebp + eax
        // ebp only stops interfering with eax once `esi = eax` is gone
        func.append_inst(b, Opcode::Assign { dst: esi, src: Value::Var(eax) }, 0);
        func.append_inst(b, Opcode::Assign { dst: ebp, src: Value::Var(esi) }, 0);
        let sum = func.append_inst(
            b,
            Opcode::Binary { op: crate::decompiler::ir::BinaryOp::Add, lhs: Value::Var(ebp), rhs: Value::Var(eax) },
            0,
        );
        func.append_inst(b, Opcode::Return { value: Some(Value::Inst(sum)) }, 0);

        assert!(run(&mut func).changed);
        assert_eq!(func.block(b).insts.len(), 2, "both copies are gone");
        assert_eq!(
            func.inst(sum).op,
            Opcode::Binary { op: crate::decompiler::ir::BinaryOp::Add, lhs: Value::Var(eax), rhs: Value::Var(eax) }
        );
        assert_eq!(run(&mut func), PassOutcome::UNCHANGED, "second run must be a no-op");
    }
}
