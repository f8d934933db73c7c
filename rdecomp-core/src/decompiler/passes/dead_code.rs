//! Dead Code Elimination
//!
//! # Algorithm
//! Repeat until nothing is removed:
//! 1. Compute variable liveness
//! 2. Remove assignments and merges whose destination is dead afterwards (writes to
//!    globals are always kept)
//! 3. Remove pure instructions and loads whose result is never used
//!
//! With `remove-unreachable`, blocks not reachable from the entry are deleted first.

use crate::decompiler::analysis::Liveness;
use crate::decompiler::config::{OptionKind, PassOptions};
use crate::decompiler::error::DecompileError;
use crate::decompiler::ir::{BlockId, Function, InstId, StorageClass};
use crate::decompiler::passes::{
    OptionSpec, Pass, PassContext, PassDescriptor, PassOutcome, PassScope,
};
use bitvec::prelude::*;

pub const DESCRIPTOR: PassDescriptor = PassDescriptor {
    id: "dead-code",
    scope: PassScope::Function,
    idempotent: true,
    description: "Remove dead assignments, unused pure instructions and optionally unreachable blocks",
    options: &[OptionSpec {
        name: "remove-unreachable",
        kind: OptionKind::Bool,
        description: "Delete blocks that cannot be reached from the entry",
    }],
};

pub struct DeadCode {
    remove_unreachable: bool,
}

impl DeadCode {
    pub fn from_options(options: &PassOptions) -> Self {
        Self {
            remove_unreachable: options.get_bool("remove-unreachable", false),
        }
    }
}

impl Pass for DeadCode {
    fn name(&self) -> &'static str {
        DESCRIPTOR.id
    }

    fn run_on_function(&self, func: &mut Function, _ctx: &PassContext<'_>) -> Result<PassOutcome, DecompileError> {
        let mut outcome = PassOutcome::UNCHANGED;

        if self.remove_unreachable && func.blocks.iter().any(|b| b.unreachable) {
            let keep: BitVec<u32> = func.blocks.iter().map(|b| !b.unreachable).collect();
            let dropped = keep.count_zeros();
            func.retain_blocks(&keep)?;
            func.mark_unreachable();
            log::debug!("{}: removed {} unreachable blocks", func.name, dropped);
            outcome = PassOutcome::CFG_CHANGED;
        }

        let mut removed_total = 0usize;
        loop {
            let dead = find_dead(func);
            if dead.is_empty() {
                break;
            }
            removed_total += dead.len();
            for (block, inst) in dead {
                func.remove_inst(block, inst);
            }
        }
        if removed_total > 0 {
            log::debug!("{}: removed {} dead instructions", func.name, removed_total);
            outcome = outcome.merge(PassOutcome::CHANGED);
        }
        Ok(outcome)
    }
}

/// One sweep: dead variable writes plus unused removable instructions.
fn find_dead(func: &Function) -> Vec<(BlockId, InstId)> {
    let liveness = Liveness::compute(func);
    let uses = func.inst_use_counts();
    let mut dead: Vec<(BlockId, InstId)> = Vec::new();

    for block in func.block_ids() {
        let start = dead.len();
        liveness.walk_block(func, block, |inst, live_after| {
            let op = &func.inst(inst).op;
            let dead_write = op.defined_var().map_or(false, |dst| {
                !matches!(func.var(dst).storage, StorageClass::Global(_)) && !live_after[dst.index()]
            });
            let unused = op.is_removable_when_unused() && uses[inst.index()] == 0;
            if dead_write || unused {
                dead.push((block, inst));
            }
        });
        // Walked backwards; keep block order forwards for stable logging
        dead[start..].reverse();
    }
    dead
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompiler::analysis::AnalysisCache;
    use crate::decompiler::config::{Abi, OptionValue};
    use crate::decompiler::ir::{BinaryOp, Edge, EdgeKind, FuncId, Opcode, Value};

    fn run(func: &mut Function, remove_unreachable: bool) -> PassOutcome {
        let abi = Abi::default();
        let analyses = AnalysisCache::new();
        let ctx = PassContext {
            analyses: &analyses,
            abi: &abi,
        };
        let options = PassOptions::new().with("remove-unreachable", OptionValue::Bool(remove_unreachable));
        DeadCode::from_options(&options)
            .run_on_function(func, &ctx)
            .expect("dead-code")
    }

    #[test]
    fn test_dead_chain_is_removed_to_fixpoint() {
        let mut func = Function::new(FuncId(0), "chain", 0);
        let ecx = func.add_var("ecx", StorageClass::Register("ecx".into()), 4);
        let edx = func.add_var("edx", StorageClass::Register("edx".into()), 4);
        let b = func.add_block(0, 0);
        let sum = func.append_inst(
            b,
            Opcode::Binary { op: BinaryOp::Add, lhs: Value::Var(ecx), rhs: Value::Const(1) },
            0,
        );
        func.append_inst(b, Opcode::Assign { dst: edx, src: Value::Inst(sum) }, 0);
        func.append_inst(b, Opcode::Return { value: Some(Value::Var(ecx)) }, 0);

        assert!(run(&mut func, false).changed);
        assert_eq!(func.block(b).insts.len(), 1, "only the return survives");
        assert_eq!(run(&mut func, false), PassOutcome::UNCHANGED);
    }

    #[test]
    fn test_unreachable_blocks_removed_only_on_request() {
        let mut func = Function::new(FuncId(0), "orphans", 0);
        let b0 = func.add_block(0, 0);
        let b1 = func.add_block(4, 4);
        func.append_inst(b0, Opcode::Return { value: None }, 0);
        func.append_inst(b1, Opcode::Jump, 4);
        func.block_mut(b1).edges.push(Edge::to_block(b0, EdgeKind::Unconditional));
        func.rebuild_preds();
        func.mark_unreachable();

        assert_eq!(run(&mut func, false), PassOutcome::UNCHANGED);
        assert_eq!(func.blocks.len(), 2);

        let outcome = run(&mut func, true);
        assert!(outcome.cfg_changed);
        assert_eq!(func.blocks.len(), 1);
        assert!(func.block(BlockId(0)).preds.is_empty());
    }
}
