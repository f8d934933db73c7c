//! Return Value Recovery
//!
//! # Algorithm
//! 1. **Fold**: `eax = x; return eax` at the end of a block becomes `return x`
//! 2. **Void detection**: when no placed instruction writes the return register, every
//!    `return eax` becomes `return` and the function's return type becomes `None`.
//!    Runs after the fold, which can remove the last write.
//! 3. **Merge exits**: with two or more reachable return sites, each site jumps to a new
//!    exit block instead. The exit returns the common value, or a `retval` temporary
//!    merged from every site when the values differ.
//!
//! Return sites that disagree on whether they return a value are left alone.

use crate::decompiler::analysis::AnalysisKind;
use crate::decompiler::config::Abi;
use crate::decompiler::error::DecompileError;
use crate::decompiler::ir::{
    BlockId, Edge, EdgeKind, Function, InstId, Opcode, StorageClass, Type, Value, VarId,
};
use crate::decompiler::passes::{Pass, PassContext, PassDescriptor, PassOutcome, PassScope};
use smallvec::SmallVec;

pub const DESCRIPTOR: PassDescriptor = PassDescriptor {
    id: "merge-returns",
    scope: PassScope::Function,
    idempotent: true,
    description: "Recover the return value and merge return sites into one exit block",
    options: &[],
};

/// Name of the temporary that carries differing return values into the merged exit.
const RETVAL_NAME: &str = "retval";

pub struct MergeReturns;

impl Pass for MergeReturns {
    fn name(&self) -> &'static str {
        DESCRIPTOR.id
    }

    fn required_analyses(&self) -> &'static [AnalysisKind] {
        &[AnalysisKind::Reachability]
    }

    fn run_on_function(&self, func: &mut Function, ctx: &PassContext<'_>) -> Result<PassOutcome, DecompileError> {
        let reach = ctx.analyses.reachability()?;
        let ret_reg = func.find_var(&StorageClass::Register(ctx.abi.return_register.clone()));

        let mut outcome = PassOutcome::UNCHANGED;
        if let Some(reg) = ret_reg {
            if fold_return_copies(func, reg) {
                outcome = outcome.merge(PassOutcome::CHANGED);
            }
            if make_void(func, reg) {
                outcome = outcome.merge(PassOutcome::CHANGED);
            }
        }

        let mut sites: Vec<(BlockId, InstId)> = reach
            .rpo
            .iter()
            .filter_map(|&b| {
                let term = func.terminator(b)?;
                matches!(func.inst(term).op, Opcode::Return { .. }).then_some((b, term))
            })
            .collect();
        sites.sort_by_key(|&(b, _)| b);
        if sites.len() >= 2 && merge_sites(func, &sites, ctx.abi) {
            outcome = outcome.merge(PassOutcome::CFG_CHANGED);
        }

        if outcome.changed {
            log::debug!(
                "{}: returns {}",
                func.name,
                match &func.return_type {
                    Some(_) => "a value",
                    None => "void",
                }
            );
        }
        Ok(outcome)
    }
}

/// Turn `return reg` into `return` when nothing ever writes `reg`.
fn make_void(func: &mut Function, reg: VarId) -> bool {
    let written = func
        .placed_insts()
        .any(|(_, i)| func.inst(i).op.defined_var() == Some(reg));
    if written {
        return false;
    }

    let mut changed = false;
    let returns: Vec<InstId> = func
        .placed_insts()
        .map(|(_, i)| i)
        .filter(|&i| matches!(func.inst(i).op, Opcode::Return { value: Some(Value::Var(v)) } if v == reg))
        .collect();
    for inst in returns {
        func.inst_mut(inst).op = Opcode::Return { value: None };
        changed = true;
    }
    let all_void = func
        .placed_insts()
        .all(|(_, i)| !matches!(func.inst(i).op, Opcode::Return { value: Some(_) }));
    if all_void && func.return_type.is_some() {
        func.return_type = None;
        changed = true;
    }
    changed
}

/// `reg = x; ...; return reg` with no other read of `reg` in between becomes `return x`.
fn fold_return_copies(func: &mut Function, reg: VarId) -> bool {
    let mut folds: Vec<(BlockId, InstId, InstId, Value)> = Vec::new();
    for block in func.blocks.iter() {
        let Some((&ret, rest)) = block.insts.split_last() else {
            continue;
        };
        if !matches!(func.inst(ret).op, Opcode::Return { value: Some(Value::Var(v)) } if v == reg) {
            continue;
        }
        let Some(pos) = rest.iter().rposition(|&i| func.inst(i).op.defined_var() == Some(reg)) else {
            continue;
        };
        let def = rest[pos];
        let Opcode::Assign { src, .. } = func.inst(def).op else {
            continue;
        };
        if src == Value::Var(reg) {
            continue;
        }
        let between = &rest[pos + 1..];
        let clobbered = between.iter().any(|&i| {
            let op = &func.inst(i).op;
            let mut reads_reg = false;
            op.for_each_operand(|v| reads_reg |= *v == Value::Var(reg));
            reads_reg || matches!(src, Value::Var(s) if op.defined_var() == Some(s))
        });
        if !clobbered {
            folds.push((block.id, def, ret, src));
        }
    }

    for &(block, def, ret, src) in folds.iter() {
        func.inst_mut(ret).op = Opcode::Return { value: Some(src) };
        func.remove_inst(block, def);
    }
    !folds.is_empty()
}

/// Redirect every return site to a single new exit block.
fn merge_sites(func: &mut Function, sites: &[(BlockId, InstId)], abi: &Abi) -> bool {
    let values: Vec<Option<Value>> = sites
        .iter()
        .map(|&(_, term)| match func.inst(term).op {
            Opcode::Return { value } => value,
            _ => None,
        })
        .collect();
    let with_value = values.iter().filter(|v| v.is_some()).count();
    if with_value != 0 && with_value != values.len() {
        log::debug!("{}: return sites disagree on the return value, not merged", func.name);
        return false;
    }

    let exit_address = sites
        .iter()
        .map(|&(_, term)| func.inst(term).address)
        .max()
        .unwrap_or(func.entry_address);
    let exit = func.add_block(exit_address, exit_address);

    let common = values.first().copied().flatten();
    let all_same = values.iter().all(|v| *v == values[0]);
    let returned = if all_same {
        common
    } else {
        let retval = func.add_var(RETVAL_NAME, StorageClass::Temp, abi.word_size);
        let ty = func.return_type.clone().unwrap_or_default();
        func.var_mut(retval).ty = ty;
        let inputs: SmallVec<[(BlockId, Value); 2]> = sites
            .iter()
            .zip(values.iter())
            .filter_map(|(&(b, _), v)| v.map(|v| (b, v)))
            .collect();
        func.append_inst(exit, Opcode::Merge { dst: retval, inputs }, exit_address);
        Some(Value::Var(retval))
    };
    func.append_inst(exit, Opcode::Return { value: returned }, exit_address);

    for &(block, term) in sites.iter() {
        func.inst_mut(term).op = Opcode::Jump;
        func.block_mut(block)
            .edges
            .push(Edge::to_block(exit, EdgeKind::Unconditional));
    }
    func.rebuild_preds();
    func.mark_unreachable();
    func.return_width = abi.word_size;
    if returned.is_some() && func.return_type.is_none() {
        func.return_type = Some(Type::Unknown);
    }
    log::debug!("{}: merged {} return sites into {}", func.name, sites.len(), exit);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompiler::analysis::AnalysisCache;
    use crate::decompiler::ir::FuncId;
    use crate::decompiler::validator::CfgVerifier;

    fn run(func: &mut Function) -> PassOutcome {
        let abi = Abi::default();
        let analyses = AnalysisCache::for_function(func);
        let ctx = PassContext {
            analyses: &analyses,
            abi: &abi,
        };
        MergeReturns.run_on_function(func, &ctx).expect("merge-returns")
    }

    /// bb0 branches to bb1 (`eax = 1`) and bb2 (`eax = 2`); both return eax.
    fn two_returns() -> Function {
        let mut func = Function::new(FuncId(0), "two", 0x100);
        let eax = func.add_var("eax", StorageClass::Register("eax".into()), 4);
        let ecx = func.add_var("ecx", StorageClass::Register("ecx".into()), 4);
        let b0 = func.add_block(0x100, 0x104);
        let b1 = func.add_block(0x108, 0x10c);
        let b2 = func.add_block(0x110, 0x114);
        let cmp = func.append_inst(
            b0,
            Opcode::Compare { op: crate::decompiler::ir::CmpOp::Eq, lhs: Value::Var(ecx), rhs: Value::Const(0) },
            0x100,
        );
        func.append_inst(b0, Opcode::Branch { cond: Value::Inst(cmp) }, 0x104);
        func.block_mut(b0).edges.push(Edge::to_block(b1, EdgeKind::True));
        func.block_mut(b0).edges.push(Edge::to_block(b2, EdgeKind::False));
        for (b, value, at) in [(b1, 1, 0x108), (b2, 2, 0x110)] {
            func.append_inst(b, Opcode::Assign { dst: eax, src: Value::Const(value) }, at);
            func.append_inst(b, Opcode::Return { value: Some(Value::Var(eax)) }, at + 4);
        }
        func.rebuild_preds();
        func
    }

    #[test]
    fn test_differing_returns_merge_through_retval() {
        let mut func = two_returns();
        let outcome = run(&mut func);
        assert!(outcome.cfg_changed);
        assert_eq!(func.blocks.len(), 4);
        let exit = BlockId(3);
        assert_eq!(func.block(exit).preds.as_slice(), &[BlockId(1), BlockId(2)]);
        let merge = func.block(exit).insts[0];
        match &func.inst(merge).op {
            Opcode::Merge { dst, inputs } => {
                assert_eq!(func.var(*dst).name, "retval");
                assert_eq!(inputs.as_slice(), &[(BlockId(1), Value::Const(1)), (BlockId(2), Value::Const(2))]);
            }
            other => panic!("expected merge, got {:?}", other),
        }
        CfgVerifier::verify_function(&func).expect("valid after merge");
        assert_eq!(run(&mut func), PassOutcome::UNCHANGED, "second run must be a no-op");
    }

    #[test]
    fn test_void_when_return_register_never_written() {
        let mut func = Function::new(FuncId(0), "void", 0);
        let eax = func.add_var("eax", StorageClass::Register("eax".into()), 4);
        let b0 = func.add_block(0, 0);
        func.append_inst(b0, Opcode::Return { value: Some(Value::Var(eax)) }, 0);
        let outcome = run(&mut func);
        assert!(outcome.changed && !outcome.cfg_changed);
        assert_eq!(func.return_type, None);
        assert_eq!(func.inst(InstId(0)).op, Opcode::Return { value: None });
    }

    #[test]
    fn test_folding_last_write_voids_remaining_returns_in_one_run() {
        // bb0: eax = sub_2000(); return eax    bb1 (unreachable): return eax
        let mut func = Function::new(FuncId(0), "sub_1000", 0x1000);
        let eax = func.add_var("eax", StorageClass::Register("eax".into()), 4);
        let b0 = func.add_block(0x1000, 0x1005);
        let b1 = func.add_block(0x1006, 0x1006);
        let call = func.append_inst(
            b0,
            Opcode::Call { target: crate::decompiler::ir::CallTarget::Direct(0x2000), args: vec![] },
            0x1000,
        );
        func.append_inst(b0, Opcode::Assign { dst: eax, src: Value::Inst(call) }, 0x1000);
        func.append_inst(b0, Opcode::Return { value: Some(Value::Var(eax)) }, 0x1005);
        let stray = func.append_inst(b1, Opcode::Return { value: Some(Value::Var(eax)) }, 0x1006);
        func.rebuild_preds();
        func.mark_unreachable();

        let outcome = run(&mut func);
        assert!(outcome.changed && !outcome.cfg_changed);
        let ret = func.terminator(b0).expect("bb0 terminator");
        assert_eq!(func.inst(ret).op, Opcode::Return { value: Some(Value::Inst(call)) });
        assert_eq!(func.inst(stray).op, Opcode::Return { value: None });
        assert_eq!(run(&mut func), PassOutcome::UNCHANGED, "second run must be a no-op");
    }
}
