//! IR Validation
//!
//! Structural checks shared by the CFG builder (after construction) and the pipeline
//! (after every pass that reports a change).
//!
//! # Validation Checks
//! - **Blocks**: the entry exists, ids match positions, every block is non-empty and ends
//!   in exactly one terminator, no removed (`Nop`) instruction is placed
//! - **Edges**: count and kinds match the terminator, targets exist, predecessor lists
//!   agree with edges, unreachable flags agree with a walk from the entry
//! - **Values**: instruction results are used only after their definition (same block) or
//!   in blocks their definition dominates; merge inputs come from predecessors;
//!   variable ids are in range
//! - **Module**: function names are unique

use crate::decompiler::analysis::{DominatorTree, Reachability};
use crate::decompiler::error::DecompileError;
use crate::decompiler::ir::{BlockId, EdgeKind, EdgeTarget, Function, Module, Opcode, Value};
use bitvec::prelude::*;
use std::collections::HashSet;

/// Structural verifier for IR functions.
pub struct CfgVerifier;

impl CfgVerifier {
    /// Verify every function and the uniqueness of function names.
    ///
    /// # Errors
    /// `InvariantViolation` naming the first offending function and block.
    pub fn verify_module(module: &Module) -> Result<(), DecompileError> {
        let mut names: HashSet<&str> = HashSet::with_capacity(module.functions.len());
        for func in module.functions.iter() {
            if !names.insert(func.name.as_str()) {
                return Err(DecompileError::invariant(
                    format!("function name `{}` is not unique", func.name),
                    func.context(),
                ));
            }
            Self::verify_function(func)?;
        }
        Ok(())
    }

    /// Verify one function.
    ///
    /// # Errors
    /// `InvariantViolation` with the function, block and address of the first problem.
    pub fn verify_function(func: &Function) -> Result<(), DecompileError> {
        let fail = |block: Option<BlockId>, message: String| {
            let mut context = func.context();
            if let Some(b) = block {
                context = context.with_block(b);
                if let Some(bb) = func.blocks.get(b.index()) {
                    context = context.with_address(bb.start_address);
                }
            }
            Err(DecompileError::invariant(message, context))
        };

        let n = func.blocks.len();
        if func.entry.index() >= n {
            return fail(None, format!("entry block {} does not exist", func.entry));
        }

        let mut placed: BitVec<u32> = bitvec![u32, Lsb0; 0; func.insts.len()];
        for (index, block) in func.blocks.iter().enumerate() {
            let b = block.id;
            if b.index() != index {
                return fail(Some(b), format!("block stored at position {} has id {}", index, b));
            }
            let Some(&last) = block.insts.last() else {
                return fail(Some(b), "block has no instructions".to_string());
            };
            for &inst in block.insts.iter() {
                if inst.index() >= func.insts.len() {
                    return fail(Some(b), format!("instruction {} does not exist", inst));
                }
                if placed[inst.index()] {
                    return fail(Some(b), format!("instruction {} is placed twice", inst));
                }
                placed.set(inst.index(), true);
                let op = &func.inst(inst).op;
                if matches!(op, Opcode::Nop) {
                    return fail(Some(b), format!("removed instruction {} is still placed", inst));
                }
                if op.is_terminator() && inst != last {
                    return fail(Some(b), format!("terminator {} is not the last instruction", inst));
                }
            }

            let edges = &block.edges;
            let shape_ok = match &func.inst(last).op {
                Opcode::Jump => {
                    edges.len() == 1
                        && matches!(edges[0].kind, EdgeKind::Unconditional | EdgeKind::Fallthrough)
                }
                Opcode::Branch { .. } => {
                    edges.len() == 2
                        && edges.iter().filter(|e| e.kind == EdgeKind::True).count() == 1
                        && edges.iter().filter(|e| e.kind == EdgeKind::False).count() == 1
                }
                Opcode::Switch { .. } => {
                    !edges.is_empty()
                        && edges.iter().enumerate().all(|(i, e)| e.kind == EdgeKind::SwitchCase(i as u32))
                }
                Opcode::Return { .. } => edges.is_empty(),
                _ => {
                    return fail(Some(b), "block does not end in a terminator".to_string());
                }
            };
            if !shape_ok {
                return fail(
                    Some(b),
                    format!(
                        "{} edges do not match the `{}` terminator",
                        edges.len(),
                        func.inst(last).op.mnemonic()
                    ),
                );
            }
            for edge in edges.iter() {
                if let EdgeTarget::Block(t) = edge.target {
                    if t.index() >= n {
                        return fail(Some(b), format!("edge targets missing block {}", t));
                    }
                    if !func.block(t).preds.contains(&b) {
                        return fail(Some(t), format!("predecessor {} is missing", b));
                    }
                }
            }
            for &p in block.preds.iter() {
                if p.index() >= n || !func.block(p).successors().any(|s| s == b) {
                    return fail(Some(b), format!("{} is listed as predecessor without an edge", p));
                }
            }
        }

        let reach = Reachability::compute(func);
        for block in func.blocks.iter() {
            if block.unreachable == reach.is_reachable(block.id) {
                return fail(
                    Some(block.id),
                    format!("unreachable flag is {} but the block is {}", block.unreachable, if block.unreachable { "reachable" } else { "unreachable" }),
                );
            }
        }

        Self::verify_values(func, &reach, &placed)
    }

    fn verify_values(func: &Function, reach: &Reachability, placed: &BitSlice<u32>) -> Result<(), DecompileError> {
        let dom = DominatorTree::compute(func);
        let locations = func.inst_locations();
        let vars = func.vars.len();

        for block in func.blocks.iter() {
            let b = block.id;
            for (pos, &inst) in block.insts.iter().enumerate() {
                let op = &func.inst(inst).op;
                let mut problem: Option<String> = None;

                if let Some(dst) = op.defined_var() {
                    if dst.index() >= vars {
                        problem = Some(format!("{} writes missing variable {}", inst, dst));
                    }
                }

                if let Opcode::Merge { inputs, .. } = op {
                    for (pred, value) in inputs.iter() {
                        if !block.preds.contains(pred) {
                            problem = Some(format!("merge {} names {} which is not a predecessor", inst, pred));
                        } else if let Value::Inst(def) = value {
                            match locations[def.index()] {
                                Some((def_block, _)) if !reach.is_reachable(*pred) || dom.dominates(def_block, *pred) => {}
                                _ => {
                                    problem = Some(format!("merge {} input {} is not available in {}", inst, def, pred))
                                }
                            }
                        }
                    }
                } else {
                    op.for_each_operand(|value| {
                        let issue = match *value {
                            Value::Var(v) if v.index() >= vars => Some(format!("{} reads missing variable {}", inst, v)),
                            Value::Inst(def) if def.index() >= func.insts.len() || !placed[def.index()] => {
                                Some(format!("{} uses {} which is not placed", inst, def))
                            }
                            Value::Inst(def) => {
                                let produces = func.inst(def).op.produces_value();
                                match locations[def.index()] {
                                    _ if !produces => Some(format!("{} uses {} which produces no value", inst, def)),
                                    Some((def_block, def_pos)) if def_block == b => {
                                        if (def_pos as usize) < pos {
                                            None
                                        } else {
                                            Some(format!("{} uses {} before its definition", inst, def))
                                        }
                                    }
                                    Some((def_block, _)) => {
                                        if !reach.is_reachable(b) || dom.dominates(def_block, b) {
                                            None
                                        } else {
                                            Some(format!("{} uses {} from a non-dominating block", inst, def))
                                        }
                                    }
                                    None => Some(format!("{} uses {} which is not placed", inst, def)),
                                }
                            }
                            _ => None,
                        };
                        if problem.is_none() {
                            problem = issue;
                        }
                    });
                }

                if let Some(message) = problem {
                    let mut context = func.context().with_block(b);
                    context.address = Some(func.inst(inst).address);
                    return Err(DecompileError::invariant(message, context));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompiler::ir::{Edge, FuncId};

    #[test]
    fn test_missing_terminator_is_reported() {
        let mut func = Function::new(FuncId(0), "broken", 0x40);
        let b = func.add_block(0x40, 0x40);
        func.append_inst(b, Opcode::Nop, 0x40);
        func.insts[0].op = Opcode::Load { addr: Value::Const(0), size: 4 };
        match CfgVerifier::verify_function(&func) {
            Err(DecompileError::InvariantViolation { message, context }) => {
                assert!(message.contains("terminator"), "message was {}", message);
                assert_eq!(context.block, Some(b));
                assert_eq!(context.function.as_deref(), Some("broken"));
            }
            other => panic!("expected invariant violation, got {:?}", other),
        }
    }

    #[test]
    fn test_use_before_definition_is_reported() {
        let mut func = Function::new(FuncId(0), "order", 0);
        let b = func.add_block(0, 0);
        let later = func.add_inst(Opcode::Load { addr: Value::Const(8), size: 4 }, 0);
        func.append_inst(b, Opcode::Return { value: Some(Value::Inst(later)) }, 0);
        assert!(CfgVerifier::verify_function(&func).is_err());
    }

    #[test]
    fn test_edge_without_predecessor_is_reported() {
        let mut func = Function::new(FuncId(0), "preds", 0);
        let a = func.add_block(0, 0);
        let c = func.add_block(4, 4);
        func.append_inst(a, Opcode::Jump, 0);
        func.block_mut(a).edges.push(Edge::to_block(c, EdgeKind::Unconditional));
        func.append_inst(c, Opcode::Return { value: None }, 4);
        assert!(CfgVerifier::verify_function(&func).is_err());
        func.rebuild_preds();
        assert!(CfgVerifier::verify_function(&func).is_ok());
    }
}
