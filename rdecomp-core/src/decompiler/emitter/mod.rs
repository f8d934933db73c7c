//! Pseudocode Emission
//!
//! Renders a function's region tree as C-like pseudocode.
//!
//! # Emission Rules
//! - **Expressions**: an instruction result read exactly once, later in its own block,
//!   with only pure computations or loads in between, is folded into its user. Other
//!   results are materialized as temporaries `t1`, `t2`, ... in block order.
//! - **Merges**: each merge input becomes a copy at the end of its predecessor block
//! - **Gotos**: every `Goto` target gets a `LAB_<address>` label in front of its block
//! - **Declarations**: locals and temporaries are declared at the top of the body, or
//!   before the first top-level statement that uses them ([`DeclarationPlacement`])
//!
//! The output depends only on the function and the configuration.

pub mod expr;

pub use expr::Expr;

use crate::decompiler::config::{DeclarationPlacement, EmitterConfig};
use crate::decompiler::ir::{
    BlockId, CallTarget, Function, InstId, Module, Opcode, StorageClass, Type, UnaryOp, Value, VarId,
};
use crate::decompiler::structurer::{Condition, Region, Structurer};
use bitvec::prelude::*;
use std::borrow::Cow;

/// Width assumed for values whose instruction does not fix one.
const DEFAULT_VALUE_WIDTH: u8 = 4;

/// Pseudocode writer for one function.
pub struct Emitter<'a> {
    func: &'a Function,
    config: &'a EmitterConfig,
    out: String,
    indent_level: usize,
    /// Instruction results folded into their single user
    inlined: BitVec<u32>,
    /// Temporary name of each materialized instruction result
    temps: Vec<Option<String>>,
    /// Blocks that are `goto` targets
    labels: BitVec<u32>,
    /// Copies lowered from merges, per predecessor block
    copies: Vec<Vec<(VarId, Value)>>,
    declared_vars: BitVec<u32>,
    declared_temps: BitVec<u32>,
}

impl<'a> Emitter<'a> {
    /// Render every function of `module`, separated by blank lines.
    pub fn emit_module(module: &Module, config: &EmitterConfig) -> String {
        let mut out = String::new();
        for (i, func) in module.functions.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(&Emitter::emit_function(func, config));
        }
        out
    }

    /// Render one function. Functions that were not structured yet are structured first.
    pub fn emit_function(func: &Function, config: &EmitterConfig) -> String {
        let region: Cow<'_, Region> = match &func.region {
            Some(region) => Cow::Borrowed(region),
            None => Cow::Owned(Structurer::structure_function(func)),
        };
        let mut emitter = Emitter::new(func, config, &region);
        emitter.emit(&region);
        log::debug!("{}: emitted {} bytes", func.name, emitter.out.len());
        emitter.out
    }

    fn new(func: &'a Function, config: &'a EmitterConfig, region: &Region) -> Self {
        let n = func.insts.len();
        let locations = func.inst_locations();

        let mut uses = vec![0u32; n];
        let mut user: Vec<Option<(BlockId, u32)>> = vec![None; n];
        for block in func.blocks.iter() {
            for (pos, &inst) in block.insts.iter().enumerate() {
                let op = &func.inst(inst).op;
                let is_merge = matches!(op, Opcode::Merge { .. });
                op.for_each_operand(|v| {
                    if let Value::Inst(def) = v {
                        uses[def.index()] += 1;
                        user[def.index()] = if is_merge { None } else { Some((block.id, pos as u32)) };
                    }
                });
            }
        }

        let mut inlined: BitVec<u32> = bitvec![u32, Lsb0; 0; n];
        for (i, location) in locations.iter().enumerate() {
            let (Some((block, def_pos)), Some((use_block, use_pos))) = (*location, user[i]) else {
                continue;
            };
            if uses[i] != 1 || use_block != block || use_pos <= def_pos || !func.insts[i].op.produces_value() {
                continue;
            }
            let between = &func.block(block).insts[def_pos as usize + 1..use_pos as usize];
            let quiet = between.iter().all(|&j| {
                let op = &func.inst(j).op;
                op.is_pure() || matches!(op, Opcode::Load { .. })
            });
            if quiet {
                inlined.set(i, true);
            }
        }

        let mut temps: Vec<Option<String>> = vec![None; n];
        let mut count = 0usize;
        for (_, inst) in func.placed_insts() {
            let i = inst.index();
            if func.inst(inst).op.produces_value() && !inlined[i] && uses[i] > 0 {
                count += 1;
                temps[i] = Some(format!("t{}", count));
            }
        }

        let mut copies: Vec<Vec<(VarId, Value)>> = vec![Vec::new(); func.blocks.len()];
        for (_, inst) in func.placed_insts() {
            if let Opcode::Merge { dst, inputs } = &func.inst(inst).op {
                for &(pred, value) in inputs.iter() {
                    if let Some(list) = copies.get_mut(pred.index()) {
                        list.push((*dst, value));
                    }
                }
            }
        }

        let mut labels: BitVec<u32> = bitvec![u32, Lsb0; 0; func.blocks.len()];
        for target in region.goto_targets() {
            if target.index() < labels.len() {
                labels.set(target.index(), true);
            }
        }

        Self {
            func,
            config,
            out: String::new(),
            indent_level: 0,
            inlined,
            temps,
            labels,
            copies,
            declared_vars: bitvec![u32, Lsb0; 0; func.vars.len()],
            declared_temps: bitvec![u32, Lsb0; 0; n],
        }
    }

    fn emit(&mut self, region: &Region) {
        for warning in self.func.warnings.iter() {
            let line = format!("// WARNING: {}", warning.message);
            self.line(&line);
        }
        let signature = self.signature();
        self.line(&signature);
        self.line("{");
        self.indent_level += 1;

        let items: &[Region] = match region {
            Region::Sequence(items) => items,
            other => std::slice::from_ref(other),
        };
        match self.config.declarations {
            DeclarationPlacement::Top => {
                let (vars, temps) = self.declarable(self.func.block_ids());
                if self.declare(vars, temps) {
                    self.out.push('\n');
                }
                for item in items {
                    self.emit_region(item);
                }
            }
            DeclarationPlacement::FirstUse => {
                for item in items {
                    let (vars, temps) = self.declarable(item.leaves().into_iter());
                    self.declare(vars, temps);
                    self.emit_region(item);
                }
            }
        }

        self.indent_level -= 1;
        self.line("}");
    }

    fn signature(&self) -> String {
        let ret = match &self.func.return_type {
            Some(ty) => ty.c_name(self.func.return_width),
            None => "void".to_string(),
        };
        let params: Vec<String> = self
            .func
            .params()
            .iter()
            .map(|p| format!("{} {}", p.ty.c_name(p.size), p.name))
            .collect();
        let params = if params.is_empty() {
            "void".to_string()
        } else {
            params.join(", ")
        };
        format!("{} {}({})", ret, self.func.name, params)
    }

    /// Undeclared locals (by id) and temporaries (in order) used by `blocks`.
    fn declarable(&self, blocks: impl Iterator<Item = BlockId>) -> (Vec<VarId>, Vec<InstId>) {
        let mut used: BitVec<u32> = bitvec![u32, Lsb0; 0; self.func.vars.len()];
        let mut temps: Vec<InstId> = Vec::new();
        for b in blocks {
            for &inst in self.func.block(b).insts.iter() {
                let op = &self.func.inst(inst).op;
                if let Some(dst) = op.defined_var() {
                    used.set(dst.index(), true);
                }
                op.for_each_operand(|v| mark_var(v, &mut used));
                if self.temps[inst.index()].is_some() && !self.declared_temps[inst.index()] {
                    temps.push(inst);
                }
            }
            for (dst, value) in self.copies[b.index()].iter() {
                used.set(dst.index(), true);
                mark_var(value, &mut used);
            }
        }
        let vars = used
            .iter_ones()
            .map(VarId::from_index)
            .filter(|&v| !self.declared_vars[v.index()])
            .filter(|&v| {
                !matches!(
                    self.func.var(v).storage,
                    StorageClass::Param { .. } | StorageClass::Global(_)
                )
            })
            .collect();
        (vars, temps)
    }

    /// Emit declarations. Returns whether anything was declared.
    fn declare(&mut self, vars: Vec<VarId>, temps: Vec<InstId>) -> bool {
        let any = !vars.is_empty() || !temps.is_empty();
        for v in vars {
            self.declared_vars.set(v.index(), true);
            let var = self.func.var(v);
            let line = format!("{} {};", var.ty.c_name(var.size), var.name);
            self.line(&line);
        }
        for inst in temps {
            self.declared_temps.set(inst.index(), true);
            let Some(name) = self.temps[inst.index()].clone() else {
                continue;
            };
            let line = format!("{} {};", self.func.inst(inst).ty.c_name(self.value_width(inst)), name);
            self.line(&line);
        }
        any
    }

    fn emit_region(&mut self, region: &Region) {
        match region {
            Region::Leaf(b) => self.emit_leaf(*b),
            Region::Sequence(items) => {
                for item in items {
                    self.emit_region(item);
                }
            }
            Region::IfThenElse {
                cond,
                then_region,
                else_region,
            } => {
                let line = format!("if ({}) {{", self.condition(cond).render());
                self.line(&line);
                self.emit_if_tail(then_region, else_region.as_deref());
            }
            Region::While { cond, header, body } => {
                self.emit_region(header);
                let line = format!("while ({}) {{", self.condition(cond).render());
                self.line(&line);
                self.nested(body);
                self.line("}");
            }
            Region::DoWhile { body, cond } => {
                self.line("do {");
                self.nested(body);
                let line = format!("}} while ({});", self.condition(cond).render());
                self.line(&line);
            }
            Region::Loop { body } => {
                self.line("while (true) {");
                self.nested(body);
                self.line("}");
            }
            Region::Switch { block, cases } => {
                let line = format!("switch ({}) {{", self.selector(*block).render());
                self.line(&line);
                for case in cases.iter() {
                    for value in case.values.iter() {
                        let line = format!("case {}:", value);
                        self.line(&line);
                    }
                    self.indent_level += 1;
                    self.emit_region(&case.body);
                    if !self.ends_in_transfer(&case.body) {
                        self.line("break;");
                    }
                    self.indent_level -= 1;
                }
                self.line("}");
            }
            Region::Break => self.line("break;"),
            Region::Continue => self.line("continue;"),
            Region::Goto(target) => {
                let line = format!("goto {};", self.label_name(*target));
                self.line(&line);
            }
            Region::GotoUnknown(Some(address)) => {
                let line = format!("goto *0x{:x};", address);
                self.line(&line);
            }
            Region::GotoUnknown(None) => self.line("goto *unknown;"),
        }
    }

    /// Then-arm and the rest of an if statement whose opening line is already written.
    fn emit_if_tail(&mut self, then_region: &Region, else_region: Option<&Region>) {
        self.nested(then_region);
        let Some(else_region) = else_region else {
            self.line("}");
            return;
        };
        if let Some((cond, then_next, else_next)) = self.else_if(else_region) {
            let line = format!("}} else if ({}) {{", self.condition(cond).render());
            self.line(&line);
            self.emit_if_tail(then_next, else_next);
        } else {
            self.line("} else {");
            self.nested(else_region);
            self.line("}");
        }
    }

    /// An else arm holding only another if (behind a block with nothing to print).
    fn else_if<'r>(&self, region: &'r Region) -> Option<(&'r Condition, &'r Region, Option<&'r Region>)> {
        let Region::Sequence(items) = region else {
            return None;
        };
        match items.as_slice() {
            [Region::Leaf(b), Region::IfThenElse {
                cond,
                then_region,
                else_region,
            }] if self.is_silent(*b) => Some((cond, &**then_region, else_region.as_deref())),
            _ => None,
        }
    }

    fn nested(&mut self, region: &Region) {
        self.indent_level += 1;
        self.emit_region(region);
        self.indent_level -= 1;
    }

    fn emit_leaf(&mut self, b: BlockId) {
        let func = self.func;
        let block = func.block(b);
        if self.labels[b.index()] {
            let line = format!("{}:", self.label_name(b));
            let level = self.indent_level.saturating_sub(1);
            self.line_at(level, &line);
        }
        if self.config.show_addresses {
            let line = format!(
                "// {} @ 0x{:08x}..0x{:08x}",
                b, block.start_address, block.end_address
            );
            self.line(&line);
        }
        for &inst in block.insts.iter() {
            if let Some(statement) = self.statement(inst) {
                self.line(&statement);
            }
        }
        for k in 0..self.copies[b.index()].len() {
            let (dst, value) = self.copies[b.index()][k];
            let line = format!("{} = {};", func.var(dst).name, self.value(value).render());
            self.line(&line);
        }
    }

    /// Nothing would be printed for the block.
    fn is_silent(&self, b: BlockId) -> bool {
        !self.labels[b.index()]
            && !self.config.show_addresses
            && self.copies[b.index()].is_empty()
            && self.func.block(b).insts.iter().all(|&i| self.statement(i).is_none())
    }

    /// Statement text for an instruction, `None` when it prints nothing where it stands.
    fn statement(&self, inst: InstId) -> Option<String> {
        let op = &self.func.inst(inst).op;
        match op {
            Opcode::Assign { dst, src } => Some(format!(
                "{} = {};",
                self.func.var(*dst).name,
                self.value(*src).render()
            )),
            Opcode::Store { addr, value, size } => Some(format!(
                "{} = {};",
                self.deref(*addr, *size).render(),
                self.value(*value).render()
            )),
            Opcode::Return { value: Some(value) } => Some(format!("return {};", self.value(*value).render())),
            Opcode::Return { value: None } => Some("return;".to_string()),
            _ if op.produces_value() => {
                let i = inst.index();
                if self.inlined[i] {
                    None
                } else if let Some(name) = &self.temps[i] {
                    Some(format!("{} = {};", name, self.inst_expr(inst).render()))
                } else if op.is_removable_when_unused() {
                    None
                } else {
                    Some(format!("{};", self.inst_expr(inst).render()))
                }
            }
            _ => None,
        }
    }

    fn value(&self, value: Value) -> Expr {
        match value {
            Value::Const(c) => Expr::Const(c),
            Value::Var(v) => Expr::name(self.func.var(v).name.as_str()),
            Value::Inst(i) => match &self.temps[i.index()] {
                Some(name) => Expr::name(name.as_str()),
                None => self.inst_expr(i),
            },
        }
    }

    fn inst_expr(&self, inst: InstId) -> Expr {
        match &self.func.inst(inst).op {
            Opcode::Binary { op, lhs, rhs } => Expr::binary(*op, self.value(*lhs), self.value(*rhs)),
            Opcode::Unary { op, operand } => {
                let operand = self.value(*operand);
                match op {
                    UnaryOp::Neg => Expr::prefix("-", operand),
                    UnaryOp::Not => Expr::prefix("~", operand),
                    UnaryOp::Cast { bytes, signed } => {
                        let bits = u32::from(*bytes) * 8;
                        let ty = if *signed {
                            format!("int{}_t", bits)
                        } else {
                            format!("uint{}_t", bits)
                        };
                        Expr::cast(ty, operand)
                    }
                }
            }
            Opcode::Compare { op, lhs, rhs } => Expr::compare(*op, self.value(*lhs), self.value(*rhs)),
            Opcode::Load { addr, size } => self.deref(*addr, *size),
            Opcode::Call { target, args } => Expr::Call {
                callee: Box::new(self.callee(target)),
                args: args.iter().map(|a| self.value(*a)).collect(),
            },
            Opcode::Intrinsic { name, args } => Expr::Call {
                callee: Box::new(Expr::name(format!("__{}", name))),
                args: args.iter().map(|a| self.value(*a)).collect(),
            },
            other => Expr::name(other.mnemonic()),
        }
    }

    fn callee(&self, target: &CallTarget) -> Expr {
        match target {
            CallTarget::Direct(address) => Expr::name(format!("sub_{:x}", address)),
            CallTarget::Function { name, .. } => Expr::name(name.as_str()),
            CallTarget::Indirect(value) => Expr::Deref {
                ty: None,
                addr: Box::new(self.value(*value)),
            },
        }
    }

    /// `*addr`, with an explicit pointer cast unless `addr` already points to a `size`-byte integer.
    fn deref(&self, addr: Value, size: u8) -> Expr {
        let addr_ty = match addr {
            Value::Var(v) => Some(&self.func.var(v).ty),
            Value::Inst(i) => Some(&self.func.inst(i).ty),
            Value::Const(_) => None,
        };
        let typed = matches!(addr_ty, Some(Type::Ptr(inner)) if **inner == Type::int(size));
        Expr::Deref {
            ty: if typed { None } else { Some(Type::int(size).c_name(size)) },
            addr: Box::new(self.value(addr)),
        }
    }

    fn condition(&self, cond: &Condition) -> Expr {
        let expr = match &self.func.inst(cond.branch).op {
            Opcode::Branch { cond: value } => self.value(*value),
            _ => Expr::Const(1),
        };
        if cond.negated {
            expr.negate()
        } else {
            expr
        }
    }

    fn selector(&self, block: BlockId) -> Expr {
        let term = self.func.terminator(block).map(|t| &self.func.inst(t).op);
        match term {
            Some(Opcode::Switch { selector }) => self.value(*selector),
            _ => Expr::Const(0),
        }
    }

    fn value_width(&self, inst: InstId) -> u8 {
        match &self.func.inst(inst).op {
            Opcode::Load { size, .. } => *size,
            Opcode::Unary {
                op: UnaryOp::Cast { bytes, .. },
                ..
            } => *bytes,
            Opcode::Compare { .. } => 1,
            _ => DEFAULT_VALUE_WIDTH,
        }
    }

    /// Control never leaves the region through its end.
    fn ends_in_transfer(&self, region: &Region) -> bool {
        match region {
            Region::Sequence(items) => items.last().map_or(false, |r| self.ends_in_transfer(r)),
            Region::Leaf(b) => matches!(
                self.func.terminator(*b).map(|t| &self.func.inst(t).op),
                Some(Opcode::Return { .. })
            ),
            other => other.is_jump(),
        }
    }

    fn label_name(&self, block: BlockId) -> String {
        format!("LAB_{:08x}", self.func.block(block).start_address)
    }

    #[inline]
    fn line(&mut self, text: &str) {
        self.line_at(self.indent_level, text);
    }

    fn line_at(&mut self, level: usize, text: &str) {
        for _ in 0..level * self.config.indent {
            self.out.push(' ');
        }
        self.out.push_str(text);
        self.out.push('\n');
    }
}

fn mark_var(value: &Value, used: &mut BitVec<u32>) {
    if let Value::Var(var) = value {
        used.set(var.index(), true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompiler::ir::{CmpOp, Edge, EdgeKind, FuncId};
    use smallvec::smallvec;

    #[test]
    fn test_single_return_of_parameter() {
        let mut func = Function::new(FuncId(0), "sub_401000", 0x401000);
        let arg = func.add_var("arg1", StorageClass::Param { index: 1, offset: 4 }, 4);
        let b = func.add_block(0x401000, 0x401008);
        func.append_inst(b, Opcode::Return { value: Some(Value::Var(arg)) }, 0x401008);

        let text = Emitter::emit_function(&func, &EmitterConfig::default());
        assert_eq!(text, "undefined4 sub_401000(undefined4 arg1)\n{\n    return arg1;\n}\n");
    }

    /// if (ecx == 0) retval = 1 else retval = 2, merged in bb3
    fn merged_diamond() -> Function {
        let mut func = Function::new(FuncId(0), "pick", 0x1000);
        let ecx = func.add_var("ecx", StorageClass::Register("ecx".into()), 4);
        let retval = func.add_var("retval", StorageClass::Temp, 4);
        let b0 = func.add_block(0x1000, 0x1004);
        let b1 = func.add_block(0x1008, 0x1008);
        let b2 = func.add_block(0x100c, 0x100c);
        let b3 = func.add_block(0x1010, 0x1010);
        let cmp = func.append_inst(
            b0,
            Opcode::Compare { op: CmpOp::Eq, lhs: Value::Var(ecx), rhs: Value::Const(0) },
            0x1000,
        );
        func.append_inst(b0, Opcode::Branch { cond: Value::Inst(cmp) }, 0x1004);
        func.block_mut(b0).edges.push(Edge::to_block(b1, EdgeKind::True));
        func.block_mut(b0).edges.push(Edge::to_block(b2, EdgeKind::False));
        for b in [b1, b2] {
            func.append_inst(b, Opcode::Jump, 0x1008);
            func.block_mut(b).edges.push(Edge::to_block(b3, EdgeKind::Unconditional));
        }
        func.append_inst(
            b3,
            Opcode::Merge { dst: retval, inputs: smallvec![(b1, Value::Const(1)), (b2, Value::Const(2))] },
            0x1010,
        );
        func.append_inst(b3, Opcode::Return { value: Some(Value::Var(retval)) }, 0x1010);
        func.rebuild_preds();
        func.mark_unreachable();
        func
    }

    #[test]
    fn test_merge_lowers_to_copies_in_predecessors() {
        let func = merged_diamond();
        let text = Emitter::emit_function(&func, &EmitterConfig::default());
        let expected = "\
undefined4 pick(void)
{
    undefined4 ecx;
    undefined4 retval;

    if (ecx == 0) {
        retval = 1;
    } else {
        retval = 2;
    }
    return retval;
}
";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_first_use_declarations_and_addresses() {
        let func = merged_diamond();
        let config = EmitterConfig {
            declarations: DeclarationPlacement::FirstUse,
            indent: 2,
            show_addresses: true,
        };
        let text = Emitter::emit_function(&func, &config);
        let ecx = text.find("  undefined4 ecx;").expect("ecx declared");
        let first_block = text.find("  // bb0 @ 0x00001000..0x00001004").expect("address comment");
        let retval = text.find("  undefined4 retval;").expect("retval declared");
        let branch = text.find("  if (ecx == 0) {").expect("if statement");
        assert!(ecx < first_block && first_block < retval && retval < branch, "{}", text);
        assert!(text.contains("    // bb1 @ 0x00001008..0x00001008\n    retval = 1;\n"), "{}", text);
    }
}
