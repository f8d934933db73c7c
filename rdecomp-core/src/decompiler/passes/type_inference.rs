//! Type Inference
//!
//! Propagates primitive types over variables, instruction results and the return value
//! until nothing changes.
//!
//! # Algorithm
//! Every placed instruction contributes constraints each round; a constraint meets the
//! current type of a slot with new evidence, so slots only ever move down the lattice
//! (see [`Type::meet`]):
//! - **Dereference**: a `Load`/`Store` address is a pointer to the accessed value
//! - **Integer-only operators** (`* & | ^ << >>`, negation, casts, signed ordering
//!   compares): operands and result are integers of their width
//! - **Pointer arithmetic**: `ptr ± int` is a pointer of the same type
//! - **Copies** (`Assign`, `Merge`, `==`/`!=` compares, `Return`): both sides agree
//! - **Non-zero constants** assigned to a variable make it an integer (zero may be null)
//!
//! Pointer nesting is capped at [`MAX_POINTER_DEPTH`] so self-referential structures
//! terminate. Slots that end in `Conflict` are reported as `TypeConflict` warnings.

use crate::decompiler::config::{OptionKind, PassOptions};
use crate::decompiler::error::{DecompileError, Warning};
use crate::decompiler::ir::{BinaryOp, Function, InstId, Opcode, Type, UnaryOp, Value};
use crate::decompiler::passes::{
    OptionSpec, Pass, PassContext, PassDescriptor, PassOutcome, PassScope,
};

pub const DESCRIPTOR: PassDescriptor = PassDescriptor {
    id: "type-inference",
    scope: PassScope::Function,
    idempotent: true,
    description: "Infer integer and pointer types from how values are used",
    options: &[OptionSpec {
        name: "widen-small-ints",
        kind: OptionKind::Bool,
        description: "Treat 1- and 2-byte integers as 4-byte integers",
    }],
};

/// Deeper pointer types are truncated to a pointer to an unknown pointee.
pub const MAX_POINTER_DEPTH: u32 = 4;

/// Safety bound on propagation rounds; the lattice has finite height so this is only
/// reached by pathological inputs.
const MAX_ROUNDS: usize = 64;

pub struct TypeInference {
    widen_small_ints: bool,
}

impl TypeInference {
    pub fn from_options(options: &PassOptions) -> Self {
        Self {
            widen_small_ints: options.get_bool("widen-small-ints", false),
        }
    }
}

impl Pass for TypeInference {
    fn name(&self) -> &'static str {
        DESCRIPTOR.id
    }

    fn run_on_function(&self, func: &mut Function, ctx: &PassContext<'_>) -> Result<PassOutcome, DecompileError> {
        let mut solver = Solver::new(func, ctx.abi.word_size, self.widen_small_ints);
        let rounds = solver.solve(func);
        if rounds >= MAX_ROUNDS {
            log::debug!("{}: type propagation stopped after {} rounds", func.name, rounds);
        }
        let changed = solver.apply(func);
        Ok(PassOutcome::from_changed(changed))
    }
}

struct Solver {
    vars: Vec<Type>,
    insts: Vec<Type>,
    ret: Option<Type>,
    word: u8,
    widen: bool,
    changed: bool,
}

impl Solver {
    fn new(func: &Function, word: u8, widen: bool) -> Self {
        Self {
            vars: func.vars.iter().map(|v| v.ty.clone()).collect(),
            insts: func.insts.iter().map(|i| i.ty.clone()).collect(),
            ret: func.return_type.clone(),
            word,
            widen,
            changed: false,
        }
    }

    /// Run rounds until a fixed point. Returns the number of rounds.
    fn solve(&mut self, func: &Function) -> usize {
        let placed: Vec<InstId> = func.placed_insts().map(|(_, i)| i).collect();
        let mut rounds = 0usize;
        loop {
            self.changed = false;
            for &inst in placed.iter() {
                self.visit(func, inst);
            }
            rounds += 1;
            if !self.changed || rounds >= MAX_ROUNDS {
                return rounds;
            }
        }
    }

    fn visit(&mut self, func: &Function, inst: InstId) {
        let result = Value::Inst(inst);
        match &func.inst(inst).op {
            Opcode::Assign { dst, src } => {
                let dst = Value::Var(*dst);
                self.unify(dst, *src);
                if let Value::Const(c) = src {
                    if *c != 0 {
                        let width = self.width(func, dst);
                        self.constrain(dst, &Type::int(width));
                    }
                }
            }
            Opcode::Merge { dst, inputs } => {
                for (_, input) in inputs.iter() {
                    self.unify(Value::Var(*dst), *input);
                }
            }
            Opcode::Binary { op, lhs, rhs } => {
                if op.is_integer_only() {
                    for v in [*lhs, *rhs] {
                        let width = self.width(func, v);
                        self.constrain(v, &Type::int(width));
                    }
                    let width = self.width(func, *lhs);
                    self.constrain(result, &Type::int(width));
                } else {
                    self.pointer_arithmetic(func, *op, *lhs, *rhs, result);
                }
            }
            Opcode::Unary { op, operand } => {
                let width = self.width(func, *operand);
                self.constrain(*operand, &Type::int(width));
                let result_width = match op {
                    UnaryOp::Cast { bytes, .. } => *bytes,
                    UnaryOp::Neg | UnaryOp::Not => width,
                };
                self.constrain(result, &Type::int(result_width));
            }
            Opcode::Compare { op, lhs, rhs } => {
                if op.is_ordering() && !op.is_unsigned() {
                    for v in [*lhs, *rhs] {
                        let width = self.width(func, v);
                        self.constrain(v, &Type::int(width));
                    }
                } else if !op.is_ordering() && !is_const(*lhs) && !is_const(*rhs) {
                    self.unify(*lhs, *rhs);
                }
            }
            Opcode::Load { addr, size } => {
                let pointee = self.get(result);
                self.constrain(*addr, &Type::ptr_to(pointee));
                let through = pointee_of(&self.get(*addr));
                self.constrain(result, &through);
                if *size < self.word {
                    self.constrain(result, &Type::int(*size));
                }
            }
            Opcode::Store { addr, value, size } => {
                let stored = if is_const(*value) {
                    if *size < self.word {
                        Type::int(*size)
                    } else {
                        Type::Unknown
                    }
                } else {
                    self.get(*value)
                };
                self.constrain(*addr, &Type::ptr_to(stored));
                if !is_const(*value) {
                    let through = pointee_of(&self.get(*addr));
                    self.constrain(*value, &through);
                }
            }
            Opcode::Return { value: Some(v) } => {
                if let Some(ret) = self.ret.clone() {
                    let merged = self.evidence(&ret.meet(&self.get(*v)));
                    if merged != ret {
                        self.ret = Some(merged.clone());
                        self.changed = true;
                    }
                    self.constrain(*v, &merged);
                }
            }
            _ => {}
        }
    }

    /// `ptr + int`, `int + ptr` and `ptr - int` keep the pointer type; `int ± int` is an
    /// integer; `ptr - ptr` is an integer of the word size.
    fn pointer_arithmetic(&mut self, func: &Function, op: BinaryOp, lhs: Value, rhs: Value, result: Value) {
        let (l, r) = (self.get(lhs), self.get(rhs));
        let int_like = |t: &Type, v: Value| matches!(t, Type::Int { .. }) || is_const(v);
        let derived = match (&l, &r) {
            (Type::Ptr(_), _) if int_like(&r, rhs) => Some(l.clone()),
            (_, Type::Ptr(_)) if op == BinaryOp::Add && int_like(&l, lhs) => Some(r.clone()),
            (Type::Ptr(_), Type::Ptr(_)) if op == BinaryOp::Sub => Some(Type::int(self.word)),
            (Type::Int { .. }, Type::Int { .. }) => Some(Type::int(self.width(func, lhs))),
            _ => None,
        };
        if let Some(t) = derived {
            self.constrain(result, &t);
        }
    }

    /// Current type of an operand. Constants carry no type.
    fn get(&self, value: Value) -> Type {
        match value {
            Value::Var(v) => self.vars[v.index()].clone(),
            Value::Inst(i) => self.insts[i.index()].clone(),
            Value::Const(_) => Type::Unknown,
        }
    }

    /// Width in bytes of an operand.
    fn width(&self, func: &Function, value: Value) -> u8 {
        match value {
            Value::Var(v) => func.var(v).size,
            Value::Inst(i) => match &func.inst(i).op {
                Opcode::Load { size, .. } => *size,
                Opcode::Unary { op: UnaryOp::Cast { bytes, .. }, .. } => *bytes,
                _ => self.word,
            },
            Value::Const(_) => self.word,
        }
    }

    /// Meet the type of `value` with `evidence`.
    #[inline] // Hot path
    fn constrain(&mut self, value: Value, evidence: &Type) {
        if evidence.is_unknown() {
            return;
        }
        let slot = match value {
            Value::Var(v) => &mut self.vars[v.index()],
            Value::Inst(i) => &mut self.insts[i.index()],
            Value::Const(_) => return,
        };
        let evidence = clamp_depth(evidence, MAX_POINTER_DEPTH);
        let evidence = if self.widen { evidence.widened() } else { evidence };
        let merged = slot.meet(&evidence);
        if merged != *slot {
            *slot = merged;
            self.changed = true;
        }
    }

    fn unify(&mut self, a: Value, b: Value) {
        let tb = self.get(b);
        self.constrain(a, &tb);
        let ta = self.get(a);
        self.constrain(b, &ta);
    }

    fn evidence(&self, ty: &Type) -> Type {
        let ty = clamp_depth(ty, MAX_POINTER_DEPTH);
        if self.widen {
            ty.widened()
        } else {
            ty
        }
    }

    /// Write the solution back. Returns whether anything changed.
    fn apply(self, func: &mut Function) -> bool {
        let mut changed = false;
        let mut warnings: Vec<Warning> = Vec::new();
        for (var, ty) in func.vars.iter_mut().zip(self.vars.into_iter()) {
            if var.ty != ty {
                if ty.is_conflict() {
                    warnings.push(Warning::type_conflict(
                        &func.name,
                        format!(
                            "variable `{}` is used with incompatible types; rendered as {}",
                            var.name,
                            ty.c_name(var.size)
                        ),
                    ));
                }
                var.ty = ty;
                changed = true;
            }
        }
        for (inst, ty) in func.insts.iter_mut().zip(self.insts.into_iter()) {
            if inst.ty != ty && inst.op.produces_value() {
                inst.ty = ty;
                changed = true;
            }
        }
        if func.return_type != self.ret {
            if matches!(self.ret, Some(Type::Conflict)) {
                warnings.push(Warning::type_conflict(
                    &func.name,
                    "return value is used with incompatible types",
                ));
            }
            func.return_type = self.ret;
            changed = true;
        }
        for warning in warnings {
            log::warn!("{}", warning);
            func.warnings.push(warning);
        }
        changed
    }
}

#[inline]
fn is_const(value: Value) -> bool {
    matches!(value, Value::Const(_))
}

fn pointee_of(ty: &Type) -> Type {
    match ty {
        Type::Ptr(inner) => inner.as_ref().clone(),
        _ => Type::Unknown,
    }
}

/// Truncate pointer nesting below `depth` levels to `Ptr(Unknown)`.
fn clamp_depth(ty: &Type, depth: u32) -> Type {
    match ty {
        Type::Ptr(inner) if depth <= 1 => match inner.as_ref() {
            Type::Ptr(_) => Type::ptr_to(Type::Unknown),
            _ => ty.clone(),
        },
        Type::Ptr(inner) => Type::ptr_to(clamp_depth(inner, depth - 1)),
        other => other.clone(),
    }
}
