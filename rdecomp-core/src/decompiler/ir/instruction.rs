//! Intermediate Representation (IR) Instructions
//!
//! Instructions are stored in a per-function arena and addressed by [`InstId`]. Operands
//! are [`Value`]s: constants, variable references, or the result of another instruction.
//!
//! # Memory Optimizations
//! - `Value` is `Copy` (16 bytes) so operand rewriting never allocates
//! - Operator enums use `#[repr(u8)]`
//! - Merge inputs use `SmallVec<[_; 2]>` (most merges join two predecessors)
//!
//! # IR Design
//! - **Closed**: every opcode is a variant of [`Opcode`] and matched exhaustively
//! - **SSA-like**: every instruction-result value has exactly one defining instruction;
//!   variables are the only mutable storage
//! - **Explicit terminators**: the last instruction of every block is `Jump`, `Branch`,
//!   `Switch` or `Return`, and only the last

use crate::decompiler::ir::types::Type;
use crate::decompiler::ir::{BlockId, InstId, VarId};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// An instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    /// Integer constant
    Const(i64),
    /// Current contents of a variable
    Var(VarId),
    /// Result of another instruction
    Inst(InstId),
}

/// Two-operand arithmetic and bitwise operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BinaryOp {
    Add = 0,
    Sub = 1,
    Mul = 2,
    And = 3,
    Or = 4,
    Xor = 5,
    Shl = 6,
    /// Logical shift right
    Shr = 7,
    /// Arithmetic shift right
    Sar = 8,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
            BinaryOp::Xor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr | BinaryOp::Sar => ">>",
        }
    }

    /// Operators whose operands are integers regardless of context.
    pub fn is_integer_only(self) -> bool {
        !matches!(self, BinaryOp::Add | BinaryOp::Sub)
    }
}

/// One-operand operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
    /// Zero- or sign-extending cast to `bytes`
    Cast { bytes: u8, signed: bool },
}

/// Comparison operators. The `U*` forms compare unsigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CmpOp {
    Eq = 0,
    Ne = 1,
    Lt = 2,
    Le = 3,
    Gt = 4,
    Ge = 5,
    Ult = 6,
    Ule = 7,
    Ugt = 8,
    Uge = 9,
}

impl CmpOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt | CmpOp::Ult => "<",
            CmpOp::Le | CmpOp::Ule => "<=",
            CmpOp::Gt | CmpOp::Ugt => ">",
            CmpOp::Ge | CmpOp::Uge => ">=",
        }
    }

    /// The comparison that holds exactly when `self` does not.
    pub fn negate(self) -> CmpOp {
        match self {
            CmpOp::Eq => CmpOp::Ne,
            CmpOp::Ne => CmpOp::Eq,
            CmpOp::Lt => CmpOp::Ge,
            CmpOp::Le => CmpOp::Gt,
            CmpOp::Gt => CmpOp::Le,
            CmpOp::Ge => CmpOp::Lt,
            CmpOp::Ult => CmpOp::Uge,
            CmpOp::Ule => CmpOp::Ugt,
            CmpOp::Ugt => CmpOp::Ule,
            CmpOp::Uge => CmpOp::Ult,
        }
    }

    pub fn is_unsigned(self) -> bool {
        matches!(self, CmpOp::Ult | CmpOp::Ule | CmpOp::Ugt | CmpOp::Uge)
    }

    pub fn is_ordering(self) -> bool {
        !matches!(self, CmpOp::Eq | CmpOp::Ne)
    }
}

/// What a call instruction calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallTarget {
    /// Direct call to an address that is not (yet) known to be a function of the module
    Direct(u64),
    /// Direct call to a function of the module
    Function { name: String, entry: u64 },
    /// Call through a computed value
    Indirect(Value),
}

/// IR operation.
///
/// # Instruction Categories
/// - **Data**: `Assign`, `Merge`
/// - **Arithmetic**: `Binary`, `Unary`, `Compare`
/// - **Memory**: `Load`, `Store`
/// - **Calls**: `Call`, `Intrinsic`
/// - **Terminators**: `Jump`, `Branch`, `Switch`, `Return`
///
/// `Nop` marks an instruction that was removed from its block; its arena slot is kept so
/// that ids stay stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    Nop,
    /// `dst = src`
    Assign { dst: VarId, src: Value },
    /// Phi-like merge: `dst` takes the value of the input whose block control came from
    Merge {
        dst: VarId,
        inputs: SmallVec<[(BlockId, Value); 2]>,
    },
    Binary { op: BinaryOp, lhs: Value, rhs: Value },
    Unary { op: UnaryOp, operand: Value },
    Compare { op: CmpOp, lhs: Value, rhs: Value },
    /// Read `size` bytes at `addr`
    Load { addr: Value, size: u8 },
    /// Write `size` bytes of `value` at `addr`
    Store { addr: Value, value: Value, size: u8 },
    Call { target: CallTarget, args: Vec<Value> },
    /// Operation the lifter has no semantics for, kept by mnemonic
    Intrinsic { name: String, args: Vec<Value> },
    /// Unconditional transfer; the single target is the block's only edge
    Jump,
    /// Two-way transfer on `cond`; edges are `True` and `False`
    Branch { cond: Value },
    /// Multi-way transfer on `selector`; edges are `SwitchCase(n)`
    Switch { selector: Value },
    Return { value: Option<Value> },
}

impl Opcode {
    #[inline]
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Opcode::Jump | Opcode::Branch { .. } | Opcode::Switch { .. } | Opcode::Return { .. }
        )
    }

    /// Side-effect free and safe to evaluate at any later point of the same block.
    #[inline]
    pub fn is_pure(&self) -> bool {
        matches!(
            self,
            Opcode::Binary { .. } | Opcode::Unary { .. } | Opcode::Compare { .. }
        )
    }

    /// May be deleted when its result is unused.
    #[inline]
    pub fn is_removable_when_unused(&self) -> bool {
        self.is_pure() || matches!(self, Opcode::Load { .. })
    }

    /// Produces a value that other instructions can reference through `Value::Inst`.
    #[inline]
    pub fn produces_value(&self) -> bool {
        matches!(
            self,
            Opcode::Binary { .. }
                | Opcode::Unary { .. }
                | Opcode::Compare { .. }
                | Opcode::Load { .. }
                | Opcode::Call { .. }
                | Opcode::Intrinsic { .. }
        )
    }

    /// Variable written by this instruction.
    #[inline]
    pub fn defined_var(&self) -> Option<VarId> {
        match self {
            Opcode::Assign { dst, .. } | Opcode::Merge { dst, .. } => Some(*dst),
            _ => None,
        }
    }

    /// Visit every operand value.
    pub fn for_each_operand(&self, mut f: impl FnMut(&Value)) {
        match self {
            Opcode::Nop | Opcode::Jump => {}
            Opcode::Assign { src, .. } => f(src),
            Opcode::Merge { inputs, .. } => inputs.iter().for_each(|(_, v)| f(v)),
            Opcode::Binary { lhs, rhs, .. } | Opcode::Compare { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            Opcode::Unary { operand, .. } => f(operand),
            Opcode::Load { addr, .. } => f(addr),
            Opcode::Store { addr, value, .. } => {
                f(addr);
                f(value);
            }
            Opcode::Call { target, args } => {
                if let CallTarget::Indirect(v) = target {
                    f(v);
                }
                args.iter().for_each(f);
            }
            Opcode::Intrinsic { args, .. } => args.iter().for_each(f),
            Opcode::Branch { cond } => f(cond),
            Opcode::Switch { selector } => f(selector),
            Opcode::Return { value } => {
                if let Some(v) = value {
                    f(v);
                }
            }
        }
    }

    /// Visit every operand value mutably.
    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut Value)) {
        match self {
            Opcode::Nop | Opcode::Jump => {}
            Opcode::Assign { src, .. } => f(src),
            Opcode::Merge { inputs, .. } => inputs.iter_mut().for_each(|(_, v)| f(v)),
            Opcode::Binary { lhs, rhs, .. } | Opcode::Compare { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            Opcode::Unary { operand, .. } => f(operand),
            Opcode::Load { addr, .. } => f(addr),
            Opcode::Store { addr, value, .. } => {
                f(addr);
                f(value);
            }
            Opcode::Call { target, args } => {
                if let CallTarget::Indirect(v) = target {
                    f(v);
                }
                args.iter_mut().for_each(f);
            }
            Opcode::Intrinsic { args, .. } => args.iter_mut().for_each(f),
            Opcode::Branch { cond } => f(cond),
            Opcode::Switch { selector } => f(selector),
            Opcode::Return { value } => {
                if let Some(v) = value {
                    f(v);
                }
            }
        }
    }

    /// Rename every occurrence of variable `from` (read or written) to `to`.
    pub fn rename_var(&mut self, from: VarId, to: VarId) {
        match self {
            Opcode::Assign { dst, .. } | Opcode::Merge { dst, .. } if *dst == from => *dst = to,
            _ => {}
        }
        self.for_each_operand_mut(|v| {
            if *v == Value::Var(from) {
                *v = Value::Var(to);
            }
        });
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            Opcode::Nop => "nop",
            Opcode::Assign { .. } => "assign",
            Opcode::Merge { .. } => "merge",
            Opcode::Binary { .. } => "binary",
            Opcode::Unary { .. } => "unary",
            Opcode::Compare { .. } => "compare",
            Opcode::Load { .. } => "load",
            Opcode::Store { .. } => "store",
            Opcode::Call { .. } => "call",
            Opcode::Intrinsic { .. } => "intrinsic",
            Opcode::Jump => "jump",
            Opcode::Branch { .. } => "branch",
            Opcode::Switch { .. } => "switch",
            Opcode::Return { .. } => "return",
        }
    }
}

/// An instruction in a function's arena.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: Opcode,
    /// Address of the machine instruction this came from
    pub address: u64,
    /// Type of the result (meaningful only when `op.produces_value()`)
    pub ty: Type,
}

impl Instruction {
    pub fn new(op: Opcode, address: u64) -> Self {
        Self {
            op,
            address,
            ty: Type::Unknown,
        }
    }

    #[inline]
    pub fn is_nop(&self) -> bool {
        matches!(self.op, Opcode::Nop)
    }
}
