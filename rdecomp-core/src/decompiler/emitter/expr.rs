//! Expression trees for pseudocode, rendered with C operator precedence.

use crate::decompiler::ir::{BinaryOp, CmpOp};
use std::fmt::Write;

/// C precedence levels, higher binds tighter.
mod prec {
    pub const OR: u8 = 6;
    pub const XOR: u8 = 7;
    pub const AND: u8 = 8;
    pub const EQUALITY: u8 = 9;
    pub const RELATIONAL: u8 = 10;
    pub const SHIFT: u8 = 11;
    pub const ADDITIVE: u8 = 12;
    pub const MULTIPLICATIVE: u8 = 13;
    pub const UNARY: u8 = 15;
    pub const POSTFIX: u8 = 16;
    pub const PRIMARY: u8 = 17;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Const(i64),
    Name(String),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Compare {
        op: CmpOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Prefix operator: `-`, `~` or `!`
    Prefix {
        op: &'static str,
        operand: Box<Expr>,
    },
    Cast {
        ty: String,
        operand: Box<Expr>,
    },
    /// `*addr`, or `*(ty *)addr` when the pointer type must be spelled out
    Deref {
        ty: Option<String>,
        addr: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
}

impl Expr {
    pub fn name(name: impl Into<String>) -> Self {
        Expr::Name(name.into())
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn compare(op: CmpOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Compare {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn prefix(op: &'static str, operand: Expr) -> Self {
        Expr::Prefix {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn cast(ty: impl Into<String>, operand: Expr) -> Self {
        Expr::Cast {
            ty: ty.into(),
            operand: Box::new(operand),
        }
    }

    /// Logical negation; comparisons flip their operator instead of gaining a `!`.
    pub fn negate(self) -> Self {
        match self {
            Expr::Compare { op, lhs, rhs } => Expr::Compare {
                op: op.negate(),
                lhs,
                rhs,
            },
            Expr::Prefix { op: "!", operand } => *operand,
            other => Expr::prefix("!", other),
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Const(v) if *v < 0 => prec::UNARY,
            Expr::Const(_) | Expr::Name(_) => prec::PRIMARY,
            Expr::Binary { op, .. } => binary_precedence(*op),
            Expr::Compare { op, .. } => {
                if op.is_ordering() {
                    prec::RELATIONAL
                } else {
                    prec::EQUALITY
                }
            }
            Expr::Prefix { .. } | Expr::Cast { .. } | Expr::Deref { .. } => prec::UNARY,
            Expr::Call { .. } => prec::POSTFIX,
        }
    }

    /// Render as C source.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut String) {
        match self {
            Expr::Const(v) => write_const(*v, out),
            Expr::Name(name) => out.push_str(name),
            Expr::Binary { op, lhs, rhs } => {
                let p = binary_precedence(*op);
                if *op == BinaryOp::Shr {
                    // Logical shift: make the left operand unsigned
                    Expr::cast("uint32_t", (**lhs).clone()).write_operand(p, out);
                } else {
                    lhs.write_operand(p, out);
                }
                let _ = write!(out, " {} ", op.symbol());
                rhs.write_operand(p + 1, out);
            }
            Expr::Compare { op, lhs, rhs } => {
                let p = self.precedence();
                if op.is_unsigned() {
                    Expr::cast("uint32_t", (**lhs).clone()).write_operand(p, out);
                } else {
                    lhs.write_operand(p, out);
                }
                let _ = write!(out, " {} ", op.symbol());
                rhs.write_operand(p + 1, out);
            }
            Expr::Prefix { op, operand } => {
                out.push_str(op);
                // `- -x` and `--x` differ
                if matches!(**operand, Expr::Prefix { op: inner, .. } if inner == *op)
                    || matches!(**operand, Expr::Const(v) if v < 0 && *op == "-")
                {
                    out.push('(');
                    operand.write_to(out);
                    out.push(')');
                } else {
                    operand.write_operand(prec::UNARY, out);
                }
            }
            Expr::Cast { ty, operand } => {
                let _ = write!(out, "({})", ty);
                operand.write_operand(prec::UNARY, out);
            }
            Expr::Deref { ty, addr } => {
                out.push('*');
                if let Some(ty) = ty {
                    let _ = write!(out, "({} *)", ty);
                }
                addr.write_operand(prec::UNARY, out);
            }
            Expr::Call { callee, args } => {
                callee.write_operand(prec::POSTFIX, out);
                out.push('(');
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    arg.write_to(out);
                }
                out.push(')');
            }
        }
    }

    /// Render, parenthesized when binding looser than `min`.
    fn write_operand(&self, min: u8, out: &mut String) {
        if self.precedence() < min {
            out.push('(');
            self.write_to(out);
            out.push(')');
        } else {
            self.write_to(out);
        }
    }
}

fn binary_precedence(op: BinaryOp) -> u8 {
    match op {
        BinaryOp::Mul => prec::MULTIPLICATIVE,
        BinaryOp::Add | BinaryOp::Sub => prec::ADDITIVE,
        BinaryOp::Shl | BinaryOp::Shr | BinaryOp::Sar => prec::SHIFT,
        BinaryOp::And => prec::AND,
        BinaryOp::Xor => prec::XOR,
        BinaryOp::Or => prec::OR,
    }
}

/// Small magnitudes in decimal, the rest in hex.
fn write_const(v: i64, out: &mut String) {
    let _ = if (-0x1000..=0x1000).contains(&v) {
        write!(out, "{}", v)
    } else if v < 0 {
        write!(out, "-0x{:x}", v.unsigned_abs())
    } else {
        write!(out, "0x{:x}", v)
    };
}
