//! IR Builder - Lifts Decoded Records to IR
//!
//! This module gives decoded x86-32 style records their operand semantics and appends
//! the resulting IR instructions to a block. Block boundaries and edges are the CFG
//! builder's job; the lifter only reports how each record transfers control.
//!
//! # Conversion Strategy
//! - **Data movement**: `mov`, `movzx`, `movsx`, `lea` become `Assign`/`Store`
//! - **Arithmetic**: two-operand forms read the destination, compute, and write it back;
//!   `xor r, r` and `sub r, r` are recognized as zeroing idioms
//! - **Flags**: `cmp`/`test` and arithmetic remember their operands; the next
//!   conditional jump turns them into a `Compare`
//! - **Stack**: `push`, `pop` and `leave` are expanded into explicit stack-pointer
//!   arithmetic and memory accesses so stack recovery can track them
//! - **Unsupported mnemonics**: kept as `Intrinsic` calls

use crate::decompiler::config::Abi;
use crate::decompiler::decoder::{DecodedRecord, Operand};
use crate::decompiler::ir::function::{Function, StorageClass};
use crate::decompiler::ir::instruction::{BinaryOp, CallTarget, CmpOp, Opcode, UnaryOp, Value};
use crate::decompiler::ir::{BlockId, InstId, VarId};
use std::collections::HashMap;

/// How a record transfers control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Transfer {
    /// Execution continues with the next record
    Fallthrough = 0,
    /// Unconditional or multi-way jump (`successors` are the targets)
    Jump = 1,
    /// Two-way branch (`successors` are `[taken, not-taken]`)
    Conditional = 2,
    Return = 3,
}

impl Transfer {
    /// Classify a record. `next` is the address of the following record, if any.
    ///
    /// Calls never end a block. A record with an unknown mnemonic but explicit
    /// successors other than the next record is treated as a jump.
    pub fn of(record: &DecodedRecord, next: Option<u64>) -> Transfer {
        let mnemonic = record.opcode.to_ascii_lowercase();
        if record.is_return || mnemonic == "ret" || mnemonic == "retn" {
            Transfer::Return
        } else if record.is_call {
            Transfer::Fallthrough
        } else if condition_code(&mnemonic).is_some() {
            Transfer::Conditional
        } else if mnemonic == "jmp" {
            Transfer::Jump
        } else if !record.successors.is_empty()
            && !(record.successors.len() == 1 && Some(record.successors[0]) == next)
        {
            Transfer::Jump
        } else {
            Transfer::Fallthrough
        }
    }

    #[inline]
    pub fn ends_block(self) -> bool {
        !matches!(self, Transfer::Fallthrough)
    }
}

/// Map a conditional-jump mnemonic to the comparison it tests.
#[inline]
pub fn condition_code(mnemonic: &str) -> Option<CmpOp> {
    let op = match mnemonic {
        "je" | "jz" => CmpOp::Eq,
        "jne" | "jnz" => CmpOp::Ne,
        "jl" | "jnge" | "js" => CmpOp::Lt,
        "jle" | "jng" => CmpOp::Le,
        "jg" | "jnle" => CmpOp::Gt,
        "jge" | "jnl" | "jns" => CmpOp::Ge,
        "jb" | "jnae" | "jc" => CmpOp::Ult,
        "jbe" | "jna" => CmpOp::Ule,
        "ja" | "jnbe" => CmpOp::Ugt,
        "jae" | "jnb" | "jnc" => CmpOp::Uge,
        _ => return None,
    };
    Some(op)
}

/// Operands of the last flag-setting instruction.
#[derive(Debug, Clone, Copy)]
struct Flags {
    lhs: Value,
    rhs: Value,
}

/// Lifts records of one function into its arena.
///
/// Register variables are created on first use and shared by every block of the function.
pub struct IRBuilder<'a> {
    func: &'a mut Function,
    abi: &'a Abi,
    registers: HashMap<String, VarId>,
    flags: Option<Flags>,
}

impl<'a> IRBuilder<'a> {
    pub fn new(func: &'a mut Function, abi: &'a Abi) -> Self {
        Self {
            func,
            abi,
            registers: HashMap::new(),
            flags: None,
        }
    }

    /// Flags never flow across block boundaries.
    pub fn begin_block(&mut self) {
        self.flags = None;
    }

    /// Append the IR for `record` to `block` and report how it transfers control.
    ///
    /// For `Jump` and `Conditional` records the terminator (`Jump`, `Switch` or
    /// `Branch`) is emitted here; the caller attaches the matching edges.
    pub fn lift(&mut self, block: BlockId, record: &DecodedRecord, next: Option<u64>) -> Transfer {
        let transfer = Transfer::of(record, next);
        let mnemonic = record.opcode.to_ascii_lowercase();
        let at = record.address;
        let ops = &record.operands;

        match transfer {
            Transfer::Return => {
                let ret = self.register(&self.abi.return_register.clone(), self.abi.word_size);
                self.emit(block, Opcode::Return { value: Some(Value::Var(ret)) }, at);
                return transfer;
            }
            Transfer::Conditional => {
                let op = condition_code(&mnemonic).unwrap_or(CmpOp::Ne);
                let (lhs, rhs) = match self.flags {
                    Some(flags) => (flags.lhs, flags.rhs),
                    None => {
                        let flags = self.register("eflags", 4);
                        (Value::Var(flags), Value::Const(0))
                    }
                };
                let cond = self.emit(block, Opcode::Compare { op, lhs, rhs }, at);
                self.emit(block, Opcode::Branch { cond: Value::Inst(cond) }, at);
                return transfer;
            }
            Transfer::Jump => {
                if mnemonic != "jmp" {
                    let args: Vec<Value> = ops.iter().map(|o| self.read(block, o, at)).collect();
                    self.emit(block, Opcode::Intrinsic { name: mnemonic.clone(), args }, at);
                }
                if record.successors.len() >= 2 {
                    let selector = self.selector(block, ops.first(), at);
                    self.emit(block, Opcode::Switch { selector }, at);
                } else {
                    self.emit(block, Opcode::Jump, at);
                }
                return transfer;
            }
            Transfer::Fallthrough => {}
        }

        if record.is_call {
            self.lift_call(block, record);
            return transfer;
        }

        match (mnemonic.as_str(), ops.as_slice()) {
            ("nop", _) => {}
            ("mov", [dst, src]) => {
                let value = self.read(block, src, at);
                self.write(block, dst, value, at);
            }
            ("movzx" | "movsx", [dst, src]) => {
                let value = self.read(block, src, at);
                let bytes = dst.size().unwrap_or(self.abi.word_size);
                let cast = self.emit(
                    block,
                    Opcode::Unary {
                        op: UnaryOp::Cast { bytes, signed: mnemonic == "movsx" },
                        operand: value,
                    },
                    at,
                );
                self.write(block, dst, Value::Inst(cast), at);
            }
            ("lea", [dst, Operand::Mem { base, index, scale, disp, .. }]) => {
                let addr = self.address(block, base.as_deref(), index.as_deref(), *scale, *disp, at);
                self.write(block, dst, addr, at);
            }
            ("xor" | "sub", [dst @ Operand::Reg { .. }, src]) if dst == src => {
                self.write(block, dst, Value::Const(0), at);
                self.set_flags_from(dst, Value::Const(0));
            }
            ("add" | "sub" | "imul" | "and" | "or" | "xor" | "shl" | "sal" | "shr" | "sar", [dst, src]) => {
                let op = binary_op(&mnemonic);
                let lhs = self.read(block, dst, at);
                let rhs = self.read(block, src, at);
                let result = self.emit(block, Opcode::Binary { op, lhs, rhs }, at);
                self.write(block, dst, Value::Inst(result), at);
                self.set_flags_from(dst, Value::Inst(result));
            }
            ("imul", [dst, lhs, rhs]) => {
                let lhs = self.read(block, lhs, at);
                let rhs = self.read(block, rhs, at);
                let result = self.emit(block, Opcode::Binary { op: BinaryOp::Mul, lhs, rhs }, at);
                self.write(block, dst, Value::Inst(result), at);
                self.set_flags_from(dst, Value::Inst(result));
            }
            ("inc" | "dec", [dst]) => {
                let op = if mnemonic == "inc" { BinaryOp::Add } else { BinaryOp::Sub };
                let lhs = self.read(block, dst, at);
                let result = self.emit(block, Opcode::Binary { op, lhs, rhs: Value::Const(1) }, at);
                self.write(block, dst, Value::Inst(result), at);
                self.set_flags_from(dst, Value::Inst(result));
            }
            ("neg" | "not", [dst]) => {
                let op = if mnemonic == "neg" { UnaryOp::Neg } else { UnaryOp::Not };
                let operand = self.read(block, dst, at);
                let result = self.emit(block, Opcode::Unary { op, operand }, at);
                self.write(block, dst, Value::Inst(result), at);
                self.set_flags_from(dst, Value::Inst(result));
            }
            ("cmp", [lhs, rhs]) => {
                let lhs = self.read(block, lhs, at);
                let rhs = self.read(block, rhs, at);
                self.flags = Some(Flags { lhs, rhs });
            }
            ("test", [lhs, rhs]) => {
                let value = if lhs == rhs {
                    self.read(block, lhs, at)
                } else {
                    let a = self.read(block, lhs, at);
                    let b = self.read(block, rhs, at);
                    Value::Inst(self.emit(block, Opcode::Binary { op: BinaryOp::And, lhs: a, rhs: b }, at))
                };
                self.flags = Some(Flags { lhs: value, rhs: Value::Const(0) });
            }
            ("push", [src]) => {
                let value = self.read(block, src, at);
                let sp = self.adjust_stack(block, BinaryOp::Sub, at);
                let size = src.size().unwrap_or(self.abi.word_size);
                self.emit(block, Opcode::Store { addr: Value::Var(sp), value, size }, at);
            }
            ("pop", [dst]) => {
                let sp = self.stack_pointer();
                let size = dst.size().unwrap_or(self.abi.word_size);
                let load = self.emit(block, Opcode::Load { addr: Value::Var(sp), size }, at);
                self.write(block, dst, Value::Inst(load), at);
                self.adjust_stack(block, BinaryOp::Add, at);
            }
            ("leave", []) => {
                let sp = self.stack_pointer();
                let fp = self.frame_pointer();
                self.emit(block, Opcode::Assign { dst: sp, src: Value::Var(fp) }, at);
                let load = self.emit(block, Opcode::Load { addr: Value::Var(sp), size: self.abi.word_size }, at);
                self.emit(block, Opcode::Assign { dst: fp, src: Value::Inst(load) }, at);
                self.adjust_stack(block, BinaryOp::Add, at);
            }
            _ => self.lift_intrinsic(block, &mnemonic, ops, at),
        }
        transfer
    }

    fn lift_call(&mut self, block: BlockId, record: &DecodedRecord) {
        let at = record.address;
        let target = match record.operands.first() {
            Some(Operand::Addr { target }) => CallTarget::Direct(*target),
            Some(Operand::Imm { value }) => CallTarget::Direct(*value as u64),
            Some(op @ (Operand::Reg { .. } | Operand::Mem { .. })) => {
                CallTarget::Indirect(self.read(block, op, at))
            }
            None => match record.successors.first() {
                Some(&target) => CallTarget::Direct(target),
                None => {
                    log::warn!("Call at 0x{:08X} has no target operand or successor", at);
                    CallTarget::Direct(0)
                }
            },
        };
        let call = self.emit(block, Opcode::Call { target, args: Vec::new() }, at);
        let ret = self.register(&self.abi.return_register.clone(), self.abi.word_size);
        self.emit(block, Opcode::Assign { dst: ret, src: Value::Inst(call) }, at);
        self.flags = None;
    }

    /// Unknown mnemonics read every operand and, when the first operand is a location,
    /// write the intrinsic's result back to it.
    fn lift_intrinsic(&mut self, block: BlockId, mnemonic: &str, ops: &[Operand], at: u64) {
        let args: Vec<Value> = ops.iter().map(|o| self.read(block, o, at)).collect();
        let call = self.emit(block, Opcode::Intrinsic { name: mnemonic.to_string(), args }, at);
        if let Some(dst @ (Operand::Reg { .. } | Operand::Mem { .. })) = ops.first() {
            self.write(block, dst, Value::Inst(call), at);
        }
        self.flags = None;
    }

    #[inline]
    fn emit(&mut self, block: BlockId, op: Opcode, at: u64) -> InstId {
        self.func.append_inst(block, op, at)
    }

    /// Variable for a register, created on first use.
    pub fn register(&mut self, name: &str, size: u8) -> VarId {
        if let Some(&var) = self.registers.get(name) {
            return var;
        }
        let var = self
            .func
            .add_var(name, StorageClass::Register(name.to_string()), size);
        self.registers.insert(name.to_string(), var);
        var
    }

    fn stack_pointer(&mut self) -> VarId {
        let name = self.abi.stack_pointer.clone();
        self.register(&name, self.abi.word_size)
    }

    fn frame_pointer(&mut self) -> VarId {
        let name = self.abi.frame_pointer.clone();
        self.register(&name, self.abi.word_size)
    }

    /// `sp = sp op word_size`
    fn adjust_stack(&mut self, block: BlockId, op: BinaryOp, at: u64) -> VarId {
        let sp = self.stack_pointer();
        let word = Value::Const(i64::from(self.abi.word_size));
        let new_sp = self.emit(block, Opcode::Binary { op, lhs: Value::Var(sp), rhs: word }, at);
        self.emit(block, Opcode::Assign { dst: sp, src: Value::Inst(new_sp) }, at);
        sp
    }

    fn set_flags_from(&mut self, dst: &Operand, result: Value) {
        let lhs = match dst {
            Operand::Reg { name, .. } => match self.registers.get(name.as_str()) {
                Some(&var) => Value::Var(var),
                None => result,
            },
            _ => result,
        };
        self.flags = Some(Flags { lhs, rhs: Value::Const(0) });
    }

    fn read(&mut self, block: BlockId, operand: &Operand, at: u64) -> Value {
        match operand {
            Operand::Reg { name, size } => Value::Var(self.register(name, *size)),
            Operand::Imm { value } => Value::Const(*value),
            Operand::Addr { target } => Value::Const(*target as i64),
            Operand::Mem { base, index, scale, disp, size } => {
                let addr = self.address(block, base.as_deref(), index.as_deref(), *scale, *disp, at);
                Value::Inst(self.emit(block, Opcode::Load { addr, size: *size }, at))
            }
        }
    }

    fn write(&mut self, block: BlockId, operand: &Operand, value: Value, at: u64) {
        match operand {
            Operand::Reg { name, size } => {
                let dst = self.register(name, *size);
                self.emit(block, Opcode::Assign { dst, src: value }, at);
            }
            Operand::Mem { base, index, scale, disp, size } => {
                let addr = self.address(block, base.as_deref(), index.as_deref(), *scale, *disp, at);
                self.emit(block, Opcode::Store { addr, value, size: *size }, at);
            }
            Operand::Imm { .. } | Operand::Addr { .. } => {
                log::debug!("Ignoring write to non-location operand at 0x{:08X}", at);
            }
        }
    }

    /// Build `base + index * scale + disp`, omitting absent parts.
    fn address(
        &mut self,
        block: BlockId,
        base: Option<&str>,
        index: Option<&str>,
        scale: u8,
        disp: i64,
        at: u64,
    ) -> Value {
        let word = self.abi.word_size;
        let mut acc: Option<Value> = base.map(|b| Value::Var(self.register(b, word)));
        if let Some(index) = index {
            let mut scaled = Value::Var(self.register(index, word));
            if scale > 1 {
                scaled = Value::Inst(self.emit(
                    block,
                    Opcode::Binary { op: BinaryOp::Mul, lhs: scaled, rhs: Value::Const(i64::from(scale)) },
                    at,
                ));
            }
            acc = Some(match acc {
                Some(lhs) => Value::Inst(self.emit(block, Opcode::Binary { op: BinaryOp::Add, lhs, rhs: scaled }, at)),
                None => scaled,
            });
        }
        match acc {
            None => Value::Const(disp),
            Some(lhs) if disp > 0 => {
                Value::Inst(self.emit(block, Opcode::Binary { op: BinaryOp::Add, lhs, rhs: Value::Const(disp) }, at))
            }
            Some(lhs) if disp < 0 => {
                Value::Inst(self.emit(block, Opcode::Binary { op: BinaryOp::Sub, lhs, rhs: Value::Const(-disp) }, at))
            }
            Some(lhs) => lhs,
        }
    }

    /// Jump-table selector: the index register of a memory operand, or the jump operand.
    fn selector(&mut self, block: BlockId, operand: Option<&Operand>, at: u64) -> Value {
        match operand {
            Some(Operand::Mem { index: Some(index), .. }) => {
                Value::Var(self.register(index, self.abi.word_size))
            }
            Some(op @ Operand::Reg { .. }) => self.read(block, op, at),
            Some(op @ Operand::Mem { .. }) => self.read(block, op, at),
            _ => Value::Var(self.register("eflags", 4)),
        }
    }
}

fn binary_op(mnemonic: &str) -> BinaryOp {
    match mnemonic {
        "add" => BinaryOp::Add,
        "sub" => BinaryOp::Sub,
        "imul" => BinaryOp::Mul,
        "and" => BinaryOp::And,
        "or" => BinaryOp::Or,
        "xor" => BinaryOp::Xor,
        "shl" | "sal" => BinaryOp::Shl,
        "shr" => BinaryOp::Shr,
        _ => BinaryOp::Sar,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompiler::ir::FuncId;

    fn lift_one(record: DecodedRecord) -> (Function, Transfer) {
        let abi = Abi::default();
        let mut func = Function::new(FuncId(0), "f", record.function_entry);
        let block = func.add_block(record.address, record.address);
        let transfer = {
            let mut builder = IRBuilder::new(&mut func, &abi);
            builder.lift(block, &record, None)
        };
        (func, transfer)
    }

    #[test]
    fn test_xor_self_is_zeroing_idiom() {
        let (func, transfer) = lift_one(DecodedRecord::new(
            0x1000,
            0x1000,
            "xor",
            vec![Operand::reg("eax"), Operand::reg("eax")],
        ));
        assert_eq!(transfer, Transfer::Fallthrough);
        let insts = &func.blocks[0].insts;
        assert_eq!(insts.len(), 1);
        assert!(matches!(
            func.inst(insts[0]).op,
            Opcode::Assign { src: Value::Const(0), .. }
        ));
    }

    #[test]
    fn test_push_expands_to_stack_arithmetic_and_store() {
        let (func, _) = lift_one(DecodedRecord::new(0x1000, 0x1000, "push", vec![Operand::reg("ebp")]));
        let ops: Vec<&str> = func.blocks[0]
            .insts
            .iter()
            .map(|&i| func.inst(i).op.mnemonic())
            .collect();
        assert_eq!(ops, vec!["binary", "assign", "store"]);
    }

    #[test]
    fn test_jcc_without_flags_reads_flag_register() {
        let record = DecodedRecord::new(0x1000, 0x1000, "jne", vec![Operand::addr(0x1010)])
            .with_successors(&[0x1010, 0x1002]);
        let (func, transfer) = lift_one(record);
        assert_eq!(transfer, Transfer::Conditional);
        assert!(func.vars.iter().any(|v| v.name == "eflags"));
        let last = *func.blocks[0].insts.last().expect("terminator");
        assert!(matches!(func.inst(last).op, Opcode::Branch { .. }));
    }

    #[test]
    fn test_transfer_classification() {
        let call = DecodedRecord::new(0, 0, "call", vec![Operand::addr(0x50)])
            .with_successors(&[0x50])
            .call();
        assert_eq!(Transfer::of(&call, Some(5)), Transfer::Fallthrough);
        let ret = DecodedRecord::new(0, 0, "ret", vec![]);
        assert_eq!(Transfer::of(&ret, None), Transfer::Return);
        let plain = DecodedRecord::new(0, 0, "mov", vec![]).with_successors(&[4]);
        assert_eq!(Transfer::of(&plain, Some(4)), Transfer::Fallthrough);
        let odd = DecodedRecord::new(0, 0, "loop", vec![]).with_successors(&[0x40]);
        assert_eq!(Transfer::of(&odd, Some(4)), Transfer::Jump);
    }
}
