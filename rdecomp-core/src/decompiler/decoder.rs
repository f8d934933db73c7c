//! Decoded Instruction Records
//!
//! The decompiler does not disassemble bytes itself. An external decoder hands it an
//! ordered stream of records, one per machine instruction, grouped by the entry address
//! of the function they belong to. This module defines that boundary format.
//!
//! # Record Format (JSON)
//! ```json
//! {"function_entry": 4198400, "address": 4198403, "opcode": "mov",
//!  "operands": [{"kind": "reg", "name": "eax"},
//!               {"kind": "mem", "base": "ebp", "disp": 8, "size": 4}],
//!  "successors": [], "is_call": false, "is_return": false}
//! ```
//!
//! # Successor Conventions
//! - Conditional jumps list `[taken, not-taken]`; `not-taken` may be omitted.
//! - `jmp` lists one target, several jump-table targets, or none when unresolved.
//! - Calls list the callee; the fall-through to the next record is implicit.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One decoded machine instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedRecord {
    /// Entry address of the function this instruction belongs to
    pub function_entry: u64,
    /// Address of the instruction
    pub address: u64,
    /// Mnemonic as produced by the decoder (`mov`, `jne`, ...)
    pub opcode: String,
    #[serde(default)]
    pub operands: Vec<Operand>,
    #[serde(default)]
    pub successors: Vec<u64>,
    #[serde(default)]
    pub is_call: bool,
    #[serde(default)]
    pub is_return: bool,
}

/// Instruction operand with decoder-provided semantics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Operand {
    /// Register operand (`size` in bytes)
    Reg {
        name: String,
        #[serde(default = "default_operand_size")]
        size: u8,
    },
    /// Immediate value
    Imm { value: i64 },
    /// Memory reference `[base + index * scale + disp]`
    Mem {
        #[serde(default)]
        base: Option<String>,
        #[serde(default)]
        index: Option<String>,
        #[serde(default = "default_scale")]
        scale: u8,
        #[serde(default)]
        disp: i64,
        #[serde(default = "default_operand_size")]
        size: u8,
    },
    /// Direct code address (branch or call target)
    Addr { target: u64 },
}

fn default_operand_size() -> u8 {
    4u8
}

fn default_scale() -> u8 {
    1u8
}

impl Operand {
    pub fn reg(name: &str) -> Self {
        Self::Reg {
            name: name.to_string(),
            size: default_operand_size(),
        }
    }

    pub fn imm(value: i64) -> Self {
        Self::Imm { value }
    }

    /// `[base + disp]` with a 4-byte access.
    pub fn mem(base: &str, disp: i64) -> Self {
        Self::Mem {
            base: Some(base.to_string()),
            index: None,
            scale: default_scale(),
            disp,
            size: default_operand_size(),
        }
    }

    pub fn addr(target: u64) -> Self {
        Self::Addr { target }
    }

    /// Access width in bytes, if the operand has one.
    #[inline]
    pub fn size(&self) -> Option<u8> {
        match self {
            Self::Reg { size, .. } | Self::Mem { size, .. } => Some(*size),
            Self::Imm { .. } | Self::Addr { .. } => None,
        }
    }
}

impl DecodedRecord {
    /// Convenience constructor for a record with no successors.
    pub fn new(function_entry: u64, address: u64, opcode: &str, operands: Vec<Operand>) -> Self {
        Self {
            function_entry,
            address,
            opcode: opcode.to_string(),
            operands,
            successors: Vec::new(),
            is_call: false,
            is_return: false,
        }
    }

    pub fn with_successors(mut self, successors: &[u64]) -> Self {
        self.successors = successors.to_vec();
        self
    }

    pub fn call(mut self) -> Self {
        self.is_call = true;
        self
    }

    pub fn ret(mut self) -> Self {
        self.is_return = true;
        self
    }
}

/// Read a JSON array of records from disk.
///
/// # Errors
/// Returns an error if the file cannot be read or is not a JSON array of records.
pub fn load_records(path: &Path) -> Result<Vec<DecodedRecord>> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read decoded records: {}", path.display()))?;
    let records: Vec<DecodedRecord> = serde_json::from_str(&data)
        .with_context(|| format!("Failed to parse decoded records: {}", path.display()))?;
    log::debug!("Loaded {} decoded records from {}", records.len(), path.display());
    Ok(records)
}
