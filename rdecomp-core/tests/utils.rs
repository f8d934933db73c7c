//! Test Utilities
//!
//! This module provides helpers for building decoded record streams, running
//! pipelines over them, and assertion helpers for region trees and pseudocode.

#![allow(dead_code)]

use rdecomp_core::decompiler::config::{DecompilerConfig, PipelineConfig};
use rdecomp_core::decompiler::decoder::{DecodedRecord, Operand};
use rdecomp_core::decompiler::pipeline::{Decompilation, Decompiler};
use rdecomp_core::decompiler::structurer::Region;

/// Builds the records of one function in address order.
pub struct FunctionRecords {
    entry: u64,
    records: Vec<DecodedRecord>,
}

impl FunctionRecords {
    pub fn new(entry: u64) -> Self {
        Self {
            entry,
            records: Vec::new(),
        }
    }

    /// Plain instruction at `address`.
    pub fn op(mut self, address: u64, opcode: &str, operands: Vec<Operand>) -> Self {
        self.records
            .push(DecodedRecord::new(self.entry, address, opcode, operands));
        self
    }

    /// Jump or conditional jump; conditional successors are `[taken, not-taken]`.
    pub fn jump(mut self, address: u64, opcode: &str, successors: &[u64]) -> Self {
        let operands = successors
            .first()
            .map(|&t| vec![Operand::addr(t)])
            .unwrap_or_default();
        self.records.push(
            DecodedRecord::new(self.entry, address, opcode, operands).with_successors(successors),
        );
        self
    }

    pub fn call(mut self, address: u64, target: u64) -> Self {
        self.records.push(
            DecodedRecord::new(self.entry, address, "call", vec![Operand::addr(target)])
                .with_successors(&[target])
                .call(),
        );
        self
    }

    pub fn ret(mut self, address: u64) -> Self {
        self.records
            .push(DecodedRecord::new(self.entry, address, "ret", vec![]).ret());
        self
    }

    pub fn build(self) -> Vec<DecodedRecord> {
        self.records
    }
}

/// `push ebp; mov ebp, esp; mov eax, [ebp+8]; ret`
pub fn identity_function(entry: u64) -> Vec<DecodedRecord> {
    FunctionRecords::new(entry)
        .op(entry, "push", vec![Operand::reg("ebp")])
        .op(entry + 1, "mov", vec![Operand::reg("ebp"), Operand::reg("esp")])
        .op(entry + 3, "mov", vec![Operand::reg("eax"), Operand::mem("ebp", 8)])
        .ret(entry + 6)
        .build()
}

/// Counts `eax` from 0 up to 10 in a header-tested loop.
pub fn counting_loop(entry: u64) -> Vec<DecodedRecord> {
    FunctionRecords::new(entry)
        .op(entry, "mov", vec![Operand::reg("eax"), Operand::imm(0)])
        .op(entry + 5, "cmp", vec![Operand::reg("eax"), Operand::imm(10)])
        .jump(entry + 8, "jge", &[entry + 0x10, entry + 0xa])
        .op(entry + 0xa, "inc", vec![Operand::reg("eax")])
        .jump(entry + 0xb, "jmp", &[entry + 5])
        .ret(entry + 0x10)
        .build()
}

/// Returns 1 when `ecx` is zero and 2 otherwise, through two return sites.
pub fn two_returns(entry: u64) -> Vec<DecodedRecord> {
    FunctionRecords::new(entry)
        .op(entry, "test", vec![Operand::reg("ecx"), Operand::reg("ecx")])
        .jump(entry + 2, "jne", &[entry + 0xa, entry + 4])
        .op(entry + 4, "mov", vec![Operand::reg("eax"), Operand::imm(1)])
        .ret(entry + 9)
        .op(entry + 0xa, "mov", vec![Operand::reg("eax"), Operand::imm(2)])
        .ret(entry + 0xf)
        .build()
}

/// `call 0x5000; inc ecx; ret` followed by an unreachable `ret`.
pub fn call_result_with_stray_return(entry: u64) -> Vec<DecodedRecord> {
    FunctionRecords::new(entry)
        .call(entry, 0x5000)
        .op(entry + 5, "inc", vec![Operand::reg("ecx")])
        .ret(entry + 6)
        .ret(entry + 7)
        .build()
}

/// `mov esi, eax; mov ebp, esi; add ebp, eax; mov eax, ebp; ret`
pub fn copy_chain(entry: u64) -> Vec<DecodedRecord> {
    FunctionRecords::new(entry)
        .op(entry, "mov", vec![Operand::reg("esi"), Operand::reg("eax")])
        .op(entry + 2, "mov", vec![Operand::reg("ebp"), Operand::reg("esi")])
        .op(entry + 4, "add", vec![Operand::reg("ebp"), Operand::reg("eax")])
        .op(entry + 6, "mov", vec![Operand::reg("eax"), Operand::reg("ebp")])
        .ret(entry + 8)
        .build()
}

/// Decompile with the default configuration.
pub fn decompile(records: &[DecodedRecord]) -> Decompilation {
    decompile_with(records, DecompilerConfig::default())
}

pub fn decompile_passes(records: &[DecodedRecord], passes: &[&str]) -> Decompilation {
    let config = DecompilerConfig {
        pipeline: PipelineConfig::from_names(passes),
        ..DecompilerConfig::default()
    };
    decompile_with(records, config)
}

pub fn decompile_with(records: &[DecodedRecord], config: DecompilerConfig) -> Decompilation {
    let decompiler = Decompiler::new(config).expect("valid configuration");
    match decompiler.decompile(records, None) {
        Ok(result) => result,
        Err(failure) => panic!("decompilation failed: {}", failure),
    }
}

/// Region kinds in document order.
pub fn region_kinds(region: &Region) -> Vec<&'static str> {
    let mut kinds = Vec::new();
    region.walk(&mut |r| kinds.push(r.kind_name()));
    kinds
}

/// Assert that a region tree covers every block of a function exactly once.
pub fn assert_covers_blocks(region: &Region, block_count: usize, message: &str) {
    let mut leaves: Vec<usize> = region.leaves().iter().map(|b| b.index()).collect();
    leaves.sort_unstable();
    let expected: Vec<usize> = (0..block_count).collect();
    assert_eq!(
        leaves, expected,
        "{}: every block must appear as exactly one leaf",
        message
    );
}

/// Assert that `text` contains each of `needles`, in order.
pub fn assert_contains_in_order(text: &str, needles: &[&str], message: &str) {
    let mut from = 0usize;
    for needle in needles {
        match text[from..].find(needle) {
            Some(pos) => from += pos + needle.len(),
            None => panic!(
                "{}: `{}` not found after offset {} in:\n{}",
                message, needle, from, text
            ),
        }
    }
}
