//! Control Flow Graph Construction
//!
//! Turns the decoded-record stream into a [`Module`] of IR functions.
//!
//! # CFG Construction Algorithm
//! 1. **Group records**: by function entry, in first-appearance order; every address
//!    belongs to exactly one function
//! 2. **Identify block boundaries**: the entry, branch targets inside the function, call
//!    targets inside the function, and records that follow a branch or return
//! 3. **Lift**: each block's records become IR instructions; blocks that run into the
//!    next block get a synthesized `Jump`
//! 4. **Identify edges**: from the terminating record's successor list. Targets that do
//!    not resolve to a block become unknown-target edges and warnings
//! 5. **Verify**: predecessors, reachability flags and the structural verifier
//!
//! This is the single place CFGs are built; both the disassemble-only path and the full
//! pipeline go through [`CfgBuilder::build`].

use crate::decompiler::config::Abi;
use crate::decompiler::decoder::DecodedRecord;
use crate::decompiler::error::{DecompileError, ErrorContext, Warning};
use crate::decompiler::ir::builder::{IRBuilder, Transfer};
use crate::decompiler::ir::{BlockId, Edge, EdgeKind, EdgeTarget, FuncId, Function, Module, Opcode};
use crate::decompiler::validator::CfgVerifier;
use bitvec::prelude::*;
use smallvec::SmallVec;
use std::collections::HashMap;

/// Builds IR functions from decoded records.
pub struct CfgBuilder;

impl CfgBuilder {
    /// Build a module from an ordered record stream.
    ///
    /// # Arguments
    /// * `records` - Decoded records, grouped by function entry
    /// * `abi` - Register conventions used while lifting
    ///
    /// # Returns
    /// `Result<Module, DecompileError>` - One function per entry address, in input order
    ///
    /// # Errors
    /// `MalformedInput` when two records claim the same address, a function's records
    /// are not in increasing address order, an entry address has no record, or a
    /// non-call record names a successor owned by another function.
    ///
    /// # Examples
    /// ```rust,ignore
    /// let records = load_records(Path::new("main.json"))?;
    /// let module = CfgBuilder::build(&records, &Abi::default())?;
    /// ```
    pub fn build(records: &[DecodedRecord], abi: &Abi) -> Result<Module, DecompileError> {
        let mut entries: Vec<u64> = Vec::new();
        let mut groups: HashMap<u64, Vec<&DecodedRecord>> = HashMap::new();
        let mut owner: HashMap<u64, u64> = HashMap::with_capacity(records.len());

        for record in records.iter() {
            if let Some(&other) = owner.get(&record.address) {
                let message = if other == record.function_entry {
                    format!("address 0x{:08X} is decoded twice", record.address)
                } else {
                    format!(
                        "address 0x{:08X} is claimed by functions at 0x{:08X} and 0x{:08X}",
                        record.address, other, record.function_entry
                    )
                };
                return Err(DecompileError::malformed(
                    message,
                    ErrorContext::new().with_address(record.address),
                ));
            }
            owner.insert(record.address, record.function_entry);
            groups
                .entry(record.function_entry)
                .or_insert_with(|| {
                    entries.push(record.function_entry);
                    Vec::new()
                })
                .push(record);
        }

        let mut module = Module::new(abi.clone());
        for (index, &entry) in entries.iter().enumerate() {
            let group = groups.get(&entry).map(Vec::as_slice).unwrap_or(&[]);
            let func = Self::build_function(FuncId::from_index(index), entry, group, &owner, abi)?;
            module.functions.push(func);
        }

        log::debug!(
            "Built {} functions ({} blocks) from {} records",
            module.functions.len(),
            module.block_count(),
            records.len()
        );
        Ok(module)
    }

    fn build_function(
        id: FuncId,
        entry: u64,
        records: &[&DecodedRecord],
        owner: &HashMap<u64, u64>,
        abi: &Abi,
    ) -> Result<Function, DecompileError> {
        let name = format!("sub_{:x}", entry);
        let context = || ErrorContext::new().with_function(name.clone());

        if owner.get(&entry) != Some(&entry) {
            return Err(DecompileError::malformed(
                "function entry address has no decoded record",
                context().with_address(entry),
            ));
        }
        for pair in records.windows(2) {
            if pair[1].address <= pair[0].address {
                return Err(DecompileError::malformed(
                    format!(
                        "records are not in increasing address order (0x{:08X} after 0x{:08X})",
                        pair[1].address, pair[0].address
                    ),
                    context().with_address(pair[1].address),
                ));
            }
        }
        for record in records.iter().filter(|r| !r.is_call) {
            for &succ in record.successors.iter() {
                if let Some(&other) = owner.get(&succ) {
                    if other != entry {
                        return Err(DecompileError::malformed(
                            format!(
                                "successor 0x{:08X} belongs to the function at 0x{:08X} and is not reached through a call",
                                succ, other
                            ),
                            context().with_address(record.address),
                        ));
                    }
                }
            }
        }

        let index_of: HashMap<u64, usize> = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.address, i))
            .collect();
        let next_address = |i: usize| records.get(i + 1).map(|r| r.address);

        // First pass: block boundaries
        let mut starts: BitVec<u32> = bitvec![u32, Lsb0; 0; records.len()];
        starts.set(0, true);
        if let Some(&i) = index_of.get(&entry) {
            starts.set(i, true);
        }
        for (i, record) in records.iter().enumerate() {
            let transfer = Transfer::of(record, next_address(i));
            if transfer.ends_block() && i + 1 < records.len() {
                starts.set(i + 1, true);
            }
            if matches!(transfer, Transfer::Jump | Transfer::Conditional) || record.is_call {
                for succ in record.successors.iter() {
                    if let Some(&target) = index_of.get(succ) {
                        starts.set(target, true);
                    }
                }
            }
        }

        // Second pass: blocks and lifting
        let mut func = Function::new(id, name.clone(), entry);
        let mut block_at: HashMap<u64, BlockId> = HashMap::new();
        let mut spans: Vec<(usize, usize)> = Vec::new();
        for i in starts.iter_ones() {
            if let Some(last) = spans.last_mut() {
                last.1 = i;
            }
            spans.push((i, records.len()));
        }
        for &(first, end) in spans.iter() {
            let block = func.add_block(records[first].address, records[end - 1].address);
            block_at.insert(records[first].address, block);
        }
        if let Some(&block) = block_at.get(&entry) {
            func.entry = block;
        }

        let mut tails: Vec<Transfer> = Vec::with_capacity(spans.len());
        {
            let mut builder = IRBuilder::new(&mut func, abi);
            for (b, &(first, end)) in spans.iter().enumerate() {
                let block = BlockId::from_index(b);
                builder.begin_block();
                let mut transfer = Transfer::Fallthrough;
                for i in first..end {
                    transfer = builder.lift(block, records[i], next_address(i));
                }
                tails.push(transfer);
            }
        }

        // Third pass: edges
        for (b, &(_, end)) in spans.iter().enumerate() {
            let block = BlockId::from_index(b);
            let last = records[end - 1];
            let next = records.get(end).and_then(|r| block_at.get(&r.address).copied());
            let mut edges: SmallVec<[Edge; 2]> = SmallVec::new();
            let mut unresolved: Vec<Option<u64>> = Vec::new();
            let resolve = |addr: u64, unresolved: &mut Vec<Option<u64>>| match block_at.get(&addr) {
                Some(&target) => EdgeTarget::Block(target),
                None => {
                    unresolved.push(Some(addr));
                    EdgeTarget::Unknown(Some(addr))
                }
            };

            match tails[b] {
                Transfer::Return => {}
                Transfer::Fallthrough => {
                    let address = last.address;
                    func.append_inst(block, Opcode::Jump, address);
                    let target = match next {
                        Some(target) => EdgeTarget::Block(target),
                        None => {
                            unresolved.push(None);
                            EdgeTarget::Unknown(None)
                        }
                    };
                    edges.push(Edge::new(target, EdgeKind::Fallthrough));
                }
                Transfer::Conditional => {
                    let taken = match last.successors.first() {
                        Some(&addr) => resolve(addr, &mut unresolved),
                        None => {
                            unresolved.push(None);
                            EdgeTarget::Unknown(None)
                        }
                    };
                    let not_taken = match last.successors.get(1) {
                        Some(&addr) => resolve(addr, &mut unresolved),
                        None => match next {
                            Some(target) => EdgeTarget::Block(target),
                            None => {
                                unresolved.push(None);
                                EdgeTarget::Unknown(None)
                            }
                        },
                    };
                    edges.push(Edge::new(taken, EdgeKind::True));
                    edges.push(Edge::new(not_taken, EdgeKind::False));
                }
                Transfer::Jump => match last.successors.as_slice() {
                    [] => {
                        unresolved.push(None);
                        edges.push(Edge::new(EdgeTarget::Unknown(None), EdgeKind::Unconditional));
                    }
                    [target] => {
                        let target = resolve(*target, &mut unresolved);
                        edges.push(Edge::new(target, EdgeKind::Unconditional));
                    }
                    targets => {
                        for (case, &addr) in targets.iter().enumerate() {
                            let target = resolve(addr, &mut unresolved);
                            edges.push(Edge::new(target, EdgeKind::SwitchCase(case as u32)));
                        }
                    }
                },
            }

            func.block_mut(block).edges = edges;
            for address in unresolved {
                let warning = Warning::unresolved(&name, block, address);
                log::warn!("{}", warning);
                func.warnings.push(warning);
            }
        }

        func.rebuild_preds();
        let dead = func.mark_unreachable();
        if dead > 0 {
            log::debug!("{}: {} blocks unreachable from entry", name, dead);
        }
        CfgVerifier::verify_function(&func)?;
        Ok(func)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompiler::decoder::Operand;

    #[test]
    fn test_fallthrough_block_gets_synthesized_jump() {
        let records = vec![
            DecodedRecord::new(0x10, 0x10, "mov", vec![Operand::reg("eax"), Operand::imm(1)]),
            DecodedRecord::new(0x10, 0x12, "mov", vec![Operand::reg("ecx"), Operand::imm(2)]),
        ];
        let module = CfgBuilder::build(&records, &Abi::default()).expect("builds");
        let func = &module.functions[0];
        assert_eq!(func.blocks.len(), 1);
        assert_eq!(func.blocks[0].edges[0].target, EdgeTarget::Unknown(None));
        assert_eq!(func.warnings.len(), 1);
    }

    #[test]
    fn test_call_target_in_other_function_is_allowed() {
        let records = vec![
            DecodedRecord::new(0x10, 0x10, "call", vec![Operand::addr(0x20)])
                .with_successors(&[0x20])
                .call(),
            DecodedRecord::new(0x10, 0x15, "ret", vec![]).ret(),
            DecodedRecord::new(0x20, 0x20, "ret", vec![]).ret(),
        ];
        let module = CfgBuilder::build(&records, &Abi::default()).expect("call edges cross functions");
        assert_eq!(module.functions.len(), 2);
        assert_eq!(module.functions[0].blocks.len(), 1);
    }
}
