// Integration tests for CFG construction
mod utils;

use rdecomp_core::decompiler::cfg::CfgBuilder;
use rdecomp_core::decompiler::config::Abi;
use rdecomp_core::decompiler::decoder::{DecodedRecord, Operand};
use rdecomp_core::decompiler::error::{DecompileError, WarningKind};
use rdecomp_core::decompiler::ir::{BlockId, EdgeKind, EdgeTarget, Opcode};
use rdecomp_core::decompiler::validator::CfgVerifier;
use utils::{counting_loop, two_returns, FunctionRecords};

#[test]
fn test_loop_blocks_and_edges() {
    let module = CfgBuilder::build(&counting_loop(0x1000), &Abi::default()).expect("valid input");
    assert_eq!(module.functions.len(), 1);
    let func = &module.functions[0];
    assert_eq!(func.name, "sub_1000");
    assert_eq!(func.blocks.len(), 4, "entry, header, body, exit");

    let starts: Vec<u64> = func.blocks.iter().map(|b| b.start_address).collect();
    assert_eq!(starts, vec![0x1000, 0x1005, 0x100a, 0x1010]);

    let header = func.block(BlockId(1));
    assert_eq!(header.edge(EdgeKind::True).map(|e| e.target), Some(EdgeTarget::Block(BlockId(3))));
    assert_eq!(header.edge(EdgeKind::False).map(|e| e.target), Some(EdgeTarget::Block(BlockId(2))));
    assert_eq!(header.preds.as_slice(), &[BlockId(0), BlockId(2)]);

    // The entry block falls through into the header
    let entry = func.block(BlockId(0));
    assert_eq!(entry.edges[0].kind, EdgeKind::Fallthrough);
    let term = func.terminator(BlockId(0)).expect("synthesized jump");
    assert_eq!(func.inst(term).op, Opcode::Jump);

    assert!(func.warnings.is_empty());
    CfgVerifier::verify_module(&module).expect("built module verifies");
}

#[test]
fn test_conditional_edges_follow_successor_order() {
    let module = CfgBuilder::build(&two_returns(0x2000), &Abi::default()).expect("valid input");
    let func = &module.functions[0];
    assert_eq!(func.blocks.len(), 3);
    let entry = func.block(func.entry);
    assert_eq!(entry.edges.len(), 2);
    assert_eq!(entry.edges[0].kind, EdgeKind::True);
    assert_eq!(entry.edges[0].target, EdgeTarget::Block(BlockId(2)), "taken edge goes to 0x200a");
    assert_eq!(entry.edges[1].target, EdgeTarget::Block(BlockId(1)));
    for b in [BlockId(1), BlockId(2)] {
        assert!(func.block(b).edges.is_empty(), "return blocks have no successors");
    }
}

#[test]
fn test_functions_keep_first_seen_order() {
    let mut records = FunctionRecords::new(0x3000)
        .call(0x3000, 0x1000)
        .ret(0x3005)
        .build();
    records.extend(two_returns(0x1000));
    let module = CfgBuilder::build(&records, &Abi::default()).expect("valid input");
    let names: Vec<&str> = module.functions.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["sub_3000", "sub_1000"]);
    assert!(module.function_by_entry(0x1000).is_some());
    // Calls never split a block
    assert_eq!(module.functions[0].blocks.len(), 1);
}

#[test]
fn test_unresolved_jump_is_a_warning() {
    let records = FunctionRecords::new(0x4000)
        .op(0x4000, "mov", vec![Operand::reg("eax"), Operand::imm(7)])
        .jump(0x4005, "jmp", &[0x9999])
        .build();
    let module = CfgBuilder::build(&records, &Abi::default()).expect("unresolved targets are not fatal");
    let func = &module.functions[0];
    assert_eq!(func.warnings.len(), 1);
    let warning = &func.warnings[0];
    assert_eq!(warning.kind, WarningKind::UnresolvedControlTransfer);
    assert_eq!(warning.address, Some(0x9999));
    assert_eq!(warning.block, Some(BlockId(0)));
    assert_eq!(func.blocks[0].edges[0].target, EdgeTarget::Unknown(Some(0x9999)));
}

#[test]
fn test_jump_table_becomes_switch_edges() {
    let records = FunctionRecords::new(0x5000)
        .jump(0x5000, "jmp", &[0x5010, 0x5020, 0x5010])
        .ret(0x5010)
        .ret(0x5020)
        .build();
    let module = CfgBuilder::build(&records, &Abi::default()).expect("valid input");
    let func = &module.functions[0];
    let kinds: Vec<EdgeKind> = func.blocks[0].edges.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![EdgeKind::SwitchCase(0), EdgeKind::SwitchCase(1), EdgeKind::SwitchCase(2)]
    );
    let term = func.terminator(BlockId(0)).expect("switch terminator");
    assert!(matches!(func.inst(term).op, Opcode::Switch { .. }));
}

#[test]
fn test_unreachable_block_is_marked() {
    let records = FunctionRecords::new(0x6000)
        .ret(0x6000)
        .op(0x6001, "nop", vec![])
        .ret(0x6002)
        .build();
    let module = CfgBuilder::build(&records, &Abi::default()).expect("valid input");
    let func = &module.functions[0];
    assert_eq!(func.blocks.len(), 2);
    assert!(!func.blocks[0].unreachable);
    assert!(func.blocks[1].unreachable);
}

#[test]
fn test_duplicate_address_is_malformed() {
    let records = vec![
        DecodedRecord::new(0x7000, 0x7000, "nop", vec![]),
        DecodedRecord::new(0x7000, 0x7000, "ret", vec![]).ret(),
    ];
    match CfgBuilder::build(&records, &Abi::default()) {
        Err(DecompileError::MalformedInput { .. }) => {}
        other => panic!("expected MalformedInput, got {:?}", other.map(|m| m.functions.len())),
    }
}

#[test]
fn test_missing_entry_record_is_malformed() {
    let records = vec![DecodedRecord::new(0x8000, 0x8004, "ret", vec![]).ret()];
    let err = CfgBuilder::build(&records, &Abi::default()).expect_err("entry has no record");
    assert!(matches!(err, DecompileError::MalformedInput { .. }));
    let context = err.context().expect("malformed input carries context");
    assert_eq!(context.address, Some(0x8000));
}

#[test]
fn test_jump_into_another_function_is_malformed() {
    let mut records = FunctionRecords::new(0x9000)
        .jump(0x9000, "jmp", &[0xa000])
        .build();
    records.extend(FunctionRecords::new(0xa000).ret(0xa000).build());
    let err = CfgBuilder::build(&records, &Abi::default()).expect_err("cross-function jump");
    assert!(matches!(err, DecompileError::MalformedInput { .. }));
}
