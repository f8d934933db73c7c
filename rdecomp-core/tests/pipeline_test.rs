// Integration tests for the pass pipeline
mod utils;

use rdecomp_core::decompiler::config::{
    DecompilerConfig, OptionValue, PassOptions, PassSpec, PipelineConfig, DEFAULT_PASSES,
};
use rdecomp_core::decompiler::error::DecompileError;
use rdecomp_core::decompiler::ir::{Opcode, StorageClass};
use rdecomp_core::decompiler::passes::PassRegistry;
use rdecomp_core::decompiler::pipeline::{
    Decompiler, PassObserver, PassPipeline, PassReport, PipelineStats,
};
use rdecomp_core::decompiler::structurer::Region;
use rdecomp_core::decompiler::validator::CfgVerifier;
use std::sync::Mutex;
use utils::{decompile, decompile_passes, identity_function, two_returns};

#[test]
fn test_frame_idiom_end_to_end() {
    let records = identity_function(0x401000);
    let result = decompile_passes(&records, &["stack-recovery", "merge-returns", "structure"]);

    assert_eq!(result.module.functions.len(), 1);
    let func = &result.module.functions[0];
    assert_eq!(func.blocks.len(), 1);
    assert!(
        matches!(&func.region, Some(Region::Sequence(items)) if items.len() == 1),
        "single block structures as a one-item sequence: {:?}",
        func.region
    );
    let params = func.params();
    assert_eq!(params.len(), 1);
    assert_eq!(params[0].name, "arg1");
    assert!(matches!(params[0].storage, StorageClass::Param { index: 1, offset: 4 }));
    assert!(result.text.contains("sub_401000("), "{}", result.text);
    assert!(result.text.contains("return arg1;"), "{}", result.text);
}

#[test]
fn test_default_pipeline_reports_every_pass() {
    let result = decompile(&identity_function(0x401000));
    let names: Vec<&str> = result.reports.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, DEFAULT_PASSES.to_vec());
    assert!(result.reports.iter().any(|r| r.name == "stack-recovery" && r.changed));
    assert!(result.text.contains("return arg1;"), "{}", result.text);
    CfgVerifier::verify_module(&result.module).expect("final module verifies");
}

#[test]
fn test_default_pipeline_reaches_fixed_point() {
    let records = two_returns(0x1000);
    let config = DecompilerConfig::default();
    let registry = PassRegistry::with_builtin_passes();
    let decompiler = Decompiler::new(config.clone()).expect("valid configuration");
    let module = decompiler.disassemble(&records).expect("valid input");

    let pipeline = PassPipeline::new(&registry, &config.pipeline).expect("pipeline");
    let first = pipeline.run(module, None).expect("first run");
    let second = pipeline.run(first.module.clone(), None).expect("second run");
    for report in second.reports.iter() {
        assert!(!report.changed, "{} changed the module on the second run", report.name);
    }
    assert_eq!(first.module.functions[0].region, second.module.functions[0].region);
}

#[test]
fn test_each_default_pass_is_idempotent() {
    let fixtures: Vec<(&str, Vec<rdecomp_core::decompiler::decoder::DecodedRecord>)> = vec![
        ("identity", identity_function(0x401000)),
        ("two returns", two_returns(0x1000)),
        ("counting loop", utils::counting_loop(0x2000)),
        ("stray return", utils::call_result_with_stray_return(0x3000)),
        ("copy chain", utils::copy_chain(0x4000)),
    ];
    for &name in DEFAULT_PASSES.iter() {
        for (fixture, records) in fixtures.iter() {
            let result = decompile_passes(records, &[name, name]);
            assert_eq!(result.reports.len(), 2);
            assert!(
                !result.reports[1].changed,
                "{} changed `{}` on its second application:\n{}",
                name,
                fixture,
                result.text
            );
        }
    }
}

#[test]
fn test_stray_return_is_voided_with_the_fold() {
    let result = decompile_passes(&utils::call_result_with_stray_return(0x3000), &["merge-returns"]);
    let func = &result.module.functions[0];
    let returns: Vec<&Opcode> = func
        .placed_insts()
        .map(|(_, i)| &func.inst(i).op)
        .filter(|op| matches!(op, Opcode::Return { .. }))
        .collect();
    assert_eq!(returns.len(), 2);
    assert!(matches!(returns[0], Opcode::Return { value: Some(_) }));
    assert_eq!(returns[1], &Opcode::Return { value: None });
    assert!(!result.text.contains("return eax;"), "{}", result.text);
}

#[test]
fn test_merged_returns_render_through_retval() {
    let result = decompile(&two_returns(0x1000));
    let func = &result.module.functions[0];
    let returns = func
        .placed_insts()
        .filter(|&(_, i)| matches!(func.inst(i).op, Opcode::Return { .. }))
        .count();
    assert_eq!(returns, 1, "return sites merge into one exit");
    utils::assert_covers_blocks(
        func.region.as_ref().expect("structured"),
        func.blocks.len(),
        "merged returns",
    );
    assert!(result.text.contains("retval = 1;"), "{}", result.text);
    assert!(result.text.contains("retval = 2;"), "{}", result.text);
    assert!(result.text.contains("return retval;"), "{}", result.text);
    assert_eq!(result.stats.gotos, 0);
}

#[test]
fn test_unknown_pass_fails_before_cfg_building() {
    // Malformed records would fail CFG building; the pass name is checked first
    let records = vec![rdecomp_core::decompiler::decoder::DecodedRecord::new(0x10, 0x14, "ret", vec![])];
    let config = DecompilerConfig {
        pipeline: PipelineConfig::from_names(&["stack-recovery", "unroll-loops"]),
        ..DecompilerConfig::default()
    };
    let decompiler = Decompiler::new(config).expect("unknown names pass validation");
    let failure = decompiler.decompile(&records, None).expect_err("unknown pass");
    assert!(failure.last_good.is_none());
    assert!(failure.reports.is_empty());
    match failure.error {
        DecompileError::UnknownPass { name, suggestion } => {
            assert_eq!(name, "unroll-loops");
            assert!(suggestion.contains("dead-code"), "{}", suggestion);
        }
        other => panic!("expected UnknownPass, got {}", other),
    }
}

#[test]
fn test_malformed_input_fails_before_passes() {
    let records = vec![rdecomp_core::decompiler::decoder::DecodedRecord::new(0x10, 0x14, "ret", vec![])];
    let decompiler = Decompiler::new(DecompilerConfig::default()).expect("valid configuration");
    let failure = decompiler.decompile(&records, None).expect_err("entry has no record");
    assert!(matches!(failure.error, DecompileError::MalformedInput { .. }));
    assert!(failure.last_good.is_none());
}

#[test]
fn test_mistyped_option_is_rejected_at_construction() {
    let options = PassOptions::new().with("widen-small-ints", OptionValue::Int(1));
    let config = DecompilerConfig {
        pipeline: PipelineConfig {
            passes: vec![PassSpec::with_options("type-inference", options)],
        },
        ..DecompilerConfig::default()
    };
    assert!(Decompiler::new(config).is_err());
    let zero_threads = DecompilerConfig {
        threads: 0,
        ..DecompilerConfig::default()
    };
    assert!(Decompiler::new(zero_threads).is_err());
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl PassObserver for Recorder {
    fn pass_started(&self, name: &str, index: usize, total: usize) {
        if let Ok(mut events) = self.events.lock() {
            events.push(format!("start {}/{} {}", index, total, name));
        }
    }

    fn pass_finished(&self, report: &PassReport) {
        if let Ok(mut events) = self.events.lock() {
            events.push(format!("finish {}", report.name));
        }
    }
}

#[test]
fn test_observer_sees_passes_in_order() {
    let records = identity_function(0x401000);
    let recorder = Recorder::default();
    let config = DecompilerConfig {
        pipeline: PipelineConfig::from_names(&["stack-recovery", "structure"]),
        ..DecompilerConfig::default()
    };
    let decompiler = Decompiler::new(config).expect("valid configuration");
    decompiler
        .decompile(&records, Some(&recorder))
        .expect("decompiles");
    let events = recorder.events.lock().expect("observer lock").clone();
    assert_eq!(
        events,
        vec![
            "start 0/2 stack-recovery",
            "finish stack-recovery",
            "start 1/2 structure",
            "finish structure",
        ]
    );
}

#[test]
fn test_threaded_run_matches_single_threaded() {
    let mut records = identity_function(0x401000);
    records.extend(two_returns(0x402000));
    records.extend(utils::counting_loop(0x403000));

    let single = decompile(&records);
    let threaded = utils::decompile_with(
        &records,
        DecompilerConfig {
            threads: 3,
            ..DecompilerConfig::default()
        },
    );
    assert_eq!(single.text, threaded.text);
    let changed = |reports: &[PassReport]| {
        reports
            .iter()
            .map(|r| (r.changed, r.functions_changed))
            .collect::<Vec<_>>()
    };
    assert_eq!(changed(&single.reports), changed(&threaded.reports));
}

#[test]
fn test_stats_and_json_output() {
    let mut records = identity_function(0x401000);
    records.extend(two_returns(0x402000));
    let result = decompile(&records);

    let stats = PipelineStats::collect(&result.module);
    assert_eq!(stats.functions, 2);
    assert_eq!(stats.blocks, result.module.block_count());

    let json = result.to_json().expect("serializes");
    let value: serde_json::Value = serde_json::from_str(&json).expect("valid JSON");
    assert_eq!(value["stats"]["functions"], 2);
    assert_eq!(value["passes"].as_array().map(|p| p.len()), Some(DEFAULT_PASSES.len()));
    assert_eq!(value["module"]["functions"][0]["name"], "sub_401000");
}
