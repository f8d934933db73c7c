// CLI command handlers
use anyhow::{Context, Result};
use rdecomp_core::decompiler::config::DecompilerConfig;
use rdecomp_core::decompiler::decoder::load_records;
use rdecomp_core::decompiler::ir::EdgeTarget;
use rdecomp_core::decompiler::passes::{PassRegistry, PassScope};
use rdecomp_core::decompiler::pipeline::{Decompiler, PassObserver};
use std::fs;
use std::path::Path;

/// Build the CFGs only and print a per-function summary.
pub fn disasm(records_path: &Path) -> Result<()> {
    let records = load_records(records_path)?;
    let decompiler = Decompiler::new(DecompilerConfig::default())?;
    let module = decompiler
        .disassemble(&records)
        .with_context(|| format!("Failed to build CFGs from {}", records_path.display()))?;

    println!("Functions: {}", module.functions.len());
    for func in module.functions.iter() {
        println!(
            "\n{} @ 0x{:08X}: {} blocks, {} instructions",
            func.name,
            func.entry_address,
            func.blocks.len(),
            func.live_instruction_count()
        );
        for block in func.blocks.iter() {
            let successors: Vec<String> = block
                .edges
                .iter()
                .map(|edge| match edge.target {
                    EdgeTarget::Block(b) => b.to_string(),
                    EdgeTarget::Unknown(Some(addr)) => format!("?0x{:08X}", addr),
                    EdgeTarget::Unknown(None) => "?".to_string(),
                })
                .collect();
            let successors = if successors.is_empty() {
                "exit".to_string()
            } else {
                successors.join(", ")
            };
            println!(
                "  {} 0x{:08X}..0x{:08X}{} -> {}",
                block.id,
                block.start_address,
                block.end_address,
                if block.unreachable { " (unreachable)" } else { "" },
                successors
            );
        }
        for warning in func.warnings.iter() {
            println!("  warning: {}", warning.message);
        }
    }
    Ok(())
}

/// Run the full pipeline and write pseudocode (stdout unless `output` is given).
pub fn decompile(
    records_path: &Path,
    config_path: Option<&Path>,
    threads: Option<usize>,
    json_path: Option<&Path>,
    output_path: Option<&Path>,
    observer: Option<&dyn PassObserver>,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => DecompilerConfig::load(path)?,
        None => DecompilerConfig::default(),
    };
    if let Some(threads) = threads {
        config.threads = threads;
    }
    let decompiler = Decompiler::new(config).context("Invalid decompiler configuration")?;

    let records = load_records(records_path)?;
    let result = decompiler
        .decompile(&records, observer)
        .with_context(|| format!("Failed to decompile {}", records_path.display()))?;

    match output_path {
        Some(path) => fs::write(path, &result.text)
            .with_context(|| format!("Failed to write pseudocode: {}", path.display()))?,
        None => print!("{}", result.text),
    }
    if let Some(path) = json_path {
        let json = result.to_json().context("Failed to serialize decompilation")?;
        fs::write(path, json).with_context(|| format!("Failed to write JSON output: {}", path.display()))?;
    }

    eprintln!(
        "Decompiled {} functions: {} blocks, {} instructions, {} warnings, {} gotos",
        result.stats.functions,
        result.stats.blocks,
        result.stats.instructions,
        result.stats.warnings,
        result.stats.gotos
    );
    Ok(())
}

/// Print every registered pass with its options.
pub fn list_passes() -> Result<()> {
    let registry = PassRegistry::with_builtin_passes();
    for descriptor in registry.descriptors() {
        let scope = match descriptor.scope {
            PassScope::Module => "module",
            PassScope::Function => "function",
        };
        println!("{:<20} {:<9} {}", descriptor.id, scope, descriptor.description);
        for option in descriptor.options.iter() {
            println!("    {} ({}): {}", option.name, option.kind, option.description);
        }
    }
    Ok(())
}
